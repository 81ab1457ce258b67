use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::StreamEvent;

/// Slots per subscriber channel.
pub const SUBSCRIBER_CAPACITY: usize = 100;
const REMEMBERED_COMPLETIONS: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
}

/// Receiving end of [`StreamHub::subscribe`].
pub struct Subscription {
    pub id: u64,
    pub stream_id: String,
    receiver: mpsc::Receiver<StreamEvent>,
}

impl Subscription {
    /// A subscription that yields only `event` and then closes. Not
    /// registered with any hub.
    pub fn finished(stream_id: &str, event: StreamEvent) -> Self {
        let (tx, receiver) = mpsc::channel(1);
        let _ = tx.try_send(event);
        Subscription {
            id: 0,
            stream_id: stream_id.to_string(),
            receiver,
        }
    }

    /// `None` once the stream completed and every buffered event was read.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<StreamEvent> {
        self.receiver
    }
}

/// In-memory pub/sub keyed by execution or log-session id.
pub struct StreamHub {
    channels: DashMap<String, Vec<Subscriber>>,
    // Guards completion bookkeeping and subscribe so no subscriber can attach
    // between a stream completing and the completion being remembered.
    completed: Mutex<VecDeque<(String, StreamEvent)>>,
    remembered: usize,
    next_id: AtomicU64,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self::with_remembered(REMEMBERED_COMPLETIONS)
    }

    /// Hub that remembers the last `remembered` completions for late
    /// subscribers.
    pub fn with_remembered(remembered: usize) -> Self {
        Self {
            channels: DashMap::new(),
            completed: Mutex::new(VecDeque::new()),
            remembered,
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens a bounded channel for `stream_id`.
    ///
    /// Delivery is best-effort: when the subscriber falls [`SUBSCRIBER_CAPACITY`]
    /// events behind, further events are dropped for it alone. The `complete`
    /// event is never dropped and closes the channel. Subscribing to a stream
    /// that already completed yields its `complete` event and a closed channel.
    pub fn subscribe(&self, stream_id: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let completed = self.lock_completed();
        if let Some((_, event)) = completed.iter().find(|(sid, _)| sid == stream_id) {
            let _ = tx.try_send(event.clone());
        } else {
            self.channels
                .entry(stream_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }
        drop(completed);
        debug!(stream_id, subscriber = id, "Subscribed.");
        Subscription {
            id,
            stream_id: stream_id.to_string(),
            receiver,
        }
    }

    /// Removes the subscriber; its channel closes once the sender drops.
    pub fn unsubscribe(&self, stream_id: &str, subscriber_id: u64) {
        if let Some(mut subs) = self.channels.get_mut(stream_id) {
            subs.retain(|s| s.id != subscriber_id);
        }
        self.channels.remove_if(stream_id, |_, subs| subs.is_empty());
    }

    pub fn broadcast(&self, stream_id: &str, event: StreamEvent) {
        if event.is_complete() {
            self.complete(stream_id, event);
            return;
        }
        let Some(mut subs) = self.channels.get_mut(stream_id) else {
            return;
        };
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(stream_id, subscriber = sub.id, kind = event.kind.as_str(), "Subscriber slow; event dropped.");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn complete(&self, stream_id: &str, event: StreamEvent) {
        let mut completed = self.lock_completed();
        if completed.iter().any(|(sid, _)| sid == stream_id) {
            warn!(stream_id, "Stream already completed; ignoring second completion.");
            return;
        }
        completed.push_back((stream_id.to_string(), event.clone()));
        while completed.len() > self.remembered {
            completed.pop_front();
        }
        let subs = self.channels.remove(stream_id).map(|(_, subs)| subs);
        drop(completed);

        for sub in subs.into_iter().flatten() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(event)) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            let _ = sub.tx.send(event).await;
                        });
                    }
                    Err(_) => warn!(stream_id, subscriber = sub.id, "No runtime to deliver completion."),
                },
            }
        }
    }

    pub fn subscriber_count(&self, stream_id: &str) -> usize {
        self.channels.get(stream_id).map_or(0, |subs| subs.len())
    }

    pub fn is_completed(&self, stream_id: &str) -> bool {
        self.lock_completed().iter().any(|(sid, _)| sid == stream_id)
    }

    fn lock_completed(&self) -> std::sync::MutexGuard<'_, VecDeque<(String, StreamEvent)>> {
        self.completed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamEventKind;

    #[tokio::test]
    async fn delivers_in_order_then_closes_on_complete() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe("e1");
        hub.broadcast("e1", StreamEvent::output("h", "h", "one"));
        hub.broadcast("e1", StreamEvent::output("h", "h", "two"));
        hub.broadcast("e1", StreamEvent::complete("done"));
        assert_eq!(sub.recv().await.unwrap().data, "one");
        assert_eq!(sub.recv().await.unwrap().data, "two");
        assert_eq!(sub.recv().await.unwrap().kind, StreamEventKind::Complete);
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count("e1"), 0);
    }

    #[tokio::test]
    async fn finished_subscription_yields_complete_then_closes() {
        let hub = StreamHub::new();
        let mut sub = Subscription::finished("e1", StreamEvent::complete("failed"));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, StreamEventKind::Complete);
        assert_eq!(event.data, "failed");
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count("e1"), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_output_but_gets_complete() {
        let hub = StreamHub::new();
        let mut slow = hub.subscribe("e1");
        let mut fast = hub.subscribe("e1");
        let fast_reader = tokio::spawn(async move {
            let mut n = 0;
            while let Some(event) = fast.recv().await {
                if event.is_complete() {
                    return (n, true);
                }
                n += 1;
            }
            (n, false)
        });

        for i in 0..(SUBSCRIBER_CAPACITY + 50) {
            hub.broadcast("e1", StreamEvent::output("h", "h", i.to_string()));
            tokio::task::yield_now().await;
        }
        hub.broadcast("e1", StreamEvent::complete("done"));

        let mut got = Vec::new();
        while let Some(event) = slow.recv().await {
            got.push(event);
        }
        assert_eq!(got.len(), SUBSCRIBER_CAPACITY + 1);
        assert!(got.last().unwrap().is_complete());
        assert_eq!(got.iter().filter(|e| e.is_complete()).count(), 1);

        let (_, completed) = fast_reader.await.unwrap();
        assert!(completed);
    }

    #[tokio::test]
    async fn late_subscriber_sees_completion() {
        let hub = StreamHub::new();
        hub.broadcast("e1", StreamEvent::complete("done"));
        let mut late = hub.subscribe("e1");
        assert!(late.recv().await.unwrap().is_complete());
        assert!(late.recv().await.is_none());
        assert!(hub.is_completed("e1"));
    }

    #[tokio::test]
    async fn second_completion_is_ignored() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe("e1");
        hub.broadcast("e1", StreamEvent::complete("first"));
        hub.broadcast("e1", StreamEvent::complete("second"));
        assert_eq!(sub.recv().await.unwrap().data, "first");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let hub = StreamHub::new();
        let sub = hub.subscribe("e1");
        let _keep = hub.subscribe("e1");
        drop(sub);
        hub.broadcast("e1", StreamEvent::output("h", "h", "x"));
        assert_eq!(hub.subscriber_count("e1"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let hub = StreamHub::new();
        let mut sub = hub.subscribe("e1");
        hub.unsubscribe("e1", sub.id);
        assert!(sub.recv().await.is_none());
        assert_eq!(hub.subscriber_count("e1"), 0);
    }
}
