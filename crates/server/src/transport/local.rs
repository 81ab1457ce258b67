use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use super::{CommandOutput, ConnectTarget, Connector, OutputLine, OutputStream, Transport, TransportError};

/// Runs commands through `/bin/sh` on the control plane. Used when the
/// configured transport is `local` and by the test suite.
pub struct LocalTransport {
    shell: String,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            closed: AtomicBool::new(false),
        }
    }

    fn command(&self, command: &str) -> Result<Command, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).kill_on_drop(true);
        Ok(cmd)
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
        let mut cmd = self.command(command)?;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input).await?;
                pipe.shutdown().await?;
            }
        }
        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i32, TransportError> {
        let mut cmd = self.command(command)?;
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, _, status) = tokio::join!(
            forward_lines(stdout, OutputStream::Stdout, lines.clone()),
            forward_lines(stderr, OutputStream::Stderr, lines),
            child.wait(),
        );
        Ok(status?.code().unwrap_or(-1))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn forward_lines<R>(reader: Option<R>, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                    buf.pop();
                }
                let line = OutputLine {
                    stream,
                    line: String::from_utf8_lossy(&buf).into_owned(),
                };
                if tx.send(line).await.is_err() {
                    debug!("Line receiver dropped; discarding remaining output.");
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "Error reading process output.");
                break;
            }
        }
    }
}

/// Hands out a fresh [`LocalTransport`] for every target.
#[derive(Debug, Default, Clone)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        _dial_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        debug!(host_id = %target.host_id, "Opening local shell transport.");
        Ok(Arc::new(LocalTransport::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_captures_output_and_exit_code() {
        let transport = LocalTransport::new();
        let out = transport.exec("echo hi; echo err >&2; exit 3", None).await.unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "err\n");
    }

    #[tokio::test]
    async fn exec_feeds_stdin() {
        let transport = LocalTransport::new();
        let out = transport.exec("cat", Some(b"piped")).await.unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[tokio::test]
    async fn streaming_delivers_lines_in_order() {
        let transport = LocalTransport::new();
        let (tx, mut rx) = mpsc::channel(16);
        let code = transport
            .exec_streaming("printf 'a\\nb\\nc'", tx)
            .await
            .unwrap();
        assert_eq!(code, 0);
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.line);
        }
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn closed_transport_refuses_commands() {
        let transport = LocalTransport::new();
        assert!(transport.is_alive().await);
        transport.close().await;
        assert!(!transport.is_alive().await);
        assert!(matches!(transport.exec("true", None).await, Err(TransportError::Closed)));
    }
}
