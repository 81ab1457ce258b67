use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    drain_lines, CommandOutput, ConnectTarget, Connector, Credential, OutputLine, OutputStream,
    Transport, TransportError,
};

struct ClientHandler {
    host_id: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Fleet hosts are registered by operators; host keys are not pinned.
    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            host_id = %self.host_id,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key."
        );
        Ok(true)
    }
}

/// One authenticated SSH session. Every command runs on its own channel, so
/// concurrent commands on one session are allowed.
pub struct SshTransport {
    handle: Handle<ClientHandler>,
    host_id: String,
}

impl SshTransport {
    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>, TransportError> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| channel_error(&e))
    }
}

fn channel_error(e: &russh::Error) -> TransportError {
    match e {
        russh::Error::Disconnect | russh::Error::SendError => TransportError::Closed,
        other => TransportError::Channel(other.to_string()),
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError> {
        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await.map_err(|e| channel_error(&e))?;
        if let Some(input) = stdin {
            channel.data(input).await.map_err(|e| channel_error(&e))?;
        }
        channel.eof().await.map_err(|e| channel_error(&e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status as i32),
                _ => {}
            }
        }

        Ok(CommandOutput {
            // A channel that closes without an exit status lost its session.
            exit_code: exit_code.ok_or(TransportError::Closed)?,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn exec_streaming(
        &self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i32, TransportError> {
        let mut channel = self.open_channel().await?;
        channel.exec(true, command).await.map_err(|e| channel_error(&e))?;
        channel.eof().await.map_err(|e| channel_error(&e))?;

        let mut out_pending = Vec::new();
        let mut err_pending = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            let (stream, produced) = match msg {
                ChannelMsg::Data { ref data } => {
                    (OutputStream::Stdout, drain_lines(&mut out_pending, data))
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    (OutputStream::Stderr, drain_lines(&mut err_pending, data))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                    continue;
                }
                _ => continue,
            };
            for line in produced {
                if lines.send(OutputLine { stream, line }).await.is_err() {
                    debug!(host_id = %self.host_id, "Line receiver dropped.");
                }
            }
        }

        for (stream, pending) in [
            (OutputStream::Stdout, out_pending),
            (OutputStream::Stderr, err_pending),
        ] {
            if !pending.is_empty() {
                let line = String::from_utf8_lossy(&pending).into_owned();
                let _ = lines.send(OutputLine { stream, line }).await;
            }
        }

        exit_code.ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            debug!(host_id = %self.host_id, error = %e, "SSH disconnect failed.");
        }
    }
}

/// Dials hosts over SSH with password or private-key authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    keepalive_interval: Duration,
}

impl SshConnector {
    pub fn new(keepalive_interval: Duration) -> Self {
        Self { keepalive_interval }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectTarget,
        dial_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive_interval),
            ..Default::default()
        });
        let handler = ClientHandler {
            host_id: target.host_id.clone(),
        };

        let dial = client::connect(config, (target.address.as_str(), target.port), handler);
        let mut handle = tokio::time::timeout(dial_timeout, dial)
            .await
            .map_err(|_| {
                TransportError::Connect(format!(
                    "{}:{} timed out after {}s",
                    target.address,
                    target.port,
                    dial_timeout.as_secs()
                ))
            })?
            .map_err(|e| TransportError::Connect(format!("{}:{}: {e}", target.address, target.port)))?;

        let authenticated = match &target.credential {
            Credential::Password(password) => handle
                .authenticate_password(&target.login, password)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?,
            Credential::PrivateKey(pem) => {
                let key_pair = russh_keys::decode_secret_key(pem, None)
                    .map_err(|e| TransportError::Auth(format!("{}: bad private key: {e}", target.login)))?;
                handle
                    .authenticate_publickey(&target.login, Arc::new(key_pair))
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?
            }
            Credential::None => handle
                .authenticate_none(&target.login)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?,
        };

        if !authenticated {
            warn!(host_id = %target.host_id, login = %target.login, "SSH authentication rejected.");
            return Err(TransportError::Auth(format!(
                "{}@{}",
                target.login, target.address
            )));
        }

        info!(host_id = %target.host_id, address = %target.address, "SSH session established.");
        Ok(Arc::new(SshTransport {
            handle,
            host_id: target.host_id.clone(),
        }))
    }
}
