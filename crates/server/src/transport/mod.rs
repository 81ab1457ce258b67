//! Remote command transports.
//!
//! A [`Transport`] is one authenticated connection to a host that can run
//! shell commands. [`Connector`] opens them. The SSH implementation is used in
//! production; the local-shell implementation runs commands through
//! `/bin/sh` on the control plane itself.

pub mod local;
pub mod ssh;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::hosts::Host;
use crate::vault::Vault;

pub use local::LocalConnector;
pub use ssh::SshConnector;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed for {0}")]
    Auth(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when the underlying connection is gone and no further command
    /// can succeed on it.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::Channel(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` to completion, optionally feeding `stdin`.
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, TransportError>;

    /// Runs `command`, sending every stdout/stderr line to `lines` as it is
    /// produced. Returns the exit code.
    ///
    /// Dropping the returned future abandons the remote process.
    async fn exec_streaming(
        &self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i32, TransportError>;

    /// Cheap liveness check: a single `echo`.
    async fn is_alive(&self) -> bool {
        match self.exec("echo ok", None).await {
            Ok(output) => output.success() && output.stdout.trim() == "ok",
            Err(_) => false,
        }
    }

    async fn close(&self);
}

/// Credential resolved from a host's decrypted secret.
#[derive(Clone)]
pub enum Credential {
    None,
    Password(String),
    PrivateKey(String),
}

impl Credential {
    /// PEM/OpenSSH private keys are recognised by their armour line; any
    /// other non-empty secret is a password.
    pub fn from_secret(secret: String) -> Self {
        if secret.is_empty() {
            Credential::None
        } else if secret.trim_start().starts_with("-----BEGIN") {
            Credential::PrivateKey(secret)
        } else {
            Credential::Password(secret)
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => write!(f, "None"),
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::PrivateKey(_) => write!(f, "PrivateKey(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host_id: String,
    pub address: String,
    pub port: u16,
    pub login: String,
    pub credential: Credential,
}

impl ConnectTarget {
    /// Builds a dial target, decrypting the host secret through the vault.
    pub fn for_host(host: &Host, vault: &Vault) -> Self {
        Self {
            host_id: host.id.clone(),
            address: host.address.clone(),
            port: host.port,
            login: host.login.clone(),
            credential: Credential::from_secret(vault.decrypt(&host.secret)),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &ConnectTarget,
        dial_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Splits a byte buffer into complete lines, keeping the trailing partial
/// line in `pending`.
pub(crate) fn drain_lines(pending: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    pending.extend_from_slice(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}
