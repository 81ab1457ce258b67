//! Kind-specific task operations. Each one runs remote shell snippets and
//! reports whether it changed the host.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use super::engine::OutputSink;
use super::manifest::{ComposeAction, DockerAction, ServiceAction, TaskKind};
use super::template::{is_truthy, render};
use crate::transport::{shell_quote, CommandOutput, OutputStream, Transport, TransportError};

const CHANGED: &str = "changed";
const UNCHANGED: &str = "ok";

pub(crate) type Params = HashMap<String, String>;

#[derive(Debug)]
pub(crate) struct OpResult {
    pub changed: bool,
    pub output: String,
}

impl OpResult {
    fn changed(changed: bool) -> Self {
        Self {
            changed,
            output: String::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum OpError {
    Failed(String),
    Transport(TransportError),
}

impl From<TransportError> for OpError {
    fn from(e: TransportError) -> Self {
        OpError::Transport(e)
    }
}

pub(crate) struct OpContext<'a> {
    pub transport: &'a dyn Transport,
    pub sudo: bool,
    pub user_scope: bool,
    pub sink: &'a dyn OutputSink,
    pub vars: &'a HashMap<String, String>,
    pub poll_interval: Duration,
}

impl OpContext<'_> {
    fn wrap(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput, OpError> {
        Ok(self.transport.exec(&self.wrap(command), stdin).await?)
    }

    async fn succeeds(&self, command: &str) -> Result<bool, OpError> {
        Ok(self.exec(command, None).await?.success())
    }

    /// Runs a snippet that ends by printing `changed` or `ok`.
    async fn marker(&self, script: &str) -> Result<bool, OpError> {
        let out = self.exec(script, None).await?;
        if !out.success() {
            return Err(failure(&out));
        }
        match out.stdout.lines().rev().map(str::trim).find(|l| !l.is_empty()) {
            Some(CHANGED) => Ok(true),
            Some(UNCHANGED) => Ok(false),
            other => Err(OpError::Failed(format!(
                "unexpected output: {}",
                other.unwrap_or("<empty>")
            ))),
        }
    }

    /// Streams the command's lines to the sink while collecting them.
    async fn stream(&self, command: &str) -> Result<CommandOutput, OpError> {
        let (tx, mut rx) = mpsc::channel(256);
        let wrapped = self.wrap(command);
        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            while let Some(line) = rx.recv().await {
                self.sink.line(&line);
                let buf = match line.stream {
                    OutputStream::Stdout => &mut stdout,
                    OutputStream::Stderr => &mut stderr,
                };
                buf.push_str(&line.line);
                buf.push('\n');
            }
            (stdout, stderr)
        };
        let (code, (stdout, stderr)) =
            tokio::join!(self.transport.exec_streaming(&wrapped, tx), collect);
        Ok(CommandOutput {
            exit_code: code?,
            stdout,
            stderr,
        })
    }
}

fn failure(out: &CommandOutput) -> OpError {
    let detail: Vec<&str> = out
        .stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let tail = detail[detail.len().saturating_sub(5)..].join("; ");
    if tail.is_empty() {
        OpError::Failed(format!("exit status {}", out.exit_code))
    } else {
        OpError::Failed(format!("exit status {}: {tail}", out.exit_code))
    }
}

fn param<'p>(params: &'p Params, key: &str) -> Result<&'p str, OpError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| OpError::Failed(format!("missing param '{key}'")))
}

fn opt_param<'p>(params: &'p Params, key: &str) -> Option<&'p str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

pub(crate) async fn execute(
    ctx: &OpContext<'_>,
    kind: TaskKind,
    params: &Params,
) -> Result<OpResult, OpError> {
    match kind {
        TaskKind::Upload => {
            let src = param(params, "src")?;
            let bytes = tokio::fs::read(src)
                .await
                .map_err(|e| OpError::Failed(format!("cannot read {src}: {e}")))?;
            let changed = put_bytes(ctx, param(params, "dest")?, &bytes, opt_param(params, "mode")).await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Write => {
            let content = params.get("content").map(String::as_str).unwrap_or("");
            let changed = put_bytes(ctx, param(params, "dest")?, content.as_bytes(), opt_param(params, "mode")).await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Template => {
            let body = match opt_param(params, "src") {
                Some(src) => {
                    let raw = tokio::fs::read_to_string(src)
                        .await
                        .map_err(|e| OpError::Failed(format!("cannot read template {src}: {e}")))?;
                    render(&raw, ctx.vars)
                }
                None => params.get("content").cloned().unwrap_or_default(),
            };
            let changed = put_bytes(ctx, param(params, "dest")?, body.as_bytes(), opt_param(params, "mode")).await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Copy => {
            let (src, dest) = (shell_quote(param(params, "src")?), shell_quote(param(params, "dest")?));
            let changed = ctx
                .marker(&format!(
                    "[ -e {src} ] || {{ echo 'source missing: '{src} >&2; exit 1; }}; \
                     if cmp -s {src} {dest}; then echo ok; else cp -a {src} {dest} && echo changed; fi"
                ))
                .await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Move => {
            let (src, dest) = (shell_quote(param(params, "src")?), shell_quote(param(params, "dest")?));
            let changed = ctx
                .marker(&format!(
                    "if [ -e {src} ]; then mv -f {src} {dest} && echo changed; \
                     elif [ -e {dest} ]; then echo ok; \
                     else echo 'source missing: '{src} >&2; exit 1; fi"
                ))
                .await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Mkdir => {
            let path = param(params, "path")?;
            let q = shell_quote(path);
            let mut changed = ctx
                .marker(&format!("if [ -d {q} ]; then echo ok; else mkdir -p {q} && echo changed; fi"))
                .await?;
            if let Some(mode) = opt_param(params, "mode") {
                changed |= chmod(ctx, path, mode).await?;
            }
            Ok(OpResult::changed(changed))
        }
        TaskKind::Rm => {
            let q = shell_quote(param(params, "path")?);
            let flags = if opt_param(params, "recursive").is_some_and(is_truthy) { "-rf" } else { "-f" };
            let changed = ctx
                .marker(&format!(
                    "if [ -e {q} ] || [ -L {q} ]; then rm {flags} {q} && echo changed; else echo ok; fi"
                ))
                .await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Chmod => {
            let changed = chmod(ctx, param(params, "path")?, param(params, "mode")?).await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Chown => {
            let (path, owner) = (shell_quote(param(params, "path")?), shell_quote(param(params, "owner")?));
            let changed = ctx
                .marker(&format!(
                    "before=$(stat -c %U:%G {path}) || exit 1; chown {owner} {path} || exit 1; \
                     after=$(stat -c %U:%G {path}); \
                     if [ \"$before\" = \"$after\" ]; then echo ok; else echo changed; fi"
                ))
                .await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Symlink => {
            let (src, dest) = (shell_quote(param(params, "src")?), shell_quote(param(params, "dest")?));
            let changed = ctx
                .marker(&format!(
                    "if [ -L {dest} ] && [ \"$(readlink {dest})\" = {src} ]; then echo ok; \
                     else ln -sfn {src} {dest} && echo changed; fi"
                ))
                .await?;
            Ok(OpResult::changed(changed))
        }
        TaskKind::Run => {
            let out = ctx.stream(param(params, "cmd")?).await?;
            if !out.success() {
                return Err(failure(&out));
            }
            Ok(OpResult {
                changed: params.get("changes").map_or(true, |v| is_truthy(v)),
                output: out.stdout.trim_end().to_string(),
            })
        }
        TaskKind::Capture => {
            let out = ctx.stream(param(params, "cmd")?).await?;
            if !out.success() {
                return Err(failure(&out));
            }
            Ok(OpResult {
                changed: false,
                output: out.stdout.trim().to_string(),
            })
        }
        TaskKind::Service(action) => service(ctx, action, param(params, "name")?).await,
        TaskKind::Docker(action) => docker(ctx, action, params).await,
        TaskKind::Compose(action) => compose(ctx, action, params).await,
        TaskKind::WaitPort => {
            let host = opt_param(params, "host").unwrap_or("127.0.0.1");
            let port = param(params, "port")?;
            if port.parse::<u16>().is_err() {
                return Err(OpError::Failed(format!("invalid port '{port}'")));
            }
            let host_q = shell_quote(host);
            let probe = format!(
                "if command -v nc >/dev/null 2>&1; then nc -z -w 2 {host_q} {port}; \
                 else timeout 2 bash -c 'exec 3<>/dev/tcp/'{host_q}'/{port}'; fi"
            );
            loop {
                if ctx.succeeds(&probe).await? {
                    return Ok(OpResult {
                        changed: false,
                        output: format!("{host}:{port} reachable"),
                    });
                }
                tokio::time::sleep(ctx.poll_interval).await;
            }
        }
        TaskKind::WaitHttp => {
            let url = param(params, "url")?;
            let expected = opt_param(params, "status").unwrap_or("200");
            let probe = format!(
                "curl -s -o /dev/null -w '%{{http_code}}' --max-time 5 {}",
                shell_quote(url)
            );
            loop {
                let out = ctx.exec(&probe, None).await?;
                if out.stdout.trim() == expected {
                    return Ok(OpResult {
                        changed: false,
                        output: format!("{url} returned {expected}"),
                    });
                }
                tokio::time::sleep(ctx.poll_interval).await;
            }
        }
    }
}

/// Writes `bytes` to `dest` unless the remote sha256 already matches.
async fn put_bytes(
    ctx: &OpContext<'_>,
    dest: &str,
    bytes: &[u8],
    mode: Option<&str>,
) -> Result<bool, OpError> {
    let want = hex::encode(Sha256::digest(bytes));
    let q = shell_quote(dest);
    let have = ctx
        .exec(&format!("sha256sum {q} 2>/dev/null | cut -d' ' -f1"), None)
        .await?;

    let mut changed = false;
    if have.stdout.trim() != want {
        let out = ctx
            .exec(&format!("mkdir -p \"$(dirname {q})\" && cat > {q}"), Some(bytes))
            .await?;
        if !out.success() {
            return Err(failure(&out));
        }
        changed = true;
    }
    if let Some(mode) = mode {
        changed |= chmod(ctx, dest, mode).await?;
    }
    Ok(changed)
}

async fn chmod(ctx: &OpContext<'_>, path: &str, mode: &str) -> Result<bool, OpError> {
    let (path, mode) = (shell_quote(path), shell_quote(mode));
    ctx.marker(&format!(
        "before=$(stat -c %a {path}) || exit 1; chmod {mode} {path} || exit 1; \
         after=$(stat -c %a {path}); \
         if [ \"$before\" = \"$after\" ]; then echo ok; else echo changed; fi"
    ))
    .await
}

async fn service(ctx: &OpContext<'_>, action: ServiceAction, name: &str) -> Result<OpResult, OpError> {
    let sc = if ctx.user_scope { "systemctl --user" } else { "systemctl" };
    let n = shell_quote(name);
    let script = match action {
        ServiceAction::Start => format!(
            "if {sc} is-active --quiet {n}; then echo ok; else {sc} start {n} && echo changed; fi"
        ),
        ServiceAction::Stop => format!(
            "if {sc} is-active --quiet {n}; then {sc} stop {n} && echo changed; else echo ok; fi"
        ),
        ServiceAction::Restart => format!("{sc} restart {n} && echo changed"),
        ServiceAction::Enable => format!(
            "if {sc} is-enabled --quiet {n}; then echo ok; else {sc} enable {n} && echo changed; fi"
        ),
        ServiceAction::Disable => format!(
            "if {sc} is-enabled --quiet {n}; then {sc} disable {n} && echo changed; else echo ok; fi"
        ),
    };
    Ok(OpResult::changed(ctx.marker(&script).await?))
}

async fn docker(ctx: &OpContext<'_>, action: DockerAction, params: &Params) -> Result<OpResult, OpError> {
    let state = |name: &str| format!("state=$(docker inspect -f '{{{{.State.Running}}}}' {name} 2>/dev/null)");
    let script = match action {
        DockerAction::Pull => {
            let image = shell_quote(param(params, "image")?);
            format!(
                "before=$(docker image inspect -f '{{{{.Id}}}}' {image} 2>/dev/null); \
                 docker pull -q {image} >&2 || exit 1; \
                 after=$(docker image inspect -f '{{{{.Id}}}}' {image} 2>/dev/null); \
                 if [ \"$before\" = \"$after\" ]; then echo ok; else echo changed; fi"
            )
        }
        DockerAction::Run => {
            let image = shell_quote(param(params, "image")?);
            let args = opt_param(params, "args").unwrap_or("");
            let command = opt_param(params, "command").unwrap_or("");
            match opt_param(params, "name") {
                Some(name) => {
                    let name = shell_quote(name);
                    format!(
                        "{}; if [ \"$state\" = \"true\" ]; then echo ok; \
                         elif [ -n \"$state\" ]; then docker start {name} >&2 && echo changed; \
                         else docker run -d --name {name} {args} {image} {command} >&2 && echo changed; fi",
                        state(&name)
                    )
                }
                None => format!("docker run -d {args} {image} {command} >&2 && echo changed"),
            }
        }
        DockerAction::Start => {
            let name = shell_quote(param(params, "name")?);
            format!(
                "{}; if [ -z \"$state\" ]; then echo 'no such container: '{name} >&2; exit 1; \
                 elif [ \"$state\" = \"true\" ]; then echo ok; \
                 else docker start {name} >&2 && echo changed; fi",
                state(&name)
            )
        }
        DockerAction::Stop => {
            let name = shell_quote(param(params, "name")?);
            format!(
                "{}; if [ \"$state\" = \"true\" ]; then docker stop {name} >&2 && echo changed; else echo ok; fi",
                state(&name)
            )
        }
        DockerAction::Remove => {
            let name = shell_quote(param(params, "name")?);
            format!(
                "if docker inspect {name} >/dev/null 2>&1; then docker rm -f {name} >&2 && echo changed; else echo ok; fi"
            )
        }
    };
    Ok(OpResult::changed(ctx.marker(&script).await?))
}

async fn compose(ctx: &OpContext<'_>, action: ComposeAction, params: &Params) -> Result<OpResult, OpError> {
    let base = format!("docker compose -f {}", shell_quote(param(params, "file")?));
    let service = opt_param(params, "service").map(shell_quote).unwrap_or_default();
    let script = match action {
        ComposeAction::Up => format!(
            "before=$({base} ps -q {service} | sort); {base} up -d {service} >&2 || exit 1; \
             after=$({base} ps -q {service} | sort); \
             if [ \"$before\" = \"$after\" ]; then echo ok; else echo changed; fi"
        ),
        ComposeAction::Pull => format!(
            "before=$({base} images -q {service} | sort); {base} pull {service} >&2 || exit 1; \
             after=$({base} images -q {service} | sort); \
             if [ \"$before\" = \"$after\" ]; then echo ok; else echo changed; fi"
        ),
        ComposeAction::Down => format!(
            "before=$({base} ps -q); {base} down >&2 || exit 1; \
             if [ -n \"$before\" ]; then echo changed; else echo ok; fi"
        ),
    };
    Ok(OpResult::changed(ctx.marker(&script).await?))
}
