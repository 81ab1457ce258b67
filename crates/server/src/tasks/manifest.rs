use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest invalid: {0}")]
    Invalid(String),
}

impl ManifestError {
    fn invalid(msg: impl Into<String>) -> Self {
        ManifestError::Invalid(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DockerAction {
    Pull,
    Run,
    Start,
    Stop,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComposeAction {
    Up,
    Down,
    Pull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TaskKind {
    Upload,
    Copy,
    Move,
    Write,
    Template,
    Mkdir,
    Rm,
    Chmod,
    Chown,
    Symlink,
    Run,
    Capture,
    Service(ServiceAction),
    Docker(DockerAction),
    Compose(ComposeAction),
    WaitPort,
    WaitHttp,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Copy => "copy",
            TaskKind::Move => "move",
            TaskKind::Write => "write",
            TaskKind::Template => "template",
            TaskKind::Mkdir => "mkdir",
            TaskKind::Rm => "rm",
            TaskKind::Chmod => "chmod",
            TaskKind::Chown => "chown",
            TaskKind::Symlink => "symlink",
            TaskKind::Run => "run",
            TaskKind::Capture => "capture",
            TaskKind::Service(ServiceAction::Start) => "svc.start",
            TaskKind::Service(ServiceAction::Stop) => "svc.stop",
            TaskKind::Service(ServiceAction::Restart) => "svc.restart",
            TaskKind::Service(ServiceAction::Enable) => "svc.enable",
            TaskKind::Service(ServiceAction::Disable) => "svc.disable",
            TaskKind::Docker(DockerAction::Pull) => "docker.pull",
            TaskKind::Docker(DockerAction::Run) => "docker.run",
            TaskKind::Docker(DockerAction::Start) => "docker.start",
            TaskKind::Docker(DockerAction::Stop) => "docker.stop",
            TaskKind::Docker(DockerAction::Remove) => "docker.remove",
            TaskKind::Compose(ComposeAction::Up) => "compose.up",
            TaskKind::Compose(ComposeAction::Down) => "compose.down",
            TaskKind::Compose(ComposeAction::Pull) => "compose.pull",
            TaskKind::WaitPort => "wait-port",
            TaskKind::WaitHttp => "wait-http",
        }
    }

    /// Parameters that must be present for the kind.
    pub fn required_params(&self) -> &'static [&'static str] {
        match self {
            TaskKind::Upload | TaskKind::Copy | TaskKind::Move | TaskKind::Symlink => {
                &["src", "dest"]
            }
            TaskKind::Write | TaskKind::Template => &["dest"],
            TaskKind::Mkdir | TaskKind::Rm => &["path"],
            TaskKind::Chmod => &["path", "mode"],
            TaskKind::Chown => &["path", "owner"],
            TaskKind::Run | TaskKind::Capture => &["cmd"],
            TaskKind::Service(_) => &["name"],
            TaskKind::Docker(DockerAction::Pull) | TaskKind::Docker(DockerAction::Run) => {
                &["image"]
            }
            TaskKind::Docker(_) => &["name"],
            TaskKind::Compose(_) => &["file"],
            TaskKind::WaitPort => &["port"],
            TaskKind::WaitHttp => &["url"],
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, TaskKind::WaitPort | TaskKind::WaitHttp)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().replace('_', "-").as_str() {
            "upload" => TaskKind::Upload,
            "copy" => TaskKind::Copy,
            "move" => TaskKind::Move,
            "write" => TaskKind::Write,
            "template" => TaskKind::Template,
            "mkdir" => TaskKind::Mkdir,
            "rm" => TaskKind::Rm,
            "chmod" => TaskKind::Chmod,
            "chown" => TaskKind::Chown,
            "symlink" => TaskKind::Symlink,
            "run" => TaskKind::Run,
            "capture" => TaskKind::Capture,
            "svc.start" => TaskKind::Service(ServiceAction::Start),
            "svc.stop" => TaskKind::Service(ServiceAction::Stop),
            "svc.restart" => TaskKind::Service(ServiceAction::Restart),
            "svc.enable" => TaskKind::Service(ServiceAction::Enable),
            "svc.disable" => TaskKind::Service(ServiceAction::Disable),
            "docker.pull" => TaskKind::Docker(DockerAction::Pull),
            "docker.run" => TaskKind::Docker(DockerAction::Run),
            "docker.start" => TaskKind::Docker(DockerAction::Start),
            "docker.stop" => TaskKind::Docker(DockerAction::Stop),
            "docker.remove" => TaskKind::Docker(DockerAction::Remove),
            "compose.up" => TaskKind::Compose(ComposeAction::Up),
            "compose.down" => TaskKind::Compose(ComposeAction::Down),
            "compose.pull" => TaskKind::Compose(ComposeAction::Pull),
            "wait-port" => TaskKind::WaitPort,
            "wait-http" => TaskKind::WaitHttp,
            other => return Err(ManifestError::invalid(format!("unknown task type '{other}'"))),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for TaskKind {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskKind> for String {
    fn from(kind: TaskKind) -> Self {
        kind.as_str().to_string()
    }
}

/// `<int>(s|m|h)`, e.g. `30s`, `5m`, `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskDuration(Duration);

impl TaskDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for TaskDuration {
    fn from(d: Duration) -> Self {
        TaskDuration(Duration::from_secs(d.as_secs()))
    }
}

impl FromStr for TaskDuration {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || ManifestError::invalid(format!("malformed duration '{s}'"));
        let Some((unit_at, _)) = s.char_indices().last() else {
            return Err(bad());
        };
        let (digits, unit) = s.split_at(unit_at);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(bad());
        }
        let n: u64 = digits.parse().map_err(|_| bad())?;
        let secs = match unit {
            "s" => n,
            "m" => n.checked_mul(60).ok_or_else(bad)?,
            "h" => n.checked_mul(3600).ok_or_else(bad)?,
            _ => return Err(bad()),
        };
        if secs == 0 {
            return Err(ManifestError::invalid(format!("duration '{s}' must be greater than zero")));
        }
        Ok(TaskDuration(Duration::from_secs(secs)))
    }
}

impl TryFrom<String> for TaskDuration {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskDuration> for String {
    fn from(d: TaskDuration) -> Self {
        d.to_string()
    }
}

impl fmt::Display for TaskDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{secs}s")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub sudo: bool,
    /// Use the user-session systemd manager for `svc.*`.
    pub user: bool,
    pub retry: u32,
    pub ignore: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creates: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TaskDuration>,
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_items: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub options: TaskOptions,
}

impl Task {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: String::new(),
            kind,
            name: String::new(),
            params: HashMap::new(),
            options: TaskOptions::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    /// Name shown in stream events and outcomes.
    pub fn label(&self) -> String {
        if !self.name.is_empty() {
            self.name.clone()
        } else if !self.id.is_empty() {
            self.id.clone()
        } else {
            self.kind.to_string()
        }
    }
}

/// An ordered task list plus its variable map. Order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

impl Manifest {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks,
            vars: HashMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Accepts either a bare task array or `{"tasks": [...], "vars": {...}}`,
    /// and validates the result.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ManifestError> {
        let manifest = match value {
            serde_json::Value::Array(_) => Manifest::new(
                serde_json::from_value(value).map_err(|e| ManifestError::invalid(e.to_string()))?,
            ),
            serde_json::Value::Object(_) => {
                serde_json::from_value(value).map_err(|e| ManifestError::invalid(e.to_string()))?
            }
            _ => return Err(ManifestError::invalid("expected a task array or object")),
        };
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn parse(json: &str) -> Result<Self, ManifestError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ManifestError::invalid(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut registers = HashSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let at = || format!("task {} ({})", index + 1, task.label());

            for key in task.kind.required_params() {
                if !task.params.contains_key(*key) {
                    return Err(ManifestError::invalid(format!(
                        "{}: missing required param '{key}'",
                        at()
                    )));
                }
            }
            if task.kind == TaskKind::Template
                && !task.params.contains_key("src")
                && !task.params.contains_key("content")
            {
                return Err(ManifestError::invalid(format!(
                    "{}: template needs 'src' or 'content'",
                    at()
                )));
            }
            if let Some(register) = &task.options.register {
                if register.trim().is_empty() {
                    return Err(ManifestError::invalid(format!("{}: empty register name", at())));
                }
                if !registers.insert(register.clone()) {
                    return Err(ManifestError::invalid(format!(
                        "{}: duplicate register name '{register}'",
                        at()
                    )));
                }
            }
            if let Some(when) = &task.options.when {
                if when.trim().is_empty() {
                    return Err(ManifestError::invalid(format!("{}: empty when expression", at())));
                }
            }
        }
        Ok(())
    }
}
