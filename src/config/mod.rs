use crate::error::{Result, WardenError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use nix::sys::signal::Signal;

/// Signals accepted as `stop_signal`
pub const VALID_STOP_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

/// Upper bound on the instance count of a single app entry
pub const MAX_INSTANCES: usize = 100;

/// Resolved description of one application entry.
///
/// An `AppSpec` is validated once, wrapped in an `Arc` and never mutated
/// afterwards; reconfiguration hands the supervisor a whole new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppSpec {
    /// Application name (unique identifier)
    pub name: String,

    /// Path to the script or executable to run
    pub script: PathBuf,

    /// Command-line arguments, either a list or a whitespace-separated string
    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<String>,

    /// Program used to run `script`, e.g. `python3`
    #[serde(default)]
    pub interpreter: Option<PathBuf>,

    /// Working directory for the process
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Number of instances to run
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Whether to automatically restart on exit
    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// File watching is not supported; only `false` has behavior
    #[serde(default)]
    pub watch: bool,

    /// Memory ceiling in bytes, accepts PM2 size strings like "1G"
    #[serde(
        default,
        rename = "max_memory_restart",
        deserialize_with = "deserialize_memory"
    )]
    pub max_memory: Option<u64>,

    /// Uptime (ms) after which a run counts as stable
    #[serde(default = "default_min_uptime")]
    pub min_uptime: u64,

    /// Consecutive unstable exits tolerated before giving up
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// First backoff delay (ms) inside a crash loop
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,

    /// Backoff cap (ms)
    #[serde(default = "default_max_restart_delay")]
    pub max_restart_delay: u64,

    /// Grace period (ms) between the stop signal and SIGKILL
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: u64,

    /// Memory sampling period (ms)
    #[serde(default = "default_memory_check_interval")]
    pub memory_check_interval: u64,

    /// Signal to send on stop
    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
}

// Default value functions for serde
fn default_instances() -> usize {
    1
}

fn default_autorestart() -> bool {
    true
}

fn default_min_uptime() -> u64 {
    1_000
}

fn default_max_restarts() -> u32 {
    10
}

fn default_restart_delay() -> u64 {
    100
}

fn default_max_restart_delay() -> u64 {
    15_000
}

fn default_kill_timeout() -> u64 {
    1_600
}

fn default_memory_check_interval() -> u64 {
    1_000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgsField {
    Line(String),
    List(Vec<String>),
}

fn deserialize_args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ArgsField::deserialize(deserializer)? {
        ArgsField::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        ArgsField::List(list) => list,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemoryField {
    Bytes(u64),
    Text(String),
}

fn deserialize_memory<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<MemoryField>::deserialize(deserializer)? {
        None => Ok(None),
        Some(MemoryField::Bytes(bytes)) => Ok(Some(bytes)),
        Some(MemoryField::Text(text)) => parse_memory_size(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Parse a PM2-style memory size: plain bytes or a `K`/`M`/`G` suffix (1024 based)
pub fn parse_memory_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || WardenError::ConfigError(format!("Invalid memory size: '{}'", input));

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1024),
        Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(invalid()),
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value.checked_mul(multiplier).ok_or_else(invalid)
}

impl AppSpec {
    /// Create a spec with default tuning for the given script
    pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            args: Vec::new(),
            interpreter: None,
            cwd: None,
            env: BTreeMap::new(),
            instances: default_instances(),
            autorestart: default_autorestart(),
            watch: false,
            max_memory: None,
            min_uptime: default_min_uptime(),
            max_restarts: default_max_restarts(),
            restart_delay: default_restart_delay(),
            max_restart_delay: default_max_restart_delay(),
            kill_timeout: default_kill_timeout(),
            memory_check_interval: default_memory_check_interval(),
            stop_signal: default_stop_signal(),
        }
    }

    /// Validate the spec; the supervisor refuses to run an invalid one
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WardenError::InvalidSpec("name must not be empty".to_string()));
        }

        if self.script.as_os_str().is_empty() {
            return Err(WardenError::InvalidSpec(
                "script must not be empty".to_string(),
            ));
        }

        if self.instances == 0 {
            return Err(WardenError::InvalidSpec(
                "instances must be at least 1".to_string(),
            ));
        }

        if self.instances > MAX_INSTANCES {
            return Err(WardenError::InvalidSpec(format!(
                "instances cannot exceed {}",
                MAX_INSTANCES
            )));
        }

        if self.max_memory == Some(0) {
            return Err(WardenError::InvalidSpec(
                "max_memory_restart must be greater than zero".to_string(),
            ));
        }

        if self.max_restarts == 0 {
            return Err(WardenError::InvalidSpec(
                "max_restarts must be at least 1".to_string(),
            ));
        }

        if self.restart_delay > self.max_restart_delay {
            return Err(WardenError::InvalidSpec(format!(
                "restart_delay ({}ms) exceeds max_restart_delay ({}ms)",
                self.restart_delay, self.max_restart_delay
            )));
        }

        if self.memory_check_interval == 0 {
            return Err(WardenError::InvalidSpec(
                "memory_check_interval must be greater than zero".to_string(),
            ));
        }

        if !VALID_STOP_SIGNALS.contains(&self.stop_signal.as_str()) {
            return Err(WardenError::InvalidSpec(format!(
                "Invalid stop_signal: {}. Must be one of: {}",
                self.stop_signal,
                VALID_STOP_SIGNALS.join(", ")
            )));
        }

        if let Some(ref cwd) = self.cwd {
            if !cwd.is_dir() {
                return Err(WardenError::InvalidSpec(format!(
                    "Working directory does not exist: {}",
                    cwd.display()
                )));
            }
        }

        if self.watch {
            tracing::warn!(app = %self.name, "watch mode is not supported, ignoring");
        }

        Ok(())
    }

    /// Script path, resolved against `cwd` when relative
    pub fn resolved_script(&self) -> PathBuf {
        match self.cwd {
            Some(ref cwd) if self.script.is_relative() => cwd.join(&self.script),
            _ => self.script.clone(),
        }
    }

    /// Program and argument vector used to launch one instance
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        let script = self.resolved_script();
        match self.interpreter {
            Some(ref interpreter) => {
                let mut args = Vec::with_capacity(self.args.len() + 1);
                args.push(script.to_string_lossy().into_owned());
                args.extend(self.args.iter().cloned());
                (interpreter.clone(), args)
            }
            None => (script, self.args.clone()),
        }
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay)
    }

    pub fn max_restart_delay(&self) -> Duration {
        Duration::from_millis(self.max_restart_delay)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval)
    }

    /// Parse `stop_signal` into a signal
    #[cfg(unix)]
    pub fn stop_signal(&self) -> Result<Signal> {
        parse_signal(&self.stop_signal)
    }
}

#[cfg(unix)]
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(WardenError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}

/// An ecosystem file: a list of app entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EcosystemFile {
    pub apps: Vec<AppSpec>,
}

impl EcosystemFile {
    /// Load and validate an ecosystem file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "toml" => Self::from_toml_str(&contents),
            "json" => Self::from_json_str(&contents),
            _ => Err(WardenError::InvalidConfig(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: EcosystemFile = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let file: EcosystemFile = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.apps.is_empty() {
            return Err(WardenError::InvalidConfig(
                "No app entry found in file".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for app in &self.apps {
            app.validate()?;
            if !seen.insert(app.name.as_str()) {
                return Err(WardenError::InvalidConfig(format!(
                    "Duplicate app name: {}",
                    app.name
                )));
            }
        }

        Ok(())
    }

    /// Look up an app entry by name
    pub fn app(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|app| app.name == name)
    }
}
