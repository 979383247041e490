use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervisor-wide settings shared by every task
    #[serde(default)]
    pub defaults: SupervisorDefaults,

    /// Supervised tasks keyed by service name
    #[serde(default)]
    pub services: BTreeMap<String, TaskSettings>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API, 0 disables it (default: 9999)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorDefaults {
    /// Time between SIGTERM and SIGKILL when stopping a task
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Time to wait for a process to die after each SIGKILL
    #[serde(default = "default_kill_wait")]
    pub kill_wait_ms: u64,

    /// Number of output/status lines kept per task
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
}

impl Default for SupervisorDefaults {
    fn default() -> Self {
        Self {
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            kill_wait_ms: default_kill_wait(),
            backlog_capacity: default_backlog_capacity(),
        }
    }
}

impl SupervisorDefaults {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

/// User and group a task runs as
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Settings for one supervised task
///
/// # Security Warning
///
/// `args` is executed directly with the permissions of the server (or of
/// `identity` when set). Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq, Eq)]
pub struct TaskSettings {
    /// Program followed by its arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory (default: the server's)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Run as another user/group (Unix only)
    #[serde(default)]
    pub identity: Option<Identity>,

    /// Launch the task again after it exits
    #[serde(default)]
    pub relaunch: bool,

    /// Seconds to wait before relaunching
    #[serde(default)]
    pub relaunch_interval_secs: u64,

    /// Start the task when the server starts
    #[serde(default)]
    pub autolaunch: bool,
}

impl TaskSettings {
    /// Settings that run `program` with no arguments
    pub fn command(program: &str) -> Self {
        Self {
            args: vec![program.to_string()],
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_relaunch(mut self, interval_secs: u64) -> Self {
        self.relaunch = true;
        self.relaunch_interval_secs = interval_secs;
        self
    }

    pub fn with_autolaunch(mut self) -> Self {
        self.autolaunch = true;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn relaunch_interval(&self) -> Duration {
        Duration::from_secs(self.relaunch_interval_secs)
    }

    /// Validate the task settings
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("Service name must not be empty".to_string());
        }

        match self.program() {
            None => Err(format!("Service '{}': 'args' must name a program", name)),
            Some("") => Err(format!("Service '{}': program name must not be empty", name)),
            Some(_) => Ok(()),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_shutdown_grace_period() -> u64 {
    1000 // 1 second between SIGTERM and SIGKILL
}

fn default_kill_wait() -> u64 {
    500
}

fn default_backlog_capacity() -> usize {
    1000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, settings) in &self.services {
            if let Err(e) = settings.validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
