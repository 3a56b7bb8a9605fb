//! Runtime configuration.
//!
//! Read from `devstack.toml` in the working directory (or an explicit path).
//! Every field is optional; command-line flags override what is loaded here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{CommandNotifier, FileNotifier, Notifier};
use crate::task::Role;
use crate::watcher::WatcherOptions;

pub const DEFAULT_CONFIG_FILE: &str = "devstack.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("bad config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("can't serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task store file.
    pub tasks_file: PathBuf,
    /// Watcher state, context database, inboxes and conversation exports.
    pub state_dir: PathBuf,
    pub poll_interval_secs: u64,
    /// Longest a task may stay in WIP before the watcher blocks it. 0 disables.
    pub max_wip_secs: u64,
    /// Default per-context token budget.
    pub token_budget: u32,
    pub dedupe_window_secs: u64,
    /// Retries on version conflicts before giving up.
    pub write_retries: u32,
    pub notifier: NotifierConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tasks_file: PathBuf::from("tasks.json"),
            state_dir: PathBuf::from(".devstack"),
            poll_interval_secs: 2,
            max_wip_secs: 3600,
            token_budget: 8000,
            dedupe_window_secs: 30,
            write_retries: 5,
            notifier: NotifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    /// Append to `<dir>/<role>.jsonl`.
    #[default]
    File,
    /// Run a program per notification (e.g. `docker exec`).
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    /// Inbox directory for the file notifier. Defaults to `<state_dir>/inbox`.
    pub dir: Option<PathBuf>,
    pub program: String,
    /// Argument templates; see `CommandNotifier`.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Runtime (container) name per role. Unlisted agent roles get
    /// `agent_<role>`.
    pub runtimes: BTreeMap<Role, String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            kind: NotifierKind::File,
            dir: None,
            program: String::new(),
            args: Vec::new(),
            timeout_secs: 10,
            runtimes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load `path`, or `devstack.toml` if it exists, or the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !p.exists() {
                    return Ok(Self::default());
                }
                p
            }
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn watcher_state_path(&self) -> PathBuf {
        self.state_dir.join("watcher_state.json")
    }

    pub fn contexts_db_path(&self) -> PathBuf {
        self.state_dir.join("contexts.db")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir.join("conversations")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.notifier
            .dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("inbox"))
    }

    pub fn max_wip(&self) -> Option<Duration> {
        (self.max_wip_secs > 0).then(|| Duration::from_secs(self.max_wip_secs))
    }

    pub fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_wip: self.max_wip(),
            write_retries: self.write_retries,
            state_path: Some(self.watcher_state_path()),
            baseline_on_start: true,
        }
    }

    /// Runtime name for every agent role, filling in the defaults.
    pub fn runtimes(&self) -> BTreeMap<Role, String> {
        Role::ALL
            .into_iter()
            .filter(|r| r.is_agent())
            .map(|r| {
                let name = self
                    .notifier
                    .runtimes
                    .get(&r)
                    .cloned()
                    .unwrap_or_else(|| format!("agent_{}", r.as_str().to_lowercase()));
                (r, name)
            })
            .collect()
    }

    pub fn build_notifier(&self) -> Arc<dyn Notifier> {
        match self.notifier.kind {
            NotifierKind::File => Arc::new(FileNotifier::new(self.inbox_dir())),
            NotifierKind::Command if self.notifier.program.is_empty() => {
                Arc::new(CommandNotifier::docker(self.runtimes()))
            }
            NotifierKind::Command => Arc::new(CommandNotifier::new(
                self.notifier.program.clone(),
                self.notifier.args.clone(),
                self.runtimes(),
                Duration::from_secs(self.notifier.timeout_secs),
            )),
        }
    }
}
