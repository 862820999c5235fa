use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use certhunt_core::ReplyPolicy;
use tracing::Level;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct TaskListConfig {
    pub validity_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RepliesConfig {
    pub max_age_secs: Option<u64>,
    pub max_future_skew_secs: Option<u64>,
    pub max_trace_hops: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    pub logging: Option<LoggingConfig>,
    pub database: Option<DatabaseConfig>,
    pub task_list: Option<TaskListConfig>,
    pub replies: Option<RepliesConfig>,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.database
            .as_ref()
            .and_then(|d| d.path.clone())
            .unwrap_or_else(|| PathBuf::from("certhunt.db"))
    }

    /// Configured log level; `-v` on the command line takes precedence.
    pub fn log_level(&self) -> Result<Option<Level>> {
        match self.logging.as_ref().and_then(|l| l.level.as_deref()) {
            Some(s) => Ok(Some(s.parse().map_err(|_| anyhow!("unknown log level {:?}", s))?)),
            None => Ok(None),
        }
    }

    pub fn task_list_validity(&self) -> Duration {
        let secs = self.task_list.as_ref().and_then(|t| t.validity_secs).unwrap_or(300);
        Duration::from_secs(secs)
    }

    pub fn reply_policy(&self) -> ReplyPolicy {
        let mut policy = ReplyPolicy::default();
        if let Some(r) = &self.replies {
            if let Some(s) = r.max_age_secs { policy.max_age = Duration::from_secs(s); }
            if let Some(s) = r.max_future_skew_secs { policy.max_future_skew = Duration::from_secs(s); }
            if let Some(n) = r.max_trace_hops { policy.max_trace_hops = n; }
        }
        policy
    }
}

/// Load the YAML config. Without an explicit path, ./certhunt.yaml is used if
/// present and defaults otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new("certhunt.yaml");
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}
