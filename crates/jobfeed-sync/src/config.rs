use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use jobfeed_storage::DepartmentSource;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "JOBFEED_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "jobfeed.yaml";

/// How often the scheduled trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInterval {
    #[default]
    Off,
    Hourly,
    Twicedaily,
    Daily,
}

impl ScheduleInterval {
    /// Six-field cron expression (seconds first), `None` when disabled.
    pub fn cron(self) -> Option<&'static str> {
        match self {
            ScheduleInterval::Off => None,
            ScheduleInterval::Hourly => Some("0 0 * * * *"),
            ScheduleInterval::Twicedaily => Some("0 0 6,18 * * *"),
            ScheduleInterval::Daily => Some("0 0 6 * * *"),
        }
    }
}

impl FromStr for ScheduleInterval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "none" => Ok(ScheduleInterval::Off),
            "hourly" => Ok(ScheduleInterval::Hourly),
            "twicedaily" => Ok(ScheduleInterval::Twicedaily),
            "daily" => Ok(ScheduleInterval::Daily),
            other => Err(anyhow!("unknown schedule {other:?} (expected off, hourly, twicedaily or daily)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// HTTPS URL of the job feed. Left empty, every sync fails as an invalid URL.
    pub feed_url: String,
    pub database_url: String,
    pub schedule: ScheduleInterval,
    pub http_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    pub user_agent: Option<String>,
    pub department_source: DepartmentSource,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            database_url: "sqlite://jobfeed.db".to_string(),
            schedule: ScheduleInterval::Off,
            http_timeout_secs: 15,
            lock_ttl_secs: 600,
            user_agent: None,
            department_source: DepartmentSource::Api,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    /// Defaults, overlaid by the YAML file named in `JOBFEED_CONFIG` (or
    /// `jobfeed.yaml` when present), overlaid by environment variables.
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        let base = match &explicit {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_yaml_file(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(base.with_env(|key| std::env::var(key).ok()))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Applies environment overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("JOBFEED_FEED_URL") {
            self.feed_url = v;
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = lookup("JOBFEED_USER_AGENT") {
            self.user_agent = Some(v).filter(|ua| !ua.trim().is_empty());
        }
        override_parsed(&lookup, "JOBFEED_SCHEDULE", &mut self.schedule);
        override_parsed(&lookup, "JOBFEED_HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs);
        override_parsed(&lookup, "JOBFEED_LOCK_TTL_SECS", &mut self.lock_ttl_secs);
        override_parsed(&lookup, "JOBFEED_DEPARTMENT_SOURCE", &mut self.department_source);
        override_parsed(&lookup, "JOBFEED_WEB_PORT", &mut self.web_port);
        self
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(err) => warn!(key, value = %raw, error = %err, "ignoring invalid config override"),
    }
}
