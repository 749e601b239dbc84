use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::MonitorConfig;
use crate::store::PersonaId;
use crate::sync::SYNC_TOPIC;
use crate::transport::{ChannelConfig, TransportError};

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8069/websocket";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Client configuration. Sources, lowest precedence first: built-in
/// defaults, an optional TOML file, `BUSLINE_*` environment variables, CLI
/// flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub channels: Vec<String>,
    pub self_persona: Option<u64>,
    pub grace_period_ms: u64,
    pub stability_threshold_ms: u64,
    pub max_reconnect_attempts: u32,
    pub lost_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub sync_topic: String,
}

impl Default for Config {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            channels: Vec::new(),
            self_persona: None,
            grace_period_ms: millis(monitor.grace_period),
            stability_threshold_ms: millis(monitor.stability_threshold),
            max_reconnect_attempts: monitor.max_reconnect_attempts,
            lost_timeout_ms: millis(monitor.lost_timeout),
            reconnect_min_ms: 250,
            reconnect_max_ms: 5_000,
            sync_topic: SYNC_TOPIC.to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("BUSLINE_SERVER_URL") {
            self.server_url = url;
        }
        if let Ok(channels) = env::var("BUSLINE_CHANNELS") {
            self.channels = channels
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(topic) = env::var("BUSLINE_SYNC_TOPIC") {
            self.sync_topic = topic;
        }
        if let Some(persona) = env_number("BUSLINE_SELF_PERSONA")? {
            self.self_persona = Some(persona);
        }
        if let Some(value) = env_number("BUSLINE_GRACE_MS")? {
            self.grace_period_ms = value;
        }
        if let Some(value) = env_number("BUSLINE_STABILITY_MS")? {
            self.stability_threshold_ms = value;
        }
        if let Some(value) = env_number("BUSLINE_MAX_RECONNECTS")? {
            self.max_reconnect_attempts = value;
        }
        if let Some(value) = env_number("BUSLINE_LOST_TIMEOUT_MS")? {
            self.lost_timeout_ms = value;
        }
        if let Some(value) = env_number("BUSLINE_RECONNECT_MIN_MS")? {
            self.reconnect_min_ms = value;
        }
        if let Some(value) = env_number("BUSLINE_RECONNECT_MAX_MS")? {
            self.reconnect_max_ms = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect_min_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_min_ms ({}) exceeds reconnect_max_ms ({})",
                self.reconnect_min_ms, self.reconnect_max_ms
            )));
        }
        if self.sync_topic.is_empty() {
            return Err(ConfigError::Invalid("sync_topic must not be empty".into()));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            grace_period: Duration::from_millis(self.grace_period_ms),
            stability_threshold: Duration::from_millis(self.stability_threshold_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            lost_timeout: Duration::from_millis(self.lost_timeout_ms),
        }
    }

    pub fn self_persona(&self) -> Option<PersonaId> {
        self.self_persona.map(PersonaId)
    }

    pub fn channel_config(&self) -> Result<ChannelConfig, TransportError> {
        Ok(ChannelConfig::new(&self.server_url)?
            .with_channels(self.channels.iter().cloned())
            .with_backoff(
                Duration::from_millis(self.reconnect_min_ms),
                Duration::from_millis(self.reconnect_max_ms),
            ))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_number<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: [&str; 10] = [
        "BUSLINE_SERVER_URL",
        "BUSLINE_CHANNELS",
        "BUSLINE_SYNC_TOPIC",
        "BUSLINE_SELF_PERSONA",
        "BUSLINE_GRACE_MS",
        "BUSLINE_STABILITY_MS",
        "BUSLINE_MAX_RECONNECTS",
        "BUSLINE_LOST_TIMEOUT_MS",
        "BUSLINE_RECONNECT_MIN_MS",
        "BUSLINE_RECONNECT_MAX_MS",
    ];

    fn clear_env() {
        for name in VARS {
            unsafe {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn defaults_match_monitor_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let config = Config::load(None).expect("load");
        assert_eq!(config.monitor_config(), MonitorConfig::default());
        assert_eq!(config.sync_topic, SYNC_TOPIC);
        assert!(config.channel_config().is_ok());
    }

    #[test]
    fn environment_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let path = env::temp_dir().join(format!("busline-{}.toml", uuid::Uuid::new_v4()));
        fs::write(
            &path,
            "server_url = \"ws://file.example/websocket\"\ngrace_period_ms = 900\nchannels = [\"a\"]\n",
        )
        .expect("write config");

        unsafe {
            env::set_var("BUSLINE_CHANNELS", "general, random,,");
            env::set_var("BUSLINE_MAX_RECONNECTS", "5");
        }
        let config = Config::load(Some(path.as_path())).expect("load");
        clear_env();
        let _ = fs::remove_file(&path);

        assert_eq!(config.server_url, "ws://file.example/websocket");
        assert_eq!(config.channels, vec!["general", "random"]);
        let monitor = config.monitor_config();
        assert_eq!(monitor.grace_period, Duration::from_millis(900));
        assert_eq!(monitor.max_reconnect_attempts, 5);
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("BUSLINE_GRACE_MS", "soon");
        }
        let result = Config::load(None);
        clear_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidVar { name: "BUSLINE_GRACE_MS", .. })
        ));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = Config {
            reconnect_min_ms: 10_000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rendered_config_parses_back() {
        let config = Config {
            self_persona: Some(3),
            channels: vec!["general".into()],
            ..Config::default()
        };
        let rendered = config.to_toml().expect("render");
        let parsed: Config = toml::from_str(&rendered).expect("parse");
        assert_eq!(parsed, config);
    }
}
