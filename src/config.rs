use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub backend: BackendConfig,
    pub channel: ChannelConfig,
    pub reconnect: ReconnectConfig,
    pub staleness: StalenessConfig,
    pub event_log: EventLogConfig,
    /// Login used when no session token is supplied.
    pub credentials: Option<CredentialsConfig>,
}

/// REST side of the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the REST API.
    pub api_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".into(),
        }
    }
}

/// The persistent telemetry channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel address. Derived from `backend.api_url` when unset.
    pub url: Option<String>,
    /// Role announced in the handshake.
    pub role: String,
    pub connect_timeout_ms: u64,
    /// Cadence of `ping` frames while the channel is open.
    pub probe_interval_ms: u64,
    /// Outbound frames that may queue before `send` starts dropping.
    pub outbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: None,
            role: "operator".into(),
            connect_timeout_ms: 10_000,
            probe_interval_ms: 60_000,
            outbound_capacity: 64,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

/// What to do when the channel drops. Disabled by default: a lost channel
/// stays closed until the next session starts a fresh one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub sweep_interval_ms: u64,
    /// Silence after which a presumed-online robot becomes unreachable.
    pub window_ms: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
            window_ms: 10_000,
        }
    }
}

impl StalenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            capacity: crate::fleet::store::DEFAULT_EVENT_LOG_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

impl FleetConfig {
    /// Read `path` as TOML. A missing file is `Ok(None)`, not an error.
    ///
    /// The file may carry credentials, so a world-readable mode is logged.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// `$XDG_CONFIG_HOME/fleetsync/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fleetsync").join("config.toml"))
    }

    /// Address of the telemetry channel, without the session parameter.
    ///
    /// An explicit `channel.url` wins. Otherwise the API URL is reused with
    /// its scheme switched to `ws`/`wss` and `/ws` appended to the path.
    pub fn channel_url(&self) -> Result<Url, ConfigError> {
        if let Some(raw) = &self.channel.url {
            return parse_url(raw);
        }

        let mut url = parse_url(&self.backend.api_url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ConfigError::InvalidUrl(
                    self.backend.api_url.clone(),
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            ConfigError::InvalidUrl(self.backend.api_url.clone(), "cannot switch scheme".into())
        })?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        Ok(url)
    }
}

fn parse_url(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e.to_string()))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidUrl(String, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "cannot read {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "invalid config in {}: {}", path.display(), e)
            }
            Self::InvalidUrl(url, reason) => write!(f, "Invalid URL '{}': {}", url, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Log a warning when the config file is readable by other users.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            path = %path.display(),
            mode = %format!("{:o}", mode & 0o7777),
            "config file is world-readable and may hold fleet credentials; chmod 600 it",
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
