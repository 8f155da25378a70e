use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Scheduler snapshot, rewritten on every state change.
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: PathBuf,
    /// SQLite request ledger.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// CORS origin allowlist.  Empty means any origin is accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// YouTube Data API key.  The YOUTUBE_API_KEY environment variable takes
    /// precedence when set.
    #[serde(default)]
    pub youtube_api_key: Option<String>,
    /// Duration used whenever an external lookup fails or times out.
    #[serde(default = "default_fallback_secs")]
    pub fallback_secs: u32,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationConfig {
    /// Advisory resubmission window broadcast to clients after each request.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            snapshot_file: default_snapshot_file(),
            ledger_file: default_ledger_file(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_socket_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_http_port(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            youtube_api_key: None,
            fallback_secs: default_fallback_secs(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_snapshot_file() -> PathBuf {
    paths::data_dir().join("snapshot.json")
}

fn default_ledger_file() -> PathBuf {
    paths::data_dir().join("requests.db")
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_socket_port() -> u16 {
    paths::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    9471
}

fn default_fallback_secs() -> u32 {
    180
}

fn default_lookup_timeout_ms() -> u64 {
    5000
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.socket.port, 9470);
        assert_eq!(config.socket.bind_address, "127.0.0.1");
        assert_eq!(config.resolver.fallback_secs, 180);
        assert_eq!(config.moderation.cooldown_secs, 60);
        assert!(config.daemon.snapshot_file.ends_with("onair/snapshot.json"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [socket]
            port = 4242

            [resolver]
            fallback_secs = 90
            "#,
        )
        .unwrap();
        assert_eq!(config.socket.port, 4242);
        assert_eq!(config.socket.bind_address, "127.0.0.1");
        assert_eq!(config.resolver.fallback_secs, 90);
        assert_eq!(config.resolver.lookup_timeout_ms, 5000);
        assert!(config.http.allowed_origins.is_empty());
    }
}
