use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_ENV: &str = "DESK_RELAY_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub desk: DeskConfig,

    #[serde(default)]
    pub jobs: JobTimingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the JSON profile list, relative to the working directory.
    #[serde(default = "default_profiles_path")]
    pub profiles_path: PathBuf,

    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeskConfig {
    #[serde(default = "default_accounts_url")]
    pub accounts_url: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,

    #[serde(default = "default_org_header")]
    pub org_header: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobTimingConfig {
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,

    #[serde(default = "default_sleep_tick_ms")]
    pub sleep_tick_ms: u64,

    /// Grace period before checking ticket history, so server-side automation has run.
    #[serde(default = "default_verify_delay_secs")]
    pub verify_delay_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_profiles_path() -> PathBuf {
    PathBuf::from("profiles.json")
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8080".to_string()]
}
fn default_accounts_url() -> String {
    "https://accounts.zoho.com/oauth/v2/token".to_string()
}
fn default_api_base_url() -> String {
    "https://desk.zoho.com/api/v1".to_string()
}
fn default_auth_scheme() -> String {
    "Zoho-oauthtoken".to_string()
}
fn default_org_header() -> String {
    "orgId".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_pause_poll_ms() -> u64 {
    500
}
fn default_sleep_tick_ms() -> u64 {
    100
}
fn default_verify_delay_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            profiles_path: default_profiles_path(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            accounts_url: default_accounts_url(),
            api_base_url: default_api_base_url(),
            auth_scheme: default_auth_scheme(),
            org_header: default_org_header(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for JobTimingConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: default_pause_poll_ms(),
            sleep_tick_ms: default_sleep_tick_ms(),
            verify_delay_secs: default_verify_delay_secs(),
        }
    }
}

impl DeskConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl JobTimingConfig {
    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }

    pub fn sleep_tick(&self) -> Duration {
        Duration::from_millis(self.sleep_tick_ms.max(1))
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_secs(self.verify_delay_secs)
    }
}

impl RelayConfig {
    /// Resolve the config file: explicit path, then `DESK_RELAY_CONFIG`, then
    /// `./relay.toml`. A missing default file means built-in defaults.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let path = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(p) => p,
            None => {
                let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !fallback.exists() {
                    info!("No {} found, using default relay settings.", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!("Loaded relay config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: RelayConfig = toml::from_str(content)?;
        config.desk.api_base_url = config.desk.api_base_url.trim_end_matches('/').to_string();
        if config.server.allowed_origins.is_empty() {
            config.server.allowed_origins = default_allowed_origins();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = RelayConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.desk.auth_scheme, "Zoho-oauthtoken");
        assert_eq!(config.jobs.pause_poll(), Duration::from_millis(500));
        assert_eq!(config.jobs.sleep_tick(), Duration::from_millis(100));
        assert_eq!(config.jobs.verify_delay(), Duration::from_secs(10));
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = RelayConfig::from_toml(
            r#"
[server]
port = 4100
allowed_origins = []

[desk]
api_base_url = "http://127.0.0.1:9999/api/v1/"
request_timeout_secs = 12
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.allowed_origins, vec!["http://localhost:8080"]);
        assert_eq!(config.desk.api_base_url, "http://127.0.0.1:9999/api/v1");
        assert_eq!(config.desk.request_timeout(), Duration::from_secs(12));
        assert_eq!(config.desk.org_header, "orgId");
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let config = RelayConfig::from_toml("[jobs]\npause_poll_ms = 0\nsleep_tick_ms = 0\n").unwrap();
        assert_eq!(config.jobs.pause_poll(), Duration::from_millis(1));
        assert_eq!(config.jobs.sleep_tick(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn load_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nport = 4200\n").unwrap();
        let config = RelayConfig::load(Some(&path)).await.unwrap();
        assert_eq!(config.server.port, 4200);
    }

    #[tokio::test]
    async fn load_fails_on_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(RelayConfig::load(Some(&missing)).await.is_err());
    }
}
