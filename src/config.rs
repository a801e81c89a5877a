use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Intermediate chain, appended to the leaf certificate when present.
    #[serde(default)]
    pub chain_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    #[serde(default = "default_user_file")]
    pub user_file: PathBuf,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// 0 disables lockout.
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
    /// Paths that bypass authentication entirely.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            token_file: default_token_file(),
            user_file: default_user_file(),
            session_ttl_secs: default_session_ttl(),
            max_failed_attempts: default_max_failed_attempts(),
            public_paths: default_public_paths(),
        }
    }
}

fn default_auth_enabled() -> bool {
    true
}
fn default_token_file() -> PathBuf {
    PathBuf::from("tokens.yaml")
}
fn default_user_file() -> PathBuf {
    PathBuf::from("users.yaml")
}
fn default_session_ttl() -> u64 {
    86400 // 24 hours
}
fn default_max_failed_attempts() -> u32 {
    5
}
fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string(), "/api/user/info".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_window_secs() -> u64 {
    900 // 15 minutes
}
fn default_max_attempts() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}
fn default_max_connections() -> u32 {
    5
}
fn default_idle_timeout() -> u64 {
    1800 // 30 minutes
}
fn default_sweep_interval() -> u64 {
    60
}

/// A database exposed through the catalog. Ordering in the config file is
/// significant: unbound service tokens see the first entry only.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub url: String,
    /// Empty means open to every sessioned user.
    #[serde(default)]
    pub available_to_users: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl AppConfig {
    /// Validate configuration before startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.tls.enabled
            && (self.server.tls.cert_file.is_none() || self.server.tls.key_file.is_none())
        {
            return Err(
                "server.tls.cert_file and server.tls.key_file are required when TLS is enabled"
                    .to_string(),
            );
        }
        if self.auth.enabled && self.databases.is_empty() {
            return Err(
                "at least one database must be configured when auth is enabled".to_string(),
            );
        }
        let mut seen = std::collections::HashSet::new();
        for db in &self.databases {
            if db.name.trim().is_empty() {
                return Err("database name must not be empty".to_string());
            }
            if !seen.insert(db.name.as_str()) {
                return Err(format!("duplicate database name: {}", db.name));
            }
        }
        if self.rate_limit.window_secs == 0 {
            return Err("rate_limit.window_secs must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        // Load from config file
        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (PGMCP__SERVER__PORT=8080, etc.)
        builder = builder.add_source(
            Environment::with_prefix("PGMCP")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
