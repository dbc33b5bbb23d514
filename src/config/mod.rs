// Configuration module

use serde::Deserialize;

fn default_session_lifetime() -> u64 {
    86_400
}

fn default_sliding_window() -> u64 {
    3_600
}

fn default_session_cap() -> usize {
    5
}

fn default_ticket_ttl() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub redis_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub jwt_secret: String,
    pub environment: Environment,
    /// Session lifetime in seconds.
    #[serde(default = "default_session_lifetime")]
    pub session_lifetime_secs: u64,
    /// Sessions within this many seconds of expiry are sliding-refreshed.
    #[serde(default = "default_sliding_window")]
    pub session_sliding_window_secs: u64,
    /// Maximum live sessions per user; creating one more evicts the oldest.
    #[serde(default = "default_session_cap")]
    pub session_cap_per_user: usize,
    /// Single-use connection-ticket lifetime in seconds.
    #[serde(default = "default_ticket_ttl")]
    pub connection_ticket_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;

        config.try_deserialize()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 8080,
            jwt_secret: "dev-secret-change-in-production".to_string(),
            environment: Environment::Development,
            session_lifetime_secs: default_session_lifetime(),
            session_sliding_window_secs: default_sliding_window(),
            session_cap_per_user: default_session_cap(),
            connection_ticket_ttl_secs: default_ticket_ttl(),
        }
    }
}
