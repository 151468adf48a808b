//! Configuration module for the meetvote backend.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Some(LogFormat::Text),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pre-shared key for API authentication (required in production)
    pub api_psk: Option<String>,
    /// Path to SQLite database file
    pub db_path: PathBuf,
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Plain text or JSON log lines
    pub log_format: LogFormat,
    /// Interval of the background expiry sweeper, `None` keeps expiry lazy
    pub expiry_sweep: Option<Duration>,
}

/// Error raised when the environment holds a value the server cannot start with.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_psk = env::var("MEETVOTE_API_PSK")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let db_path = env::var("MEETVOTE_DB_PATH")
            .unwrap_or_else(|_| "./data/meetvote.sqlite".to_string())
            .into();

        let bind_raw =
            env::var("MEETVOTE_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let bind_addr = bind_raw
            .parse()
            .map_err(|_| ConfigError(format!("invalid MEETVOTE_BIND_ADDR: {}", bind_raw)))?;

        let log_level = env::var("MEETVOTE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_format = match env::var("MEETVOTE_LOG_FORMAT") {
            Ok(raw) => LogFormat::parse(&raw).unwrap_or(LogFormat::Text),
            Err(_) => LogFormat::Text,
        };

        // Unparsable or zero disables the sweeper
        let expiry_sweep = env::var("MEETVOTE_EXPIRY_SWEEP_SECS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            api_psk,
            db_path,
            bind_addr,
            log_level,
            log_format,
            expiry_sweep,
        })
    }
}
