//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL carries credentials, so it is wrapped in
//! [`SecretString`] to keep it out of logs.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_POLICY_DIR: &str = "surveys";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub db_max_connections: u32,
    /// Directory of `*.toml` survey policies.
    pub policy_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_max_connections: parsed_var("DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            policy_dir: std::env::var("POLICY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_POLICY_DIR)),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var(name: &str, default: u32) -> Result<u32> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(0) | Err(_) => Err(Error::Config(format!(
                "{name} must be a positive integer, got {raw:?}"
            ))),
            Ok(n) => Ok(n),
        },
        Err(_) => Ok(default),
    }
}
