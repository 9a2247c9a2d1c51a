use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    pub fn from_env() -> Self {
        Self {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_parse("DATABASE_PORT", 5432),
            username: env_or("DATABASE_USERNAME", "consultbook_user"),
            password: env_or("DATABASE_PASSWORD", "consultbook_password"),
            database: env_or("DATABASE_NAME", "consultbook"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
            acquire_timeout_secs: env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", 5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: u64,
    pub issuer: String,
}

impl JwtConfig {
    /// `allow_dev_secrets` lets an unset `JWT_SECRET` fall back to a
    /// well-known development key.
    pub fn from_env(allow_dev_secrets: bool) -> Result<Self, AppError> {
        Ok(Self {
            secret: env_secret("JWT_SECRET", "dev-secret-key-change-in-production", allow_dev_secrets)?,
            expiration_hours: env_parse("JWT_EXPIRATION_HOURS", 24),
            issuer: env_or("JWT_ISSUER", "consultbook"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// Reads `key`, falling back to `default` when unset.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Reads and parses `key`. Unset or unparsable values fall back to `default`.
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparsable value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Reads `key` as an optional value; empty strings count as unset.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Reads a signing secret. An unset secret is a configuration error unless
/// development secrets are allowed, in which case `dev_default` is used.
pub fn env_secret(key: &str, dev_default: &str, allow_dev_secrets: bool) -> Result<String, AppError> {
    resolve_secret(key, env_opt(key), dev_default, allow_dev_secrets)
}

fn resolve_secret(
    key: &str,
    value: Option<String>,
    dev_default: &str,
    allow_dev_secrets: bool,
) -> Result<String, AppError> {
    match value {
        Some(secret) => Ok(secret),
        None if allow_dev_secrets => {
            tracing::warn!("{} is unset, using the development secret", key);
            Ok(dev_default.to_string())
        }
        None => Err(AppError::Validation(format!("{} must be set", key))),
    }
}
