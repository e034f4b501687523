//! Configuration loading from the process environment.

use std::time::Duration;

use thiserror::Error;

use warden_core::paging::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Connection settings for the Postgres store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Page size bounds applied to every list operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_PAGE_LIMIT,
            max_limit: MAX_PAGE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WardenConfig {
    /// `None` selects the in-memory store.
    pub store: Option<StoreConfig>,
    pub paging: PagingConfig,
}

impl WardenConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let use_persistent = lookup("USE_PERSISTENT_STORES")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let store = if use_persistent {
            let database_url = lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing("DATABASE_URL"))?;
            Some(StoreConfig {
                database_url,
                max_connections: parse_positive(&lookup, "WARDEN_DB_MAX_CONNECTIONS", 10)?,
                acquire_timeout: Duration::from_secs(u64::from(parse_positive(
                    &lookup,
                    "WARDEN_DB_ACQUIRE_TIMEOUT_SECS",
                    5,
                )?)),
            })
        } else {
            None
        };

        let paging = PagingConfig {
            default_limit: parse_positive(&lookup, "WARDEN_PAGE_DEFAULT_LIMIT", DEFAULT_PAGE_LIMIT)?,
            max_limit: parse_positive(&lookup, "WARDEN_PAGE_MAX_LIMIT", MAX_PAGE_LIMIT)?,
        };
        if paging.default_limit > paging.max_limit {
            return Err(ConfigError::Invalid {
                key: "WARDEN_PAGE_DEFAULT_LIMIT",
                value: paging.default_limit.to_string(),
                reason: format!("exceeds WARDEN_PAGE_MAX_LIMIT ({})", paging.max_limit),
            });
        }

        Ok(Self { store, paging })
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let value: u32 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
        ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be positive".to_string(),
        });
    }
    Ok(value)
}
