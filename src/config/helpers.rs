//! Env-var parsing helpers shared by the config structs.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and empty as absent.
pub(crate) fn optional_env(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(key: &str, default: impl Into<String>) -> String {
    optional_env(key).unwrap_or_else(|| default.into())
}

/// Read and parse an env var with a default. Unparseable values are errors,
/// not silent fallbacks.
pub(crate) fn parse_optional_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            key: key.to_string(),
            reason: format!("{e}"),
        }),
        None => Ok(default),
    }
}
