//! Environment variable utilities
//!
//! Used by `EngineConfig::from_env` to read `TRACKLINE_*` overrides.
//!
//! ```ignore
//! use trackline_core::env::{env_get, env_get_bool};
//!
//! let workers: usize = env_get("TRACKLINE_WORKERS", 4);
//! let lazy: bool = env_get_bool("TRACKLINE_KCALL_LAZY", false);
//! ```

use std::str::FromStr;

/// Parse an environment variable as `T`, or return `default` when it is
/// unset or does not parse
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Read an environment variable as a boolean.
///
/// "1", "true", "yes" and "on" (any case) are true; any other value is
/// false. Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse an environment variable as `T` if it is set and valid
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
