//! Strict environment variable readers
//!
//! Unset or blank variables fall back to the caller's default. A variable
//! that is set but does not parse is an error rather than a silent default,
//! so a typo in `XMLSTAGE_WORKERS=4x` stops the run at startup.

use crate::error::{CommonError, Result};
use std::str::FromStr;

/// Read a variable, treating blank values as unset.
pub fn var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Read a variable that must be present.
pub fn required(key: &str) -> Result<String> {
    var(key).ok_or_else(|| CommonError::config(format!("{} not set", key)))
}

/// Parse a variable if it is set.
pub fn parse_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| CommonError::invalid_value(key, raw, e)),
        None => Ok(None),
    }
}

/// Parse a variable, falling back to `default` when unset.
pub fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(key)?.unwrap_or(default))
}

/// Read a boolean flag. Accepts `true/false`, `1/0`, `yes/no`, `on/off`.
pub fn flag_or(key: &str, default: bool) -> Result<bool> {
    let Some(raw) = var(key) else {
        return Ok(default);
    };
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(CommonError::invalid_value(key, raw, "expected a boolean")),
    }
}
