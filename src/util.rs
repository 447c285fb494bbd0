//! Shared utility functions used across the codebase.

use std::path::PathBuf;

/// Parse a string as a boolean.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` as `true` and `0`, `false`, `no`,
/// `n`, `off` as `false` (case-insensitive). Anything else is `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Parse an environment variable as a boolean, returning `default` if unset
/// or unrecognised.
pub fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value).unwrap_or(default),
        Err(_) => default,
    }
}

/// Return the value of `$HOME`, falling back to `/root`.
pub fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| "/root".to_string())
}

/// Application-local writable data directory (`$XDG_DATA_HOME/keyrelay` or
/// `~/.local/share/keyrelay`).
pub fn default_data_dir() -> PathBuf {
    match std::env::var("XDG_DATA_HOME") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir).join("keyrelay"),
        _ => PathBuf::from(home_dir()).join(".local/share/keyrelay"),
    }
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
