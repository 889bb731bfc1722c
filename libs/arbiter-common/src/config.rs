// Environment-style configuration helpers shared by the engine and the worker

use std::str::FromStr;

/// Parse `key` from `lookup`, falling back to `default` when the variable is
/// missing or does not parse.
pub fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a non-empty string variable.
pub fn string_opt<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Boolean flag accepting `1/0`, `true/false`, `yes/no`.
pub fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

/// Lookup backed by the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
