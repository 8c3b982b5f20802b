//! Environment variable utilities
//!
//! Typed lookups with defaults, used by `IoConfig::from_env()` and the
//! logging setup.
//!
//! ```ignore
//! use pageio_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("PIO_NUM_IO_THREADS", 4);
//! let flush = env_get_bool("PIO_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or malformed.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` only if the variable is set and parses.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; other set values are false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

/// Duration given in milliseconds
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// Duration given in microseconds
#[inline]
pub fn env_get_us(key: &str, default_us: u64) -> Duration {
    Duration::from_micros(env_get(key, default_us))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_falls_back() {
        let v: usize = env_get("__PIO_TEST_UNSET__", 7);
        assert_eq!(v, 7);
        assert!(env_get_opt::<u32>("__PIO_TEST_UNSET__").is_none());
        assert!(env_get_bool("__PIO_TEST_UNSET__", true));
        assert_eq!(env_get_str("__PIO_TEST_UNSET__", "x"), "x");
        assert!(!env_is_set("__PIO_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_and_malformed() {
        std::env::set_var("__PIO_TEST_NUM__", " 64 ");
        assert_eq!(env_get::<usize>("__PIO_TEST_NUM__", 0), 64);
        assert_eq!(env_get_ms("__PIO_TEST_NUM__", 1), Duration::from_millis(64));
        assert_eq!(env_get_us("__PIO_TEST_NUM__", 1), Duration::from_micros(64));
        std::env::set_var("__PIO_TEST_NUM__", "lots");
        assert_eq!(env_get::<usize>("__PIO_TEST_NUM__", 3), 3);
        std::env::remove_var("__PIO_TEST_NUM__");
    }

    #[test]
    fn test_bool_spellings() {
        for (raw, want) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("nope", false)] {
            std::env::set_var("__PIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__PIO_TEST_BOOL__", !want), want, "{}", raw);
        }
        std::env::remove_var("__PIO_TEST_BOOL__");
    }
}
