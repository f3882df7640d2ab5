//! Shared helpers for resolving configuration from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Read an optional environment variable, treating empty strings as unset.
pub fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid unicode".to_string(),
        }),
    }
}

/// Read an optional environment variable and parse it, falling back to a default.
pub fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Read an optional duration expressed in whole seconds.
pub fn parse_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_optional_env(
        key,
        default.as_secs(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_unset() {
        // Safety: test-only env mutation, key is unique to this test.
        unsafe { std::env::set_var("TOOLGATE_TEST_EMPTY", "") };
        assert_eq!(optional_env("TOOLGATE_TEST_EMPTY").unwrap(), None);
    }

    #[test]
    fn parse_falls_back_to_default() {
        assert_eq!(
            parse_optional_env("TOOLGATE_TEST_ABSENT", 42u32).unwrap(),
            42
        );
    }

    #[test]
    fn parse_rejects_garbage() {
        unsafe { std::env::set_var("TOOLGATE_TEST_GARBAGE", "not-a-number") };
        let err = parse_optional_env::<u32>("TOOLGATE_TEST_GARBAGE", 0).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
