//! Read-only environment values shared by the scenario builder and its flows.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("environment variable {0} is not set")]
    Missing(String),

    #[error("environment variable {key}={value:?} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Snapshot of environment-derived configuration.
///
/// Taken once when the scenario starts; flows never observe later changes
/// to the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Env {
    vars: BTreeMap<String, String>,
}

impl Env {
    /// Snapshot the current process environment.
    pub fn from_process() -> Self {
        Self::from_iter(std::env::vars())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Like `get`, but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<&str, EnvError> {
        self.get(key)
            .ok_or_else(|| EnvError::Missing(key.to_string()))
    }

    /// Parse a value. `Ok(None)` when the key is unset.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, EnvError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EnvError::Invalid {
                key: key.to_string(),
                value: raw.to_string(),
                reason: e.to_string(),
            })
    }

    /// Truthy flag: `1`, `true`, `yes`, `on` (case-insensitive).
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Env
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn env() -> Env {
        Env::from_iter([
            ("NODE_URL", "ws://127.0.0.1:9944"),
            ("TREASURY_INITIAL_BALANCE", " 1000 "),
            ("SKIP_QUERY_NODE_CHECKS", "Yes"),
            ("BROKEN_NUMBER", "12x"),
        ])
    }

    #[test]
    fn get_and_default() {
        let env = env();
        assert_eq!(env.get("NODE_URL"), Some("ws://127.0.0.1:9944"));
        assert_eq!(env.get_or("QUERY_NODE_URL", "http://localhost:8081"), "http://localhost:8081");
        assert!(env.contains("NODE_URL"));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn require_reports_missing_key() {
        let err = env().require("MISSING").unwrap_err();
        assert_eq!(err, EnvError::Missing("MISSING".into()));
    }

    #[test]
    fn parse_trims_and_converts() {
        let value: Option<u64> = env().parse("TREASURY_INITIAL_BALANCE").unwrap();
        assert_eq!(value, Some(1000));

        let unset: Option<u64> = env().parse("NOPE").unwrap();
        assert_eq!(unset, None);
    }

    #[test]
    fn parse_error_names_the_key() {
        let err = env().parse::<u32>("BROKEN_NUMBER").unwrap_err();
        assert!(matches!(err, EnvError::Invalid { ref key, .. } if key == "BROKEN_NUMBER"));
        assert!(err.to_string().contains("12x"));
    }

    #[rstest]
    #[case("1", true)]
    #[case("true", true)]
    #[case("ON", true)]
    #[case("yes", true)]
    #[case("0", false)]
    #[case("no", false)]
    #[case("", false)]
    fn flag_values(#[case] raw: &str, #[case] expected: bool) {
        let env = Env::from_iter([("F", raw)]);
        assert_eq!(env.flag("F"), expected);
    }

    #[test]
    fn unset_flag_is_false() {
        assert!(!Env::default().flag("F"));
    }
}
