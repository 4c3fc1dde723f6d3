//! Snapshot of the environment variables the launcher consults.

use crate::config::EnvVars;
use crate::error::{MapdlError, Result};
use std::collections::HashMap;

/// Environment variables captured once, before resolution.
///
/// Resolution never reads `std::env` directly; tests build a snapshot from
/// pairs instead of mutating the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture every variable listed in [`EnvVars::ALL`] from this process.
    pub fn from_process() -> Self {
        let vars = EnvVars::ALL
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.to_string(), v)))
            .collect();
        Self { vars }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// An empty snapshot.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The same snapshot with `name` removed.
    pub fn without(mut self, name: &str) -> Self {
        self.vars.remove(name);
        self
    }

    /// Value of a variable, trimmed. Empty values count as unset.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Parse a `true`/`false` variable (case-insensitive).
    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };
        match value.to_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(MapdlError::InvalidEnvVar {
                name: name.to_string(),
                value: value.to_string(),
                expected: "'true' or 'false'".to_string(),
            }),
        }
    }

    /// Parse an unsigned integer variable.
    pub fn get_u32(&self, name: &str) -> Result<Option<u32>> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };
        value
            .parse::<u32>()
            .map(Some)
            .map_err(|_| MapdlError::InvalidEnvVar {
                name: name.to_string(),
                value: value.to_string(),
                expected: "a positive integer".to_string(),
            })
    }

    /// Parse a byte count variable.
    pub fn get_usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(value) = self.get(name) else {
            return Ok(None);
        };
        value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| MapdlError::InvalidEnvVar {
                name: name.to_string(),
                value: value.to_string(),
                expected: "a size in bytes".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_value_is_unset() {
        let env = EnvSnapshot::from_pairs([(EnvVars::IP, "  "), (EnvVars::PORT, "50060")]);
        assert_eq!(env.get(EnvVars::IP), None);
        assert!(!env.is_set(EnvVars::IP));
        assert_eq!(env.get(EnvVars::PORT), Some("50060"));
    }

    #[test]
    fn test_get_bool_case_insensitive() {
        let env = EnvSnapshot::from_pairs([
            ("A", "TRUE"),
            ("B", " False "),
            ("C", "yes"),
        ]);
        assert_eq!(env.get_bool("A").unwrap(), Some(true));
        assert_eq!(env.get_bool("B").unwrap(), Some(false));
        assert_eq!(env.get_bool("MISSING").unwrap(), None);

        let err = env.get_bool("C").unwrap_err();
        assert!(matches!(err, MapdlError::InvalidEnvVar { ref name, .. } if name == "C"));
    }

    #[test]
    fn test_get_u32() {
        let env = EnvSnapshot::from_pairs([("N", "4"), ("BAD", "four")]);
        assert_eq!(env.get_u32("N").unwrap(), Some(4));
        assert!(env.get_u32("BAD").is_err());
    }
}
