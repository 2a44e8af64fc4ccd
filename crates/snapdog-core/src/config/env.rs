//! Flat view over the `SNAPDOG_`-prefixed process environment.
//!
//! Mapping env keys into config records is a pure function over this map, so
//! every parse rule is testable without touching the real environment.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{Error, Result};

pub const ENV_PREFIX: &str = "SNAPDOG_";

#[derive(Debug, Default, Clone)]
pub struct EnvMap {
    values: BTreeMap<String, String>,
}

impl EnvMap {
    /// Keep only `SNAPDOG_*` pairs, stripping the prefix.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .filter_map(|(k, v)| {
                k.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|rest| (rest.to_string(), v.into()))
            })
            .collect();
        Self { values }
    }

    pub fn from_process_env() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Full key with prefix, for error messages.
    fn full_key(key: &str) -> String {
        format!("{ENV_PREFIX}{key}")
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    /// Required string; missing is a config error.
    pub fn required(&self, key: &str) -> Result<String> {
        self.string(key)
            .ok_or_else(|| Error::config(Self::full_key(key), "missing required value"))
    }

    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| Error::config(Self::full_key(key), e)),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                other => Err(Error::config(
                    Self::full_key(key),
                    format!("'{other}' is not a boolean"),
                )),
            },
        }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.bool(key)?.unwrap_or(default))
    }

    /// Comma-separated list, trimmed, empty items dropped.
    pub fn csv(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Indices `i` for which any `"{section}_{i}_*"` key exists, ascending.
    pub fn indexed_sections(&self, section: &str) -> Vec<usize> {
        let prefix = format!("{section}_");
        let mut indices: Vec<usize> = self
            .values
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| {
                let (idx, tail) = rest.split_once('_')?;
                if tail.is_empty() {
                    return None;
                }
                idx.parse::<usize>().ok()
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Values of `"{stem}_{n}"` keys for n = 1.., in order, stopping at the
    /// first gap (used for `API_APIKEY_{n}`).
    pub fn numbered_values(&self, stem: &str) -> Vec<String> {
        let mut out = Vec::new();
        for n in 1.. {
            match self.get(&format!("{stem}_{n}")) {
                Some(v) => out.push(v.to_string()),
                None => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> EnvMap {
        EnvMap::from_pairs(pairs.iter().map(|(k, v)| (*k, v.to_string())))
    }

    #[test]
    fn prefix_filtering() {
        let e = env(&[("SNAPDOG_API_PORT", "8080"), ("PATH", "/usr/bin")]);
        assert_eq!(e.get("API_PORT"), Some("8080"));
        assert_eq!(e.get("PATH"), None);
    }

    #[test]
    fn parse_reports_offending_key() {
        let e = env(&[("SNAPDOG_API_PORT", "not-a-port")]);
        let err = e.parse::<u16>("API_PORT").unwrap_err();
        let Error::Config { key, .. } = err else {
            panic!("expected config error");
        };
        assert_eq!(key, "SNAPDOG_API_PORT");
    }

    #[test]
    fn bool_spellings() {
        let e = env(&[
            ("SNAPDOG_A", "true"),
            ("SNAPDOG_B", "0"),
            ("SNAPDOG_C", "On"),
            ("SNAPDOG_D", "maybe"),
        ]);
        assert_eq!(e.bool("A").unwrap(), Some(true));
        assert_eq!(e.bool("B").unwrap(), Some(false));
        assert_eq!(e.bool("C").unwrap(), Some(true));
        assert!(e.bool("D").is_err());
        assert_eq!(e.bool("MISSING").unwrap(), None);
    }

    #[test]
    fn indexed_sections_sorted_unique() {
        let e = env(&[
            ("SNAPDOG_ZONE_2_NAME", "b"),
            ("SNAPDOG_ZONE_1_NAME", "a"),
            ("SNAPDOG_ZONE_1_SINK", "/s"),
            ("SNAPDOG_ZONE_10_NAME", "j"),
            ("SNAPDOG_ZONEX_3_NAME", "nope"),
        ]);
        assert_eq!(e.indexed_sections("ZONE"), vec![1, 2, 10]);
    }

    #[test]
    fn numbered_values_stop_at_gap() {
        let e = env(&[
            ("SNAPDOG_API_APIKEY_1", "k1"),
            ("SNAPDOG_API_APIKEY_2", "k2"),
            ("SNAPDOG_API_APIKEY_4", "k4"),
        ]);
        assert_eq!(e.numbered_values("API_APIKEY"), vec!["k1", "k2"]);
    }

    #[test]
    fn csv_trimming() {
        let e = env(&[("SNAPDOG_SYSTEM_HEALTH_CHECKS_TAGS", "ready, live,,db ")]);
        assert_eq!(
            e.csv("SYSTEM_HEALTH_CHECKS_TAGS"),
            vec!["ready", "live", "db"]
        );
    }
}
