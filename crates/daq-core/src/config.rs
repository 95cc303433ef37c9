//! Immutable key/value settings handed to a component on Configure.
//!
//! A [`Configuration`] is a flat `String -> String` map tagged with the name
//! of the section it was taken from. Components receive it as a
//! [`ConfigurationRef`] and read it through typed accessors. On the next
//! Configure the whole object is replaced, never patched, so a reader always
//! sees either the old or the new settings.
//!
//! # Example
//!
//! ```rust
//! use daq_core::config::Configuration;
//!
//! let text = r#"
//! [producer.ni0]
//! NiIPaddr = "192.168.1.10"
//! NumBoards = 2
//! "#;
//! let conf = Configuration::from_toml(text, "producer.ni0").unwrap();
//! assert_eq!(conf.get("NumBoards", 6u32), 2);
//! assert_eq!(conf.get("TriggerType", 1u32), 1);
//! ```

use crate::error::{DaqError, DaqResult};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

/// Shared read-only handle to a configuration.
pub type ConfigurationRef = Arc<Configuration>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    name: String,
    values: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn from_pairs<I, K, V>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        Self {
            name: name.into(),
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        }
    }

    /// Parse TOML text and take the table at the dotted `section` path.
    ///
    /// An empty `section` selects the top-level table. Scalars are flattened
    /// to their string form, arrays of scalars are joined with `,`, nested
    /// tables are skipped.
    pub fn from_toml(text: &str, section: &str) -> DaqResult<Self> {
        let root: toml::Table = toml::from_str(text)?;

        let mut table = &root;
        if !section.is_empty() {
            for part in section.split('.') {
                table = match table.get(part) {
                    Some(toml::Value::Table(t)) => t,
                    Some(_) => {
                        return Err(DaqError::Configuration(format!(
                            "section '{}' is not a table",
                            section
                        )))
                    }
                    None => {
                        return Err(DaqError::Configuration(format!(
                            "section '{}' not found",
                            section
                        )))
                    }
                };
            }
        }

        let values = table
            .iter()
            .filter_map(|(k, v)| flatten(v).map(|s| (k.clone(), s)))
            .collect();

        Ok(Self {
            name: section.to_string(),
            values,
        })
    }

    /// Section name this configuration was loaded from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Typed lookup with a fallback.
    ///
    /// A missing key yields `default` silently; a present but unparsable
    /// value yields `default` and logs a warning.
    pub fn get<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.try_get(key) {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(section = %self.name, key, error = %e, "using default");
                default
            }
        }
    }

    /// Typed lookup that reports unparsable values.
    pub fn try_get<T>(&self, key: &str) -> DaqResult<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| {
                DaqError::Configuration(format!(
                    "[{}] {} = '{}': {}",
                    self.name, key, raw, e
                ))
            }),
        }
    }

    /// Typed lookup for a key that must be present.
    pub fn require<T>(&self, key: &str) -> DaqResult<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.try_get(key)?.ok_or_else(|| {
            DaqError::Configuration(format!("[{}] missing required key '{}'", self.name, key))
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_ref(self) -> ConfigurationRef {
        Arc::new(self)
    }
}

fn flatten(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(items) => {
            let parts: Option<Vec<String>> = items
                .iter()
                .map(|v| match v {
                    toml::Value::Array(_) | toml::Value::Table(_) => None,
                    other => flatten(other),
                })
                .collect();
            parts.map(|p| p.join(","))
        }
        toml::Value::Table(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"
        top = "level"

        [producer.ni0]
        NiIPaddr = "10.0.0.2"
        NumBoards = 2
        MimosaEn = [true, false]
        Threshold = 1.5

        [producer.ni0.nested]
        ignored = 1
    "#;

    #[test]
    fn selects_dotted_section() {
        let conf = Configuration::from_toml(TEXT, "producer.ni0").unwrap();
        assert_eq!(conf.name(), "producer.ni0");
        assert_eq!(conf.get_str("NiIPaddr"), Some("10.0.0.2"));
        assert_eq!(conf.get_str("MimosaEn"), Some("true,false"));
        assert!(!conf.contains("nested"));
        assert!(!conf.contains("top"));
    }

    #[test]
    fn empty_section_is_root() {
        let conf = Configuration::from_toml(TEXT, "").unwrap();
        assert_eq!(conf.get_str("top"), Some("level"));
        assert_eq!(conf.len(), 1);
    }

    #[test]
    fn missing_section_is_a_configuration_error() {
        let err = Configuration::from_toml(TEXT, "producer.tlu").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn typed_accessors() {
        let conf = Configuration::from_pairs("t", [("NumBoards", "two"), ("Port", "49248")]);
        assert_eq!(conf.get("Port", 0u16), 49248);
        assert_eq!(conf.get("NumBoards", 6u32), 6);
        assert!(conf.try_get::<u32>("NumBoards").is_err());
        assert_eq!(conf.try_get::<u32>("Missing").unwrap(), None);
        assert!(conf.require::<u16>("Missing").is_err());
        assert_eq!(conf.require::<u16>("Port").unwrap(), 49248);
    }
}
