//! Solver option sets.
//!
//! The `[equilibration]` and `[production]` sections are free-form flag/value
//! pairs handed straight to the Monte-Carlo solver. Production inherits every
//! equilibration setting it does not override.

use std::fmt;

use crate::error::ConfigError;

/// A single option value as it appears on the solver command line.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// Passed as `<flag> <value>`.
    Text(String),
    /// `true` emits the bare flag, `false` omits it.
    Switch(bool),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Text(text) => f.write_str(text),
            OptionValue::Switch(on) => write!(f, "{}", on),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<bool> for OptionValue {
    fn from(value: bool) -> Self {
        OptionValue::Switch(value)
    }
}

/// Ordered flag name → value mapping.
///
/// Insertion order is kept so that generated command lines are reproducible.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSet {
    entries: Vec<(String, OptionValue)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a configuration section, keeping the document's key order.
    pub fn from_table(section: &'static str, table: &toml::Table) -> Result<Self, ConfigError> {
        let mut set = OptionSet::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(text) => OptionValue::Text(text.clone()),
                toml::Value::Integer(n) => OptionValue::Text(n.to_string()),
                // `{:?}` keeps `1.0` and `1e-20` as written.
                toml::Value::Float(x) => OptionValue::Text(format!("{:?}", x)),
                toml::Value::Boolean(on) => OptionValue::Switch(*on),
                other => {
                    return Err(ConfigError::invalid(
                        section,
                        key.clone(),
                        format!("expected a scalar, found {}", other.type_str()),
                    ))
                }
            };
            if key.trim_start_matches('-').is_empty() {
                return Err(ConfigError::invalid(section, key.clone(), "empty flag name"));
            }
            set.insert(key.clone(), value);
        }
        Ok(set)
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<OptionValue>> FromIterator<(K, V)> for OptionSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = OptionSet::new();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// Effective production options: equilibration settings overridden by production.
pub fn merge(equilibration: &OptionSet, production: &OptionSet) -> OptionSet {
    let mut merged = equilibration.clone();
    for (key, value) in production.iter() {
        merged.insert(key, value.clone());
    }
    merged
}

/// A flag ready for the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedFlag {
    pub flag: String,
    pub value: Option<String>,
}

/// Apply the dash convention: `-x` for one-character keys, `--name` otherwise.
///
/// Keys already written with a leading dash are passed through untouched.
/// Disabled switches are dropped.
pub fn format_flags(options: &OptionSet) -> Vec<FormattedFlag> {
    options
        .iter()
        .filter_map(|(key, value)| {
            let flag = if key.starts_with('-') {
                key.to_string()
            } else if key.chars().count() == 1 {
                format!("-{}", key)
            } else {
                format!("--{}", key)
            };
            match value {
                OptionValue::Text(text) => Some(FormattedFlag {
                    flag,
                    value: Some(text.clone()),
                }),
                OptionValue::Switch(true) => Some(FormattedFlag { flag, value: None }),
                OptionValue::Switch(false) => None,
            }
        })
        .collect()
}

/// Flatten formatted flags into argv order.
pub fn to_args(flags: &[FormattedFlag]) -> Vec<String> {
    let mut args = Vec::with_capacity(flags.len() * 2);
    for flag in flags {
        args.push(flag.flag.clone());
        if let Some(value) = &flag.value {
            args.push(value.clone());
        }
    }
    args
}
