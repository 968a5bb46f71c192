//! Resolved per-instance configuration: a flat field map, sorted by field
//! name.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const NAME: &str = "Name";
pub const ROOT: &str = "Root";
pub const HOME: &str = "Home";
pub const USER: &str = "User";
pub const PORT: &str = "Port";
pub const ENV: &str = "Env";
pub const BINARY: &str = "Binary";
pub const PROGRAM: &str = "Program";
pub const VERSION: &str = "Version";
pub const INSTALL: &str = "Install";
pub const LIBPATHS: &str = "Libpaths";
pub const LOG_DIR: &str = "LogDir";
pub const LOG_FILE: &str = "LogFile";
pub const OPTIONS: &str = "Options";
pub const HOSTNAME: &str = "Hostname";
pub const SSH_PORT: &str = "SshPort";
pub const USERNAME: &str = "Username";
pub const REMOTE_ROOT: &str = "RemoteRoot";

/// Fields derived from the host or directory layout. They are recomputed on
/// every resolution and never written to disk.
pub const DERIVED_FIELDS: &[&str] = &[ROOT, HOME];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Int(_) => false,
            Value::Str(value) => value.is_empty(),
            Value::List(values) => values.is_empty(),
        }
    }

    /// Render as a single string; lists are space separated.
    pub fn render(&self) -> String {
        match self {
            Value::Int(value) => value.to_string(),
            Value::Str(value) => value.clone(),
            Value::List(values) => values.join(" "),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u16> for Value {
    fn from(value: u16) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<Vec<String>> for Value {
    fn from(values: Vec<String>) -> Self {
        Value::List(values)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigRecord {
    fields: BTreeMap<String, Value>,
    /// Fields filled in from a default template rather than set explicitly.
    /// They are recomputed on every resolution and never written to disk.
    #[serde(skip)]
    computed: BTreeSet<String>,
}

impl ConfigRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// String form of a field, empty when the field is absent.
    pub fn string(&self, key: &str) -> String {
        self.fields.get(key).map(Value::render).unwrap_or_default()
    }

    /// Non-empty string form of a field.
    pub fn non_empty(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .filter(|value| !value.is_empty())
            .map(Value::render)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Int(value) => Some(*value),
            Value::Str(value) => value.trim().parse().ok(),
            Value::List(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.int(PORT)
            .and_then(|value| u16::try_from(value).ok())
            .filter(|port| *port != 0)
    }

    pub fn list(&self, key: &str) -> &[String] {
        match self.fields.get(key) {
            Some(Value::List(values)) => values,
            _ => &[],
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.computed.remove(&key);
        self.fields.insert(key, value.into());
    }

    /// Set a field from its default template.
    pub fn set_computed(&mut self, key: &str, value: impl Into<Value>) {
        self.computed.insert(key.to_string());
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn is_computed(&self, key: &str) -> bool {
        self.computed.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.computed.remove(key);
        self.fields.remove(key)
    }

    /// Append to a list field, replacing an existing entry with the same
    /// `KEY=` prefix so environment overrides stay unique.
    pub fn push_list(&mut self, key: &str, item: impl Into<String>) {
        let item = item.into();
        let mut values = match self.fields.remove(key) {
            Some(Value::List(values)) => values,
            Some(other) if !other.is_empty() => vec![other.render()],
            _ => Vec::new(),
        };
        if let Some((name, _)) = item.split_once('=') {
            let prefix = format!("{name}=");
            values.retain(|existing| !existing.starts_with(&prefix));
        }
        values.push(item);
        self.computed.remove(key);
        self.fields.insert(key.to_string(), Value::List(values));
    }

    /// Look up a field name ignoring ASCII case.
    pub fn field_name_ci(&self, key: &str) -> Option<&str> {
        self.fields
            .keys()
            .find(|name| name.eq_ignore_ascii_case(key))
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Copy of the record as written to disk: explicit fields only, never
    /// derived or computed ones.
    pub fn persistable(&self) -> ConfigRecord {
        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| !DERIVED_FIELDS.contains(&key.as_str()))
            .filter(|(key, _)| !self.computed.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        ConfigRecord {
            fields,
            computed: BTreeSet::new(),
        }
    }
}
