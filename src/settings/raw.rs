use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};

#[derive(Debug, Default, Deserialize)]
pub struct RawSettings {
    pub root: Option<String>,
    pub default_user: Option<String>,
    #[serde(default)]
    pub restart: Option<RawRestartSettings>,
    #[serde(default)]
    pub ssh: Option<RawSshSettings>,
    #[serde(default)]
    pub types: BTreeMap<String, RawTypeSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawRestartSettings {
    pub running_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawSshSettings {
    pub known_hosts: Option<String>,
    #[serde(default)]
    pub identity_files: Option<PatternList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawTypeSettings {
    pub port_range: Option<String>,
    #[serde(default)]
    pub clean: Option<PatternList>,
    #[serde(default)]
    pub purge: Option<PatternList>,
}

/// Either a TOML array of strings or one comma-separated string.
#[derive(Debug, Default)]
pub struct PatternList(pub Vec<String>);

impl PatternList {
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<'de> Deserialize<'de> for PatternList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = PatternList;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a list of strings or a comma-separated string")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let items = value
                    .split(',')
                    .map(|item| item.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();
                Ok(PatternList(items))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<String>()? {
                    if !item.trim().is_empty() {
                        items.push(item.trim().to_string());
                    }
                }
                Ok(PatternList(items))
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}
