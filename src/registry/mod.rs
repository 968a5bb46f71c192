//! Component type descriptors and the registry that looks them up by alias.

mod types;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::record::ConfigRecord;

pub use types::{COLLECTOR, FILEAGENT, HOST, LICD, PROBE, SANPROBE, WEBCONSOLE};

/// A field default: `template` is evaluated against the fields resolved so
/// far and stored under `field`.
#[derive(Debug, Clone, Copy)]
pub struct DefaultExpr {
    pub field: &'static str,
    pub template: &'static str,
}

/// Fleet-wide tunables for a type. Settings may override each one.
#[derive(Debug, Clone, Copy)]
pub struct Globals {
    pub port_range: &'static str,
    pub clean: &'static [&'static str],
    pub purge: &'static [&'static str],
}

#[derive(Debug)]
pub struct ComponentType {
    pub tag: &'static str,
    pub aliases: &'static [&'static str],
    /// Types listed together with this one, e.g. `ls probe` includes
    /// sanprobes.
    pub related: &'static [&'static str],
    /// Whether instances run a process. Virtual types only hold records.
    pub real: bool,
    /// Fields set before any default is evaluated.
    pub seeds: &'static [(&'static str, &'static str)],
    pub defaults: &'static [DefaultExpr],
    /// Directories under the install root created by `add`.
    pub directories: &'static [&'static str],
    /// Prefix of recognised keys in the legacy `.rc` file.
    pub legacy_prefix: &'static str,
    /// Legacy key suffix to field name.
    pub legacy_keys: &'static [(&'static str, &'static str)],
    pub globals: Globals,
    /// Arguments passed to the binary. The instance name is always one of
    /// them so process discovery can find it.
    pub command: fn(&ConfigRecord) -> Vec<String>,
}

impl ComponentType {
    pub fn config_file(&self) -> String {
        format!("{}.json", self.tag)
    }

    pub fn legacy_file(&self) -> String {
        format!("{}.rc", self.tag)
    }

    pub fn disabled_file(&self) -> String {
        format!("{}.disabled", self.tag)
    }

    /// `root/<tag>/<tag>s`, the parent of every instance directory.
    pub fn instances_dir(&self, root: &Path) -> PathBuf {
        root.join(self.tag).join(format!("{}s", self.tag))
    }

    pub fn instance_dir(&self, root: &Path, name: &str) -> PathBuf {
        self.instances_dir(root).join(name)
    }

    pub fn legacy_field(&self, key: &str) -> Option<&'static str> {
        let suffix = key.strip_prefix(self.legacy_prefix)?;
        self.legacy_keys
            .iter()
            .find(|(legacy, _)| *legacy == suffix)
            .map(|(_, field)| *field)
    }

    fn matches(&self, name: &str) -> bool {
        self.aliases
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("alias '{alias}' of type '{tag}' is already used by type '{existing}'")]
    AliasOverlap {
        alias: &'static str,
        tag: &'static str,
        existing: &'static str,
    },
}

/// Registered types, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    types: Vec<&'static ComponentType>,
}

impl Registry {
    /// Every built-in type.
    pub fn builtin() -> Result<Self, RegistryError> {
        let mut registry = Registry::default();
        for ct in types::ALL {
            registry.register(ct)?;
        }
        Ok(registry)
    }

    /// Insert a descriptor, replacing one with the same tag. An alias that
    /// another tag already claims is rejected.
    pub fn register(&mut self, ct: &'static ComponentType) -> Result<(), RegistryError> {
        for existing in self.types.iter().filter(|existing| existing.tag != ct.tag) {
            if let Some(&alias) = ct.aliases.iter().find(|alias| existing.matches(alias)) {
                return Err(RegistryError::AliasOverlap {
                    alias,
                    tag: ct.tag,
                    existing: existing.tag,
                });
            }
        }
        match self.types.iter_mut().find(|existing| existing.tag == ct.tag) {
            Some(slot) => *slot = ct,
            None => self.types.push(ct),
        }
        Ok(())
    }

    /// Find the type accepting `name` as an alias, ignoring case.
    pub fn lookup(&self, name: &str) -> Option<&'static ComponentType> {
        self.types.iter().copied().find(|ct| ct.matches(name))
    }

    pub fn get(&self, tag: &str) -> Option<&'static ComponentType> {
        self.types.iter().copied().find(|ct| ct.tag == tag)
    }

    /// Process-bearing types, in registration order.
    pub fn real_types(&self) -> Vec<&'static ComponentType> {
        self.types.iter().copied().filter(|ct| ct.real).collect()
    }

    /// The type followed by its related types.
    pub fn with_related(&self, ct: &'static ComponentType) -> Vec<&'static ComponentType> {
        let mut out = vec![ct];
        out.extend(ct.related.iter().filter_map(|tag| self.get(tag)));
        out
    }

    /// Whether `name` is a type tag or alias and so unusable as an
    /// instance name.
    pub fn is_reserved(&self, name: &str) -> bool {
        self.types
            .iter()
            .any(|ct| ct.tag.eq_ignore_ascii_case(name) || ct.matches(name))
    }
}
