use std::{collections::BTreeMap, path::PathBuf};

/// Fleet-wide settings, read once per invocation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub root: Option<PathBuf>,
    pub default_user: Option<String>,
    pub restart: RestartSettings,
    pub ssh: SshSettings,
    pub types: BTreeMap<String, TypeSettings>,
}

impl Settings {
    pub fn for_type(&self, tag: &str) -> Option<&TypeSettings> {
        self.types.get(tag)
    }
}

#[derive(Debug, Clone)]
pub struct RestartSettings {
    /// `restart` without `--all` only starts instances that were running.
    pub running_only: bool,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self { running_only: true }
    }
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub known_hosts: Option<PathBuf>,
    pub identity_files: Vec<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));
        let identity_files = ssh_dir
            .map(|dir| {
                ["id_ed25519", "id_ecdsa", "id_rsa"]
                    .iter()
                    .map(|name| dir.join(name))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            known_hosts: None,
            identity_files,
        }
    }
}

/// Per-type overrides of the registry's global tunables.
#[derive(Debug, Clone, Default)]
pub struct TypeSettings {
    pub port_range: Option<String>,
    pub clean: Option<Vec<String>>,
    pub purge: Option<Vec<String>>,
}
