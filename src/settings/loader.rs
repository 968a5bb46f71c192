use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use super::{
    error::{SettingsError, SettingsResult},
    model::{RestartSettings, Settings, SshSettings, TypeSettings},
    raw::{RawRestartSettings, RawSettings, RawSshSettings, RawTypeSettings},
};
use crate::ports;

pub const SETTINGS_PATH_VAR: &str = "FLEETCTL_CONFIG";
pub const ROOT_VAR: &str = "FLEETCTL_ROOT";

/// Settings from `$FLEETCTL_CONFIG`, else the per-user config directory. A
/// missing default file yields default settings.
pub fn load_default() -> SettingsResult<Settings> {
    if let Some(path) = env::var_os(SETTINGS_PATH_VAR) {
        return load_from_path(PathBuf::from(path));
    }
    match default_settings_path() {
        Some(path) if path.exists() => load_from_path(path),
        _ => Ok(Settings::default()),
    }
}

pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fleetctl").join("fleetctl.toml"))
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> SettingsResult<Settings> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|source| SettingsError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(&contents)
}

pub fn load_from_str(contents: &str) -> SettingsResult<Settings> {
    let raw: RawSettings = toml::from_str(contents)?;
    convert_raw_settings(raw)
}

/// The install root: the environment override wins over the settings file.
pub fn resolve_root(settings: &Settings) -> SettingsResult<PathBuf> {
    let root = env::var_os(ROOT_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| settings.root.clone())
        .ok_or(SettingsError::MissingRoot { var: ROOT_VAR })?;
    if !root.is_absolute() {
        return Err(SettingsError::RelativeRoot(root));
    }
    Ok(root)
}

fn convert_raw_settings(raw: RawSettings) -> SettingsResult<Settings> {
    let RawSettings {
        root,
        default_user,
        restart,
        ssh,
        types,
    } = raw;

    Ok(Settings {
        root: root.map(|value| expand_home(&value)),
        default_user: default_user.filter(|user| !user.trim().is_empty()),
        restart: convert_restart_settings(restart),
        ssh: convert_ssh_settings(ssh),
        types: convert_type_settings(types)?,
    })
}

fn convert_restart_settings(raw: Option<RawRestartSettings>) -> RestartSettings {
    let mut settings = RestartSettings::default();
    if let Some(running_only) = raw.and_then(|raw| raw.running_only) {
        settings.running_only = running_only;
    }
    settings
}

fn convert_ssh_settings(raw: Option<RawSshSettings>) -> SshSettings {
    let mut settings = SshSettings::default();
    if let Some(raw) = raw {
        settings.known_hosts = raw.known_hosts.map(|value| expand_home(&value));
        if let Some(files) = raw.identity_files {
            settings.identity_files = files
                .into_vec()
                .iter()
                .map(|value| expand_home(value))
                .collect();
        }
    }
    settings
}

fn convert_type_settings(
    raw: BTreeMap<String, RawTypeSettings>,
) -> SettingsResult<BTreeMap<String, TypeSettings>> {
    let mut types = BTreeMap::new();
    for (tag, raw) in raw {
        let port_range = match raw.port_range {
            Some(value) => {
                if ports::parse_ranges(&value).is_empty() {
                    return Err(SettingsError::InvalidPortRange { tag, value });
                }
                Some(value)
            }
            None => None,
        };
        let clean = raw
            .clean
            .map(|list| validate_globs(&tag, list.into_vec()))
            .transpose()?;
        let purge = raw
            .purge
            .map(|list| validate_globs(&tag, list.into_vec()))
            .transpose()?;
        types.insert(
            tag,
            TypeSettings {
                port_range,
                clean,
                purge,
            },
        );
    }
    Ok(types)
}

fn validate_globs(tag: &str, patterns: Vec<String>) -> SettingsResult<Vec<String>> {
    for pattern in &patterns {
        if let Err(error) = glob::Pattern::new(pattern) {
            return Err(SettingsError::InvalidGlob {
                tag: tag.to_string(),
                pattern: pattern.clone(),
                reason: error.msg.to_string(),
            });
        }
    }
    Ok(patterns)
}

fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_sample_settings() {
        let toml = r#"
root = "/opt/fleet"
default_user = "fleet"

[restart]
running_only = false

[ssh]
known_hosts = "/etc/ssh/ssh_known_hosts"
identity_files = "/keys/one, /keys/two"

[types.probe]
port_range = "7036,7100-"
clean = ["*.old", "*.core"]
purge = "probe.txt, *.snooze"
"#;
        let settings = load_from_str(toml).expect("settings parse");
        assert_eq!(settings.root, Some(PathBuf::from("/opt/fleet")));
        assert_eq!(settings.default_user.as_deref(), Some("fleet"));
        assert!(!settings.restart.running_only);
        assert_eq!(
            settings.ssh.known_hosts,
            Some(PathBuf::from("/etc/ssh/ssh_known_hosts"))
        );
        assert_eq!(
            settings.ssh.identity_files,
            vec![PathBuf::from("/keys/one"), PathBuf::from("/keys/two")]
        );

        let probe = settings.for_type("probe").expect("probe overrides");
        assert_eq!(probe.port_range.as_deref(), Some("7036,7100-"));
        assert_eq!(
            probe.clean.as_deref(),
            Some(&["*.old".to_string(), "*.core".to_string()][..])
        );
        assert_eq!(
            probe.purge.as_deref(),
            Some(&["probe.txt".to_string(), "*.snooze".to_string()][..])
        );
    }

    #[test]
    fn empty_settings_use_defaults() {
        let settings = load_from_str("").expect("settings parse");
        assert!(settings.root.is_none());
        assert!(settings.restart.running_only);
        assert!(settings.types.is_empty());
    }

    #[test]
    fn rejects_port_range_without_ports() {
        let toml = r#"
[types.collector]
port_range = "abc,9000-8000"
"#;
        match load_from_str(toml).unwrap_err() {
            SettingsError::InvalidPortRange { tag, .. } => assert_eq!(tag, "collector"),
            other => panic!("expected InvalidPortRange, got {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_glob() {
        let toml = r#"
[types.probe]
clean = ["[unclosed"]
"#;
        match load_from_str(toml).unwrap_err() {
            SettingsError::InvalidGlob { pattern, .. } => assert_eq!(pattern, "[unclosed"),
            other => panic!("expected InvalidGlob, got {other:?}"),
        }
    }

    #[test]
    fn load_from_path_reads_file() {
        let mut temp = NamedTempFile::new().expect("temp file");
        writeln!(temp, "root = \"/srv/fleet\"").unwrap();
        let settings = load_from_path(temp.path()).expect("settings load");
        assert_eq!(settings.root, Some(PathBuf::from("/srv/fleet")));
    }

    #[test]
    fn load_from_path_missing_file_returns_read_failure() {
        let error = load_from_path("/nonexistent/fleetctl/fleetctl.toml").unwrap_err();
        match error {
            SettingsError::ReadFailure { .. } => {}
            other => panic!("expected ReadFailure, got {other:?}"),
        }
    }
}
