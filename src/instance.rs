//! The object every command acts on: a type, a resolved record and the host
//! it lives on.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::{
    error::{FleetError, FleetResult},
    host::{Host, LaunchSpec},
    record::{self, ConfigRecord, Value},
    registry::ComponentType,
    resolve::{self, InstanceName, template},
    session::FleetSession,
};

const LOG_PATH_TEMPLATE: &str = "{LogDir?Home}/{LogFile}";

#[derive(Debug, Clone)]
pub struct Instance {
    pub ct: &'static ComponentType,
    pub host: Host,
    pub record: ConfigRecord,
}

impl Instance {
    pub async fn load(
        session: &FleetSession,
        host: &Host,
        ct: &'static ComponentType,
        name: &str,
    ) -> FleetResult<Self> {
        let record = resolve::resolve(host, ct, name, session.user_for(host)).await?;
        Ok(Self {
            ct,
            host: host.clone(),
            record,
        })
    }

    /// A new, not yet persisted instance with default fields.
    pub fn new(session: &FleetSession, host: &Host, ct: &'static ComponentType, name: &str) -> Self {
        let record = resolve::defaults(ct, host.root(), name, session.user_for(host));
        Self {
            ct,
            host: host.clone(),
            record,
        }
    }

    pub fn name(&self) -> String {
        self.record.string(record::NAME)
    }

    pub fn home(&self) -> PathBuf {
        PathBuf::from(self.record.string(record::HOME))
    }

    /// `type name@host`, the prefix used for every per-instance message.
    pub fn display_name(&self) -> String {
        format!("{} {}@{}", self.ct.tag, self.name(), self.host.name())
    }

    pub fn disabled_marker(&self) -> PathBuf {
        self.home().join(self.ct.disabled_file())
    }

    pub async fn is_disabled(&self) -> FleetResult<bool> {
        self.host.exists(&self.disabled_marker()).await
    }

    /// The configured user, `None` when the record leaves it empty.
    pub fn configured_user(&self) -> Option<String> {
        self.record.non_empty(record::USER)
    }

    pub fn program(&self) -> PathBuf {
        PathBuf::from(self.record.string(record::PROGRAM))
    }

    pub fn log_path(&self) -> PathBuf {
        match template::evaluate(LOG_PATH_TEMPLATE, &self.record) {
            Ok(path) => PathBuf::from(path),
            Err(error) => {
                warn!(instance = %self.display_name(), %error, "falling back to default log file");
                self.home().join(format!("{}.txt", self.ct.tag))
            }
        }
    }

    /// Working directory, command line, environment and log file for a
    /// detached launch.
    pub fn launch_spec(&self) -> LaunchSpec {
        let mut env = Vec::new();
        let libpaths = self.record.string(record::LIBPATHS);
        if !libpaths.is_empty() {
            env.push(("LD_LIBRARY_PATH".to_string(), libpaths));
        }
        for entry in self.record.list(record::ENV) {
            match entry.split_once('=') {
                Some((key, value)) => env.push((key.to_string(), value.to_string())),
                None => debug!(instance = %self.display_name(), entry = %entry, "ignoring env entry without '='"),
            }
        }
        LaunchSpec {
            workdir: self.home(),
            program: self.program(),
            args: (self.ct.command)(&self.record),
            env,
            log_file: self.log_path(),
            user: self.configured_user(),
        }
    }

    pub async fn write_config(&self) -> FleetResult<()> {
        resolve::write_config(&self.host, self.ct, &self.record).await
    }

    /// Set a field and persist the record. `Home` is derived and cannot be
    /// set; `Env` values are appended. Computed fields are re-evaluated, so
    /// a new `Version` moves `Program` and `Libpaths` with it.
    pub async fn set_field(&mut self, key: &str, value: &str) -> FleetResult<()> {
        let field = self
            .record
            .field_name_ci(key)
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string());
        if record::DERIVED_FIELDS.contains(&field.as_str()) {
            return Err(FleetError::NotSupported(format!(
                "{field} is derived and cannot be set"
            )));
        }
        match field.as_str() {
            record::ENV => self.record.push_list(record::ENV, value),
            record::PORT | record::SSH_PORT => match value.parse::<i64>() {
                Ok(port) => self.record.set(field.as_str(), port),
                Err(_) => {
                    return Err(FleetError::NotSupported(format!(
                        "{field} must be a number, got '{value}'"
                    )));
                }
            },
            _ => self.record.set(field.as_str(), Value::from(value)),
        }
        resolve::refresh(self.ct, &mut self.record);
        self.write_config().await
    }
}

/// Instance directory names of `ct` on `host`. A missing type directory
/// means no instances.
pub async fn instance_names(host: &Host, ct: &ComponentType) -> FleetResult<Vec<String>> {
    let dir = ct.instances_dir(host.root());
    match host.read_dir(&dir).await {
        Ok(entries) => Ok(entries
            .into_iter()
            .filter(|entry| entry.is_dir && !entry.name.starts_with('.'))
            .map(|entry| entry.name)
            .collect()),
        Err(error) if error.is_not_found() => Ok(Vec::new()),
        Err(error) => Err(error),
    }
}

/// One selected instance, or why it could not be resolved.
#[derive(Debug)]
pub struct Selected {
    pub label: String,
    pub result: FleetResult<Instance>,
}

/// Resolve the instances a command names.
///
/// With names, each `name[@host]` is looked up under every type in `types`
/// on its host. Without names, every instance of every type in `types` on
/// every known host is selected.
pub async fn select(
    session: &FleetSession,
    types: &[&'static ComponentType],
    names: &[String],
) -> Vec<Selected> {
    let mut selected = Vec::new();
    if names.is_empty() {
        for host in session.hosts().await {
            for ct in types {
                select_all_on_host(session, &host, ct, &mut selected).await;
            }
        }
        return selected;
    }

    for raw in names {
        let parsed = InstanceName::parse(raw);
        let label = format!("{}@{}", parsed.name, parsed.host);
        let host = match session.host(&parsed.host).await {
            Ok(host) => host,
            Err(error) => {
                selected.push(Selected {
                    label,
                    result: Err(error),
                });
                continue;
            }
        };
        select_named(session, &host, types, &parsed, label, &mut selected).await;
    }
    selected
}

async fn select_all_on_host(
    session: &FleetSession,
    host: &Host,
    ct: &'static ComponentType,
    selected: &mut Vec<Selected>,
) {
    let names = match instance_names(host, ct).await {
        Ok(names) => names,
        Err(error) => {
            selected.push(Selected {
                label: format!("{} *@{}", ct.tag, host.name()),
                result: Err(error),
            });
            return;
        }
    };
    for name in names {
        selected.push(Selected {
            label: format!("{} {}@{}", ct.tag, name, host.name()),
            result: Instance::load(session, host, ct, &name).await,
        });
    }
}

async fn select_named(
    session: &FleetSession,
    host: &Host,
    types: &[&'static ComponentType],
    parsed: &InstanceName,
    label: String,
    selected: &mut Vec<Selected>,
) {
    if let [ct] = types {
        selected.push(Selected {
            label: format!("{} {label}", ct.tag),
            result: Instance::load(session, host, ct, &parsed.name).await,
        });
        return;
    }

    let mut found = false;
    for ct in types {
        let dir = ct.instance_dir(host.root(), &parsed.name);
        match host.exists(&dir).await {
            Ok(true) => {
                found = true;
                selected.push(Selected {
                    label: format!("{} {label}", ct.tag),
                    result: Instance::load(session, host, ct, &parsed.name).await,
                });
            }
            Ok(false) => {}
            Err(error) => {
                found = true;
                selected.push(Selected {
                    label: format!("{} {label}", ct.tag),
                    result: Err(error),
                });
            }
        }
    }
    if !found {
        let dir = host.root().join(&parsed.name);
        selected.push(Selected {
            label,
            result: Err(FleetError::not_found(host.name(), &dir)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::PROBE,
        session::testing::{self, current_user, session as test_session},
    };
    use std::fs;
    use tempfile::TempDir;

    fn session(root: &TempDir) -> FleetSession {
        test_session(root.path())
    }

    #[tokio::test]
    async fn launch_spec_carries_env_and_log_path() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        let mut inst = Instance::new(&session, session.local(), &PROBE, "p1");
        inst.record.set(record::PORT, 7036_i64);
        inst.record.push_list(record::ENV, "TZ=UTC");

        let spec = inst.launch_spec();
        assert_eq!(spec.workdir, inst.home());
        assert_eq!(spec.args, vec!["p1", "-port", "7036"]);
        assert_eq!(spec.log_file, inst.home().join("probe.txt"));
        assert!(spec.env.contains(&("TZ".to_string(), "UTC".to_string())));
        assert!(spec.env.iter().any(|(key, _)| key == "LD_LIBRARY_PATH"));
        assert_eq!(spec.user, Some(current_user()));

        inst.record.set(record::LOG_DIR, "/var/log/fleet");
        assert_eq!(
            inst.launch_spec().log_file,
            PathBuf::from("/var/log/fleet/probe.txt")
        );
        Ok(())
    }

    #[tokio::test]
    async fn set_field_persists_and_refuses_home() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        let mut inst = Instance::new(&session, session.local(), &PROBE, "p1");
        fs::create_dir_all(inst.home())?;

        inst.set_field("port", "7101").await?;
        inst.set_field("Env", "TZ=UTC").await?;
        let error = inst.set_field("home", "/tmp").await.unwrap_err();
        assert!(error.to_string().contains("derived"));

        let reloaded = Instance::load(&session, session.local(), &PROBE, "p1").await?;
        assert_eq!(reloaded.record.port(), Some(7101));
        assert_eq!(reloaded.record.list(record::ENV), &["TZ=UTC".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn set_version_moves_program_after_reload() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        let mut inst = Instance::new(&session, session.local(), &PROBE, "p1");
        fs::create_dir_all(inst.home())?;
        inst.write_config().await?;

        inst.set_field("Version", "6.1.0").await?;
        let packages = root.path().join("packages/probe/6.1.0");
        assert_eq!(inst.program(), packages.join("probe"));

        let reloaded = Instance::load(&session, session.local(), &PROBE, "p1").await?;
        assert_eq!(reloaded.program(), packages.join("probe"));
        assert_eq!(
            reloaded.record.string(record::LIBPATHS),
            packages.join("lib64").display().to_string()
        );

        let stored: serde_json::Value =
            serde_json::from_slice(&fs::read(inst.home().join("probe.json"))?)?;
        assert_eq!(stored["Version"], "6.1.0");
        assert!(stored.get("Program").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn remote_instances_default_to_the_login_user() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        let remote = testing::remote_host(root.path(), "ops");

        let inst = Instance::new(&session, &remote, &PROBE, "p1");
        assert_eq!(inst.configured_user().as_deref(), Some("ops"));
        assert_eq!(inst.display_name(), "probe p1@lab");
        Ok(())
    }

    #[tokio::test]
    async fn select_without_names_walks_every_instance() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        for name in ["p1", "p2"] {
            fs::create_dir_all(PROBE.instance_dir(root.path(), name))?;
        }
        let selected = select(&session, &[&PROBE], &[]).await;
        let labels: Vec<_> = selected.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["probe p1@localhost", "probe p2@localhost"]);
        assert!(selected.iter().all(|s| s.result.is_ok()));
        Ok(())
    }

    #[tokio::test]
    async fn select_by_name_searches_types() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session(&root);
        fs::create_dir_all(PROBE.instance_dir(root.path(), "p1"))?;
        let types = session.registry().real_types();

        let selected = select(&session, &types, &["p1".to_string(), "ghost".to_string()]).await;
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].label, "probe p1@localhost");
        assert!(selected[0].result.is_ok());
        assert!(selected[1].result.as_ref().is_err_and(|e| e.is_not_found()));
        Ok(())
    }
}
