//! Per-invocation context: settings, the type registry and the host
//! connections opened while a command runs.

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use nix::unistd::{self, User};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::{FleetError, FleetResult},
    host::{Host, HostName, LocalHost, RemoteHost, RemoteSpec},
    record,
    registry::{ComponentType, HOST, Registry},
    resolve,
    settings::{self, Settings, SettingsError},
};

#[derive(Debug)]
pub struct FleetSession {
    settings: Settings,
    registry: Registry,
    local: Host,
    default_user: String,
    remotes: Mutex<HashMap<String, Host>>,
}

impl FleetSession {
    /// Resolve the install root and default user. Either one missing aborts
    /// the invocation before any instance is touched.
    pub fn new(settings: Settings, registry: Registry) -> Result<Self, SettingsError> {
        let root = settings::resolve_root(&settings)?;
        let default_user = match settings.default_user.clone() {
            Some(user) => user,
            None => invoking_user().ok_or(SettingsError::MissingUser)?,
        };
        Ok(Self::with_root(settings, registry, root, default_user))
    }

    pub fn with_root(
        settings: Settings,
        registry: Registry,
        root: PathBuf,
        default_user: String,
    ) -> Self {
        Self {
            settings,
            registry,
            local: Host::Local(LocalHost::new(root)),
            default_user,
            remotes: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn local(&self) -> &Host {
        &self.local
    }

    pub fn default_user(&self) -> &str {
        &self.default_user
    }

    /// `User` given to instances on `host` that do not set one. Remote
    /// processes run as the SSH login user.
    pub fn user_for<'a>(&'a self, host: &'a Host) -> &'a str {
        match host {
            Host::Local(_) => &self.default_user,
            Host::Remote(_) => host.login_user(),
        }
    }

    /// The host for `name`. Remote hosts are built from their `host`
    /// instance on first use and cached until [`FleetSession::close`].
    pub async fn host(&self, name: &HostName) -> FleetResult<Host> {
        let remote = match name {
            HostName::Local => return Ok(self.local.clone()),
            HostName::Remote(remote) => remote,
        };
        if let Some(host) = self.remotes.lock().get(remote) {
            return Ok(host.clone());
        }
        resolve::check_name(remote)?;

        let record = resolve::resolve(&self.local, &HOST, remote, &self.default_user).await?;
        let root = record
            .non_empty(record::REMOTE_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.local.root().to_path_buf());
        let port = record
            .int(record::SSH_PORT)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
            .unwrap_or(22);
        let spec = RemoteSpec {
            name: remote.clone(),
            hostname: record
                .non_empty(record::HOSTNAME)
                .unwrap_or_else(|| remote.clone()),
            port,
            username: record
                .non_empty(record::USERNAME)
                .unwrap_or_else(|| self.default_user.clone()),
            root,
            known_hosts: self.settings.ssh.known_hosts.clone(),
            identity_files: self.settings.ssh.identity_files.clone(),
        };
        debug!(host = %remote, hostname = %spec.hostname, port, "registered remote host");
        let host = Host::Remote(Arc::new(RemoteHost::new(spec)));
        let mut remotes = self.remotes.lock();
        Ok(remotes.entry(remote.clone()).or_insert(host).clone())
    }

    /// The local host followed by every configured remote host. A host
    /// record that cannot be read is logged and left out.
    pub async fn hosts(&self) -> Vec<Host> {
        let mut hosts = vec![self.local.clone()];
        let names = match crate::instance::instance_names(&self.local, &HOST).await {
            Ok(names) => names,
            Err(error) => {
                warn!(%error, "cannot list remote hosts");
                return hosts;
            }
        };
        for name in names {
            match self.host(&HostName::Remote(name.clone())).await {
                Ok(host) => hosts.push(host),
                Err(error) => warn!(host = %name, %error, "skipping unreadable host"),
            }
        }
        hosts
    }

    pub fn port_range(&self, ct: &ComponentType) -> String {
        self.settings
            .for_type(ct.tag)
            .and_then(|overrides| overrides.port_range.clone())
            .unwrap_or_else(|| ct.globals.port_range.to_string())
    }

    pub fn clean_globs(&self, ct: &ComponentType) -> Vec<String> {
        self.settings
            .for_type(ct.tag)
            .and_then(|overrides| overrides.clean.clone())
            .unwrap_or_else(|| ct.globals.clean.iter().map(|s| s.to_string()).collect())
    }

    pub fn purge_globs(&self, ct: &ComponentType) -> Vec<String> {
        self.settings
            .for_type(ct.tag)
            .and_then(|overrides| overrides.purge.clone())
            .unwrap_or_else(|| ct.globals.purge.iter().map(|s| s.to_string()).collect())
    }

    pub fn lookup_type(&self, name: &str) -> FleetResult<&'static ComponentType> {
        self.registry
            .lookup(name)
            .ok_or_else(|| FleetError::NotSupported(format!("unknown component type '{name}'")))
    }

    /// Tear down every remote session. Safe to call more than once.
    pub async fn close(&self) {
        let remotes: Vec<Host> = self.remotes.lock().drain().map(|(_, host)| host).collect();
        for host in remotes {
            host.close().await;
        }
    }
}

fn invoking_user() -> Option<String> {
    User::from_uid(unistd::geteuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;

    use super::*;

    /// The account tests run as, so privileged runs can chown to it.
    pub(crate) fn current_user() -> String {
        invoking_user().unwrap_or_else(|| "root".to_string())
    }

    /// A remote host that is never connected to: tests only use it for
    /// naming, ownership and operations served by a fake process table.
    pub(crate) fn remote_host(root: &Path, username: &str) -> Host {
        Host::Remote(Arc::new(RemoteHost::new(RemoteSpec {
            name: "lab".to_string(),
            hostname: "lab.example.net".to_string(),
            port: 22,
            username: username.to_string(),
            root: root.to_path_buf(),
            known_hosts: None,
            identity_files: Vec::new(),
        })))
    }

    pub(crate) fn session(root: &Path) -> FleetSession {
        FleetSession::with_root(
            Settings::default(),
            Registry::builtin().expect("builtin registry"),
            root.to_path_buf(),
            current_user(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TypeSettings;
    use std::fs;
    use tempfile::TempDir;

    fn session_with(settings: Settings, root: &TempDir) -> FleetSession {
        FleetSession::with_root(
            settings,
            Registry::builtin().expect("builtin registry"),
            root.path().to_path_buf(),
            "fleet".to_string(),
        )
    }

    #[tokio::test]
    async fn remote_hosts_come_from_host_records() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session_with(Settings::default(), &root);
        let home = HOST.instance_dir(root.path(), "lab");
        fs::create_dir_all(&home)?;
        fs::write(
            home.join("host.json"),
            r#"{"Hostname": "lab.example.net", "SshPort": 2222, "RemoteRoot": "/srv/fleet"}"#,
        )?;

        let host = session.host(&HostName::Remote("lab".to_string())).await?;
        assert_eq!(host.name(), "lab");
        assert_eq!(host.root(), PathBuf::from("/srv/fleet").as_path());
        assert_eq!(host.login_user(), "fleet");

        let hosts = session.hosts().await;
        let names: Vec<_> = hosts.iter().map(Host::name).collect();
        assert_eq!(names, vec!["localhost", "lab"]);

        session.close().await;
        session.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn path_like_host_names_are_refused() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session_with(Settings::default(), &root);
        fs::create_dir_all(root.path().join("host/evil"))?;
        let error = session
            .host(&HostName::Remote("../evil".to_string()))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), crate::error::ErrorKind::NotSupported);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_remote_host_is_not_found() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = session_with(Settings::default(), &root);
        let error = session
            .host(&HostName::Remote("nowhere".to_string()))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
        Ok(())
    }

    #[test]
    fn type_overrides_replace_globals() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let mut settings = Settings::default();
        settings.types.insert(
            "probe".to_string(),
            TypeSettings {
                port_range: Some("9000-9010".to_string()),
                clean: None,
                purge: Some(vec!["*.dump".to_string()]),
            },
        );
        let session = session_with(settings, &root);
        let probe = session.lookup_type("probes")?;
        assert_eq!(session.port_range(probe), "9000-9010");
        assert_eq!(session.clean_globs(probe), vec!["*.old", "*.core"]);
        assert_eq!(session.purge_globs(probe), vec!["*.dump"]);
        assert!(session.lookup_type("gateway").is_err());
        Ok(())
    }
}
