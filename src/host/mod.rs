//! Uniform filesystem and process operations against the local machine or a
//! remote machine reached over SSH. Callers hold a [`Host`] and never branch
//! on where it lives.

mod local;
mod remote;
mod shell;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;

use crate::error::FleetResult;

pub use local::LocalHost;
pub use remote::{RemoteHost, RemoteSpec};

pub const LOCALHOST: &str = "localhost";

/// Which host an instance name refers to, before any session exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostName {
    Local,
    Remote(String),
}

impl HostName {
    pub fn parse(value: &str) -> Self {
        if value.is_empty() || value == LOCALHOST {
            HostName::Local
        } else {
            HostName::Remote(value.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            HostName::Local => LOCALHOST,
            HostName::Remote(name) => name,
        }
    }
}

impl fmt::Display for HostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub len: u64,
    pub is_dir: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// One row of a host's process table.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: u32,
    pub uid: Option<u32>,
    pub argv: Vec<String>,
    pub started: Option<DateTime<Utc>>,
}

/// Everything needed to launch a process that outlives this command.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub workdir: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Receives both stdout and stderr, opened append-or-create.
    pub log_file: PathBuf,
    /// Account to run as when the caller is privileged.
    pub user: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Host {
    Local(LocalHost),
    Remote(Arc<RemoteHost>),
}

impl Host {
    pub fn name(&self) -> &str {
        match self {
            Host::Local(_) => LOCALHOST,
            Host::Remote(remote) => remote.name(),
        }
    }

    /// Install root on this host.
    pub fn root(&self) -> &Path {
        match self {
            Host::Local(local) => local.root(),
            Host::Remote(remote) => remote.root(),
        }
    }

    /// Account that operations on this host run as.
    pub fn login_user(&self) -> &str {
        match self {
            Host::Local(local) => local.user(),
            Host::Remote(remote) => remote.username(),
        }
    }

    pub fn is_privileged(&self) -> bool {
        match self {
            Host::Local(local) => local.is_privileged(),
            Host::Remote(remote) => remote.username() == "root",
        }
    }

    pub async fn stat(&self, path: &Path) -> FleetResult<FileInfo> {
        match self {
            Host::Local(local) => local.stat(path),
            Host::Remote(remote) => remote.stat(path).await,
        }
    }

    pub async fn exists(&self, path: &Path) -> FleetResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_not_found() => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub async fn read_file(&self, path: &Path) -> FleetResult<Vec<u8>> {
        self.read_from(path, 0).await
    }

    /// Read a file starting at `offset` bytes.
    pub async fn read_from(&self, path: &Path, offset: u64) -> FleetResult<Vec<u8>> {
        match self {
            Host::Local(local) => local.read_from(path, offset),
            Host::Remote(remote) => remote.read_from(path, offset).await,
        }
    }

    /// Write through a temporary file in the same directory and rename it
    /// into place. Ownership is applied before the rename when privileged.
    pub async fn write_atomic(
        &self,
        path: &Path,
        data: &[u8],
        mode: u32,
        owner: Option<&str>,
    ) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.write_atomic(path, data, mode, owner),
            Host::Remote(remote) => remote.write_atomic(path, data, mode, owner).await,
        }
    }

    /// Create (or truncate) a zero-length file.
    pub async fn create_empty(&self, path: &Path) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.create_empty(path),
            Host::Remote(remote) => remote.create_empty(path).await,
        }
    }

    pub async fn remove(&self, path: &Path) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.remove(path),
            Host::Remote(remote) => remote.remove(path).await,
        }
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.rename(from, to),
            Host::Remote(remote) => remote.rename(from, to).await,
        }
    }

    pub async fn symlink(&self, target: &Path, link: &Path) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.symlink(target, link),
            Host::Remote(remote) => remote.symlink(target, link).await,
        }
    }

    pub async fn read_link(&self, path: &Path) -> FleetResult<PathBuf> {
        match self {
            Host::Local(local) => local.read_link(path),
            Host::Remote(remote) => remote.read_link(path).await,
        }
    }

    pub async fn mkdir_all(&self, path: &Path) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.mkdir_all(path),
            Host::Remote(remote) => remote.mkdir_all(path).await,
        }
    }

    /// Directory entries sorted by name.
    pub async fn read_dir(&self, path: &Path) -> FleetResult<Vec<DirEntry>> {
        match self {
            Host::Local(local) => local.read_dir(path),
            Host::Remote(remote) => remote.read_dir(path).await,
        }
    }

    pub async fn chown(&self, path: &Path, user: &str) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.chown(path, user),
            Host::Remote(remote) => remote.chown(path, user).await,
        }
    }

    pub async fn processes(&self) -> FleetResult<Vec<ProcessEntry>> {
        match self {
            Host::Local(local) => local.processes(),
            Host::Remote(remote) => remote.processes().await,
        }
    }

    /// Deliver a signal. A process that has already gone is not an error.
    pub async fn signal(&self, pid: u32, signal: Signal) -> FleetResult<()> {
        match self {
            Host::Local(local) => local.signal(pid, signal),
            Host::Remote(remote) => remote.signal(pid, signal).await,
        }
    }

    /// Launch a detached process. Remote launches are not confirmed, so the
    /// PID is only known for local hosts.
    pub async fn run_detached(&self, spec: &LaunchSpec) -> FleetResult<Option<u32>> {
        match self {
            Host::Local(local) => local.run_detached(spec).await,
            Host::Remote(remote) => remote.run_detached(spec).await,
        }
    }

    pub async fn close(&self) {
        if let Host::Remote(remote) = self {
            remote.close().await;
        }
    }
}

/// Split a NUL separated `/proc/<pid>/cmdline` style buffer.
pub(crate) fn split_cmdline(raw: &[u8], separator: u8) -> Vec<String> {
    let mut argv: Vec<String> = raw
        .split(|byte| *byte == separator)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    while argv.last().is_some_and(|arg| arg.is_empty()) {
        argv.pop();
    }
    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_names_treat_localhost_as_local() {
        assert_eq!(HostName::parse(""), HostName::Local);
        assert_eq!(HostName::parse("localhost"), HostName::Local);
        assert_eq!(
            HostName::parse("lab01"),
            HostName::Remote("lab01".to_string())
        );
    }

    #[test]
    fn split_cmdline_drops_trailing_separator() {
        let argv = split_cmdline(b"/opt/fleet/bin/probe\0p1\0-port\07036\0", 0);
        assert_eq!(argv, vec!["/opt/fleet/bin/probe", "p1", "-port", "7036"]);
        assert!(split_cmdline(b"", 0).is_empty());
    }
}
