use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Stdio,
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill as send_unix_signal},
    unistd::{self, Pid, User},
};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::{DirEntry, FileInfo, LOCALHOST, LaunchSpec, ProcessEntry, split_cmdline};
use crate::error::{FleetError, FleetResult};

#[derive(Debug, Clone)]
pub struct LocalHost {
    root: PathBuf,
    user: String,
    privileged: bool,
}

impl LocalHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let uid = unistd::geteuid();
        let user = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|user| user.name)
            .unwrap_or_else(|| uid.to_string());
        Self {
            root: root.into(),
            user,
            privileged: uid.is_root(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub(super) fn stat(&self, path: &Path) -> FleetResult<FileInfo> {
        let meta = fs::metadata(path).map_err(|error| io_error("stat", path, error))?;
        Ok(FileInfo {
            len: meta.len(),
            is_dir: meta.is_dir(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    pub(super) fn read_from(&self, path: &Path, offset: u64) -> FleetResult<Vec<u8>> {
        let mut file = fs::File::open(path).map_err(|error| io_error("open", path, error))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|error| io_error("seek", path, error))?;
        }
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|error| io_error("read", path, error))?;
        Ok(buffer)
    }

    pub(super) fn write_atomic(
        &self,
        path: &Path,
        data: &[u8],
        mode: u32,
        owner: Option<&str>,
    ) -> FleetResult<()> {
        let tmp_path = temp_sibling(path);
        fs::write(&tmp_path, data).map_err(|error| io_error("write", &tmp_path, error))?;

        let finish = || -> FleetResult<()> {
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
                .map_err(|error| io_error("chmod", &tmp_path, error))?;
            if let Some(owner) = owner.filter(|_| self.privileged) {
                self.chown(&tmp_path, owner)?;
            }
            fs::rename(&tmp_path, path).map_err(|error| io_error("rename", path, error))
        };

        let result = finish();
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    pub(super) fn create_empty(&self, path: &Path) -> FleetResult<()> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map(|_| ())
            .map_err(|error| io_error("create", path, error))
    }

    pub(super) fn remove(&self, path: &Path) -> FleetResult<()> {
        fs::remove_file(path).map_err(|error| io_error("remove", path, error))
    }

    pub(super) fn rename(&self, from: &Path, to: &Path) -> FleetResult<()> {
        fs::rename(from, to).map_err(|error| io_error("rename", from, error))
    }

    pub(super) fn symlink(&self, target: &Path, link: &Path) -> FleetResult<()> {
        std::os::unix::fs::symlink(target, link).map_err(|error| io_error("symlink", link, error))
    }

    pub(super) fn read_link(&self, path: &Path) -> FleetResult<PathBuf> {
        fs::read_link(path).map_err(|error| io_error("readlink", path, error))
    }

    pub(super) fn mkdir_all(&self, path: &Path) -> FleetResult<()> {
        fs::create_dir_all(path).map_err(|error| io_error("mkdir", path, error))
    }

    pub(super) fn read_dir(&self, path: &Path) -> FleetResult<Vec<DirEntry>> {
        let entries = fs::read_dir(path).map_err(|error| io_error("readdir", path, error))?;
        let mut listing = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| io_error("readdir", path, error))?;
            listing.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.path().is_dir(),
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    pub(super) fn chown(&self, path: &Path, user: &str) -> FleetResult<()> {
        let account = lookup_user(user)?;
        unistd::chown(path, Some(account.uid), Some(account.gid)).map_err(|errno| {
            io_error("chown", path, io::Error::from(errno))
        })
    }

    pub(super) fn processes(&self) -> FleetResult<Vec<ProcessEntry>> {
        let proc_root = Path::new("/proc");
        let entries = fs::read_dir(proc_root).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => {
                FleetError::NotSupported("process discovery requires /proc".to_string())
            }
            _ => io_error("readdir", proc_root, error),
        })?;

        let mut table = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes may exit between listing and reading.
            let Ok(raw) = fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let argv = split_cmdline(&raw, 0);
            if argv.is_empty() {
                continue;
            }
            let meta = entry.metadata().ok();
            table.push(ProcessEntry {
                pid,
                uid: meta.as_ref().map(MetadataExt::uid),
                argv,
                started: meta
                    .and_then(|meta| meta.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }
        Ok(table)
    }

    pub(super) fn signal(&self, pid: u32, signal: Signal) -> FleetResult<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| FleetError::NotSupported(format!("pid {pid} out of range")))?;
        match send_unix_signal(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Ok(()),
            Err(Errno::EPERM) => Err(FleetError::PermissionDenied(format!(
                "sending {signal} to pid {pid}"
            ))),
            Err(errno) => Err(FleetError::Io {
                host: LOCALHOST.to_string(),
                op: "kill",
                path: pid.to_string(),
                source: io::Error::from(errno),
            }),
        }
    }

    pub(super) async fn run_detached(&self, spec: &LaunchSpec) -> FleetResult<Option<u32>> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)
            .map_err(|error| io_error("open", &spec.log_file, error))?;
        let log_err = log
            .try_clone()
            .map_err(|error| io_error("dup", &spec.log_file, error))?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .envs(spec.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        if let Some(user) = spec.user.as_deref().filter(|_| self.privileged) {
            let account = lookup_user(user)?;
            unistd::chown(&spec.log_file, Some(account.uid), Some(account.gid)).map_err(
                |errno| io_error("chown", &spec.log_file, io::Error::from(errno)),
            )?;
            command.uid(account.uid.as_raw()).gid(account.gid.as_raw());
        }

        // Leave our session so the child survives the terminal going away.
        unsafe {
            command.pre_exec(|| unistd::setsid().map(|_| ()).map_err(io::Error::from));
        }

        let child = command
            .spawn()
            .map_err(|error| io_error("exec", &spec.program, error))?;
        let pid = child.id();
        debug!(program = %spec.program.display(), ?pid, "launched detached process");
        Ok(pid)
    }
}

fn io_error(op: &'static str, path: &Path, error: io::Error) -> FleetError {
    FleetError::from_io(LOCALHOST, op, path, error)
}

fn lookup_user(name: &str) -> FleetResult<User> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(FleetError::PermissionDenied(format!("unknown user {name}"))),
        Err(errno) => Err(FleetError::Io {
            host: LOCALHOST.to_string(),
            op: "getpwnam",
            path: name.to_string(),
            source: io::Error::from(errno),
        }),
    }
}

pub(super) fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()))
}
