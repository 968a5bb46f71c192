use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use russh::{ChannelMsg, Disconnect, client};
use russh_keys::{agent::client::AgentClient, key::PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    DirEntry, FileInfo, LaunchSpec, ProcessEntry, local::temp_sibling, shell, split_cmdline,
};
use crate::error::{FleetError, FleetResult};

/// Connection parameters for a remote host, taken from its host record.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub name: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub root: PathBuf,
    pub known_hosts: Option<PathBuf>,
    pub identity_files: Vec<PathBuf>,
}

/// A remote host. The SSH session is opened by the first operation and
/// reused until [`RemoteHost::close`].
pub struct RemoteHost {
    spec: RemoteSpec,
    session: Mutex<Option<Arc<client::Handle<KnownHostsCheck>>>>,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ExecOutput {
    status: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl ExecOutput {
    fn success(&self) -> bool {
        self.status == 0
    }

    fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

struct KnownHostsCheck {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for KnownHostsCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let checked = match &self.known_hosts {
            Some(path) => {
                russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
            }
            None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
        };
        match checked {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(host = %self.host, "server key not present in known hosts");
                Ok(false)
            }
            Err(error) => {
                warn!(host = %self.host, %error, "server key rejected");
                Ok(false)
            }
        }
    }
}

impl RemoteHost {
    pub fn new(spec: RemoteSpec) -> Self {
        Self {
            spec,
            session: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn root(&self) -> &Path {
        &self.spec.root
    }

    pub fn username(&self) -> &str {
        &self.spec.username
    }

    async fn handle(&self) -> FleetResult<Arc<client::Handle<KnownHostsCheck>>> {
        let mut guard = self.session.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(self.connect().await?);
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    async fn connect(&self) -> FleetResult<client::Handle<KnownHostsCheck>> {
        let config = Arc::new(client::Config::default());
        let handler = KnownHostsCheck {
            host: self.spec.hostname.clone(),
            port: self.spec.port,
            known_hosts: self.spec.known_hosts.clone(),
        };
        debug!(host = %self.spec.name, hostname = %self.spec.hostname, port = self.spec.port, "connecting");
        let mut handle = client::connect(
            config,
            (self.spec.hostname.as_str(), self.spec.port),
            handler,
        )
        .await
        .map_err(|error| FleetError::remote(&self.spec.name, error))?;

        if !self.authenticate(&mut handle).await? {
            return Err(FleetError::remote(
                &self.spec.name,
                format!("authentication failed for {}", self.spec.username),
            ));
        }
        info!(host = %self.spec.name, user = %self.spec.username, "ssh session established");
        Ok(handle)
    }

    /// Identity files first, then whatever the agent offers.
    async fn authenticate(&self, handle: &mut client::Handle<KnownHostsCheck>) -> FleetResult<bool> {
        for path in &self.spec.identity_files {
            if !path.exists() {
                continue;
            }
            let key = match russh_keys::load_secret_key(path, None) {
                Ok(key) => key,
                Err(error) => {
                    debug!(path = %path.display(), %error, "skipping unreadable identity");
                    continue;
                }
            };
            match handle
                .authenticate_publickey(self.spec.username.clone(), Arc::new(key))
                .await
            {
                Ok(true) => return Ok(true),
                Ok(false) => debug!(path = %path.display(), "identity rejected"),
                Err(error) => return Err(FleetError::remote(&self.spec.name, error)),
            }
        }

        let mut agent = match AgentClient::connect_env().await {
            Ok(agent) => agent,
            Err(error) => {
                debug!(%error, "no ssh agent available");
                return Ok(false);
            }
        };
        let identities = match agent.request_identities().await {
            Ok(identities) => identities,
            Err(error) => {
                debug!(%error, "ssh agent did not list identities");
                return Ok(false);
            }
        };
        for key in identities {
            let (returned, result) = handle
                .authenticate_future(self.spec.username.clone(), key, agent)
                .await;
            agent = returned;
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(error) => debug!(?error, "agent signing failed"),
            }
        }
        Ok(false)
    }

    async fn exec(&self, command: &str, input: Option<&[u8]>) -> FleetResult<ExecOutput> {
        let handle = self.handle().await?;
        let remote_err = |error: russh::Error| FleetError::remote(&self.spec.name, error);

        let mut channel = handle.channel_open_session().await.map_err(remote_err)?;
        channel.exec(true, command).await.map_err(remote_err)?;
        if let Some(data) = input {
            channel.data(data).await.map_err(remote_err)?;
        }
        channel.eof().await.map_err(remote_err)?;

        let mut output = ExecOutput::default();
        let mut status = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        output.status = status.ok_or_else(|| {
            FleetError::remote(&self.spec.name, "command ended without an exit status")
        })?;
        Ok(output)
    }

    /// Run a command and classify a non-zero exit.
    async fn run(&self, op: &'static str, path: &Path, command: &str) -> FleetResult<ExecOutput> {
        let output = self.exec(command, None).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(self.failure(op, path, &output))
        }
    }

    fn failure(&self, op: &'static str, path: &Path, output: &ExecOutput) -> FleetError {
        let stderr = output.stderr_lossy();
        if stderr.contains("No such file or directory") {
            FleetError::not_found(&self.spec.name, path)
        } else if stderr.contains("File exists") {
            FleetError::AlreadyExists {
                host: self.spec.name.clone(),
                path: path.display().to_string(),
            }
        } else if stderr.contains("Permission denied") || stderr.contains("not permitted") {
            FleetError::PermissionDenied(format!(
                "{}: {op} {}: {}",
                self.spec.name,
                path.display(),
                stderr.trim()
            ))
        } else {
            FleetError::remote(
                &self.spec.name,
                format!(
                    "{op} {} exited {}: {}",
                    path.display(),
                    output.status,
                    stderr.trim()
                ),
            )
        }
    }

    pub(super) async fn stat(&self, path: &Path) -> FleetResult<FileInfo> {
        let command = format!("stat -L -c '%s %f %u %g %Y' {}", shell::quote_path(path));
        let output = self.run("stat", path, &command).await?;
        parse_stat(&output.stdout_lossy())
            .ok_or_else(|| FleetError::remote(&self.spec.name, "unexpected stat output"))
    }

    pub(super) async fn read_from(&self, path: &Path, offset: u64) -> FleetResult<Vec<u8>> {
        let command = format!("tail -c +{} {}", offset + 1, shell::quote_path(path));
        Ok(self.run("read", path, &command).await?.stdout)
    }

    pub(super) async fn write_atomic(
        &self,
        path: &Path,
        data: &[u8],
        mode: u32,
        owner: Option<&str>,
    ) -> FleetResult<()> {
        let tmp = shell::quote_path(&temp_sibling(path));
        let mut command = format!("cat > {tmp} && chmod {mode:o} {tmp}");
        if let Some(owner) = owner.filter(|_| self.username() == "root") {
            command.push_str(&format!(" && chown {} {tmp}", shell::quote(owner)));
        }
        command.push_str(&format!(
            " && mv -f {tmp} {} || {{ rm -f {tmp}; exit 1; }}",
            shell::quote_path(path)
        ));
        let output = self.exec(&command, Some(data)).await?;
        if output.success() {
            Ok(())
        } else {
            Err(self.failure("write", path, &output))
        }
    }

    pub(super) async fn create_empty(&self, path: &Path) -> FleetResult<()> {
        let command = format!(": > {}", shell::quote_path(path));
        self.run("create", path, &command).await.map(|_| ())
    }

    pub(super) async fn remove(&self, path: &Path) -> FleetResult<()> {
        let command = format!("rm {}", shell::quote_path(path));
        self.run("remove", path, &command).await.map(|_| ())
    }

    pub(super) async fn rename(&self, from: &Path, to: &Path) -> FleetResult<()> {
        let command = format!(
            "mv -f {} {}",
            shell::quote_path(from),
            shell::quote_path(to)
        );
        self.run("rename", from, &command).await.map(|_| ())
    }

    pub(super) async fn symlink(&self, target: &Path, link: &Path) -> FleetResult<()> {
        let command = format!(
            "ln -s {} {}",
            shell::quote_path(target),
            shell::quote_path(link)
        );
        self.run("symlink", link, &command).await.map(|_| ())
    }

    pub(super) async fn read_link(&self, path: &Path) -> FleetResult<PathBuf> {
        // readlink exits non-zero without a message for non-links.
        let command = format!(
            "test -e {0} -o -L {0} || echo 'No such file or directory' >&2; readlink {0}",
            shell::quote_path(path)
        );
        let output = self.run("readlink", path, &command).await?;
        Ok(PathBuf::from(output.stdout_lossy().trim_end_matches('\n')))
    }

    pub(super) async fn mkdir_all(&self, path: &Path) -> FleetResult<()> {
        let command = format!("mkdir -p {}", shell::quote_path(path));
        self.run("mkdir", path, &command).await.map(|_| ())
    }

    pub(super) async fn read_dir(&self, path: &Path) -> FleetResult<Vec<DirEntry>> {
        let command = format!("ls -1Ap {}", shell::quote_path(path));
        let output = self.run("readdir", path, &command).await?;
        let mut listing: Vec<DirEntry> = output
            .stdout_lossy()
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.strip_suffix('/') {
                Some(name) => DirEntry {
                    name: name.to_string(),
                    is_dir: true,
                },
                None => DirEntry {
                    name: line.to_string(),
                    is_dir: false,
                },
            })
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    pub(super) async fn chown(&self, path: &Path, user: &str) -> FleetResult<()> {
        let command = format!("chown {} {}", shell::quote(user), shell::quote_path(path));
        self.run("chown", path, &command).await.map(|_| ())
    }

    pub(super) async fn processes(&self) -> FleetResult<Vec<ProcessEntry>> {
        let output = self.exec(shell::PROCESS_TABLE_SCRIPT, None).await?;
        Ok(output
            .stdout_lossy()
            .lines()
            .filter_map(parse_process_line)
            .collect())
    }

    pub(super) async fn signal(&self, pid: u32, signal: Signal) -> FleetResult<()> {
        let name = signal.as_str().trim_start_matches("SIG");
        let command = format!("kill -s {name} {pid}");
        let output = self.exec(&command, None).await?;
        let stderr = output.stderr_lossy();
        if output.success() || stderr.contains("No such process") {
            Ok(())
        } else if stderr.contains("not permitted") {
            Err(FleetError::PermissionDenied(format!(
                "{}: sending {signal} to pid {pid}",
                self.spec.name
            )))
        } else {
            Err(FleetError::remote(
                &self.spec.name,
                format!("kill {pid}: {}", stderr.trim()),
            ))
        }
    }

    /// Background the program in a subshell of one exec channel and return
    /// once the channel closes. The subshell exits before the program is
    /// known to be alive, so no PID is returned and the caller polls the
    /// process table for it.
    pub(super) async fn run_detached(&self, spec: &LaunchSpec) -> FleetResult<Option<u32>> {
        let mut script = format!("cd {}", shell::quote_path(&spec.workdir));
        for (key, value) in &spec.env {
            script.push_str(&format!(" && export {}", shell::quote(&format!("{key}={value}"))));
        }
        let log = shell::quote_path(&spec.log_file);
        script.push_str(&format!(" && touch {log}"));
        if let Some(user) = spec.user.as_deref().filter(|_| self.username() == "root") {
            script.push_str(&format!(" && chown {} {log}", shell::quote(user)));
        }
        script.push_str(&format!(" && (nohup {}", shell::quote_path(&spec.program)));
        for arg in &spec.args {
            script.push(' ');
            script.push_str(&shell::quote(arg));
        }
        script.push_str(&format!(" >> {log} 2>&1 < /dev/null &)"));

        let output = self.exec(&script, None).await?;
        if !output.success() {
            return Err(self.failure("exec", &spec.program, &output));
        }
        debug!(host = %self.spec.name, program = %spec.program.display(), "launched remote process");
        Ok(None)
    }

    pub(super) async fn close(&self) {
        let handle = self.session.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(host = %self.spec.name, %error, "error closing ssh session");
            }
        }
    }
}

fn parse_stat(output: &str) -> Option<FileInfo> {
    let mut fields = output.split_whitespace();
    let len = fields.next()?.parse().ok()?;
    let raw_mode = u32::from_str_radix(fields.next()?, 16).ok()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let modified = fields
        .next()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    Some(FileInfo {
        len,
        is_dir: raw_mode & 0o170000 == 0o040000,
        mode: raw_mode,
        uid,
        gid,
        modified,
    })
}

fn parse_process_line(line: &str) -> Option<ProcessEntry> {
    let mut fields = line.splitn(4, shell::FIELD_SEPARATOR);
    let pid = fields.next()?.parse().ok()?;
    let uid = fields.next().and_then(|uid| uid.parse().ok());
    let started = fields
        .next()
        .and_then(|secs| secs.parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    let argv = split_cmdline(fields.next()?.as_bytes(), shell::ARG_SEPARATOR);
    if argv.is_empty() {
        return None;
    }
    Some(ProcessEntry {
        pid,
        uid,
        argv,
        started,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_output() {
        let info = parse_stat("4096 41ed 1000 1000 1700000000\n").expect("stat parses");
        assert!(info.is_dir);
        assert_eq!(info.len, 4096);
        assert_eq!(info.uid, 1000);
        assert_eq!(
            info.modified.map(|time| time.timestamp()),
            Some(1_700_000_000)
        );

        let file = parse_stat("12 81a4 0 0 1700000000").expect("stat parses");
        assert!(!file.is_dir);
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn parses_process_table_lines() {
        let line = "4242\u{1f}1000\u{1f}1700000000\u{1f}/opt/fleet/packages/probe/active_prod/probe\u{1e}p1\u{1e}-port\u{1e}7036\u{1e}";
        let entry = parse_process_line(line).expect("line parses");
        assert_eq!(entry.pid, 4242);
        assert_eq!(entry.uid, Some(1000));
        assert_eq!(entry.argv.len(), 4);
        assert_eq!(entry.argv[1], "p1");

        assert!(parse_process_line("17\u{1f}0\u{1f}1700000000\u{1f}").is_none());
        assert!(parse_process_line("not-a-pid").is_none());
    }
}
