use super::*;
use std::{
    io::{self, Write},
    path::Path,
};

use anyhow::bail;
use clap::CommandFactory;
use tokio::signal;
use tracing::{debug, error, info};

use crate::{
    error::{FleetError, FleetResult},
    host::{Host, HostName},
    instance::{self, Instance},
    lifecycle::{Controller, HostProcessOps, InstanceState, Outcome, ProcessOps, clean},
    package, ports, record,
    registry::{ComponentType, HOST},
    resolve::{self, InstanceName},
};

/// A lifecycle command applied to each selected instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop { kill: bool },
    Restart { all: bool },
    Disable,
    Enable { start: bool },
}

impl Transition {
    fn verb(self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Stop { .. } => "stop",
            Transition::Restart { .. } => "restart",
            Transition::Disable => "disable",
            Transition::Enable { .. } => "enable",
        }
    }

    async fn apply(self, controller: &Controller<'_>, inst: &Instance) -> FleetResult<Outcome> {
        match self {
            Transition::Start => controller.start(inst).await,
            Transition::Stop { kill } => controller.stop(inst, kill).await,
            Transition::Restart { all } => controller.restart(inst, all).await,
            Transition::Disable => controller.disable(inst).await,
            Transition::Enable { start } => controller.enable(inst, start).await,
        }
    }
}

/// Per-instance failures of a fleet-wide command. Each one is logged with
/// the instance label and the command fails once all were attempted.
#[derive(Debug, Default)]
struct Tally {
    attempted: usize,
    failed: usize,
}

impl Tally {
    fn check<T>(&mut self, label: &str, result: FleetResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                error!("{label}: {err}");
                self.failed += 1;
                None
            }
        }
    }

    fn finish(self, action: &str) -> Result<()> {
        if self.failed > 0 {
            bail!(
                "{action} failed for {} of {} instance(s)",
                self.failed,
                self.attempted
            );
        }
        Ok(())
    }
}

fn controller<'a>(session: &FleetSession, ops: &'a dyn ProcessOps) -> Controller<'a> {
    Controller::new(ops).with_running_only(session.settings().restart.running_only)
}

/// Split `[TYPE] [NAME...]`. The first word is a type when it names one;
/// otherwise every real type is searched.
fn split_targets<'a>(
    session: &FleetSession,
    targets: &'a [String],
    related: bool,
) -> Result<(Vec<&'static ComponentType>, &'a [String])> {
    if let Some((first, rest)) = targets.split_first() {
        if let Some(ct) = session.registry().lookup(first) {
            if !ct.real {
                bail!("{} records run no process; use `fleetctl host`", ct.tag);
            }
            let types = if related {
                session.registry().with_related(ct)
            } else {
                vec![ct]
            };
            return Ok((types, rest));
        }
    }
    Ok((session.registry().real_types(), targets))
}

async fn load_one(session: &FleetSession, kind: &str, raw: &str) -> Result<Instance> {
    let ct = session.lookup_type(kind)?;
    let parsed = InstanceName::parse(raw);
    let host = session.host(&parsed.host).await?;
    let inst = Instance::load(session, &host, ct, &parsed.name).await?;
    Ok(inst)
}

async fn host_option(session: &FleetSession, host: Option<&str>) -> Result<Host> {
    let name = host.map(HostName::parse).unwrap_or(HostName::Local);
    Ok(session.host(&name).await?)
}

pub async fn lifecycle(
    session: &FleetSession,
    targets: &[String],
    transition: Transition,
) -> Result<()> {
    let (types, names) = split_targets(session, targets, false)?;
    let ops = HostProcessOps;
    let controller = controller(session, &ops);
    let mut tally = Tally::default();
    for selected in instance::select(session, &types, names).await {
        tally.attempted += 1;
        let Some(inst) = tally.check(&selected.label, selected.result) else {
            continue;
        };
        let result = transition.apply(&controller, &inst).await;
        if let Some(outcome) = tally.check(&selected.label, result) {
            println!("{}: {outcome}", inst.display_name());
        }
    }
    if tally.attempted == 0 {
        info!("no matching instances");
    }
    tally.finish(transition.verb())
}

pub async fn add(session: &FleetSession, args: AddArgs) -> Result<()> {
    let ct = session.lookup_type(&args.kind)?;
    if !ct.real {
        bail!("{} records are created with `fleetctl host add`", ct.tag);
    }
    let parsed = InstanceName::parse(&args.name);
    resolve::validate_name(session.registry(), &parsed.name)?;
    let host = session.host(&parsed.host).await?;
    let mut inst = Instance::new(session, &host, ct, &parsed.name);
    refuse_existing(&host, &inst.home()).await?;

    let port = match args.port {
        Some(port) => port,
        None => {
            let range = session.port_range(ct);
            match ports::next_free_port(session, &host, &range).await? {
                0 => bail!("no free port left in '{range}' on {}", host.name()),
                port => port,
            }
        }
    };
    inst.record.set(record::PORT, port);
    create_home(&host, ct, &inst).await?;
    inst.write_config().await?;
    info!(instance = %inst.display_name(), port, "created");
    println!("{}: created on port {port}", inst.display_name());

    if args.start {
        let ops = HostProcessOps;
        let outcome = controller(session, &ops)
            .start(&inst)
            .await
            .with_context(|| format!("starting {}", inst.display_name()))?;
        println!("{}: {outcome}", inst.display_name());
    }
    Ok(())
}

async fn refuse_existing(host: &Host, home: &Path) -> FleetResult<()> {
    if host.exists(home).await? {
        return Err(FleetError::AlreadyExists {
            host: host.name().to_string(),
            path: home.display().to_string(),
        });
    }
    Ok(())
}

async fn create_home(host: &Host, ct: &ComponentType, inst: &Instance) -> FleetResult<()> {
    for dir in ct.directories {
        host.mkdir_all(&host.root().join(dir)).await?;
    }
    let home = inst.home();
    host.mkdir_all(&home).await?;
    if host.is_privileged() {
        if let Some(user) = inst.configured_user() {
            host.chown(&home, &user).await?;
        }
    }
    Ok(())
}

pub async fn host(session: &FleetSession, args: HostArgs) -> Result<()> {
    match args.command {
        HostCommand::Add(args) => host_add(session, args).await,
        HostCommand::Ls => host_list(session).await,
    }
}

async fn host_add(session: &FleetSession, args: HostAddArgs) -> Result<()> {
    resolve::validate_name(session.registry(), &args.name)?;
    let (user, hostname, port) = parse_destination(&args.destination)?;
    let local = session.local();
    let mut inst = Instance::new(session, local, &HOST, &args.name);
    refuse_existing(local, &inst.home()).await?;

    inst.record.set(record::HOSTNAME, hostname);
    if let Some(user) = user {
        inst.record.set(record::USERNAME, user);
    }
    if let Some(port) = port {
        inst.record.set(record::SSH_PORT, port);
    }
    if let Some(root) = args.root {
        if !root.is_absolute() {
            bail!("remote root '{}' must be absolute", root.display());
        }
        inst.record.set(record::REMOTE_ROOT, root.display().to_string());
    }
    create_home(local, &HOST, &inst).await?;
    inst.write_config().await?;
    println!("host {}: added", args.name);
    Ok(())
}

/// `[user@]hostname[:port]`
fn parse_destination(raw: &str) -> Result<(Option<String>, String, Option<u16>)> {
    let (user, rest) = match raw.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        Some(_) => bail!("empty user in '{raw}'"),
        None => (None, raw),
    };
    let (hostname, port) = match rest.rsplit_once(':') {
        Some((hostname, port)) => {
            let port: u16 = port
                .parse()
                .ok()
                .filter(|port| *port != 0)
                .with_context(|| format!("invalid port in '{raw}'"))?;
            (hostname, Some(port))
        }
        None => (rest, None),
    };
    if hostname.is_empty() {
        bail!("missing hostname in '{raw}'");
    }
    Ok((user, hostname.to_string(), port))
}

async fn host_list(session: &FleetSession) -> Result<()> {
    let local = session.local();
    let mut tally = Tally::default();
    let mut stdout = io::stdout().lock();
    for name in instance::instance_names(local, &HOST).await? {
        tally.attempted += 1;
        let label = format!("host {name}");
        let Some(inst) = tally.check(&label, Instance::load(session, local, &HOST, &name).await)
        else {
            continue;
        };
        writeln!(
            stdout,
            "{name}\t{}@{}:{}\t{}",
            inst.record.string(record::USERNAME),
            inst.record.string(record::HOSTNAME),
            inst.record.string(record::SSH_PORT),
            inst.record.string(record::REMOTE_ROOT),
        )?;
    }
    tally.finish("host ls")
}

#[derive(Debug)]
struct ListRow {
    kind: &'static str,
    name: String,
    host: String,
    state: InstanceState,
    port: Option<u16>,
}

pub async fn list(session: &FleetSession, args: TargetArgs) -> Result<()> {
    let (types, names) = split_targets(session, &args.targets, true)?;
    let ops = HostProcessOps;
    let controller = controller(session, &ops);
    let mut tally = Tally::default();
    let mut rows = Vec::new();
    for selected in instance::select(session, &types, names).await {
        tally.attempted += 1;
        let Some(inst) = tally.check(&selected.label, selected.result) else {
            continue;
        };
        if let Some(state) = tally.check(&selected.label, controller.state(&inst).await) {
            rows.push(ListRow {
                kind: inst.ct.tag,
                name: inst.name(),
                host: inst.host.name().to_string(),
                state,
                port: inst.record.port(),
            });
        }
    }
    write_table(&mut io::stdout().lock(), &rows)?;
    tally.finish("ls")
}

fn write_table<W: Write>(writer: &mut W, rows: &[ListRow]) -> io::Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let cells: Vec<[String; 6]> = rows
        .iter()
        .map(|row| {
            [
                row.kind.to_string(),
                row.name.clone(),
                row.host.clone(),
                row.state.label().to_string(),
                row.state.pid().map(|pid| pid.to_string()).unwrap_or_default(),
                row.port.map(|port| port.to_string()).unwrap_or_default(),
            ]
        })
        .collect();
    let header = ["TYPE", "NAME", "HOST", "STATE", "PID", "PORT"];
    let mut widths = header.map(str::len);
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut write_row = |cells: &[&str]| -> io::Result<()> {
        let line = cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ");
        writeln!(writer, "{}", line.trim_end())
    };
    write_row(&header)?;
    for row in &cells {
        let row: Vec<&str> = row.iter().map(String::as_str).collect();
        write_row(&row)?;
    }
    Ok(())
}

pub async fn show(session: &FleetSession, args: ShowArgs) -> Result<()> {
    let inst = load_one(session, &args.kind, &args.name).await?;
    let rendered = serde_json::to_string_pretty(&inst.record).context("rendering record")?;
    println!("{rendered}");
    Ok(())
}

pub async fn set(session: &FleetSession, args: SetArgs) -> Result<()> {
    let mut inst = load_one(session, &args.kind, &args.name).await?;
    for pair in &args.fields {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got '{pair}'");
        };
        inst.set_field(key.trim(), value)
            .await
            .with_context(|| format!("{}: setting {key}", inst.display_name()))?;
        debug!(instance = %inst.display_name(), key, "field set");
    }
    println!("{}: updated", inst.display_name());
    Ok(())
}

pub async fn ports(session: &FleetSession, args: PortsArgs) -> Result<()> {
    let host = host_option(session, args.host.as_deref()).await?;
    if let Some(expr) = args.next {
        if ports::parse_ranges(&expr).is_empty() {
            bail!("'{expr}' contains no port range");
        }
        match ports::next_free_port(session, &host, &expr).await? {
            0 => bail!("no free port in '{expr}' on {}", host.name()),
            port => println!("{port}"),
        }
        return Ok(());
    }

    let occupied = ports::occupied_ports(session, &host).await?;
    let mut stdout = io::stdout().lock();
    for (port, owners) in occupied {
        writeln!(stdout, "{port:>5}  {}", owners.join(", "))?;
    }
    Ok(())
}

pub async fn logs(session: &FleetSession, args: LogsArgs) -> Result<()> {
    let inst = load_one(session, &args.kind, &args.name).await?;
    let path = inst.log_path();
    let (lines, offset) = log_io::tail(&inst.host, &path, args.tail)
        .await
        .with_context(|| format!("{}: reading {}", inst.display_name(), path.display()))?;
    for line in lines {
        println!("{}", log_io::colorize_line(&line));
    }
    if !args.follow {
        return Ok(());
    }

    let mut follower = tokio::spawn(log_io::follow(inst.host.clone(), path, offset));
    tokio::select! {
        joined = &mut follower => {
            joined.context("log follower stopped")??;
            Ok(())
        }
        _ = signal::ctrl_c() => {
            follower.abort();
            println!();
            Ok(())
        }
    }
}

pub async fn clean(session: &FleetSession, args: CleanArgs) -> Result<()> {
    let (types, names) = split_targets(session, &args.targets, false)?;
    let ops = HostProcessOps;
    let controller = controller(session, &ops);
    let mut tally = Tally::default();
    for selected in instance::select(session, &types, names).await {
        tally.attempted += 1;
        let Some(inst) = tally.check(&selected.label, selected.result) else {
            continue;
        };
        let result = clean::clean(session, &controller, &inst, args.full).await;
        if let Some(removed) = tally.check(&selected.label, result) {
            println!("{}: removed {removed} file(s)", inst.display_name());
        }
    }
    tally.finish("clean")
}

pub async fn update(session: &FleetSession, args: UpdateArgs) -> Result<()> {
    let ct = session.lookup_type(&args.kind)?;
    if !ct.real {
        bail!("{} has no installed versions", ct.tag);
    }
    let host = host_option(session, args.host.as_deref()).await?;
    let ops = HostProcessOps;
    let controller = controller(session, &ops);
    let report = package::update_to_version(
        session,
        &controller,
        &host,
        ct,
        &args.version,
        &args.base,
        args.force,
    )
    .await?;

    if report.unchanged {
        println!("{} {}: {} already at {}", ct.tag, host.name(), args.base, args.version);
        return Ok(());
    }
    println!("{} {}: {} -> {}", ct.tag, host.name(), args.base, args.version);
    for name in &report.restarted {
        println!("{name}: restarted");
    }
    if !report.failed.is_empty() {
        bail!("could not restart {}", report.failed.join(", "));
    }
    Ok(())
}

pub fn completions(args: CompletionsArgs) -> Result<()> {
    let shell: Shell = args.shell.into();
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "fleetctl", &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        registry::{PROBE, SANPROBE},
        session::testing::session as test_session,
    };
    use std::fs;
    use tempfile::TempDir;

    fn words(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn destination_forms() -> anyhow::Result<()> {
        assert_eq!(
            parse_destination("ops@lab.example.net:2222")?,
            (Some("ops".to_string()), "lab.example.net".to_string(), Some(2222))
        );
        assert_eq!(parse_destination("lab")?, (None, "lab".to_string(), None));
        assert!(parse_destination("@lab").is_err());
        assert!(parse_destination("lab:0").is_err());
        assert!(parse_destination("ops@:22").is_err());
        Ok(())
    }

    #[test]
    fn first_target_selects_type() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = test_session(root.path());

        let targets = words(&["probes", "p1"]);
        let (types, names) = split_targets(&session, &targets, true)?;
        let tags: Vec<_> = types.iter().map(|ct| ct.tag).collect();
        assert_eq!(tags, vec![PROBE.tag, SANPROBE.tag]);
        assert_eq!(names, &targets[1..]);

        let targets = words(&["p1", "p2"]);
        let (types, names) = split_targets(&session, &targets, false)?;
        assert_eq!(types.len(), session.registry().real_types().len());
        assert_eq!(names.len(), 2);

        assert!(split_targets(&session, &words(&["host"]), false).is_err());
        Ok(())
    }

    #[test]
    fn table_aligns_columns() -> anyhow::Result<()> {
        let rows = vec![
            ListRow {
                kind: "probe",
                name: "p1".to_string(),
                host: "localhost".to_string(),
                state: InstanceState::Running(4242),
                port: Some(7036),
            },
            ListRow {
                kind: "webconsole",
                name: "w".to_string(),
                host: "lab".to_string(),
                state: InstanceState::Stopped,
                port: None,
            },
        ];
        let mut out = Vec::new();
        write_table(&mut out, &rows)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("TYPE        NAME  HOST"));
        assert!(lines[1].contains("running  4242  7036"));
        assert!(lines[2].ends_with("stopped"));
        Ok(())
    }

    #[tokio::test]
    async fn add_allocates_port_and_refuses_duplicates() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = test_session(root.path());
        let args = |name: &str| AddArgs {
            kind: "probe".to_string(),
            name: name.to_string(),
            port: None,
            start: false,
        };

        add(&session, args("p1")).await?;
        add(&session, args("p2")).await?;
        let p1 = Instance::load(&session, session.local(), &PROBE, "p1").await?;
        let p2 = Instance::load(&session, session.local(), &PROBE, "p2").await?;
        assert_eq!(p1.record.port(), Some(7036));
        assert_eq!(p2.record.port(), Some(7100));
        assert!(p1.home().join("probe.json").exists());

        let error = add(&session, args("p1")).await.unwrap_err();
        let error = error
            .downcast_ref::<FleetError>()
            .map(FleetError::kind);
        assert_eq!(error, Some(ErrorKind::AlreadyExists));
        assert!(add(&session, args("probes")).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn host_add_writes_record() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let session = test_session(root.path());
        host_add(
            &session,
            HostAddArgs {
                name: "lab".to_string(),
                destination: "ops@lab.example.net:2222".to_string(),
                root: Some("/srv/fleet".into()),
            },
        )
        .await?;

        let written = fs::read_to_string(HOST.instance_dir(root.path(), "lab").join("host.json"))?;
        let value: serde_json::Value = serde_json::from_str(&written)?;
        assert_eq!(value["Hostname"], "lab.example.net");
        assert_eq!(value["SshPort"], 2222);
        assert_eq!(value["Username"], "ops");
        assert_eq!(value["RemoteRoot"], "/srv/fleet");
        Ok(())
    }
}
