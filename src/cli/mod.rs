use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, builder::PossibleValue};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::{
    logging,
    registry::Registry,
    session::FleetSession,
    settings,
};

pub mod log_io;

#[derive(Parser, Debug)]
#[command(
    name = "fleetctl",
    version,
    about = "Manage monitoring-agent instances on local and remote hosts"
)]
pub struct Cli {
    /// Log debug detail
    #[arg(long, short = 'v', global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(long, short = 'q', global = true, action = ArgAction::SetTrue)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        logging::init_tracing(logging::level_for(self.verbose, self.quiet));

        if let Command::Completions(args) = self.command {
            return handlers::completions(args);
        }

        let settings = settings::load_default().context("loading settings")?;
        let registry = Registry::builtin().context("registering component types")?;
        let session = FleetSession::new(settings, registry)?;

        let result = match self.command {
            Command::Add(args) => handlers::add(&session, args).await,
            Command::Start(args) => {
                handlers::lifecycle(&session, &args.targets, handlers::Transition::Start).await
            }
            Command::Stop(args) => {
                let transition = handlers::Transition::Stop { kill: args.kill };
                handlers::lifecycle(&session, &args.targets, transition).await
            }
            Command::Restart(args) => {
                let transition = handlers::Transition::Restart { all: args.all };
                handlers::lifecycle(&session, &args.targets, transition).await
            }
            Command::Disable(args) => {
                handlers::lifecycle(&session, &args.targets, handlers::Transition::Disable).await
            }
            Command::Enable(args) => {
                let transition = handlers::Transition::Enable { start: args.start };
                handlers::lifecycle(&session, &args.targets, transition).await
            }
            Command::Ls(args) => handlers::list(&session, args).await,
            Command::Show(args) => handlers::show(&session, args).await,
            Command::Set(args) => handlers::set(&session, args).await,
            Command::Ports(args) => handlers::ports(&session, args).await,
            Command::Logs(args) => handlers::logs(&session, args).await,
            Command::Clean(args) => handlers::clean(&session, args).await,
            Command::Update(args) => handlers::update(&session, args).await,
            Command::Host(args) => handlers::host(&session, args).await,
            Command::Completions(_) => Ok(()),
        };
        session.close().await;
        result
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new instance
    Add(AddArgs),
    /// Start instances
    Start(TargetArgs),
    /// Stop instances
    Stop(StopArgs),
    /// Stop and start instances
    Restart(RestartArgs),
    /// Stop instances and keep them from starting
    Disable(TargetArgs),
    /// Allow disabled instances to start again
    Enable(EnableArgs),
    /// List instances and their state
    Ls(TargetArgs),
    /// Print an instance's resolved configuration
    Show(ShowArgs),
    /// Change configuration fields of an instance
    Set(SetArgs),
    /// Show ports in use or find a free one
    Ports(PortsArgs),
    /// Print an instance's process output
    Logs(LogsArgs),
    /// Delete disposable files from instance directories
    Clean(CleanArgs),
    /// Point a type's version link at another installed release
    Update(UpdateArgs),
    /// Manage remote hosts
    Host(HostArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Optional component type followed by instance names (`name` or `name@host`)
    #[arg(value_name = "TYPE|NAME")]
    pub targets: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Component type
    pub kind: String,

    /// Instance name, optionally `name@host`
    pub name: String,

    /// Use this port instead of the next free one
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Start the instance once created
    #[arg(long, short = 's')]
    pub start: bool,
}

#[derive(Args, Debug, Default)]
pub struct StopArgs {
    #[arg(value_name = "TYPE|NAME")]
    pub targets: Vec<String>,

    /// Send SIGKILL immediately
    #[arg(long, short = 'k')]
    pub kill: bool,
}

#[derive(Args, Debug, Default)]
pub struct RestartArgs {
    #[arg(value_name = "TYPE|NAME")]
    pub targets: Vec<String>,

    /// Also start instances that were not running
    #[arg(long, short = 'a')]
    pub all: bool,
}

#[derive(Args, Debug, Default)]
pub struct EnableArgs {
    #[arg(value_name = "TYPE|NAME")]
    pub targets: Vec<String>,

    /// Start the instances after enabling them
    #[arg(long, short = 's')]
    pub start: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub kind: String,
    pub name: String,
}

#[derive(Args, Debug)]
pub struct SetArgs {
    pub kind: String,
    pub name: String,

    /// Fields to set as KEY=VALUE
    #[arg(required = true, value_name = "KEY=VALUE")]
    pub fields: Vec<String>,
}

#[derive(Args, Debug, Default)]
pub struct PortsArgs {
    /// Host to inspect (default local)
    #[arg(long = "host", short = 'H')]
    pub host: Option<String>,

    /// Print the first free port in this range expression
    #[arg(long, value_name = "RANGE")]
    pub next: Option<String>,
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    pub kind: String,
    pub name: String,

    /// Number of trailing lines to print
    #[arg(long, short = 't', default_value_t = 20)]
    pub tail: usize,

    /// Keep printing new output until interrupted
    #[arg(long, short = 'f')]
    pub follow: bool,
}

#[derive(Args, Debug, Default)]
pub struct CleanArgs {
    #[arg(value_name = "TYPE|NAME")]
    pub targets: Vec<String>,

    /// Stop first, also delete purge files, then restart
    #[arg(long)]
    pub full: bool,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub kind: String,

    /// Installed version directory to switch to
    pub version: String,

    /// Name of the version link to move
    #[arg(long, short = 'b', default_value = crate::package::DEFAULT_BASE)]
    pub base: String,

    /// Host to update (default local)
    #[arg(long = "host", short = 'H')]
    pub host: Option<String>,

    /// Replace a link that points at another version
    #[arg(long, short = 'F')]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct HostArgs {
    #[command(subcommand)]
    pub command: HostCommand,
}

#[derive(Subcommand, Debug)]
pub enum HostCommand {
    /// Register a remote host
    Add(HostAddArgs),
    /// List registered remote hosts
    Ls,
}

#[derive(Args, Debug)]
pub struct HostAddArgs {
    pub name: String,

    /// `[user@]hostname[:port]`
    pub destination: String,

    /// Install root on the remote host
    #[arg(long)]
    pub root: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

impl ValueEnum for CompletionShell {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            CompletionShell::Bash,
            CompletionShell::Zsh,
            CompletionShell::Fish,
            CompletionShell::PowerShell,
            CompletionShell::Elvish,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        Some(match self {
            CompletionShell::Bash => PossibleValue::new("bash"),
            CompletionShell::Zsh => PossibleValue::new("zsh"),
            CompletionShell::Fish => PossibleValue::new("fish"),
            CompletionShell::PowerShell => PossibleValue::new("powershell"),
            CompletionShell::Elvish => PossibleValue::new("elvish"),
        })
    }
}

impl From<CompletionShell> for Shell {
    fn from(shell: CompletionShell) -> Self {
        match shell {
            CompletionShell::Bash => Shell::Bash,
            CompletionShell::Zsh => Shell::Zsh,
            CompletionShell::Fish => Shell::Fish,
            CompletionShell::PowerShell => Shell::PowerShell,
            CompletionShell::Elvish => Shell::Elvish,
        }
    }
}

mod handlers;
