mod cli;
mod error;
mod host;
mod instance;
mod lifecycle;
mod logging;
mod package;
mod ports;
mod record;
mod registry;
mod resolve;
mod session;
mod settings;

use anyhow::Result;
use clap::Parser;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    cli::Cli::parse().execute().await
}
