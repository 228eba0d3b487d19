// SPDX-FileCopyrightText: © 2025 MediaCore Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use schemars::schema_for;
use tracing::warn;

use crate::{config, play};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mediactl.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plays a source into a headless renderer and prints the session totals
    Play(PlayArgs),
    /// Lists capture devices of the virtual capture backend
    Devices,
    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(clap::Args, Debug)]
pub struct PlayArgs {
    /// Source URI (file://, http(s)://, rtmp://, synthetic://)
    pub uri: String,

    /// Stop after this many seconds if the source has not finished
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Start muted
    #[arg(long)]
    pub mute: bool,

    /// Capture one snapshot once playback starts and report its size
    #[arg(long)]
    pub snapshot: bool,

    /// Print each statistics snapshot as a JSON line
    #[arg(long)]
    pub stats: bool,

    /// Headless surface size
    #[arg(long, default_value_t = 1280)]
    pub width: u32,
    #[arg(long, default_value_t = 720)]
    pub height: u32,
}

/// Handle the "config default" command - print default config to stdout
// Allow println for CLI output to stdout (intentional)
#[allow(clippy::disallowed_macros)]
fn handle_config_default_command() -> anyhow::Result<()> {
    let toml_string = config::generate_default()?;
    println!("# Default mediactl configuration file");
    println!("{toml_string}");
    Ok(())
}

/// Handle the "config schema" command - print JSON schema to stdout
#[allow(clippy::disallowed_macros)]
fn handle_config_schema_command() -> anyhow::Result<()> {
    let schema = schema_for!(mediacore_core::CoreConfig);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn load_config(config_path: &str) -> anyhow::Result<config::ConfigLoadResult> {
    let mut result = config::load(config_path)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    // The CLI is its own host, so the core installs the log sink.
    result.config.log.install = true;
    Ok(result)
}

/// Handle CLI commands
pub fn handle_command(cli: &Cli) -> anyhow::Result<()> {
    let result = match &cli.command {
        Commands::Play(args) => {
            let config = load_config(&cli.config)?;
            play::run(config, args)
        },
        Commands::Devices => {
            let config = load_config(&cli.config)?;
            play::list_devices(config)
        },
        Commands::Config(ConfigCommands::Default) => handle_config_default_command(),
        Commands::Config(ConfigCommands::Schema) => handle_config_schema_command(),
    };
    result.inspect_err(|e| warn!(error = %e, "Command failed"))
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Generate a default config file and print it to stdout
    Default,
    /// Generate a JSON schema for the config and print it to stdout
    Schema,
}
