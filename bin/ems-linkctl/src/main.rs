//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command line client for Edges and backends."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ems_link_common::{ClientConfig, ConnectionMode};
use tracing::debug;

mod commands;

const CONFIG_CANDIDATES: &[&str] = &["ems-link.toml", "/etc/ems-link/client.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "Talk JSON-RPC to an Edge or a backend", long_about = None)]
struct Cli {
    /// Configuration file (falls back to EMS_LINK_CONFIG, then ./ems-link.toml).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the endpoint URL.
    #[arg(long, value_name = "URL", global = true)]
    url: Option<String>,

    /// Override the connection mode.
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,

    /// Write logs to the configured directory instead of stderr only.
    #[arg(long = "log-to-file", action = clap::ArgAction::SetTrue, global = true)]
    log_to_file: bool,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
pub struct CredentialArgs {
    /// User name (backends only).
    #[arg(long, short = 'u', env = "EMS_LINK_USER", global = true)]
    username: Option<String>,

    /// Password.
    #[arg(long, short = 'p', env = "EMS_LINK_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Session token from a previous login.
    #[arg(long, env = "EMS_LINK_TOKEN", hide_env_values = true, global = true, conflicts_with = "password")]
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Direct,
    Backend,
}

impl From<ModeArg> for ConnectionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Direct => ConnectionMode::Direct,
            ModeArg::Backend => ConnectionMode::Backend,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Log in and print the token and visible Edges.
    Login,
    /// Stream channel values of one Edge until interrupted.
    Watch(commands::WatchArgs),
    /// Send one request to an Edge and print the result.
    Call(commands::CallArgs),
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_path(path)?,
        None => match ClientConfig::load_with_source(CONFIG_CANDIDATES) {
            Ok(loaded) => loaded.config,
            Err(err) => {
                debug!(error = %err, "using built-in defaults");
                ClientConfig::default()
            }
        },
    };
    if let Some(url) = &cli.url {
        config.endpoint.url = url.clone();
    }
    if let Some(mode) = cli.mode {
        config.endpoint.mode = mode.into();
    }
    config.validate().context("invalid client configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    if cli.log_to_file {
        ems_link_common::init_tracing("ems-linkctl", &config.logging)?;
    } else {
        ems_link_logging::init();
    }

    match cli.command {
        Commands::Login => commands::login(&config, &cli.credentials).await,
        Commands::Watch(args) => commands::watch(&config, &cli.credentials, args).await,
        Commands::Call(args) => commands::call(&config, &cli.credentials, args).await,
    }
}
