//! AVD Demon - Android Virtual Device lifecycle manager
//!
//! This is the binary entry point. All logic lives in the library.

use std::io;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};

use avd_demon::cli;
use avdemon_app::config::{default_config_dir, load_settings};
use avdemon_app::Engine;
use avdemon_core::logging;

/// AVD Demon - start, stop and watch Android Virtual Devices
#[derive(Parser, Debug)]
#[command(name = "avdemon")]
#[command(about = "Start, stop and watch Android Virtual Devices", long_about = None)]
struct Args {
    /// Directory holding config.toml (defaults to the platform config dir)
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all AVDs and whether they are running
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Launch an AVD and wait for it to show up
    Start {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Stop a running AVD
    Stop {
        #[arg(value_name = "NAME")]
        name: String,
    },
    /// Stream state changes as NDJSON until interrupted
    Watch,
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Store the Android SDK root
    SetSdk {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if let Err(e) = logging::init() {
        eprintln!("Warning: logging disabled: {}", e);
    }

    let config_dir = args
        .config_dir
        .or_else(default_config_dir)
        .ok_or_else(|| eyre!("Could not determine a configuration directory; pass --config-dir"))?;

    let mut stdout = io::stdout().lock();

    match args.command {
        Command::Config { action } => match action {
            ConfigAction::Show => cli::config_show(&config_dir, &mut stdout)?,
            ConfigAction::SetSdk { path } => cli::config_set_sdk(&config_dir, &path, &mut stdout)?,
        },
        Command::Watch => {
            drop(stdout);
            avd_demon::run_headless(load_settings(&config_dir)).await?;
        }
        command => {
            let mut engine = Engine::new(load_settings(&config_dir));
            let result = match command {
                Command::List { json } => cli::list(&engine, json, &mut stdout).await,
                Command::Start { name } => cli::start(&engine, &name, &mut stdout).await,
                Command::Stop { name } => cli::stop(&engine, &name, &mut stdout).await.map(|_| ()),
                Command::Watch | Command::Config { .. } => Ok(()),
            };
            engine.shutdown().await;
            result?;
        }
    }

    Ok(())
}
