//! arkdrop-cli library
//!
//! Command-line front end for the ARK Drop service.
//!
//! This library provides:
//! - `listen`: run a node that waits for drops and stores accepted files in a
//!   receive directory.
//! - `send`: offer files or whole directories to a listening node.
//! - `config`: inspect and change the persisted CLI configuration.
//!
//! Progress/UI
//! - Uses indicatif to show one progress bar per transfer.
//! - Logs go to stderr through `tracing`; `RUST_LOG` overrides the level,
//!   `--verbose` raises the default from `info` to `debug`.
//!
//! Configuration
//! - Stored in $XDG_CONFIG_HOME/arkdrop/config.toml or
//!   $HOME/.config/arkdrop/config.toml if XDG_CONFIG_HOME is not set.
//!
//! Example
//! ```no_run
//! use arkdrop_cli::run_send;
//! # async fn demo() -> anyhow::Result<()> {
//! run_send("192.168.1.20:4242".into(), vec!["/tmp/a.bin".into()], None).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod listen;
mod progress;
mod send;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

pub use config::{
    CliConfig, clear_default_receive_dir, default_receive_dir_fallback,
    get_default_receive_dir, set_default_receive_dir,
};
pub use listen::{DEFAULT_PORT, ListenOptions, run_listen};
pub use progress::TransferProgress;
pub use send::{collect_manifest, run_send};

#[derive(Parser, Debug)]
#[command(name = "arkdrop-cli", version)]
#[command(about = "ARK Drop tool for sending and receiving files", long_about = None)]
pub struct Cli {
    /// Print debug logs.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(about = "Wait for incoming drops")]
    Listen(ListenArgs),
    #[command(about = "Send files to a listening node")]
    Send(SendArgs),
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        subcommand: ConfigCommand,
    },
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[arg(short, long, default_value_t = DEFAULT_PORT, help = "Port to listen on")]
    port: u16,
    #[arg(short, long, help = "Name shown to senders")]
    name: Option<String>,
    #[arg(short, long, help = "Directory for received files")]
    dir: Option<PathBuf>,
    #[arg(long, help = "Accept every drop without asking")]
    auto_accept: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[arg(help = "Address of the receiver, e.g. 192.168.1.20:4242")]
    addr: String,
    #[arg(required = true, help = "Files or directories to send")]
    files: Vec<PathBuf>,
    #[arg(short, long, help = "Name shown to the receiver")]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    #[command(about = "Show the current configuration")]
    Show,
    #[command(about = "Set the default receive directory")]
    SetReceiveDir {
        #[arg(help = "Directory for received files")]
        dir: PathBuf,
    },
    #[command(about = "Forget the default receive directory")]
    ClearReceiveDir,
}

/// Parses the command line and runs the selected command.
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Listen(listen) => {
            run_listen(ListenOptions {
                port: listen.port,
                name: listen.name,
                dir: listen.dir,
                auto_accept: listen.auto_accept,
            })
            .await
        }
        Command::Send(send) => run_send(send.addr, send.files, send.name).await,
        Command::Config { subcommand } => run_config(subcommand),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let _ = fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .try_init();
}

fn run_config(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = CliConfig::load()?;
            match &config.default_receive_dir {
                Some(dir) => println!("Receive directory: {dir}"),
                None => println!(
                    "No default receive directory set (using {})",
                    default_receive_dir_fallback().display()
                ),
            }
            println!("Display name: {}", config.display_name());
            if let Some(id) = &config.peer_id {
                println!("Peer id: {id}");
            }
            println!();
            println!("[drop]");
            print!(
                "{}",
                toml::to_string_pretty(&config.drop)
                    .context("Failed to serialize config")?
            );
            Ok(())
        }
        ConfigCommand::SetReceiveDir { dir } => {
            let dir = dir.to_string_lossy().to_string();
            set_default_receive_dir(dir.clone())?;
            println!("Saved '{dir}' as default receive directory");
            Ok(())
        }
        ConfigCommand::ClearReceiveDir => {
            clear_default_receive_dir()?;
            println!("Default receive directory cleared");
            Ok(())
        }
    }
}
