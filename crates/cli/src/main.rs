//! boardctl
//!
//! Command-line front end for the board manager: lists and watches boards,
//! uploads firmware and drives reset/reboot over USB.

mod commands;
mod config;
mod usb;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::setup_logging;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "boardctl")]
#[command(author, version, about = "Manage USB development boards")]
#[command(long_about = "
Track USB development boards across firmware and bootloader modes, upload
firmware and control them from the command line.

EXAMPLES:
    # List connected boards
    boardctl list

    # Print board events as they happen
    boardctl monitor

    # Upload to the board plugged in at a given port
    boardctl upload firmware.bin --board usb-1-2

    # Upload to a board by serial number, waiting for the button press
    boardctl upload firmware.bin --board '#1234567' --wait

BACKENDS:
    The bundled backend drives generic CDC-ACM serial devices, which offer
    serial transfers and reset only. `upload` and `reboot` need a backend
    that exposes a bootloader; without one they fail with a mode error.

CONFIGURATION:
    boardctl looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/boardctl/config.toml
    3. /etc/boardctl/config.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected boards
    List,

    /// Print board events until interrupted
    Monitor,

    /// Upload firmware to a board
    Upload {
        /// Firmware image (raw binary)
        file: PathBuf,

        /// Board to use: LOCATION, LOCATION#SERIAL or #SERIAL
        #[arg(short, long, value_name = "ID")]
        board: Option<String>,

        /// Do not reset the board once the upload is finished
        #[arg(long)]
        noreset: bool,

        /// Wait for the bootloader instead of rebooting
        #[arg(short, long)]
        wait: bool,

        /// Skip the firmware signature check
        #[arg(long)]
        nocheck: bool,
    },

    /// Reset a board
    Reset {
        #[arg(short, long, value_name = "ID")]
        board: Option<String>,
    },

    /// Reboot a board into its bootloader
    Reboot {
        #[arg(short, long, value_name = "ID")]
        board: Option<String>,
    },

    /// Print which board model a firmware image was built for
    Identify {
        file: PathBuf,
    },

    /// List supported board models
    Models,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = config::CliConfig::default();
        let path = config::CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::CliConfig::load_or_default()
    };

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;
    debug!("boardctl v{}, log level {}", env!("CARGO_PKG_VERSION"), log_level);

    let Some(command) = args.command else {
        info!("No command given, listing boards");
        return commands::list(&config);
    };

    match command {
        Command::List => commands::list(&config),
        Command::Monitor => commands::monitor(&config),
        Command::Upload {
            file,
            board,
            noreset,
            wait,
            nocheck,
        } => commands::upload(
            &config,
            &file,
            board.as_deref(),
            commands::UploadOptions {
                reset_after: config.upload.reset_after && !noreset,
                wait,
                nocheck,
            },
        ),
        Command::Reset { board } => commands::reset(&config, board.as_deref()),
        Command::Reboot { board } => commands::reboot(&config, board.as_deref()),
        Command::Identify { file } => commands::identify(&file),
        Command::Models => commands::models(),
    }
}
