//! flashbridge CLI - compile, flash and monitor ESP32 boards.
//!
//! Wraps arduino-cli for builds and uploads, retries failed uploads through a
//! matrix of strategies and shares serial ports between observers.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use commands::build::{BuildArgs, cmd_compile, cmd_upload};
use commands::completions::{cmd_completions, cmd_completions_install};
use config::{Config, Overrides, Settings};

/// Whether stderr is a TTY (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if fancy output (spinners, emoji) should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed)
}

/// flashbridge - compile, flash and monitor ESP32 boards.
#[derive(Parser)]
#[command(name = "flashbridge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "FLASHBRIDGE_PORT")]
    port: Option<String>,

    /// Baud rate for serial monitoring.
    #[arg(short, long, global = true, env = "FLASHBRIDGE_BAUD")]
    baud: Option<u32>,

    /// Fully qualified board name (e.g. esp32:esp32:esp32).
    #[arg(long, visible_alias = "fqbn", global = true, env = "FLASHBRIDGE_BOARD")]
    board: Option<String>,

    /// Path to the arduino-cli binary.
    #[arg(long, global = true, env = "FLASHBRIDGE_ARDUINO_CLI")]
    arduino_cli: Option<PathBuf>,

    /// Verbose output level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port.clone(),
            baud: self.baud,
            board: self.board.clone(),
            tool_binary: self.arduino_cli.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Enumerate through the operating system instead of arduino-cli.
        #[arg(long)]
        native: bool,
    },

    /// List board platforms installed in arduino-cli.
    Cores {
        /// Output platform ids as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Compile a sketch without uploading it.
    Compile {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Compile a sketch and upload it, retrying with fallback strategies.
    Upload {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Force the board into its serial bootloader (RTS/DTR sequence).
    Reset,

    /// Open a serial monitor.
    Monitor {
        /// Print raw bytes instead of cleaned lines.
        #[arg(long)]
        raw: bool,
    },

    /// Serve the JSON client protocol over stdin/stdout.
    Bridge,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "flashbridge v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Completions need neither configuration nor a runtime
    if let Commands::Completions { shell, install } = &cli.command {
        if *install {
            return cmd_completions_install(*shell);
        }
        let Some(shell) = shell else {
            eprintln!(
                "{} specify a shell type, e.g.: flashbridge completions bash",
                style("Error:").red().bold()
            );
            eprintln!(
                "  Or use {} to auto-install completions.",
                style("flashbridge completions --install").cyan()
            );
            std::process::exit(1);
        };
        cmd_completions(*shell);
        return Ok(());
    }

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    let settings = config.resolve(cli.overrides());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(&cli, settings))
}

async fn run(cli: &Cli, settings: Settings) -> Result<()> {
    match &cli.command {
        Commands::ListPorts { json, native } => {
            commands::ports::cmd_list_ports(&settings, *json, *native).await
        },
        Commands::Cores { json } => commands::cores::cmd_cores(&settings, *json).await,
        Commands::Compile { build } => cmd_compile(cli, &settings, build).await,
        Commands::Upload { build } => cmd_upload(cli, &settings, build).await,
        Commands::Reset => commands::reset::cmd_reset(cli, &settings).await,
        Commands::Monitor { raw } => commands::monitor::cmd_monitor(cli, &settings, *raw).await,
        Commands::Bridge => commands::bridge::cmd_bridge(&settings).await,
        Commands::Completions { .. } => Ok(()),
    }
}

/// Port from the flags or configuration, or a usage error.
pub(crate) fn require_port(settings: &Settings) -> Result<String> {
    settings
        .port
        .clone()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "no serial port given; pass --port, set FLASHBRIDGE_PORT or add [serial] port to {}",
                config::LOCAL_CONFIG
            )
        })
}
