//! ccpflash CLI - Command-line tool for CCP bootloader targets.
//!
//! ## Features
//!
//! - Flash binary images with batch checksums
//! - Dump memory regions (data logger read-out)
//! - Erase memory regions
//! - Preview the download command sequence offline
//! - Shell completion generation
//! - Environment variable support

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use ccpflash::AddressExtension;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, warn};

mod backend;
mod commands;
mod config;

use backend::Backend;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user asked to stop (Ctrl-C).
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation detected after argument parsing.
    #[error("{0}")]
    Usage(String),
    /// The operation was cancelled by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// ccpflash - Flash and read CCP bootloader targets.
///
/// Environment variables:
///   CCPFLASH_STATION   - Station address to connect to
///   CCPFLASH_BACKEND   - Bus backend (default: sim)
#[derive(Parser)]
#[command(name = "ccpflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Station address of the target.
    #[arg(short, long, global = true, env = "CCPFLASH_STATION")]
    station: Option<u8>,

    /// Bus backend.
    #[arg(
        short,
        long,
        global = true,
        value_enum,
        default_value = "sim",
        env = "CCPFLASH_BACKEND"
    )]
    backend: Backend,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a binary image.
    Flash {
        /// Path to the image file.
        image: PathBuf,

        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Target memory region.
        #[arg(short, long, value_parser = parse_extension, default_value = "flash_memory")]
        extension: AddressExtension,

        /// Skip the clear_memory step.
        #[arg(long)]
        no_erase: bool,

        /// Read the region back and compare after flashing.
        #[arg(long)]
        verify: bool,
    },

    /// Read a memory region.
    Dump {
        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Number of bytes to read (decimal, or hex with 0x).
        #[arg(short, long, value_parser = parse_length)]
        length: usize,

        /// Source memory region.
        #[arg(short, long, value_parser = parse_extension, default_value = "data_logger")]
        extension: AddressExtension,

        /// Write raw bytes to this file instead of a hex dump on stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Unlock the target before reading.
        #[arg(long)]
        unlock: bool,
    },

    /// Erase a memory region.
    Erase {
        /// Memory region to erase.
        #[arg(short, long, value_parser = parse_extension, default_value = "flash_memory")]
        extension: AddressExtension,
    },

    /// Show the command sequence a flash would send, without a target.
    Plan {
        /// Path to the image file.
        image: PathBuf,

        /// Start address.
        #[arg(short, long, value_parser = parse_hex_u32, default_value = "0")]
        address: u32,

        /// Target memory region.
        #[arg(short, long, value_parser = parse_extension, default_value = "flash_memory")]
        extension: AddressExtension,

        /// Output the plan as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x00_80_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a byte count, decimal or 0x-prefixed hex.
fn parse_length(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("Invalid length: {e}"))
}

/// Parse an address extension by name.
fn parse_extension(s: &str) -> Result<AddressExtension, String> {
    AddressExtension::from_name(s).ok_or_else(|| {
        format!(
            "Unknown address extension '{s}'. Expected one of: flash_memory, \
             configuration_registers, eeprom_memory_bootloader, eeprom_memory_data, \
             raw, data_logger"
        )
    })
}

/// Exit code for a failed run.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_error) = cause.downcast_ref::<CliError>() {
            return match cli_error {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(ccpflash::Error::Cancelled) = cause.downcast_ref::<ccpflash::Error>() {
            return 130;
        }
    }
    1
}

fn init_logging(cli: &Cli) {
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
}

fn main() -> ExitCode {
    // NO_COLOR and TTY detection
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "ccpflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        warn!("Could not install Ctrl-C handler: {e}");
    }
    ccpflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&e))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            address,
            extension,
            no_erase,
            verify,
        } => commands::flash::cmd_flash(
            cli,
            &config,
            image,
            *extension,
            *address,
            !*no_erase,
            *verify,
        ),
        Commands::Dump {
            address,
            length,
            extension,
            output,
            unlock,
        } => commands::dump::cmd_dump(
            cli,
            &config,
            *extension,
            *address,
            *length,
            output.as_deref(),
            *unlock,
        ),
        Commands::Erase { extension } => commands::flash::cmd_erase(cli, &config, *extension),
        Commands::Plan {
            image,
            address,
            extension,
            json,
        } => commands::plan::cmd_plan(image, *extension, *address, *json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "ccpflash",
            "--station",
            "4",
            "flash",
            "image.bin",
            "--address",
            "0x8000",
            "--extension",
            "eeprom_memory_data",
            "--no-erase",
            "--verify",
        ])
        .unwrap();
        assert_eq!(cli.station, Some(4));
        assert_eq!(cli.backend, Backend::Sim);
        if let Commands::Flash {
            image,
            address,
            extension,
            no_erase,
            verify,
        } = cli.command
        {
            assert_eq!(image.to_str().unwrap(), "image.bin");
            assert_eq!(address, 0x8000);
            assert_eq!(extension, AddressExtension::EepromMemoryData);
            assert!(no_erase);
            assert!(verify);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_flash_defaults() {
        let cli = Cli::try_parse_from(["ccpflash", "flash", "fw.bin"]).unwrap();
        assert!(cli.station.is_none());
        if let Commands::Flash {
            address,
            extension,
            no_erase,
            ..
        } = cli.command
        {
            assert_eq!(address, 0);
            assert_eq!(extension, AddressExtension::FlashMemory);
            assert!(!no_erase);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_dump() {
        let cli = Cli::try_parse_from([
            "ccpflash", "dump", "-a", "0x400", "-l", "0x100", "-o", "out.bin",
        ])
        .unwrap();
        if let Commands::Dump {
            address,
            length,
            extension,
            output,
            unlock,
        } = cli.command
        {
            assert_eq!(address, 0x400);
            assert_eq!(length, 256);
            assert_eq!(extension, AddressExtension::DATA_LOGGER);
            assert_eq!(output.unwrap().to_str().unwrap(), "out.bin");
            assert!(!unlock);
        } else {
            panic!("Expected Dump command");
        }
    }

    #[test]
    fn test_cli_parse_dump_requires_length() {
        assert!(Cli::try_parse_from(["ccpflash", "dump"]).is_err());
    }

    #[test]
    fn test_cli_parse_plan_json() {
        let cli = Cli::try_parse_from(["ccpflash", "plan", "fw.bin", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Plan { json: true, .. }));
    }

    #[test]
    fn test_cli_parse_global_after_subcommand() {
        let cli = Cli::try_parse_from(["ccpflash", "erase", "-vv", "--quiet"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_rejects_unknown_extension() {
        assert!(Cli::try_parse_from(["ccpflash", "erase", "--extension", "rom"]).is_err());
    }

    // ---- value parsers ----

    #[test]
    fn test_parse_hex_u32() {
        assert_eq!(parse_hex_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex_u32("0X00_80_00_00"), Ok(0x0080_0000));
        assert_eq!(parse_hex_u32("ff"), Ok(0xFF));
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_length() {
        assert_eq!(parse_length("1024"), Ok(1024));
        assert_eq!(parse_length("0x400"), Ok(1024));
        assert_eq!(parse_length("64_000"), Ok(64_000));
        assert!(parse_length("-1").is_err());
        assert!(parse_length("lots").is_err());
    }

    #[test]
    fn test_parse_extension() {
        assert_eq!(parse_extension("raw"), Ok(AddressExtension::FlashMemory));
        assert_eq!(
            parse_extension("data-logger"),
            Ok(AddressExtension::ConfigurationRegisters)
        );
        assert!(parse_extension("sram").is_err());
    }

    // ---- exit codes ----

    #[test]
    fn test_exit_code_mapping() {
        let usage = anyhow::Error::from(CliError::Usage("bad".into()));
        assert_eq!(exit_code_for(&usage), 2);

        let cancelled = anyhow::Error::from(CliError::Cancelled("stop".into()));
        assert_eq!(exit_code_for(&cancelled), 130);

        let interrupted = anyhow::Error::from(ccpflash::Error::Cancelled).context("Flashing failed");
        assert_eq!(exit_code_for(&interrupted), 130);

        let other = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&other), 1);
    }
}
