//! Flash and erase command implementations.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use ccpflash::pipeline::swap_bytes;
use ccpflash::{AddressExtension, ExtractJob, FlashJob};
use console::style;

use crate::backend::{open_session, station};
use crate::commands::{percent, progress_bar};
use crate::config::Config;
use crate::{Cli, CliError, was_interrupted};

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".to_string()).into())
    } else {
        Ok(())
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    image: &Path,
    extension: AddressExtension,
    address: u32,
    erase: bool,
    verify: bool,
) -> Result<()> {
    let data = fs::read(image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("Image {} is empty", image.display())).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            image.display(),
            data.len()
        );
    }

    let station = station(cli, config);
    let job = FlashJob::new(address)
        .with_station(station)
        .with_password(config.password())
        .with_extension(extension)
        .with_erase(erase)
        .with_retry(config.retry_policy());

    let mut session = open_session(cli, config)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Flashing {} @ 0x{:08X} on station {}",
            style("⏳").yellow(),
            extension,
            address,
            station
        );
    }

    let pb = progress_bar(cli.quiet);
    pb.set_message("Downloading");
    let summary = session
        .flash(&job, &data, &mut |done, total| {
            pb.set_position(percent(done, total));
        })
        .context("Flashing failed")?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "{} {} bytes in {} chunks, {} checksum batches, CRC 0x{:04X}",
            style("✓").green(),
            summary.bytes,
            summary.chunks,
            summary.batches,
            summary.continuous_checksum
        );
    }

    if verify {
        ensure_not_interrupted()?;
        let job = ExtractJob::new(address, data.len())
            .with_station(station)
            .with_extension(extension)
            .with_retry(config.retry_policy());
        let readback = session
            .extract(&job, &mut |_, _| {})
            .context("Read-back failed")?;

        // memory holds the byte-swapped words
        if readback != swap_bytes(&data) {
            bail!("Verification failed: read-back differs from image");
        }
        if !cli.quiet {
            eprintln!("{} Verified", style("✓").green());
        }
    }

    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }

    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config, extension: AddressExtension) -> Result<()> {
    let station = station(cli, config);
    let mut session = open_session(cli, config)?;
    ensure_not_interrupted()?;

    if !cli.quiet {
        eprintln!(
            "{} Erasing {} on station {}",
            style("🗑").red(),
            extension,
            station
        );
    }

    session
        .erase(station, config.password(), extension, &config.retry_policy())
        .context("Erase failed")?;

    if !cli.quiet {
        eprintln!("\n{} Erase completed", style("✓").green().bold());
    }

    Ok(())
}
