//! Memory dump command implementation.

use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use anyhow::{Context, Result};
use ccpflash::{AddressExtension, ExtractJob};
use console::style;

use crate::backend::{open_session, station};
use crate::commands::{percent, progress_bar};
use crate::config::Config;
use crate::{Cli, CliError, was_interrupted};

/// Bytes per hex dump line.
const LINE_LEN: usize = LINE_STEP as usize;
const LINE_STEP: u32 = 16;

/// Dump command implementation.
pub(crate) fn cmd_dump(
    cli: &Cli,
    config: &Config,
    extension: AddressExtension,
    address: u32,
    length: usize,
    output: Option<&Path>,
    unlock: bool,
) -> Result<()> {
    if length == 0 {
        return Err(CliError::Usage("Length must be greater than zero".to_string()).into());
    }

    let station = station(cli, config);
    let mut job = ExtractJob::new(address, length)
        .with_station(station)
        .with_extension(extension)
        .with_retry(config.retry_policy());
    if unlock {
        job = job.with_password(config.password());
    }

    let mut session = open_session(cli, config)?;
    if was_interrupted() {
        return Err(CliError::Cancelled("Interrupted by user".to_string()).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} Reading {} bytes of {} @ 0x{:08X} from station {}",
            style("⏳").yellow(),
            length,
            extension,
            address,
            station
        );
    }

    let pb = progress_bar(cli.quiet);
    pb.set_message("Uploading");
    let data = session
        .extract(&job, &mut |done, total| {
            pb.set_position(percent(done, total));
        })
        .context("Dump failed")?;
    pb.finish_with_message("Complete");

    if let Some(path) = output {
        fs::write(path, &data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!(
                "{} Wrote {} bytes to {}",
                style("✓").green(),
                data.len(),
                path.display()
            );
        }
    } else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(hex_dump(address, &data).as_bytes())?;
        stdout.flush()?;
    }

    Ok(())
}

/// Format `data` as `address: bytes  |ascii|` lines.
fn hex_dump(address: u32, data: &[u8]) -> String {
    let mut out = String::new();
    let mut line_address = address;
    for line in data.chunks(LINE_LEN) {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();

        #[allow(clippy::unwrap_used)] // Writing to String cannot fail
        writeln!(
            out,
            "{line_address:08x}: {:<width$}  |{ascii}|",
            hex.join(" "),
            width = LINE_LEN * 3 - 1
        )
        .unwrap();
        line_address = line_address.wrapping_add(LINE_STEP);
    }
    out
}
