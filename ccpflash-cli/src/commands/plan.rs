//! Offline download plan command.

use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use anyhow::{Context, Result};
use ccpflash::{AddressExtension, DownloadPlan, DownloadStep, DownloadSummary};
use serde::Serialize;

/// JSON document printed by `plan --json`.
#[derive(Debug, Serialize)]
struct PlanReport {
    extension: AddressExtension,
    address: u32,
    steps: Vec<DownloadStep>,
    summary: DownloadSummary,
}

/// Plan command implementation.
pub(crate) fn cmd_plan(
    image: &Path,
    extension: AddressExtension,
    address: u32,
    json: bool,
) -> Result<()> {
    let data = fs::read(image)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let report = build_report(extension, address, &data)?;

    let mut stdout = io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut stdout, &report)?;
        writeln!(stdout)?;
    } else {
        for step in &report.steps {
            writeln!(stdout, "{}", describe(step))?;
        }
        writeln!(
            stdout,
            "{} bytes, {} chunks, {} batches, crc 0x{:04x}",
            report.summary.bytes,
            report.summary.chunks,
            report.summary.batches,
            report.summary.continuous_checksum
        )?;
    }
    stdout.flush()?;
    Ok(())
}

fn build_report(extension: AddressExtension, address: u32, data: &[u8]) -> Result<PlanReport> {
    let mut plan = DownloadPlan::new(extension, address, data)?;
    let steps: Vec<DownloadStep> = plan.by_ref().collect();
    Ok(PlanReport {
        extension,
        address,
        steps,
        summary: plan.summary(),
    })
}

/// One line per step.
fn describe(step: &DownloadStep) -> String {
    match step {
        DownloadStep::SetMta { extension, address } => {
            format!("set_mta        {extension} 0x{address:08x}")
        },
        DownloadStep::Download(bytes) => format!("download       {}", hex(bytes)),
        DownloadStep::Download6(bytes) => format!("download_6     {}", hex(bytes)),
        DownloadStep::BuildChecksum { checksum, length } => {
            format!("build_checksum 0x{checksum:04x} length {length}")
        },
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
