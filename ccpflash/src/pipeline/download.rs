//! Block download pipeline.
//!
//! A buffer is written as a sequence of ≤6-byte chunks. The device stores
//! 16-bit words byte-swapped, so each chunk goes out with its byte pairs
//! swapped; an odd trailing byte stays in place and is followed by a zero
//! pad byte on the wire.
//!
//! Every five chunks the pipeline asks the device to verify the CRC of the
//! batch and restates the pointer, since the device only auto-increments
//! within one checksum batch:
//!
//! ```text
//! set_mta(a)  d6 d6 d6 d6 d6  build_checksum(crc, 30)
//! set_mta(a+30)  d6 d6 d(4)  build_checksum(crc, 16)
//! ```
//!
//! The sequence is produced by [`DownloadPlan`] so it can be inspected
//! offline, and executed by [`Session::download_block`].

use log::{debug, info};

use crate::error::{Error, Result};
use crate::pipeline::ProgressThrottle;
use crate::protocol::command::AddressExtension;
use crate::protocol::crc::Crc16;
use crate::session::Session;
use crate::transport::Transport;

/// Largest chunk of source bytes sent per download command.
pub const CHUNK_LEN: usize = 6;

/// Number of chunks covered by one `build_checksum`.
pub const CHUNKS_PER_BATCH: usize = 5;

/// Swap every byte pair of `chunk`. An odd trailing byte is kept as is.
pub fn swap_bytes(chunk: &[u8]) -> Vec<u8> {
    let mut swapped = Vec::with_capacity(chunk.len());
    for pair in chunk.chunks(2) {
        match pair {
            [low, high] => swapped.extend_from_slice(&[*high, *low]),
            _ => swapped.extend_from_slice(pair),
        }
    }
    swapped
}

/// One handler call of a block download.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DownloadStep {
    /// Point the MTA at `address`.
    SetMta {
        /// Memory region.
        extension: AddressExtension,
        /// Byte address.
        address: u32,
    },
    /// Write an even number of wire bytes, at most four.
    Download(Vec<u8>),
    /// Write six wire bytes.
    #[cfg_attr(feature = "serde", serde(rename = "download_6"))]
    Download6([u8; CHUNK_LEN]),
    /// Verify the batch written since the last `SetMta`.
    BuildChecksum {
        /// CRC-16 of the swapped source bytes.
        checksum: u16,
        /// Number of source bytes in the batch.
        length: u32,
    },
}

/// Totals of a finished (or planned) block download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DownloadSummary {
    /// Source bytes transferred.
    pub bytes: usize,
    /// Download commands issued.
    pub chunks: usize,
    /// Checksum batches verified.
    pub batches: usize,
    /// CRC-16 over every swapped source byte.
    pub continuous_checksum: u16,
}

/// Iterator over the steps of a block download.
#[derive(Debug, Clone)]
pub struct DownloadPlan<'a> {
    data: &'a [u8],
    extension: AddressExtension,
    address: u32,
    offset: usize,
    restate_mta: bool,
    chunks_in_batch: usize,
    batch: Crc16,
    continuous: Crc16,
    chunks: usize,
    batches: usize,
}

impl<'a> DownloadPlan<'a> {
    /// Plan the download of `data` to `address` in `extension`.
    pub fn new(extension: AddressExtension, address: u32, data: &'a [u8]) -> Result<Self> {
        u32::try_from(data.len())
            .ok()
            .and_then(|len| address.checked_add(len.saturating_sub(1)))
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "{} bytes at {address:#x} exceed the 32-bit address space",
                    data.len()
                ))
            })?;

        Ok(Self {
            data,
            extension,
            address,
            offset: 0,
            restate_mta: true,
            chunks_in_batch: 0,
            batch: Crc16::new(),
            continuous: Crc16::new(),
            chunks: 0,
            batches: 0,
        })
    }

    /// Source bytes handed out so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    /// Totals of the steps produced so far.
    pub fn summary(&self) -> DownloadSummary {
        DownloadSummary {
            bytes: self.offset,
            chunks: self.chunks,
            batches: self.batches,
            continuous_checksum: self.continuous.value(),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // Bounded by the check in `new`
    fn current_address(&self) -> u32 {
        self.address + self.offset as u32
    }

    #[allow(clippy::cast_possible_truncation)] // A batch is at most 30 bytes
    fn flush(&mut self) -> DownloadStep {
        let step = DownloadStep::BuildChecksum {
            checksum: self.batch.value(),
            length: self.batch.len() as u32,
        };
        self.batch.reset();
        self.chunks_in_batch = 0;
        self.batches += 1;
        self.restate_mta = self.offset < self.data.len();
        step
    }
}

impl Iterator for DownloadPlan<'_> {
    type Item = DownloadStep;

    fn next(&mut self) -> Option<DownloadStep> {
        if self.restate_mta {
            self.restate_mta = false;
            return Some(DownloadStep::SetMta {
                extension: self.extension,
                address: self.current_address(),
            });
        }

        let exhausted = self.offset >= self.data.len();
        if self.chunks_in_batch == CHUNKS_PER_BATCH || (exhausted && !self.batch.is_empty()) {
            return Some(self.flush());
        }
        if exhausted {
            return None;
        }

        let end = (self.offset + CHUNK_LEN).min(self.data.len());
        let mut wire = swap_bytes(&self.data[self.offset..end]);
        self.batch.update(&wire);
        self.continuous.update(&wire);
        self.offset = end;
        self.chunks += 1;
        self.chunks_in_batch += 1;

        if wire.len() % 2 != 0 {
            wire.push(0);
        }
        Some(match <[u8; CHUNK_LEN]>::try_from(wire.as_slice()) {
            Ok(six) => DownloadStep::Download6(six),
            Err(_) => DownloadStep::Download(wire),
        })
    }
}

impl<T: Transport> Session<T> {
    /// Execute a single download step.
    pub fn apply(&mut self, step: &DownloadStep) -> Result<()> {
        match step {
            DownloadStep::SetMta { extension, address } => self.set_mta(*extension, *address),
            DownloadStep::Download(data) => self.download(data),
            DownloadStep::Download6(data) => self.download_6(data),
            DownloadStep::BuildChecksum { checksum, length } => {
                self.build_checksum(*checksum, *length)
            },
        }
    }

    /// Write `data` to `address` in `extension`, verifying every batch.
    ///
    /// `progress` receives `(bytes_done, total)` whenever at least 1% more
    /// of the buffer has been written, and once at the end.
    pub fn download_block(
        &mut self,
        extension: AddressExtension,
        address: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<DownloadSummary> {
        let mut plan = DownloadPlan::new(extension, address, data)?;
        let mut throttle = ProgressThrottle::new(data.len());
        info!(
            "Downloading {} bytes to {extension} at {address:#010x}",
            data.len()
        );

        while let Some(step) = plan.next() {
            self.apply(&step)?;
            if let DownloadStep::BuildChecksum { checksum, length } = step {
                debug!("Batch verified: {length} bytes, crc {checksum:#06x}");
            }
            if throttle.update(plan.consumed()) {
                progress(plan.consumed(), data.len());
            }
        }

        let summary = plan.summary();
        info!(
            "Download complete: {} chunks, {} batches, crc {:#06x}",
            summary.chunks, summary.batches, summary.continuous_checksum
        );
        Ok(summary)
    }
}
