//! Complete bootloader sequences.
//!
//! Each job runs the whole connect → … → disconnect sequence. A failure is
//! returned as soon as it happens, leaving the session where it stopped;
//! whether to reset, reconnect or give up is up to the caller.

use log::info;

use crate::error::Result;
use crate::pipeline::DownloadSummary;
use crate::protocol::command::{AddressExtension, Password};
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::transport::Transport;

/// Firmware download job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashJob {
    /// Station address to connect to.
    pub station: u8,
    /// Unlock secret.
    pub password: Password,
    /// Target memory region.
    pub extension: AddressExtension,
    /// Start address.
    pub address: u32,
    /// Whether to clear memory before downloading.
    pub erase: bool,
    /// Connect retry policy.
    pub retry: RetryPolicy,
}

impl FlashJob {
    /// Flash to `address` in program flash of station 0.
    pub fn new(address: u32) -> Self {
        Self {
            station: 0,
            password: Password::DspFlash,
            extension: AddressExtension::FlashMemory,
            address,
            erase: true,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the station address.
    #[must_use]
    pub fn with_station(mut self, station: u8) -> Self {
        self.station = station;
        self
    }

    /// Set the unlock secret.
    #[must_use]
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = password;
        self
    }

    /// Set the target memory region.
    #[must_use]
    pub fn with_extension(mut self, extension: AddressExtension) -> Self {
        self.extension = extension;
        self
    }

    /// Enable or disable the erase step.
    #[must_use]
    pub fn with_erase(mut self, erase: bool) -> Self {
        self.erase = erase;
        self
    }

    /// Set the connect retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Memory extraction job (data logger read-out).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractJob {
    /// Station address to connect to.
    pub station: u8,
    /// Unlock secret, if the region is protected.
    pub password: Option<Password>,
    /// Source memory region.
    pub extension: AddressExtension,
    /// Start address.
    pub address: u32,
    /// Number of bytes to read.
    pub length: usize,
    /// Connect retry policy.
    pub retry: RetryPolicy,
}

impl ExtractJob {
    /// Read `length` bytes at `address` from the data logger of station 0.
    pub fn new(address: u32, length: usize) -> Self {
        Self {
            station: 0,
            password: None,
            extension: AddressExtension::DATA_LOGGER,
            address,
            length,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the station address.
    #[must_use]
    pub fn with_station(mut self, station: u8) -> Self {
        self.station = station;
        self
    }

    /// Unlock with `password` before reading.
    #[must_use]
    pub fn with_password(mut self, password: Password) -> Self {
        self.password = Some(password);
        self
    }

    /// Set the source memory region.
    #[must_use]
    pub fn with_extension(mut self, extension: AddressExtension) -> Self {
        self.extension = extension;
        self
    }

    /// Set the connect retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl<T: Transport> Session<T> {
    /// Flash `data` as described by `job`.
    ///
    /// Runs connect, unlock, set_mta, clear_memory (if enabled), the block
    /// download and disconnect.
    pub fn flash(
        &mut self,
        job: &FlashJob,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<DownloadSummary> {
        self.connect_with_retry(job.station, &job.retry)?;
        self.unlock(job.password)?;
        self.set_mta(job.extension, job.address)?;

        if job.erase {
            info!("Erasing {}", job.extension);
            self.clear_memory()?;
        }

        let summary = self.download_block(job.extension, job.address, data, progress)?;
        self.disconnect()?;

        info!("Flashing complete!");
        Ok(summary)
    }

    /// Read the region described by `job`.
    pub fn extract(
        &mut self,
        job: &ExtractJob,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<Vec<u8>> {
        self.connect_with_retry(job.station, &job.retry)?;
        if let Some(password) = job.password {
            self.unlock(password)?;
        }

        let data = self.upload_block(job.extension, job.address, job.length, progress)?;
        self.disconnect()?;

        info!("Read {} bytes from {}", data.len(), job.extension);
        Ok(data)
    }

    /// Erase `extension` on `station`.
    pub fn erase(
        &mut self,
        station: u8,
        password: Password,
        extension: AddressExtension,
        retry: &RetryPolicy,
    ) -> Result<()> {
        self.connect_with_retry(station, retry)?;
        self.unlock(password)?;
        self.set_mta(extension, 0)?;

        info!("Erasing {extension}");
        self.clear_memory()?;
        self.disconnect()
    }
}
