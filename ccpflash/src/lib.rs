//! # ccpflash
//!
//! A client for CAN Calibration Protocol (CCP) bootloaders.
//!
//! This crate implements the host side of the bootloader sub-protocol:
//!
//! - 8-byte command/reply frame codec with 29-bit identifiers
//! - CRC-16 (reflected polynomial 0xA001) checksum engine
//! - A single-transaction protocol state machine with counter matching and
//!   timeouts
//! - Block download (chunking, batch and continuous CRCs) and block upload
//! - Flash, erase and extraction jobs
//!
//! The CAN driver itself is not part of this crate. Frames are exchanged
//! through the [`Transport`] trait; [`ChannelTransport`] bridges to a bus
//! thread owned by the application and [`SimTransport`] runs an in-process
//! bootloader model.
//!
//! ## Features
//!
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccpflash::{FlashJob, HandlerConfig, Session, SimTransport, SimulatedTarget};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = std::fs::read("firmware.bin")?;
//!
//!     let target = SimulatedTarget::new(0, 64 * 1024);
//!     let mut session = Session::new(SimTransport::new(target), HandlerConfig::default());
//!
//!     let job = FlashJob::new(0x0000);
//!     let summary = session.flash(&job, &image, &mut |current, total| {
//!         println!("Flashing: {}/{}", current, total);
//!     })?;
//!     println!("crc {:#06x}", summary.continuous_checksum);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod handler;
pub mod jobs;
pub mod pipeline;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by blocking session waits.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
pub use {
    error::{Error, Result},
    handler::{Completion, Handler, HandlerConfig, HandlerState, Outcome, Pending},
    jobs::{ExtractJob, FlashJob},
    pipeline::{DownloadPlan, DownloadStep, DownloadSummary, ProgressThrottle},
    protocol::{
        AddressExtension, BootloaderReply, CommandCode, CommandStatus, ErrorCategory, Frame,
        HostCommand, Packet, Password, RecoveryAction, crc16, decode, encode_command,
    },
    retry::{RetryPolicy, retry},
    session::Session,
    transport::{BusEnd, ChannelTransport, SimTransport, SimulatedTarget, Transport},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        assert!(!is_interrupted_requested());
    }
}
