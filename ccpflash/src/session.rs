//! Blocking session driver.
//!
//! [`Session`] owns a [`Transport`] and a [`Handler`] and turns every
//! handler operation into a blocking call: the command is sent, then inbound
//! frames are pumped into the handler until the transaction resolves or its
//! deadline passes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ccpflash::{AddressExtension, HandlerConfig, Password, Session, SimTransport, SimulatedTarget};
//!
//! fn main() -> ccpflash::Result<()> {
//!     let target = SimulatedTarget::new(0, 64 * 1024);
//!     let mut session = Session::new(SimTransport::new(target), HandlerConfig::default());
//!
//!     session.connect(0)?;
//!     session.unlock(Password::DspFlash)?;
//!     session.set_mta(AddressExtension::FlashMemory, 0)?;
//!     session.clear_memory()?;
//!     session.download_block(AddressExtension::FlashMemory, 0, &[0u8; 64], &mut |_, _| {})?;
//!     session.disconnect()?;
//!
//!     Ok(())
//! }
//! ```

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerConfig, HandlerState, Outcome, Pending};
use crate::protocol::command::{AddressExtension, Password};
use crate::retry::RetryPolicy;
use crate::transport::Transport;

/// Longest single wait on the transport, so interruption is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Blocking CCP session over a transport.
pub struct Session<T: Transport> {
    transport: T,
    handler: Handler,
}

impl<T: Transport> Session<T> {
    /// Create a session over `transport`.
    pub fn new(transport: T, config: HandlerConfig) -> Self {
        Self {
            transport,
            handler: Handler::new(config),
        }
    }

    /// The protocol handler.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Current handler state.
    pub fn state(&self) -> HandlerState {
        self.handler.state()
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the session and return the underlying transport.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Open a session with `station`.
    pub fn connect(&mut self, station: u8) -> Result<()> {
        let pending = self.handler.connect(&mut self.transport, station)?;
        self.wait(pending).map(drop)
    }

    /// Connect, retrying timeouts as `policy` allows, then let the bus settle.
    ///
    /// Replies to earlier attempts that arrive during the settle pause are
    /// discarded so they cannot be mistaken for the next reply.
    pub fn connect_with_retry(&mut self, station: u8, policy: &RetryPolicy) -> Result<()> {
        policy.run(|| self.connect(station))?;

        if !policy.settle.is_zero() {
            thread::sleep(policy.settle);
        }
        self.drain()?;
        info!("Connected to station {station}");
        Ok(())
    }

    /// Close the session.
    pub fn disconnect(&mut self) -> Result<()> {
        let pending = self.handler.disconnect(&mut self.transport)?;
        self.wait(pending).map(drop)
    }

    /// Move the memory transfer address.
    pub fn set_mta(&mut self, extension: AddressExtension, address: u32) -> Result<()> {
        let pending = self
            .handler
            .set_mta(&mut self.transport, extension, address)?;
        self.wait(pending).map(drop)
    }

    /// Unlock a protected resource.
    pub fn unlock(&mut self, password: Password) -> Result<()> {
        let pending = self.handler.unlock(&mut self.transport, password)?;
        self.wait(pending).map(drop)
    }

    /// Write up to five bytes (even count) at the MTA.
    pub fn download(&mut self, data: &[u8]) -> Result<()> {
        let pending = self.handler.download(&mut self.transport, data)?;
        self.wait(pending).map(drop)
    }

    /// Write exactly six bytes at the MTA.
    pub fn download_6(&mut self, data: &[u8]) -> Result<()> {
        let pending = self.handler.download_6(&mut self.transport, data)?;
        self.wait(pending).map(drop)
    }

    /// Read `count` bytes from the MTA.
    pub fn upload(&mut self, count: usize, block_transfer: bool) -> Result<Vec<u8>> {
        let pending = self
            .handler
            .upload(&mut self.transport, count, block_transfer)?;
        self.wait(pending).map(Outcome::into_data)
    }

    /// Verify `checksum` over `length` bytes written since the last `set_mta`.
    pub fn build_checksum(&mut self, checksum: u16, length: u32) -> Result<()> {
        let pending = self
            .handler
            .build_checksum(&mut self.transport, checksum, length)?;
        self.wait(pending).map(drop)
    }

    /// Erase the memory selected by the MTA.
    pub fn clear_memory(&mut self) -> Result<()> {
        let pending = self.handler.clear_memory(&mut self.transport)?;
        self.wait(pending).map(drop)
    }

    /// Forget any transaction and return the handler to idle.
    pub fn reset(&mut self) {
        self.handler.reset();
    }

    /// Block until `pending` resolves.
    fn wait(&mut self, pending: Pending) -> Result<Outcome> {
        loop {
            if crate::is_interrupted_requested() {
                self.handler.cancel();
                debug!("{} cancelled by interrupt", pending.command());
                return Err(Error::Cancelled);
            }

            if let Some(done) = self.handler.check_timeout(Instant::now()) {
                return done.result;
            }

            let Some(deadline) = self.handler.deadline() else {
                return Err(Error::UnexpectedMessage(format!(
                    "{} resolved without a reply",
                    pending.command()
                )));
            };
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);

            let frame = match self.transport.recv(remaining) {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) => {
                    self.handler.cancel();
                    return Err(e);
                },
            };

            match self.handler.receive(&frame) {
                Ok(Some(done)) => return done.result,
                Ok(None) => {},
                Err(e) => warn!("Discarding frame {:#x}: {e}", frame.id),
            }
        }
    }

    /// Discard frames that are already queued.
    fn drain(&mut self) -> Result<()> {
        while let Some(frame) = self.transport.recv(Duration::ZERO)? {
            if let Err(e) = self.handler.receive(&frame) {
                debug!("Discarding stale frame {:#x}: {e}", frame.id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{CommandCode, CommandStatus};
    use crate::protocol::packet::{BootloaderReply, DEFAULT_REPLY_ID, Frame};
    use crate::transport::{SimTransport, SimulatedTarget};

    fn sim(target: SimulatedTarget) -> Session<SimTransport> {
        Session::new(SimTransport::new(target), HandlerConfig::default())
    }

    #[test]
    fn test_connect_times_out_without_device() {
        let mut session = sim(SimulatedTarget::new(9, 16));
        let err = session.connect(0).unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                command: CommandCode::Connect,
                ..
            }
        ));
        assert_eq!(session.state(), HandlerState::Idle);
    }

    #[test]
    fn test_connect_with_retry_reaches_late_device() {
        let mut session = sim(SimulatedTarget::new(0, 16).with_ignored_frames(2));
        let policy = RetryPolicy::default().with_settle(Duration::ZERO);
        session.connect_with_retry(0, &policy).unwrap();

        assert_eq!(session.state(), HandlerState::Connected);
        assert_eq!(session.transport().sent().len(), 3);
    }

    #[test]
    fn test_connect_with_retry_gives_up() {
        let mut session = sim(SimulatedTarget::new(0, 16).with_ignored_frames(10));
        let policy = RetryPolicy::none().with_connect_retries(2);
        assert!(session.connect_with_retry(0, &policy).unwrap_err().is_timeout());
        assert_eq!(session.transport().sent().len(), 3);
    }

    #[test]
    fn test_unknown_status_fails_instead_of_timing_out() {
        let mut session = sim(SimulatedTarget::new(9, 16));
        session
            .transport_mut()
            .inject(Frame::extended(DEFAULT_REPLY_ID, [0xFF, 0x10, 0, 0, 0, 0, 0, 0]));

        let err = session.connect(0).unwrap_err();
        assert!(!err.is_timeout());
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert_eq!(session.state(), HandlerState::Idle);
    }

    #[test]
    fn test_connect_with_retry_stops_on_unknown_status() {
        let mut session = sim(SimulatedTarget::new(9, 16));
        session
            .transport_mut()
            .inject(Frame::extended(DEFAULT_REPLY_ID, [0xFF, 0x10, 0, 0, 0, 0, 0, 0]));

        let policy = RetryPolicy::none().with_connect_retries(3);
        let err = session.connect_with_retry(0, &policy).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert_eq!(session.transport().sent().len(), 1);
    }

    #[test]
    fn test_stray_frames_are_discarded() {
        let mut session = sim(SimulatedTarget::new(0, 16));
        session.connect(0).unwrap();

        // a stale reply with a wrong counter, queued ahead of the real one
        let stale = BootloaderReply::new(CommandStatus::Acknowledge, 200, &[])
            .unwrap()
            .to_frame(DEFAULT_REPLY_ID)
            .unwrap();
        session.transport_mut().inject(stale);
        let err = session.unlock(Password::DspFlash).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert_eq!(session.state(), HandlerState::Connected);

        // the genuine reply is still queued and now unexpected; drained silently
        session.drain().unwrap();
        session.unlock(Password::DspFlash).unwrap();
        assert!(session.transport().target().is_unlocked());
    }

    #[test]
    fn test_device_errors_surface() {
        let mut session = sim(SimulatedTarget::new(0, 16));
        session.connect(0).unwrap();

        let err = session.clear_memory().unwrap_err();
        assert!(matches!(
            err,
            Error::CommandFailed {
                command: CommandCode::ClearMemory,
                status: CommandStatus::AccessLocked,
                ..
            }
        ));
        assert!(err.requires_reconnect());
        assert_eq!(session.state(), HandlerState::Connected);
    }
}
