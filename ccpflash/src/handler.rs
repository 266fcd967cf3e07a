//! Protocol state machine.
//!
//! The [`Handler`] owns the one-outstanding-transaction discipline. Each
//! operation validates the request, transmits a single command through the
//! borrowed transport and returns a [`Pending`] handle. The transaction is
//! resolved later, from the same thread, when either:
//!
//! - a matching reply is fed to [`Handler::receive`], or
//! - [`Handler::check_timeout`] observes that the deadline has passed.
//!
//! The handler never retries and never sleeps; it can be driven by the
//! blocking [`Session`](crate::session::Session) or by any event loop.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::command::{AddressExtension, CommandCode, ErrorCategory, Password};
use crate::protocol::packet::{
    self, DEFAULT_HOST_ID, DEFAULT_REPLY_ID, FRAME_LEN, Frame, Packet, REPLY_MARKER,
    REPLY_PAYLOAD_LEN, payload,
};
use crate::transport::Transport;

/// Largest `download` payload.
pub const MAX_DOWNLOAD_LEN: usize = 5;

/// Exact `download_6` payload length.
pub const DOWNLOAD_6_LEN: usize = 6;

/// Largest `upload` count outside block-transfer mode.
pub const MAX_UPLOAD_LEN: usize = REPLY_PAYLOAD_LEN;

/// Largest `upload` count in block-transfer mode.
pub const MAX_BLOCK_UPLOAD_LEN: usize = 255;

/// What the handler is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HandlerState {
    /// No session.
    #[default]
    Idle,
    /// Waiting for the `connect` reply.
    Connecting,
    /// Session open, nothing outstanding.
    Connected,
    /// Waiting for the `disconnect` reply.
    Disconnecting,
    /// Waiting for the `set_mta` reply.
    SettingMta,
    /// Waiting for the `download` reply.
    Downloading,
    /// Waiting for the `download_6` reply.
    Download6ing,
    /// Waiting for the `unlock` reply.
    Unlocking,
    /// Waiting for the `build_checksum` reply.
    BuildingChecksum,
    /// Waiting for the `clear_memory` reply.
    ClearingMemory,
    /// Waiting for `upload` replies.
    Uploading,
}

impl HandlerState {
    /// Protocol name of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::SettingMta => "setting_mta",
            Self::Downloading => "downloading",
            Self::Download6ing => "download_6ing",
            Self::Unlocking => "unlocking",
            Self::BuildingChecksum => "building_checksum",
            Self::ClearingMemory => "clearing_memory",
            Self::Uploading => "uploading",
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row of the operation table: where a command may start and where it leads.
struct Route {
    allowed_from: HandlerState,
    waiting: HandlerState,
    on_ack: HandlerState,
}

fn route(command: CommandCode) -> Option<Route> {
    use HandlerState as S;

    let (allowed_from, waiting, on_ack) = match command {
        CommandCode::Connect => (S::Idle, S::Connecting, S::Connected),
        CommandCode::Disconnect => (S::Connected, S::Disconnecting, S::Idle),
        CommandCode::SetMta => (S::Connected, S::SettingMta, S::Connected),
        CommandCode::Unlock => (S::Connected, S::Unlocking, S::Connected),
        CommandCode::Download => (S::Connected, S::Downloading, S::Connected),
        CommandCode::Download6 => (S::Connected, S::Download6ing, S::Connected),
        CommandCode::Upload => (S::Connected, S::Uploading, S::Connected),
        CommandCode::BuildChecksum => (S::Connected, S::BuildingChecksum, S::Connected),
        CommandCode::ClearMemory => (S::Connected, S::ClearingMemory, S::Connected),
        CommandCode::ActionService => return None,
    };

    Some(Route {
        allowed_from,
        waiting,
        on_ack,
    })
}

/// Handler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Identifier of outbound command frames.
    pub host_id: u32,
    /// Identifier of inbound reply frames.
    pub reply_id: u32,
    /// Lower bound applied to every command timeout.
    pub minimum_timeout: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            host_id: DEFAULT_HOST_ID,
            reply_id: DEFAULT_REPLY_ID,
            minimum_timeout: Duration::ZERO,
        }
    }
}

impl HandlerConfig {
    /// Create a configuration for the given identifier pair.
    pub fn new(host_id: u32, reply_id: u32) -> Self {
        Self {
            host_id,
            reply_id,
            ..Default::default()
        }
    }

    /// Set the minimum timeout.
    #[must_use]
    pub fn with_minimum_timeout(mut self, minimum_timeout: Duration) -> Self {
        self.minimum_timeout = minimum_timeout;
        self
    }

    /// Timeout armed for `command`.
    pub fn timeout_for(&self, command: CommandCode) -> Duration {
        command.default_timeout().max(self.minimum_timeout)
    }
}

/// Handle of the outstanding transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    command: CommandCode,
    counter: u8,
}

impl Pending {
    /// Command that was sent.
    pub fn command(&self) -> CommandCode {
        self.command
    }

    /// Counter the command was sent with.
    pub fn counter(&self) -> u8 {
        self.counter
    }
}

/// Successful result of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The device acknowledged the command.
    Acknowledged,
    /// The device acknowledged an upload and returned these bytes.
    Data(Vec<u8>),
}

impl Outcome {
    /// Uploaded bytes, empty for plain acknowledgements.
    pub fn into_data(self) -> Vec<u8> {
        match self {
            Self::Acknowledged => Vec::new(),
            Self::Data(data) => data,
        }
    }
}

/// Resolution of a transaction.
#[derive(Debug)]
pub struct Completion {
    /// Command the transaction was opened with.
    pub command: CommandCode,
    /// Outcome or the typed failure.
    pub result: Result<Outcome>,
}

#[derive(Debug)]
struct Transaction {
    command: CommandCode,
    counter: u8,
    origin: HandlerState,
    on_ack: HandlerState,
    timeout: Duration,
    deadline: Instant,
    block_transfer: bool,
    expected: usize,
    data: Vec<u8>,
}

impl Transaction {
    fn collect(&mut self, bytes: &[u8]) {
        let take = (self.expected - self.data.len()).min(bytes.len());
        self.data.extend_from_slice(&bytes[..take]);
    }

    fn awaits_more(&self) -> bool {
        self.block_transfer && self.data.len() < self.expected
    }
}

/// CCP bootloader protocol handler.
///
/// One instance serves one station for one connect/disconnect cycle. The
/// send counter keeps counting across cycles.
#[derive(Debug)]
pub struct Handler {
    config: HandlerConfig,
    state: HandlerState,
    counter: u8,
    active: Option<Transaction>,
}

impl Default for Handler {
    fn default() -> Self {
        Self::new(HandlerConfig::default())
    }
}

impl Handler {
    /// Create a handler in the idle state.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            state: HandlerState::Idle,
            counter: 0,
            active: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Whether a transaction is outstanding.
    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Handle of the outstanding transaction, if any.
    pub fn pending(&self) -> Option<Pending> {
        self.active.as_ref().map(|tx| Pending {
            command: tx.command,
            counter: tx.counter,
        })
    }

    /// Deadline of the outstanding transaction, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|tx| tx.deadline)
    }

    /// Counter the next command will carry.
    pub fn next_counter(&self) -> u8 {
        self.counter
    }

    /// Open a session with `station`.
    pub fn connect<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        station: u8,
    ) -> Result<Pending> {
        self.begin(
            transport,
            CommandCode::Connect,
            &payload::connect(station),
            false,
            0,
        )
    }

    /// Close the session.
    pub fn disconnect<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Pending> {
        self.begin(transport, CommandCode::Disconnect, &[], false, 0)
    }

    /// Move the memory transfer address.
    pub fn set_mta<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        extension: AddressExtension,
        address: u32,
    ) -> Result<Pending> {
        self.begin(
            transport,
            CommandCode::SetMta,
            &payload::set_mta(extension, address),
            false,
            0,
        )
    }

    /// Unlock a protected resource.
    pub fn unlock<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        password: Password,
    ) -> Result<Pending> {
        self.begin(
            transport,
            CommandCode::Unlock,
            &payload::unlock(password.value()),
            false,
            0,
        )
    }

    /// Write up to five bytes at the MTA.
    ///
    /// `data` must hold an even number of bytes, at most five.
    pub fn download<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        data: &[u8],
    ) -> Result<Pending> {
        if data.is_empty() || data.len() > MAX_DOWNLOAD_LEN || data.len() % 2 != 0 {
            return Err(Error::PayloadLength {
                command: CommandCode::Download,
                length: data.len(),
                max: MAX_DOWNLOAD_LEN,
            });
        }

        self.begin(
            transport,
            CommandCode::Download,
            &payload::download(data),
            false,
            0,
        )
    }

    /// Write exactly six bytes at the MTA.
    pub fn download_6<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        data: &[u8],
    ) -> Result<Pending> {
        if data.len() != DOWNLOAD_6_LEN {
            return Err(Error::PayloadLength {
                command: CommandCode::Download6,
                length: data.len(),
                max: DOWNLOAD_6_LEN,
            });
        }

        self.begin(transport, CommandCode::Download6, data, false, 0)
    }

    /// Read `count` bytes from the MTA.
    ///
    /// Without block transfer one reply answers the request, so at most five
    /// bytes may be asked for. With block transfer up to 255 bytes are
    /// collected from consecutive replies carrying the same counter.
    pub fn upload<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        count: usize,
        block_transfer: bool,
    ) -> Result<Pending> {
        let max = if block_transfer {
            MAX_BLOCK_UPLOAD_LEN
        } else {
            MAX_UPLOAD_LEN
        };
        let Some(byte) = u8::try_from(count).ok().filter(|&n| n > 0 && count <= max) else {
            return Err(Error::InvalidRequest(format!(
                "upload of {count} bytes (expected 1..={max})"
            )));
        };

        self.begin(
            transport,
            CommandCode::Upload,
            &payload::upload(byte),
            block_transfer,
            count,
        )
    }

    /// Ask the device to verify `checksum` over `length` bytes written since
    /// the last `set_mta`.
    pub fn build_checksum<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        checksum: u16,
        length: u32,
    ) -> Result<Pending> {
        self.begin(
            transport,
            CommandCode::BuildChecksum,
            &payload::build_checksum(checksum, length),
            false,
            0,
        )
    }

    /// Erase the memory selected by the MTA.
    pub fn clear_memory<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Pending> {
        self.begin(
            transport,
            CommandCode::ClearMemory,
            &payload::clear_memory(),
            false,
            0,
        )
    }

    /// Whether `frame` is a reply to the outstanding transaction, judged by
    /// identifier, marker and counter only.
    fn answers_active(&self, frame: &Frame) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        frame.id == self.config.reply_id
            && frame.data.len() == FRAME_LEN
            && frame.data[0] == REPLY_MARKER
            && (frame.data[2] == active.counter || self.state == HandlerState::Connecting)
    }

    fn begin<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: CommandCode,
        payload: &[u8],
        block_transfer: bool,
        expected: usize,
    ) -> Result<Pending> {
        if self.active.is_some() {
            return Err(Error::HandlerBusy);
        }

        let route = route(command)
            .filter(|route| route.allowed_from == self.state)
            .ok_or(Error::InvalidState {
                operation: command,
                state: self.state,
            })?;

        let counter = self.counter;
        let frame = packet::encode_command(self.config.host_id, command, counter, payload)?;
        trace!("TX {command} counter={counter} {:02X?}", frame.data);
        transport.send(&frame)?;
        self.counter = counter.wrapping_add(1);

        let timeout = self.config.timeout_for(command);
        let origin = self.state;
        self.state = route.waiting;
        self.active = Some(Transaction {
            command,
            counter,
            origin,
            on_ack: route.on_ack,
            timeout,
            deadline: Instant::now() + timeout,
            block_transfer,
            expected,
            data: Vec::with_capacity(expected),
        });
        debug!("{command} sent, {origin} -> {}", self.state);

        Ok(Pending { command, counter })
    }

    /// Feed an inbound frame.
    ///
    /// Returns the completion when the frame resolves the outstanding
    /// transaction. Frames on foreign identifiers and echoed host commands
    /// are ignored. Malformed frames, and replies arriving while nothing is
    /// outstanding, are reported as errors without touching handler state.
    /// A reply to the outstanding command carrying an unknown status code
    /// fails that command.
    pub fn receive(&mut self, frame: &Frame) -> Result<Option<Completion>> {
        if frame.id != self.config.host_id && frame.id != self.config.reply_id {
            trace!("ignoring frame on {:#x}", frame.id);
            return Ok(None);
        }

        let packet = match packet::decode(frame) {
            Ok(packet) => packet,
            Err(Error::UnknownCode {
                kind: "status",
                value,
            }) if self.answers_active(frame) => {
                let Some(active) = self.active.take() else {
                    return Err(Error::UnknownCode {
                        kind: "status",
                        value,
                    });
                };
                let error = Error::UnexpectedMessage(format!(
                    "{} answered with unknown status {value:#04x}",
                    active.command
                ));
                return Ok(Some(self.abort(active, error)));
            },
            Err(e) => return Err(e),
        };

        let reply = match packet {
            Packet::Command(command) => {
                trace!("ignoring host command {} on the bus", command.code);
                return Ok(None);
            },
            Packet::Reply(reply) => reply,
        };
        trace!(
            "RX status={} counter={} {:02X?}",
            reply.status, reply.counter, reply.payload
        );

        let Some(mut active) = self.active.take() else {
            return Err(Error::UnexpectedMessage(format!(
                "reply with counter {} while {} with nothing outstanding",
                reply.counter, self.state
            )));
        };

        if frame.id != self.config.reply_id {
            let error = Error::UnexpectedMessage(format!(
                "reply on identifier {:#x}, expected {:#x}",
                frame.id, self.config.reply_id
            ));
            return Ok(Some(self.abort(active, error)));
        }

        if reply.counter != active.counter && self.state != HandlerState::Connecting {
            let error = Error::UnexpectedMessage(format!(
                "reply counter {} does not match {} sent with {}",
                reply.counter, active.counter, active.command
            ));
            return Ok(Some(self.abort(active, error)));
        }

        if !reply.status.is_ack() {
            let error = Error::CommandFailed {
                command: active.command,
                status: reply.status,
                category: reply.status.category().unwrap_or(ErrorCategory::C0),
            };
            return Ok(Some(self.abort(active, error)));
        }

        if active.command == CommandCode::Upload {
            active.collect(&reply.payload);
            if active.awaits_more() {
                active.deadline = Instant::now() + active.timeout;
                trace!("upload {}/{} bytes", active.data.len(), active.expected);
                self.active = Some(active);
                return Ok(None);
            }
        }

        self.state = active.on_ack;
        debug!("{} acknowledged, now {}", active.command, self.state);

        let outcome = if active.command == CommandCode::Upload {
            Outcome::Data(active.data)
        } else {
            Outcome::Acknowledged
        };

        Ok(Some(Completion {
            command: active.command,
            result: Ok(outcome),
        }))
    }

    /// Resolve the outstanding transaction with a timeout if its deadline
    /// has passed at `now`.
    ///
    /// A transaction started from idle returns the handler to idle. Otherwise
    /// the waiting state is kept and the caller must [`reset`](Self::reset)
    /// or reconnect.
    pub fn check_timeout(&mut self, now: Instant) -> Option<Completion> {
        if !self.active.as_ref().is_some_and(|tx| now >= tx.deadline) {
            return None;
        }

        let tx = self.active.take()?;
        if tx.origin == HandlerState::Idle {
            self.state = HandlerState::Idle;
        }
        warn!(
            "{} timed out after {:?}, state {}",
            tx.command, tx.timeout, self.state
        );

        Some(Completion {
            command: tx.command,
            result: Err(Error::Timeout {
                command: tx.command,
                timeout: tx.timeout,
            }),
        })
    }

    /// Drop the outstanding transaction without transmitting anything.
    ///
    /// The state returns to where the transaction started. Returns the
    /// cancelled handle, if there was one.
    pub fn cancel(&mut self) -> Option<Pending> {
        let tx = self.active.take()?;
        self.state = tx.origin;
        debug!("{} cancelled, back to {}", tx.command, self.state);
        Some(Pending {
            command: tx.command,
            counter: tx.counter,
        })
    }

    /// Forget any transaction and return to idle. The counter keeps running.
    pub fn reset(&mut self) {
        if let Some(tx) = self.active.take() {
            debug!("{} abandoned by reset", tx.command);
        }
        self.state = HandlerState::Idle;
    }

    fn abort(&mut self, tx: Transaction, error: Error) -> Completion {
        self.state = tx.origin;
        debug!("{} failed ({error}), back to {}", tx.command, self.state);
        Completion {
            command: tx.command,
            result: Err(error),
        }
    }
}
