//! In-process bootloader model.
//!
//! [`SimulatedTarget`] answers host commands the way the device-side
//! bootloader does, which lets sessions, pipelines and the CLI run without a
//! CAN adapter. [`SimTransport`] plugs it in behind the [`Transport`] trait.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::command::{AddressExtension, CommandCode, CommandStatus, Password};
use crate::protocol::crc::crc16;
use crate::protocol::packet::{
    self, BootloaderReply, DEFAULT_HOST_ID, DEFAULT_REPLY_ID, Frame, HostCommand, Packet,
    REPLY_PAYLOAD_LEN,
};
use crate::transport::Transport;

/// Default size of every simulated memory region.
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;

/// Value of erased memory.
pub const ERASED: u8 = 0xFF;

/// Longest sleep taken by [`SimTransport::recv`] when nothing is queued.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// Device-side model of the CCP bootloader.
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    station: u8,
    key: u16,
    host_id: u32,
    reply_id: u32,
    regions: [Vec<u8>; 4],
    connected: bool,
    unlocked: bool,
    extension: AddressExtension,
    mta: u32,
    window_start: u32,
    ignore_first: usize,
}

impl SimulatedTarget {
    /// Create a target answering `station`, with erased regions of
    /// `memory_size` bytes each.
    pub fn new(station: u8, memory_size: usize) -> Self {
        Self {
            station,
            key: Password::DspFlash.value(),
            host_id: DEFAULT_HOST_ID,
            reply_id: DEFAULT_REPLY_ID,
            regions: std::array::from_fn(|_| vec![ERASED; memory_size]),
            connected: false,
            unlocked: false,
            extension: AddressExtension::FlashMemory,
            mta: 0,
            window_start: 0,
            ignore_first: 0,
        }
    }

    /// Set the key accepted by `unlock`.
    #[must_use]
    pub fn with_password(mut self, password: Password) -> Self {
        self.key = password.value();
        self
    }

    /// Set the identifier pair.
    #[must_use]
    pub fn with_ids(mut self, host_id: u32, reply_id: u32) -> Self {
        self.host_id = host_id;
        self.reply_id = reply_id;
        self
    }

    /// Drop the first `count` host frames, as a device that is still
    /// booting would.
    #[must_use]
    pub fn with_ignored_frames(mut self, count: usize) -> Self {
        self.ignore_first = count;
        self
    }

    /// Preload memory contents.
    pub fn load(&mut self, extension: AddressExtension, address: u32, data: &[u8]) -> Result<()> {
        let region = &mut self.regions[extension as usize];
        let start = address as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&end| end <= region.len())
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "{} bytes at {address:#x} do not fit {extension}",
                    data.len()
                ))
            })?;
        region[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Contents of a memory region.
    pub fn memory(&self, extension: AddressExtension) -> &[u8] {
        &self.regions[extension as usize]
    }

    /// Whether a host is connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Whether the session is unlocked.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Current memory transfer address.
    pub fn mta(&self) -> (AddressExtension, u32) {
        (self.extension, self.mta)
    }

    /// Process one frame from the bus and return the replies it causes.
    pub fn handle(&mut self, frame: &Frame) -> Vec<Frame> {
        if frame.id != self.host_id {
            return Vec::new();
        }

        let command = match packet::decode(frame) {
            Ok(Packet::Command(command)) => command,
            Ok(Packet::Reply(_)) => return Vec::new(),
            Err(e) => {
                trace!("sim: dropping frame: {e}");
                return Vec::new();
            },
        };

        if self.ignore_first > 0 {
            self.ignore_first -= 1;
            trace!("sim: not listening yet, dropped {}", command.code);
            return Vec::new();
        }

        if !self.connected && command.code != CommandCode::Connect {
            trace!("sim: {} ignored while disconnected", command.code);
            return Vec::new();
        }

        let replies = self.execute(&command);
        replies
            .into_iter()
            .filter_map(|reply| reply.to_frame(self.reply_id).ok())
            .collect()
    }

    fn execute(&mut self, command: &HostCommand) -> Vec<BootloaderReply> {
        let counter = command.counter;
        let p = &command.payload;

        let status = match command.code {
            CommandCode::Connect => {
                if p[0] != self.station {
                    trace!("sim: connect for station {} ignored", p[0]);
                    return Vec::new();
                }
                self.connected = true;
                debug!("sim: station {} connected", self.station);
                CommandStatus::Acknowledge
            },
            CommandCode::Disconnect => {
                self.connected = false;
                self.unlocked = false;
                CommandStatus::Acknowledge
            },
            CommandCode::SetMta => match AddressExtension::try_from(p[1]) {
                Ok(extension) => {
                    self.extension = extension;
                    self.mta = BigEndian::read_u32(&p[2..6]);
                    self.window_start = self.mta;
                    CommandStatus::Acknowledge
                },
                Err(_) => CommandStatus::ParametersOutOfRange,
            },
            CommandCode::Unlock => {
                if p[0] == packet::UNLOCK_KEY_LENGTH && BigEndian::read_u16(&p[1..3]) == self.key {
                    self.unlocked = true;
                    CommandStatus::Acknowledge
                } else {
                    CommandStatus::AccessDenied
                }
            },
            CommandCode::ClearMemory => {
                if self.unlocked {
                    self.regions[self.extension as usize].fill(ERASED);
                    CommandStatus::Acknowledge
                } else {
                    CommandStatus::AccessLocked
                }
            },
            CommandCode::Download => {
                let length = usize::from(p[0]);
                if length > REPLY_PAYLOAD_LEN {
                    CommandStatus::CommandSyntax
                } else {
                    self.write(&p[1..=length])
                }
            },
            CommandCode::Download6 => self.write(p),
            CommandCode::Upload => return self.upload(counter, usize::from(p[0])),
            CommandCode::BuildChecksum => {
                let length = BigEndian::read_u32(&p[0..4]) as usize;
                let expected = BigEndian::read_u16(&p[4..6]);
                let start = self.window_start as usize;
                let region = &self.regions[self.extension as usize];
                match region.get(start..start.saturating_add(length)) {
                    Some(bytes) if crc16(bytes, None) == expected => CommandStatus::Acknowledge,
                    Some(_) => CommandStatus::OperationalFailure,
                    None => CommandStatus::ParametersOutOfRange,
                }
            },
            CommandCode::ActionService => CommandStatus::ResourceFunctionUnavailable,
        };

        single(status, counter, &[])
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&mut self, data: &[u8]) -> CommandStatus {
        let region = &mut self.regions[self.extension as usize];
        let start = self.mta as usize;
        match region.get_mut(start..start + data.len()) {
            Some(target) => {
                target.copy_from_slice(data);
                self.mta += data.len() as u32;
                CommandStatus::Acknowledge
            },
            None => CommandStatus::ParametersOutOfRange,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn upload(&mut self, counter: u8, count: usize) -> Vec<BootloaderReply> {
        let region = &self.regions[self.extension as usize];
        let start = self.mta as usize;
        let Some(bytes) = region.get(start..start + count) else {
            return single(CommandStatus::ParametersOutOfRange, counter, &[]);
        };

        let replies = bytes
            .chunks(REPLY_PAYLOAD_LEN)
            .filter_map(|chunk| BootloaderReply::new(CommandStatus::Acknowledge, counter, chunk).ok())
            .collect();
        self.mta += count as u32;
        replies
    }
}

fn single(status: CommandStatus, counter: u8, payload: &[u8]) -> Vec<BootloaderReply> {
    BootloaderReply::new(status, counter, payload)
        .ok()
        .into_iter()
        .collect()
}

/// [`Transport`] that delivers frames straight to a [`SimulatedTarget`].
#[derive(Debug)]
pub struct SimTransport {
    target: SimulatedTarget,
    inbound: VecDeque<Frame>,
    sent: Vec<Frame>,
}

impl SimTransport {
    /// Wrap a simulated target.
    pub fn new(target: SimulatedTarget) -> Self {
        Self {
            target,
            inbound: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// The simulated target.
    pub fn target(&self) -> &SimulatedTarget {
        &self.target
    }

    /// Mutable access to the simulated target.
    pub fn target_mut(&mut self) -> &mut SimulatedTarget {
        &mut self.target
    }

    /// Every frame sent by the host so far.
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    /// Queue an extra inbound frame, as if another node had sent it.
    pub fn inject(&mut self, frame: Frame) {
        self.inbound.push_back(frame);
    }

    /// Consume the transport and return the target.
    pub fn into_target(self) -> SimulatedTarget {
        self.target
    }
}

impl Transport for SimTransport {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        self.sent.push(frame.clone());
        let replies = self.target.handle(frame);
        self.inbound.extend(replies);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        if let Some(frame) = self.inbound.pop_front() {
            return Ok(Some(frame));
        }
        thread::sleep(timeout.min(IDLE_POLL));
        Ok(None)
    }
}
