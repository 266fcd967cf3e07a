//! Command codes, status codes and their per-value metadata.
//!
//! Codes follow the CAN Calibration Protocol 2.1 numbering used by the
//! bootloader. Every code carries its metadata through a `match`, so adding a
//! value is a compile error until all of its properties are filled in.

use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Host command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum CommandCode {
    /// Open a session with a station (0x01).
    Connect = 0x01,
    /// Set the memory transfer address (0x02).
    SetMta = 0x02,
    /// Download up to 5 bytes (0x03).
    Download = 0x03,
    /// Upload up to 5 bytes, or a block in block-transfer mode (0x04).
    Upload = 0x04,
    /// Close the session (0x07).
    Disconnect = 0x07,
    /// Verify a checksum over the bytes written since the last pointer set (0x0E).
    BuildChecksum = 0x0E,
    /// Erase memory (0x10).
    ClearMemory = 0x10,
    /// Unlock a protected resource (0x13).
    Unlock = 0x13,
    /// Device-specific service (0x21).
    ActionService = 0x21,
    /// Download exactly 6 bytes (0x23).
    Download6 = 0x23,
}

impl CommandCode {
    /// Every command code, in numeric order.
    pub const ALL: [Self; 10] = [
        Self::Connect,
        Self::SetMta,
        Self::Download,
        Self::Upload,
        Self::Disconnect,
        Self::BuildChecksum,
        Self::ClearMemory,
        Self::Unlock,
        Self::ActionService,
        Self::Download6,
    ];

    /// Default time to wait for the reply to this command.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::BuildChecksum | Self::ClearMemory => Duration::from_secs(30),
            Self::ActionService => Duration::from_secs(5),
            Self::Connect
            | Self::SetMta
            | Self::Download
            | Self::Upload
            | Self::Disconnect
            | Self::Unlock
            | Self::Download6 => Duration::from_millis(25),
        }
    }

    /// Number of payload bytes (after code and counter) the command may carry.
    pub fn payload_window(self) -> usize {
        match self {
            Self::Disconnect => 0,
            Self::Connect | Self::Upload => 1,
            Self::Unlock => 3,
            Self::ClearMemory => 4,
            Self::SetMta
            | Self::Download
            | Self::BuildChecksum
            | Self::ActionService
            | Self::Download6 => 6,
        }
    }

    /// Protocol name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SetMta => "set_mta",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Disconnect => "disconnect",
            Self::BuildChecksum => "build_checksum",
            Self::ClearMemory => "clear_memory",
            Self::Unlock => "unlock",
            Self::ActionService => "action_service",
            Self::Download6 => "download_6",
        }
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|code| *code as u8 == value)
            .ok_or(Error::UnknownCode {
                kind: "command",
                value,
            })
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status codes carried by bootloader replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum CommandStatus {
    /// Command accepted (0x00).
    Acknowledge = 0x00,
    /// Processor busy (0x11).
    ProcessorBusy = 0x11,
    /// Unknown command (0x30).
    UnknownCommand = 0x30,
    /// Command syntax error (0x31).
    CommandSyntax = 0x31,
    /// Parameter(s) out of range (0x32).
    ParametersOutOfRange = 0x32,
    /// Access denied (0x33).
    AccessDenied = 0x33,
    /// Access locked (0x35).
    AccessLocked = 0x35,
    /// Resource or function not available (0x36).
    ResourceFunctionUnavailable = 0x36,
    /// The operation itself failed on the device (0x37).
    OperationalFailure = 0x37,
}

impl CommandStatus {
    /// Every status code, in numeric order.
    pub const ALL: [Self; 9] = [
        Self::Acknowledge,
        Self::ProcessorBusy,
        Self::UnknownCommand,
        Self::CommandSyntax,
        Self::ParametersOutOfRange,
        Self::AccessDenied,
        Self::AccessLocked,
        Self::ResourceFunctionUnavailable,
        Self::OperationalFailure,
    ];

    /// Error category of a non-acknowledge status.
    pub fn category(self) -> Option<ErrorCategory> {
        match self {
            Self::Acknowledge => None,
            Self::ProcessorBusy => Some(ErrorCategory::C1),
            Self::OperationalFailure => Some(ErrorCategory::C2),
            Self::UnknownCommand
            | Self::CommandSyntax
            | Self::ParametersOutOfRange
            | Self::AccessDenied
            | Self::AccessLocked
            | Self::ResourceFunctionUnavailable => Some(ErrorCategory::C3),
        }
    }

    /// Whether this is the acknowledge status.
    pub fn is_ack(self) -> bool {
        self == Self::Acknowledge
    }

    /// Protocol name of the status.
    pub fn name(self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::ProcessorBusy => "processor busy",
            Self::UnknownCommand => "unknown command",
            Self::CommandSyntax => "command syntax",
            Self::ParametersOutOfRange => "parameters out of range",
            Self::AccessDenied => "access denied",
            Self::AccessLocked => "access locked",
            Self::ResourceFunctionUnavailable => "resource/function unavailable",
            Self::OperationalFailure => "operational failure",
        }
    }
}

impl TryFrom<u8> for CommandStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| *status as u8 == value)
            .ok_or(Error::UnknownCode {
                kind: "status",
                value,
            })
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing, the failure is a warning.
    None,
    /// Send the same request again.
    Retry,
    /// Wait a moment, then send the same request again.
    WaitAndRetry,
    /// Reinitialize the session (disconnect/connect) and retry.
    Reinitialize,
    /// Give up on the session.
    Terminate,
}

/// Failure categories of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorCategory {
    /// No reply within the command timeout.
    Timeout,
    /// Warning.
    C0,
    /// Spurious error (communication error, busy).
    C1,
    /// Resolvable error (temporary power loss, reinitialization needed).
    C2,
    /// Unresolvable error.
    C3,
}

impl ErrorCategory {
    /// Human description.
    pub fn description(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::C0 => "warning",
            Self::C1 => "spurious (comm error, busy, ...)",
            Self::C2 => "resolvable (temporary power loss, ...)",
            Self::C3 => "unresolvable (setup, overload, ...)",
        }
    }

    /// Recommended recovery action.
    pub fn action(self) -> RecoveryAction {
        match self {
            Self::Timeout => RecoveryAction::Retry,
            Self::C0 => RecoveryAction::None,
            Self::C1 => RecoveryAction::WaitAndRetry,
            Self::C2 => RecoveryAction::Reinitialize,
            Self::C3 => RecoveryAction::Terminate,
        }
    }

    /// How many times the caller may retry.
    pub fn retries(self) -> u8 {
        match self {
            Self::Timeout | Self::C1 => 2,
            Self::C2 => 1,
            Self::C0 | Self::C3 => 0,
        }
    }

    /// Whether the device should be considered faulted until reconnected.
    pub fn transitions_to_fault(self) -> bool {
        matches!(self, Self::C1 | Self::C2 | Self::C3)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Memory regions selectable through `set_mta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum AddressExtension {
    /// Program flash.
    FlashMemory = 0,
    /// Configuration registers.
    ConfigurationRegisters = 1,
    /// EEPROM owned by the bootloader.
    EepromMemoryBootloader = 2,
    /// EEPROM holding application data.
    EepromMemoryData = 3,
}

impl AddressExtension {
    /// Raw memory access.
    pub const RAW: Self = Self::FlashMemory;

    /// Data logger region.
    pub const DATA_LOGGER: Self = Self::ConfigurationRegisters;

    /// Every address extension.
    pub const ALL: [Self; 4] = [
        Self::FlashMemory,
        Self::ConfigurationRegisters,
        Self::EepromMemoryBootloader,
        Self::EepromMemoryData,
    ];

    /// Look an extension up by name (aliases included).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().replace('-', "_").as_str() {
            "flash_memory" | "flash" | "raw" => Some(Self::FlashMemory),
            "configuration_registers" | "data_logger" => Some(Self::ConfigurationRegisters),
            "eeprom_memory_bootloader" => Some(Self::EepromMemoryBootloader),
            "eeprom_memory_data" => Some(Self::EepromMemoryData),
            _ => None,
        }
    }
}

impl TryFrom<u8> for AddressExtension {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ext| *ext as u8 == value)
            .ok_or(Error::UnknownCode {
                kind: "address extension",
                value,
            })
    }
}

impl fmt::Display for AddressExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlashMemory => write!(f, "flash_memory"),
            Self::ConfigurationRegisters => write!(f, "configuration_registers"),
            Self::EepromMemoryBootloader => write!(f, "eeprom_memory_bootloader"),
            Self::EepromMemoryData => write!(f, "eeprom_memory_data"),
        }
    }
}

/// Secrets accepted by `unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Password {
    /// DSP flash programming.
    #[default]
    DspFlash,
    /// Any other 16-bit key.
    Custom(u16),
}

impl Password {
    /// Key for [`Password::DspFlash`].
    pub const DSP_FLASH_KEY: u16 = 0x7A1F;

    /// 16-bit key sent on the wire.
    pub fn value(self) -> u16 {
        match self {
            Self::DspFlash => Self::DSP_FLASH_KEY,
            Self::Custom(key) => key,
        }
    }
}
