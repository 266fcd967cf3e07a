//! Wire protocol: command tables, frame codec and checksum.

pub mod command;
pub mod crc;
pub mod packet;

// Re-export common types
pub use command::{
    AddressExtension, CommandCode, CommandStatus, ErrorCategory, Password, RecoveryAction,
};
pub use crc::{Crc16, crc16};
pub use packet::{BootloaderReply, Frame, HostCommand, Packet, decode, encode_command};
