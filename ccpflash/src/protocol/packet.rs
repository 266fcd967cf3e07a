//! Frame codec for host commands and bootloader replies.
//!
//! ## Frame Format
//!
//! Every frame is exactly 8 bytes with a 29-bit extended identifier.
//!
//! ```text
//! Host command (host identifier):
//! +------+---------+-----------------------------------+
//! | CODE | COUNTER |        PAYLOAD (6 bytes)          |
//! +------+---------+-----------------------------------+
//!
//! Bootloader reply (reply identifier):
//! +------+--------+---------+--------------------------+
//! | 0xFF | STATUS | COUNTER |    PAYLOAD (5 bytes)     |
//! +------+--------+---------+--------------------------+
//! ```
//!
//! Multi-byte payload fields are big-endian.

use byteorder::{BigEndian, WriteBytesExt};

use crate::error::{Error, Result};
use crate::protocol::command::{AddressExtension, CommandCode, CommandStatus};

/// Length of every frame on this sub-protocol.
pub const FRAME_LEN: usize = 8;

/// First byte of every bootloader reply.
pub const REPLY_MARKER: u8 = 0xFF;

/// Payload bytes available to a host command.
pub const COMMAND_PAYLOAD_LEN: usize = 6;

/// Payload bytes available to a bootloader reply.
pub const REPLY_PAYLOAD_LEN: usize = 5;

/// Largest 29-bit extended identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Default identifier of host command frames.
pub const DEFAULT_HOST_ID: u32 = 0x1FFF_FFFF;

/// Default identifier of bootloader reply frames.
pub const DEFAULT_REPLY_ID: u32 = 0x1FFF_FFF7;

/// Length field sent with `clear_memory`.
pub const CLEAR_MEMORY_LENGTH: u32 = 0x0000_00FF;

/// Length prefix of the `unlock` key.
pub const UNLOCK_KEY_LENGTH: u8 = 2;

/// A raw CAN data frame as exchanged with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Arbitration identifier.
    pub id: u32,
    /// Whether `id` is a 29-bit extended identifier.
    pub extended: bool,
    /// Data bytes.
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a frame with an extended identifier.
    pub fn extended(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            extended: true,
            data: data.into(),
        }
    }

    /// Create a frame with a standard identifier.
    pub fn standard(id: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: u32::from(id),
            extended: false,
            data: data.into(),
        }
    }

    fn check_shape(&self) -> Result<()> {
        if !self.extended || self.id > MAX_EXTENDED_ID {
            return Err(Error::IdentifierType { id: self.id });
        }
        if self.data.len() != FRAME_LEN {
            return Err(Error::MessageLength {
                length: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Outbound command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCommand {
    /// Command code.
    pub code: CommandCode,
    /// Rolling counter.
    pub counter: u8,
    /// Payload window, zero padded.
    pub payload: [u8; COMMAND_PAYLOAD_LEN],
}

impl HostCommand {
    /// Build a command, checking `payload` against the command's window.
    pub fn new(code: CommandCode, counter: u8, payload: &[u8]) -> Result<Self> {
        let max = code.payload_window();
        if payload.len() > max {
            return Err(Error::PayloadLength {
                command: code,
                length: payload.len(),
                max,
            });
        }

        let mut window = [0u8; COMMAND_PAYLOAD_LEN];
        window[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            code,
            counter,
            payload: window,
        })
    }

    /// Serialize into a frame with the given identifier.
    pub fn to_frame(&self, id: u32) -> Result<Frame> {
        let mut data = Vec::with_capacity(FRAME_LEN);
        data.push(self.code as u8);
        data.push(self.counter);
        data.extend_from_slice(&self.payload);

        let frame = Frame::extended(id, data);
        frame.check_shape()?;
        Ok(frame)
    }
}

/// Inbound reply packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderReply {
    /// Status of the request.
    pub status: CommandStatus,
    /// Counter echoed from the request.
    pub counter: u8,
    /// Payload window.
    pub payload: [u8; REPLY_PAYLOAD_LEN],
}

impl BootloaderReply {
    /// Build a reply, zero padding `payload`.
    pub fn new(status: CommandStatus, counter: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() > REPLY_PAYLOAD_LEN {
            return Err(Error::InvalidRequest(format!(
                "reply payload of {} bytes exceeds {REPLY_PAYLOAD_LEN}",
                payload.len()
            )));
        }

        let mut window = [0u8; REPLY_PAYLOAD_LEN];
        window[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            status,
            counter,
            payload: window,
        })
    }

    /// Serialize into a frame with the given identifier.
    pub fn to_frame(&self, id: u32) -> Result<Frame> {
        let mut data = Vec::with_capacity(FRAME_LEN);
        data.push(REPLY_MARKER);
        data.push(self.status as u8);
        data.push(self.counter);
        data.extend_from_slice(&self.payload);

        let frame = Frame::extended(id, data);
        frame.check_shape()?;
        Ok(frame)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    /// Host-to-device command.
    Command(HostCommand),
    /// Device-to-host reply.
    Reply(BootloaderReply),
}

/// Encode a host command into a frame.
pub fn encode_command(id: u32, code: CommandCode, counter: u8, payload: &[u8]) -> Result<Frame> {
    HostCommand::new(code, counter, payload)?.to_frame(id)
}

/// Decode a frame, classifying it by its first byte.
pub fn decode(frame: &Frame) -> Result<Packet> {
    frame.check_shape()?;
    let data = &frame.data;

    if data[0] == REPLY_MARKER {
        let mut payload = [0u8; REPLY_PAYLOAD_LEN];
        payload.copy_from_slice(&data[3..]);
        Ok(Packet::Reply(BootloaderReply {
            status: CommandStatus::try_from(data[1])?,
            counter: data[2],
            payload,
        }))
    } else {
        let mut payload = [0u8; COMMAND_PAYLOAD_LEN];
        payload.copy_from_slice(&data[2..]);
        Ok(Packet::Command(HostCommand {
            code: CommandCode::try_from(data[0])?,
            counter: data[1],
            payload,
        }))
    }
}

/// Payload builders for each command.
pub mod payload {
    use super::{
        AddressExtension, BigEndian, CLEAR_MEMORY_LENGTH, UNLOCK_KEY_LENGTH, WriteBytesExt,
    };

    /// `connect`: station address.
    pub fn connect(station: u8) -> Vec<u8> {
        vec![station]
    }

    /// `set_mta`: reserved byte, extension, big-endian address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn set_mta(extension: AddressExtension, address: u32) -> Vec<u8> {
        let mut data = vec![0x00, extension as u8];
        data.write_u32::<BigEndian>(address).unwrap();
        data
    }

    /// `unlock`: key length prefix and big-endian key.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn unlock(key: u16) -> Vec<u8> {
        let mut data = vec![UNLOCK_KEY_LENGTH];
        data.write_u16::<BigEndian>(key).unwrap();
        data
    }

    /// `download`: length byte followed by the data.
    #[allow(clippy::cast_possible_truncation)] // Callers limit data to 5 bytes
    pub fn download(data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + data.len());
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        payload
    }

    /// `upload`: byte count.
    pub fn upload(count: u8) -> Vec<u8> {
        vec![count]
    }

    /// `build_checksum`: big-endian length and checksum.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build_checksum(checksum: u16, length: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(6);
        data.write_u32::<BigEndian>(length).unwrap();
        data.write_u16::<BigEndian>(checksum).unwrap();
        data
    }

    /// `clear_memory`: fixed big-endian length field.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn clear_memory() -> Vec<u8> {
        let mut data = Vec::with_capacity(4);
        data.write_u32::<BigEndian>(CLEAR_MEMORY_LENGTH).unwrap();
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_ID: u32 = 0x1FFF_FFFF;
    const REPLY_ID: u32 = 0x1FFF_FFF7;

    #[test]
    fn test_encode_connect() {
        let frame = encode_command(HOST_ID, CommandCode::Connect, 7, &payload::connect(3)).unwrap();
        assert!(frame.extended);
        assert_eq!(frame.id, HOST_ID);
        assert_eq!(frame.data, vec![0x01, 7, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_set_mta_big_endian() {
        let frame = encode_command(
            HOST_ID,
            CommandCode::SetMta,
            0,
            &payload::set_mta(AddressExtension::EepromMemoryData, 0x0012_3456),
        )
        .unwrap();
        assert_eq!(frame.data, vec![0x02, 0, 0x00, 0x03, 0x00, 0x12, 0x34, 0x56]);
    }

    #[test]
    fn test_encode_unlock() {
        let frame = encode_command(HOST_ID, CommandCode::Unlock, 1, &payload::unlock(0xABCD)).unwrap();
        assert_eq!(&frame.data[..5], &[0x13, 1, 0x02, 0xAB, 0xCD]);
        assert_eq!(&frame.data[5..], &[0, 0, 0]);
    }

    #[test]
    fn test_encode_build_checksum() {
        let frame = encode_command(
            HOST_ID,
            CommandCode::BuildChecksum,
            9,
            &payload::build_checksum(0xBEEF, 17),
        )
        .unwrap();
        assert_eq!(frame.data, vec![0x0E, 9, 0, 0, 0, 17, 0xBE, 0xEF]);
    }

    #[test]
    fn test_encode_clear_memory() {
        let frame =
            encode_command(HOST_ID, CommandCode::ClearMemory, 2, &payload::clear_memory()).unwrap();
        assert_eq!(frame.data, vec![0x10, 2, 0, 0, 0, 0xFF, 0, 0]);
    }

    #[test]
    fn test_encode_download_with_length_prefix() {
        let frame = encode_command(
            HOST_ID,
            CommandCode::Download,
            4,
            &payload::download(&[0xA1, 0xA2, 0xA3, 0xA4]),
        )
        .unwrap();
        assert_eq!(frame.data, vec![0x03, 4, 4, 0xA1, 0xA2, 0xA3, 0xA4, 0]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let err = encode_command(HOST_ID, CommandCode::Connect, 0, &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            Error::PayloadLength {
                command: CommandCode::Connect,
                length: 2,
                max: 1
            }
        ));

        let err = encode_command(HOST_ID, CommandCode::Disconnect, 0, &[0]).unwrap_err();
        assert!(matches!(err, Error::PayloadLength { max: 0, .. }));
    }

    #[test]
    fn test_encode_rejects_out_of_range_identifier() {
        let err = encode_command(0x2000_0000, CommandCode::Disconnect, 0, &[]).unwrap_err();
        assert!(matches!(err, Error::IdentifierType { id: 0x2000_0000 }));
    }

    #[test]
    fn test_decode_reply() {
        let frame = Frame::extended(REPLY_ID, vec![0xFF, 0x00, 0x2A, 1, 2, 3, 4, 5]);
        let packet = decode(&frame).unwrap();
        assert_eq!(
            packet,
            Packet::Reply(BootloaderReply {
                status: CommandStatus::Acknowledge,
                counter: 0x2A,
                payload: [1, 2, 3, 4, 5],
            })
        );
    }

    #[test]
    fn test_decode_command() {
        let frame = Frame::extended(HOST_ID, vec![0x23, 0x05, 1, 2, 3, 4, 5, 6]);
        let Packet::Command(command) = decode(&frame).unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(command.code, CommandCode::Download6);
        assert_eq!(command.counter, 5);
        assert_eq!(command.payload, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        let frame = Frame::extended(REPLY_ID, vec![0xFF, 0x00, 0x01]);
        assert!(matches!(
            decode(&frame),
            Err(Error::MessageLength { length: 3 })
        ));
    }

    #[test]
    fn test_decode_rejects_standard_identifier() {
        let frame = Frame::standard(0x7F7, vec![0xFF, 0, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            decode(&frame),
            Err(Error::IdentifierType { id: 0x7F7 })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let frame = Frame::extended(REPLY_ID, vec![0xFF, 0x99, 0, 0, 0, 0, 0, 0]);
        assert!(matches!(
            decode(&frame),
            Err(Error::UnknownCode {
                kind: "status",
                value: 0x99
            })
        ));
    }

    #[test]
    fn test_reply_to_frame() {
        let reply = BootloaderReply::new(CommandStatus::AccessDenied, 3, &[0xAA]).unwrap();
        let frame = reply.to_frame(REPLY_ID).unwrap();
        assert_eq!(frame.data, vec![0xFF, 0x33, 3, 0xAA, 0, 0, 0, 0]);
        assert!(BootloaderReply::new(CommandStatus::Acknowledge, 0, &[0; 6]).is_err());
    }
}
