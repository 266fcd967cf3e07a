//! CRC-16 checksum used by the bootloader's `BUILD_CHKSUM` command.
//!
//! Reflected polynomial 0xA001 (CRC-16/MODBUS parameters) with a 0xFFFF seed.
//! The computation is resumable: pass the value returned by a previous call as
//! `running` to continue over the next slice of the same stream.

/// Initial value used when no running checksum is supplied.
pub const CRC16_INIT: u16 = 0xFFFF;

/// Reflected CRC-16 polynomial.
pub const CRC16_POLY: u16 = 0xA001;

/// Calculate (or continue) a CRC-16 over `data`.
///
/// `running` is `None` for a fresh checksum, or the value returned by an
/// earlier call when the stream is split over several calls.
pub fn crc16(data: &[u8], running: Option<u16>) -> u16 {
    let mut crc = running.unwrap_or(CRC16_INIT);

    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// Running checksum over a byte stream fed in pieces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16 {
    value: Option<u16>,
    length: usize,
}

impl Crc16 {
    /// Create an empty checksum.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.value = Some(crc16(data, self.value));
        self.length += data.len();
    }

    /// Current checksum (the seed if nothing was fed yet).
    pub fn value(&self) -> u16 {
        self.value.unwrap_or(CRC16_INIT)
    }

    /// Number of bytes fed since creation or the last reset.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether no bytes were fed since creation or the last reset.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Start over.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
