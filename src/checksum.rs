//! One-byte frame check carried after ETX.

use serde::{Deserialize, Serialize};

const CRC8: crc::Crc<u8> = crc::Crc::<u8>::new(&crc::CRC_8_SMBUS);

/// Algorithm used for the trailing check byte.
///
/// Both ends must agree; the byte covers LEN (or EXT_LEN) through ETX.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checksum {
    /// Block check character: XOR of every byte.
    #[default]
    Xor,
    /// Arithmetic sum modulo 256.
    Sum,
    /// CRC-8/SMBUS (poly 0x07, init 0x00).
    Crc8,
}

impl Checksum {
    pub fn generate(self, data: &[u8]) -> u8 {
        match self {
            Checksum::Xor => data.iter().fold(0u8, |acc, b| acc ^ b),
            Checksum::Sum => data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
            Checksum::Crc8 => CRC8.checksum(data),
        }
    }

    pub fn validate(self, data: &[u8], received: u8) -> bool {
        self.generate(data) == received
    }
}
