//! Byte order converters
//!
//! Providers work with host byte order. A converter maps a register's host bytes to
//! wire bytes and back. Both directions are pure functions.

/// Byte order transform selected when a register is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Converter {
    /// Big-endian scalar (`ABCD` for 32-bit values)
    #[default]
    Abcd,
    /// Bytes are copied as-is (byte arrays, strings)
    Identity,
}

impl Converter {
    /// Host order to wire order
    pub fn to_wire(self, host: &[u8]) -> Vec<u8> {
        match self {
            Self::Abcd => swap_to_big_endian(host),
            Self::Identity => host.to_vec(),
        }
    }

    /// Wire order to host order
    pub fn from_wire(self, wire: &[u8]) -> Vec<u8> {
        // Byte reversal is its own inverse
        self.to_wire(wire)
    }
}

fn swap_to_big_endian(bytes: &[u8]) -> Vec<u8> {
    if cfg!(target_endian = "little") {
        bytes.iter().rev().copied().collect()
    } else {
        bytes.to_vec()
    }
}
