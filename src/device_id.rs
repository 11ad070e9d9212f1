use std::{fmt, str::FromStr};

use thiserror::Error;

/*
    Checksum scheme used by HDHomeRun devices to validate their own IDs, see
    https://github.com/Silicondust/libhdhomerun/blob/master/hdhomerun_discover.c
*/
const CHECKSUM_LOOKUP_TABLE: [u8; 16] = [
    0xA, 0x5, 0xF, 0x6, 0x7, 0xC, 0x1, 0xB, 0x9, 0x2, 0x8, 0xD, 0x4, 0x3, 0xE, 0x0,
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("The device ID should be 8 hex digits, got '{0}'.")]
pub struct ParseDeviceIdError(pub String);

/// 32-bit identity a tuner announces on the network, e.g. `10A2E014`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentifier(u32);

impl DeviceIdentifier {
    #[cfg(test)]
    pub fn new(value: u32) -> Self {
        DeviceIdentifier(value)
    }

    #[cfg(test)]
    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        checksum(self.0) == 0
    }

    /// Finds a checksum-valid identity that cannot collide with `self`.
    ///
    /// Bit 4 is flipped so the high nibble of the low byte always differs, then
    /// the low nibble is chosen to bring the checksum back to zero.
    pub fn find_valid_alternate(self) -> Option<DeviceIdentifier> {
        let base = (self.0 ^ 0x0000_0010) & 0xFFFF_FFF0;

        (0..16u32)
            .map(|nibble| base | nibble)
            .map(DeviceIdentifier)
            .find(|candidate| candidate.is_valid())
    }
}

pub fn checksum(value: u32) -> u8 {
    (0..8).fold(0u8, |acc, position| {
        let nibble = ((value >> (28 - position * 4)) & 0x0F) as u8;

        if position % 2 == 0 {
            acc ^ CHECKSUM_LOOKUP_TABLE[nibble as usize]
        } else {
            acc ^ nibble
        }
    })
}

impl FromStr for DeviceIdentifier {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseDeviceIdError(s.to_string()));
        }

        u32::from_str_radix(s, 16)
            .map(DeviceIdentifier)
            .map_err(|_| ParseDeviceIdError(s.to_string()))
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl From<DeviceIdentifier> for u32 {
    fn from(id: DeviceIdentifier) -> u32 {
        id.0
    }
}
