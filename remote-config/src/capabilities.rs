//! Capability bitmask advertised to the control plane.
//!
//! Bit positions come from an externally defined table and are unbounded, so the
//! mask is kept as a growable byte vector rather than a fixed-width integer. On the
//! wire it is the minimal big-endian byte sequence, base64 encoded. An empty mask
//! still encodes to a single zero byte.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Serialize, Serializer};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    // Little-endian, trailing zero bytes trimmed.
    bytes: Vec<u8>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears a single bit.
    pub fn set(&mut self, bit: u32, enabled: bool) {
        let index = (bit / 8) as usize;
        let mask = 1u8 << (bit % 8);

        if enabled {
            if self.bytes.len() <= index {
                self.bytes.resize(index + 1, 0);
            }
            self.bytes[index] |= mask;
        } else if let Some(byte) = self.bytes.get_mut(index) {
            *byte &= !mask;
            while self.bytes.last() == Some(&0) {
                self.bytes.pop();
            }
        }
    }

    /// Minimal big-endian representation. Never empty.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        if self.bytes.is_empty() {
            return vec![0];
        }
        self.bytes.iter().rev().copied().collect()
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_be_bytes())
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}
