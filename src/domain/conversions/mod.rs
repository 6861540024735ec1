//! Conversions between characteristic payloads and experiment values.
//!
//! All conversion functions are closed enums resolved by name once, when the
//! experiment configuration is parsed.
//!
//! - [`input`] - payload bytes to one or more `f64` samples
//! - [`output`] - buffer contents to a payload
//! - [`config`] - configuration strings to a payload

pub mod config;
pub mod input;
pub mod output;

use std::fmt;
use std::str::FromStr;

use crate::error::BluetoothError;

pub use config::ConfigConversion;
pub use input::InputConversion;
pub use output::OutputConversion;

/// Fixed-width binary number formats shared by the three conversion kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteFormat {
    Int8,
    UInt8,
    /// Alias of `UInt8`.
    SingleByte,
    Int16LittleEndian,
    Int16BigEndian,
    UInt16LittleEndian,
    UInt16BigEndian,
    Int24LittleEndian,
    Int24BigEndian,
    UInt24LittleEndian,
    UInt24BigEndian,
    Int32LittleEndian,
    Int32BigEndian,
    UInt32LittleEndian,
    UInt32BigEndian,
    Float32LittleEndian,
    Float32BigEndian,
    Float64LittleEndian,
    Float64BigEndian,
}

const FORMATS: &[(&str, ByteFormat)] = &[
    ("int8", ByteFormat::Int8),
    ("uInt8", ByteFormat::UInt8),
    ("singleByte", ByteFormat::SingleByte),
    ("int16LittleEndian", ByteFormat::Int16LittleEndian),
    ("int16BigEndian", ByteFormat::Int16BigEndian),
    ("uInt16LittleEndian", ByteFormat::UInt16LittleEndian),
    ("uInt16BigEndian", ByteFormat::UInt16BigEndian),
    ("int24LittleEndian", ByteFormat::Int24LittleEndian),
    ("int24BigEndian", ByteFormat::Int24BigEndian),
    ("uInt24LittleEndian", ByteFormat::UInt24LittleEndian),
    ("uInt24BigEndian", ByteFormat::UInt24BigEndian),
    ("int32LittleEndian", ByteFormat::Int32LittleEndian),
    ("int32BigEndian", ByteFormat::Int32BigEndian),
    ("uInt32LittleEndian", ByteFormat::UInt32LittleEndian),
    ("uInt32BigEndian", ByteFormat::UInt32BigEndian),
    ("float32LittleEndian", ByteFormat::Float32LittleEndian),
    ("float32BigEndian", ByteFormat::Float32BigEndian),
    ("float64LittleEndian", ByteFormat::Float64LittleEndian),
    ("float64BigEndian", ByteFormat::Float64BigEndian),
];

impl ByteFormat {
    pub fn name(self) -> &'static str {
        FORMATS
            .iter()
            .find(|(_, format)| *format == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Width in bytes of one encoded value.
    pub fn width(self) -> usize {
        use ByteFormat::*;
        match self {
            Int8 | UInt8 | SingleByte => 1,
            Int16LittleEndian | Int16BigEndian | UInt16LittleEndian | UInt16BigEndian => 2,
            Int24LittleEndian | Int24BigEndian | UInt24LittleEndian | UInt24BigEndian => 3,
            Int32LittleEndian | Int32BigEndian | UInt32LittleEndian | UInt32BigEndian
            | Float32LittleEndian | Float32BigEndian => 4,
            Float64LittleEndian | Float64BigEndian => 8,
        }
    }

    /// Single-byte formats accept configuration values in `-128..=255`.
    pub fn is_single_byte(self) -> bool {
        self.width() == 1
    }

    fn is_big_endian(self) -> bool {
        use ByteFormat::*;
        matches!(
            self,
            Int16BigEndian
                | UInt16BigEndian
                | Int24BigEndian
                | UInt24BigEndian
                | Int32BigEndian
                | UInt32BigEndian
                | Float32BigEndian
                | Float64BigEndian
        )
    }

    /// Decodes the leading bytes of `data`. Returns `None` when `data` is
    /// shorter than the format.
    pub fn decode(self, data: &[u8]) -> Option<f64> {
        use ByteFormat::*;
        let width = self.width();
        if data.len() < width {
            return None;
        }

        // Little-endian view of the value bytes.
        let mut le = [0u8; 8];
        le[..width].copy_from_slice(&data[..width]);
        if self.is_big_endian() {
            le[..width].reverse();
        }

        let unsigned = u64::from_le_bytes(le);
        let value = match self {
            Int8 => f64::from(data[0] as i8),
            UInt8 | SingleByte => f64::from(data[0]),
            Int16LittleEndian | Int16BigEndian => f64::from(unsigned as u16 as i16),
            UInt16LittleEndian | UInt16BigEndian => f64::from(unsigned as u16),
            Int24LittleEndian | Int24BigEndian => {
                // Sign-extend from bit 23.
                f64::from(((unsigned as u32) << 8) as i32 >> 8)
            }
            UInt24LittleEndian | UInt24BigEndian | UInt32LittleEndian | UInt32BigEndian => {
                f64::from(unsigned as u32)
            }
            Int32LittleEndian | Int32BigEndian => f64::from(unsigned as u32 as i32),
            Float32LittleEndian | Float32BigEndian => f64::from(f32::from_bits(unsigned as u32)),
            Float64LittleEndian | Float64BigEndian => f64::from_bits(unsigned),
        };
        Some(value)
    }

    /// Encodes `value`, narrowing through a 32-bit integer (64-bit for
    /// `uInt32`) with two's-complement truncation.
    pub fn encode(self, value: f64) -> Vec<u8> {
        use ByteFormat::*;
        let width = self.width();
        let le: [u8; 8] = match self {
            Float32LittleEndian | Float32BigEndian => {
                u64::from((value as f32).to_bits()).to_le_bytes()
            }
            Float64LittleEndian | Float64BigEndian => value.to_bits().to_le_bytes(),
            UInt32LittleEndian | UInt32BigEndian => (value as i64).to_le_bytes(),
            _ => i64::from(value as i32).to_le_bytes(),
        };

        let mut bytes = le[..width].to_vec();
        if self.is_big_endian() {
            bytes.reverse();
        }
        bytes
    }
}

impl FromStr for ByteFormat {
    type Err = BluetoothError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FORMATS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, format)| *format)
            .ok_or_else(|| unknown_conversion(s))
    }
}

impl fmt::Display for ByteFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn unknown_conversion(name: &str) -> BluetoothError {
    BluetoothError::InvalidConfiguration(format!("invalid conversion function: {}", name))
}
