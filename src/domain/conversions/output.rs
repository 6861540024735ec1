use std::str::FromStr;

use super::{unknown_conversion, ByteFormat};
use crate::domain::buffers::DataBuffer;
use crate::error::{BluetoothError, Result};

/// Encoding of buffer contents into a characteristic payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputConversion {
    /// Last value in decimal text form.
    Text,
    /// Last value in a fixed-width binary format.
    Number(ByteFormat),
    /// Every buffered value truncated to one byte.
    ByteArray,
}

impl OutputConversion {
    pub fn name(&self) -> &'static str {
        match self {
            OutputConversion::Text => "string",
            OutputConversion::Number(format) => format.name(),
            OutputConversion::ByteArray => "byteArray",
        }
    }

    pub fn encode(&self, buffer: &DataBuffer) -> Result<Vec<u8>> {
        match self {
            OutputConversion::ByteArray => Ok(buffer.values().map(|v| v as i32 as u8).collect()),
            OutputConversion::Text => Ok(format!("{:?}", self.last(buffer)?).into_bytes()),
            OutputConversion::Number(format) => Ok(format.encode(self.last(buffer)?)),
        }
    }

    fn last(&self, buffer: &DataBuffer) -> Result<f64> {
        buffer.last().ok_or_else(|| {
            BluetoothError::InvalidConfiguration(format!(
                "buffer \"{}\" is empty, nothing to encode with {}",
                buffer.name,
                self.name()
            ))
        })
    }
}

impl FromStr for OutputConversion {
    type Err = BluetoothError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" => Ok(OutputConversion::Text),
            "byteArray" => Ok(OutputConversion::ByteArray),
            other => other
                .parse::<ByteFormat>()
                .map(OutputConversion::Number)
                .map_err(|_| unknown_conversion(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(values: &[f64]) -> DataBuffer {
        let mut buffer = DataBuffer::new("out", 0);
        buffer.extend(values.iter().copied());
        buffer
    }

    #[test]
    fn test_numeric_uses_last_value() {
        let conversion: OutputConversion = "uInt16BigEndian".parse().unwrap();
        assert_eq!(conversion.encode(&buffer(&[1.0, 513.0])).unwrap(), vec![0x02, 0x01]);
    }

    #[test]
    fn test_text_and_byte_array() {
        assert_eq!(
            OutputConversion::Text.encode(&buffer(&[3.0])).unwrap(),
            b"3.0".to_vec()
        );
        assert_eq!(
            OutputConversion::ByteArray
                .encode(&buffer(&[1.0, 255.0, 256.0, -1.0]))
                .unwrap(),
            vec![1, 255, 0, 255]
        );
    }

    #[test]
    fn test_empty_buffer_fails() {
        assert!(OutputConversion::Number(ByteFormat::Int8)
            .encode(&buffer(&[]))
            .is_err());
        assert!(OutputConversion::Text.encode(&buffer(&[])).is_err());
        assert_eq!(OutputConversion::ByteArray.encode(&buffer(&[])).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_unknown_name() {
        let err = "int12".parse::<OutputConversion>().unwrap_err();
        assert_eq!(err.to_string(), "invalid configuration: invalid conversion function: int12");
    }
}
