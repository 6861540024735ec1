use std::str::FromStr;

use super::{unknown_conversion, ByteFormat};
use crate::error::{BluetoothError, Result};

/// Encoding of a configuration value, given as text, into the bytes written
/// to a config characteristic after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigConversion {
    /// Raw UTF-8 bytes of the value.
    Text,
    /// Pairs of hex digits, e.g. `"0a1B"`.
    Hexadecimal,
    /// The value parsed as a number and encoded in a binary format.
    Number(ByteFormat),
}

impl ConfigConversion {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigConversion::Text => "string",
            ConfigConversion::Hexadecimal => "hexadecimal",
            ConfigConversion::Number(format) => format.name(),
        }
    }

    pub fn convert(&self, value: &str) -> Result<Vec<u8>> {
        match self {
            ConfigConversion::Text => Ok(value.as_bytes().to_vec()),
            ConfigConversion::Hexadecimal => self.hexadecimal(value),
            ConfigConversion::Number(format) if format.is_single_byte() => {
                match value.trim().parse::<i16>() {
                    Ok(byte) if (-128..=255).contains(&byte) => Ok(vec![byte as u8]),
                    _ => Err(self.invalid(value)),
                }
            }
            ConfigConversion::Number(format) => value
                .trim()
                .parse::<f64>()
                .map(|number| format.encode(number))
                .map_err(|_| self.invalid(value)),
        }
    }

    fn hexadecimal(&self, value: &str) -> Result<Vec<u8>> {
        let digits = value.as_bytes();
        if digits.len() % 2 != 0 {
            return Err(self.invalid(value));
        }
        digits
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| self.invalid(value))
            })
            .collect()
    }

    fn invalid(&self, value: &str) -> BluetoothError {
        BluetoothError::InvalidConfiguration(format!(
            "value \"{}\" cannot be converted with {}",
            value,
            self.name()
        ))
    }
}

impl FromStr for ConfigConversion {
    type Err = BluetoothError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "string" => Ok(ConfigConversion::Text),
            "hexadecimal" => Ok(ConfigConversion::Hexadecimal),
            other => other
                .parse::<ByteFormat>()
                .map(ConfigConversion::Number)
                .map_err(|_| unknown_conversion(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexadecimal() {
        let conversion: ConfigConversion = "hexadecimal".parse().unwrap();
        assert_eq!(conversion.convert("0a1B").unwrap(), vec![0x0a, 0x1b]);
        assert!(conversion.convert("abc").is_err());
        assert!(conversion.convert("zz").is_err());
    }

    #[test]
    fn test_single_byte_range() {
        let conversion: ConfigConversion = "uInt8".parse().unwrap();
        assert_eq!(conversion.convert("200").unwrap(), vec![200]);
        assert_eq!(conversion.convert("-1").unwrap(), vec![0xff]);
        assert!(conversion.convert("256").is_err());
        assert!(conversion.convert("1.5").is_err());
    }

    #[test]
    fn test_numeric_and_text() {
        let conversion: ConfigConversion = "int16LittleEndian".parse().unwrap();
        assert_eq!(conversion.convert("300").unwrap(), vec![0x2c, 0x01]);
        let err = conversion.convert("fast").unwrap_err();
        assert!(err.to_string().contains("int16LittleEndian"));

        assert_eq!(ConfigConversion::Text.convert("on").unwrap(), b"on".to_vec());
    }
}
