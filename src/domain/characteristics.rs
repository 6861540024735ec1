use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversions::{ConfigConversion, InputConversion, OutputConversion};
use crate::error::{BluetoothError, Result};

/// One resolved characteristic entry of an experiment's device configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum CharacteristicConfig {
    /// Values read from the device into buffer `index`. With `extra_time`
    /// the buffer receives the elapsed time of each sample instead and no
    /// conversion is needed.
    Input {
        uuid: Uuid,
        index: usize,
        extra_time: bool,
        conversion: Option<InputConversion>,
    },
    /// Last value of buffer `index` written to the device.
    Output {
        uuid: Uuid,
        index: usize,
        conversion: OutputConversion,
    },
    /// Bytes written once after connecting.
    Config { uuid: Uuid, value: Vec<u8> },
}

impl CharacteristicConfig {
    pub fn uuid(&self) -> Uuid {
        match self {
            CharacteristicConfig::Input { uuid, .. }
            | CharacteristicConfig::Output { uuid, .. }
            | CharacteristicConfig::Config { uuid, .. } => *uuid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    Input,
    Output,
    Config,
}

/// Serialized form of a characteristic entry as it appears in an experiment
/// definition. Conversion names are resolved by [`CharacteristicEntry::resolve`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacteristicEntry {
    pub uuid: Uuid,
    pub role: EntryRole,
    #[serde(default)]
    pub index: usize,
    /// `"time"` marks an input buffer that receives sample times.
    #[serde(default)]
    pub extra: Option<String>,
    #[serde(default)]
    pub conversion: Option<String>,
    /// Config value, converted with `conversion`.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub repeating: usize,
    #[serde(default)]
    pub decimal_point: Option<String>,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub label_index: usize,
}

impl CharacteristicEntry {
    pub fn resolve(&self) -> Result<CharacteristicConfig> {
        match self.role {
            EntryRole::Input => {
                let extra_time = match self.extra.as_deref() {
                    None => false,
                    Some("time") => true,
                    Some(other) => {
                        return Err(BluetoothError::InvalidConfiguration(format!(
                            "unknown value for extra attribute: {}",
                            other
                        )))
                    }
                };
                let conversion = if extra_time {
                    None
                } else {
                    Some(self.input_conversion()?)
                };
                Ok(CharacteristicConfig::Input {
                    uuid: self.uuid,
                    index: self.index,
                    extra_time,
                    conversion,
                })
            }
            EntryRole::Output => Ok(CharacteristicConfig::Output {
                uuid: self.uuid,
                index: self.index,
                conversion: self.conversion_name()?.parse()?,
            }),
            EntryRole::Config => {
                let conversion: ConfigConversion = self.conversion_name()?.parse()?;
                let value = self.value.as_deref().unwrap_or_default();
                Ok(CharacteristicConfig::Config {
                    uuid: self.uuid,
                    value: conversion.convert(value)?,
                })
            }
        }
    }

    fn conversion_name(&self) -> Result<&str> {
        self.conversion.as_deref().ok_or_else(|| {
            BluetoothError::InvalidConfiguration(format!(
                "characteristic {} needs a conversion attribute",
                self.uuid
            ))
        })
    }

    fn input_conversion(&self) -> Result<InputConversion> {
        let conversion = match self.conversion_name()?.parse::<InputConversion>()? {
            InputConversion::Simple { format, .. } => InputConversion::Simple {
                format,
                offset: self.offset,
                length: self.length,
                repeating: self.repeating,
            },
            InputConversion::Text { .. } => InputConversion::Text {
                decimal_point: self.decimal_point.clone(),
                offset: self.offset,
                length: self.length,
                repeating: self.repeating,
            },
            InputConversion::FormattedText { .. } => InputConversion::FormattedText {
                separator: self.separator.clone().unwrap_or_default(),
                label: self.label.clone(),
                index: self.label_index,
            },
        };
        Ok(conversion)
    }
}

/// Resolves all entries, rejecting a second time binding on one characteristic.
pub fn resolve_entries(entries: &[CharacteristicEntry]) -> Result<Vec<CharacteristicConfig>> {
    let mut timed: Vec<Uuid> = Vec::new();
    entries
        .iter()
        .map(|entry| {
            let config = entry.resolve()?;
            if let CharacteristicConfig::Input {
                uuid,
                extra_time: true,
                ..
            } = &config
            {
                if timed.contains(uuid) {
                    return Err(BluetoothError::InvalidConfiguration(format!(
                        "extra=time can be used only once for characteristic {}",
                        uuid
                    )));
                }
                timed.push(*uuid);
            }
            Ok(config)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::conversions::ByteFormat;

    const DATA: &str = "00002a6e-0000-1000-8000-00805f9b34fb";

    #[test]
    fn test_resolve_input_with_parameters() {
        let entry: CharacteristicEntry = serde_json::from_str(&format!(
            r#"{{"uuid": "{}", "role": "input", "index": 2, "conversion": "uInt8", "offset": 1, "repeating": 2}}"#,
            DATA
        ))
        .unwrap();
        assert_eq!(
            entry.resolve().unwrap(),
            CharacteristicConfig::Input {
                uuid: DATA.parse().unwrap(),
                index: 2,
                extra_time: false,
                conversion: Some(InputConversion::Simple {
                    format: ByteFormat::UInt8,
                    offset: 1,
                    length: 0,
                    repeating: 2,
                }),
            }
        );
    }

    #[test]
    fn test_resolve_time_needs_no_conversion() {
        let entry: CharacteristicEntry = serde_json::from_str(&format!(
            r#"{{"uuid": "{}", "role": "input", "extra": "time"}}"#,
            DATA
        ))
        .unwrap();
        assert!(matches!(
            entry.resolve().unwrap(),
            CharacteristicConfig::Input {
                extra_time: true,
                conversion: None,
                ..
            }
        ));
    }

    #[test]
    fn test_resolve_config_converts_value() {
        let entry: CharacteristicEntry = serde_json::from_str(&format!(
            r#"{{"uuid": "{}", "role": "config", "conversion": "hexadecimal", "value": "0102"}}"#,
            DATA
        ))
        .unwrap();
        assert_eq!(
            entry.resolve().unwrap(),
            CharacteristicConfig::Config {
                uuid: DATA.parse().unwrap(),
                value: vec![1, 2],
            }
        );
    }

    #[test]
    fn test_resolve_rejects_missing_or_unknown_conversion() {
        let missing: CharacteristicEntry =
            serde_json::from_str(&format!(r#"{{"uuid": "{}", "role": "output"}}"#, DATA)).unwrap();
        assert!(missing.resolve().is_err());

        let unknown: CharacteristicEntry = serde_json::from_str(&format!(
            r#"{{"uuid": "{}", "role": "input", "conversion": "int7"}}"#,
            DATA
        ))
        .unwrap();
        assert!(unknown.resolve().is_err());
    }

    #[test]
    fn test_duplicate_time_binding_rejected() {
        let entry: CharacteristicEntry = serde_json::from_str(&format!(
            r#"{{"uuid": "{}", "role": "input", "extra": "time", "index": 0}}"#,
            DATA
        ))
        .unwrap();
        assert!(resolve_entries(&[entry.clone(), entry]).is_err());
    }
}
