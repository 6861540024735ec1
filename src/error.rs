use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Address and name of the device an error refers to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceLabel {
    pub address: Option<String>,
    pub name: Option<String>,
}

impl fmt::Display for DeviceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device:")?;
        if let Some(address) = &self.address {
            write!(f, " address \"{}\"", address)?;
        }
        if let Some(name) = &self.name {
            write!(f, " name \"{}\"", name)?;
        }
        write!(f, ".")
    }
}

/// Error type for the device link, the command queue and the transfer protocol.
#[derive(Error, Debug)]
pub enum BluetoothError {
    #[error("Bluetooth Low Energy is not supported on this host")]
    NotSupported,

    #[error("Bluetooth is disabled")]
    Disabled,

    #[error("could not find the Bluetooth device\n{device}")]
    NotFound { device: DeviceLabel },

    #[error("could not connect to the Bluetooth device\n{device}")]
    ConnectionFailed { device: DeviceLabel },

    #[error("could not discover the services of the Bluetooth device\n{device}")]
    ServicesDiscoveryFailed { device: DeviceLabel },

    #[error("characteristic {uuid} was not found on the device\n{device}")]
    CharacteristicNotFound { uuid: Uuid, device: DeviceLabel },

    #[error("could not write to the Bluetooth device\n{device}")]
    WriteFailed { device: DeviceLabel },

    #[error("could not read from the Bluetooth device\n{device}")]
    ReadFailed { device: DeviceLabel },

    #[error("could not enable notifications for characteristic {uuid}\n{device}")]
    NotificationEnableFailed { uuid: Uuid, device: DeviceLabel },

    #[error("could not write configuration to characteristic {uuid}\n{device}")]
    ConfigWriteFailed { uuid: Uuid, device: DeviceLabel },

    #[error("the Bluetooth device is not connected\n{device}")]
    NoConnection { device: DeviceLabel },

    #[error("received experiment is corrupted ({0})")]
    TransferCorrupt(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BluetoothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_label_display() {
        let label = DeviceLabel {
            address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            name: Some("SensorTag".to_string()),
        };
        assert_eq!(
            label.to_string(),
            "Device: address \"AA:BB:CC:DD:EE:FF\" name \"SensorTag\"."
        );
        assert_eq!(DeviceLabel::default().to_string(), "Device:.");
    }

    #[test]
    fn test_error_messages_carry_device() {
        let err = BluetoothError::ConnectionFailed {
            device: DeviceLabel {
                address: None,
                name: Some("micro:bit".to_string()),
            },
        };
        assert_eq!(
            err.to_string(),
            "could not connect to the Bluetooth device\nDevice: name \"micro:bit\"."
        );

        let err = BluetoothError::TransferCorrupt("CRC32".to_string());
        assert_eq!(err.to_string(), "received experiment is corrupted (CRC32)");
    }
}
