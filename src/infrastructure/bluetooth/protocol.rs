//! GATT Protocol Definitions
//!
//! Well-known UUIDs and descriptor values used by the device link and the
//! experiment transfer protocol.

use uuid::Uuid;

/// Bluetooth base UUID, 16- and 32-bit UUIDs are expanded against it.
pub const BASE_UUID: Uuid = Uuid::from_u128(0x00000000_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Experiment transfer service advertised by devices that carry their own
/// experiment definition.
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0xcddf0001_30f7_4671_8b43_5e40ba53514a);

/// Characteristic streaming the experiment definition.
pub const TRANSFER_EXPERIMENT_UUID: Uuid = Uuid::from_u128(0xcddf0002_30f7_4671_8b43_5e40ba53514a);

/// Characteristic starting (1) and stopping (0) the transfer.
pub const TRANSFER_CONTROL_UUID: Uuid = Uuid::from_u128(0xcddf0003_30f7_4671_8b43_5e40ba53514a);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Expands a 16- or 32-bit assigned number against the base UUID.
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID.as_u128() | (u128::from(short) << 96))
}
