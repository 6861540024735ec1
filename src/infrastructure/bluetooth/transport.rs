//! GATT Transport Abstraction
//!
//! The radio is driven through [`GattTransport`]. Every operation only
//! reports whether it was *initiated*; its outcome arrives later as a
//! [`TransportEvent`] on the channel handed out when the transport was
//! created, one event at a time.

use uuid::Uuid;

use super::protocol::CCCD_UUID;

/// A characteristic is identified by its own UUID within its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub properties: CharacteristicProperties,
    /// UUIDs of the descriptors found during discovery.
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    pub fn id(&self) -> CharacteristicId {
        CharacteristicId {
            service: self.service_uuid,
            uuid: self.uuid,
        }
    }

    pub fn has_cccd(&self) -> bool {
        self.descriptors.contains(&CCCD_UUID)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Failure(i32),
}

impl GattStatus {
    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// A remote device known to the host adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDevice {
    pub address: String,
    pub name: Option<String>,
}

/// Completion callbacks of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionStateChanged {
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    CharacteristicRead {
        characteristic: CharacteristicId,
        status: GattStatus,
        value: Option<Vec<u8>>,
    },
    CharacteristicWrite {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    /// Unsolicited notification or indication.
    CharacteristicChanged {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    DescriptorWrite {
        characteristic: CharacteristicId,
        status: GattStatus,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
}

/// Host adapter and one GATT client connection.
///
/// Methods returning `bool` report whether the operation was accepted; a
/// `false` means no completion event will follow.
pub trait GattTransport: Send + Sync {
    fn is_supported(&self) -> bool;
    fn is_enabled(&self) -> bool;

    /// Devices bonded with the host adapter.
    fn paired_devices(&self) -> Vec<PeerDevice>;
    /// Handle for an address that is not necessarily bonded.
    fn remote_device(&self, address: &str) -> Option<PeerDevice>;

    fn connect(&self, device: &PeerDevice) -> bool;
    fn is_connected(&self) -> bool;
    fn close(&self);

    fn discover_services(&self) -> bool;
    /// Snapshot of the last discovery.
    fn services(&self) -> Vec<GattService>;

    fn read(&self, characteristic: &CharacteristicId) -> bool;
    fn write(&self, characteristic: &CharacteristicId, value: &[u8]) -> bool;
    fn write_descriptor(&self, characteristic: &CharacteristicId, descriptor: Uuid, value: &[u8])
        -> bool;
    /// Registers for local delivery of notifications; no radio traffic.
    fn set_notification(&self, characteristic: &CharacteristicId, enabled: bool) -> bool;
    fn request_mtu(&self, mtu: u16) -> bool;

    /// Last value the host cached for a characteristic, if any.
    fn cached_value(&self, characteristic: &CharacteristicId) -> Option<Vec<u8>>;
}
