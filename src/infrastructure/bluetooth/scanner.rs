//! BLE Scanner Module
//!
//! Filtering of advertisements and the capability used to pick a device when
//! it is neither known nor paired.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;

use super::protocol::{uuid_from_short, TRANSFER_SERVICE_UUID};

/// One received advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub uuids: HashSet<Uuid>,
}

impl Advertisement {
    /// Builds an advertisement from the raw scan record.
    pub fn from_scan_record(address: impl Into<String>, name: Option<String>, record: &[u8]) -> Self {
        Self {
            address: address.into(),
            name,
            uuids: parse_advertised_uuids(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
    pub advertised_uuids: HashSet<Uuid>,
    /// Matches the experiment's list of supported devices.
    pub supported: bool,
    /// Offers its own experiment through the transfer service.
    pub exposes_transfer_service: bool,
}

/// What the experiment is looking for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    /// Substring the advertised name must contain.
    pub name_filter: Option<String>,
    /// Service UUID the device must advertise.
    pub uuid_filter: Option<Uuid>,
    pub supported_names: Vec<String>,
    pub supported_uuids: Vec<Uuid>,
    /// Experiment id of the device, shown to the user while scanning.
    pub session_id: Option<String>,
    pub auto_connect: bool,
}

impl ScanRequest {
    /// Applies the filters to `advertisement`. Unnamed devices never match.
    pub fn evaluate(&self, advertisement: &Advertisement) -> Option<DiscoveredDevice> {
        let name = advertisement.name.as_deref()?;

        if let Some(filter) = self.name_filter.as_deref().filter(|f| !f.is_empty()) {
            if !name.contains(filter) {
                return None;
            }
        }
        if let Some(uuid) = &self.uuid_filter {
            if !advertisement.uuids.contains(uuid) {
                return None;
            }
        }

        let supported = self.supported_names.is_empty()
            || self.supported_names.iter().any(|n| name.contains(n.as_str()))
            || self
                .supported_uuids
                .iter()
                .any(|uuid| advertisement.uuids.contains(uuid));

        Some(DiscoveredDevice {
            address: advertisement.address.clone(),
            name: name.to_string(),
            advertised_uuids: advertisement.uuids.clone(),
            supported,
            exposes_transfer_service: advertisement.uuids.contains(&TRANSFER_SERVICE_UUID),
        })
    }

    /// Text shown while scanning.
    pub fn description(&self) -> String {
        let target = match self.name_filter.as_deref().filter(|f| !f.is_empty()) {
            Some(name) => format!("Scanning for \"{}\"", name),
            None => "Scanning for Bluetooth devices".to_string(),
        };
        match self.session_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => format!("{} ({})", target, id),
            None => target,
        }
    }
}

/// Extracts the advertised service UUIDs from raw advertising data.
///
/// The record is a sequence of `[length, type, data...]` structures; 16- and
/// 32-bit lists are expanded against the base UUID, 128-bit lists are stored
/// little-endian. A malformed length ends parsing.
pub fn parse_advertised_uuids(record: &[u8]) -> HashSet<Uuid> {
    let mut uuids = HashSet::new();
    let mut index = 0;

    while index + 2 < record.len() {
        let length = usize::from(record[index]);
        if length == 0 {
            break;
        }
        if index + length >= record.len() {
            trace!("Malformed scan record, length too long");
            break;
        }
        let kind = record[index + 1];
        let data = &record[index + 2..index + 1 + length];

        match kind {
            0x02 | 0x03 => {
                for chunk in data.chunks_exact(2) {
                    uuids.insert(uuid_from_short(u32::from(u16::from_le_bytes([
                        chunk[0], chunk[1],
                    ]))));
                }
            }
            0x04 | 0x05 => {
                for chunk in data.chunks_exact(4) {
                    uuids.insert(uuid_from_short(u32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ])));
                }
            }
            0x06 | 0x07 if length == 17 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(data);
                uuids.insert(Uuid::from_u128(u128::from_le_bytes(bytes)));
            }
            _ => {}
        }
        index += length + 1;
    }

    uuids
}

/// Locates a device that is neither known nor paired, typically by asking
/// the user to pick one from a scan.
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    /// Permissions and adapter state allow scanning. When false, the
    /// connection attempt ends without error and without a device.
    fn preconditions_met(&self) -> bool;

    async fn find_device(&self, request: ScanRequest) -> Option<DiscoveredDevice>;
}

/// Scanner answering from a fixed set of advertisements: the first supported
/// device (or one offering the transfer service) that passes the filters.
#[derive(Debug, Clone, Default)]
pub struct RecordedScanner {
    pub advertisements: Vec<Advertisement>,
    pub permitted: bool,
}

impl RecordedScanner {
    pub fn new(advertisements: Vec<Advertisement>) -> Self {
        Self {
            advertisements,
            permitted: true,
        }
    }
}

#[async_trait]
impl DeviceScanner for RecordedScanner {
    fn preconditions_met(&self) -> bool {
        self.permitted
    }

    async fn find_device(&self, request: ScanRequest) -> Option<DiscoveredDevice> {
        debug!("{}", request.description());
        self.advertisements
            .iter()
            .filter_map(|advertisement| request.evaluate(advertisement))
            .find(|device| device.supported || device.exposes_transfer_service)
    }
}
