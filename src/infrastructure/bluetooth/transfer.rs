//! Experiment Transfer
//!
//! Devices advertising the transfer service can hand over their own
//! experiment definition. The payload arrives in chunks on the experiment
//! characteristic:
//!
//! ```text
//! first chunk:  "phyphox" | total size (u32 BE) | CRC32 (u32 BE)
//! next chunks:  payload bytes until total size is reached
//! ```
//!
//! A payload starting with `<phyphox` is a plain experiment document, anything
//! else is a zip archive, possibly stripped down to a single stored entry
//! followed by its data descriptor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BluetoothError, DeviceLabel, Result};

use super::protocol::{
    CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE, TRANSFER_CONTROL_UUID,
    TRANSFER_EXPERIMENT_UUID, TRANSFER_SERVICE_UUID,
};
use super::transport::{
    CharacteristicId, GattCharacteristic, GattTransport, LinkState, PeerDevice, TransportEvent,
};

pub const TRANSFER_MAGIC: &[u8] = b"phyphox";
const HEADER_LEN: usize = 15;
/// Exclusive upper bound of the declared payload size.
pub const MAX_TRANSFER_SIZE: usize = 10_000_000;

const DOCUMENT_MAGIC: &[u8] = b"<phyphox";
const DATA_DESCRIPTOR_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x07, 0x08];
const ENTRY_NAME: &[u8] = b"a.phyphox";

#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Header accepted.
    Started { total: usize },
    Receiving { received: usize, total: usize },
    /// Payload received and checksum verified.
    Complete(TransferPayload),
    /// The device announced an empty transfer.
    Empty,
}

#[derive(Debug)]
struct Pending {
    total: usize,
    crc: u32,
    data: Vec<u8>,
}

/// Reassembles the chunked payload.
#[derive(Debug, Default)]
pub struct TransferAssembler {
    pending: Option<Pending>,
}

impl TransferAssembler {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Progress> {
        let Some(mut pending) = self.pending.take() else {
            return self.start(chunk);
        };

        let take = chunk.len().min(pending.total - pending.data.len());
        pending.data.extend_from_slice(&chunk[..take]);
        if pending.data.len() < pending.total {
            let progress = Progress::Receiving {
                received: pending.data.len(),
                total: pending.total,
            };
            self.pending = Some(pending);
            return Ok(progress);
        }

        if crc32fast::hash(&pending.data) != pending.crc {
            return Err(BluetoothError::TransferCorrupt("CRC32".to_string()));
        }
        Ok(Progress::Complete(TransferPayload { data: pending.data }))
    }

    fn start(&mut self, header: &[u8]) -> Result<Progress> {
        if header.len() < HEADER_LEN || !header.starts_with(TRANSFER_MAGIC) {
            return Err(BluetoothError::TransferCorrupt("invalid header".to_string()));
        }
        let total = u32::from_be_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let crc = u32::from_be_bytes([header[11], header[12], header[13], header[14]]);
        if total >= MAX_TRANSFER_SIZE {
            return Err(BluetoothError::TransferCorrupt(
                "invalid size in header".to_string(),
            ));
        }
        if total == 0 {
            return Ok(Progress::Empty);
        }
        debug!("Transfer announced: {} bytes, crc {:08x}", total, crc);
        self.pending = Some(Pending {
            total,
            crc,
            data: Vec::with_capacity(total),
        });
        Ok(Progress::Started { total })
    }
}

/// A verified experiment payload.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPayload {
    data: Vec<u8>,
}

impl TransferPayload {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_document(&self) -> bool {
        self.data.starts_with(DOCUMENT_MAGIC)
    }

    /// Empties `dir` and writes the payload as `bt.phyphox` or `bt.zip`.
    pub fn store(&self, dir: &Path) -> Result<StoredExperiment> {
        fs::create_dir_all(dir)?;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        let (path, is_zip) = if self.is_document() {
            let path = dir.join("bt.phyphox");
            fs::write(&path, &self.data)?;
            (path, false)
        } else {
            let path = dir.join("bt.zip");
            fs::write(&path, inflate_partial_zip(&self.data))?;
            (path, true)
        };
        info!("Stored received experiment at {}", path.display());
        Ok(StoredExperiment { path, is_zip })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredExperiment {
    pub path: PathBuf,
    pub is_zip: bool,
}

/// Completes a zip that carries only one stored entry and its data
/// descriptor. Other input is returned unchanged.
pub fn inflate_partial_zip(data: &[u8]) -> Vec<u8> {
    let len = data.len();
    if len < 16 || data[len - 16..len - 12] != DATA_DESCRIPTOR_SIGNATURE {
        return data.to_vec();
    }
    let entry = &data[..len - 16];
    // crc32, compressed size, uncompressed size
    let sizes = &data[len - 12..];
    let name_len = ENTRY_NAME.len() as u16;

    let local_header_len = 30 + ENTRY_NAME.len();
    let central_len = 46 + ENTRY_NAME.len();
    let central_offset = (local_header_len + entry.len()) as u32;

    let mut zip = Vec::with_capacity(local_header_len + entry.len() + central_len + 22);

    // local file header
    zip.extend_from_slice(&[0x50, 0x4b, 0x03, 0x04]);
    zip.extend_from_slice(&10u16.to_le_bytes()); // version needed
    zip.extend_from_slice(&0u16.to_le_bytes()); // flags
    zip.extend_from_slice(&0u16.to_le_bytes()); // stored
    zip.extend_from_slice(&[0; 4]); // time, date
    zip.extend_from_slice(sizes);
    zip.extend_from_slice(&name_len.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes()); // extra
    zip.extend_from_slice(ENTRY_NAME);

    zip.extend_from_slice(entry);

    // central directory
    zip.extend_from_slice(&[0x50, 0x4b, 0x01, 0x02]);
    zip.extend_from_slice(&10u16.to_le_bytes()); // version made by
    zip.extend_from_slice(&10u16.to_le_bytes()); // version needed
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes());
    zip.extend_from_slice(&[0; 4]);
    zip.extend_from_slice(sizes);
    zip.extend_from_slice(&name_len.to_le_bytes());
    zip.extend_from_slice(&[0; 6]); // extra, comment, disk
    zip.extend_from_slice(&[0; 6]); // internal, external attributes
    zip.extend_from_slice(&0u32.to_le_bytes()); // local header offset
    zip.extend_from_slice(ENTRY_NAME);

    // end of central directory
    zip.extend_from_slice(&[0x50, 0x4b, 0x05, 0x06]);
    zip.extend_from_slice(&[0; 4]); // disk numbers
    zip.extend_from_slice(&1u16.to_le_bytes());
    zip.extend_from_slice(&1u16.to_le_bytes());
    zip.extend_from_slice(&(central_len as u32).to_le_bytes());
    zip.extend_from_slice(&central_offset.to_le_bytes());
    zip.extend_from_slice(&0u16.to_le_bytes()); // comment

    zip
}

/// Receives transfer updates.
pub trait TransferListener: Send + Sync {
    fn progress(&self, transferred: usize, total: usize);
    /// The transfer ended without a result.
    fn dismiss(&self);
    fn error(&self, message: &str);
    fn success(&self, experiment: &StoredExperiment);
}

#[derive(Debug, Default)]
struct Session {
    experiment: Option<CharacteristicId>,
    control: Option<CharacteristicId>,
    subscribed: bool,
    active: bool,
    assembler: TransferAssembler,
}

enum Step {
    Continue,
    Finished(Option<StoredExperiment>),
}

/// Connects to a device, pulls its experiment and stores it.
pub struct ExperimentTransferLoader {
    transport: Arc<dyn GattTransport>,
    listener: Arc<dyn TransferListener>,
    target_dir: PathBuf,
    event_timeout: Duration,
}

impl ExperimentTransferLoader {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        listener: Arc<dyn TransferListener>,
        target_dir: PathBuf,
    ) -> Self {
        Self {
            transport,
            listener,
            target_dir,
            event_timeout: Duration::from_secs(10),
        }
    }

    /// Longest silence tolerated between two transport events.
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    /// Runs the transfer until it completes, fails or the device
    /// disconnects. The listener sees the same outcome.
    pub async fn load(
        &self,
        device: &PeerDevice,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<Option<StoredExperiment>> {
        info!("Loading experiment from {}", device.address);
        let mut session = Session::default();
        let result = self.run(device, events, &mut session).await;
        self.finish(&session);

        match &result {
            Ok(Some(stored)) => self.listener.success(stored),
            Ok(None) => self.listener.dismiss(),
            Err(e) => {
                warn!("Experiment transfer failed: {}", e);
                self.listener.error(&e.to_string());
            }
        }
        result
    }

    async fn run(
        &self,
        device: &PeerDevice,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        session: &mut Session,
    ) -> Result<Option<StoredExperiment>> {
        let label = DeviceLabel {
            address: Some(device.address.clone()),
            name: device.name.clone(),
        };
        let setup_failed = || BluetoothError::NotificationEnableFailed {
            uuid: TRANSFER_EXPERIMENT_UUID,
            device: label.clone(),
        };

        if !self.transport.connect(device) {
            return Err(BluetoothError::ConnectionFailed {
                device: label.clone(),
            });
        }

        loop {
            let event = tokio::time::timeout(self.event_timeout, events.recv())
                .await
                .map_err(|_| BluetoothError::TransferCorrupt("timeout".to_string()))?
                .ok_or_else(|| BluetoothError::TransferCorrupt("transport closed".to_string()))?;

            match event {
                TransportEvent::ConnectionStateChanged {
                    state: LinkState::Connected,
                    status,
                } if status.is_success() => {
                    if !self.transport.discover_services() {
                        return Err(setup_failed());
                    }
                }
                TransportEvent::ConnectionStateChanged { .. } => {
                    debug!("Transfer link closed");
                    return Ok(None);
                }
                TransportEvent::ServicesDiscovered { status } => {
                    if !status.is_success() {
                        return Err(setup_failed());
                    }
                    self.begin(session).ok_or_else(setup_failed)?;
                }
                TransportEvent::DescriptorWrite { status, .. } => {
                    if !status.is_success() {
                        return Err(BluetoothError::TransferCorrupt(
                            "could not write descriptor".to_string(),
                        ));
                    }
                    if session.active {
                        self.set_control(session, 1);
                    }
                }
                TransportEvent::CharacteristicWrite { status, .. } => {
                    if !status.is_success() {
                        return Err(BluetoothError::TransferCorrupt("could not write".to_string()));
                    }
                    if !session.subscribed {
                        if let Some(experiment) = session.experiment {
                            self.transport.read(&experiment);
                        }
                    }
                }
                TransportEvent::CharacteristicChanged {
                    characteristic,
                    value,
                } if session.active && Some(characteristic) == session.experiment => {
                    if let Step::Finished(result) = self.data_in(session, &value)? {
                        return Ok(result);
                    }
                }
                TransportEvent::CharacteristicRead {
                    characteristic,
                    value: Some(value),
                    ..
                } if session.active && Some(characteristic) == session.experiment => {
                    match self.data_in(session, &value)? {
                        Step::Finished(result) => return Ok(result),
                        Step::Continue => {
                            self.transport.read(&characteristic);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Locates the transfer characteristics and enables updates. `None`
    /// when the device does not offer a usable transfer service.
    fn begin(&self, session: &mut Session) -> Option<()> {
        let service = self
            .transport
            .services()
            .into_iter()
            .find(|service| service.uuid == TRANSFER_SERVICE_UUID)?;
        let find = |uuid: Uuid| -> Option<GattCharacteristic> {
            service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
        };
        let experiment = find(TRANSFER_EXPERIMENT_UUID)?;
        session.experiment = Some(experiment.id());
        session.control = find(TRANSFER_CONTROL_UUID).map(|c| c.id());
        session.active = true;

        if !self.transport.set_notification(&experiment.id(), true) {
            return None;
        }
        if experiment.properties.notify {
            if !experiment.has_cccd() {
                return None;
            }
            session.subscribed = true;
            self.transport
                .write_descriptor(&experiment.id(), CCCD_UUID, &ENABLE_NOTIFICATION_VALUE);
        } else if session.control.is_some() {
            self.set_control(session, 1);
        } else {
            self.transport.read(&experiment.id());
        }
        Some(())
    }

    fn data_in(&self, session: &mut Session, chunk: &[u8]) -> Result<Step> {
        match session.assembler.push(chunk)? {
            Progress::Started { total } => {
                self.listener.progress(0, total);
                Ok(Step::Continue)
            }
            Progress::Receiving { received, total } => {
                self.listener.progress(received, total);
                Ok(Step::Continue)
            }
            Progress::Empty => Ok(Step::Finished(None)),
            Progress::Complete(payload) => {
                let total = payload.data().len();
                self.listener.progress(total, total);
                session.active = false;
                let stored = payload.store(&self.target_dir)?;
                Ok(Step::Finished(Some(stored)))
            }
        }
    }

    fn set_control(&self, session: &Session, value: u8) {
        if let Some(control) = session.control {
            self.transport.write(&control, &[value]);
        }
    }

    /// Best-effort: disables updates, tells the device to stop and closes.
    fn finish(&self, session: &Session) {
        if session.subscribed {
            if let Some(experiment) = session.experiment {
                self.transport
                    .write_descriptor(&experiment, CCCD_UUID, &DISABLE_NOTIFICATION_VALUE);
            }
        }
        self.set_control(session, 0);
        self.transport.close();
    }
}
