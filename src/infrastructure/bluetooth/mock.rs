//! In-memory [`GattTransport`] for hosts without a radio and for tests.
//!
//! Accepted operations are recorded with a timestamp and, unless automatic
//! completion is switched off, answered right away with their completion
//! event.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::lock;
use super::transport::{
    CharacteristicId, GattService, GattStatus, GattTransport, LinkState, PeerDevice,
    TransportEvent,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Connect(String),
    Discover,
    Read(CharacteristicId),
    Write(CharacteristicId, Vec<u8>),
    WriteDescriptor(CharacteristicId, Uuid, Vec<u8>),
    RequestMtu(u16),
    SetNotification(CharacteristicId, bool),
    Close,
}

#[derive(Debug)]
struct MockState {
    supported: bool,
    enabled: bool,
    connected: bool,
    paired: Vec<PeerDevice>,
    services: Vec<GattService>,
    read_values: HashMap<CharacteristicId, Vec<u8>>,
    cached: HashMap<CharacteristicId, Vec<u8>>,
    fail_connect: bool,
    write_status: GattStatus,
    reject_next: usize,
    auto_complete: bool,
    pending: VecDeque<TransportEvent>,
    operations: Vec<(Instant, Operation)>,
}

#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Mutex::new(MockState {
                supported: true,
                enabled: true,
                connected: false,
                paired: Vec::new(),
                services: Vec::new(),
                read_values: HashMap::new(),
                cached: HashMap::new(),
                fail_connect: false,
                write_status: GattStatus::Success,
                reject_next: 0,
                auto_complete: true,
                pending: VecDeque::new(),
                operations: Vec::new(),
            }),
            events,
        };
        (Arc::new(transport), rx)
    }

    pub fn set_supported(&self, supported: bool) {
        lock(&self.state).supported = supported;
    }

    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.state).enabled = enabled;
    }

    pub fn add_paired(&self, device: PeerDevice) {
        lock(&self.state).paired.push(device);
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        lock(&self.state).services = services;
    }

    /// Value returned by reads of `characteristic`.
    pub fn set_read_value(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        lock(&self.state).read_values.insert(characteristic, value);
    }

    pub fn set_cached_value(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        lock(&self.state).cached.insert(characteristic, value);
    }

    /// Connection attempts complete with a failure status.
    pub fn set_fail_connect(&self, fail: bool) {
        lock(&self.state).fail_connect = fail;
    }

    pub fn set_write_status(&self, status: GattStatus) {
        lock(&self.state).write_status = status;
    }

    /// Refuse to initiate the next `count` operations.
    pub fn reject_next(&self, count: usize) {
        lock(&self.state).reject_next = count;
    }

    /// With automatic completion off, completions wait for [`Self::complete_next`].
    pub fn set_auto_complete(&self, auto: bool) {
        lock(&self.state).auto_complete = auto;
    }

    /// Delivers the oldest held-back completion. Returns false if none is pending.
    pub fn complete_next(&self) -> bool {
        let event = lock(&self.state).pending.pop_front();
        match event {
            Some(event) => {
                let _ = self.events.send(event);
                true
            }
            None => false,
        }
    }

    pub fn pending_completions(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Drops the link as if the peripheral went out of range.
    pub fn simulate_disconnect(&self) {
        lock(&self.state).connected = false;
        let _ = self.events.send(TransportEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Disconnected,
        });
    }

    /// Pushes a notification for `characteristic`.
    pub fn notify(&self, characteristic: CharacteristicId, value: Vec<u8>) {
        let _ = self.events.send(TransportEvent::CharacteristicChanged {
            characteristic,
            value,
        });
    }

    pub fn operations(&self) -> Vec<(Instant, Operation)> {
        lock(&self.state).operations.clone()
    }

    pub fn clear_operations(&self) {
        lock(&self.state).operations.clear();
    }

    /// Records `operation`; returns false when it has to be refused.
    fn begin(&self, operation: Operation) -> bool {
        let mut state = lock(&self.state);
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return false;
        }
        state.operations.push((Instant::now(), operation));
        true
    }

    fn complete(&self, event: TransportEvent) {
        let mut state = lock(&self.state);
        if state.auto_complete {
            drop(state);
            let _ = self.events.send(event);
        } else {
            state.pending.push_back(event);
        }
    }
}

impl GattTransport for MockTransport {
    fn is_supported(&self) -> bool {
        lock(&self.state).supported
    }

    fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    fn paired_devices(&self) -> Vec<PeerDevice> {
        lock(&self.state).paired.clone()
    }

    fn remote_device(&self, address: &str) -> Option<PeerDevice> {
        Some(PeerDevice {
            address: address.to_string(),
            name: None,
        })
    }

    fn connect(&self, device: &PeerDevice) -> bool {
        if !self.begin(Operation::Connect(device.address.clone())) {
            return false;
        }
        let fail = {
            let mut state = lock(&self.state);
            state.connected = !state.fail_connect;
            state.fail_connect
        };
        let event = if fail {
            TransportEvent::ConnectionStateChanged {
                status: GattStatus::Failure(133),
                state: LinkState::Disconnected,
            }
        } else {
            TransportEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                state: LinkState::Connected,
            }
        };
        self.complete(event);
        true
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.operations.push((Instant::now(), Operation::Close));
    }

    fn discover_services(&self) -> bool {
        if !self.begin(Operation::Discover) {
            return false;
        }
        self.complete(TransportEvent::ServicesDiscovered {
            status: GattStatus::Success,
        });
        true
    }

    fn services(&self) -> Vec<GattService> {
        lock(&self.state).services.clone()
    }

    fn read(&self, characteristic: &CharacteristicId) -> bool {
        if !self.begin(Operation::Read(*characteristic)) {
            return false;
        }
        let value = lock(&self.state)
            .read_values
            .get(characteristic)
            .cloned()
            .unwrap_or_default();
        self.complete(TransportEvent::CharacteristicRead {
            characteristic: *characteristic,
            status: GattStatus::Success,
            value: Some(value),
        });
        true
    }

    fn write(&self, characteristic: &CharacteristicId, value: &[u8]) -> bool {
        if !self.begin(Operation::Write(*characteristic, value.to_vec())) {
            return false;
        }
        let status = {
            let mut state = lock(&self.state);
            if state.write_status.is_success() {
                state.cached.insert(*characteristic, value.to_vec());
            }
            state.write_status
        };
        self.complete(TransportEvent::CharacteristicWrite {
            characteristic: *characteristic,
            status,
        });
        true
    }

    fn write_descriptor(
        &self,
        characteristic: &CharacteristicId,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        if !self.begin(Operation::WriteDescriptor(
            *characteristic,
            descriptor,
            value.to_vec(),
        )) {
            return false;
        }
        self.complete(TransportEvent::DescriptorWrite {
            characteristic: *characteristic,
            status: GattStatus::Success,
        });
        true
    }

    fn set_notification(&self, characteristic: &CharacteristicId, enabled: bool) -> bool {
        self.begin(Operation::SetNotification(*characteristic, enabled))
    }

    fn request_mtu(&self, mtu: u16) -> bool {
        if !self.begin(Operation::RequestMtu(mtu)) {
            return false;
        }
        self.complete(TransportEvent::MtuChanged {
            mtu,
            status: GattStatus::Success,
        });
        true
    }

    fn cached_value(&self, characteristic: &CharacteristicId) -> Option<Vec<u8>> {
        lock(&self.state).cached.get(characteristic).cloned()
    }
}
