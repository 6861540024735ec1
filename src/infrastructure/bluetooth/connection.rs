//! BLE Connection Module
//!
//! One [`BleLink`] per configured device: resolves the peripheral, opens the
//! GATT connection, discovers services, builds the characteristic mapping and
//! drives the command queue from transport callbacks. Inputs and outputs plug
//! their behavior in through [`LinkRole`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::characteristics::CharacteristicConfig;
use crate::domain::latch::CancellableLatch;
use crate::domain::models::{ConnectionState, DeviceIdentity, SessionState};
use crate::domain::settings::LinkSettings;
use crate::error::{BluetoothError, Result};
use crate::infrastructure::notifier::ErrorNotifier;

use super::lifecycle::{self, Effect};
use super::lock;
use super::mapping::{CharacteristicBinding, Conversion, MappingTable};
use super::queue::{capacity_for, Advance, Command, CommandQueue};
use super::scanner::{DeviceScanner, ScanRequest};
use super::transport::{CharacteristicId, GattCharacteristic, GattTransport, PeerDevice, TransportEvent};

/// Devices already resolved in this session, keyed by experiment device id.
pub type KnownDevices = HashMap<String, PeerDevice>;

/// Behavior layered on top of the shared link: subscribing, polling,
/// decoding and writing.
#[async_trait]
pub trait LinkRole: Sized + Send + Sync + 'static {
    /// Runs after the mapping is built, still inside `connect`.
    async fn after_connect(&self, _link: &Arc<BleLink<Self>>) -> Result<()> {
        Ok(())
    }

    /// Runs after the session flags are set. `resuming` is true when the
    /// experiment was already running, i.e. after a link loss.
    async fn on_start(&self, _link: &Arc<BleLink<Self>>, _resuming: bool) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _link: &Arc<BleLink<Self>>) {}

    async fn before_close(&self, _link: &Arc<BleLink<Self>>) {}

    /// Stops periodic work without touching the radio.
    fn halt(&self) {}

    fn on_read(&self, _link: &BleLink<Self>, _characteristic: &CharacteristicId, _value: Option<&[u8]>) {}

    fn on_changed(&self, _link: &BleLink<Self>, _characteristic: &CharacteristicId, _value: &[u8]) {}
}

/// Connection to one peripheral.
pub struct BleLink<R: LinkRole> {
    identity: DeviceIdentity,
    entries: Vec<CharacteristicConfig>,
    transport: Arc<dyn GattTransport>,
    scanner: Option<Arc<dyn DeviceScanner>>,
    notifier: Arc<dyn ErrorNotifier>,
    settings: LinkSettings,
    role: R,
    device: Mutex<Option<PeerDevice>>,
    mapping: Mutex<MappingTable>,
    queue: CommandQueue,
    latch: Mutex<Arc<CancellableLatch>>,
    session: Mutex<SessionState>,
    state: Mutex<ConnectionState>,
    reconnecting: AtomicBool,
}

impl<R: LinkRole> BleLink<R> {
    pub fn new(
        identity: DeviceIdentity,
        entries: Vec<CharacteristicConfig>,
        transport: Arc<dyn GattTransport>,
        notifier: Arc<dyn ErrorNotifier>,
        settings: LinkSettings,
        role: R,
    ) -> Arc<Self> {
        Self::build(identity, entries, transport, None, notifier, settings, role)
    }

    /// Same as [`BleLink::new`] with a scanner for devices that are neither
    /// known nor paired.
    pub fn with_scanner(
        identity: DeviceIdentity,
        entries: Vec<CharacteristicConfig>,
        transport: Arc<dyn GattTransport>,
        scanner: Arc<dyn DeviceScanner>,
        notifier: Arc<dyn ErrorNotifier>,
        settings: LinkSettings,
        role: R,
    ) -> Arc<Self> {
        Self::build(identity, entries, transport, Some(scanner), notifier, settings, role)
    }

    fn build(
        identity: DeviceIdentity,
        entries: Vec<CharacteristicConfig>,
        transport: Arc<dyn GattTransport>,
        scanner: Option<Arc<dyn DeviceScanner>>,
        notifier: Arc<dyn ErrorNotifier>,
        settings: LinkSettings,
        role: R,
    ) -> Arc<Self> {
        let queue = CommandQueue::new(settings.min_queue_capacity);
        Arc::new(Self {
            identity,
            entries,
            transport,
            scanner,
            notifier,
            settings,
            role,
            device: Mutex::new(None),
            mapping: Mutex::new(MappingTable::default()),
            queue,
            latch: Mutex::new(Arc::new(CancellableLatch::finished())),
            session: Mutex::new(SessionState::default()),
            state: Mutex::new(ConnectionState::Idle),
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Feeds transport callbacks into the link until the channel closes or
    /// the link is dropped.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let link = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(link) = link.upgrade() else {
                    break;
                };
                link.handle_event(event);
            }
            debug!("Transport event pump finished");
        })
    }

    /// Applies one transport callback.
    pub fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        let session = self.session();
        let (transition, changed) = {
            let mut state = lock(&self.state);
            let transition =
                lifecycle::transition(*state, session, self.identity.requested_mtu, &event);
            let changed = *state != transition.next;
            *state = transition.next;
            (transition, changed)
        };
        if changed {
            self.announce_state(transition.next);
        }

        for effect in transition.effects {
            match effect {
                Effect::Release => {
                    self.queue.release();
                    self.advance();
                }
                Effect::CountDown => self.current_latch().count_down(),
                Effect::Cancel => self.current_latch().cancel(),
                Effect::Notify(message) => self.display_error(&message),
                Effect::EnqueueMtu(mtu) => self.enqueue(Command::RequestMtu(mtu)),
                Effect::DeliverRead {
                    characteristic,
                    value,
                } => self.role.on_read(self, &characteristic, value.as_deref()),
                Effect::DeliverChange {
                    characteristic,
                    value,
                } => self.role.on_changed(self, &characteristic, &value),
                Effect::LinkLost => self.on_link_lost(),
            }
        }
    }

    /// Resolves, connects and configures the device.
    ///
    /// Returns `Ok` without connecting when the device could not be resolved
    /// because scanning is not possible right now.
    pub async fn connect(self: &Arc<Self>, known: Option<&KnownDevices>) -> Result<()> {
        info!("Connecting to {}", self.identity.label());

        let has_device = lock(&self.device).is_some();
        if !has_device {
            self.set_state(ConnectionState::Resolving);
            match self.find_device(known).await? {
                Some(device) => {
                    info!("Resolved device {}", device.address);
                    *lock(&self.device) = Some(device);
                }
                None => {
                    info!("No device selected, connection postponed");
                    self.set_state(ConnectionState::Idle);
                    return Ok(());
                }
            }
        }

        if !self.transport.is_connected() {
            self.open_connection().await?;
        }

        self.configure().await?;
        self.role.after_connect(self).await?;

        self.set_state(ConnectionState::Ready);
        info!("Device ready: {}", self.identity.label());
        Ok(())
    }

    async fn find_device(&self, known: Option<&KnownDevices>) -> Result<Option<PeerDevice>> {
        if !self.transport.is_supported() {
            return Err(BluetoothError::NotSupported);
        }
        if !self.transport.is_enabled() {
            return Err(BluetoothError::Disabled);
        }

        if let (Some(id), Some(known)) = (self.identity.session_id(), known) {
            if let Some(device) = known.get(id) {
                debug!("Reusing device {} already resolved for \"{}\"", device.address, id);
                return Ok(Some(device.clone()));
            }
        }

        // Paired devices take precedence.
        let paired = self.transport.paired_devices();
        let found = match (self.identity.name(), self.identity.address()) {
            (Some(name), None) => paired
                .into_iter()
                .find(|d| d.name.as_deref().is_some_and(|n| n.contains(name))),
            (_, Some(address)) => paired.into_iter().find(|d| d.address == address),
            (None, None) => None,
        };
        if found.is_some() {
            return Ok(found);
        }

        if let Some(address) = self.identity.address() {
            if let Some(device) = self.transport.remote_device(address) {
                return Ok(Some(device));
            }
        }

        if let Some(scanner) = &self.scanner {
            if !scanner.preconditions_met() {
                return Ok(None);
            }
            let request = ScanRequest {
                name_filter: self.identity.name().map(str::to_string),
                uuid_filter: self.identity.uuid_filter,
                supported_names: Vec::new(),
                supported_uuids: Vec::new(),
                session_id: self.identity.session_id().map(str::to_string),
                auto_connect: self.identity.auto_connect,
            };
            if let Some(device) = scanner.find_device(request).await {
                return Ok(Some(PeerDevice {
                    address: device.address,
                    name: Some(device.name),
                }));
            }
        }

        Err(BluetoothError::NotFound {
            device: self.identity.label(),
        })
    }

    async fn open_connection(&self) -> Result<()> {
        if !self.transport.is_enabled() {
            self.transport.close();
            return Err(BluetoothError::Disabled);
        }
        let device = lock(&self.device).clone().ok_or_else(|| BluetoothError::NotFound {
            device: self.identity.label(),
        })?;

        self.set_state(ConnectionState::Connecting);
        let latch = self.begin_wait();
        let accepted = self.transport.connect(&device);
        if !accepted || !latch.wait(self.settings.connect_timeout()).await {
            warn!("Connection to {} failed", device.address);
            self.transport.close();
            return Err(BluetoothError::ConnectionFailed {
                device: self.identity.label(),
            });
        }

        self.set_state(ConnectionState::Discovering);
        let latch = self.begin_wait();
        self.enqueue(Command::DiscoverServices);
        if !latch.wait(self.settings.discovery_timeout()).await {
            warn!("Service discovery on {} failed", device.address);
            return Err(BluetoothError::ServicesDiscoveryFailed {
                device: self.identity.label(),
            });
        }
        Ok(())
    }

    /// Rebuilds the mapping from the configured entries and writes config
    /// values the device does not hold yet.
    async fn configure(&self) -> Result<()> {
        self.set_state(ConnectionState::Configuring);

        let mut config_writes = Vec::new();
        {
            let mut mapping = lock(&self.mapping);
            mapping.clear();
            for entry in &self.entries {
                let characteristic = self.find_characteristic(entry.uuid())?;
                match entry {
                    CharacteristicConfig::Input {
                        index,
                        extra_time: true,
                        ..
                    } => mapping.bind_time(characteristic.id(), *index),
                    CharacteristicConfig::Input {
                        index,
                        conversion: Some(conversion),
                        ..
                    } => mapping.bind(
                        &characteristic,
                        CharacteristicBinding {
                            index: *index,
                            conversion: Conversion::Input(conversion.clone()),
                        },
                    ),
                    CharacteristicConfig::Input {
                        conversion: None, ..
                    } => {
                        return Err(BluetoothError::InvalidConfiguration(format!(
                            "input characteristic {} has no conversion",
                            characteristic.uuid
                        )))
                    }
                    CharacteristicConfig::Output {
                        index, conversion, ..
                    } => mapping.bind(
                        &characteristic,
                        CharacteristicBinding {
                            index: *index,
                            conversion: Conversion::Output(*conversion),
                        },
                    ),
                    CharacteristicConfig::Config { value, .. } => {
                        config_writes.push((characteristic.id(), value.clone()))
                    }
                }
            }
            self.queue
                .set_capacity(capacity_for(mapping.len(), self.settings.min_queue_capacity));
            debug!(
                "Mapped {} characteristics, {} values per round",
                mapping.len(),
                mapping.value_count()
            );
        }

        for (characteristic, value) in config_writes {
            if self.transport.cached_value(&characteristic).as_deref() == Some(value.as_slice()) {
                debug!("Config value of {} already set", characteristic.uuid);
                continue;
            }
            let latch = self.begin_wait();
            self.enqueue(Command::Write {
                characteristic,
                value,
            });
            if !latch.wait(self.settings.config_write_timeout()).await {
                return Err(BluetoothError::ConfigWriteFailed {
                    uuid: characteristic.uuid,
                    device: self.identity.label(),
                });
            }
        }
        Ok(())
    }

    /// Looks a characteristic up in the discovered services.
    pub fn find_characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic> {
        self.transport
            .services()
            .into_iter()
            .flat_map(|service| service.characteristics)
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| BluetoothError::CharacteristicNotFound {
                uuid,
                device: self.identity.label(),
            })
    }

    /// Queues `command` (dropped silently when the queue is full) and starts
    /// it if nothing is in flight.
    pub fn enqueue(&self, command: Command) {
        self.queue.enqueue(command);
        self.advance();
    }

    fn advance(&self) {
        let Advance::Rejected(command) = self.queue.try_advance(self.transport.as_ref()) else {
            return;
        };
        let latch = self.current_latch();
        if latch.count() > 0 {
            latch.cancel();
            return;
        }
        let device = self.identity.label();
        let message = match &command {
            Command::Read { .. } => BluetoothError::ReadFailed { device }.to_string(),
            Command::Write { .. } => BluetoothError::WriteFailed { device }.to_string(),
            _ if command.error_message().is_empty() => return,
            _ => format!("{}\n{}", command.error_message(), device),
        };
        warn!("Transport refused {}", command.kind());
        self.notifier.display(&message, !self.is_running());
    }

    /// Installs a fresh latch for the next blocking step.
    pub(crate) fn begin_wait(&self) -> Arc<CancellableLatch> {
        let latch = Arc::new(CancellableLatch::new(1));
        *lock(&self.latch) = latch.clone();
        latch
    }

    fn current_latch(&self) -> Arc<CancellableLatch> {
        lock(&self.latch).clone()
    }

    /// Starts streaming.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(BluetoothError::NoConnection {
                device: self.identity.label(),
            });
        }
        let resuming = {
            let mut session = lock(&self.session);
            let resuming = session.is_running;
            session.forced_break = false;
            session.is_running = true;
            resuming
        };
        self.set_state(ConnectionState::Streaming);
        info!(
            "Streaming from {}{}",
            self.identity.label(),
            if resuming { " (resumed)" } else { "" }
        );
        self.role.on_start(self, resuming).await
    }

    /// Stops streaming. The connection stays open.
    pub async fn stop(self: &Arc<Self>) {
        self.role.on_stop(self).await;
        self.role.halt();
        self.notifier.dismiss();
        self.queue.clear();
        lock(&self.session).is_running = false;
        match self.state() {
            ConnectionState::Streaming => self.set_state(ConnectionState::Ready),
            ConnectionState::LinkDown => self.set_state(ConnectionState::Idle),
            _ => {}
        }
    }

    /// Best-effort teardown of the connection.
    pub async fn close_connection(self: &Arc<Self>) {
        self.role.before_close(self).await;
        self.role.halt();
        if self.transport.is_connected() {
            self.transport.close();
        }
        self.queue.reset();
        {
            let mut session = lock(&self.session);
            session.is_running = false;
            session.forced_break = false;
        }
        self.set_state(ConnectionState::Closed);
        info!("Connection closed: {}", self.identity.label());
    }

    fn on_link_lost(self: &Arc<Self>) {
        warn!("Link lost while running: {}", self.identity.label());
        self.role.halt();
        self.queue.clear();
        lock(&self.session).forced_break = true;
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let link = self.clone();
        tokio::spawn(async move {
            loop {
                link.reconnect_loop().await;
                link.reconnecting.store(false, Ordering::SeqCst);
                // A loss reported while the flag was still set is picked up here.
                let lost = link.is_running() && link.forced_break();
                if !lost || link.reconnecting.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
        });
    }

    /// Retries connect and start until one succeeds or the experiment stops.
    async fn reconnect_loop(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        while self.is_running() {
            attempt += 1;
            self.queue.clear();
            let result = match self.connect(None).await {
                Ok(()) => self.start().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) if self.forced_break() || !self.is_connected() => {
                    warn!("Link lost again during reconnect attempt {}", attempt);
                    tokio::time::sleep(self.settings.reconnect_delay()).await;
                }
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    self.notifier.dismiss();
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    if !self.is_running() {
                        break;
                    }
                    self.notifier.display(&e.to_string(), false);
                    tokio::time::sleep(self.settings.reconnect_delay()).await;
                }
            }
        }
        self.notifier.dismiss();
    }

    /// Shows an error as a transient notice while running and as a blocking
    /// message otherwise.
    pub(crate) fn display_error(&self, message: &str) {
        let message = format!("{}\n{}", message, self.identity.label());
        self.notifier.display(&message, !self.is_running());
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = *state != next;
            *state = next;
            changed
        };
        if changed {
            self.announce_state(next);
        }
    }

    fn announce_state(&self, next: ConnectionState) {
        debug!("{} -> {:?}", self.identity.label(), next);
        let id = self
            .identity
            .session_id()
            .or(self.identity.name())
            .or(self.identity.address())
            .unwrap_or_default();
        self.notifier.state_changed(id, next);
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn transport(&self) -> &Arc<dyn GattTransport> {
        &self.transport
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Device resolved for this link, if any.
    pub fn device(&self) -> Option<PeerDevice> {
        lock(&self.device).clone()
    }

    pub fn mapping(&self) -> MappingTable {
        lock(&self.mapping).clone()
    }

    pub(crate) fn with_mapping<T>(&self, f: impl FnOnce(&MappingTable) -> T) -> T {
        f(&lock(&self.mapping))
    }

    pub fn session(&self) -> SessionState {
        *lock(&self.session)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        lock(&self.session).is_running
    }

    pub fn forced_break(&self) -> bool {
        lock(&self.session).forced_break
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Waits on a fresh latch after queueing `command`.
    pub(crate) async fn enqueue_and_wait(&self, command: Command, timeout: Duration) -> bool {
        let latch = self.begin_wait();
        self.enqueue(command);
        latch.wait(timeout).await
    }
}
