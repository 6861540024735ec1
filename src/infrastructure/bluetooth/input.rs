//! BLE Input Module
//!
//! Moves characteristic values into experiment buffers, either by polling
//! (one read per mapped characteristic and period) or by notifications and
//! indications.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::domain::buffers::{DataBuffer, SharedBuffers};
use crate::domain::models::ConnectionState;
use crate::error::{BluetoothError, Result};

use super::connection::{BleLink, LinkRole};
use super::lock;
use super::mapping::{CharacteristicBinding, Conversion};
use super::protocol::{
    CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use super::queue::Command;
use super::transport::{CharacteristicId, GattCharacteristic};

/// Device link feeding experiment buffers.
pub type BluetoothInput = BleLink<InputRole>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Poll,
    Notification,
    Indication,
}

impl InputMode {
    /// CCCD value that enables updates in this mode.
    pub fn enable_value(self) -> &'static [u8] {
        match self {
            InputMode::Indication => &ENABLE_INDICATION_VALUE,
            InputMode::Poll | InputMode::Notification => &ENABLE_NOTIFICATION_VALUE,
        }
    }

    pub fn is_subscription(self) -> bool {
        self != InputMode::Poll
    }
}

impl FromStr for InputMode {
    type Err = BluetoothError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(InputMode::Poll),
            "notification" => Ok(InputMode::Notification),
            "indication" => Ok(InputMode::Indication),
            _ => Err(BluetoothError::InvalidConfiguration(format!(
                "unknown input mode: {}",
                s
            ))),
        }
    }
}

/// Values of one poll round, keyed by buffer index.
pub type Round = BTreeMap<usize, Vec<f64>>;

/// Collects read results until a round is complete.
#[derive(Debug, Default)]
pub struct PollAccumulator {
    pending: Round,
}

impl PollAccumulator {
    /// Stores `values` for `index` and returns the rounds completed by it.
    ///
    /// A round closes before the insert when `index` already holds a value,
    /// and after it when `expected` indices are present.
    pub fn insert(&mut self, index: usize, values: Vec<f64>, expected: usize) -> Vec<Round> {
        let mut rounds = Vec::new();
        if self.pending.contains_key(&index) {
            rounds.push(std::mem::take(&mut self.pending));
        }
        self.pending.insert(index, values);
        if self.pending.len() >= expected {
            rounds.push(std::mem::take(&mut self.pending));
        }
        rounds
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Experiment time of this input.
#[derive(Debug, Default)]
struct Timebase {
    t0: Option<Instant>,
}

impl Timebase {
    /// Seconds since t0. The first call sets t0, back-dated so the time
    /// buffers continue from their last value.
    fn elapsed(&mut self, buffers: &[DataBuffer], time_indices: &[usize]) -> f64 {
        let t0 = *self.t0.get_or_insert_with(|| {
            let offset = time_indices
                .iter()
                .filter_map(|&index| buffers.get(index).and_then(DataBuffer::last))
                .filter(|v| v.is_finite() && *v > 0.0)
                .fold(0.0, f64::max);
            let now = Instant::now();
            now.checked_sub(Duration::from_secs_f64(offset))
                .unwrap_or(now)
        });
        t0.elapsed().as_secs_f64()
    }
}

pub struct InputRole {
    mode: InputMode,
    rate: f64,
    subscribe_on_start: bool,
    buffers: SharedBuffers,
    timebase: Mutex<Timebase>,
    accumulator: Mutex<PollAccumulator>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl InputRole {
    /// `rate` is the poll rate in Hz; 0 polls as fast as the link allows.
    pub fn new(
        mode: InputMode,
        rate: f64,
        subscribe_on_start: bool,
        buffers: SharedBuffers,
    ) -> Result<Self> {
        if rate.is_nan() || rate < 0.0 {
            return Err(BluetoothError::InvalidConfiguration(format!(
                "invalid poll rate: {}",
                rate
            )));
        }
        Ok(Self {
            mode,
            rate,
            subscribe_on_start,
            buffers,
            timebase: Mutex::new(Timebase::default()),
            accumulator: Mutex::new(PollAccumulator::default()),
            poller: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn buffers(&self) -> &SharedBuffers {
        &self.buffers
    }

    /// Interval between two poll rounds. Zero polls as fast as possible.
    pub fn period(&self) -> Duration {
        if self.rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.rate)
        } else {
            Duration::ZERO
        }
    }

    /// Appends one completed poll round together with the time samples.
    fn flush(&self, round: Round, time_indices: &[usize]) {
        let mut buffers = lock(&self.buffers);
        let elapsed = lock(&self.timebase).elapsed(&buffers, time_indices);
        for (index, values) in round {
            match buffers.get_mut(index) {
                Some(buffer) => buffer.extend(values),
                None => warn!("No buffer at index {}", index),
            }
        }
        for &index in time_indices {
            if let Some(buffer) = buffers.get_mut(index) {
                buffer.append(elapsed);
            }
        }
    }

    fn spawn_poller(&self, link: &Arc<BluetoothInput>) {
        let link = Arc::downgrade(link);
        let period = self.period();
        let handle = tokio::spawn(async move {
            let mut ticker = (!period.is_zero()).then(|| tokio::time::interval(period));
            loop {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => tokio::task::yield_now().await,
                }
                let Some(link) = link.upgrade() else {
                    break;
                };
                if !link.is_running() || link.forced_break() {
                    break;
                }
                let reads: Vec<CharacteristicId> = link.with_mapping(|mapping| {
                    mapping
                        .entries()
                        .iter()
                        .map(|entry| entry.characteristic.id())
                        .collect()
                });
                for characteristic in reads {
                    link.enqueue(Command::Read { characteristic });
                }
            }
            trace!("Poller finished");
        });
        if let Some(previous) = lock(&self.poller).replace(handle) {
            previous.abort();
        }
    }
}

fn decode(binding: &CharacteristicBinding, value: Option<&[u8]>) -> Vec<f64> {
    let Conversion::Input(conversion) = &binding.conversion else {
        return vec![f64::NAN];
    };
    let values = value.map(|data| conversion.convert(data)).unwrap_or_default();
    if values.is_empty() {
        debug!("Conversion failed for buffer {}", binding.index);
        vec![f64::NAN]
    } else {
        values
    }
}

fn mapped_characteristics(link: &BluetoothInput) -> Vec<GattCharacteristic> {
    link.with_mapping(|mapping| {
        mapping
            .entries()
            .iter()
            .map(|entry| entry.characteristic.clone())
            .collect()
    })
}

/// Enables updates on every mapped characteristic.
async fn subscribe(link: &Arc<BluetoothInput>) -> Result<()> {
    let previous = link.state();
    link.set_state(ConnectionState::Subscribing);
    let mode = link.role().mode;

    for characteristic in mapped_characteristics(link) {
        let id = characteristic.id();
        let failed = || BluetoothError::NotificationEnableFailed {
            uuid: characteristic.uuid,
            device: link.identity().label(),
        };
        if !link.transport().set_notification(&id, true) {
            return Err(failed());
        }
        if !characteristic.has_cccd() {
            debug!("{} has no CCCD, trusting the notification flag", characteristic.uuid);
            continue;
        }
        let enabled = link
            .enqueue_and_wait(
                Command::WriteDescriptor {
                    characteristic: id,
                    descriptor: CCCD_UUID,
                    value: mode.enable_value().to_vec(),
                },
                link.settings().subscribe_timeout(),
            )
            .await;
        if !enabled {
            return Err(failed());
        }
    }

    link.set_state(previous);
    info!("Subscribed to {:?} updates", mode);
    Ok(())
}

/// Disables updates. Outcomes are ignored.
async fn unsubscribe(link: &Arc<BluetoothInput>) {
    for characteristic in mapped_characteristics(link) {
        let id = characteristic.id();
        if characteristic.has_cccd() {
            link.enqueue_and_wait(
                Command::WriteDescriptor {
                    characteristic: id,
                    descriptor: CCCD_UUID,
                    value: DISABLE_NOTIFICATION_VALUE.to_vec(),
                },
                link.settings().unsubscribe_timeout(),
            )
            .await;
        }
        link.transport().set_notification(&id, false);
    }
}

#[async_trait]
impl LinkRole for InputRole {
    async fn after_connect(&self, link: &Arc<BluetoothInput>) -> Result<()> {
        if self.mode.is_subscription() && !self.subscribe_on_start {
            subscribe(link).await?;
        }
        Ok(())
    }

    async fn on_start(&self, link: &Arc<BluetoothInput>, resuming: bool) -> Result<()> {
        if !resuming {
            lock(&self.timebase).t0 = None;
        }
        lock(&self.accumulator).clear();

        if self.mode.is_subscription() {
            if self.subscribe_on_start {
                subscribe(link).await?;
            }
        } else {
            self.spawn_poller(link);
        }
        Ok(())
    }

    async fn on_stop(&self, link: &Arc<BluetoothInput>) {
        if self.mode.is_subscription() && self.subscribe_on_start {
            unsubscribe(link).await;
        }
    }

    async fn before_close(&self, link: &Arc<BluetoothInput>) {
        if self.mode.is_subscription() && !self.subscribe_on_start && link.is_connected() {
            unsubscribe(link).await;
        }
    }

    fn halt(&self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
    }

    fn on_read(&self, link: &BluetoothInput, characteristic: &CharacteristicId, value: Option<&[u8]>) {
        if !link.is_running() {
            return;
        }
        let (bindings, expected, time_indices) = link.with_mapping(|mapping| {
            (
                mapping
                    .get(characteristic)
                    .map(|entry| entry.bindings.clone())
                    .unwrap_or_default(),
                mapping.value_count(),
                mapping.time_indices(),
            )
        });

        for binding in &bindings {
            let rounds = lock(&self.accumulator).insert(binding.index, decode(binding, value), expected);
            for round in rounds {
                self.flush(round, &time_indices);
            }
        }
    }

    fn on_changed(&self, link: &BluetoothInput, characteristic: &CharacteristicId, value: &[u8]) {
        if !link.is_running() {
            return;
        }
        let (bindings, time_index, time_indices) = link.with_mapping(|mapping| {
            (
                mapping
                    .get(characteristic)
                    .map(|entry| entry.bindings.clone())
                    .unwrap_or_default(),
                mapping.time_index(characteristic),
                mapping.time_indices(),
            )
        });
        if bindings.is_empty() && time_index.is_none() {
            return;
        }

        let decoded: Vec<(usize, Vec<f64>)> = bindings
            .iter()
            .map(|binding| (binding.index, decode(binding, Some(value))))
            .collect();

        let mut buffers = lock(&self.buffers);
        let elapsed = lock(&self.timebase).elapsed(&buffers, &time_indices);
        for (index, values) in decoded {
            if let Some(buffer) = buffers.get_mut(index) {
                buffer.extend(values);
            }
        }
        if let Some(buffer) = time_index.and_then(|index| buffers.get_mut(index)) {
            buffer.append(elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::buffers::shared;
    use crate::domain::characteristics::CharacteristicConfig;
    use crate::domain::conversions::{ByteFormat, InputConversion};
    use crate::domain::models::DeviceIdentity;
    use crate::domain::settings::LinkSettings;
    use crate::infrastructure::bluetooth::mock::{MockTransport, Operation};
    use crate::infrastructure::bluetooth::protocol::uuid_from_short;
    use crate::infrastructure::bluetooth::transport::{CharacteristicProperties, GattService};
    use crate::infrastructure::notifier::LogNotifier;

    const SERVICE: u32 = 0x181a;

    fn characteristic(short: u32, cccd: bool) -> GattCharacteristic {
        GattCharacteristic {
            uuid: uuid_from_short(short),
            service_uuid: uuid_from_short(SERVICE),
            properties: CharacteristicProperties {
                read: true,
                write: false,
                notify: true,
                indicate: true,
            },
            descriptors: if cccd { vec![CCCD_UUID] } else { vec![] },
        }
    }

    fn input_entry(short: u32, index: usize) -> CharacteristicConfig {
        CharacteristicConfig::Input {
            uuid: uuid_from_short(short),
            index,
            extra_time: false,
            conversion: Some(InputConversion::simple(ByteFormat::UInt8)),
        }
    }

    fn time_entry(short: u32, index: usize) -> CharacteristicConfig {
        CharacteristicConfig::Input {
            uuid: uuid_from_short(short),
            index,
            extra_time: true,
            conversion: None,
        }
    }

    fn buffers(n: usize) -> SharedBuffers {
        shared((0..n).map(|i| DataBuffer::new(format!("b{}", i), 0)).collect())
    }

    fn input(
        characteristics: Vec<GattCharacteristic>,
        entries: Vec<CharacteristicConfig>,
        role: InputRole,
    ) -> (Arc<MockTransport>, Arc<BluetoothInput>) {
        let (transport, events) = MockTransport::new();
        transport.set_services(vec![GattService {
            uuid: uuid_from_short(SERVICE),
            characteristics,
        }]);
        let link = BluetoothInput::new(
            DeviceIdentity::new(None, Some("AA:BB:CC:DD:EE:FF".to_string())).unwrap(),
            entries,
            transport.clone(),
            Arc::new(LogNotifier),
            LinkSettings::default(),
            role,
        );
        link.spawn_event_pump(events);
        (transport, link)
    }

    fn values(buffers: &SharedBuffers, index: usize) -> Vec<f64> {
        lock(buffers)[index].values().collect()
    }

    fn count_ops(transport: &MockTransport, wanted: impl Fn(&Operation) -> bool) -> usize {
        transport
            .operations()
            .iter()
            .filter(|(_, op)| wanted(op))
            .count()
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Poll".parse::<InputMode>().unwrap(), InputMode::Poll);
        assert_eq!(
            "NOTIFICATION".parse::<InputMode>().unwrap(),
            InputMode::Notification
        );
        assert_eq!("indication".parse::<InputMode>().unwrap(), InputMode::Indication);
        assert!("broadcast".parse::<InputMode>().is_err());
    }

    #[test]
    fn test_negative_rate_rejected() {
        assert!(InputRole::new(InputMode::Poll, -1.0, false, buffers(1)).is_err());
        assert!(InputRole::new(InputMode::Poll, f64::NAN, false, buffers(1)).is_err());
        let role = InputRole::new(InputMode::Poll, 0.0, false, buffers(1)).unwrap();
        assert_eq!(role.period(), Duration::ZERO);
        let role = InputRole::new(InputMode::Poll, 4.0, false, buffers(1)).unwrap();
        assert_eq!(role.period(), Duration::from_millis(250));
    }

    #[test]
    fn test_accumulator_completes_round() {
        let mut acc = PollAccumulator::default();
        assert!(acc.insert(0, vec![1.0], 2).is_empty());
        let rounds = acc.insert(1, vec![2.0], 2);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0][&0], vec![1.0]);
        assert_eq!(rounds[0][&1], vec![2.0]);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_accumulator_flushes_early_on_repeat() {
        let mut acc = PollAccumulator::default();
        assert!(acc.insert(0, vec![1.0], 3).is_empty());
        assert!(acc.insert(1, vec![2.0], 3).is_empty());

        // index 0 again before index 2 arrived
        let rounds = acc.insert(0, vec![3.0], 3);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].len(), 2);
        assert_eq!(acc.len(), 1);

        assert!(acc.insert(1, vec![4.0], 3).is_empty());
        let rounds = acc.insert(2, vec![5.0], 3);
        assert_eq!(rounds[0].values().cloned().collect::<Vec<_>>(), vec![vec![3.0], vec![4.0], vec![5.0]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_three_characteristics_at_10hz() {
        let buffers = buffers(4);
        let role = InputRole::new(InputMode::Poll, 10.0, false, buffers.clone()).unwrap();
        let (transport, link) = input(
            vec![
                characteristic(0x2a01, false),
                characteristic(0x2a02, false),
                characteristic(0x2a03, false),
            ],
            vec![
                input_entry(0x2a01, 0),
                input_entry(0x2a02, 1),
                input_entry(0x2a03, 2),
                time_entry(0x2a01, 3),
            ],
            role,
        );
        transport.set_read_value(characteristic(0x2a01, false).id(), vec![1]);
        transport.set_read_value(characteristic(0x2a02, false).id(), vec![2]);
        transport.set_read_value(characteristic(0x2a03, false).id(), vec![3]);

        link.connect(None).await.unwrap();
        assert_eq!(link.mapping().value_count(), 3);
        transport.clear_operations();

        link.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(values(&buffers, 0), vec![1.0]);
        assert_eq!(values(&buffers, 1), vec![2.0]);
        assert_eq!(values(&buffers, 2), vec![3.0]);
        assert_eq!(values(&buffers, 3), vec![0.0]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        link.stop().await;

        let reads: Vec<Instant> = transport
            .operations()
            .into_iter()
            .filter(|(_, op)| matches!(op, Operation::Read(_)))
            .map(|(at, _)| at)
            .collect();
        assert_eq!(reads.len(), 12);
        for round in 1..4 {
            let gap = reads[round * 3] - reads[(round - 1) * 3];
            assert_eq!(gap, Duration::from_millis(100));
        }
        assert_eq!(values(&buffers, 0).len(), 4);
        let time = values(&buffers, 3);
        assert_eq!(time.len(), 4);
        assert!((time[3] - 0.3).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_read_failure_stores_nan() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Poll, 10.0, false, buffers.clone()).unwrap();
        let (transport, link) = input(
            vec![characteristic(0x2a01, false)],
            vec![CharacteristicConfig::Input {
                uuid: uuid_from_short(0x2a01),
                index: 0,
                extra_time: false,
                conversion: Some(InputConversion::simple(ByteFormat::UInt16LittleEndian)),
            }],
            role,
        );
        // one byte is too short for a 16 bit value
        transport.set_read_value(characteristic(0x2a01, false).id(), vec![1]);

        link.connect(None).await.unwrap();
        link.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        link.stop().await;

        let stored = values(&buffers, 0);
        assert_eq!(stored.len(), 1);
        assert!(stored[0].is_nan());
    }

    #[tokio::test]
    async fn test_rate_zero_polls_back_to_back() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Poll, 0.0, false, buffers.clone()).unwrap();
        let (transport, link) = input(
            vec![characteristic(0x2a01, false)],
            vec![input_entry(0x2a01, 0)],
            role,
        );
        transport.set_read_value(characteristic(0x2a01, false).id(), vec![9]);

        link.connect(None).await.unwrap();
        link.start().await.unwrap();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        link.stop().await;

        let stored = values(&buffers, 0);
        assert!(stored.len() > 1, "only {} rounds", stored.len());
        assert!(stored.iter().all(|v| *v == 9.0));
    }

    #[tokio::test]
    async fn test_notifications_subscribe_and_decode() {
        let buffers = buffers(2);
        let role = InputRole::new(InputMode::Notification, 0.0, false, buffers.clone()).unwrap();
        let data = characteristic(0x2a01, true);
        let (transport, link) = input(
            vec![data.clone()],
            vec![input_entry(0x2a01, 0), time_entry(0x2a01, 1)],
            role,
        );

        link.connect(None).await.unwrap();
        let ops: Vec<Operation> = transport.operations().into_iter().map(|(_, op)| op).collect();
        assert!(ops.contains(&Operation::SetNotification(data.id(), true)));
        assert!(ops.contains(&Operation::WriteDescriptor(
            data.id(),
            CCCD_UUID,
            ENABLE_NOTIFICATION_VALUE.to_vec()
        )));
        assert_eq!(link.state(), ConnectionState::Ready);

        // not streaming yet
        transport.notify(data.id(), vec![7]);
        tokio::task::yield_now().await;
        assert!(values(&buffers, 0).is_empty());

        link.start().await.unwrap();
        transport.notify(data.id(), vec![5]);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(values(&buffers, 0), vec![5.0]);
        assert_eq!(values(&buffers, 1).len(), 1);
    }

    #[tokio::test]
    async fn test_indication_without_cccd_is_tolerated() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Indication, 0.0, false, buffers).unwrap();
        let data = characteristic(0x2a01, false);
        let (transport, link) = input(vec![data.clone()], vec![input_entry(0x2a01, 0)], role);

        link.connect(None).await.unwrap();
        let ops: Vec<Operation> = transport.operations().into_iter().map(|(_, op)| op).collect();
        assert!(ops.contains(&Operation::SetNotification(data.id(), true)));
        assert!(!ops.iter().any(|op| matches!(op, Operation::WriteDescriptor(..))));
    }

    #[tokio::test]
    async fn test_subscribe_on_start_and_unsubscribe_on_stop() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Indication, 0.0, true, buffers).unwrap();
        let data = characteristic(0x2a01, true);
        let (transport, link) = input(vec![data.clone()], vec![input_entry(0x2a01, 0)], role);

        link.connect(None).await.unwrap();
        assert!(!transport
            .operations()
            .iter()
            .any(|(_, op)| matches!(op, Operation::SetNotification(..))));

        link.start().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Streaming);
        assert!(transport.operations().iter().any(|(_, op)| *op
            == Operation::WriteDescriptor(data.id(), CCCD_UUID, ENABLE_INDICATION_VALUE.to_vec())));

        link.stop().await;
        let ops: Vec<Operation> = transport.operations().into_iter().map(|(_, op)| op).collect();
        assert!(ops.contains(&Operation::WriteDescriptor(
            data.id(),
            CCCD_UUID,
            DISABLE_NOTIFICATION_VALUE.to_vec()
        )));
        assert_eq!(ops.last(), Some(&Operation::SetNotification(data.id(), false)));
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Notification, 0.0, false, buffers).unwrap();
        let data = characteristic(0x2a01, true);
        let (transport, link) = input(vec![data.clone()], vec![input_entry(0x2a01, 0)], role);

        link.connect(None).await.unwrap();
        transport.clear_operations();
        link.close_connection().await;

        let ops: Vec<Operation> = transport.operations().into_iter().map(|(_, op)| op).collect();
        assert_eq!(
            ops,
            vec![
                Operation::WriteDescriptor(data.id(), CCCD_UUID, DISABLE_NOTIFICATION_VALUE.to_vec()),
                Operation::SetNotification(data.id(), false),
                Operation::Close,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_again_while_resubscribing() {
        let buffers = buffers(1);
        let role = InputRole::new(InputMode::Notification, 0.0, true, buffers.clone()).unwrap();
        let data = characteristic(0x2a01, true);
        let (transport, link) = input(vec![data.clone()], vec![input_entry(0x2a01, 0)], role);
        link.connect(None).await.unwrap();
        link.start().await.unwrap();

        let enable = Operation::WriteDescriptor(data.id(), CCCD_UUID, ENABLE_NOTIFICATION_VALUE.to_vec());

        // first loss; step the reconnect until the subscription write is in flight
        transport.set_auto_complete(false);
        transport.clear_operations();
        transport.simulate_disconnect();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if count_ops(&transport, |op| *op == enable) > 0 {
                break;
            }
            transport.complete_next();
        }
        assert_eq!(count_ops(&transport, |op| *op == enable), 1);
        assert_eq!(transport.pending_completions(), 1);

        // second loss before the descriptor write completes
        let connects = count_ops(&transport, |op| matches!(op, Operation::Connect(_)));
        transport.set_auto_complete(true);
        transport.simulate_disconnect();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(count_ops(&transport, |op| matches!(op, Operation::Connect(_))) > connects);
        assert!(link.is_running());
        assert!(!link.forced_break());
        assert!(link.is_connected());
        assert_eq!(link.state(), ConnectionState::Streaming);

        transport.notify(data.id(), vec![4]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(values(&buffers, 0), vec![4.0]);
        link.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_keeps_time_base() {
        let buffers = buffers(2);
        let role = InputRole::new(InputMode::Notification, 0.0, false, buffers.clone()).unwrap();
        let data = characteristic(0x2a01, true);
        let (transport, link) = input(
            vec![data.clone()],
            vec![input_entry(0x2a01, 0), time_entry(0x2a01, 1)],
            role,
        );
        link.connect(None).await.unwrap();
        link.start().await.unwrap();

        transport.notify(data.id(), vec![1]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        transport.notify(data.id(), vec![2]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // link drops and comes back on the next attempt
        transport.simulate_disconnect();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(link.is_running());
        assert!(!link.forced_break());

        transport.notify(data.id(), vec![3]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let time = values(&buffers, 1);
        assert_eq!(time.len(), 3);
        assert!(time[2] > time[1]);
        assert!(time[2] > 1.5);
    }
}
