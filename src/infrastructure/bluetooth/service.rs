//! Experiment Devices Module
//!
//! Coordinates every Bluetooth input and output of one experiment: devices
//! sharing an experiment id are resolved once and reused by the others.

use std::sync::Arc;

use tracing::{error, info};

use crate::error::Result;
use crate::infrastructure::notifier::ErrorNotifier;

use super::connection::{BleLink, KnownDevices, LinkRole};
use super::input::BluetoothInput;
use super::output::BluetoothOutput;

/// All device links of one experiment.
pub struct ExperimentDevices {
    inputs: Vec<Arc<BluetoothInput>>,
    outputs: Vec<Arc<BluetoothOutput>>,
    notifier: Arc<dyn ErrorNotifier>,
}

impl ExperimentDevices {
    pub fn new(
        inputs: Vec<Arc<BluetoothInput>>,
        outputs: Vec<Arc<BluetoothOutput>>,
        notifier: Arc<dyn ErrorNotifier>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            notifier,
        }
    }

    pub fn inputs(&self) -> &[Arc<BluetoothInput>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<BluetoothOutput>] {
        &self.outputs
    }

    /// Devices already resolved, keyed by experiment device id.
    pub fn known_devices(&self) -> KnownDevices {
        fn collect<R: LinkRole>(links: &[Arc<BleLink<R>>], known: &mut KnownDevices) {
            for link in links {
                if let (Some(id), Some(device)) = (link.identity().session_id(), link.device()) {
                    known.insert(id.to_string(), device);
                }
            }
        }

        let mut known = KnownDevices::new();
        collect(&self.inputs, &mut known);
        collect(&self.outputs, &mut known);
        known
    }

    /// Connects every device in order. The first failure is shown as a
    /// blocking error and returned; the remaining devices are not attempted.
    pub async fn connect_all(&self) -> Result<()> {
        info!(
            "Connecting {} input(s) and {} output(s)",
            self.inputs.len(),
            self.outputs.len()
        );
        for link in &self.inputs {
            self.connect_one(link).await?;
        }
        for link in &self.outputs {
            self.connect_one(link).await?;
        }
        Ok(())
    }

    async fn connect_one<R: LinkRole>(&self, link: &Arc<BleLink<R>>) -> Result<()> {
        link.queue().clear();
        let known = self.known_devices();
        link.connect(Some(&known)).await.map_err(|e| {
            error!("Connecting failed: {}", e);
            self.notifier.display(&e.to_string(), true);
            e
        })
    }

    pub async fn start_all(&self) -> Result<()> {
        for link in &self.inputs {
            link.start().await?;
        }
        for link in &self.outputs {
            link.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        for link in &self.inputs {
            link.stop().await;
        }
        for link in &self.outputs {
            link.stop().await;
        }
    }

    pub async fn close_all(&self) {
        for link in &self.inputs {
            link.close_connection().await;
        }
        for link in &self.outputs {
            link.close_connection().await;
        }
    }

    /// Pushes the current buffer contents to every output.
    pub fn send_all(&self) {
        for link in &self.outputs {
            link.send_data();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::domain::buffers::{shared, DataBuffer};
    use crate::domain::characteristics::CharacteristicConfig;
    use crate::domain::conversions::{ByteFormat, InputConversion, OutputConversion};
    use crate::domain::models::{ConnectionState, DeviceIdentity};
    use crate::domain::settings::LinkSettings;
    use crate::error::BluetoothError;
    use crate::infrastructure::bluetooth::input::{InputMode, InputRole};
    use crate::infrastructure::bluetooth::mock::{MockTransport, Operation};
    use crate::infrastructure::bluetooth::output::OutputRole;
    use crate::infrastructure::bluetooth::protocol::uuid_from_short;
    use crate::infrastructure::bluetooth::transport::{
        CharacteristicProperties, GattCharacteristic, GattService, PeerDevice,
    };

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, bool)>>,
    }

    impl ErrorNotifier for RecordingNotifier {
        fn display(&self, message: &str, blocking: bool) {
            self.messages
                .lock()
                .unwrap()
                .push((message.to_string(), blocking));
        }
    }

    fn characteristic(short: u32) -> GattCharacteristic {
        GattCharacteristic {
            uuid: uuid_from_short(short),
            service_uuid: uuid_from_short(0x1800),
            properties: CharacteristicProperties {
                read: true,
                write: true,
                ..Default::default()
            },
            descriptors: vec![],
        }
    }

    #[tokio::test]
    async fn test_connect_all_shares_devices_by_id() {
        let notifier: Arc<RecordingNotifier> = Arc::new(RecordingNotifier::default());
        let buffers = shared(vec![DataBuffer::new("a", 0), DataBuffer::new("b", 0)]);

        let (input_transport, input_events) = MockTransport::new();
        input_transport.set_services(vec![GattService {
            uuid: uuid_from_short(0x1800),
            characteristics: vec![characteristic(0x2a01)],
        }]);
        input_transport.add_paired(PeerDevice {
            address: "11:22:33:44:55:66".to_string(),
            name: Some("Cart sensor".to_string()),
        });
        let input = BluetoothInput::new(
            DeviceIdentity::new(Some("Cart".to_string()), None)
                .unwrap()
                .with_id("cart"),
            vec![CharacteristicConfig::Input {
                uuid: uuid_from_short(0x2a01),
                index: 0,
                extra_time: false,
                conversion: Some(InputConversion::simple(ByteFormat::UInt8)),
            }],
            input_transport.clone(),
            notifier.clone(),
            LinkSettings::default(),
            InputRole::new(InputMode::Poll, 1.0, false, buffers.clone()).unwrap(),
        );
        input.spawn_event_pump(input_events);

        // The output only knows the id; it must reuse the input's device.
        let (output_transport, output_events) = MockTransport::new();
        output_transport.set_services(vec![GattService {
            uuid: uuid_from_short(0x1800),
            characteristics: vec![characteristic(0x2a02)],
        }]);
        let output = BluetoothOutput::new(
            DeviceIdentity::new(Some("Unlisted".to_string()), None)
                .unwrap()
                .with_id("cart"),
            vec![CharacteristicConfig::Output {
                uuid: uuid_from_short(0x2a02),
                index: 1,
                conversion: OutputConversion::Number(ByteFormat::UInt8),
            }],
            output_transport.clone(),
            notifier.clone(),
            LinkSettings::default(),
            OutputRole::new(buffers.clone()),
        );
        output.spawn_event_pump(output_events);

        let devices = ExperimentDevices::new(vec![input.clone()], vec![output.clone()], notifier.clone());
        devices.connect_all().await.unwrap();

        assert_eq!(output.device().unwrap().address, "11:22:33:44:55:66");
        assert_eq!(devices.known_devices().len(), 1);
        assert!(notifier.messages.lock().unwrap().is_empty());

        devices.start_all().await.unwrap();
        assert_eq!(input.state(), ConnectionState::Streaming);

        buffers.lock().unwrap()[1].append(42.0);
        devices.send_all();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(output_transport
            .operations()
            .iter()
            .any(|(_, op)| *op == Operation::Write(characteristic(0x2a02).id(), vec![42])));

        devices.stop_all().await;
        assert!(!input.is_running());
        devices.close_all().await;
        assert_eq!(output.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_all_reports_blocking_error() {
        let notifier: Arc<RecordingNotifier> = Arc::new(RecordingNotifier::default());
        let (transport, _events) = MockTransport::new();
        transport.set_enabled(false);
        let input = BluetoothInput::new(
            DeviceIdentity::new(Some("Cart".to_string()), None).unwrap(),
            vec![],
            transport,
            notifier.clone(),
            LinkSettings::default(),
            InputRole::new(InputMode::Poll, 1.0, false, shared(vec![])).unwrap(),
        );

        let devices = ExperimentDevices::new(vec![input], vec![], notifier.clone());
        let err = devices.connect_all().await.unwrap_err();
        assert!(matches!(err, BluetoothError::Disabled));

        let messages = notifier.messages.lock().unwrap().clone();
        assert_eq!(messages, vec![("Bluetooth is disabled".to_string(), true)]);
    }
}
