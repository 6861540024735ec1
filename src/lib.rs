//! Bluetooth Low Energy device link for experiments.
//!
//! Inputs stream characteristic values into experiment buffers, outputs write
//! buffer contents back to the device. Both share one connection engine that
//! serializes GATT operations, survives link loss while an experiment runs and
//! talks to the radio through the [`GattTransport`] trait.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::characteristics::{resolve_entries, CharacteristicConfig, CharacteristicEntry};
pub use domain::settings::{Settings, SettingsService};
pub use error::{BluetoothError, Result};
pub use infrastructure::bluetooth::{
    BleLink, BluetoothInput, BluetoothOutput, ExperimentDevices, GattTransport, InputMode,
    InputRole, OutputRole, TransportEvent,
};
pub use infrastructure::logging::init_logger;
pub use infrastructure::notifier::{ErrorNotifier, EventNotifier, LogNotifier};
