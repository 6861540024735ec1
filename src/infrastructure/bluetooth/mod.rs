//! Bluetooth Module
//!
//! Connects experiment inputs and outputs to BLE peripherals.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ExperimentDevices                      │
//! │  (connects, starts, stops and closes every device link)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌────────────────┐          ┌────────────────┐
//! │ BluetoothInput │          │ BluetoothOutput│
//! │ - polling      │          │ - buffer → GATT│
//! │ - notifications│          │   writes       │
//! └───────┬────────┘          └───────┬────────┘
//!         └─────────────┬─────────────┘
//!                       ▼
//!              ┌─────────────────┐     ┌──────────────┐
//!              │     BleLink     │────▶│ CommandQueue │
//!              │ - lifecycle     │     └──────┬───────┘
//!              │ - mapping       │            ▼
//!              │ - reconnect     │     ┌──────────────┐
//!              └─────────────────┘◀────│ GattTransport│
//!                   events             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Transport capability and its callback events
//! - [`queue`] - Single-flight FIFO of GATT commands
//! - [`lifecycle`] - Callback-to-state rules
//! - [`connection`] - Per-device link shared by inputs and outputs
//! - [`input`] / [`output`] - Data flow between buffers and characteristics
//! - [`scanner`] - Advertisement filtering and device selection
//! - [`transfer`] - Receiving an experiment definition from a device
//! - [`service`] - Coordination of all links of one experiment

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod connection;
pub mod input;
pub mod lifecycle;
pub mod mapping;
pub mod mock;
pub mod output;
pub mod protocol;
pub mod queue;
pub mod scanner;
pub mod service;
pub mod transfer;
pub mod transport;

pub use connection::{BleLink, KnownDevices, LinkRole};
pub use input::{BluetoothInput, InputMode, InputRole};
pub use output::{BluetoothOutput, OutputRole};
pub use service::ExperimentDevices;
pub use transport::{GattTransport, TransportEvent};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
