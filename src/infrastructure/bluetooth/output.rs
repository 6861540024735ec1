//! Writes the latest buffer contents to the mapped characteristics.

use tracing::{debug, trace};

use crate::domain::buffers::SharedBuffers;

use super::connection::{BleLink, LinkRole};
use super::lock;
use super::mapping::Conversion;
use super::queue::Command;
use super::transport::CharacteristicId;

/// Device link fed from experiment buffers.
pub type BluetoothOutput = BleLink<OutputRole>;

pub struct OutputRole {
    buffers: SharedBuffers,
}

impl OutputRole {
    pub fn new(buffers: SharedBuffers) -> Self {
        Self { buffers }
    }

    pub fn buffers(&self) -> &SharedBuffers {
        &self.buffers
    }
}

impl LinkRole for OutputRole {}

impl BleLink<OutputRole> {
    /// Queues one write per bound, non-empty buffer. Does nothing while the
    /// link is down.
    pub fn send_data(&self) {
        if self.forced_break() {
            trace!("Link down, output skipped");
            return;
        }

        let bindings: Vec<(CharacteristicId, usize, Conversion)> = self.with_mapping(|mapping| {
            mapping
                .entries()
                .iter()
                .flat_map(|entry| {
                    let id = entry.characteristic.id();
                    entry
                        .bindings
                        .iter()
                        .map(move |binding| (id, binding.index, binding.conversion.clone()))
                })
                .collect()
        });

        let writes: Vec<Command> = {
            let buffers = lock(&self.role().buffers);
            bindings
                .into_iter()
                .filter_map(|(characteristic, index, conversion)| {
                    let Conversion::Output(conversion) = conversion else {
                        return None;
                    };
                    let buffer = buffers.get(index).filter(|b| !b.is_empty())?;
                    let value = conversion.encode(buffer).unwrap_or_else(|e| {
                        debug!("Output conversion failed: {}", e);
                        Vec::new()
                    });
                    Some(Command::Write {
                        characteristic,
                        value,
                    })
                })
                .collect()
        };

        for write in writes {
            self.enqueue(write);
        }
    }
}
