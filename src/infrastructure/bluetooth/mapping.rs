use std::collections::HashMap;

use crate::domain::conversions::{InputConversion, OutputConversion};

use super::transport::{CharacteristicId, GattCharacteristic};

/// Config characteristics are written once while connecting and never bound.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    Input(InputConversion),
    Output(OutputConversion),
}

/// Buffer index and the conversion feeding or reading it.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacteristicBinding {
    pub index: usize,
    pub conversion: Conversion,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedCharacteristic {
    pub characteristic: GattCharacteristic,
    pub bindings: Vec<CharacteristicBinding>,
}

/// Characteristic-to-buffer bindings of one connected device. Rebuilt on
/// every successful connect; characteristics and their bindings keep
/// insertion order.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: Vec<MappedCharacteristic>,
    time: HashMap<CharacteristicId, usize>,
    value_count: usize,
}

impl MappingTable {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.time.clear();
        self.value_count = 0;
    }

    /// Appends a binding, creating the characteristic's entry on first use.
    pub fn bind(&mut self, characteristic: &GattCharacteristic, binding: CharacteristicBinding) {
        let id = characteristic.id();
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.characteristic.id() == id)
        {
            Some(entry) => entry.bindings.push(binding),
            None => self.entries.push(MappedCharacteristic {
                characteristic: characteristic.clone(),
                bindings: vec![binding],
            }),
        }
        self.value_count += 1;
    }

    pub fn bind_time(&mut self, characteristic: CharacteristicId, index: usize) {
        self.time.insert(characteristic, index);
    }

    pub fn entries(&self) -> &[MappedCharacteristic] {
        &self.entries
    }

    pub fn get(&self, characteristic: &CharacteristicId) -> Option<&MappedCharacteristic> {
        self.entries
            .iter()
            .find(|entry| entry.characteristic.id() == *characteristic)
    }

    pub fn time_index(&self, characteristic: &CharacteristicId) -> Option<usize> {
        self.time.get(characteristic).copied()
    }

    /// Every time buffer index of this device.
    pub fn time_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self.time.values().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Number of distinct characteristics with bindings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of values one poll round is expected to produce.
    pub fn value_count(&self) -> usize {
        self.value_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::conversions::ByteFormat;
    use crate::infrastructure::bluetooth::transport::CharacteristicProperties;
    use uuid::Uuid;

    fn characteristic(n: u128) -> GattCharacteristic {
        GattCharacteristic {
            uuid: Uuid::from_u128(n),
            service_uuid: Uuid::from_u128(100),
            properties: CharacteristicProperties::default(),
            descriptors: vec![],
        }
    }

    fn input(index: usize) -> CharacteristicBinding {
        CharacteristicBinding {
            index,
            conversion: Conversion::Input(InputConversion::simple(ByteFormat::UInt8)),
        }
    }

    #[test]
    fn test_bindings_keep_insertion_order() {
        let mut table = MappingTable::default();
        table.bind(&characteristic(2), input(0));
        table.bind(&characteristic(1), input(1));
        table.bind(&characteristic(2), input(2));

        assert_eq!(table.len(), 2);
        assert_eq!(table.value_count(), 3);
        assert_eq!(table.entries()[0].characteristic.uuid, Uuid::from_u128(2));
        let indices: Vec<usize> = table.entries()[0].bindings.iter().map(|b| b.index).collect();
        assert_eq!(indices, vec![0, 2]);
    }

    #[test]
    fn test_clear_resets_counts() {
        let mut table = MappingTable::default();
        table.bind(&characteristic(1), input(0));
        table.bind_time(characteristic(1).id(), 3);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.value_count(), 0);
        assert_eq!(table.time_index(&characteristic(1).id()), None);
    }
}
