use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Buffers of one experiment, indexed by the buffer index used in
/// characteristic bindings. The mutex is the lock under which one logical
/// sample is appended.
pub type SharedBuffers = Arc<Mutex<Vec<DataBuffer>>>;

pub fn shared(buffers: Vec<DataBuffer>) -> SharedBuffers {
    Arc::new(Mutex::new(buffers))
}

/// Named FIFO of samples. A capacity of 0 means unbounded.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBuffer {
    pub name: String,
    capacity: usize,
    values: VecDeque<f64>,
}

impl DataBuffer {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            values: VecDeque::new(),
        }
    }

    pub fn append(&mut self, value: f64) {
        if self.capacity > 0 && self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn extend(&mut self, values: impl IntoIterator<Item = f64>) {
        for value in values {
            self.append(value);
        }
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}
