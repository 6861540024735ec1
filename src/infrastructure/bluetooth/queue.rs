//! Command Queue
//!
//! Serializes GATT operations: at most one command is in flight, the rest
//! wait in FIFO order. The queue and the execution flag live under one lock
//! so no completion can slip between "flag cleared" and "next popped".

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::{debug, trace};
use uuid::Uuid;

use super::lifecycle::{MTU_FAILED, READ_FAILED, WRITE_FAILED};
use super::lock;
use super::transport::{CharacteristicId, GattTransport};

/// One queued GATT operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Read {
        characteristic: CharacteristicId,
    },
    Write {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    WriteDescriptor {
        characteristic: CharacteristicId,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    DiscoverServices,
    RequestMtu(u16),
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Read { .. } => "read",
            Command::Write { .. } => "write",
            Command::WriteDescriptor { .. } => "write-descriptor",
            Command::DiscoverServices => "discover-services",
            Command::RequestMtu(_) => "negotiate-mtu",
        }
    }

    /// Message for a failed command. Empty when the failure is reported
    /// through a pending wait instead.
    pub fn error_message(&self) -> &'static str {
        match self {
            Command::Read { .. } => READ_FAILED,
            Command::Write { .. } => WRITE_FAILED,
            Command::WriteDescriptor { .. } => "",
            Command::DiscoverServices => "Could not discover the services of the Bluetooth device.",
            Command::RequestMtu(_) => MTU_FAILED,
        }
    }

    pub fn characteristic(&self) -> Option<&CharacteristicId> {
        match self {
            Command::Read { characteristic }
            | Command::Write { characteristic, .. }
            | Command::WriteDescriptor { characteristic, .. } => Some(characteristic),
            Command::DiscoverServices | Command::RequestMtu(_) => None,
        }
    }
}

/// Starts `command` on the transport. Returns whether it was accepted.
pub fn dispatch(transport: &dyn GattTransport, command: &Command) -> bool {
    match command {
        Command::Read { characteristic } => transport.read(characteristic),
        Command::Write {
            characteristic,
            value,
        } => transport.write(characteristic, value),
        Command::WriteDescriptor {
            characteristic,
            descriptor,
            value,
        } => transport.write_descriptor(characteristic, *descriptor, value),
        Command::DiscoverServices => transport.discover_services(),
        Command::RequestMtu(mtu) => transport.request_mtu(*mtu),
    }
}

/// Outcome of [`CommandQueue::try_advance`].
#[derive(Debug, PartialEq)]
pub enum Advance {
    /// Nothing started: a command is in flight or the queue is empty.
    Idle,
    Started,
    /// The transport refused the command; it is dropped and the flag cleared.
    Rejected(Command),
}

#[derive(Debug)]
struct QueueState {
    queue: VecDeque<Command>,
    executing: bool,
    capacity: usize,
}

#[derive(Debug)]
pub struct CommandQueue {
    state: Mutex<QueueState>,
}

/// `max(min, 2 × mapped characteristics)`
pub fn capacity_for(mapped: usize, min: usize) -> usize {
    min.max(mapped.saturating_mul(2))
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(capacity),
                executing: false,
                capacity,
            }),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        lock(&self.state).capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        lock(&self.state).capacity
    }

    /// Appends `command` unless the queue is full. Overflow is dropped
    /// silently; returns whether the command was queued.
    pub fn enqueue(&self, command: Command) -> bool {
        let mut state = lock(&self.state);
        if state.queue.len() >= state.capacity {
            trace!("Command queue full, dropping {} command", command.kind());
            return false;
        }
        state.queue.push_back(command);
        true
    }

    /// Starts the head command if nothing is in flight.
    ///
    /// The flag is set and the head popped under the lock; the transport is
    /// called outside of it because a synchronous transport may deliver the
    /// completion before returning.
    pub fn try_advance(&self, transport: &dyn GattTransport) -> Advance {
        let command = {
            let mut state = lock(&self.state);
            if state.executing {
                return Advance::Idle;
            }
            match state.queue.pop_front() {
                Some(command) => {
                    state.executing = true;
                    command
                }
                None => return Advance::Idle,
            }
        };

        trace!("Starting {} command", command.kind());
        if dispatch(transport, &command) {
            Advance::Started
        } else {
            debug!("Transport rejected {} command", command.kind());
            lock(&self.state).executing = false;
            Advance::Rejected(command)
        }
    }

    /// Clears the execution flag after a completion.
    pub fn release(&self) {
        lock(&self.state).executing = false;
    }

    /// Drops all waiting commands. An in-flight command still completes.
    pub fn clear(&self) {
        lock(&self.state).queue.clear();
    }

    /// Drops all waiting commands and clears the execution flag.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        state.queue.clear();
        state.executing = false;
    }

    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_executing(&self) -> bool {
        lock(&self.state).executing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockTransport, Operation};

    fn read(n: u128) -> Command {
        Command::Read {
            characteristic: CharacteristicId {
                service: Uuid::from_u128(1),
                uuid: Uuid::from_u128(n),
            },
        }
    }

    #[test]
    fn test_capacity_for() {
        assert_eq!(capacity_for(0, 10), 10);
        assert_eq!(capacity_for(5, 10), 10);
        assert_eq!(capacity_for(8, 10), 16);
    }

    #[test]
    fn test_overflow_dropped() {
        let queue = CommandQueue::new(10);
        for n in 0..11 {
            let queued = queue.enqueue(read(n));
            assert_eq!(queued, n < 10);
        }
        assert_eq!(queue.len(), 10);
    }

    #[tokio::test]
    async fn test_single_flight_fifo() {
        let (transport, _events) = MockTransport::new();
        let queue = CommandQueue::new(10);
        for n in 0..3 {
            queue.enqueue(read(n));
        }

        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Started);
        // Second advance must not start anything while the first is in flight.
        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Idle);
        assert_eq!(transport.operations().len(), 1);

        queue.release();
        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Started);
        queue.release();
        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Started);
        queue.release();
        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Idle);

        let reads: Vec<u128> = transport
            .operations()
            .into_iter()
            .filter_map(|(_, op)| match op {
                Operation::Read(id) => Some(id.uuid.as_u128()),
                _ => None,
            })
            .collect();
        assert_eq!(reads, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_rejection_clears_flag() {
        let (transport, _events) = MockTransport::new();
        transport.reject_next(1);
        let queue = CommandQueue::new(10);
        queue.enqueue(read(7));
        queue.enqueue(read(8));

        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Rejected(read(7)));
        assert!(!queue.is_executing());
        assert_eq!(queue.try_advance(transport.as_ref()), Advance::Started);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let queue = CommandQueue::new(10);
        queue.enqueue(read(1));
        queue.reset();
        assert!(queue.is_empty());
        assert!(!queue.is_executing());
    }
}
