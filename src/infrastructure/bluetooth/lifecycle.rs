//! Connection Lifecycle
//!
//! Maps transport callbacks onto the next connection state and the side
//! effects the link has to apply, in order. Kept free of I/O so every
//! callback rule can be checked without a radio.
//!
//! ```text
//! Idle → Resolving → Connecting → Discovering → Configuring → (Subscribing)
//!                                                                  │
//!                              Ready ⇄ Streaming ⇄ LinkDown ←──────┘
//!                                          │
//!                                        Closed
//! ```

use crate::domain::models::{ConnectionState, SessionState};

use super::transport::{CharacteristicId, GattStatus, LinkState, TransportEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Clear the execution flag and start the next queued command.
    Release,
    /// Count down the pending wait.
    CountDown,
    /// Cancel the pending wait.
    Cancel,
    /// Surface a non-blocking error notice.
    Notify(String),
    /// Queue an MTU negotiation.
    EnqueueMtu(u16),
    /// Hand a read result to the link's role (`None` on failure).
    DeliverRead {
        characteristic: CharacteristicId,
        value: Option<Vec<u8>>,
    },
    /// Hand a notification to the link's role.
    DeliverChange {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    /// The link dropped while running: halt streaming and reconnect.
    LinkLost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: ConnectionState, effects: Vec<Effect>) -> Self {
        Self {
            next: state,
            effects,
        }
    }
}

pub const READ_FAILED: &str = "Could not read from the Bluetooth device.";
pub const WRITE_FAILED: &str = "Could not write to the Bluetooth device.";
pub const MTU_FAILED: &str = "Could not negotiate the MTU with the Bluetooth device.";
pub const LINK_LOST: &str = "The Bluetooth device disconnected. Trying to reconnect...";

fn wait_outcome(status: GattStatus) -> Effect {
    if status.is_success() {
        Effect::CountDown
    } else {
        Effect::Cancel
    }
}

/// The physical link had been established in `state`.
fn was_linked(state: ConnectionState) -> bool {
    !matches!(
        state,
        ConnectionState::Idle
            | ConnectionState::Resolving
            | ConnectionState::Connecting
            | ConnectionState::LinkDown
            | ConnectionState::Closed
    )
}

/// Computes the reaction to one transport event.
pub fn transition(
    state: ConnectionState,
    session: SessionState,
    requested_mtu: u16,
    event: &TransportEvent,
) -> Transition {
    match event {
        TransportEvent::ConnectionStateChanged {
            status,
            state: link,
        } => {
            // A wait pending on a link that went away can never complete.
            let outcome = match link {
                LinkState::Connected => wait_outcome(*status),
                LinkState::Disconnected => Effect::Cancel,
            };
            let mut effects = vec![Effect::Release, outcome];
            match link {
                LinkState::Connected => {
                    if status.is_success() && requested_mtu > 0 {
                        effects.push(Effect::EnqueueMtu(requested_mtu));
                    }
                    Transition::stay(state, effects)
                }
                LinkState::Disconnected => {
                    if session.is_running && was_linked(state) {
                        effects.push(Effect::Notify(LINK_LOST.to_string()));
                        effects.push(Effect::LinkLost);
                        Transition {
                            next: ConnectionState::LinkDown,
                            effects,
                        }
                    } else if state == ConnectionState::Ready {
                        Transition {
                            next: ConnectionState::Idle,
                            effects,
                        }
                    } else {
                        Transition::stay(state, effects)
                    }
                }
            }
        }
        TransportEvent::ServicesDiscovered { status }
        | TransportEvent::DescriptorWrite { status, .. } => {
            Transition::stay(state, vec![Effect::Release, wait_outcome(*status)])
        }
        TransportEvent::CharacteristicWrite { status, .. } => {
            let outcome = if status.is_success() {
                Effect::CountDown
            } else if session.is_running {
                Effect::Notify(WRITE_FAILED.to_string())
            } else {
                Effect::Cancel
            };
            Transition::stay(state, vec![Effect::Release, outcome])
        }
        TransportEvent::CharacteristicRead {
            characteristic,
            status,
            value,
        } => {
            let mut effects = vec![Effect::Release];
            let value = if status.is_success() {
                value.clone()
            } else {
                effects.push(Effect::Notify(READ_FAILED.to_string()));
                None
            };
            effects.push(Effect::DeliverRead {
                characteristic: *characteristic,
                value,
            });
            Transition::stay(state, effects)
        }
        // Unsolicited; no command completes here, so the flag stays.
        TransportEvent::CharacteristicChanged {
            characteristic,
            value,
        } => Transition::stay(
            state,
            vec![Effect::DeliverChange {
                characteristic: *characteristic,
                value: value.clone(),
            }],
        ),
        TransportEvent::MtuChanged { status, .. } => {
            let mut effects = vec![Effect::Release];
            if !status.is_success() {
                effects.push(Effect::Notify(MTU_FAILED.to_string()));
            }
            Transition::stay(state, effects)
        }
    }
}
