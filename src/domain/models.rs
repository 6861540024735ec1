use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BluetoothError, DeviceLabel, Result};

/// How an experiment identifies the peripheral it wants to talk to.
///
/// Created once when the experiment is configured and never mutated
/// afterwards. Reconnects re-locate the same physical device through the
/// session id, the address or the name, in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Identifier given by the experiment author to group inputs and outputs
    /// that share one physical device.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub uuid_filter: Option<Uuid>,
    /// Pick the first matching device instead of asking the user.
    #[serde(default)]
    pub auto_connect: bool,
    /// Requested ATT MTU, 0 keeps the transport default.
    #[serde(default)]
    pub requested_mtu: u16,
}

impl DeviceIdentity {
    pub fn new(name: Option<String>, address: Option<String>) -> Result<Self> {
        let identity = Self {
            id: None,
            name,
            address,
            uuid_filter: None,
            auto_connect: false,
            requested_mtu: 0,
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_uuid_filter(mut self, uuid: Uuid) -> Self {
        self.uuid_filter = Some(uuid);
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.requested_mtu = mtu;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name().is_none() && self.address().is_none() {
            return Err(BluetoothError::InvalidConfiguration(
                "a Bluetooth device needs a name or an address".to_string(),
            ));
        }
        Ok(())
    }

    /// Non-empty name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|n| !n.is_empty())
    }

    /// Non-empty address, if any.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref().filter(|a| !a.is_empty())
    }

    /// Non-empty session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|i| !i.is_empty())
    }

    pub fn label(&self) -> DeviceLabel {
        DeviceLabel {
            address: self.address.clone(),
            name: self.name.clone(),
        }
    }
}

/// Logical streaming state of one device link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    /// The experiment is running; survives transient link loss.
    pub is_running: bool,
    /// Streaming is logically active but the physical link is down.
    pub forced_break: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Discovering,
    Configuring,
    Subscribing,
    /// Connected and configured, not streaming.
    Ready,
    Streaming,
    LinkDown,
    Closed,
}

impl ConnectionState {
    pub fn is_streaming(self) -> bool {
        self == ConnectionState::Streaming
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    ConnectionStatus {
        device: String,
        state: ConnectionState,
    },
    LogMessage(StatusMessage),
    DismissTransient,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
    /// Needs acknowledgment (dialog) rather than an auto-dismissing notice.
    pub blocking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
