//! Error and status surface towards the host.

use tokio::sync::mpsc;

use crate::domain::models::{AppEvent, ConnectionState, MessageSeverity, StatusMessage};

/// Where device links report problems and state changes.
pub trait ErrorNotifier: Send + Sync {
    /// Shows `message`. Blocking messages need acknowledgment; the others are
    /// transient notices.
    fn display(&self, message: &str, blocking: bool);

    /// Withdraws the current transient notice.
    fn dismiss(&self) {}

    fn state_changed(&self, _device: &str, _state: ConnectionState) {}
}

/// Forwards everything as [`AppEvent`]s to the host's event loop.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl EventNotifier {
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { event_sender }
    }
}

impl ErrorNotifier for EventNotifier {
    fn display(&self, message: &str, blocking: bool) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity: if blocking {
                MessageSeverity::Error
            } else {
                MessageSeverity::Warning
            },
            blocking,
        }));
    }

    fn dismiss(&self) {
        let _ = self.event_sender.send(AppEvent::DismissTransient);
    }

    fn state_changed(&self, device: &str, state: ConnectionState) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus {
            device: device.to_string(),
            state,
        });
    }
}

/// Only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ErrorNotifier for LogNotifier {
    fn display(&self, message: &str, blocking: bool) {
        if blocking {
            tracing::error!("{}", message);
        } else {
            tracing::warn!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_notifier_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = EventNotifier::new(tx);

        notifier.display("lost", false);
        notifier.dismiss();
        notifier.state_changed("left", ConnectionState::Ready);

        match rx.try_recv().unwrap() {
            AppEvent::LogMessage(msg) => {
                assert_eq!(msg.message, "lost");
                assert!(!msg.blocking);
                assert_eq!(msg.severity, MessageSeverity::Warning);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), AppEvent::DismissTransient));
        assert!(matches!(
            rx.try_recv().unwrap(),
            AppEvent::ConnectionStatus {
                state: ConnectionState::Ready,
                ..
            }
        ));
    }
}
