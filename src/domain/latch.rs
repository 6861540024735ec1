use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy)]
struct LatchState {
    count: usize,
    cancelled: bool,
}

/// Countdown wait that can be released early by cancellation.
///
/// `wait` only reports success when the count reached zero through
/// `count_down`. A cancelled latch also releases waiters, but they observe
/// the cancellation and report failure.
#[derive(Debug)]
pub struct CancellableLatch {
    tx: watch::Sender<LatchState>,
}

impl CancellableLatch {
    pub fn new(count: usize) -> Self {
        let (tx, _rx) = watch::channel(LatchState {
            count,
            cancelled: false,
        });
        Self { tx }
    }

    /// A latch nobody waits on.
    pub fn finished() -> Self {
        Self::new(0)
    }

    pub fn count_down(&self) {
        self.tx.send_modify(|state| {
            state.count = state.count.saturating_sub(1);
        });
    }

    pub fn cancel(&self) {
        self.tx.send_modify(|state| {
            state.count = 0;
            state.cancelled = true;
        });
    }

    pub fn count(&self) -> usize {
        self.tx.borrow().count
    }

    pub fn is_cancelled(&self) -> bool {
        self.tx.borrow().cancelled
    }

    /// Waits until the count reaches zero or `timeout` elapses. Returns true
    /// only for a real countdown to zero.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|state| state.count == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);

        reached && !self.is_cancelled()
    }
}
