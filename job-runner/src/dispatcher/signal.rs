use std::time::Duration;

use tokio::sync::watch;

/// Settable, clearable wake condition that can be awaited with a deadline.
///
/// Setting an already set signal is a no-op. The signal stays set until
/// cleared, so a wake raised while nobody waits is seen by the next wait.
#[derive(Debug)]
pub struct WakeSignal {
    tx: watch::Sender<bool>,
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal is set or `timeout` elapses.
    ///
    /// Returns `true` when the signal is set.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|set| *set)).await,
            Ok(Ok(_))
        )
    }
}
