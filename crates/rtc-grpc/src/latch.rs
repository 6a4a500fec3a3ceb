// ABOUTME: One-shot latch: set at most once, wakes every waiter.
// ABOUTME: Used to signal that a stream's headers have arrived.

use tokio::sync::watch;

/// A set-once flag with broadcast wakeup.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Release the latch. Returns `false` if it was already released.
    pub fn release(&self) -> bool {
        self.tx.send_if_modified(|released| {
            if *released {
                false
            } else {
                *released = true;
                true
            }
        })
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch is released. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once released.
        let _ = rx.wait_for(|released| *released).await;
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}
