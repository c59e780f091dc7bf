//! One-shot, multi-observer notifications.
//!
//! A `Signal` is built on a closed-or-not `async_channel`: nothing is ever
//! sent, firing simply closes the channel, which wakes every pending
//! `recv()` at once and makes every later `recv()` return immediately.

use async_channel::{Receiver, Sender};

/// Fires the paired [`Signal`]. Cloneable; firing through any clone fires it
/// for everyone, and dropping the last clone fires it as well.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: Sender<()>,
}

/// Observer side of a one-shot notification.
#[derive(Debug, Clone)]
pub struct Signal {
    rx: Receiver<()>,
}

/// Create a connected trigger/signal pair.
pub fn signal() -> (Trigger, Signal) {
    let (tx, rx) = async_channel::bounded(1);
    (Trigger { tx }, Signal { rx })
}

impl Trigger {
    /// Fire the signal. Idempotent.
    pub fn fire(&self) {
        self.tx.close();
    }

    pub fn is_fired(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Signal {
    /// A signal that has already fired.
    pub fn fired() -> Self {
        let (trigger, signal) = signal();
        trigger.fire();
        signal
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        // Nothing is ever sent, so recv only returns once the channel closes.
        let _ = self.rx.recv().await;
    }

    pub fn is_fired(&self) -> bool {
        self.rx.is_closed()
    }
}
