use tokio::sync::watch;

/// Transmitter side of the shutdown coordination channel.
///
/// One [`ShutdownTx`] fans out to every synchronizer task; firing it asks all of them to
/// finish their current operation and return. Receivers observe the signal independently,
/// so a slow task cannot delay the others noticing.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals shutdown to all subscribed receivers.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<bool>> {
        self.0.send(true)
    }

    /// Creates a new receiver observing this shutdown channel.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiver side of the shutdown coordination channel.
///
/// The signal is sticky: once fired, [`is_shutdown`] keeps returning true no matter how
/// many tasks already observed it. A dropped transmitter counts as shutdown so orphaned
/// tasks cannot run forever.
pub type ShutdownRx = watch::Receiver<bool>;

/// True once shutdown has been requested (or the transmitter is gone).
pub fn is_shutdown(rx: &ShutdownRx) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves once shutdown has been requested. Safe to await repeatedly and from
/// multiple tasks holding clones of the same receiver.
pub async fn wait_shutdown(rx: &mut ShutdownRx) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Creates a new shutdown coordination channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_is_sticky_and_fans_out() {
        let (tx, mut rx) = create_shutdown_channel();
        let other = tx.subscribe();

        assert!(!is_shutdown(&rx));
        tx.shutdown().unwrap();
        assert!(is_shutdown(&rx));
        assert!(is_shutdown(&other));

        // Waiting after the fact returns immediately, and the signal stays visible.
        wait_shutdown(&mut rx).await;
        assert!(is_shutdown(&rx));
    }

    #[tokio::test]
    async fn test_dropped_transmitter_counts_as_shutdown() {
        let (tx, mut rx) = create_shutdown_channel();
        drop(tx);
        assert!(is_shutdown(&rx));
        // Must not hang even though no value was ever sent.
        wait_shutdown(&mut rx).await;
    }
}
