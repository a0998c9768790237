//! Watch-based shutdown signaling.
//!
//! A single shutdown signal fans out to every worker; workers finish their
//! current segment before terminating, and the sink is closed only after the
//! pool drains.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a new shutdown channel in the "running" state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Returns true when shutdown has been requested on the channel.
pub fn is_shutdown_requested(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_starts_running() {
        let (_tx, rx) = create_shutdown_channel();
        assert!(!is_shutdown_requested(&rx));
    }

    #[test]
    fn test_signal_is_observed() {
        let (tx, rx) = create_shutdown_channel();
        tx.send(true).unwrap();
        assert!(is_shutdown_requested(&rx));
    }
}
