use tokio::sync::watch;
use tracing::{info, warn};

/// Graceful shutdown coordinator for the daemon
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
        }
    }

    /// Ask every listener to stop.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Trigger shutdown on ctrl-c.
    pub fn install_signal_handlers(self: std::sync::Arc<Self>) {
        info!("Installing signal handlers for graceful shutdown");
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => warn!(error = %e, "Could not listen for ctrl-c, shutting down"),
            }
            self.trigger();
        });
    }
}

/// Receiving side of a [`ShutdownCoordinator`].
#[derive(Clone)]
pub struct ShutdownListener {
    receiver: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn recv(&mut self) {
        if self.receiver.wait_for(|stop| *stop).await.is_err() {
            // Coordinator dropped; nothing can trigger shutdown any more.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_sees_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let mut listener = coordinator.subscribe();
        assert!(!listener.is_shutdown());

        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap();
        assert!(listener.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        assert!(coordinator.subscribe().is_shutdown());
    }
}
