use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative stop signal shared by a loop and whoever owns its lifecycle.
#[derive(Debug, Clone)]
pub struct StopFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called (immediately if it already was).
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stopped_wakes_waiters() {
        let flag = StopFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.stopped().await })
        };
        assert!(!flag.is_stopped());
        flag.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(flag.is_stopped());
        // already stopped: returns at once
        tokio::time::timeout(Duration::from_millis(100), flag.stopped()).await.unwrap();
    }
}
