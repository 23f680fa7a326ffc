use tokio::sync::watch;

/// Single-slot open/closed flag the producer waits on
#[derive(Debug)]
pub struct SelectGate {
    tx: watch::Sender<bool>,
}

impl SelectGate {
    pub fn new(open: bool) -> Self {
        let (tx, _) = watch::channel(open);
        Self { tx }
    }

    /// Open the gate, returning the previous state
    pub fn open(&self) -> bool {
        self.tx.send_replace(true)
    }

    /// Close the gate, returning the previous state
    pub fn close(&self) -> bool {
        self.tx.send_replace(false)
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is open
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Wait until the gate is closed
    pub async fn wait_closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| !*open).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_open_close_report_previous_state() {
        let gate = SelectGate::new(false);
        assert!(!gate.open());
        assert!(gate.open());
        assert!(gate.close());
        assert!(!gate.is_open());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_open() {
        let gate = Arc::new(SelectGate::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_open().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.open();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_on_open_gate_returns_immediately() {
        let gate = SelectGate::new(true);
        tokio_test::assert_ready!(tokio_test::task::spawn(gate.wait_open()).poll());
    }
}
