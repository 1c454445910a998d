//! Translates a query's flow-control signal into read-readiness.
//!
//! Rather than pulling bytes off the wire unconditionally, a consumer that
//! falls behind flips a shared boolean the reader checks before its next
//! read.
//!
//! There's no separate `Transport::want_read(bool)` gate: the dispatch loop
//! pulls one message at a time and only calls `read_message` again once this
//! coordinator's `wait_for_resume` returns, so pausing here already stops
//! the next socket read. A gate on `Transport` itself would only add
//! anything if reads happened independently of dispatch's pull, which they
//! don't.

use tokio::sync::watch;

/// Subscribes lazily to a query's flow-control channel on the first row and
/// tells the caller whether to pause pulling further bytes off the wire.
#[derive(Default)]
pub struct BackpressureCoordinator {
    subscription: Option<watch::Receiver<bool>>,
}

impl BackpressureCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe once, the first time a row is about to be delivered.
    pub fn subscribe_if_needed(&mut self, flow_control: &Option<watch::Receiver<bool>>) {
        if self.subscription.is_none() {
            if let Some(rx) = flow_control {
                self.subscription = Some(rx.clone());
            }
        }
    }

    /// True if the consumer has asked us to pause.
    pub fn is_paused(&self) -> bool {
        self.subscription
            .as_ref()
            .map(|rx| !*rx.borrow())
            .unwrap_or(false)
    }

    /// Block until the consumer resumes, if currently paused.
    pub async fn wait_for_resume(&mut self) {
        if let Some(rx) = &mut self.subscription {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    // Sender dropped; nothing left to wait on.
                    break;
                }
            }
        }
    }

    /// Drop the subscription, e.g. on `command_complete` or query failure.
    pub fn unsubscribe(&mut self) {
        self.subscription = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_unsubscribed_without_a_signal() {
        let mut coordinator = BackpressureCoordinator::new();
        coordinator.subscribe_if_needed(&None);
        assert!(!coordinator.is_paused());
    }

    #[tokio::test]
    async fn pauses_until_resumed() {
        let (tx, rx) = watch::channel(false);
        let mut coordinator = BackpressureCoordinator::new();
        coordinator.subscribe_if_needed(&Some(rx));
        assert!(coordinator.is_paused());

        tx.send(true).unwrap();
        coordinator.wait_for_resume().await;
        assert!(!coordinator.is_paused());
    }

    #[tokio::test]
    async fn unsubscribe_clears_pause_state() {
        let (_tx, rx) = watch::channel(false);
        let mut coordinator = BackpressureCoordinator::new();
        coordinator.subscribe_if_needed(&Some(rx));
        coordinator.unsubscribe();
        assert!(!coordinator.is_paused());
    }
}
