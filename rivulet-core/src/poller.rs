use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::connection::{ConnectionId, EventInterest};
use crate::errors::Result;

/// Capability contract for the per-dispatcher event-polling facility.
///
/// `process_events` suspends the calling loop for at most `timeout_ms`
/// (negative means "until woken") and dispatches whatever I/O is ready.
/// `wakeup` is safe to call from any task or thread and interrupts a
/// suspended `process_events`.
#[async_trait]
pub trait EventPoller: Send + Sync {
    fn init(&self) -> Result<()>;

    async fn process_events(&self, timeout_ms: i32);

    fn wakeup(&self);

    fn register_interest(&self, id: ConnectionId, interest: EventInterest) -> Result<()>;

    fn deregister_interest(&self, id: ConnectionId) -> Result<()>;

    fn is_registered(&self, id: ConnectionId) -> bool;
}

/// In-process poller backed by `tokio::sync::Notify`.
///
/// It tracks interest registrations but does not watch OS readiness; I/O
/// readiness is driven by the embedder calling `wakeup`. This is the poller
/// the pool uses when none is supplied, and the one the tests run against.
#[derive(Debug, Default)]
pub struct NotifyPoller {
    notify: Notify,
    interests: DashMap<ConnectionId, EventInterest>,
}

impl NotifyPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered_count(&self) -> usize {
        self.interests.len()
    }
}

#[async_trait]
impl EventPoller for NotifyPoller {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn process_events(&self, timeout_ms: i32) {
        if timeout_ms < 0 {
            self.notify.notified().await;
        } else {
            let wait = Duration::from_millis(timeout_ms as u64);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    fn wakeup(&self) {
        self.notify.notify_one();
    }

    fn register_interest(&self, id: ConnectionId, interest: EventInterest) -> Result<()> {
        trace!("poller register {} {:?}", id, interest);
        self.interests.insert(id, interest);
        Ok(())
    }

    fn deregister_interest(&self, id: ConnectionId) -> Result<()> {
        trace!("poller deregister {}", id);
        self.interests.remove(&id);
        Ok(())
    }

    fn is_registered(&self, id: ConnectionId) -> bool {
        self.interests.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn wakeup_interrupts_wait() {
        let poller = Arc::new(NotifyPoller::new());
        let waiter = Arc::clone(&poller);

        let handle = tokio::spawn(async move {
            waiter.process_events(5_000).await;
        });

        // Give the waiter a chance to park, then wake it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        poller.wakeup();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not wake")
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn process_events_times_out() {
        let poller = NotifyPoller::new();
        let start = Instant::now();
        poller.process_events(10).await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn interest_registration_round_trip() {
        let poller = NotifyPoller::new();
        let id = ConnectionId(7);

        assert!(!poller.is_registered(id));
        poller.register_interest(id, EventInterest::READ_WRITE).unwrap();
        assert!(poller.is_registered(id));
        poller.deregister_interest(id).unwrap();
        assert!(!poller.is_registered(id));
    }
}
