//! Shared fixtures for dispatcher and migrator unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use rivulet_core::{
    ConnectionId, EventInterest, EventPoller, NotifyPoller, ReactorError, Result, SocketFactory,
    SocketHandle,
};

/// In-memory socket with a fixed identifier and no real I/O.
#[derive(Debug)]
pub(crate) struct MockSocket {
    id: ConnectionId,
}

impl MockSocket {
    pub(crate) fn new(id: u64) -> Box<dyn SocketHandle> {
        Box::new(Self {
            id: ConnectionId(id),
        })
    }
}

#[async_trait]
impl SocketHandle for MockSocket {
    fn identifier(&self) -> ConnectionId {
        self.id
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }
}

/// Factory handing out [`MockSocket`]s with sequential ids.
pub(crate) struct MockFactory {
    next_id: AtomicU64,
}

impl MockFactory {
    pub(crate) fn new(first_id: u64) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(first_id),
        })
    }
}

#[async_trait]
impl SocketFactory for MockFactory {
    async fn connect(&self, _ip: &str, _port: u16) -> Result<Box<dyn SocketHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(MockSocket::new(id))
    }
}

/// Poller whose interest registration always fails, for exercising the
/// migrator's rollback path when the target cannot accept a connection.
/// Everything else delegates to a [`NotifyPoller`].
#[derive(Debug, Default)]
pub(crate) struct FailingPoller {
    inner: NotifyPoller,
}

#[async_trait]
impl EventPoller for FailingPoller {
    fn init(&self) -> Result<()> {
        self.inner.init()
    }

    async fn process_events(&self, timeout_ms: i32) {
        self.inner.process_events(timeout_ms).await;
    }

    fn wakeup(&self) {
        self.inner.wakeup();
    }

    fn register_interest(&self, id: ConnectionId, _interest: EventInterest) -> Result<()> {
        Err(ReactorError::SocketError(format!(
            "poller refused registration of {}",
            id
        )))
    }

    fn deregister_interest(&self, id: ConnectionId) -> Result<()> {
        self.inner.deregister_interest(id)
    }

    fn is_registered(&self, id: ConnectionId) -> bool {
        self.inner.is_registered(id)
    }
}
