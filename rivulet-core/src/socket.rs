use std::fmt;

use async_trait::async_trait;

use crate::connection::ConnectionId;
use crate::errors::Result;

/// Capability contract for the raw socket behind a connection.
///
/// The reactor core never performs I/O itself; it holds sockets as opaque,
/// movable handles. A handle must be safely rebindable between dispatcher
/// tasks once the connection is quiesced.
#[async_trait]
pub trait SocketHandle: Send + Sync + fmt::Debug {
    /// Stable identifier for this socket, used as the connection id.
    fn identifier(&self) -> ConnectionId;

    /// Read available bytes into `buf`, returning the number of bytes read.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write bytes from `buf`, returning the number of bytes written.
    async fn write(&self, buf: &[u8]) -> Result<usize>;
}

/// Capability contract for creating outbound sockets.
///
/// `Dispatcher::connect` delegates socket creation here; the syscall layer
/// behind it is out of the core's scope.
#[async_trait]
pub trait SocketFactory: Send + Sync {
    async fn connect(&self, ip: &str, port: u16) -> Result<Box<dyn SocketHandle>>;
}
