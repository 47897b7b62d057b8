//! # Rivulet Core
//!
//! Shared building blocks for the rivulet multi-dispatcher reactor.
//!
//! ## Contents
//!
//! - **Connection model**: [`Connection`] bundles a socket handle with its
//!   buffers, event interests and owning dispatcher. A connection is owned by
//!   exactly one dispatcher at any instant; the migration protocol in
//!   `rivulet-reactor` preserves that invariant while moving it.
//! - **Capability traits**: [`SocketHandle`], [`EventPoller`] and
//!   [`TimerDriver`] are the narrow contracts through which the reactor core
//!   drives raw I/O, event polling and timers without owning their
//!   implementations.
//! - **Default implementations**: [`NotifyPoller`] and [`DeadlineTimer`] are
//!   in-process implementations of the poller and timer contracts, used by
//!   the pool when the embedder does not supply its own.

pub mod connection;
pub mod errors;
pub mod poller;
pub mod socket;
pub mod timer;

// Re-export main types
pub use connection::{Connection, ConnectionId, DispatcherId, EventInterest, TimerId};
pub use errors::{ReactorError, Result};
pub use poller::{EventPoller, NotifyPoller};
pub use socket::{SocketFactory, SocketHandle};
pub use timer::{DeadlineTimer, TimerDriver};
