//! # Dispatcher Commands
//!
//! Internal command protocol for communication between the dispatcher public
//! API and its background event loop.
//!
//! Commands are sent via `mpsc::channel` from facade methods to the spawned
//! task that owns dispatcher state (connection registry, timers). Every
//! cross-task entry point funnels through this channel, so the loop body
//! itself performs no locking beyond draining it. Tasks posted to one
//! dispatcher execute in FIFO order; no ordering holds across dispatchers.

use tokio::sync::oneshot;

use rivulet_core::{Connection, ConnectionId, EventInterest, Result, SocketHandle, TimerId};

/// A closure marshaled onto the event loop for execution on its next
/// iteration.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Callback invoked on the event loop when a user timer fires.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Commands for internal dispatcher communication.
///
/// ## Command Categories
///
/// **Socket lifecycle**: `Listen`, `Connect`, `AddConnection`,
/// `RemoveConnection`
///
/// **Timers and tasks**: `AddTimer`, `StopTimer`, `PostTask`
///
/// **Migration protocol** (issued only by `ConnectionMigrator`, strictly
/// serialized per connection):
/// - `SuspendConnection` / `ResumeConnection` - quiesce I/O around a hand-off
/// - `TakeConnection` - remove from the registry without touching poller
///   registration (phase 2; events move in phase 4)
/// - `InstallConnection` - insert an already-owned connection without
///   registering interests (phase 2 target side)
/// - `RegisterInterest` / `DeregisterInterest` - move poller registration
/// - `SelectConnections` - pick migration candidates
///
/// **Control**: `PublishLoadReport`, `Shutdown`
pub(crate) enum DispatcherCommand {
    /// Register a pre-bound listening socket with this dispatcher's poller.
    Listen {
        socket: Box<dyn SocketHandle>,
        ip: String,
        port: u16,
        response_tx: oneshot::Sender<Result<ConnectionId>>,
    },

    /// Create an outbound socket through the configured factory and own it.
    Connect {
        ip: String,
        port: u16,
        response_tx: oneshot::Sender<Result<ConnectionId>>,
    },

    /// Execute a closure on the next loop iteration.
    PostTask(Task),

    /// Arm a timer. The id was assigned by the facade before posting.
    AddTimer {
        timer_id: TimerId,
        interval_ms: u64,
        repeating: bool,
        callback: TimerCallback,
    },

    /// Disarm a timer. Unknown ids are a no-op.
    StopTimer { timer_id: TimerId },

    /// Insert a fully-formed connection: registry entry plus poller
    /// registration, then push the updated count to the load monitor.
    AddConnection {
        connection: Connection,
        response_tx: oneshot::Sender<Result<ConnectionId>>,
    },

    /// Drop a connection: registry entry plus poller registration. Removing
    /// an absent connection is a no-op, not an error.
    RemoveConnection {
        id: ConnectionId,
        response_tx: oneshot::Sender<Option<Connection>>,
    },

    SuspendConnection {
        id: ConnectionId,
        response_tx: oneshot::Sender<Result<()>>,
    },

    ResumeConnection {
        id: ConnectionId,
        response_tx: oneshot::Sender<Result<()>>,
    },

    TakeConnection {
        id: ConnectionId,
        response_tx: oneshot::Sender<Option<Connection>>,
    },

    InstallConnection {
        connection: Connection,
        response_tx: oneshot::Sender<Result<()>>,
    },

    RegisterInterest {
        id: ConnectionId,
        interest: EventInterest,
        response_tx: oneshot::Sender<Result<()>>,
    },

    DeregisterInterest {
        id: ConnectionId,
        response_tx: oneshot::Sender<Result<()>>,
    },

    /// Up to `count` non-suspended connection ids.
    SelectConnections {
        count: u32,
        response_tx: oneshot::Sender<Vec<ConnectionId>>,
    },

    /// Force an immediate load report instead of waiting for the next tick.
    PublishLoadReport {
        response_tx: oneshot::Sender<()>,
    },

    Shutdown,
}
