use std::fmt;

use serde::{Deserialize, Serialize};

use crate::socket::SocketHandle;

/// Stable identifier of a live connection, derived from its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of an event-loop worker in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatcherId(pub u64);

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

/// Identifier of a timer registered with a dispatcher. Monotonically assigned
/// per dispatcher, never reused within a dispatcher's lifetime.
pub type TimerId = u64;

/// Event interests registered with a poller for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInterest {
    pub readable: bool,
    pub writable: bool,
}

impl EventInterest {
    pub const READ: EventInterest = EventInterest {
        readable: true,
        writable: false,
    };

    pub const READ_WRITE: EventInterest = EventInterest {
        readable: true,
        writable: true,
    };
}

impl Default for EventInterest {
    fn default() -> Self {
        EventInterest::READ
    }
}

/// A live connection: socket handle, buffered data and registered interests.
///
/// Buffers are owned by the connection itself, not by the dispatcher, so a
/// migration moves them for free when the connection value changes hands.
/// The `owner` field and the poller registration must stay consistent: a
/// connection is never registered with two pollers, and never with none
/// while a dispatcher owns it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    socket: Box<dyn SocketHandle>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    interest: EventInterest,
    owner: DispatcherId,
    suspended: bool,
}

impl Connection {
    pub fn new(socket: Box<dyn SocketHandle>, owner: DispatcherId) -> Self {
        let id = socket.identifier();
        Self {
            id,
            socket,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            interest: EventInterest::default(),
            owner,
            suspended: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn owner(&self) -> DispatcherId {
        self.owner
    }

    /// Rebind the connection to a new owning dispatcher. Only legal while the
    /// connection is quiesced (suspended and removed from the source poller).
    pub fn rebind(&mut self, owner: DispatcherId) {
        self.owner = owner;
    }

    pub fn interest(&self) -> EventInterest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: EventInterest) {
        self.interest = interest;
    }

    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn socket(&self) -> &dyn SocketHandle {
        self.socket.as_ref()
    }

    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buffer
    }

    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Append inbound bytes delivered by the surrounding I/O layer.
    pub fn push_read_data(&mut self, data: &[u8]) {
        self.read_buffer.extend_from_slice(data);
    }

    /// Queue outbound bytes awaiting a writable socket.
    pub fn push_write_data(&mut self, data: &[u8]) {
        self.write_buffer.extend_from_slice(data);
    }

    pub fn buffered_bytes(&self) -> u64 {
        (self.read_buffer.len() + self.write_buffer.len()) as u64
    }
}
