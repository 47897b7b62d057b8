//! Adaptive multi-dispatcher event reactor.
//!
//! The crate is organised around three pieces:
//!
//! - [`Dispatcher`]: one event-loop worker owning a connection registry,
//!   a timer facility and its own load metrics/predictor.
//! - [`ConnectionMigrator`]: the five-phase protocol that moves a live
//!   connection between dispatchers with rollback on partial failure.
//! - [`ReactorPool`]: spawns the workers, rotates accepted sockets over
//!   them and runs the periodic rebalance loop against the shared
//!   [`rivulet_load_manager::LoadMonitor`].

mod dispatcher;
mod migrator;
mod pool;

#[cfg(test)]
pub(crate) mod test_support;

pub use dispatcher::{Dispatcher, DispatcherOptions};
pub use migrator::{ConnectionMigrator, MigrationState};
pub use pool::{PoolOptions, ReactorPool};
