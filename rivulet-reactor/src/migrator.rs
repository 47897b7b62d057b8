//! Live connection hand-off between dispatchers.
//!
//! A migration moves one connection from a source dispatcher to a target
//! dispatcher as a five-phase protocol, each phase posted to the loop that
//! owns the affected state and verified through its response before the next
//! phase starts:
//!
//! 1. **Prepare** - suspend pending I/O on the source loop.
//! 2. **Migrate socket** - move the connection value out of the source
//!    registry, rebind its owner, install it in the target registry.
//! 3. **Migrate buffers** - nothing to copy: buffers live inside the
//!    connection value and moved with it in phase 2.
//! 4. **Migrate events** - deregister from the source poller, then register
//!    with the target poller, strictly in that order.
//! 5. **Complete** - resume I/O on the target loop.
//!
//! Any phase failure aborts the attempt, runs compensating actions that put
//! the connection back on the source side, and marks the context Failed. At
//! every observable instant the connection is registered with exactly one
//! dispatcher.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use rivulet_core::{Connection, ConnectionId, EventInterest, ReactorError, Result};

use crate::dispatcher::Dispatcher;

const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Progress of one migration attempt. Terminal states are final; a new
/// attempt for the same connection may only start once the prior context is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Preparing,
    Migrating,
    Completed,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationState::Completed | MigrationState::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, MigrationState::Preparing | MigrationState::Migrating)
    }
}

struct MigrationContext {
    state_rx: watch::Receiver<MigrationState>,
}

/// Executes connection hand-offs; at most one in-flight context per
/// connection, dropped from the registry once the attempt settles.
pub struct ConnectionMigrator {
    migrations: DashMap<ConnectionId, MigrationContext>,
    phase_timeout: Duration,
    running: AtomicBool,
}

impl Default for ConnectionMigrator {
    fn default() -> Self {
        Self::new(DEFAULT_PHASE_TIMEOUT)
    }
}

impl ConnectionMigrator {
    pub fn new(phase_timeout: Duration) -> Self {
        Self {
            migrations: DashMap::new(),
            phase_timeout,
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current state of the in-flight migration for `id`, if any. Settled
    /// attempts report through their return value and through receivers
    /// obtained while the attempt ran; their contexts are gone.
    pub fn migration_state(&self, id: ConnectionId) -> Option<MigrationState> {
        self.migrations.get(&id).map(|ctx| *ctx.state_rx.borrow())
    }

    /// True strictly while a migration for `id` is in {Preparing, Migrating}.
    pub fn is_migration_in_progress(&self, id: ConnectionId) -> bool {
        self.migration_state(id)
            .is_some_and(|state| state.is_in_progress())
    }

    /// Wait until the in-flight migration for `id` reaches a terminal state.
    /// `None` when no attempt is in flight.
    pub async fn wait_for_completion(&self, id: ConnectionId) -> Option<MigrationState> {
        let mut state_rx = self.migrations.get(&id)?.state_rx.clone();
        loop {
            let state = *state_rx.borrow();
            if state.is_terminal() {
                return Some(state);
            }
            if state_rx.changed().await.is_err() {
                return Some(*state_rx.borrow());
            }
        }
    }

    /// Move one connection from `source` to `target`.
    ///
    /// Rejects immediately when another migration for the same connection is
    /// still in flight, or when source and target coincide. On success the
    /// connection's registry membership is exactly the target; on failure,
    /// exactly the source.
    pub async fn migrate_connection(
        &self,
        id: ConnectionId,
        source: &Arc<Dispatcher>,
        target: &Arc<Dispatcher>,
    ) -> Result<()> {
        if source.id() == target.id() {
            return Err(ReactorError::InvalidArgument(
                "source and target dispatcher coincide".to_string(),
            ));
        }

        // Claim the per-connection slot; at most one non-terminal context.
        let (state_tx, state_rx) = watch::channel(MigrationState::Preparing);
        match self.migrations.entry(id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().state_rx.borrow().is_terminal() {
                    return Err(ReactorError::MigrationConflict(id));
                }
                occupied.insert(MigrationContext { state_rx });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MigrationContext { state_rx });
            }
        }

        debug!(
            "migration of {} from {} to {} started",
            id,
            source.id(),
            target.id()
        );

        let result = self.run_phases(id, source, target, &state_tx).await;
        match &result {
            Ok(()) => {
                state_tx.send_replace(MigrationState::Completed);
                info!("migration of {} to {} completed", id, target.id());
            }
            Err(e) => {
                state_tx.send_replace(MigrationState::Failed);
                warn!("migration of {} failed: {}", id, e);
            }
        }
        // The attempt is settled; waiters already hold receiver clones.
        // A racing replacement context is non-terminal and stays put.
        self.migrations
            .remove_if(&id, |_, ctx| ctx.state_rx.borrow().is_terminal());
        result
    }

    async fn run_phases(
        &self,
        id: ConnectionId,
        source: &Arc<Dispatcher>,
        target: &Arc<Dispatcher>,
        state_tx: &watch::Sender<MigrationState>,
    ) -> Result<()> {
        // Phase 1: quiesce the connection on its owning loop.
        if let Err(e) = self.phased("prepare", source.suspend_connection(id)).await {
            // A timed-out suspend may still land once the loop drains; chase
            // it with a resume so the connection is never left parked.
            if matches!(e, ReactorError::Timeout(_)) {
                resume_later(source, id);
            }
            return Err(e);
        }
        state_tx.send_replace(MigrationState::Migrating);

        // Phase 2: move registry ownership. The connection value carries its
        // buffers, so phase 3 (migrate buffers) is complete by construction
        // the moment this move lands.
        let mut connection = match self.phased("migrate_socket", source.take_connection(id)).await {
            Ok(Some(connection)) => connection,
            Ok(None) => return Err(ReactorError::ConnectionNotFound(id)),
            Err(e) => {
                // The connection is suspended on the source; whether the take
                // lands late (the loop reclaims it) or never, a queued resume
                // restores I/O. FIFO ordering puts it behind the take.
                resume_later(source, id);
                return Err(e);
            }
        };
        let interest = connection.interest();
        connection.rebind(target.id());

        let install = tokio::time::timeout(self.phase_timeout, target.install_connection(connection));
        match install.await {
            Ok(Ok(())) => {}
            Ok(Err(Some(recovered))) => {
                // Target never accepted the value; hand it straight back.
                self.reinstall_on_source(id, recovered, source, interest).await;
                return Err(ReactorError::MigrationPhase {
                    phase: "migrate_socket",
                    reason: format!("target {} rejected the connection", target.id()),
                });
            }
            Ok(Err(None)) => {
                error!("{} lost during hand-off to {}", id, target.id());
                return Err(ReactorError::MigrationPhase {
                    phase: "migrate_socket",
                    reason: "connection lost in target hand-off".to_string(),
                });
            }
            Err(_) => {
                // The command is queued but unconfirmed; the value cannot be
                // reclaimed safely from here.
                error!("{} install on {} timed out", id, target.id());
                return Err(ReactorError::Timeout("migrate_socket".to_string()));
            }
        }

        // Phase 4: move event registrations, source strictly before target so
        // the connection is never watched by two pollers.
        if let Err(e) = self
            .phased("migrate_events", source.deregister_interest(id))
            .await
        {
            self.rollback_from_target(id, source, target, interest).await;
            return Err(e);
        }
        if let Err(e) = self
            .phased("migrate_events", target.register_interest(id, interest))
            .await
        {
            self.rollback_from_target(id, source, target, interest).await;
            return Err(e);
        }

        // Phase 5: resume I/O on the new owner.
        if let Err(e) = self.phased("complete", target.resume_connection(id)).await {
            self.rollback_from_target(id, source, target, interest).await;
            return Err(e);
        }

        Ok(())
    }

    async fn phased<T>(
        &self,
        phase: &'static str,
        operation: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.phase_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ReactorError::MigrationPhase {
                phase,
                reason: e.to_string(),
            }),
            Err(_) => Err(ReactorError::Timeout(phase.to_string())),
        }
    }

    /// Compensation for failures after the connection reached the target
    /// registry: pull it back and restore the source side.
    async fn rollback_from_target(
        &self,
        id: ConnectionId,
        source: &Arc<Dispatcher>,
        target: &Arc<Dispatcher>,
        interest: EventInterest,
    ) {
        warn!("rolling back migration of {} to {}", id, source.id());

        // Make sure the target poller never keeps a registration for a
        // connection it is losing; harmless when none was made.
        let _ = target.deregister_interest(id).await;

        match target.take_connection(id).await {
            Ok(Some(connection)) => {
                self.reinstall_on_source(id, connection, source, interest).await;
            }
            Ok(None) => error!("rollback of {}: connection missing on target", id),
            Err(e) => error!("rollback of {}: cannot reach target loop: {}", id, e),
        }
    }

    async fn reinstall_on_source(
        &self,
        id: ConnectionId,
        mut connection: Connection,
        source: &Arc<Dispatcher>,
        interest: EventInterest,
    ) {
        connection.rebind(source.id());
        match source.install_connection(connection).await {
            Ok(()) => {
                // Re-registering an interest that was never removed is a
                // plain overwrite on the poller side.
                if let Err(e) = source.register_interest(id, interest).await {
                    error!("rollback of {}: re-register failed: {}", id, e);
                }
                if let Err(e) = source.resume_connection(id).await {
                    error!("rollback of {}: resume failed: {}", id, e);
                }
            }
            Err(_) => error!("rollback of {}: source {} rejected reinstall", id, source.id()),
        }
    }
}

/// Best-effort compensating resume for failures before the connection left
/// the source. Posted from a spawned task so a stalled source loop delays
/// only the compensation, not the caller; the mailbox's FIFO order puts it
/// behind any still-queued suspend or take.
fn resume_later(source: &Arc<Dispatcher>, id: ConnectionId) {
    let source = Arc::clone(source);
    tokio::spawn(async move {
        if let Err(e) = source.resume_connection(id).await {
            debug!("compensating resume of {} skipped: {}", id, e);
        }
    });
}
