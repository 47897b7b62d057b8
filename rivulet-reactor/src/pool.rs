//! The dispatcher pool: worker spawn, accept rotation and the periodic
//! rebalance control loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rivulet_core::{DispatcherId, ReactorError, Result, SocketFactory};
use rivulet_load_manager::LoadMonitor;

use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::migrator::ConnectionMigrator;

const DEFAULT_BALANCE_INTERVAL_MS: u64 = 5_000;
const DEFAULT_MIGRATION_BATCH_SIZE: u32 = 10;
const DEFAULT_PHASE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOAD_REPORT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAILBOX_CAPACITY: usize = 128;

/// Construction knobs for the pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Worker count; defaults to the number of CPUs.
    pub workers: Option<usize>,
    /// How often the control loop checks whether rebalancing is needed.
    pub balance_interval_ms: u64,
    /// Maximum connections moved per rebalance pass.
    pub migration_batch_size: u32,
    /// Bound on each awaited migration phase.
    pub phase_timeout_ms: u64,
    pub load_report_interval_ms: u64,
    pub mailbox_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: None,
            balance_interval_ms: DEFAULT_BALANCE_INTERVAL_MS,
            migration_batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            phase_timeout_ms: DEFAULT_PHASE_TIMEOUT_MS,
            load_report_interval_ms: DEFAULT_LOAD_REPORT_INTERVAL_MS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// A pool of event-loop workers sharing one load monitor and one migrator.
pub struct ReactorPool {
    dispatchers: Arc<HashMap<DispatcherId, Arc<Dispatcher>>>,
    dispatcher_order: Vec<DispatcherId>,
    monitor: Arc<LoadMonitor>,
    migrator: Arc<ConnectionMigrator>,
    migration_batch_size: u32,
    accept_rotation: AtomicUsize,
    balance_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReactorPool {
    /// Spawn `workers` dispatchers, register them with a fresh monitor and
    /// start the periodic rebalance loop.
    pub async fn start(
        options: PoolOptions,
        socket_factory: Option<Arc<dyn SocketFactory>>,
    ) -> Arc<Self> {
        let workers = options.workers.unwrap_or_else(num_cpus::get).max(1);
        let monitor = Arc::new(LoadMonitor::new());

        let mut dispatchers = HashMap::with_capacity(workers);
        let mut dispatcher_order = Vec::with_capacity(workers);
        for n in 0..workers {
            let id = DispatcherId(n as u64 + 1);
            monitor.add_dispatcher(id).await;
            let dispatcher = Dispatcher::start(
                id,
                Arc::clone(&monitor),
                DispatcherOptions {
                    poller: None,
                    socket_factory: socket_factory.clone(),
                    load_report_interval_ms: options.load_report_interval_ms,
                    mailbox_capacity: options.mailbox_capacity,
                },
            );
            dispatchers.insert(id, dispatcher);
            dispatcher_order.push(id);
        }
        let dispatchers = Arc::new(dispatchers);

        let migrator = Arc::new(ConnectionMigrator::new(Duration::from_millis(
            options.phase_timeout_ms,
        )));
        migrator.start();

        let balance_handle = tokio::spawn(run_balance_loop(
            Arc::clone(&monitor),
            Arc::clone(&migrator),
            Arc::clone(&dispatchers),
            Duration::from_millis(options.balance_interval_ms.max(1)),
            options.migration_batch_size,
        ));

        info!("reactor pool started with {} dispatchers", workers);

        Arc::new(Self {
            dispatchers,
            dispatcher_order,
            monitor,
            migrator,
            migration_batch_size: options.migration_batch_size,
            accept_rotation: AtomicUsize::new(0),
            balance_handle: Mutex::new(Some(balance_handle)),
        })
    }

    pub fn dispatcher(&self, id: DispatcherId) -> Option<Arc<Dispatcher>> {
        self.dispatchers.get(&id).cloned()
    }

    /// All dispatchers in spawn order.
    pub fn dispatchers(&self) -> Vec<Arc<Dispatcher>> {
        self.dispatcher_order
            .iter()
            .filter_map(|id| self.dispatchers.get(id).cloned())
            .collect()
    }

    /// Round-robin rotation used to spread accepted sockets over workers.
    pub fn next_dispatcher(&self) -> Arc<Dispatcher> {
        let n = self.accept_rotation.fetch_add(1, Ordering::SeqCst);
        let id = self.dispatcher_order[n % self.dispatcher_order.len()];
        // Ids in dispatcher_order always resolve; maps are built together.
        Arc::clone(&self.dispatchers[&id])
    }

    pub fn monitor(&self) -> Arc<LoadMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn migrator(&self) -> Arc<ConnectionMigrator> {
        Arc::clone(&self.migrator)
    }

    /// One manual rebalance pass: move up to a batch of connections from the
    /// most loaded dispatcher to the least loaded one.
    pub async fn migrate_connections_from_overloaded_dispatcher(&self) -> Result<u32> {
        rebalance_once(
            &self.monitor,
            &self.migrator,
            &self.dispatchers,
            self.migration_batch_size,
        )
        .await
    }

    /// Stop the balance loop, the migrator and every dispatcher.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.balance_handle.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.migrator.stop();

        for id in &self.dispatcher_order {
            if let Some(dispatcher) = self.dispatchers.get(id) {
                dispatcher.shutdown().await;
            }
            self.monitor.remove_dispatcher(*id).await;
        }
        info!("reactor pool stopped");
    }
}

async fn run_balance_loop(
    monitor: Arc<LoadMonitor>,
    migrator: Arc<ConnectionMigrator>,
    dispatchers: Arc<HashMap<DispatcherId, Arc<Dispatcher>>>,
    interval: Duration,
    batch_size: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !monitor.need_load_balance().await {
            continue;
        }
        match rebalance_once(&monitor, &migrator, &dispatchers, batch_size).await {
            Ok(0) => {}
            Ok(moved) => debug!("rebalance pass moved {} connections", moved),
            Err(e) => warn!("rebalance pass failed: {}", e),
        }
    }
}

async fn rebalance_once(
    monitor: &Arc<LoadMonitor>,
    migrator: &Arc<ConnectionMigrator>,
    dispatchers: &Arc<HashMap<DispatcherId, Arc<Dispatcher>>>,
    batch_size: u32,
) -> Result<u32> {
    if !migrator.is_running() {
        return Ok(0);
    }

    let Some(source_id) = monitor.get_most_loaded_dispatcher().await else {
        return Ok(0);
    };
    let Some(target_id) = monitor.get_least_loaded_dispatcher().await else {
        return Ok(0);
    };
    if source_id == target_id {
        return Ok(0);
    }

    let source = dispatchers
        .get(&source_id)
        .ok_or(ReactorError::DispatcherUnavailable(source_id))?;
    let target = dispatchers
        .get(&target_id)
        .ok_or(ReactorError::DispatcherUnavailable(target_id))?;

    let candidates = source.select_connections(batch_size).await?;
    if candidates.is_empty() {
        return Ok(0);
    }

    let mut migrated = 0;
    for id in candidates {
        match migrator.migrate_connection(id, source, target).await {
            Ok(()) => migrated += 1,
            Err(e) => warn!("skipping {} in rebalance pass: {}", id, e),
        }
    }

    if migrated > 0 {
        info!(
            "moved {} connections from {} to {}",
            migrated, source_id, target_id
        );
    }
    Ok(migrated)
}
