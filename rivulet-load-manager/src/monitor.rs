//! Cluster-wide dispatcher load registry and ranking queries.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use rivulet_core::DispatcherId;

use crate::snapshot::LoadSnapshot;

const DEFAULT_CPU_THRESHOLD: u32 = 80;
const DEFAULT_QUEUE_THRESHOLD: u32 = 1_000;
const DEFAULT_CONNECTION_THRESHOLD: u32 = 10_000;

/// Per-signal limits above which the cluster is considered imbalanced.
#[derive(Debug, Clone, Copy)]
pub struct LoadThresholds {
    pub cpu_usage: u32,
    pub queue_length: u32,
    pub connection_count: u32,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_usage: DEFAULT_CPU_THRESHOLD,
            queue_length: DEFAULT_QUEUE_THRESHOLD,
            connection_count: DEFAULT_CONNECTION_THRESHOLD,
        }
    }
}

#[derive(Debug)]
struct DispatcherLoad {
    snapshot: LoadSnapshot,
    last_update: Instant,
}

/// Flat registry of every dispatcher's latest [`LoadSnapshot`].
///
/// Dispatchers push their own reports; the rebalance layer asks for the
/// least/most loaded dispatcher and whether any worker has crossed its
/// thresholds. All state sits behind one short-held lock.
#[derive(Debug)]
pub struct LoadMonitor {
    loads: Mutex<HashMap<DispatcherId, DispatcherLoad>>,
    thresholds: Mutex<LoadThresholds>,
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self {
            loads: Mutex::new(HashMap::new()),
            thresholds: Mutex::new(LoadThresholds::default()),
        }
    }

    pub async fn add_dispatcher(&self, dispatcher_id: DispatcherId) {
        debug!("load monitor registering {}", dispatcher_id);
        self.loads.lock().await.insert(
            dispatcher_id,
            DispatcherLoad {
                snapshot: LoadSnapshot::default(),
                last_update: Instant::now(),
            },
        );
    }

    pub async fn remove_dispatcher(&self, dispatcher_id: DispatcherId) {
        debug!("load monitor removing {}", dispatcher_id);
        self.loads.lock().await.remove(&dispatcher_id);
    }

    /// Replace a dispatcher's full load snapshot.
    pub async fn update_load_info(&self, dispatcher_id: DispatcherId, snapshot: LoadSnapshot) {
        let mut loads = self.loads.lock().await;
        match loads.get_mut(&dispatcher_id) {
            Some(load) => {
                load.snapshot = snapshot;
                load.last_update = Instant::now();
            }
            None => warn!("load report from unregistered {}", dispatcher_id),
        }
    }

    /// Fast path used on every registry mutation: update only the connection
    /// count, leaving the other signals at their last reported values.
    pub async fn update_dispatcher_load(&self, dispatcher_id: DispatcherId, connection_count: u32) {
        let mut loads = self.loads.lock().await;
        if let Some(load) = loads.get_mut(&dispatcher_id) {
            load.snapshot.connection_count = connection_count;
            load.last_update = Instant::now();
        }
    }

    pub async fn snapshot_of(&self, dispatcher_id: DispatcherId) -> Option<LoadSnapshot> {
        self.loads
            .lock()
            .await
            .get(&dispatcher_id)
            .map(|load| load.snapshot.clone())
    }

    pub async fn dispatcher_count(&self) -> usize {
        self.loads.lock().await.len()
    }

    /// The dispatcher with the lowest CPU usage, ties broken toward the
    /// lower connection count. `None` when the registry is empty.
    pub async fn get_least_loaded_dispatcher(&self) -> Option<DispatcherId> {
        let loads = self.loads.lock().await;
        loads
            .iter()
            .min_by_key(|(_, load)| {
                (load.snapshot.cpu_usage, load.snapshot.connection_count)
            })
            .map(|(&id, _)| id)
    }

    /// The dispatcher with the highest CPU usage, ties broken toward the
    /// higher connection count. `None` when the registry is empty.
    pub async fn get_most_loaded_dispatcher(&self) -> Option<DispatcherId> {
        let loads = self.loads.lock().await;
        loads
            .iter()
            .max_by_key(|(_, load)| {
                (load.snapshot.cpu_usage, load.snapshot.connection_count)
            })
            .map(|(&id, _)| id)
    }

    /// Cluster-wide rebalance trigger: true iff any registered dispatcher
    /// exceeds a threshold. With fewer than two dispatchers there is nowhere
    /// to move load, so this is always false.
    pub async fn need_load_balance(&self) -> bool {
        let thresholds = *self.thresholds.lock().await;
        let loads = self.loads.lock().await;
        if loads.len() < 2 {
            return false;
        }

        loads.values().any(|load| {
            load.snapshot.cpu_usage > thresholds.cpu_usage
                || load.snapshot.queue_length > thresholds.queue_length
                || load.snapshot.connection_count > thresholds.connection_count
        })
    }

    pub async fn set_thresholds(&self, thresholds: LoadThresholds) {
        *self.thresholds.lock().await = thresholds;
    }

    pub async fn set_cpu_threshold(&self, threshold: u32) {
        self.thresholds.lock().await.cpu_usage = threshold;
    }

    pub async fn set_queue_threshold(&self, threshold: u32) {
        self.thresholds.lock().await.queue_length = threshold;
    }

    pub async fn set_connection_threshold(&self, threshold: u32) {
        self.thresholds.lock().await.connection_count = threshold;
    }
}
