//! One event-loop worker of the reactor pool.
//!
//! A [`Dispatcher`] is a facade over a spawned event-loop task that
//! exclusively owns a connection registry and a timer facility. Every
//! cross-task entry point marshals a typed [`commands::DispatcherCommand`]
//! onto the loop's mailbox and wakes the poller; the loop drains the mailbox
//! in FIFO order between poll waits. This keeps the cross-thread contract
//! type-checked and the loop body lock-free apart from the drain itself.

pub(crate) mod commands;
mod event_loop;

#[cfg(test)]
mod dispatcher_test;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use rivulet_core::{
    Connection, ConnectionId, DeadlineTimer, DispatcherId, EventInterest, EventPoller,
    NotifyPoller, ReactorError, Result, SocketFactory, SocketHandle, TimerId,
};
use rivulet_load_manager::{LoadMetrics, LoadMonitor, LoadPredictor};

use commands::DispatcherCommand;
use event_loop::EventLoop;

const DEFAULT_MAILBOX_CAPACITY: usize = 128;
const DEFAULT_LOAD_REPORT_INTERVAL_MS: u64 = 1_000;

/// Construction knobs for one dispatcher.
pub struct DispatcherOptions {
    /// Poller driving the loop's waits; defaults to [`NotifyPoller`].
    pub poller: Option<Arc<dyn EventPoller>>,
    /// Factory backing `connect`; without one, `connect` is rejected.
    pub socket_factory: Option<Arc<dyn SocketFactory>>,
    pub load_report_interval_ms: u64,
    pub mailbox_capacity: usize,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            poller: None,
            socket_factory: None,
            load_report_interval_ms: DEFAULT_LOAD_REPORT_INTERVAL_MS,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// One event-loop worker: owns its connections, timers and load metrics.
pub struct Dispatcher {
    id: DispatcherId,
    control_tx: mpsc::Sender<DispatcherCommand>,
    poller: Arc<dyn EventPoller>,
    metrics: Arc<Mutex<LoadMetrics>>,
    predictor: Arc<Mutex<LoadPredictor>>,
    connection_count: Arc<AtomicU32>,
    queue_depth: Arc<AtomicU32>,
    timer_id_seq: AtomicU64,
    stop: Arc<AtomicBool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the event loop and return its facade. The dispatcher reports to
    /// `monitor`, which must already know its id.
    pub fn start(
        id: DispatcherId,
        monitor: Arc<LoadMonitor>,
        options: DispatcherOptions,
    ) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(options.mailbox_capacity.max(1));
        let poller: Arc<dyn EventPoller> = options
            .poller
            .unwrap_or_else(|| Arc::new(NotifyPoller::new()));

        let metrics = Arc::new(Mutex::new(LoadMetrics::new()));
        let predictor = Arc::new(Mutex::new(LoadPredictor::new()));
        let connection_count = Arc::new(AtomicU32::new(0));
        let queue_depth = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop::new(
            id,
            control_rx,
            Arc::clone(&poller),
            Box::new(DeadlineTimer::new()),
            options.socket_factory,
            options.load_report_interval_ms.max(1),
            Arc::clone(&metrics),
            Arc::clone(&predictor),
            monitor,
            Arc::clone(&connection_count),
            Arc::clone(&queue_depth),
            Arc::clone(&stop),
        );
        let handle = tokio::spawn(event_loop.run());

        Arc::new(Self {
            id,
            control_tx,
            poller,
            metrics,
            predictor,
            connection_count,
            queue_depth,
            // Id 0 is reserved for the loop's internal load-report timer.
            timer_id_seq: AtomicU64::new(1),
            stop,
            loop_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        !self.stop.load(Ordering::SeqCst)
    }

    /// The poller this dispatcher waits on. Embedders drive I/O readiness by
    /// waking it.
    pub fn poller(&self) -> Arc<dyn EventPoller> {
        Arc::clone(&self.poller)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Register a pre-bound listening socket on this dispatcher.
    pub async fn listen(
        &self,
        socket: Box<dyn SocketHandle>,
        ip: &str,
        port: u16,
    ) -> Result<ConnectionId> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::Listen {
            socket,
            ip: ip.to_string(),
            port,
            response_tx,
        })
        .await?;
        self.await_response(response_rx).await?
    }

    /// Open an outbound connection owned by this dispatcher.
    pub async fn connect(&self, ip: &str, port: u16) -> Result<ConnectionId> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::Connect {
            ip: ip.to_string(),
            port,
            response_tx,
        })
        .await?;
        self.await_response(response_rx).await?
    }

    /// Enqueue a closure for execution on the next loop iteration.
    pub async fn post_task<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_command(DispatcherCommand::PostTask(Box::new(task)))
            .await
    }

    /// Arm a timer on this dispatcher's loop. The returned id is assigned
    /// immediately; the timer becomes active once the loop drains the
    /// command.
    pub async fn add_timer<F>(
        &self,
        callback: F,
        interval_ms: u64,
        repeating: bool,
    ) -> Result<TimerId>
    where
        F: FnMut() + Send + 'static,
    {
        let timer_id = self.timer_id_seq.fetch_add(1, Ordering::SeqCst);
        self.send_command(DispatcherCommand::AddTimer {
            timer_id,
            interval_ms,
            repeating,
            callback: Box::new(callback),
        })
        .await?;
        Ok(timer_id)
    }

    pub async fn stop_timer(&self, timer_id: TimerId) -> Result<()> {
        self.send_command(DispatcherCommand::StopTimer { timer_id })
            .await
    }

    /// Take ownership of an established socket, registering it with the
    /// poller and pushing the new count to the load monitor.
    pub async fn add_connection(&self, socket: Box<dyn SocketHandle>) -> Result<ConnectionId> {
        let connection = Connection::new(socket, self.id);
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::AddConnection {
            connection,
            response_tx,
        })
        .await?;
        self.await_response(response_rx).await?
    }

    /// Drop a connection. Removing an absent connection is a no-op.
    pub async fn remove_connection(&self, id: ConnectionId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::RemoveConnection { id, response_tx })
            .await?;
        let _removed = self.await_response(response_rx).await?;
        Ok(())
    }

    /// Current weighted load score in `[0, 1]`.
    pub async fn load_score(&self) -> f64 {
        self.metrics.lock().await.calculate_load_score()
    }

    /// Forecast this dispatcher's load `horizon_ms` ahead.
    pub async fn predict_load(&self, horizon_ms: u32) -> f64 {
        self.predictor.lock().await.predict_load(horizon_ms)
    }

    /// Force an immediate load report to the monitor instead of waiting for
    /// the next periodic tick.
    pub async fn publish_load_report(&self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::PublishLoadReport { response_tx })
            .await?;
        self.await_response(response_rx).await
    }

    // Load-metric setters; each signal is owned by the surrounding I/O and
    // system layers and pushed through here.

    pub async fn update_cpu_load(&self, load: f64) {
        self.metrics.lock().await.update_cpu_load(load);
    }

    pub async fn update_thread_utilization(&self, utilization: f64) {
        self.metrics.lock().await.update_thread_utilization(utilization);
    }

    pub async fn update_context_switch_rate(&self, rate: u32) {
        self.metrics.lock().await.update_context_switch_rate(rate);
    }

    pub async fn update_io_wait_time(&self, time_us: u64) {
        self.metrics.lock().await.update_io_wait_time(time_us);
    }

    pub async fn update_packet_rate(&self, rate: u32) {
        self.metrics.lock().await.update_packet_rate(rate);
    }

    pub async fn update_bandwidth_usage(&self, usage: f64) {
        self.metrics.lock().await.update_bandwidth_usage(usage);
    }

    pub async fn update_memory_pool_usage(&self, usage: f64) {
        self.metrics.lock().await.update_memory_pool_usage(usage);
    }

    pub async fn update_cache_hit_rate(&self, rate: f64) {
        self.metrics.lock().await.update_cache_hit_rate(rate);
    }

    pub async fn update_response_time(&self, time_us: u64) {
        self.metrics.lock().await.update_response_time(time_us);
    }

    pub async fn update_error_rate(&self, rate: f64) {
        self.metrics.lock().await.update_error_rate(rate);
    }

    /// Stop the event loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.control_tx.try_send(DispatcherCommand::Shutdown);
        self.poller.wakeup();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{} loop task join failed: {}", self.id, e);
            }
        }
    }

    // -- migration protocol entry points, used only by ConnectionMigrator --

    pub(crate) async fn suspend_connection(&self, id: ConnectionId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::SuspendConnection { id, response_tx })
            .await?;
        self.await_response(response_rx).await?
    }

    pub(crate) async fn resume_connection(&self, id: ConnectionId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::ResumeConnection { id, response_tx })
            .await?;
        self.await_response(response_rx).await?
    }

    /// Remove a connection from the registry without touching its poller
    /// registration; the migration protocol moves events separately.
    pub(crate) async fn take_connection(&self, id: ConnectionId) -> Result<Option<Connection>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::TakeConnection { id, response_tx })
            .await?;
        self.await_response(response_rx).await
    }

    /// Insert an already-rebound connection without registering interests.
    ///
    /// On failure the connection is handed back whenever it could be
    /// recovered, so the caller can return it to its previous owner;
    /// `Err(None)` means the loop consumed the connection before dying and
    /// it is unrecoverable.
    pub(crate) async fn install_connection(
        &self,
        connection: Connection,
    ) -> std::result::Result<(), Option<Connection>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        match self
            .control_tx
            .send(DispatcherCommand::InstallConnection {
                connection,
                response_tx,
            })
            .await
        {
            Ok(()) => self.poller.wakeup(),
            Err(send_error) => {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                // The command comes back in the send error, connection intact.
                if let DispatcherCommand::InstallConnection { connection, .. } = send_error.0 {
                    return Err(Some(connection));
                }
                return Err(None);
            }
        }

        match response_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(None),
        }
    }

    pub(crate) async fn register_interest(
        &self,
        id: ConnectionId,
        interest: EventInterest,
    ) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::RegisterInterest {
            id,
            interest,
            response_tx,
        })
        .await?;
        self.await_response(response_rx).await?
    }

    pub(crate) async fn deregister_interest(&self, id: ConnectionId) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::DeregisterInterest { id, response_tx })
            .await?;
        self.await_response(response_rx).await?
    }

    /// Ids of up to `count` migratable (non-suspended) connections.
    pub(crate) async fn select_connections(&self, count: u32) -> Result<Vec<ConnectionId>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send_command(DispatcherCommand::SelectConnections { count, response_tx })
            .await?;
        self.await_response(response_rx).await
    }

    async fn send_command(&self, command: DispatcherCommand) -> Result<()> {
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
        if self.control_tx.send(command).await.is_err() {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            return Err(ReactorError::DispatcherUnavailable(self.id));
        }
        self.poller.wakeup();
        Ok(())
    }

    async fn await_response<T>(&self, response_rx: oneshot::Receiver<T>) -> Result<T> {
        response_rx
            .await
            .map_err(|_| ReactorError::DispatcherUnavailable(self.id))
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Best-effort stop; shutdown() is the orderly path.
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.control_tx.try_send(DispatcherCommand::Shutdown);
        self.poller.wakeup();
    }
}
