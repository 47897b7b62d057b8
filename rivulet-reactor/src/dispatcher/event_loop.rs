//! The single-threaded cooperative loop behind one dispatcher.
//!
//! Each iteration drives the timer facility with the elapsed wall-clock
//! delta, suspends in the poller for at most the next timer deadline, then
//! drains and executes every command posted since the last drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use rivulet_core::{
    Connection, ConnectionId, DispatcherId, EventPoller, ReactorError, Result, SocketFactory,
    SocketHandle, TimerDriver, TimerId,
};
use rivulet_load_manager::{LoadMetrics, LoadMonitor, LoadPredictor, LoadSnapshot};

use super::commands::{DispatcherCommand, TimerCallback};

/// Timer id reserved for the loop's own periodic load report. Facade-assigned
/// ids start at 1 and never collide with it.
pub(crate) const LOAD_REPORT_TIMER_ID: TimerId = 0;

struct UserTimer {
    callback: TimerCallback,
    repeating: bool,
}

pub(crate) struct EventLoop {
    id: DispatcherId,
    control_rx: mpsc::Receiver<DispatcherCommand>,
    poller: Arc<dyn EventPoller>,
    timer: Box<dyn TimerDriver>,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    load_report_interval_ms: u64,

    connections: HashMap<ConnectionId, Connection>,
    user_timers: HashMap<TimerId, UserTimer>,

    metrics: Arc<Mutex<LoadMetrics>>,
    predictor: Arc<Mutex<LoadPredictor>>,
    monitor: Arc<LoadMonitor>,
    connection_count: Arc<AtomicU32>,
    queue_depth: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: DispatcherId,
        control_rx: mpsc::Receiver<DispatcherCommand>,
        poller: Arc<dyn EventPoller>,
        timer: Box<dyn TimerDriver>,
        socket_factory: Option<Arc<dyn SocketFactory>>,
        load_report_interval_ms: u64,
        metrics: Arc<Mutex<LoadMetrics>>,
        predictor: Arc<Mutex<LoadPredictor>>,
        monitor: Arc<LoadMonitor>,
        connection_count: Arc<AtomicU32>,
        queue_depth: Arc<AtomicU32>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            control_rx,
            poller,
            timer,
            socket_factory,
            load_report_interval_ms,
            connections: HashMap::new(),
            user_timers: HashMap::new(),
            metrics,
            predictor,
            monitor,
            connection_count,
            queue_depth,
            stop,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("{} event loop started", self.id);

        if let Err(e) = self.poller.init() {
            error!("{} poller init failed: {}", self.id, e);
            return;
        }
        self.timer
            .add(LOAD_REPORT_TIMER_ID, self.load_report_interval_ms, true);

        let mut last_tick = Instant::now();

        'outer: loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_tick).as_millis() as u64;
            last_tick = now;

            for timer_id in self.timer.advance(elapsed) {
                self.handle_timer(timer_id).await;
            }

            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let wait = self.timer.next_due_in_ms();
            self.poller.process_events(wait).await;

            loop {
                match self.control_rx.try_recv() {
                    Ok(command) => {
                        let keep_running = self.handle_command(command).await;
                        // Saturating: shutdown paths may enqueue uncounted.
                        let _ = self
                            .queue_depth
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                                Some(depth.saturating_sub(1))
                            });
                        if !keep_running {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        warn!("{} command channel disconnected", self.id);
                        break 'outer;
                    }
                }
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        info!("{} event loop stopped", self.id);
    }

    async fn handle_timer(&mut self, timer_id: TimerId) {
        if timer_id == LOAD_REPORT_TIMER_ID {
            self.publish_load_report().await;
            return;
        }

        if let Some(entry) = self.user_timers.get_mut(&timer_id) {
            (entry.callback)();
            if !entry.repeating {
                self.user_timers.remove(&timer_id);
            }
        }
    }

    /// Returns false when the loop should terminate.
    async fn handle_command(&mut self, command: DispatcherCommand) -> bool {
        match command {
            DispatcherCommand::Listen {
                socket,
                ip,
                port,
                response_tx,
            } => {
                let result = self.add_socket(socket).await;
                if result.is_ok() {
                    info!("{} listening on {}:{}", self.id, ip, port);
                }
                let _ = response_tx.send(result);
            }
            DispatcherCommand::Connect {
                ip,
                port,
                response_tx,
            } => {
                let result = self.connect(&ip, port).await;
                let _ = response_tx.send(result);
            }
            DispatcherCommand::PostTask(task) => {
                task();
            }
            DispatcherCommand::AddTimer {
                timer_id,
                interval_ms,
                repeating,
                callback,
            } => {
                self.timer.add(timer_id, interval_ms, repeating);
                self.user_timers
                    .insert(timer_id, UserTimer { callback, repeating });
            }
            DispatcherCommand::StopTimer { timer_id } => {
                self.timer.remove(timer_id);
                self.user_timers.remove(&timer_id);
            }
            DispatcherCommand::AddConnection {
                connection,
                response_tx,
            } => {
                let id = connection.id();
                let result = self
                    .insert_connection(connection, true)
                    .await
                    .map(|_| id);
                let _ = response_tx.send(result);
            }
            DispatcherCommand::RemoveConnection { id, response_tx } => {
                let removed = self.remove_connection(id, true).await;
                let _ = response_tx.send(removed);
            }
            DispatcherCommand::SuspendConnection { id, response_tx } => {
                let result = match self.connections.get_mut(&id) {
                    Some(connection) => {
                        connection.suspend();
                        trace!("{} suspended {}", self.id, id);
                        Ok(())
                    }
                    None => Err(ReactorError::ConnectionNotFound(id)),
                };
                let _ = response_tx.send(result);
            }
            DispatcherCommand::ResumeConnection { id, response_tx } => {
                let result = match self.connections.get_mut(&id) {
                    Some(connection) => {
                        connection.resume();
                        trace!("{} resumed {}", self.id, id);
                        Ok(())
                    }
                    None => Err(ReactorError::ConnectionNotFound(id)),
                };
                let _ = response_tx.send(result);
            }
            DispatcherCommand::TakeConnection { id, response_tx } => {
                // Registry-only removal; the poller registration moves in a
                // later migration phase.
                let taken = self.remove_connection(id, false).await;
                if let Err(Some(mut connection)) = response_tx.send(taken) {
                    // The requester gave up waiting; keep owning the
                    // connection rather than dropping it on the floor.
                    warn!("{} reclaiming {} after abandoned take", self.id, id);
                    connection.resume();
                    self.connections.insert(id, connection);
                    self.push_connection_count().await;
                }
            }
            DispatcherCommand::InstallConnection {
                connection,
                response_tx,
            } => {
                let result = self.insert_connection(connection, false).await;
                let _ = response_tx.send(result);
            }
            DispatcherCommand::RegisterInterest {
                id,
                interest,
                response_tx,
            } => {
                let result = match self.connections.get_mut(&id) {
                    Some(connection) => {
                        connection.set_interest(interest);
                        self.poller.register_interest(id, interest)
                    }
                    None => Err(ReactorError::ConnectionNotFound(id)),
                };
                let _ = response_tx.send(result);
            }
            DispatcherCommand::DeregisterInterest { id, response_tx } => {
                let result = self.poller.deregister_interest(id);
                let _ = response_tx.send(result);
            }
            DispatcherCommand::SelectConnections { count, response_tx } => {
                let selected: Vec<ConnectionId> = self
                    .connections
                    .values()
                    .filter(|connection| !connection.is_suspended())
                    .take(count as usize)
                    .map(|connection| connection.id())
                    .collect();
                let _ = response_tx.send(selected);
            }
            DispatcherCommand::PublishLoadReport { response_tx } => {
                self.publish_load_report().await;
                let _ = response_tx.send(());
            }
            DispatcherCommand::Shutdown => {
                debug!("{} received shutdown", self.id);
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, ip: &str, port: u16) -> Result<ConnectionId> {
        let factory = self.socket_factory.as_ref().ok_or_else(|| {
            ReactorError::InvalidArgument("no socket factory configured".to_string())
        })?;
        let socket = factory.connect(ip, port).await?;
        let id = self.add_socket(socket).await?;
        debug!("{} connected {} to {}:{}", self.id, id, ip, port);
        Ok(id)
    }

    async fn add_socket(&mut self, socket: Box<dyn SocketHandle>) -> Result<ConnectionId> {
        let connection = Connection::new(socket, self.id);
        let id = connection.id();
        self.insert_connection(connection, true).await?;
        Ok(id)
    }

    async fn insert_connection(
        &mut self,
        connection: Connection,
        register_interest: bool,
    ) -> Result<()> {
        if connection.owner() != self.id {
            return Err(ReactorError::InvalidArgument(format!(
                "connection {} is owned by {}",
                connection.id(),
                connection.owner()
            )));
        }

        let id = connection.id();
        if register_interest {
            self.poller.register_interest(id, connection.interest())?;
        }
        self.connections.insert(id, connection);
        self.push_connection_count().await;
        Ok(())
    }

    async fn remove_connection(
        &mut self,
        id: ConnectionId,
        deregister_interest: bool,
    ) -> Option<Connection> {
        let removed = self.connections.remove(&id)?;
        if deregister_interest {
            if let Err(e) = self.poller.deregister_interest(id) {
                warn!("{} failed to deregister {}: {}", self.id, id, e);
            }
        }
        self.push_connection_count().await;
        Some(removed)
    }

    async fn push_connection_count(&mut self) {
        let count = self.connections.len() as u32;
        self.connection_count.store(count, Ordering::SeqCst);
        self.monitor.update_dispatcher_load(self.id, count).await;
    }

    /// Refresh the self-maintained signals, score the metrics, feed the
    /// predictor and publish the snapshot to the cluster monitor.
    async fn publish_load_report(&mut self) {
        let connection_count = self.connections.len() as u32;
        let queue_length = self.queue_depth.load(Ordering::SeqCst);
        let total_bytes: u64 = self
            .connections
            .values()
            .map(Connection::buffered_bytes)
            .sum();

        let (score, cpu_usage) = {
            let mut metrics = self.metrics.lock().await;
            metrics.update_connection_count(connection_count);
            metrics.update_task_queue_length(queue_length);
            let score = metrics.calculate_load_score();
            (score, (metrics.cpu_load() * 100.0).round() as u32)
        };

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.predictor.lock().await.update_load(score, now_ms);

        self.monitor
            .update_load_info(
                self.id,
                LoadSnapshot {
                    connection_count,
                    cpu_usage,
                    queue_length,
                    total_bytes,
                },
            )
            .await;
        trace!("{} load report: score {:.3}", self.id, score);
    }
}
