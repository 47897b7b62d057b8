use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use rivulet_core::{ConnectionId, DispatcherId, ReactorError};
use rivulet_load_manager::LoadMonitor;

use crate::dispatcher::{Dispatcher, DispatcherOptions};
use crate::test_support::{MockFactory, MockSocket};

async fn start_dispatcher(options: DispatcherOptions) -> (Arc<Dispatcher>, Arc<LoadMonitor>) {
    let id = DispatcherId(1);
    let monitor = Arc::new(LoadMonitor::new());
    monitor.add_dispatcher(id).await;
    let dispatcher = Dispatcher::start(id, Arc::clone(&monitor), options);
    (dispatcher, monitor)
}

fn fast_report_options() -> DispatcherOptions {
    DispatcherOptions {
        load_report_interval_ms: 20,
        ..Default::default()
    }
}

#[tokio::test]
async fn add_and_remove_connection_updates_registry() {
    let (dispatcher, monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let id = dispatcher
        .add_connection(MockSocket::new(7))
        .await
        .unwrap();
    assert_eq!(id, ConnectionId(7));
    assert_eq!(dispatcher.connection_count(), 1);
    assert!(dispatcher.poller().is_registered(id));

    let snapshot = monitor.snapshot_of(dispatcher.id()).await.unwrap();
    assert_eq!(snapshot.connection_count, 1);

    dispatcher.remove_connection(id).await.unwrap();
    assert_eq!(dispatcher.connection_count(), 0);
    assert!(!dispatcher.poller().is_registered(id));
}

#[tokio::test]
async fn removing_absent_connection_is_a_no_op() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;
    dispatcher
        .remove_connection(ConnectionId(99))
        .await
        .unwrap();
}

#[tokio::test]
async fn posted_task_runs_on_the_loop() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let (done_tx, done_rx) = oneshot::channel();
    dispatcher
        .post_task(move || {
            let _ = done_tx.send(42u32);
        })
        .await
        .unwrap();

    let value = timeout(Duration::from_secs(1), done_rx)
        .await
        .expect("task did not run")
        .unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn one_shot_timer_fires_once() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
    dispatcher
        .add_timer(
            move || {
                let _ = tick_tx.send(());
            },
            10,
            false,
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(1), tick_rx.recv())
        .await
        .expect("timer did not fire")
        .unwrap();

    // One-shot timers are disarmed after firing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tick_rx.try_recv().is_err());
}

#[tokio::test]
async fn repeating_timer_ticks_until_stopped() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
    let timer_id = dispatcher
        .add_timer(
            move || {
                let _ = tick_tx.send(());
            },
            10,
            true,
        )
        .await
        .unwrap();

    for _ in 0..3 {
        timeout(Duration::from_secs(1), tick_rx.recv())
            .await
            .expect("timer stopped ticking")
            .unwrap();
    }

    dispatcher.stop_timer(timer_id).await.unwrap();
    // Drain ticks that raced the stop, then verify silence.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while tick_rx.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(tick_rx.try_recv().is_err());
}

#[tokio::test]
async fn timer_ids_are_unique_and_never_zero() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let a = dispatcher.add_timer(|| {}, 10_000, false).await.unwrap();
    let b = dispatcher.add_timer(|| {}, 10_000, false).await.unwrap();
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
}

#[tokio::test]
async fn connect_uses_the_socket_factory() {
    let factory = MockFactory::new(100);
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions {
        socket_factory: Some(factory),
        ..Default::default()
    })
    .await;

    let first = dispatcher.connect("10.0.0.1", 4000).await.unwrap();
    let second = dispatcher.connect("10.0.0.1", 4000).await.unwrap();
    assert_eq!(first, ConnectionId(100));
    assert_eq!(second, ConnectionId(101));
    assert_eq!(dispatcher.connection_count(), 2);
}

#[tokio::test]
async fn connect_without_factory_is_rejected() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let err = dispatcher.connect("10.0.0.1", 4000).await.unwrap_err();
    assert!(matches!(err, ReactorError::InvalidArgument(_)));
}

#[tokio::test]
async fn listen_registers_the_socket() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let id = dispatcher
        .listen(MockSocket::new(12), "0.0.0.0", 9000)
        .await
        .unwrap();
    assert_eq!(id, ConnectionId(12));
    assert!(dispatcher.poller().is_registered(id));
}

#[tokio::test]
async fn forced_load_report_reaches_the_monitor() {
    let (dispatcher, monitor) = start_dispatcher(DispatcherOptions::default()).await;

    dispatcher.add_connection(MockSocket::new(1)).await.unwrap();
    dispatcher.update_cpu_load(0.55).await;
    dispatcher.publish_load_report().await.unwrap();

    let snapshot = monitor.snapshot_of(dispatcher.id()).await.unwrap();
    assert_eq!(snapshot.cpu_usage, 55);
    assert_eq!(snapshot.connection_count, 1);
}

#[tokio::test]
async fn periodic_load_report_runs_without_being_forced() {
    let (dispatcher, monitor) = start_dispatcher(fast_report_options()).await;

    dispatcher.update_cpu_load(0.4).await;
    // Two report intervals is enough for at least one tick.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = monitor.snapshot_of(dispatcher.id()).await.unwrap();
    assert_eq!(snapshot.cpu_usage, 40);
}

#[tokio::test]
async fn load_score_reflects_metric_updates() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    dispatcher.update_cache_hit_rate(1.0).await;
    let idle = dispatcher.load_score().await;
    dispatcher.update_cpu_load(1.0).await;
    let busy = dispatcher.load_score().await;
    assert!(busy > idle);
}

#[tokio::test]
async fn select_connections_skips_suspended_ones() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    let kept = dispatcher.add_connection(MockSocket::new(1)).await.unwrap();
    let parked = dispatcher.add_connection(MockSocket::new(2)).await.unwrap();
    dispatcher.suspend_connection(parked).await.unwrap();

    let selected = dispatcher.select_connections(10).await.unwrap();
    assert_eq!(selected, vec![kept]);

    dispatcher.resume_connection(parked).await.unwrap();
    let selected = dispatcher.select_connections(10).await.unwrap();
    assert_eq!(selected.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_take_is_reclaimed_by_the_loop() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;
    let id = dispatcher.add_connection(MockSocket::new(3)).await.unwrap();

    // Stall the loop so the take cannot be answered before the caller quits.
    dispatcher
        .post_task(|| std::thread::sleep(Duration::from_millis(100)))
        .await
        .unwrap();

    // Dropping the future drops its responder mid-flight.
    let abandoned = timeout(Duration::from_millis(20), dispatcher.take_connection(id)).await;
    assert!(abandoned.is_err());

    // The loop processes the orphaned take and keeps the connection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dispatcher.connection_count(), 1);
    assert_eq!(dispatcher.select_connections(10).await.unwrap(), vec![id]);
}

#[tokio::test]
async fn commands_after_shutdown_are_rejected() {
    let (dispatcher, _monitor) = start_dispatcher(DispatcherOptions::default()).await;

    assert!(dispatcher.is_running());
    dispatcher.shutdown().await;
    assert!(!dispatcher.is_running());

    let err = dispatcher
        .add_connection(MockSocket::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ReactorError::DispatcherUnavailable(_)));
}
