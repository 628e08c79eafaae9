//! Integration tests for the pipeline coordinator and its sync triggers

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{make_events, MockTransport};
use geotrail_core::{
    Config, EventType, InterfaceKind, LifecycleTransition, LocationData, ManualPathSource,
    MemoryStore, NetworkPath, NoToken, Pipeline, PipelineParts, UploaderStatus,
};

struct Harness {
    pipeline: Pipeline,
    paths: Arc<ManualPathSource>,
    store: Arc<MemoryStore>,
    transport: Arc<MockTransport>,
}

fn harness(config: Config, initial: NetworkPath) -> Harness {
    geotrail_core::logging::init_test();
    let paths = Arc::new(ManualPathSource::new(initial));
    let store = Arc::new(MemoryStore::new());
    let transport = MockTransport::succeeding();

    let pipeline = Pipeline::new(PipelineParts {
        config,
        store: store.clone(),
        transport: transport.clone(),
        paths: paths.clone(),
        tokens: Arc::new(NoToken),
    })
    .unwrap();

    Harness {
        pipeline,
        paths,
        store,
        transport,
    }
}

fn wifi() -> NetworkPath {
    NetworkPath::satisfied(vec![InterfaceKind::Wifi])
}

/// Start the pipeline and let the initial reachability edge run its course
async fn start_settled(pipeline: &Pipeline) {
    pipeline.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pipeline.sync_until_idle().await;
}

async fn wait_for_status(pipeline: &Pipeline, predicate: impl FnMut(&UploaderStatus) -> bool) {
    let mut status = pipeline.uploader().subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(predicate))
        .await
        .expect("uploader status never matched")
        .unwrap();
}

// ============================================
// Construction
// ============================================

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = Config::default();
    config.sync.batch_size = 0;

    let result = Pipeline::new(PipelineParts {
        config,
        store: Arc::new(MemoryStore::new()),
        transport: MockTransport::succeeding(),
        paths: Arc::new(ManualPathSource::default()),
        tokens: Arc::new(NoToken),
    });

    assert!(result.is_err());
}

#[tokio::test]
async fn test_enqueue_and_count() {
    let h = harness(Config::default(), NetworkPath::unsatisfied());

    let location = LocationData::new(48.85, 2.35, 4.0, "google_maps").with_floor(2);
    assert!(h.pipeline.enqueue(location.clone(), EventType::Enter));
    assert!(!h.pipeline.enqueue(location, EventType::Exit));
    for event in make_events(3) {
        h.pipeline.enqueue_event(event);
    }

    assert_eq!(h.pipeline.count(), 4);
    let head = &h.pipeline.queue().entries()[0];
    assert_eq!(head.event.event_type, EventType::Enter);
    assert_eq!(head.event.location.floor, Some(2));
}

#[tokio::test]
async fn test_nothing_syncs_before_start() {
    let h = harness(Config::default(), wifi());
    for event in make_events(3) {
        h.pipeline.enqueue_event(event);
    }

    // The monitor only classifies the path once started
    let stats = h.pipeline.sync_until_idle().await;

    assert_eq!(stats.triggers_skipped, 1);
    assert_eq!(h.transport.call_count(), 0);
}

// ============================================
// Triggers
// ============================================

#[tokio::test]
async fn test_reachable_edge_triggers_sync() {
    let h = harness(Config::default(), NetworkPath::unsatisfied());
    h.pipeline.start();
    for event in make_events(5) {
        h.pipeline.enqueue_event(event);
    }
    assert_eq!(h.transport.call_count(), 0);

    h.paths.set(wifi());
    wait_for_status(&h.pipeline, |s| s.stats.batches_uploaded == 1).await;

    assert_eq!(h.pipeline.count(), 0);
    assert!(h.pipeline.monitor().is_wifi());
}

#[tokio::test]
async fn test_unreachable_edge_does_not_sync() {
    let h = harness(Config::default(), wifi());
    start_settled(&h.pipeline).await;

    for event in make_events(5) {
        h.pipeline.enqueue_event(event);
    }
    h.paths.set(NetworkPath::unsatisfied());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.transport.call_count(), 0);
    assert!(!h.pipeline.monitor().is_reachable());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_tick_triggers_sync() {
    let mut config = Config::default();
    config.sync.sync_interval_secs = 30.0;
    let h = harness(config, wifi());

    // The initial reachable edge finds an empty queue
    start_settled(&h.pipeline).await;
    for event in make_events(3) {
        h.pipeline.enqueue_event(event);
    }

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.transport.call_count(), 0, "first tick is one full interval away");

    tokio::time::sleep(Duration::from_secs(2)).await;
    wait_for_status(&h.pipeline, |s| s.stats.batches_uploaded == 1).await;
    assert_eq!(h.pipeline.count(), 0);

    for event in make_events(2) {
        h.pipeline.enqueue_event(event);
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    wait_for_status(&h.pipeline, |s| s.stats.batches_uploaded == 2).await;
}

#[tokio::test(start_paused = true)]
async fn test_nothing_syncs_after_shutdown() {
    let h = harness(Config::default(), wifi());
    // A second start is a no-op
    h.pipeline.start();
    start_settled(&h.pipeline).await;

    h.pipeline.shutdown().await;
    for event in make_events(3) {
        h.pipeline.enqueue_event(event);
    }
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(h.pipeline.count(), 3);
}

// ============================================
// Lifecycle
// ============================================

#[tokio::test]
async fn test_background_persists_and_syncs() {
    let h = harness(Config::default(), NetworkPath::unsatisfied());
    h.pipeline.start();
    for event in make_events(4) {
        h.pipeline.enqueue_event(event);
    }

    h.pipeline.handle_lifecycle(LifecycleTransition::Background);
    h.pipeline.queue().wait_persisted().await;

    assert_eq!(h.store.snapshot().unwrap().len(), 4);
    // The sync request reached the uploader and was turned away offline
    wait_for_status(&h.pipeline, |s| s.stats.triggers_skipped == 1).await;
}

#[tokio::test]
async fn test_foreground_syncs_when_online() {
    let h = harness(Config::default(), wifi());
    start_settled(&h.pipeline).await;
    for event in make_events(4) {
        h.pipeline.enqueue_event(event);
    }

    h.pipeline.handle_lifecycle(LifecycleTransition::Foreground);

    wait_for_status(&h.pipeline, |s| s.stats.batches_uploaded == 1).await;
    assert_eq!(h.pipeline.count(), 0);
}

#[tokio::test]
async fn test_terminate_persists_without_sync() {
    let h = harness(Config::default(), wifi());
    start_settled(&h.pipeline).await;
    let before = h.pipeline.status().stats;

    for event in make_events(4) {
        h.pipeline.enqueue_event(event);
    }
    h.pipeline.handle_lifecycle(LifecycleTransition::Terminate);
    h.pipeline.queue().wait_persisted().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.store.snapshot().unwrap().len(), 4);
    assert_eq!(h.pipeline.status().stats, before);
    assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test]
async fn test_shutdown_persists_pending_events() {
    let h = harness(Config::default(), NetworkPath::unsatisfied());
    h.pipeline.start();
    for event in make_events(7) {
        h.pipeline.enqueue_event(event);
    }

    h.pipeline.shutdown().await;

    assert_eq!(h.store.snapshot().unwrap().len(), 7);
    assert!(!h.pipeline.monitor().is_monitoring());
}
