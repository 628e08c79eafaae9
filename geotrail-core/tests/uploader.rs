//! Integration tests for the batch uploader
//!
//! Backoff timing runs on paused Tokio time, so delays are exact and the
//! tests do not actually sleep.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fill, sync_settings, MockTransport};
use geotrail_core::config::{QueueSettings, SyncSettings};
use geotrail_core::{
    BatchUploader, EventQueue, FixedNetwork, MemoryStore, NetworkStatus, NoToken, StaticToken,
    TokenProvider, UploaderState,
};

const ENDPOINT: &str = "https://telemetry.test/api/v1/events/batch";

struct Harness {
    queue: Arc<EventQueue>,
    transport: Arc<MockTransport>,
    uploader: BatchUploader,
}

fn harness_with(
    settings: SyncSettings,
    network: FixedNetwork,
    transport: Arc<MockTransport>,
    tokens: Arc<dyn TokenProvider>,
) -> Harness {
    geotrail_core::logging::init_test();
    let queue = Arc::new(EventQueue::open(
        Arc::new(MemoryStore::new()),
        &QueueSettings::default(),
    ));
    let network: Arc<dyn NetworkStatus> = Arc::new(network);
    let uploader = BatchUploader::spawn(
        queue.clone(),
        transport.clone(),
        network,
        tokens,
        ENDPOINT.to_string(),
        settings,
    );
    Harness {
        queue,
        transport,
        uploader,
    }
}

fn harness(settings: SyncSettings, transport: Arc<MockTransport>) -> Harness {
    harness_with(settings, FixedNetwork::WIFI, transport, Arc::new(NoToken))
}

/// Gaps between sends, allowing for the timer wheel's millisecond rounding
fn assert_gaps(calls: &[common::SendCall], expected: &[u64]) {
    let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].at - w[0].at).collect();
    assert_eq!(gaps.len(), expected.len());
    for (gap, secs) in gaps.iter().zip(expected) {
        let want = Duration::from_secs(*secs);
        assert!(
            *gap >= want && *gap < want + Duration::from_millis(10),
            "gap {:?}, expected {:?}",
            gap,
            want
        );
    }
}

// ============================================
// Retry and Backoff
// ============================================

#[tokio::test(start_paused = true)]
async fn test_fail_then_succeed_retries_with_backoff() {
    let h = harness(sync_settings(50, 3, 2.0), MockTransport::failing_then_ok(2));
    fill(&h.queue, 10);

    let stats = h.uploader.sync_until_idle().await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 3, "k failures then one success");
    assert!(calls.iter().all(|c| c.ids == calls[0].ids), "same batch every attempt");

    assert_gaps(&calls, &[1, 2]);

    assert_eq!(h.queue.count(), 0);
    assert_eq!(stats.send_attempts, 3);
    assert_eq!(stats.send_failures, 2);
    assert_eq!(stats.batches_uploaded, 1);
    assert_eq!(stats.events_uploaded, 10);
    assert_eq!(stats.batches_exhausted, 0);
    assert_eq!(h.uploader.status().state, UploaderState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_batch_is_deferred() {
    let h = harness(sync_settings(50, 3, 2.0), MockTransport::failing());
    fill(&h.queue, 5);

    let stats = h.uploader.sync_until_idle().await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 4, "first attempt plus max_retry_attempts retries");
    assert_gaps(&calls, &[1, 2, 4]);

    let remaining = h.queue.dequeue_batch(50);
    assert_eq!(remaining.len(), 5);
    assert!(remaining.iter().all(|e| e.retry_count == 1));
    assert!(remaining.iter().all(|e| e.last_retry_at.is_some()));

    assert_eq!(stats.batches_exhausted, 1);
    assert_eq!(stats.send_failures, 4);
    assert!(stats.last_error.as_deref().unwrap().contains("503"));
    assert_eq!(h.uploader.status().state, UploaderState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_defers_after_one_attempt() {
    let h = harness(sync_settings(50, 0, 2.0), MockTransport::failing());
    fill(&h.queue, 3);

    h.uploader.sync_until_idle().await;

    assert_eq!(h.transport.call_count(), 1);
    assert!(h.queue.dequeue_batch(10).iter().all(|e| e.retry_count == 1));
}

#[tokio::test(start_paused = true)]
async fn test_deferred_batch_is_resent_next_cycle() {
    let h = harness(sync_settings(50, 1, 2.0), MockTransport::failing());
    fill(&h.queue, 4);

    h.uploader.sync_until_idle().await;
    h.uploader.sync_until_idle().await;
    assert!(h.queue.dequeue_batch(10).iter().all(|e| e.retry_count == 2));

    h.transport.set_ok(true);
    let stats = h.uploader.sync_until_idle().await;

    assert_eq!(h.queue.count(), 0);
    assert_eq!(stats.batches_exhausted, 2);
    assert_eq!(stats.batches_uploaded, 1);
}

// ============================================
// Single Flight and Draining
// ============================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_triggers_send_once() {
    let h = harness(
        sync_settings(50, 3, 2.0),
        MockTransport::slow(Duration::from_millis(200)),
    );
    fill(&h.queue, 10);

    for _ in 0..20 {
        h.uploader.sync_now();
    }
    let stats = h.uploader.sync_until_idle().await;

    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.transport.max_concurrent(), 1);
    assert_eq!(stats.cycles, 1);
    assert!(stats.triggers_skipped >= 20);
    assert_eq!(h.queue.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_drains_queue_batch_by_batch() {
    let h = harness(sync_settings(50, 3, 2.0), MockTransport::succeeding());
    h.transport.observe(h.queue.clone());
    fill(&h.queue, 120);

    let stats = h.uploader.sync_until_idle().await;

    assert_eq!(h.transport.batch_sizes(), vec![50, 50, 20]);
    let seen: Vec<Option<usize>> = h.transport.calls().iter().map(|c| c.queue_len).collect();
    assert_eq!(seen, vec![Some(120), Some(70), Some(20)]);
    assert_eq!(h.queue.count(), 0);
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.events_uploaded, 120);
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_fifo() {
    let h = harness(sync_settings(4, 3, 2.0), MockTransport::succeeding());
    let events = fill(&h.queue, 10);

    h.uploader.sync_until_idle().await;

    let sent: Vec<_> = h.transport.calls().into_iter().flat_map(|c| c.ids).collect();
    let expected: Vec<_> = events.iter().map(|e| e.id()).collect();
    assert_eq!(sent, expected);
}

#[tokio::test(start_paused = true)]
async fn test_empty_queue_is_noop() {
    let h = harness(sync_settings(50, 3, 2.0), MockTransport::succeeding());

    let stats = h.uploader.sync_until_idle().await;

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(stats.cycles, 0);
}

// ============================================
// Entry Guard
// ============================================

#[tokio::test(start_paused = true)]
async fn test_unreachable_network_skips_sync() {
    let h = harness_with(
        sync_settings(50, 3, 2.0),
        FixedNetwork::OFFLINE,
        MockTransport::succeeding(),
        Arc::new(NoToken),
    );
    fill(&h.queue, 5);

    let stats = h.uploader.sync_until_idle().await;

    assert_eq!(h.transport.call_count(), 0);
    assert_eq!(stats.triggers_skipped, 1);
    assert_eq!(h.queue.count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_wifi_only_sync() {
    let settings = SyncSettings {
        wifi_only_sync: true,
        ..sync_settings(50, 3, 2.0)
    };

    let cellular = harness_with(
        settings.clone(),
        FixedNetwork::CELLULAR,
        MockTransport::succeeding(),
        Arc::new(NoToken),
    );
    fill(&cellular.queue, 5);
    cellular.uploader.sync_until_idle().await;
    assert_eq!(cellular.transport.call_count(), 0);
    assert_eq!(cellular.queue.count(), 5);

    let wifi = harness_with(
        settings,
        FixedNetwork::WIFI,
        MockTransport::succeeding(),
        Arc::new(NoToken),
    );
    fill(&wifi.queue, 5);
    wifi.uploader.sync_until_idle().await;
    assert_eq!(wifi.transport.call_count(), 1);
    assert_eq!(wifi.queue.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_token_and_compression_passed_to_transport() {
    let settings = SyncSettings {
        compression_enabled: false,
        ..sync_settings(50, 3, 2.0)
    };
    let h = harness_with(
        settings,
        FixedNetwork::WIFI,
        MockTransport::failing_then_ok(1),
        Arc::new(StaticToken::new("tok-1")),
    );
    fill(&h.queue, 2);

    h.uploader.sync_until_idle().await;

    let calls = h.transport.calls();
    assert_eq!(calls.len(), 2);
    for call in calls {
        assert_eq!(call.auth_token.as_deref(), Some("tok-1"));
        assert!(!call.compressed);
    }
}

// ============================================
// Shutdown
// ============================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_backoff() {
    let h = harness(sync_settings(50, 3, 2.0), MockTransport::failing());
    fill(&h.queue, 3);

    let mut status = h.uploader.subscribe();
    h.uploader.sync_now();
    status
        .wait_for(|s| matches!(s.state, UploaderState::WaitingToRetry { .. }))
        .await
        .unwrap();

    h.uploader.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.transport.call_count(), 1);
    assert!(h.queue.dequeue_batch(10).iter().all(|e| e.retry_count == 1));
    assert_eq!(h.uploader.status().state, UploaderState::Stopped);

    // Triggers after shutdown are ignored
    h.uploader.sync_now();
    let stats = h.uploader.sync_until_idle().await;
    assert_eq!(stats.send_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_lets_in_flight_send_finish_without_cascade() {
    let h = harness(
        sync_settings(50, 3, 2.0),
        MockTransport::slow(Duration::from_secs(1)),
    );
    fill(&h.queue, 70);

    let mut status = h.uploader.subscribe();
    h.uploader.sync_now();
    status
        .wait_for(|s| matches!(s.state, UploaderState::Uploading { .. }))
        .await
        .unwrap();

    h.uploader.shutdown().await;

    assert_eq!(h.transport.call_count(), 1);
    assert_eq!(h.queue.count(), 20);
    let status = h.uploader.status();
    assert_eq!(status.state, UploaderState::Stopped);
    assert_eq!(status.stats.batches_uploaded, 1);
}
