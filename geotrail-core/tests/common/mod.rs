//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use geotrail_core::config::SyncSettings;
use geotrail_core::{
    EventQueue, LocationData, LocationEvent, QueuedEvent, Transport, TransportError,
};
use tokio::time::Instant;
use uuid::Uuid;

/// One recorded `Transport::send` call
#[derive(Debug, Clone)]
pub struct SendCall {
    pub at: Instant,
    pub ids: Vec<Uuid>,
    pub auth_token: Option<String>,
    pub compressed: bool,
    /// Queue length when the send started, if a queue is being observed
    pub queue_len: Option<usize>,
}

/// Transport that answers from a script and records every call.
///
/// Scripted outcomes are consumed first; after that every send returns the
/// fallback outcome.
pub struct MockTransport {
    script: Mutex<VecDeque<bool>>,
    fallback_ok: Mutex<bool>,
    latency: Duration,
    calls: Mutex<Vec<SendCall>>,
    observed: Mutex<Option<Arc<EventQueue>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockTransport {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::with(Vec::new(), true, Duration::ZERO))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::with(Vec::new(), false, Duration::ZERO))
    }

    /// Fail `failures` times, then succeed
    pub fn failing_then_ok(failures: usize) -> Arc<Self> {
        Arc::new(Self::with(vec![false; failures], true, Duration::ZERO))
    }

    pub fn slow(latency: Duration) -> Arc<Self> {
        Arc::new(Self::with(Vec::new(), true, latency))
    }

    fn with(script: Vec<bool>, fallback_ok: bool, latency: Duration) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback_ok: Mutex::new(fallback_ok),
            latency,
            calls: Mutex::new(Vec::new()),
            observed: Mutex::new(None),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Record the queue length at the start of every send
    pub fn observe(&self, queue: Arc<EventQueue>) {
        *self.observed.lock().unwrap() = Some(queue);
    }

    pub fn set_ok(&self, ok: bool) {
        *self.fallback_ok.lock().unwrap() = ok;
    }

    pub fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls().iter().map(|c| c.ids.len()).collect()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        batch: &[QueuedEvent],
        _endpoint: &str,
        auth_token: Option<&str>,
        compressed: bool,
    ) -> Result<(), TransportError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let queue_len = self.observed.lock().unwrap().as_ref().map(|q| q.count());
        self.calls.lock().unwrap().push(SendCall {
            at: Instant::now(),
            ids: batch.iter().map(QueuedEvent::id).collect(),
            auth_token: auth_token.map(str::to_string),
            compressed,
            queue_len,
        });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let ok = match self.script.lock().unwrap().pop_front() {
            Some(ok) => ok,
            None => *self.fallback_ok.lock().unwrap(),
        };
        self.active.fetch_sub(1, Ordering::SeqCst);

        if ok {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: 503,
                body: "unavailable".to_string(),
            })
        }
    }
}

pub fn make_events(count: usize) -> Vec<LocationEvent> {
    (0..count)
        .map(|i| {
            LocationEvent::from(LocationData::new(
                51.5 + i as f64 * 0.0001,
                -0.12,
                6.0,
                "core_location",
            ))
        })
        .collect()
}

pub fn fill(queue: &EventQueue, count: usize) -> Vec<LocationEvent> {
    let events = make_events(count);
    for event in &events {
        assert!(queue.enqueue(event.clone()));
    }
    events
}

pub fn sync_settings(batch_size: usize, max_retry_attempts: u32, multiplier: f64) -> SyncSettings {
    SyncSettings {
        batch_size,
        max_retry_attempts,
        retry_backoff_multiplier: multiplier,
        ..Default::default()
    }
}
