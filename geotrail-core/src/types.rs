//! Core domain types for geotrail
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **LocationData** | One fix produced by a location provider |
//! | **LocationEvent** | An immutable telemetry event wrapping a fix; its id is the fix id |
//! | **QueuedEvent** | A `LocationEvent` plus queue-only retry bookkeeping |
//! | **Batch** | A bounded, ordered copy of the oldest queued events |
//!
//! Two [`QueuedEvent`] values refer to the same queue entry iff their event ids
//! match; retry metadata is ignored for identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single location fix reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    /// Unique identifier, also the identity of the event carrying it
    pub id: Uuid,
    /// When the fix was taken
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    /// Building floor, when the provider knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<i32>,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Name of the provider that produced this fix
    pub provider: String,
    /// Provider-specific extras
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl LocationData {
    /// Create a fix with a fresh id and the current time.
    pub fn new(latitude: f64, longitude: f64, accuracy: f64, provider: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            latitude,
            longitude,
            floor: None,
            accuracy,
            heading: None,
            speed: None,
            provider: provider.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_floor(mut self, floor: i32) -> Self {
        self.floor = Some(floor);
        self
    }
}

/// Kind of location event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[default]
    Position,
    Enter,
    Exit,
    FloorChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Position => "position",
            EventType::Enter => "enter",
            EventType::Exit => "exit",
            EventType::FloorChange => "floor_change",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "position" => Ok(EventType::Position),
            "enter" => Ok(EventType::Enter),
            "exit" => Ok(EventType::Exit),
            "floor_change" => Ok(EventType::FloorChange),
            _ => Err(format!("unknown event type: {}", s)),
        }
    }
}

/// Immutable telemetry event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationEvent {
    pub location: LocationData,
    #[serde(default)]
    pub event_type: EventType,
}

impl LocationEvent {
    pub fn new(location: LocationData, event_type: EventType) -> Self {
        Self {
            location,
            event_type,
        }
    }

    /// Event identity (the wrapped fix id)
    pub fn id(&self) -> Uuid {
        self.location.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.location.timestamp
    }
}

impl From<LocationData> for LocationEvent {
    fn from(location: LocationData) -> Self {
        Self::new(location, EventType::Position)
    }
}

/// A [`LocationEvent`] as it sits in the event queue.
///
/// Retry metadata is owned by the queue; `retry_count` only ever grows while
/// the entry is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: LocationEvent,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl QueuedEvent {
    pub fn new(event: LocationEvent) -> Self {
        Self {
            event,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_retry_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.event.id()
    }

    /// Record one more failed delivery round.
    pub(crate) fn mark_retried(&mut self, at: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_retry_at = Some(at);
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for QueuedEvent {}
