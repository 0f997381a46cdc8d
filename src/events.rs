//! Typed event bus (C9). The original untyped `snapshot:captured /
//! stored / failed` publish/subscribe is reshaped into three statically
//! typed broadcast channels, per the design note on dynamic event emitters.

use crate::errors::FailureStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCapturedEvent {
    pub session_id: String,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub remote: String,
    pub local_path: String,
    pub captured_at: DateTime<Utc>,
    pub tz_offset_hours: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStoredEvent {
    pub captured: SnapshotCapturedEvent,
    pub storage: String,
    pub stored_uri: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFailedEvent {
    pub session_id: String,
    pub device_id: String,
    pub payload_id: Option<String>,
    pub remote: String,
    pub stage: FailureStage,
    pub error: String,
}

/// Three independent broadcast channels, one per event variant, so
/// publishers and subscribers are wired statically instead of through a
/// string-keyed topic name.
#[derive(Clone)]
pub struct EventBus {
    captured_tx: broadcast::Sender<SnapshotCapturedEvent>,
    stored_tx: broadcast::Sender<SnapshotStoredEvent>,
    failed_tx: broadcast::Sender<SnapshotFailedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (captured_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (stored_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (failed_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            captured_tx,
            stored_tx,
            failed_tx,
        }
    }

    /// Publishing is non-blocking: a full or subscriber-less channel just
    /// drops the send rather than stalling the publisher.
    pub fn publish_captured(&self, event: SnapshotCapturedEvent) {
        let _ = self.captured_tx.send(event);
    }

    pub fn publish_stored(&self, event: SnapshotStoredEvent) {
        let _ = self.stored_tx.send(event);
    }

    pub fn publish_failed(&self, event: SnapshotFailedEvent) {
        let _ = self.failed_tx.send(event);
    }

    pub fn subscribe_captured(&self) -> broadcast::Receiver<SnapshotCapturedEvent> {
        self.captured_tx.subscribe()
    }

    pub fn subscribe_stored(&self) -> broadcast::Receiver<SnapshotStoredEvent> {
        self.stored_tx.subscribe()
    }

    pub fn subscribe_failed(&self) -> broadcast::Receiver<SnapshotFailedEvent> {
        self.failed_tx.subscribe()
    }
}

/// Derive the `YYYY-MM-DD` day bucket for `captured_at`, shifted by
/// `tz_offset_hours` when device-TZ bucketing is enabled. An out-of-range or
/// absent offset is treated as UTC (`0`), per the day-computation invariant.
pub fn day_bucket(captured_at: DateTime<Utc>, tz_offset_hours: Option<i32>, use_device_tz: bool) -> String {
    let offset = if use_device_tz {
        tz_offset_hours
            .filter(|h| (-12..=14).contains(h))
            .unwrap_or(0)
    } else {
        0
    };

    let shifted = captured_at + chrono::Duration::hours(offset as i64);
    shifted.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_bucket_uses_utc_when_device_tz_disabled() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();
        assert_eq!(day_bucket(ts, Some(10), false), "2026-07-31");
    }

    #[test]
    fn day_bucket_shifts_by_device_tz_when_enabled() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();
        assert_eq!(day_bucket(ts, Some(10), true), "2026-08-01");
    }

    #[test]
    fn out_of_range_offset_treated_as_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();
        assert_eq!(day_bucket(ts, Some(15), true), "2026-07-31");
        assert_eq!(day_bucket(ts, Some(-13), true), "2026-07-31");
    }

    #[test]
    fn missing_offset_treated_as_utc() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 31, 23, 30, 0).unwrap();
        assert_eq!(day_bucket(ts, None, true), "2026-07-31");
    }

    #[test]
    fn day_bucket_is_idempotent() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap();
        let a = day_bucket(ts, Some(3), true);
        let b = day_bucket(ts, Some(3), true);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn captured_events_are_delivered_to_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_captured();

        bus.publish_captured(SnapshotCapturedEvent {
            session_id: "abc".to_string(),
            device_id: "devA".to_string(),
            payload_id: None,
            remote: "127.0.0.1:1234".to_string(),
            local_path: "/tmp/snap.jpg".to_string(),
            captured_at: Utc::now(),
            tz_offset_hours: None,
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.device_id, "devA");
    }
}
