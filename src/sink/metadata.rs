//! Per-detection metadata publishing.
//!
//! Each detection becomes one expiring hash record keyed
//! `<prefix>:<timestamp_ms>`, followed by one notification per record on the
//! updates channel carrying the record key.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::health::{RecoveryAction, SinkHealth};
use super::store::{MetadataStore, RedisStore};
use crate::config::MetadataSettings;
use crate::detect::Detection;

/// Publish-boundary projection of one detection.
#[derive(Clone, Debug, PartialEq)]
pub struct MetadataRecord {
    pub key: String,
    pub timestamp_ms: u64,
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
    /// Percentage, rounded to two decimals.
    pub confidence_pct: f64,
}

impl MetadataRecord {
    pub fn from_detection(prefix: &str, timestamp_ms: u64, detection: &Detection) -> Self {
        Self {
            key: record_key(prefix, timestamp_ms),
            timestamp_ms,
            center_x: detection.center_x(),
            center_y: detection.center_y(),
            width: detection.width(),
            height: detection.height(),
            confidence_pct: confidence_percent(detection.confidence()),
        }
    }

    /// Hash fields in store order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("timestamp", self.timestamp_ms.to_string()),
            ("center_x", self.center_x.to_string()),
            ("center_y", self.center_y.to_string()),
            ("width", self.width.to_string()),
            ("height", self.height.to_string()),
            ("confidence", self.confidence_pct.to_string()),
        ]
    }

    /// Rebuild a record read back from the store.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self> {
        fn field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
            let raw = fields
                .get(name)
                .ok_or_else(|| anyhow!("record is missing field '{}'", name))?;
            raw.parse()
                .map_err(|_| anyhow!("record field '{}' has invalid value '{}'", name, raw))
        }
        Ok(Self {
            key: key.to_string(),
            timestamp_ms: field(fields, "timestamp")?,
            center_x: field(fields, "center_x")?,
            center_y: field(fields, "center_y")?,
            width: field(fields, "width")?,
            height: field(fields, "height")?,
            confidence_pct: field(fields, "confidence")?,
        })
    }
}

pub fn record_key(prefix: &str, timestamp_ms: u64) -> String {
    format!("{}:{}", prefix, timestamp_ms)
}

/// `conf * 100` rounded to two decimal places.
pub fn confidence_percent(confidence: f32) -> f64 {
    (confidence as f64 * 10_000.0).round() / 100.0
}

/// Extract the record key from an update notification.
///
/// Accepts the bare key or a JSON object with a `key` member.
pub fn parse_notification(payload: &str) -> Option<String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    if payload.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        return value.get("key")?.as_str().map(str::to_string);
    }
    Some(payload.to_string())
}

/// Issues strictly increasing batch base timestamps.
#[derive(Debug, Default)]
pub struct RecordClock {
    last_issued: Option<u64>,
}

impl RecordClock {
    /// Reserve `len` consecutive millisecond slots starting no earlier than
    /// `now_ms` and after every slot issued before.
    pub fn reserve(&mut self, now_ms: u64, len: usize) -> u64 {
        let base = match self.last_issued {
            Some(last) => now_ms.max(last + 1),
            None => now_ms,
        };
        if len > 0 {
            self.last_issued = Some(base + len as u64 - 1);
        }
        base
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Best-effort metadata sink.
///
/// Unreachable at construction means disabled for the life of the process:
/// `publish` returns `false` and nothing is retried. Once connected, the first
/// failure of an episode triggers one reconnect; later failures are absorbed
/// until a publish succeeds again.
pub struct MetadataPublisher {
    store: Option<Box<dyn MetadataStore>>,
    key_prefix: String,
    channel: String,
    ttl: Duration,
    clock: RecordClock,
    health: SinkHealth,
    records_written: u64,
}

impl MetadataPublisher {
    /// Connect to Redis; on failure the publisher is returned disabled.
    pub fn connect(settings: &MetadataSettings) -> Self {
        match RedisStore::connect(settings) {
            Ok(store) => Self::with_store(Box::new(store), settings),
            Err(e) => {
                log::warn!("metadata publishing disabled: {:#}", e);
                Self::disabled(settings)
            }
        }
    }

    /// Use an existing store. A store that fails its ping disables the publisher.
    pub fn with_store(mut store: Box<dyn MetadataStore>, settings: &MetadataSettings) -> Self {
        let mut publisher = Self::disabled(settings);
        match store.ping() {
            Ok(()) => {
                log::info!("metadata publishing to {}", store.describe());
                publisher.health.reset();
                publisher.health.mark_connected();
                publisher.store = Some(store);
            }
            Err(e) => log::warn!(
                "metadata publishing disabled, {} unreachable: {:#}",
                store.describe(),
                e
            ),
        }
        publisher
    }

    pub fn disabled(settings: &MetadataSettings) -> Self {
        let mut health = SinkHealth::new();
        health.disable();
        Self {
            store: None,
            key_prefix: settings.key_prefix.clone(),
            channel: settings.channel.clone(),
            ttl: settings.ttl,
            clock: RecordClock::default(),
            health,
            records_written: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn health(&self) -> &SinkHealth {
        &self.health
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Write one record per detection, then one notification per record.
    ///
    /// Returns `true` only if every write and notification succeeded.
    pub fn publish(&mut self, detections: &[Detection]) -> bool {
        self.publish_at(now_ms(), detections)
    }

    fn publish_at(&mut self, now_ms: u64, detections: &[Detection]) -> bool {
        let Some(store) = self.store.as_mut() else {
            return false;
        };
        if detections.is_empty() {
            return true;
        }

        let base = self.clock.reserve(now_ms, detections.len());
        let records: Vec<MetadataRecord> = detections
            .iter()
            .enumerate()
            .map(|(i, det)| MetadataRecord::from_detection(&self.key_prefix, base + i as u64, det))
            .collect();

        let mut written = Vec::with_capacity(records.len());
        for record in &records {
            match store.write_record(&record.key, &record.fields(), self.ttl) {
                Ok(()) => written.push(&record.key),
                Err(e) => {
                    log::warn!("metadata write failed: {:#}", e);
                    recover(store.as_mut(), &mut self.health);
                    return false;
                }
            }
        }
        self.records_written += written.len() as u64;

        for key in written {
            if let Err(e) = store.notify(&self.channel, key) {
                log::warn!("metadata notification failed: {:#}", e);
                recover(store.as_mut(), &mut self.health);
                return false;
            }
        }

        self.health.record_success();
        true
    }

    /// Live records under this publisher's prefix; 0 on any error.
    pub fn count(&mut self) -> u64 {
        let pattern = format!("{}:*", self.key_prefix);
        match self.store.as_mut() {
            Some(store) => store.count_matching(&pattern).unwrap_or_else(|e| {
                log::debug!("metadata count failed: {:#}", e);
                0
            }),
            None => 0,
        }
    }
}

fn recover(store: &mut dyn MetadataStore, health: &mut SinkHealth) {
    match health.record_failure() {
        RecoveryAction::Restart => match store.reconnect() {
            Ok(()) => {
                log::info!("metadata store reconnected to {}", store.describe());
                health.mark_connected();
            }
            Err(e) => log::warn!("metadata store reconnect failed: {:#}", e),
        },
        RecoveryAction::Absorb => {}
    }
}
