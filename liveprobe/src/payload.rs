// Snapshot payload assembly
//
// Builds the wire shape for accepted probe hits, enforces the encoded-size
// cap and coalesces payloads into batched JSON arrays for the transport.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::warn;

use crate::capture::CapturedValue;
use crate::config::ProbeLocation;
use crate::session::StackFrame;

/// Fixed explanation set on snapshots whose captures were dropped.
pub const SNAPSHOT_TOO_LARGE: &str =
    "Snapshot exceeded the maximum upload size and its captured state was discarded";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineCapture {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locals: Option<IndexMap<String, CapturedValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<IndexMap<String, CapturedValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_expressions: Option<IndexMap<String, CapturedValue>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Captures {
    pub lines: IndexMap<String, LineCapture>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationErrorEntry {
    pub expr: String,
    pub message: String,
}

/// Probe location in output form: `file`, not the input's `sourceFile`.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLocation {
    pub file: String,
    pub lines: Vec<u32>,
}

impl From<&ProbeLocation> for SnapshotLocation {
    fn from(location: &ProbeLocation) -> Self {
        SnapshotLocation { file: location.source_file.clone(), lines: location.lines.clone() }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSnapshotRef {
    pub id: String,
    pub version: u32,
    pub location: SnapshotLocation,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub probe: ProbeSnapshotRef,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captures: Option<Captures>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evaluation_errors: Vec<EvaluationErrorEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_error: Option<String>,
}

// Field names are the wire names here; the logger block uses snake_case.
#[derive(Debug, Clone, Serialize)]
pub struct LoggerInfo {
    pub name: String,
    pub method: String,
    pub version: String,
    pub thread_name: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct SnapshotEnvelope {
    snapshot: Snapshot,
}

/// Wire shape of one accepted probe hit.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPayload {
    pub ddsource: &'static str,
    pub hostname: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub logger: LoggerInfo,
    debugger: SnapshotEnvelope,
}

impl SnapshotPayload {
    pub fn new(
        hostname: &str,
        service: &str,
        message: Option<String>,
        logger: LoggerInfo,
        snapshot: Snapshot,
    ) -> Self {
        SnapshotPayload {
            ddsource: "dd_debugger",
            hostname: hostname.to_string(),
            service: service.to_string(),
            message,
            logger,
            debugger: SnapshotEnvelope { snapshot },
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.debugger.snapshot
    }

    /// Encode for transport. Snapshots above `max_bytes` lose their whole
    /// `captures` field and carry `captureError` instead; the independently
    /// rendered message is unaffected.
    pub fn encode(mut self, max_bytes: usize) -> String {
        let encoded = serde_json::to_string(&self).unwrap();
        if encoded.len() <= max_bytes {
            return encoded;
        }
        warn!(
            probe_id = %self.debugger.snapshot.probe.id,
            bytes = encoded.len(),
            "snapshot too large, discarding captures"
        );
        self.debugger.snapshot.captures = None;
        self.debugger.snapshot.capture_error = Some(SNAPSHOT_TOO_LARGE.to_string());
        serde_json::to_string(&self).unwrap()
    }
}

/// Coalesces encoded payloads into one outbound JSON array. A batch becomes
/// due when its encoded size crosses the threshold or its oldest entry has
/// waited out the flush interval.
#[derive(Debug)]
pub struct JsonBatcher {
    entries: Vec<String>,
    bytes: usize,
    max_bytes: usize,
    flush_interval: Duration,
    oldest: Option<Instant>,
}

impl JsonBatcher {
    pub fn new(max_bytes: usize, flush_interval: Duration) -> Self {
        JsonBatcher { entries: Vec::new(), bytes: 0, max_bytes, flush_interval, oldest: None }
    }

    /// Buffer one encoded payload. Returns a full batch when the size
    /// threshold is crossed.
    pub fn push(&mut self, encoded: String, now: Instant) -> Option<String> {
        self.bytes += encoded.len();
        self.entries.push(encoded);
        self.oldest.get_or_insert(now);
        if self.bytes >= self.max_bytes {
            return self.take();
        }
        None
    }

    /// Returns the pending batch when the flush timer elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<String> {
        let oldest = self.oldest?;
        if now.saturating_duration_since(oldest) >= self.flush_interval {
            self.take()
        } else {
            None
        }
    }

    /// Unconditionally drain whatever is buffered.
    pub fn take(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let batch = format!("[{}]", self.entries.join(","));
        self.entries.clear();
        self.bytes = 0;
        self.oldest = None;
        Some(batch)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

// Simple process-unique id generation for snapshots and runtime identity.
pub mod ids {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(1);

    pub fn generate() -> String {
        let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = super::epoch_millis();
        format!("{timestamp:x}-{counter:x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{CapturedValue, NotCapturedReason};

    fn snapshot(captures: Option<Captures>) -> Snapshot {
        Snapshot {
            id: ids::generate(),
            timestamp: epoch_millis(),
            probe: ProbeSnapshotRef {
                id: "probe-1".to_string(),
                version: 1,
                location: SnapshotLocation { file: "app.js".to_string(), lines: vec![10] },
            },
            stack: vec![StackFrame {
                function: "handler".to_string(),
                file_name: "app.js".to_string(),
                line_number: 10,
                column_number: 3,
            }],
            captures,
            evaluation_errors: Vec::new(),
            capture_error: None,
        }
    }

    fn logger() -> LoggerInfo {
        LoggerInfo {
            name: "app.js".to_string(),
            method: "handler".to_string(),
            version: "0.1.0".to_string(),
            thread_name: "main".to_string(),
            thread_id: "pid:1".to_string(),
        }
    }

    fn payload(captures: Option<Captures>) -> SnapshotPayload {
        SnapshotPayload::new(
            "host-1",
            "svc",
            Some("Hello World!".to_string()),
            logger(),
            snapshot(captures),
        )
    }

    #[test]
    fn test_wire_shape() {
        let mut locals = IndexMap::new();
        locals.insert(
            "x".to_string(),
            CapturedValue::not_captured("Object", NotCapturedReason::Depth),
        );
        let mut lines = IndexMap::new();
        lines.insert(
            "10".to_string(),
            LineCapture { locals: Some(locals), arguments: None, capture_expressions: None },
        );

        let encoded = payload(Some(Captures { lines })).encode(1024 * 1024);
        let json: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(json["ddsource"], "dd_debugger");
        assert_eq!(json["hostname"], "host-1");
        assert_eq!(json["message"], "Hello World!");
        assert_eq!(json["logger"]["thread_id"], "pid:1");
        let snapshot = &json["debugger"]["snapshot"];
        assert_eq!(snapshot["probe"]["id"], "probe-1");
        assert_eq!(snapshot["probe"]["location"]["file"], "app.js");
        assert_eq!(
            snapshot["captures"]["lines"]["10"]["locals"]["x"]["notCapturedReason"],
            "depth"
        );
        assert_eq!(snapshot["stack"][0]["fileName"], "app.js");
    }

    #[test]
    fn test_oversized_snapshot_drops_captures_keeps_message() {
        let mut locals = IndexMap::new();
        for i in 0..100 {
            locals.insert(
                format!("var{i}"),
                CapturedValue::not_captured("Object", NotCapturedReason::Depth),
            );
        }
        let mut lines = IndexMap::new();
        lines.insert(
            "10".to_string(),
            LineCapture { locals: Some(locals), arguments: None, capture_expressions: None },
        );

        let encoded = payload(Some(Captures { lines })).encode(512);
        let json: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        let snapshot = &json["debugger"]["snapshot"];
        assert!(snapshot.get("captures").is_none());
        assert_eq!(snapshot["captureError"], SNAPSHOT_TOO_LARGE);
        assert_eq!(json["message"], "Hello World!");
    }

    #[test]
    fn test_batcher_flushes_on_size() {
        let now = Instant::now();
        let mut batcher = JsonBatcher::new(32, Duration::from_secs(1));

        assert!(batcher.push("{\"a\":1}".to_string(), now).is_none());
        let batch = batcher.push("{\"b\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}".to_string(), now).unwrap();
        assert_eq!(batch, "[{\"a\":1},{\"b\":\"xxxxxxxxxxxxxxxxxxxxxxxx\"}]");
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_batcher_flushes_on_timer() {
        let now = Instant::now();
        let mut batcher = JsonBatcher::new(1024 * 1024, Duration::from_millis(100));

        batcher.push("{\"a\":1}".to_string(), now);
        assert!(batcher.take_due(now + Duration::from_millis(50)).is_none());
        let batch = batcher.take_due(now + Duration::from_millis(150)).unwrap();
        assert_eq!(batch, "[{\"a\":1}]");
        assert!(batcher.take_due(now + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ids::generate();
        let b = ids::generate();
        assert_ne!(a, b);
    }
}
