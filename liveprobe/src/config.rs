// Probe configuration and process-level settings
//
// Deserializes remotely delivered probe definitions and holds the knobs an
// embedding process configures the engine with. Limit resolution follows a
// per-dimension fallback chain: expression override, probe override, process
// default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, ProbeResult};

pub const DEFAULT_MAX_REFERENCE_DEPTH: u32 = 3;
pub const DEFAULT_MAX_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_MAX_FIELD_COUNT: usize = 20;
pub const DEFAULT_MAX_LENGTH: usize = 255;

/// Fully resolved capture limits, all fallbacks already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureLimits {
    pub max_reference_depth: u32,
    pub max_collection_size: usize,
    pub max_field_count: usize,
    pub max_length: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            max_reference_depth: DEFAULT_MAX_REFERENCE_DEPTH,
            max_collection_size: DEFAULT_MAX_COLLECTION_SIZE,
            max_field_count: DEFAULT_MAX_FIELD_COUNT,
            max_length: DEFAULT_MAX_LENGTH,
        }
    }
}

/// Partial limit overrides as they appear in probe configuration. Each unset
/// dimension falls back independently to the next level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureLimitsOverride {
    pub max_reference_depth: Option<u32>,
    pub max_collection_size: Option<usize>,
    pub max_field_count: Option<usize>,
    pub max_length: Option<usize>,
}

impl CaptureLimitsOverride {
    pub fn resolve(&self, fallback: CaptureLimits) -> CaptureLimits {
        CaptureLimits {
            max_reference_depth: self.max_reference_depth.unwrap_or(fallback.max_reference_depth),
            max_collection_size: self.max_collection_size.unwrap_or(fallback.max_collection_size),
            max_field_count: self.max_field_count.unwrap_or(fallback.max_field_count),
            max_length: self.max_length.unwrap_or(fallback.max_length),
        }
    }
}

/// Source location a probe targets. The first listed line is the one that is
/// instrumented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeLocation {
    pub source_file: String,
    pub lines: Vec<u32>,
}

/// An expression in both its human-readable and compiled-input forms.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpressionConfig {
    pub dsl: String,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureExpressionConfig {
    pub name: String,
    pub expr: ExpressionConfig,
    pub capture: Option<CaptureLimitsOverride>,
}

/// One template segment: either a literal string or an expression to render.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SegmentConfig {
    Literal { str: String },
    Expression { dsl: String, json: serde_json::Value },
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
    pub snapshots_per_second: f64,
}

/// A probe definition as delivered by the remote configuration layer.
/// Immutable per (id, version).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    pub id: String,
    pub version: u32,
    #[serde(rename = "where")]
    pub location: ProbeLocation,
    pub when: Option<ExpressionConfig>,
    #[serde(default)]
    pub capture_snapshot: bool,
    pub capture_expressions: Option<Vec<CaptureExpressionConfig>>,
    pub template: Option<String>,
    pub segments: Option<Vec<SegmentConfig>>,
    pub capture: Option<CaptureLimitsOverride>,
    pub sampling: Option<SamplingConfig>,
}

impl ProbeConfig {
    /// Schema-level validation, run before anything is compiled or installed.
    pub fn validate(&self) -> ProbeResult<()> {
        if self.capture_snapshot
            && self.capture_expressions.as_ref().is_some_and(|e| !e.is_empty())
        {
            return Err(ProbeError::Validation(format!(
                "captureSnapshot and captureExpressions are mutually exclusive (probe: {}, version: {})",
                self.id, self.version
            )));
        }
        if self.location.lines.is_empty() {
            return Err(ProbeError::Validation(format!(
                "Probe has no target line (probe: {}, version: {})",
                self.id, self.version
            )));
        }
        Ok(())
    }

    /// The line this probe instruments.
    pub fn line(&self) -> u32 {
        self.location.lines.first().copied().unwrap_or(0)
    }
}

/// Process-level knobs. Owned by the embedding process; only their effect is
/// implemented here.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub service: String,
    pub hostname: String,
    pub runtime_id: String,
    /// Reported as `logger.version` on snapshot payloads.
    pub version: String,

    pub default_limits: CaptureLimits,
    /// Wall-clock budget for one capture pass.
    pub capture_deadline: Duration,

    /// Identifiers denied from capture, merged with the built-in deny list.
    pub redacted_identifiers: Vec<String>,
    /// Identifiers exempted from redaction.
    pub redaction_excluded_identifiers: Vec<String>,

    /// Per-probe sampling default for snapshot-capturing probes.
    pub snapshots_per_second: f64,
    /// Per-probe sampling default for probes that capture no snapshot.
    pub triggers_per_second: f64,
    /// Shared budget across all probes.
    pub global_snapshots_per_second: f64,

    /// Encoded snapshots above this size lose their `captures` field.
    pub max_snapshot_bytes: usize,
    /// Outbound batches flush once their encoded size reaches this threshold.
    pub batch_max_bytes: usize,
    /// Or when this much time passed since the first buffered payload.
    pub batch_flush_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            service: "unknown-service".to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            runtime_id: crate::payload::ids::generate(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            default_limits: CaptureLimits::default(),
            capture_deadline: Duration::from_millis(100),
            redacted_identifiers: Vec::new(),
            redaction_excluded_identifiers: Vec::new(),
            snapshots_per_second: 1.0,
            triggers_per_second: 5000.0,
            global_snapshots_per_second: 25.0,
            max_snapshot_bytes: 1024 * 1024,
            batch_max_bytes: 1024 * 1024,
            batch_flush_interval: Duration::from_secs(1),
        }
    }
}

impl EngineSettings {
    /// Default sampling rate for a probe, by capture mode.
    pub fn default_rate(&self, captures_snapshot: bool) -> f64 {
        if captures_snapshot {
            self.snapshots_per_second
        } else {
            self.triggers_per_second
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_json() -> serde_json::Value {
        serde_json::json!({
            "id": "probe-1",
            "version": 1,
            "where": { "sourceFile": "app.js", "lines": [10] },
            "when": { "dsl": "foo == 42", "json": { "eq": [{ "ref": "foo" }, 42] } },
            "captureSnapshot": true,
            "capture": { "maxReferenceDepth": 5 },
            "sampling": { "snapshotsPerSecond": 0.5 }
        })
    }

    #[test]
    fn test_deserialize_probe_config() {
        let config: ProbeConfig = serde_json::from_value(probe_json()).unwrap();
        assert_eq!(config.id, "probe-1");
        assert_eq!(config.version, 1);
        assert_eq!(config.location.source_file, "app.js");
        assert_eq!(config.line(), 10);
        assert!(config.capture_snapshot);
        assert_eq!(config.capture.unwrap().max_reference_depth, Some(5));
        assert_eq!(config.sampling.unwrap().snapshots_per_second, 0.5);
    }

    #[test]
    fn test_limits_resolve_per_dimension() {
        let probe_level = CaptureLimitsOverride {
            max_reference_depth: Some(5),
            ..Default::default()
        };
        let expression_level = CaptureLimitsOverride {
            max_length: Some(10),
            ..Default::default()
        };

        // Each dimension falls back independently.
        let resolved = expression_level.resolve(probe_level.resolve(CaptureLimits::default()));
        assert_eq!(resolved.max_reference_depth, 5);
        assert_eq!(resolved.max_collection_size, DEFAULT_MAX_COLLECTION_SIZE);
        assert_eq!(resolved.max_field_count, DEFAULT_MAX_FIELD_COUNT);
        assert_eq!(resolved.max_length, 10);
    }

    #[test]
    fn test_validate_rejects_conflicting_capture_modes() {
        let mut config: ProbeConfig = serde_json::from_value(probe_json()).unwrap();
        config.capture_expressions = Some(vec![CaptureExpressionConfig {
            name: "x".to_string(),
            expr: ExpressionConfig {
                dsl: "x".to_string(),
                json: serde_json::json!({ "ref": "x" }),
            },
            capture: None,
        }]);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_allows_empty_capture_expressions() {
        let mut config: ProbeConfig = serde_json::from_value(probe_json()).unwrap();
        config.capture_expressions = Some(Vec::new());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_segment_config_shapes() {
        let segments: Vec<SegmentConfig> = serde_json::from_value(serde_json::json!([
            { "str": "count is " },
            { "dsl": "count", "json": { "ref": "count" } }
        ]))
        .unwrap();
        assert!(matches!(&segments[0], SegmentConfig::Literal { str } if str == "count is "));
        assert!(matches!(&segments[1], SegmentConfig::Expression { dsl, .. } if dsl == "count"));
    }
}
