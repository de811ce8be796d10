// Breakpoint and probe lifecycle
//
// Owns the probe and breakpoint tables and every piece of shared mutable
// state around them: sampling buckets, diagnostics states and the outbound
// payload buffers. All mutation is routed through one owner; the runtime
// serializes calls, so an enable or disable transition always completes
// before the next operation starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use tracing::{debug, error, info};

use crate::capture::{self, CaptureContext};
use crate::config::{CaptureLimits, EngineSettings, ProbeConfig, ProbeLocation};
use crate::diagnostics::{DiagnosticsException, DiagnosticsTracker, ProbeStatus};
use crate::dsl::{self, CombinedCondition, CompiledCondition, CompiledExpression};
use crate::error::{ProbeError, ProbeResult};
use crate::payload::{
    ids, Captures, EvaluationErrorEntry, JsonBatcher, LineCapture, LoggerInfo, ProbeSnapshotRef,
    Snapshot, SnapshotPayload,
};
use crate::redaction::Redaction;
use crate::sampler::Sampler;
use crate::session::{
    BreakpointId, DebugSession, FrameInspector, PauseEvent, ResolvedLocation,
};
use crate::template::Template;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Diagnostics,
    Input,
}

/// One encoded batch ready for the transport.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub kind: BatchKind,
    pub body: String,
}

#[derive(Debug, Clone)]
enum CaptureMode {
    None,
    Snapshot(CaptureLimits),
    Expressions(Vec<CompiledExpression>),
}

/// A fully compiled probe, immutable per (id, version).
#[derive(Debug, Clone)]
struct Probe {
    id: String,
    version: u32,
    location: ProbeLocation,
    condition: Option<Arc<CompiledCondition>>,
    capture: CaptureMode,
    template: Option<Template>,
    rate: f64,
}

/// A native breakpoint and the probes attached to it. Exists iff at least
/// one probe is attached to its location.
struct Breakpoint {
    native_id: BreakpointId,
    location: ResolvedLocation,
    /// The condition currently installed natively, for change detection.
    installed_condition: Option<String>,
    probes: IndexMap<String, Probe>,
}

pub struct ProbeManager<S> {
    session: S,
    settings: EngineSettings,
    redaction: Arc<Redaction>,
    sampler: Sampler,
    diagnostics: DiagnosticsTracker,
    breakpoints: HashMap<String, Breakpoint>,
    probe_locations: HashMap<String, String>,
    enabled: bool,
    fatal_disabled: HashSet<String>,
    input_batcher: JsonBatcher,
    diagnostics_batcher: JsonBatcher,
    outbox: Vec<OutboundBatch>,
}

impl<S: DebugSession> ProbeManager<S> {
    pub fn new(session: S, settings: EngineSettings) -> Self {
        let redaction = Arc::new(Redaction::new(
            &settings.redacted_identifiers,
            &settings.redaction_excluded_identifiers,
        ));
        let now = Instant::now();
        ProbeManager {
            redaction,
            sampler: Sampler::new(settings.global_snapshots_per_second, now),
            diagnostics: DiagnosticsTracker::new(&settings.service, &settings.runtime_id),
            breakpoints: HashMap::new(),
            probe_locations: HashMap::new(),
            enabled: false,
            fatal_disabled: HashSet::new(),
            input_batcher: JsonBatcher::new(settings.batch_max_bytes, settings.batch_flush_interval),
            diagnostics_batcher: JsonBatcher::new(
                settings.batch_max_bytes,
                settings.batch_flush_interval,
            ),
            outbox: Vec::new(),
            session,
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn probe_count(&self) -> usize {
        self.probe_locations.len()
    }

    /// Validate, compile, resolve and install a probe. The first probe of a
    /// session enables the debugger first; subsequent probes at an occupied
    /// location merge into the existing native breakpoint.
    pub async fn add_probe(&mut self, config: ProbeConfig) -> ProbeResult<()> {
        if let Some(key) = self.probe_locations.get(&config.id) {
            let attached = self
                .breakpoints
                .get(key)
                .and_then(|breakpoint| breakpoint.probes.get(&config.id));
            if let Some(existing) = attached {
                if existing.version == config.version {
                    debug!(probe_id = %config.id, version = config.version,
                        "probe already installed, ignoring duplicate");
                    return Ok(());
                }
                // A different version supersedes the attached one.
                self.remove_probe(&config.id).await?;
            }
        }

        self.emit_diagnostic(&config.id, config.version, ProbeStatus::Received, None);

        let probe = match self.build_probe(&config) {
            Ok(probe) => probe,
            Err(err) => {
                self.emit_error_diagnostic(&config.id, config.version, &err);
                return Err(err);
            }
        };

        let Some(resolved) =
            self.session.resolve_location(&config.location.source_file, config.line())
        else {
            let err = ProbeError::Location {
                file: config.location.source_file.clone(),
                probe_id: config.id.clone(),
                version: config.version,
            };
            self.emit_error_diagnostic(&config.id, config.version, &err);
            return Err(err);
        };

        if !self.enabled {
            if let Err(err) = self.session.enable().await {
                let err = ProbeError::Session(err);
                self.emit_error_diagnostic(&config.id, config.version, &err);
                return Err(err);
            }
            info!("debugger enabled");
            self.enabled = true;
        }

        let key = resolved.key();
        let probe_id = probe.id.clone();
        let rate = probe.rate;

        if let Some(breakpoint) = self.breakpoints.get_mut(&key) {
            breakpoint.probes.insert(probe_id.clone(), probe);
            if let Err(err) = self.reinstall_if_changed(&key).await {
                let err = ProbeError::Session(err);
                self.emit_error_diagnostic(&config.id, config.version, &err);
                return Err(err);
            }
        } else {
            let combined = CombinedCondition::combine(&[probe.condition.clone()]);
            let installed_condition = combined.as_ref().map(|c| c.dsl.clone());
            let native_id =
                match self.session.set_breakpoint(&resolved, combined.map(Arc::new)).await {
                    Ok(id) => id,
                    Err(err) => {
                        let err = ProbeError::Session(err);
                        self.emit_error_diagnostic(&config.id, config.version, &err);
                        return Err(err);
                    }
                };
            self.breakpoints.insert(
                key.clone(),
                Breakpoint {
                    native_id,
                    location: resolved,
                    installed_condition,
                    probes: IndexMap::from([(probe_id.clone(), probe)]),
                },
            );
        }

        self.sampler.track_probe(&probe_id, rate, Instant::now());
        self.probe_locations.insert(probe_id, key);
        self.emit_diagnostic(&config.id, config.version, ProbeStatus::Installed, None);
        Ok(())
    }

    /// Detach a probe. The native breakpoint goes away with its last probe;
    /// the debugger is disabled with the session's last breakpoint.
    pub async fn remove_probe(&mut self, probe_id: &str) -> ProbeResult<()> {
        if !self.enabled {
            return Err(ProbeError::NotStarted(probe_id.to_string()));
        }
        let key = self
            .probe_locations
            .get(probe_id)
            .cloned()
            .ok_or_else(|| ProbeError::UnknownProbe(probe_id.to_string()))?;
        let remaining = match self.breakpoints.get_mut(&key) {
            Some(breakpoint) => {
                breakpoint.probes.shift_remove(probe_id);
                breakpoint.probes.len()
            }
            None => return Err(ProbeError::UnknownProbe(probe_id.to_string())),
        };

        self.probe_locations.remove(probe_id);
        self.sampler.forget_probe(probe_id);
        self.diagnostics.forget(probe_id);
        self.fatal_disabled.remove(probe_id);

        if remaining == 0 {
            let native_id = match self.breakpoints.remove(&key) {
                Some(breakpoint) => breakpoint.native_id,
                None => return Ok(()),
            };
            if self.breakpoints.is_empty() {
                // Disabling clears all native state, no removal needed.
                self.session.disable().await?;
                info!("last probe removed, debugger disabled");
                self.enabled = false;
            } else {
                self.session.remove_breakpoint(&native_id).await?;
            }
        } else {
            self.reinstall_if_changed(&key).await?;
        }
        Ok(())
    }

    /// Equivalent to removing the old version and adding the new one at the
    /// same location, with all ordering guarantees preserved.
    pub async fn modify_probe(&mut self, config: ProbeConfig) -> ProbeResult<()> {
        self.remove_probe(&config.id).await?;
        self.add_probe(config).await
    }

    /// Handle one pause event, synchronously. Condition evaluation is never
    /// skipped; only accepted, sampled hits pay for capture and emission.
    pub fn on_pause(&mut self, event: &PauseEvent) {
        let key = event.location.key();
        let Some(breakpoint) = self.breakpoints.get(&key) else {
            debug!(location = %key, "pause event with no attached probes");
            return;
        };
        let probes: Vec<Probe> = breakpoint.probes.values().cloned().collect();
        let frame = event.frame.as_ref();

        for probe in &probes {
            if self.fatal_disabled.contains(&probe.id) {
                continue;
            }
            if let Some(condition) = &probe.condition {
                match condition.evaluate(frame) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) if err.is_fatal() => {
                        self.disable_after_fatal(&probe.id, &err.message);
                        continue;
                    }
                    Err(err) => {
                        debug!(probe_id = %probe.id, %err, "condition failed, treating as unmet");
                        continue;
                    }
                }
            }
            if !self.sampler.try_acquire(&probe.id, Instant::now()) {
                continue;
            }
            self.emit_hit(probe, event, frame);
        }
    }

    /// Batches ready for the transport: overflowed ones plus, on the flush
    /// timer (or at shutdown with `force`), whatever is pending.
    pub fn poll_outbound(&mut self, now: Instant, force: bool) -> Vec<OutboundBatch> {
        let mut batches = std::mem::take(&mut self.outbox);
        let due_diagnostics = if force {
            self.diagnostics_batcher.take()
        } else {
            self.diagnostics_batcher.take_due(now)
        };
        if let Some(body) = due_diagnostics {
            batches.push(OutboundBatch { kind: BatchKind::Diagnostics, body });
        }
        let due_input =
            if force { self.input_batcher.take() } else { self.input_batcher.take_due(now) };
        if let Some(body) = due_input {
            batches.push(OutboundBatch { kind: BatchKind::Input, body });
        }
        batches
    }

    fn build_probe(&self, config: &ProbeConfig) -> ProbeResult<Probe> {
        config.validate()?;

        let condition = match &config.when {
            Some(when) => Some(dsl::compile_condition(&when.dsl, &when.json).map_err(|_| {
                ProbeError::Compile {
                    dsl: when.dsl.clone(),
                    probe_id: config.id.clone(),
                    version: config.version,
                }
            })?),
            None => None,
        };

        let probe_limits =
            config.capture.unwrap_or_default().resolve(self.settings.default_limits);

        let capture = if config.capture_snapshot {
            CaptureMode::Snapshot(probe_limits)
        } else {
            match config.capture_expressions.as_deref() {
                Some(expressions) if !expressions.is_empty() => {
                    let mut compiled = Vec::with_capacity(expressions.len());
                    for expression in expressions {
                        let limits =
                            expression.capture.unwrap_or_default().resolve(probe_limits);
                        compiled.push(
                            dsl::compile_capture_expression(
                                &expression.name,
                                &expression.expr.dsl,
                                &expression.expr.json,
                                limits,
                            )
                            .map_err(|_| ProbeError::CompileCaptureExpression {
                                name: expression.name.clone(),
                                probe_id: config.id.clone(),
                                version: config.version,
                            })?,
                        );
                    }
                    CaptureMode::Expressions(compiled)
                }
                _ => CaptureMode::None,
            }
        };

        let template = match (&config.segments, &config.template) {
            (Some(segments), _) if !segments.is_empty() => {
                Some(Template::compile(segments).map_err(|err| ProbeError::Compile {
                    dsl: err.dsl,
                    probe_id: config.id.clone(),
                    version: config.version,
                })?)
            }
            (_, Some(text)) => Some(Template::literal(text)),
            _ => None,
        };

        let rate = config
            .sampling
            .map(|sampling| sampling.snapshots_per_second)
            .unwrap_or_else(|| self.settings.default_rate(config.capture_snapshot));

        Ok(Probe {
            id: config.id.clone(),
            version: config.version,
            location: config.location.clone(),
            condition: condition.map(Arc::new),
            capture,
            template,
            rate,
        })
    }

    /// Recompute the combined condition over all attached probes and, only
    /// when it differs from what is installed, replace the native breakpoint.
    /// The old one is removed before the new one is set so the location never
    /// has two active breakpoints.
    async fn reinstall_if_changed(
        &mut self,
        key: &str,
    ) -> Result<(), crate::session::SessionError> {
        let Some(breakpoint) = self.breakpoints.get_mut(key) else {
            return Ok(());
        };
        let conditions: Vec<Option<Arc<CompiledCondition>>> =
            breakpoint.probes.values().map(|probe| probe.condition.clone()).collect();
        let combined = CombinedCondition::combine(&conditions);
        let condition_dsl = combined.as_ref().map(|c| c.dsl.clone());
        if condition_dsl == breakpoint.installed_condition {
            return Ok(());
        }
        debug!(location = %key, condition = ?condition_dsl, "reinstalling combined condition");
        self.session.remove_breakpoint(&breakpoint.native_id).await?;
        breakpoint.native_id =
            self.session.set_breakpoint(&breakpoint.location, combined.map(Arc::new)).await?;
        breakpoint.installed_condition = condition_dsl;
        Ok(())
    }

    /// Capture state for one accepted hit and buffer the snapshot payload.
    fn emit_hit(&mut self, probe: &Probe, event: &PauseEvent, frame: &dyn FrameInspector) {
        let redaction = Arc::clone(&self.redaction);
        let deadline = Instant::now() + self.settings.capture_deadline;
        let mut ctx = CaptureContext::new(frame, redaction.as_ref(), deadline);

        let mut evaluation_errors: Vec<EvaluationErrorEntry> = Vec::new();
        let mut line_capture = None;

        match &probe.capture {
            CaptureMode::None => {}
            CaptureMode::Snapshot(limits) => match capture::capture_scopes(&mut ctx, limits) {
                Ok(scopes) => {
                    line_capture = Some(LineCapture {
                        locals: Some(scopes.locals),
                        arguments: if scopes.arguments.is_empty() {
                            None
                        } else {
                            Some(scopes.arguments)
                        },
                        capture_expressions: None,
                    });
                }
                Err(err) => {
                    self.disable_after_fatal(&probe.id, &err.to_string());
                    return;
                }
            },
            CaptureMode::Expressions(expressions) => {
                let mut values = IndexMap::new();
                for expression in expressions {
                    match capture::capture_expression(&mut ctx, expression) {
                        Ok(value) => {
                            values.insert(expression.name.clone(), value);
                        }
                        Err(err) if err.is_fatal() => {
                            self.disable_after_fatal(&probe.id, &err.message);
                            return;
                        }
                        Err(err) => evaluation_errors.push(EvaluationErrorEntry {
                            expr: expression.name.clone(),
                            message: err.to_string(),
                        }),
                    }
                }
                line_capture = Some(LineCapture {
                    locals: None,
                    arguments: None,
                    capture_expressions: Some(values),
                });
            }
        }

        let message = probe.template.as_ref().map(|template| {
            let rendered = template.render(frame);
            for (dsl, error_message) in rendered.errors {
                evaluation_errors
                    .push(EvaluationErrorEntry { expr: dsl, message: error_message });
            }
            rendered.message
        });

        self.emit_diagnostic(&probe.id, probe.version, ProbeStatus::Emitting, None);

        let captures = line_capture.map(|line| Captures {
            lines: IndexMap::from([(event.location.line.to_string(), line)]),
        });
        let snapshot = Snapshot {
            id: ids::generate(),
            timestamp: crate::payload::epoch_millis(),
            probe: ProbeSnapshotRef {
                id: probe.id.clone(),
                version: probe.version,
                location: (&probe.location).into(),
            },
            stack: event.stack.clone(),
            captures,
            evaluation_errors,
            capture_error: None,
        };
        let logger = LoggerInfo {
            name: probe.location.source_file.clone(),
            method: event.stack.first().map(|frame| frame.function.clone()).unwrap_or_default(),
            version: self.settings.version.clone(),
            thread_name: event.thread_name.clone(),
            thread_id: event.thread_id.clone(),
        };
        let payload = SnapshotPayload::new(
            &self.settings.hostname,
            &self.settings.service,
            message,
            logger,
            snapshot,
        );
        let encoded = payload.encode(self.settings.max_snapshot_bytes);
        if let Some(body) = self.input_batcher.push(encoded, Instant::now()) {
            self.outbox.push(OutboundBatch { kind: BatchKind::Input, body });
        }
    }

    fn disable_after_fatal(&mut self, probe_id: &str, message: &str) {
        error!(
            probe_id,
            message, "capture failed, skipping this probe's triggers until it is re-applied"
        );
        self.fatal_disabled.insert(probe_id.to_string());
    }

    fn emit_diagnostic(
        &mut self,
        probe_id: &str,
        version: u32,
        status: ProbeStatus,
        exception: Option<DiagnosticsException>,
    ) {
        if let Some(message) = self.diagnostics.transition(probe_id, version, status, exception) {
            let encoded = serde_json::to_string(&message).unwrap();
            if let Some(body) = self.diagnostics_batcher.push(encoded, Instant::now()) {
                self.outbox.push(OutboundBatch { kind: BatchKind::Diagnostics, body });
            }
        }
    }

    fn emit_error_diagnostic(&mut self, probe_id: &str, version: u32, err: &ProbeError) {
        self.emit_diagnostic(
            probe_id,
            version,
            ProbeStatus::Error,
            Some(DiagnosticsException { message: err.to_string(), stacktrace: String::new() }),
        );
    }
}
