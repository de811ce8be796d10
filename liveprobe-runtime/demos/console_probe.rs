// Drive the probe engine against a tiny in-memory "process" and print every
// payload batch to stdout.
//
// Run with: cargo run --example console_probe

use std::sync::Arc;

use anyhow::Result;
use liveprobe::config::{EngineSettings, ProbeConfig};
use liveprobe::dsl::CombinedCondition;
use liveprobe::session::{
    BreakpointId, DebugSession, ErrorDetails, FrameInspector, ObjectId, PauseEvent, PromiseState,
    RemoteValue, ResolvedLocation, Scope, ScopeKind, SessionError, SessionResult, StackFrame,
};
use liveprobe::transport::{Endpoint, TransportBackend, TransportError};
use liveprobe_runtime::spawn_engine;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

struct DemoSession;

impl DebugSession for DemoSession {
    fn resolve_location(&self, source_file: &str, line: u32) -> Option<ResolvedLocation> {
        Some(ResolvedLocation { script_id: format!("script-{source_file}"), line })
    }

    async fn enable(&self) -> SessionResult<()> {
        info!("demo session enabled");
        Ok(())
    }

    async fn disable(&self) -> SessionResult<()> {
        info!("demo session disabled");
        Ok(())
    }

    async fn set_breakpoint(
        &self,
        location: &ResolvedLocation,
        condition: Option<Arc<CombinedCondition>>,
    ) -> SessionResult<BreakpointId> {
        info!(location = %location.key(), condition = ?condition.map(|c| c.dsl.clone()),
            "breakpoint installed");
        Ok(format!("bp-{}", location.key()))
    }

    async fn remove_breakpoint(&self, breakpoint_id: &BreakpointId) -> SessionResult<()> {
        info!(breakpoint_id, "breakpoint removed");
        Ok(())
    }
}

const SCOPE_OBJECT: ObjectId = 1;

struct DemoFrame {
    request_count: f64,
}

impl FrameInspector for DemoFrame {
    fn scope_chain(&self) -> SessionResult<Vec<Scope>> {
        Ok(vec![Scope { kind: ScopeKind::Local, object: SCOPE_OBJECT }])
    }

    fn own_properties(&self, _object: ObjectId) -> SessionResult<Vec<(String, RemoteValue)>> {
        Ok(vec![
            ("user".to_string(), RemoteValue::String("alice".to_string())),
            ("password".to_string(), RemoteValue::String("hunter2".to_string())),
            ("requestCount".to_string(), RemoteValue::Number(self.request_count)),
        ])
    }

    fn elements(&self, _object: ObjectId) -> SessionResult<Vec<RemoteValue>> {
        Ok(Vec::new())
    }

    fn entries(&self, _object: ObjectId) -> SessionResult<Vec<(RemoteValue, RemoteValue)>> {
        Ok(Vec::new())
    }

    fn description(&self, _object: ObjectId) -> SessionResult<String> {
        Err(SessionError::Protocol("unsupported".to_string()))
    }

    fn promise_state(&self, _object: ObjectId) -> SessionResult<PromiseState> {
        Err(SessionError::Protocol("unsupported".to_string()))
    }

    fn error_details(&self, _object: ObjectId) -> SessionResult<ErrorDetails> {
        Err(SessionError::Protocol("unsupported".to_string()))
    }
}

struct StdoutBackend;

impl TransportBackend for StdoutBackend {
    async fn post(&self, endpoint: Endpoint, body: String) -> Result<(), TransportError> {
        println!("--- {endpoint:?} ---");
        println!("{body}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("console_probe=info".parse()?)
                .add_directive("liveprobe=debug".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let (pause_tx, pause_rx) = mpsc::channel(16);
    let handle =
        spawn_engine(DemoSession, StdoutBackend, false, EngineSettings::default(), pause_rx);

    let config: ProbeConfig = serde_json::from_value(json!({
        "id": "demo-probe",
        "version": 1,
        "where": { "sourceFile": "handlers.js", "lines": [42] },
        "when": { "dsl": "requestCount > 1", "json": { "gt": [{ "ref": "requestCount" }, 1] } },
        "captureSnapshot": true,
        "segments": [
            { "str": "request #" },
            { "dsl": "requestCount", "json": { "ref": "requestCount" } },
            { "str": " from " },
            { "dsl": "user", "json": { "ref": "user" } }
        ]
    }))?;
    handle.apply_probe(config).await?;

    // Simulate a few pause events; the first is rejected by the condition,
    // the rest are gated by the 1/s snapshot sampling.
    for request_count in 1..=3 {
        pause_tx
            .send(PauseEvent {
                location: ResolvedLocation { script_id: "script-handlers.js".to_string(), line: 42 },
                thread_name: "main".to_string(),
                thread_id: format!("pid:{}", std::process::id()),
                stack: vec![StackFrame {
                    function: "handleRequest".to_string(),
                    file_name: "handlers.js".to_string(),
                    line_number: 42,
                    column_number: 3,
                }],
                frame: Box::new(DemoFrame { request_count: request_count as f64 }),
            })
            .await
            .map_err(|err| anyhow::anyhow!("{err}"))?;
    }

    // Give the engine time to flush its batches.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    handle.remove_probe("demo-probe").await?;
    Ok(())
}
