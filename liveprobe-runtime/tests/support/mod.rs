// Minimal in-memory debug session, frame and transport for engine tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use liveprobe::dsl::CombinedCondition;
use liveprobe::session::{
    BreakpointId, DebugSession, ErrorDetails, FrameInspector, ObjectId, PauseEvent, PromiseState,
    RemoteValue, ResolvedLocation, Scope, ScopeKind, SessionError, SessionResult, StackFrame,
};
use liveprobe::transport::{Endpoint, TransportBackend, TransportError};
use tokio::sync::mpsc;

const SCOPE_OBJECT: ObjectId = 1;

/// Resolves every location and records lifecycle calls as readable strings.
#[derive(Debug, Clone, Default)]
pub struct TestSession {
    calls: Arc<Mutex<Vec<String>>>,
    next_breakpoint: Arc<AtomicU32>,
}

impl TestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DebugSession for TestSession {
    fn resolve_location(&self, source_file: &str, line: u32) -> Option<ResolvedLocation> {
        Some(ResolvedLocation { script_id: format!("script-{source_file}"), line })
    }

    async fn enable(&self) -> SessionResult<()> {
        self.record("enable".to_string());
        Ok(())
    }

    async fn disable(&self) -> SessionResult<()> {
        self.record("disable".to_string());
        Ok(())
    }

    async fn set_breakpoint(
        &self,
        location: &ResolvedLocation,
        condition: Option<Arc<CombinedCondition>>,
    ) -> SessionResult<BreakpointId> {
        self.record(match condition {
            Some(condition) => format!("set {} if {}", location.key(), condition.dsl),
            None => format!("set {}", location.key()),
        });
        let n = self.next_breakpoint.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bp-{n}"))
    }

    async fn remove_breakpoint(&self, breakpoint_id: &BreakpointId) -> SessionResult<()> {
        self.record(format!("remove {breakpoint_id}"));
        Ok(())
    }
}

/// A frame with a single local scope of primitive variables.
pub struct TestFrame {
    variables: Vec<(String, RemoteValue)>,
}

impl FrameInspector for TestFrame {
    fn scope_chain(&self) -> SessionResult<Vec<Scope>> {
        Ok(vec![Scope { kind: ScopeKind::Local, object: SCOPE_OBJECT }])
    }

    fn own_properties(&self, object: ObjectId) -> SessionResult<Vec<(String, RemoteValue)>> {
        if object == SCOPE_OBJECT {
            Ok(self.variables.clone())
        } else {
            Ok(Vec::new())
        }
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

pub fn pause_at(file: &str, line: u32, variables: Vec<(String, RemoteValue)>) -> PauseEvent {
    PauseEvent {
        location: ResolvedLocation { script_id: format!("script-{file}"), line },
        thread_name: "main".to_string(),
        thread_id: "pid:1".to_string(),
        stack: vec![StackFrame {
            function: "handler".to_string(),
            file_name: file.to_string(),
            line_number: line,
            column_number: 3,
        }],
        frame: Box::new(TestFrame { variables }),
    }
}

/// Forwards every posted batch to the test over a channel.
pub struct ChannelBackend {
    pub tx: mpsc::UnboundedSender<(Endpoint, String)>,
}

impl TransportBackend for ChannelBackend {
    async fn post(&self, endpoint: Endpoint, body: String) -> Result<(), TransportError> {
        self.tx
            .send((endpoint, body))
            .map_err(|_| TransportError::Failed("test channel closed".to_string()))
    }
}
