// In-memory test doubles for the debug session
//
// MockFrame holds a little object heap and a scope chain; MockSession records
// every lifecycle call so tests can assert ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::dsl::CombinedCondition;
use crate::session::{
    BreakpointId, DebugSession, ErrorDetails, FrameInspector, ObjectId, ObjectKind, ObjectRef,
    PauseEvent, PromiseState, RemoteValue, ResolvedLocation, Scope, ScopeKind, SessionError,
    SessionResult, StackFrame,
};

#[derive(Debug, Clone)]
struct MockObject {
    kind: ObjectKind,
    class_name: String,
    properties: Vec<(String, RemoteValue)>,
    elements: Vec<RemoteValue>,
    entries: Vec<(RemoteValue, RemoteValue)>,
    description: Option<String>,
    promise: Option<PromiseState>,
    error: Option<ErrorDetails>,
}

impl MockObject {
    fn new(kind: ObjectKind, class_name: &str) -> Self {
        MockObject {
            kind,
            class_name: class_name.to_string(),
            properties: Vec::new(),
            elements: Vec::new(),
            entries: Vec::new(),
            description: None,
            promise: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockFrame {
    scopes: Vec<(ScopeKind, ObjectId)>,
    heap: HashMap<ObjectId, MockObject>,
    next_id: ObjectId,
    delays: HashMap<ObjectId, Duration>,
    fail_inspection: bool,
}

impl MockFrame {
    pub fn new() -> Self {
        MockFrame { next_id: 1, ..Default::default() }
    }

    /// Make every inspection call fail, simulating a dying debug session.
    pub fn set_fail_inspection(&mut self, fail: bool) {
        self.fail_inspection = fail;
    }

    pub fn set_object_delay(&mut self, value: &RemoteValue, delay: Duration) {
        if let RemoteValue::Object(obj) = value {
            self.delays.insert(obj.id, delay);
        }
    }

    fn alloc(&mut self, object: MockObject) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.insert(id, object);
        id
    }

    fn scope_object(&mut self, kind: ScopeKind) -> ObjectId {
        if let Some((_, id)) = self.scopes.iter().find(|(k, _)| *k == kind) {
            return *id;
        }
        let id = self.alloc(MockObject::new(ObjectKind::Plain, "Scope"));
        self.scopes.push((kind, id));
        self.scopes.sort_by_key(|(kind, _)| match kind {
            ScopeKind::Local => 0,
            ScopeKind::Arguments => 1,
            ScopeKind::Closure => 2,
            ScopeKind::Global => 3,
        });
        id
    }

    fn add_scope_variable(&mut self, kind: ScopeKind, name: &str, value: RemoteValue) {
        let id = self.scope_object(kind);
        if let Some(scope) = self.heap.get_mut(&id) {
            scope.properties.push((name.to_string(), value));
        }
    }

    pub fn local(&mut self, name: &str, value: RemoteValue) {
        self.add_scope_variable(ScopeKind::Local, name, value);
    }

    pub fn closure(&mut self, name: &str, value: RemoteValue) {
        self.add_scope_variable(ScopeKind::Closure, name, value);
    }

    pub fn argument(&mut self, name: &str, value: RemoteValue) {
        self.add_scope_variable(ScopeKind::Arguments, name, value);
    }

    pub fn object(&mut self, class_name: &str, properties: &[(&str, RemoteValue)]) -> RemoteValue {
        let mut object = MockObject::new(ObjectKind::Plain, class_name);
        object.properties = properties
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let id = self.alloc(object);
        self.object_ref(id)
    }

    pub fn array(&mut self, class_name: &str, elements: Vec<RemoteValue>) -> RemoteValue {
        let mut object = MockObject::new(ObjectKind::Array, class_name);
        object.elements = elements;
        let id = self.alloc(object);
        self.object_ref(id)
    }

    pub fn map(
        &mut self,
        class_name: &str,
        entries: &[(RemoteValue, RemoteValue)],
    ) -> RemoteValue {
        let mut object = MockObject::new(ObjectKind::Map, class_name);
        object.entries = entries.to_vec();
        let id = self.alloc(object);
        self.object_ref(id)
    }

    pub fn described(
        &mut self,
        kind: ObjectKind,
        class_name: &str,
        description: &str,
    ) -> RemoteValue {
        let mut object = MockObject::new(kind, class_name);
        object.description = Some(description.to_string());
        let id = self.alloc(object);
        self.object_ref(id)
    }

    pub fn error(&mut self, class_name: &str, message: &str, stack: Option<&str>) -> RemoteValue {
        let mut object = MockObject::new(ObjectKind::Error, class_name);
        object.error =
            Some(ErrorDetails { message: message.to_string(), stack: stack.map(str::to_string) });
        let id = self.alloc(object);
        self.object_ref(id)
    }

    pub fn promise(&mut self, class_name: &str, state: PromiseState) -> RemoteValue {
        let mut object = MockObject::new(ObjectKind::Promise, class_name);
        object.promise = Some(state);
        let id = self.alloc(object);
        self.object_ref(id)
    }

    /// Allocate an object whose properties are filled in later, so tests can
    /// build cycles.
    pub fn reserve_object(&mut self, class_name: &str) -> ObjectId {
        self.alloc(MockObject::new(ObjectKind::Plain, class_name))
    }

    pub fn set_properties(&mut self, id: ObjectId, properties: Vec<(String, RemoteValue)>) {
        if let Some(object) = self.heap.get_mut(&id) {
            object.properties = properties;
        }
    }

    pub fn object_ref(&self, id: ObjectId) -> RemoteValue {
        let (kind, class_name) = self
            .heap
            .get(&id)
            .map(|object| (object.kind, object.class_name.clone()))
            .unwrap_or((ObjectKind::Plain, "Object".to_string()));
        RemoteValue::Object(ObjectRef { id, kind, class_name })
    }

    fn get(&self, id: ObjectId) -> SessionResult<&MockObject> {
        if self.fail_inspection {
            return Err(SessionError::Protocol("inspection failed".to_string()));
        }
        if let Some(delay) = self.delays.get(&id) {
            std::thread::sleep(*delay);
        }
        self.heap.get(&id).ok_or(SessionError::UnknownObject(id))
    }
}

impl FrameInspector for MockFrame {
    fn scope_chain(&self) -> SessionResult<Vec<Scope>> {
        if self.fail_inspection {
            return Err(SessionError::Protocol("inspection failed".to_string()));
        }
        Ok(self.scopes.iter().map(|(kind, object)| Scope { kind: *kind, object: *object }).collect())
    }

    fn own_properties(&self, object: ObjectId) -> SessionResult<Vec<(String, RemoteValue)>> {
        Ok(self.get(object)?.properties.clone())
    }

    fn elements(&self, object: ObjectId) -> SessionResult<Vec<RemoteValue>> {
        Ok(self.get(object)?.elements.clone())
    }

    fn entries(&self, object: ObjectId) -> SessionResult<Vec<(RemoteValue, RemoteValue)>> {
        Ok(self.get(object)?.entries.clone())
    }

    fn description(&self, object: ObjectId) -> SessionResult<String> {
        self.get(object)?
            .description
            .clone()
            .ok_or_else(|| SessionError::Protocol("no description".to_string()))
    }

    fn promise_state(&self, object: ObjectId) -> SessionResult<PromiseState> {
        self.get(object)?
            .promise
            .clone()
            .ok_or_else(|| SessionError::Protocol("not a promise".to_string()))
    }

    fn error_details(&self, object: ObjectId) -> SessionResult<ErrorDetails> {
        self.get(object)?
            .error
            .clone()
            .ok_or_else(|| SessionError::Protocol("not an error".to_string()))
    }
}

/// Wrap a frame into a pause event at the given resolved location.
pub fn pause_event(location: ResolvedLocation, frame: MockFrame) -> PauseEvent {
    let line = location.line;
    PauseEvent {
        location,
        thread_name: "main".to_string(),
        thread_id: "pid:1".to_string(),
        stack: vec![StackFrame {
            function: "handler".to_string(),
            file_name: "app.js".to_string(),
            line_number: line,
            column_number: 3,
        }],
        frame: Box::new(frame),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    Enable,
    Disable,
    SetBreakpoint { key: String, condition: Option<String> },
    RemoveBreakpoint { id: BreakpointId },
}

/// Records lifecycle calls; resolves `file:line` to `script-<file>:<line>`.
#[derive(Debug, Clone, Default)]
pub struct MockSession {
    calls: Arc<Mutex<Vec<SessionCall>>>,
    next_breakpoint: Arc<AtomicU32>,
    pub fail_resolve: bool,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that cannot resolve any source location.
    pub fn failing_resolve() -> Self {
        MockSession { fail_resolve: true, ..Self::default() }
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DebugSession for MockSession {
    fn resolve_location(&self, source_file: &str, line: u32) -> Option<ResolvedLocation> {
        if self.fail_resolve {
            return None;
        }
        Some(ResolvedLocation { script_id: format!("script-{source_file}"), line })
    }

    async fn enable(&self) -> SessionResult<()> {
        self.record(SessionCall::Enable);
        Ok(())
    }

    async fn disable(&self) -> SessionResult<()> {
        self.record(SessionCall::Disable);
        Ok(())
    }

    async fn set_breakpoint(
        &self,
        location: &ResolvedLocation,
        condition: Option<Arc<CombinedCondition>>,
    ) -> SessionResult<BreakpointId> {
        self.record(SessionCall::SetBreakpoint {
            key: location.key(),
            condition: condition.map(|c| c.dsl.clone()),
        });
        let n = self.next_breakpoint.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bp-{}-{n}", location.key()))
    }

    async fn remove_breakpoint(&self, breakpoint_id: &BreakpointId) -> SessionResult<()> {
        self.record(SessionCall::RemoveBreakpoint { id: breakpoint_id.clone() });
        Ok(())
    }
}
