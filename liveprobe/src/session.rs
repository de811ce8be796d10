// External debug session interface
//
// Models the low-level debug session that owns the actual suspend/resume of
// the target and the native breakpoints backing probes. Implementations live
// outside this crate; everything here is the surface the engine is written
// against: an async lifecycle trait for the control context and a synchronous
// inspection trait for the paused context.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dsl::CombinedCondition;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown object id: {0}")]
    UnknownObject(ObjectId),

    #[error("debug session closed")]
    Closed,
}

// Object ids are opaque handles minted by the debug session. They are only
// meaningful for the duration of a single pause.
pub type ObjectId = u64;

/// Identity of a native breakpoint, as assigned by the debug session.
pub type BreakpointId = String;

/// A source location as resolved by the debug session against loaded scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedLocation {
    pub script_id: String,
    pub line: u32,
}

impl ResolvedLocation {
    /// Key used to correlate pause events with installed breakpoints.
    pub fn key(&self) -> String {
        format!("{}:{}", self.script_id, self.line)
    }
}

/// Lifecycle operations on the debug session, used from the control context.
///
/// All mutations of native debugger state go through this trait. The engine
/// serializes calls, so implementations never see concurrent transitions.
pub trait DebugSession {
    /// Resolve a probe's source file and line against the loaded scripts.
    /// Returns `None` when no loaded script matches.
    fn resolve_location(&self, source_file: &str, line: u32) -> Option<ResolvedLocation>;

    /// Transition the underlying debugger to enabled. Called before the first
    /// breakpoint of a session is installed.
    fn enable(&self) -> impl Future<Output = SessionResult<()>>;

    /// Transition the underlying debugger to disabled, discarding all native
    /// breakpoint state. Called after the last breakpoint is removed.
    fn disable(&self) -> impl Future<Output = SessionResult<()>>;

    /// Install a native breakpoint. At most one native breakpoint may exist
    /// per location; the engine guarantees the previous one at this location
    /// was removed first.
    fn set_breakpoint(
        &self,
        location: &ResolvedLocation,
        condition: Option<Arc<CombinedCondition>>,
    ) -> impl Future<Output = SessionResult<BreakpointId>>;

    /// Remove a native breakpoint previously installed with `set_breakpoint`.
    fn remove_breakpoint(&self, breakpoint_id: &BreakpointId)
        -> impl Future<Output = SessionResult<()>>;
}

/// A value in the paused program, as reported by the debug session.
///
/// Primitives carry their content inline; everything composite is an opaque
/// handle inspected further through [`FrameInspector`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    BigInt(String),
    Symbol(String),
    String(String),
    Object(ObjectRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Class or constructor name, e.g. `Object`, `Array`, `MyService`.
    pub class_name: String,
}

/// Closed set of composite value categories the capture engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Plain,
    Array,
    TypedArray,
    Buffer,
    Map,
    Set,
    WeakMap,
    WeakSet,
    Function,
    Class,
    Promise,
    Proxy,
    Regex,
    Date,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Arguments,
    Local,
    Closure,
    Global,
}

/// One scope of a paused frame. The scope object is a pseudo-object whose
/// properties are the variables in scope.
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub object: ObjectId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(RemoteValue),
    Rejected(RemoteValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetails {
    pub message: String,
    pub stack: Option<String>,
}

/// Synchronous inspection of the frame a pause event stopped in.
///
/// The debug session owns the pause; while it lasts, inspection is a plain
/// in-memory read on the session's side, so none of these methods suspend.
/// Any error is treated by the engine as a fatal capture failure for the
/// affected probe.
pub trait FrameInspector {
    /// Scope chain of the paused frame, innermost first. Implementations may
    /// include the global scope; the capture engine never descends into it.
    fn scope_chain(&self) -> SessionResult<Vec<Scope>>;

    /// Own enumerable properties of an object (or the variables of a scope
    /// pseudo-object), in enumeration order, with their true total count.
    fn own_properties(&self, object: ObjectId) -> SessionResult<Vec<(String, RemoteValue)>>;

    /// Indexed elements of arrays, typed arrays, sets and weak sets. Weak
    /// collection content may be approximate.
    fn elements(&self, object: ObjectId) -> SessionResult<Vec<RemoteValue>>;

    /// Key/value entries of maps and weak maps, in enumeration order.
    fn entries(&self, object: ObjectId) -> SessionResult<Vec<(RemoteValue, RemoteValue)>>;

    /// Printable description: regex source, date in ISO form, `class Foo`
    /// for class definitions, decoded content for buffers, proxy targets.
    fn description(&self, object: ObjectId) -> SessionResult<String>;

    fn promise_state(&self, object: ObjectId) -> SessionResult<PromiseState>;

    fn error_details(&self, object: ObjectId) -> SessionResult<ErrorDetails>;
}

/// A single stack frame of the paused thread, topmost first in
/// [`PauseEvent::stack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub function: String,
    pub file_name: String,
    pub line_number: u32,
    pub column_number: u32,
}

/// Delivered by the debug session once per pause, one at a time.
pub struct PauseEvent {
    pub location: ResolvedLocation,
    pub thread_name: String,
    pub thread_id: String,
    pub stack: Vec<StackFrame>,
    pub frame: Box<dyn FrameInspector + Send>,
}

impl std::fmt::Debug for PauseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseEvent")
            .field("location", &self.location)
            .field("thread_name", &self.thread_name)
            .field("thread_id", &self.thread_id)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}
