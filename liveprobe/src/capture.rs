// Bounded state capture
//
// Walks the paused frame's variable graph into a wire-ready tree of
// `CapturedValue` nodes. Every dimension of the traversal is bounded: depth,
// collection size, field count, string length and one wall-clock deadline for
// the whole pass. Nodes cut short carry a `notCapturedReason` instead of
// children; nodes already captured are never retracted.

use std::collections::HashSet;
use std::time::Instant;

use indexmap::IndexMap;
use serde::Serialize;

use crate::config::CaptureLimits;
use crate::dsl::{type_label, CompiledExpression, EvalError};
use crate::redaction::Redaction;
use crate::session::{
    FrameInspector, ObjectId, ObjectKind, ObjectRef, PromiseState, RemoteValue, ScopeKind,
    SessionResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotCapturedReason {
    Depth,
    CollectionSize,
    FieldCount,
    Timeout,
    RedactedIdent,
    CircularRef,
}

/// One node of the captured tree. Which optional fields are present depends
/// on the value category; `size` is always the true cardinality, never the
/// truncated count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedValue {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub is_null: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<IndexMap<String, CapturedValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<CapturedValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<[CapturedValue; 2]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_captured_reason: Option<NotCapturedReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl CapturedValue {
    fn of_type(type_name: impl Into<String>) -> Self {
        CapturedValue {
            type_name: type_name.into(),
            value: None,
            is_null: false,
            fields: None,
            elements: None,
            entries: None,
            not_captured_reason: None,
            size: None,
            truncated: None,
        }
    }

    fn with_value(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        CapturedValue { value: Some(value.into()), ..Self::of_type(type_name) }
    }

    pub fn not_captured(type_name: impl Into<String>, reason: NotCapturedReason) -> Self {
        CapturedValue { not_captured_reason: Some(reason), ..Self::of_type(type_name) }
    }
}

/// Captured variables of one paused frame, grouped the way the snapshot
/// payload wants them.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScopeCapture {
    pub locals: IndexMap<String, CapturedValue>,
    pub arguments: IndexMap<String, CapturedValue>,
}

/// Traversal state shared by every node of one capture pass. The deadline
/// clock starts when the context is created and is checked before descending
/// into each node; once exceeded, every remaining node becomes a timeout
/// marker.
pub struct CaptureContext<'a> {
    frame: &'a dyn FrameInspector,
    redaction: &'a Redaction,
    deadline: Instant,
    visiting: HashSet<ObjectId>,
    timed_out: bool,
}

impl<'a> CaptureContext<'a> {
    pub fn new(frame: &'a dyn FrameInspector, redaction: &'a Redaction, deadline: Instant) -> Self {
        CaptureContext { frame, redaction, deadline, visiting: HashSet::new(), timed_out: false }
    }

    fn out_of_time(&mut self) -> bool {
        if !self.timed_out && Instant::now() >= self.deadline {
            self.timed_out = true;
        }
        self.timed_out
    }
}

/// Capture the full scope chain of the paused frame, innermost scope first.
/// On a name collision the innermost occurrence wins. The global scope is
/// never captured.
pub fn capture_scopes(
    ctx: &mut CaptureContext<'_>,
    limits: &CaptureLimits,
) -> SessionResult<ScopeCapture> {
    let mut capture = ScopeCapture::default();

    for scope in ctx.frame.scope_chain()? {
        if scope.kind == ScopeKind::Global {
            continue;
        }
        let variables = ctx.frame.own_properties(scope.object)?;
        let target = match scope.kind {
            ScopeKind::Arguments => &mut capture.arguments,
            _ => &mut capture.locals,
        };
        for (name, value) in variables {
            if target.contains_key(&name) {
                continue;
            }
            let captured = capture_named(ctx, &name, &value, limits)?;
            target.insert(name, captured);
        }
    }

    Ok(capture)
}

/// Capture the result of one capture expression with its own limits. The
/// expression result itself sits at depth 0.
pub fn capture_expression(
    ctx: &mut CaptureContext<'_>,
    expression: &CompiledExpression,
) -> Result<CapturedValue, EvalError> {
    let value = expression.evaluate(ctx.frame)?;
    capture_value(ctx, &value, expression.limits.max_reference_depth, &expression.limits)
        .map_err(EvalError::from)
}

/// Capture a named value, applying redaction at the name boundary.
fn capture_named(
    ctx: &mut CaptureContext<'_>,
    name: &str,
    value: &RemoteValue,
    limits: &CaptureLimits,
) -> SessionResult<CapturedValue> {
    if ctx.redaction.is_redacted(name) {
        return Ok(CapturedValue::not_captured(
            capture_type_name(ctx, value),
            NotCapturedReason::RedactedIdent,
        ));
    }
    capture_value(ctx, value, limits.max_reference_depth, limits)
}

fn capture_value(
    ctx: &mut CaptureContext<'_>,
    value: &RemoteValue,
    depth_budget: u32,
    limits: &CaptureLimits,
) -> SessionResult<CapturedValue> {
    if ctx.out_of_time() {
        return Ok(CapturedValue::not_captured(
            capture_type_name(ctx, value),
            NotCapturedReason::Timeout,
        ));
    }

    match value {
        RemoteValue::Undefined => Ok(CapturedValue::of_type("undefined")),
        RemoteValue::Null => {
            Ok(CapturedValue { is_null: true, ..CapturedValue::of_type("null") })
        }
        RemoteValue::Boolean(b) => {
            Ok(CapturedValue::with_value("boolean", if *b { "true" } else { "false" }))
        }
        RemoteValue::Number(n) => Ok(CapturedValue::with_value("number", format_number(*n))),
        RemoteValue::BigInt(digits) => Ok(CapturedValue::with_value("bigint", digits.clone())),
        RemoteValue::Symbol(description) => {
            Ok(CapturedValue::with_value("symbol", description.clone()))
        }
        RemoteValue::String(s) => Ok(capture_string(s, limits)),
        RemoteValue::Object(obj) => capture_object(ctx, obj, depth_budget, limits),
    }
}

fn capture_string(s: &str, limits: &CaptureLimits) -> CapturedValue {
    let size = s.chars().count();
    if size <= limits.max_length {
        return CapturedValue::with_value("string", s);
    }
    CapturedValue {
        truncated: Some(true),
        size: Some(size),
        ..CapturedValue::with_value("string", s.chars().take(limits.max_length).collect::<String>())
    }
}

fn capture_object(
    ctx: &mut CaptureContext<'_>,
    obj: &ObjectRef,
    depth_budget: u32,
    limits: &CaptureLimits,
) -> SessionResult<CapturedValue> {
    // Leaf categories are printable at any depth.
    match obj.kind {
        ObjectKind::Regex | ObjectKind::Date => {
            return Ok(CapturedValue::with_value(
                obj.class_name.clone(),
                ctx.frame.description(obj.id)?,
            ));
        }
        ObjectKind::Class => {
            let description = ctx.frame.description(obj.id)?;
            return Ok(CapturedValue::of_type(description));
        }
        _ => {}
    }

    if depth_budget == 0 {
        return Ok(CapturedValue::not_captured(
            object_type_name(ctx, obj),
            NotCapturedReason::Depth,
        ));
    }

    if !ctx.visiting.insert(obj.id) {
        return Ok(CapturedValue::not_captured(
            object_type_name(ctx, obj),
            NotCapturedReason::CircularRef,
        ));
    }

    let result = capture_composite(ctx, obj, depth_budget, limits);
    ctx.visiting.remove(&obj.id);
    result
}

fn capture_composite(
    ctx: &mut CaptureContext<'_>,
    obj: &ObjectRef,
    depth_budget: u32,
    limits: &CaptureLimits,
) -> SessionResult<CapturedValue> {
    match obj.kind {
        ObjectKind::Array | ObjectKind::TypedArray | ObjectKind::Set | ObjectKind::WeakSet => {
            let elements = ctx.frame.elements(obj.id)?;
            let size = elements.len();
            let mut captured = Vec::with_capacity(size.min(limits.max_collection_size));
            for element in elements.iter().take(limits.max_collection_size) {
                captured.push(capture_value(ctx, element, depth_budget - 1, limits)?);
            }
            let mut result = CapturedValue::of_type(obj.class_name.clone());
            result.elements = Some(captured);
            if size > limits.max_collection_size {
                result.not_captured_reason = Some(NotCapturedReason::CollectionSize);
                result.size = Some(size);
            }
            Ok(result)
        }
        ObjectKind::Map | ObjectKind::WeakMap => {
            let entries = ctx.frame.entries(obj.id)?;
            let size = entries.len();
            let mut captured = Vec::with_capacity(size.min(limits.max_collection_size));
            for (key, value) in entries.iter().take(limits.max_collection_size) {
                let captured_key = capture_value(ctx, key, depth_budget - 1, limits)?;
                let captured_value = if map_key_is_redacted(ctx, key) {
                    CapturedValue::not_captured(
                        capture_type_name(ctx, value),
                        NotCapturedReason::RedactedIdent,
                    )
                } else {
                    capture_value(ctx, value, depth_budget - 1, limits)?
                };
                captured.push([captured_key, captured_value]);
            }
            let mut result = CapturedValue::of_type(obj.class_name.clone());
            result.entries = Some(captured);
            if size > limits.max_collection_size {
                result.not_captured_reason = Some(NotCapturedReason::CollectionSize);
                result.size = Some(size);
            }
            Ok(result)
        }
        ObjectKind::Buffer => {
            let content = ctx.frame.description(obj.id)?;
            let size = content.chars().count();
            if size > limits.max_length {
                Ok(CapturedValue {
                    truncated: Some(true),
                    size: Some(size),
                    ..CapturedValue::with_value(
                        obj.class_name.clone(),
                        content.chars().take(limits.max_length).collect::<String>(),
                    )
                })
            } else {
                Ok(CapturedValue::with_value(obj.class_name.clone(), content))
            }
        }
        ObjectKind::Promise => {
            let state = ctx.frame.promise_state(obj.id)?;
            let mut fields = IndexMap::new();
            let (label, result) = match state {
                PromiseState::Pending => ("pending", None),
                PromiseState::Fulfilled(value) => ("fulfilled", Some(value)),
                PromiseState::Rejected(value) => ("rejected", Some(value)),
            };
            fields.insert(
                "[[state]]".to_string(),
                CapturedValue::with_value("string", label),
            );
            if let Some(value) = result {
                fields.insert(
                    "[[value]]".to_string(),
                    capture_value(ctx, &value, depth_budget - 1, limits)?,
                );
            }
            let mut captured = CapturedValue::of_type(obj.class_name.clone());
            captured.fields = Some(fields);
            Ok(captured)
        }
        ObjectKind::Error => {
            let details = ctx.frame.error_details(obj.id)?;
            let mut fields = IndexMap::new();
            fields.insert(
                "message".to_string(),
                capture_string(&details.message, limits),
            );
            if let Some(stack) = details.stack {
                fields.insert("stack".to_string(), capture_string(&stack, limits));
            }
            capture_fields(ctx, obj, depth_budget, limits, fields)
        }
        ObjectKind::Plain
        | ObjectKind::Function
        | ObjectKind::Proxy
        | ObjectKind::Regex
        | ObjectKind::Date
        | ObjectKind::Class => capture_fields(ctx, obj, depth_budget, limits, IndexMap::new()),
    }
}

/// Own-enumerable-property capture shared by objects, functions, class
/// instances, errors and proxy targets.
fn capture_fields(
    ctx: &mut CaptureContext<'_>,
    obj: &ObjectRef,
    depth_budget: u32,
    limits: &CaptureLimits,
    mut fields: IndexMap<String, CapturedValue>,
) -> SessionResult<CapturedValue> {
    let properties = ctx.frame.own_properties(obj.id)?;
    let size = properties.len();
    for (name, value) in properties.iter().take(limits.max_field_count) {
        let captured = capture_named(ctx, name, value, &limits_at(depth_budget, limits))?;
        fields.insert(name.clone(), captured);
    }
    let mut result = CapturedValue::of_type(object_type_name(ctx, obj));
    result.fields = Some(fields);
    if size > limits.max_field_count {
        result.not_captured_reason = Some(NotCapturedReason::FieldCount);
        result.size = Some(size);
    }
    Ok(result)
}

/// `capture_named` restarts from the full depth budget; shrink it to what
/// this branch has left before delegating.
fn limits_at(depth_budget: u32, limits: &CaptureLimits) -> CaptureLimits {
    CaptureLimits { max_reference_depth: depth_budget - 1, ..*limits }
}

fn map_key_is_redacted(ctx: &CaptureContext<'_>, key: &RemoteValue) -> bool {
    match key {
        RemoteValue::String(s) => ctx.redaction.is_redacted(s),
        RemoteValue::Symbol(description) => ctx.redaction.is_redacted(description),
        _ => false,
    }
}

/// Type tag for a value without descending into it. Proxies report their
/// target description when the session can provide one.
fn capture_type_name(ctx: &CaptureContext<'_>, value: &RemoteValue) -> String {
    match value {
        RemoteValue::Object(obj) => object_type_name(ctx, obj),
        other => type_label(other).to_string(),
    }
}

fn object_type_name(ctx: &CaptureContext<'_>, obj: &ObjectRef) -> String {
    if obj.kind == ObjectKind::Proxy {
        if let Ok(description) = ctx.frame.description(obj.id) {
            return description;
        }
    }
    obj.class_name.clone()
}

/// Canonical decimal rendering: integral doubles print without a fraction.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
