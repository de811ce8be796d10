// Restricted expression DSL
//
// Compiles a whitelisted JSON AST into condition predicates and capture
// expressions evaluated against the paused frame's variable scopes. The
// operator set is closed; there is no way to express iteration or mutation.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value as Json;

use crate::config::CaptureLimits;
use crate::session::{FrameInspector, ObjectKind, RemoteValue, SessionError};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[@A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern"));

/// Whitelisted AST, one variant per operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Ref(String),
    GetMember(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Len(Box<Expr>),
    IsEmpty(Box<Expr>),
    IsDefined(Box<Expr>),
    InstanceOf(Box<Expr>, String),
    StartsWith(Box<Expr>, Box<Expr>),
    EndsWith(Box<Expr>, Box<Expr>),
    Contains(Box<Expr>, Box<Expr>),
    Matches(Box<Expr>, Box<Expr>),
    Substring(Box<Expr>, Box<Expr>, Box<Expr>),
}

/// Malformed AST. Surfaced synchronously to the caller at probe-add time.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CompileError {}

fn compile_error(message: impl Into<String>) -> CompileError {
    CompileError { message: message.into() }
}

/// Compile a JSON AST node into an expression tree.
pub fn compile(node: &Json) -> Result<Expr, CompileError> {
    match node {
        Json::Null => Ok(Expr::Null),
        Json::Bool(b) => Ok(Expr::Bool(*b)),
        Json::Number(n) => n
            .as_f64()
            .map(Expr::Num)
            .ok_or_else(|| compile_error(format!("Unrepresentable number: {n}"))),
        Json::String(s) => Ok(Expr::Str(s.clone())),
        Json::Object(map) if map.len() == 1 => {
            let (op, value) = map.iter().next().expect("len checked");
            compile_operator(op, value)
        }
        other => Err(compile_error(format!("Unknown AST node: {other}"))),
    }
}

fn compile_operator(op: &str, value: &Json) -> Result<Expr, CompileError> {
    match op {
        "ref" => {
            let name = value
                .as_str()
                .ok_or_else(|| compile_error("ref expects an identifier string"))?;
            if !IDENTIFIER.is_match(name) {
                return Err(compile_error(format!("Illegal identifier: {name}")));
            }
            Ok(Expr::Ref(name.to_string()))
        }
        "not" => Ok(Expr::Not(Box::new(compile(value)?))),
        "len" | "count" => Ok(Expr::Len(Box::new(compile(value)?))),
        "isEmpty" => Ok(Expr::IsEmpty(Box::new(compile(value)?))),
        "isDefined" => Ok(Expr::IsDefined(Box::new(compile(value)?))),
        "instanceof" => {
            let [target, type_name] = binary_args(op, value)?;
            let type_name = type_name
                .as_str()
                .ok_or_else(|| compile_error("instanceof expects a type name string"))?;
            Ok(Expr::InstanceOf(Box::new(compile(target)?), type_name.to_string()))
        }
        "getmember" => {
            let [target, member] = binary_args(op, value)?;
            let member = member
                .as_str()
                .ok_or_else(|| compile_error("getmember expects a property name string"))?;
            Ok(Expr::GetMember(Box::new(compile(target)?), member.to_string()))
        }
        "index" => {
            let [target, key] = binary_args(op, value)?;
            Ok(Expr::Index(Box::new(compile(target)?), Box::new(compile(key)?)))
        }
        "and" | "or" => {
            let args = variadic_args(op, value)?;
            Ok(if op == "and" { Expr::And(args) } else { Expr::Or(args) })
        }
        "eq" | "ne" | "gt" | "ge" | "lt" | "le" | "startsWith" | "endsWith" | "contains"
        | "matches" => {
            let [lhs, rhs] = binary_args(op, value)?;
            let lhs = Box::new(compile(lhs)?);
            let rhs = Box::new(compile(rhs)?);
            Ok(match op {
                "eq" => Expr::Eq(lhs, rhs),
                "ne" => Expr::Ne(lhs, rhs),
                "gt" => Expr::Gt(lhs, rhs),
                "ge" => Expr::Ge(lhs, rhs),
                "lt" => Expr::Lt(lhs, rhs),
                "le" => Expr::Le(lhs, rhs),
                "startsWith" => Expr::StartsWith(lhs, rhs),
                "endsWith" => Expr::EndsWith(lhs, rhs),
                "contains" => Expr::Contains(lhs, rhs),
                _ => Expr::Matches(lhs, rhs),
            })
        }
        "substring" => {
            let args = value
                .as_array()
                .filter(|a| a.len() == 3)
                .ok_or_else(|| compile_error("substring expects [target, from, to]"))?;
            Ok(Expr::Substring(
                Box::new(compile(&args[0])?),
                Box::new(compile(&args[1])?),
                Box::new(compile(&args[2])?),
            ))
        }
        other => Err(compile_error(format!("Unknown AST node type: {other}"))),
    }
}

fn binary_args<'a>(op: &str, value: &'a Json) -> Result<[&'a Json; 2], CompileError> {
    let args = value
        .as_array()
        .filter(|a| a.len() == 2)
        .ok_or_else(|| compile_error(format!("{op} expects exactly two arguments")))?;
    Ok([&args[0], &args[1]])
}

fn variadic_args(op: &str, value: &Json) -> Result<Vec<Expr>, CompileError> {
    let args = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| compile_error(format!("{op} expects at least two arguments")))?;
    args.iter().map(compile).collect()
}

/// Non-fatal unless `kind` is `Fatal`: evaluation errors are recorded
/// per-occurrence, fatal ones disable further capture for the probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    Reference,
    Type,
    General,
    /// The debug session itself failed to answer.
    Fatal,
}

impl fmt::Display for EvalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalErrorKind::Reference => f.write_str("ReferenceError"),
            EvalErrorKind::Type => f.write_str("TypeError"),
            EvalErrorKind::General | EvalErrorKind::Fatal => f.write_str("Error"),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EvalError {}

impl From<SessionError> for EvalError {
    fn from(err: SessionError) -> Self {
        EvalError { kind: EvalErrorKind::Fatal, message: err.to_string() }
    }
}

impl EvalError {
    fn reference(message: impl Into<String>) -> Self {
        EvalError { kind: EvalErrorKind::Reference, message: message.into() }
    }

    fn type_error(message: impl Into<String>) -> Self {
        EvalError { kind: EvalErrorKind::Type, message: message.into() }
    }

    fn general(message: impl Into<String>) -> Self {
        EvalError { kind: EvalErrorKind::General, message: message.into() }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == EvalErrorKind::Fatal
    }
}

/// A compiled condition predicate.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub dsl: String,
    expr: Expr,
}

impl CompiledCondition {
    pub fn evaluate(&self, frame: &dyn FrameInspector) -> Result<bool, EvalError> {
        Ok(is_truthy(&eval(&self.expr, frame)?))
    }
}

/// A compiled capture expression with its fully resolved limits.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    pub name: String,
    pub dsl: String,
    expr: Expr,
    pub limits: CaptureLimits,
}

impl CompiledExpression {
    pub fn evaluate(&self, frame: &dyn FrameInspector) -> Result<RemoteValue, EvalError> {
        eval(&self.expr, frame)
    }
}

pub fn compile_condition(dsl: &str, json: &Json) -> Result<CompiledCondition, CompileError> {
    Ok(CompiledCondition { dsl: dsl.to_string(), expr: compile(json)? })
}

pub fn compile_capture_expression(
    name: &str,
    dsl: &str,
    json: &Json,
    limits: CaptureLimits,
) -> Result<CompiledExpression, CompileError> {
    Ok(CompiledExpression {
        name: name.to_string(),
        dsl: dsl.to_string(),
        expr: compile(json)?,
        limits,
    })
}

pub(crate) fn eval_expr(
    expr: &Expr,
    frame: &dyn FrameInspector,
) -> Result<RemoteValue, EvalError> {
    eval(expr, frame)
}

/// The condition installed into a native breakpoint: the OR of every
/// attached probe's condition. Pure data; combining never touches a session.
#[derive(Debug, Clone)]
pub struct CombinedCondition {
    pub dsl: String,
    parts: Vec<Arc<CompiledCondition>>,
}

impl CombinedCondition {
    /// `None` means "always pause": at least one attached probe has no
    /// condition of its own.
    pub fn combine(conditions: &[Option<Arc<CompiledCondition>>]) -> Option<Self> {
        let mut parts = Vec::with_capacity(conditions.len());
        for condition in conditions {
            parts.push(Arc::clone(condition.as_ref()?));
        }
        let dsl = parts
            .iter()
            .map(|part| part.dsl.as_str())
            .collect::<Vec<_>>()
            .join(" || ");
        Some(CombinedCondition { dsl, parts })
    }

    /// A part that fails to evaluate counts as unmet; the others still run.
    pub fn evaluate(&self, frame: &dyn FrameInspector) -> bool {
        self.parts.iter().any(|part| part.evaluate(frame).unwrap_or(false))
    }
}

pub fn is_truthy(value: &RemoteValue) -> bool {
    match value {
        RemoteValue::Undefined | RemoteValue::Null => false,
        RemoteValue::Boolean(b) => *b,
        RemoteValue::Number(n) => *n != 0.0 && !n.is_nan(),
        RemoteValue::BigInt(digits) => digits != "0",
        RemoteValue::Symbol(_) => true,
        RemoteValue::String(s) => !s.is_empty(),
        RemoteValue::Object(_) => true,
    }
}

fn eval(expr: &Expr, frame: &dyn FrameInspector) -> Result<RemoteValue, EvalError> {
    match expr {
        Expr::Null => Ok(RemoteValue::Null),
        Expr::Bool(b) => Ok(RemoteValue::Boolean(*b)),
        Expr::Num(n) => Ok(RemoteValue::Number(*n)),
        Expr::Str(s) => Ok(RemoteValue::String(s.clone())),
        Expr::Ref(name) => lookup(name, frame),
        Expr::GetMember(target, member) => get_member(&eval(target, frame)?, member, frame),
        Expr::Index(target, key) => {
            let target = eval(target, frame)?;
            let key = eval(key, frame)?;
            index(&target, &key, frame)
        }
        Expr::Not(inner) => Ok(RemoteValue::Boolean(!is_truthy(&eval(inner, frame)?))),
        Expr::And(args) => {
            for arg in args {
                if !is_truthy(&eval(arg, frame)?) {
                    return Ok(RemoteValue::Boolean(false));
                }
            }
            Ok(RemoteValue::Boolean(true))
        }
        Expr::Or(args) => {
            for arg in args {
                if is_truthy(&eval(arg, frame)?) {
                    return Ok(RemoteValue::Boolean(true));
                }
            }
            Ok(RemoteValue::Boolean(false))
        }
        Expr::Eq(lhs, rhs) => Ok(RemoteValue::Boolean(values_equal(
            &eval(lhs, frame)?,
            &eval(rhs, frame)?,
        ))),
        Expr::Ne(lhs, rhs) => Ok(RemoteValue::Boolean(!values_equal(
            &eval(lhs, frame)?,
            &eval(rhs, frame)?,
        ))),
        Expr::Gt(lhs, rhs) => compare(&eval(lhs, frame)?, &eval(rhs, frame)?, |o| o.is_gt()),
        Expr::Ge(lhs, rhs) => compare(&eval(lhs, frame)?, &eval(rhs, frame)?, |o| o.is_ge()),
        Expr::Lt(lhs, rhs) => compare(&eval(lhs, frame)?, &eval(rhs, frame)?, |o| o.is_lt()),
        Expr::Le(lhs, rhs) => compare(&eval(lhs, frame)?, &eval(rhs, frame)?, |o| o.is_le()),
        Expr::Len(inner) => Ok(RemoteValue::Number(length(&eval(inner, frame)?, frame)? as f64)),
        Expr::IsEmpty(inner) => {
            Ok(RemoteValue::Boolean(length(&eval(inner, frame)?, frame)? == 0))
        }
        Expr::IsDefined(inner) => Ok(RemoteValue::Boolean(eval(inner, frame).is_ok())),
        Expr::InstanceOf(target, type_name) => {
            Ok(RemoteValue::Boolean(instance_of(&eval(target, frame)?, type_name)))
        }
        Expr::StartsWith(lhs, rhs) => {
            let (subject, prefix) = string_pair(&eval(lhs, frame)?, &eval(rhs, frame)?)?;
            Ok(RemoteValue::Boolean(subject.starts_with(&prefix)))
        }
        Expr::EndsWith(lhs, rhs) => {
            let (subject, suffix) = string_pair(&eval(lhs, frame)?, &eval(rhs, frame)?)?;
            Ok(RemoteValue::Boolean(subject.ends_with(&suffix)))
        }
        Expr::Contains(lhs, rhs) => {
            let target = eval(lhs, frame)?;
            let needle = eval(rhs, frame)?;
            contains(&target, &needle, frame)
        }
        Expr::Matches(lhs, rhs) => {
            let subject = eval(lhs, frame)?;
            let pattern = eval(rhs, frame)?;
            matches_regex(&subject, &pattern)
        }
        Expr::Substring(target, from, to) => {
            let target = eval(target, frame)?;
            let from = eval(from, frame)?;
            let to = eval(to, frame)?;
            substring(&target, &from, &to)
        }
    }
}

/// Resolve a bare variable name against the scope chain, innermost first.
fn lookup(name: &str, frame: &dyn FrameInspector) -> Result<RemoteValue, EvalError> {
    for scope in frame.scope_chain()? {
        for (variable, value) in frame.own_properties(scope.object)? {
            if variable == name {
                return Ok(value);
            }
        }
    }
    Err(EvalError::reference(format!("{name} is not defined")))
}

fn get_member(
    target: &RemoteValue,
    member: &str,
    frame: &dyn FrameInspector,
) -> Result<RemoteValue, EvalError> {
    let RemoteValue::Object(obj) = target else {
        return Err(EvalError::type_error(format!(
            "Cannot read property {member} of {}",
            type_label(target)
        )));
    };
    match obj.kind {
        ObjectKind::Map | ObjectKind::WeakMap => {
            Err(EvalError::general("Accessing a Map is not allowed"))
        }
        ObjectKind::Set | ObjectKind::WeakSet => {
            Err(EvalError::general("Accessing a Set is not allowed"))
        }
        ObjectKind::Proxy => Err(EvalError::general("Possibility of side effect")),
        _ => {
            for (name, value) in frame.own_properties(obj.id)? {
                if name == member {
                    return Ok(value);
                }
            }
            Ok(RemoteValue::Undefined)
        }
    }
}

fn index(
    target: &RemoteValue,
    key: &RemoteValue,
    frame: &dyn FrameInspector,
) -> Result<RemoteValue, EvalError> {
    match target {
        RemoteValue::String(s) => {
            let i = index_number(key)?;
            Ok(s.chars()
                .nth(i)
                .map(|c| RemoteValue::String(c.to_string()))
                .unwrap_or(RemoteValue::Undefined))
        }
        RemoteValue::Object(obj) => match obj.kind {
            ObjectKind::Array | ObjectKind::TypedArray => {
                let i = index_number(key)?;
                Ok(frame.elements(obj.id)?.into_iter().nth(i).unwrap_or(RemoteValue::Undefined))
            }
            ObjectKind::Map | ObjectKind::WeakMap => {
                for (entry_key, value) in frame.entries(obj.id)? {
                    if values_equal(&entry_key, key) {
                        return Ok(value);
                    }
                }
                Ok(RemoteValue::Undefined)
            }
            ObjectKind::Set | ObjectKind::WeakSet => {
                Err(EvalError::general("Accessing a Set is not allowed"))
            }
            ObjectKind::Proxy => Err(EvalError::general("Possibility of side effect")),
            _ => {
                let RemoteValue::String(name) = key else {
                    return Err(EvalError::type_error("Object index must be a string"));
                };
                get_member(target, name, frame)
            }
        },
        other => Err(EvalError::type_error(format!(
            "Cannot index a value of type {}",
            type_label(other)
        ))),
    }
}

fn index_number(key: &RemoteValue) -> Result<usize, EvalError> {
    match key {
        RemoteValue::Number(n) if *n >= 0.0 && n.fract() == 0.0 => Ok(*n as usize),
        other => Err(EvalError::type_error(format!(
            "Index must be a non-negative integer, got {}",
            type_label(other)
        ))),
    }
}

fn values_equal(a: &RemoteValue, b: &RemoteValue) -> bool {
    match (a, b) {
        (RemoteValue::Undefined, RemoteValue::Undefined) => true,
        (RemoteValue::Null, RemoteValue::Null) => true,
        (RemoteValue::Boolean(a), RemoteValue::Boolean(b)) => a == b,
        (RemoteValue::Number(a), RemoteValue::Number(b)) => a == b,
        (RemoteValue::BigInt(a), RemoteValue::BigInt(b)) => a == b,
        (RemoteValue::Symbol(a), RemoteValue::Symbol(b)) => a == b,
        (RemoteValue::String(a), RemoteValue::String(b)) => a == b,
        (RemoteValue::Object(a), RemoteValue::Object(b)) => a.id == b.id,
        _ => false,
    }
}

fn compare(
    a: &RemoteValue,
    b: &RemoteValue,
    check: fn(std::cmp::Ordering) -> bool,
) -> Result<RemoteValue, EvalError> {
    let ordering = match (a, b) {
        (RemoteValue::Number(a), RemoteValue::Number(b)) => a.partial_cmp(b),
        (RemoteValue::String(a), RemoteValue::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(EvalError::type_error(format!(
                "Cannot compare {} with {}",
                type_label(a),
                type_label(b)
            )))
        }
    };
    Ok(RemoteValue::Boolean(ordering.is_some_and(check)))
}

fn length(value: &RemoteValue, frame: &dyn FrameInspector) -> Result<usize, EvalError> {
    match value {
        RemoteValue::String(s) => Ok(s.chars().count()),
        RemoteValue::Object(obj) => match obj.kind {
            ObjectKind::Array | ObjectKind::TypedArray | ObjectKind::Set => {
                Ok(frame.elements(obj.id)?.len())
            }
            ObjectKind::Map => Ok(frame.entries(obj.id)?.len()),
            ObjectKind::WeakSet | ObjectKind::WeakMap => {
                Err(EvalError::type_error("Cannot get size of a weak collection"))
            }
            ObjectKind::Buffer => Ok(frame.description(obj.id)?.chars().count()),
            _ => Ok(frame.own_properties(obj.id)?.len()),
        },
        other => Err(EvalError::type_error(format!(
            "Cannot get length of {}",
            type_label(other)
        ))),
    }
}

fn contains(
    target: &RemoteValue,
    needle: &RemoteValue,
    frame: &dyn FrameInspector,
) -> Result<RemoteValue, EvalError> {
    match target {
        RemoteValue::String(s) => {
            let RemoteValue::String(needle) = needle else {
                return Err(EvalError::type_error("Variable is not a string"));
            };
            Ok(RemoteValue::Boolean(s.contains(needle)))
        }
        RemoteValue::Object(obj) => match obj.kind {
            ObjectKind::Array | ObjectKind::TypedArray | ObjectKind::Set | ObjectKind::WeakSet => {
                let found =
                    frame.elements(obj.id)?.iter().any(|element| values_equal(element, needle));
                Ok(RemoteValue::Boolean(found))
            }
            ObjectKind::Map | ObjectKind::WeakMap => {
                let found = frame.entries(obj.id)?.iter().any(|(key, _)| values_equal(key, needle));
                Ok(RemoteValue::Boolean(found))
            }
            _ => Err(EvalError::type_error("Variable does not support contains")),
        },
        _ => Err(EvalError::type_error("Variable does not support contains")),
    }
}

fn string_pair(lhs: &RemoteValue, rhs: &RemoteValue) -> Result<(String, String), EvalError> {
    let RemoteValue::String(lhs) = lhs else {
        return Err(EvalError::type_error("Variable is not a string"));
    };
    let RemoteValue::String(rhs) = rhs else {
        return Err(EvalError::type_error("Variable is not a string"));
    };
    Ok((lhs.clone(), rhs.clone()))
}

fn matches_regex(subject: &RemoteValue, pattern: &RemoteValue) -> Result<RemoteValue, EvalError> {
    let RemoteValue::String(subject) = subject else {
        return Err(EvalError::type_error("Variable is not a string"));
    };
    let RemoteValue::String(pattern) = pattern else {
        return Err(EvalError::type_error("Regular expression must be a string"));
    };
    let regex = Regex::new(pattern)
        .map_err(|err| EvalError::general(format!("Invalid regular expression: {err}")))?;
    Ok(RemoteValue::Boolean(regex.is_match(subject)))
}

fn substring(
    target: &RemoteValue,
    from: &RemoteValue,
    to: &RemoteValue,
) -> Result<RemoteValue, EvalError> {
    let RemoteValue::String(s) = target else {
        return Err(EvalError::type_error("Variable is not a string"));
    };
    let mut from = index_number(from)?;
    let mut to = index_number(to)?;
    let len = s.chars().count();
    from = from.min(len);
    to = to.min(len);
    if from > to {
        std::mem::swap(&mut from, &mut to);
    }
    Ok(RemoteValue::String(s.chars().skip(from).take(to - from).collect()))
}

fn instance_of(value: &RemoteValue, type_name: &str) -> bool {
    match type_name {
        "string" => matches!(value, RemoteValue::String(_)),
        "number" => matches!(value, RemoteValue::Number(_)),
        "boolean" => matches!(value, RemoteValue::Boolean(_)),
        "undefined" => matches!(value, RemoteValue::Undefined),
        "symbol" => matches!(value, RemoteValue::Symbol(_)),
        "bigint" => matches!(value, RemoteValue::BigInt(_)),
        "null" => matches!(value, RemoteValue::Null),
        _ => match value {
            RemoteValue::Object(obj) => obj.class_name == type_name,
            _ => false,
        },
    }
}

/// Printable category name, used in error messages and as the `type` of
/// not-captured markers for primitives.
pub(crate) fn type_label(value: &RemoteValue) -> &str {
    match value {
        RemoteValue::Undefined => "undefined",
        RemoteValue::Null => "null",
        RemoteValue::Boolean(_) => "boolean",
        RemoteValue::Number(_) => "number",
        RemoteValue::BigInt(_) => "bigint",
        RemoteValue::Symbol(_) => "symbol",
        RemoteValue::String(_) => "string",
        RemoteValue::Object(obj) => &obj.class_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFrame;
    use serde_json::json;

    fn condition(json: Json) -> CompiledCondition {
        compile_condition("<test>", &json).unwrap()
    }

    #[test]
    fn test_compile_rejects_unknown_operator() {
        let err = compile(&json!({ "invalid": "condition" })).unwrap_err();
        assert!(err.message.contains("Unknown AST node type: invalid"));
    }

    #[test]
    fn test_compile_rejects_illegal_identifier() {
        let err = compile(&json!({ "ref": "not a valid identifier!" })).unwrap_err();
        assert!(err.message.contains("Illegal identifier"));
    }

    #[test]
    fn test_eq_against_frame_variable() {
        let mut frame = MockFrame::new();
        frame.local("foo", RemoteValue::Number(42.0));

        let met = condition(json!({ "eq": [{ "ref": "foo" }, 42] }));
        let unmet = condition(json!({ "eq": [{ "ref": "foo" }, 43] }));
        assert!(met.evaluate(&frame).unwrap());
        assert!(!unmet.evaluate(&frame).unwrap());
    }

    #[test]
    fn test_unknown_ref_is_reference_error() {
        let frame = MockFrame::new();
        let cond = condition(json!({ "ref": "missing" }));
        let err = cond.evaluate(&frame).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::Reference);
        assert_eq!(err.to_string(), "ReferenceError: missing is not defined");
    }

    #[test]
    fn test_getmember_and_missing_member() {
        let mut frame = MockFrame::new();
        let obj = frame.object("Object", &[("bar", RemoteValue::String("x".to_string()))]);
        frame.local("foo", obj);

        let present = condition(json!({ "eq": [{ "getmember": [{ "ref": "foo" }, "bar"] }, "x"] }));
        assert!(present.evaluate(&frame).unwrap());

        let missing = condition(json!({ "isDefined": { "getmember": [{ "ref": "foo" }, "nope"] } }));
        // A missing member is undefined, not an error.
        assert!(missing.evaluate(&frame).unwrap());
    }

    #[test]
    fn test_getmember_on_map_is_denied() {
        let mut frame = MockFrame::new();
        let map = frame.map("Map", &[]);
        frame.local("m", map);

        let cond = condition(json!({ "getmember": [{ "ref": "m" }, "k"] }));
        let err = cond.evaluate(&frame).unwrap_err();
        assert_eq!(err.to_string(), "Error: Accessing a Map is not allowed");
    }

    #[test]
    fn test_index_array_map_and_string() {
        let mut frame = MockFrame::new();
        let arr = frame.array("Array", vec![RemoteValue::Number(7.0), RemoteValue::Number(8.0)]);
        let map = frame.map(
            "Map",
            &[(RemoteValue::String("k".to_string()), RemoteValue::Number(9.0))],
        );
        frame.local("arr", arr);
        frame.local("map", map);
        frame.local("s", RemoteValue::String("abc".to_string()));

        let arr_hit = condition(json!({ "eq": [{ "index": [{ "ref": "arr" }, 1] }, 8] }));
        assert!(arr_hit.evaluate(&frame).unwrap());

        let map_hit = condition(json!({ "eq": [{ "index": [{ "ref": "map" }, "k"] }, 9] }));
        assert!(map_hit.evaluate(&frame).unwrap());

        let str_hit = condition(json!({ "eq": [{ "index": [{ "ref": "s" }, 2] }, "c"] }));
        assert!(str_hit.evaluate(&frame).unwrap());
    }

    #[test]
    fn test_len_is_empty_and_contains() {
        let mut frame = MockFrame::new();
        let arr = frame.array(
            "Array",
            vec![RemoteValue::Number(1.0), RemoteValue::Number(2.0), RemoteValue::Number(3.0)],
        );
        frame.local("arr", arr);
        frame.local("s", RemoteValue::String("hello".to_string()));

        assert!(condition(json!({ "eq": [{ "len": { "ref": "arr" } }, 3] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "eq": [{ "count": { "ref": "s" } }, 5] }))
            .evaluate(&frame)
            .unwrap());
        assert!(!condition(json!({ "isEmpty": { "ref": "arr" } })).evaluate(&frame).unwrap());
        assert!(condition(json!({ "contains": [{ "ref": "arr" }, 2] })).evaluate(&frame).unwrap());
        assert!(condition(json!({ "contains": [{ "ref": "s" }, "ell"] }))
            .evaluate(&frame)
            .unwrap());
    }

    #[test]
    fn test_string_operators() {
        let mut frame = MockFrame::new();
        frame.local("s", RemoteValue::String("hello world".to_string()));

        assert!(condition(json!({ "startsWith": [{ "ref": "s" }, "hello"] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "endsWith": [{ "ref": "s" }, "world"] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "matches": [{ "ref": "s" }, "^h.*d$"] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(
            json!({ "eq": [{ "substring": [{ "ref": "s" }, 0, 5] }, "hello"] })
        )
        .evaluate(&frame)
        .unwrap());
    }

    #[test]
    fn test_comparison_type_mismatch_is_type_error() {
        let mut frame = MockFrame::new();
        frame.local("s", RemoteValue::String("x".to_string()));

        let cond = condition(json!({ "gt": [{ "ref": "s" }, 5] }));
        let err = cond.evaluate(&frame).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::Type);
    }

    #[test]
    fn test_logical_operators_and_truthiness() {
        let mut frame = MockFrame::new();
        frame.local("n", RemoteValue::Number(1.0));
        frame.local("empty", RemoteValue::String(String::new()));

        assert!(condition(json!({ "and": [{ "ref": "n" }, true] })).evaluate(&frame).unwrap());
        assert!(!condition(json!({ "and": [{ "ref": "n" }, { "ref": "empty" }] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "or": [{ "ref": "empty" }, { "ref": "n" }] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "not": { "ref": "empty" } })).evaluate(&frame).unwrap());
    }

    #[test]
    fn test_is_defined_swallows_errors() {
        let frame = MockFrame::new();
        let cond = condition(json!({ "isDefined": { "ref": "missing" } }));
        assert!(!cond.evaluate(&frame).unwrap());
    }

    #[test]
    fn test_instance_of() {
        let mut frame = MockFrame::new();
        let obj = frame.object("MyService", &[]);
        frame.local("svc", obj);
        frame.local("s", RemoteValue::String("x".to_string()));

        assert!(condition(json!({ "instanceof": [{ "ref": "svc" }, "MyService"] }))
            .evaluate(&frame)
            .unwrap());
        assert!(condition(json!({ "instanceof": [{ "ref": "s" }, "string"] }))
            .evaluate(&frame)
            .unwrap());
        assert!(!condition(json!({ "instanceof": [{ "ref": "s" }, "number"] }))
            .evaluate(&frame)
            .unwrap());
    }

    #[test]
    fn test_combine_conditions() {
        let a = Arc::new(condition(json!({ "eq": [{ "ref": "foo" }, 42] })));
        let b = Arc::new(condition(json!({ "eq": [{ "ref": "foo" }, 43] })));

        // Any unconditional probe makes the combination unconditional.
        assert!(CombinedCondition::combine(&[Some(a.clone()), None]).is_none());

        let combined = CombinedCondition::combine(&[Some(a), Some(b)]).unwrap();
        assert_eq!(combined.dsl, "<test> || <test>");

        let mut frame = MockFrame::new();
        frame.local("foo", RemoteValue::Number(43.0));
        assert!(combined.evaluate(&frame));

        let mut other = MockFrame::new();
        other.local("foo", RemoteValue::Number(1.0));
        assert!(!combined.evaluate(&other));
    }

    #[test]
    fn test_combined_condition_part_error_counts_as_unmet() {
        let failing = Arc::new(condition(json!({ "gt": [{ "ref": "s" }, 5] })));
        let passing = Arc::new(condition(json!({ "eq": [{ "ref": "n" }, 1] })));
        let combined = CombinedCondition::combine(&[Some(failing), Some(passing)]).unwrap();

        let mut frame = MockFrame::new();
        frame.local("s", RemoteValue::String("x".to_string()));
        frame.local("n", RemoteValue::Number(1.0));
        assert!(combined.evaluate(&frame));
    }
}
