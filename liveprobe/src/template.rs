// Template rendering
//
// A template is an ordered list of literal strings and expressions. At hit
// time every expression segment is evaluated and stringified with a shallow
// canonical preview; a failing segment renders inline while the others still
// render. The assembled message is capped at a fixed byte budget.

use crate::config::SegmentConfig;
use crate::dsl::{self, Expr};
use crate::session::{FrameInspector, ObjectKind, PromiseState, RemoteValue};

pub const MAX_MESSAGE_BYTES: usize = 8 * 1024;

const ELLIPSIS: &str = "\u{2026}";
const PREVIEW_ITEMS: usize = 5;
const PREVIEW_DEPTH: u32 = 2;
const BUFFER_PREVIEW_CHARS: usize = 32;

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Expression { dsl: String, expr: Expr },
}

#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

/// A segment that failed to compile, with the dsl that names it in the
/// resulting diagnostic.
#[derive(Debug, Clone)]
pub struct SegmentCompileError {
    pub dsl: String,
    pub message: String,
}

impl std::fmt::Display for SegmentCompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.dsl, self.message)
    }
}

impl std::error::Error for SegmentCompileError {}

/// A template made only of literal segments never needs the paused frame.
pub fn requires_evaluation(segments: &[SegmentConfig]) -> bool {
    segments.iter().any(|segment| matches!(segment, SegmentConfig::Expression { .. }))
}

#[derive(Debug, Clone, Default)]
pub struct RenderedMessage {
    pub message: String,
    /// (expression dsl, error display) per failed segment.
    pub errors: Vec<(String, String)>,
}

impl Template {
    pub fn compile(segments: &[SegmentConfig]) -> Result<Template, SegmentCompileError> {
        let segments = segments
            .iter()
            .map(|segment| match segment {
                SegmentConfig::Literal { str } => Ok(Segment::Literal(str.clone())),
                SegmentConfig::Expression { dsl, json } => match dsl::compile(json) {
                    Ok(expr) => Ok(Segment::Expression { dsl: dsl.clone(), expr }),
                    Err(err) => {
                        Err(SegmentCompileError { dsl: dsl.clone(), message: err.message })
                    }
                },
            })
            .collect::<Result<Vec<_>, SegmentCompileError>>()?;
        Ok(Template { segments })
    }

    /// A plain message with nothing to evaluate.
    pub fn literal(text: &str) -> Template {
        Template { segments: vec![Segment::Literal(text.to_string())] }
    }

    pub fn render(&self, frame: &dyn FrameInspector) -> RenderedMessage {
        let mut rendered = RenderedMessage::default();
        let mut truncated = false;

        for segment in &self.segments {
            if truncated {
                break;
            }
            match segment {
                Segment::Literal(text) => {
                    push_capped(&mut rendered.message, text, &mut truncated);
                }
                Segment::Expression { dsl, expr } => {
                    let piece = match dsl::eval_expr(expr, frame) {
                        // Top-level string results render raw, without quotes.
                        Ok(RemoteValue::String(s)) => s,
                        Ok(value) => match preview(&value, frame, PREVIEW_DEPTH) {
                            Ok(text) => text,
                            Err(err) => {
                                rendered.errors.push((dsl.clone(), err.to_string()));
                                format!("{{{}: {}}}", err.kind, err.message)
                            }
                        },
                        Err(err) => {
                            rendered.errors.push((dsl.clone(), err.to_string()));
                            format!("{{{}: {}}}", err.kind, err.message)
                        }
                    };
                    push_capped(&mut rendered.message, &piece, &mut truncated);
                }
            }
        }

        rendered
    }
}

/// Append within the message budget; on overflow, cut at a char boundary and
/// append a single ellipsis.
fn push_capped(message: &mut String, piece: &str, truncated: &mut bool) {
    if message.len() + piece.len() <= MAX_MESSAGE_BYTES {
        message.push_str(piece);
        return;
    }
    let mut budget = (MAX_MESSAGE_BYTES - ELLIPSIS.len()).saturating_sub(message.len());
    while budget > 0 && !piece.is_char_boundary(budget) {
        budget -= 1;
    }
    message.push_str(&piece[..budget]);
    message.push_str(ELLIPSIS);
    *truncated = true;
}

/// Canonical shallow inspection format: collections show their first few
/// items plus a "... N more" marker, nesting is elided past a fixed depth.
fn preview(
    value: &RemoteValue,
    frame: &dyn FrameInspector,
    depth: u32,
) -> Result<String, dsl::EvalError> {
    Ok(match value {
        RemoteValue::Undefined => "undefined".to_string(),
        RemoteValue::Null => "null".to_string(),
        RemoteValue::Boolean(b) => (if *b { "true" } else { "false" }).to_string(),
        RemoteValue::Number(n) => crate::capture::format_number(*n),
        RemoteValue::BigInt(digits) => format!("{digits}n"),
        RemoteValue::Symbol(description) => description.clone(),
        RemoteValue::String(s) => format!("'{s}'"),
        RemoteValue::Object(obj) => match obj.kind {
            ObjectKind::Regex | ObjectKind::Date | ObjectKind::Class | ObjectKind::Function => {
                frame
                    .description(obj.id)
                    .unwrap_or_else(|_| format!("[{}]", obj.class_name))
            }
            ObjectKind::Error => {
                let details = frame.error_details(obj.id)?;
                format!("{}: {}", obj.class_name, details.message)
            }
            ObjectKind::Promise => match frame.promise_state(obj.id)? {
                PromiseState::Pending => "Promise { <pending> }".to_string(),
                PromiseState::Fulfilled(inner) => {
                    format!("Promise {{ {} }}", preview_nested(&inner, frame, depth)?)
                }
                PromiseState::Rejected(inner) => {
                    format!("Promise {{ <rejected> {} }}", preview_nested(&inner, frame, depth)?)
                }
            },
            ObjectKind::Buffer => {
                let content = frame.description(obj.id).unwrap_or_default();
                let shown: String = content.chars().take(BUFFER_PREVIEW_CHARS).collect();
                if content.chars().count() > BUFFER_PREVIEW_CHARS {
                    format!("<Buffer {shown}{ELLIPSIS}>")
                } else {
                    format!("<Buffer {shown}>")
                }
            }
            ObjectKind::Array | ObjectKind::TypedArray => {
                if depth == 0 {
                    return Ok(format!("[{}]", obj.class_name));
                }
                let elements = frame.elements(obj.id)?;
                let mut parts = Vec::with_capacity(elements.len().min(PREVIEW_ITEMS));
                for element in elements.iter().take(PREVIEW_ITEMS) {
                    parts.push(preview_nested(element, frame, depth)?);
                }
                format!("[ {} ]", with_more_marker(parts, elements.len()))
            }
            ObjectKind::Set | ObjectKind::WeakSet => {
                if depth == 0 {
                    return Ok(format!("[{}]", obj.class_name));
                }
                let elements = frame.elements(obj.id)?;
                let mut parts = Vec::with_capacity(elements.len().min(PREVIEW_ITEMS));
                for element in elements.iter().take(PREVIEW_ITEMS) {
                    parts.push(preview_nested(element, frame, depth)?);
                }
                format!(
                    "{}({}) {{ {} }}",
                    obj.class_name,
                    elements.len(),
                    with_more_marker(parts, elements.len())
                )
            }
            ObjectKind::Map | ObjectKind::WeakMap => {
                if depth == 0 {
                    return Ok(format!("[{}]", obj.class_name));
                }
                let entries = frame.entries(obj.id)?;
                let mut parts = Vec::with_capacity(entries.len().min(PREVIEW_ITEMS));
                for (key, entry_value) in entries.iter().take(PREVIEW_ITEMS) {
                    parts.push(format!(
                        "{} => {}",
                        preview_nested(key, frame, depth)?,
                        preview_nested(entry_value, frame, depth)?
                    ));
                }
                format!(
                    "{}({}) {{ {} }}",
                    obj.class_name,
                    entries.len(),
                    with_more_marker(parts, entries.len())
                )
            }
            ObjectKind::Plain | ObjectKind::Proxy => {
                if depth == 0 {
                    return Ok(format!("[{}]", obj.class_name));
                }
                let properties = frame.own_properties(obj.id)?;
                let mut parts = Vec::with_capacity(properties.len().min(PREVIEW_ITEMS));
                for (name, property) in properties.iter().take(PREVIEW_ITEMS) {
                    parts.push(format!("{name}: {}", preview_nested(property, frame, depth)?));
                }
                let body = if parts.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", with_more_marker(parts, properties.len()))
                };
                if obj.class_name == "Object" {
                    body
                } else {
                    format!("{} {}", obj.class_name, body)
                }
            }
        },
    })
}

fn preview_nested(
    value: &RemoteValue,
    frame: &dyn FrameInspector,
    depth: u32,
) -> Result<String, dsl::EvalError> {
    preview(value, frame, depth.saturating_sub(1))
}

fn with_more_marker(parts: Vec<String>, total: usize) -> String {
    let shown = parts.len();
    let mut joined = parts.join(", ");
    if total > shown {
        joined.push_str(&format!(", ... {} more", total - shown));
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFrame;
    use serde_json::json;

    fn segments(json: serde_json::Value) -> Vec<SegmentConfig> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_requires_evaluation() {
        assert!(!requires_evaluation(&segments(json!([{ "str": "hello" }]))));
        assert!(requires_evaluation(&segments(json!([
            { "str": "x is " },
            { "dsl": "x", "json": { "ref": "x" } }
        ]))));
    }

    #[test]
    fn test_render_literals_and_expressions() {
        let mut frame = MockFrame::new();
        frame.local("count", RemoteValue::Number(7.0));
        frame.local("name", RemoteValue::String("alice".to_string()));

        let template = Template::compile(&segments(json!([
            { "str": "user " },
            { "dsl": "name", "json": { "ref": "name" } },
            { "str": " has " },
            { "dsl": "count", "json": { "ref": "count" } },
            { "str": " items" }
        ])))
        .unwrap();

        let rendered = template.render(&frame);
        // Top-level strings render raw, numbers canonically.
        assert_eq!(rendered.message, "user alice has 7 items");
        assert!(rendered.errors.is_empty());
    }

    #[test]
    fn test_failing_segment_renders_inline() {
        let mut frame = MockFrame::new();
        frame.local("ok", RemoteValue::String("fine".to_string()));

        let template = Template::compile(&segments(json!([
            { "dsl": "missing", "json": { "ref": "missing" } },
            { "str": " / " },
            { "dsl": "ok", "json": { "ref": "ok" } }
        ])))
        .unwrap();

        let rendered = template.render(&frame);
        assert_eq!(rendered.message, "{ReferenceError: missing is not defined} / fine");
        assert_eq!(rendered.errors.len(), 1);
        assert_eq!(rendered.errors[0].0, "missing");
        assert_eq!(rendered.errors[0].1, "ReferenceError: missing is not defined");
    }

    #[test]
    fn test_object_and_collection_previews() {
        let mut frame = MockFrame::new();
        let obj = frame.object(
            "Object",
            &[
                ("a", RemoteValue::Number(1.0)),
                ("b", RemoteValue::String("x".to_string())),
            ],
        );
        let arr = frame.array(
            "Array",
            (0..8).map(|i| RemoteValue::Number(i as f64)).collect(),
        );
        frame.local("obj", obj);
        frame.local("arr", arr);

        let template = Template::compile(&segments(json!([
            { "dsl": "obj", "json": { "ref": "obj" } },
            { "str": " " },
            { "dsl": "arr", "json": { "ref": "arr" } }
        ])))
        .unwrap();

        let rendered = template.render(&frame);
        assert_eq!(rendered.message, "{ a: 1, b: 'x' } [ 0, 1, 2, 3, 4, ... 3 more ]");
    }

    #[test]
    fn test_map_preview_and_class_prefix() {
        let mut frame = MockFrame::new();
        let map = frame.map(
            "Map",
            &[(RemoteValue::String("k".to_string()), RemoteValue::Number(1.0))],
        );
        let service = frame.object("MyService", &[("port", RemoteValue::Number(8080.0))]);
        frame.local("m", map);
        frame.local("svc", service);

        let template = Template::compile(&segments(json!([
            { "dsl": "m", "json": { "ref": "m" } },
            { "str": " " },
            { "dsl": "svc", "json": { "ref": "svc" } }
        ])))
        .unwrap();

        let rendered = template.render(&frame);
        assert_eq!(rendered.message, "Map(1) { 'k' => 1 } MyService { port: 8080 }");
    }

    #[test]
    fn test_message_is_capped_with_single_ellipsis() {
        let frame = MockFrame::new();
        let long = "a".repeat(10_000);
        let template = Template::compile(&segments(json!([
            { "str": long },
            { "str": "tail that never makes it" }
        ])))
        .unwrap();

        let rendered = template.render(&frame);
        assert!(rendered.message.len() <= MAX_MESSAGE_BYTES);
        assert!(rendered.message.ends_with('\u{2026}'));
        assert_eq!(rendered.message.matches('\u{2026}').count(), 1);
        assert!(!rendered.message.contains("tail"));
    }

    #[test]
    fn test_literal_template() {
        let frame = MockFrame::new();
        let template = Template::literal("Hello World!");
        assert_eq!(template.render(&frame).message, "Hello World!");
    }
}
