// Engine error types
//
// Errors surfaced by probe lifecycle operations. Evaluation-time errors are
// deliberately not here: they are non-fatal, travel with the snapshot payload
// and are modeled in the dsl module instead.

use thiserror::Error;

use crate::session::SessionError;

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Validation(String),

    #[error("Cannot compile expression: {dsl} (probe: {probe_id}, version: {version})")]
    Compile {
        dsl: String,
        probe_id: String,
        version: u32,
    },

    #[error("Cannot compile capture expression: {name} (probe: {probe_id}, version: {version})")]
    CompileCaptureExpression {
        name: String,
        probe_id: String,
        version: u32,
    },

    #[error("No loaded script found for {file} (probe: {probe_id}, version: {version})")]
    Location {
        file: String,
        probe_id: String,
        version: u32,
    },

    #[error("Unknown probe id: {0}")]
    UnknownProbe(String),

    #[error("Cannot remove probe {0}: debugger not started")]
    NotStarted(String),

    #[error("Debug session error: {0}")]
    Session(#[from] SessionError),

    #[error("Probe engine is not running")]
    EngineStopped,
}
