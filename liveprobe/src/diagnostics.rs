// Probe diagnostics
//
// Per (probeId, version) status tracking and the diagnostics payloads shipped
// to the backend. Versions are independent: updating a probe starts a fresh
// RECEIVED sequence for the new version.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Received,
    Installed,
    Emitting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsException {
    pub message: String,
    pub stacktrace: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeDiagnostics {
    pub probe_id: String,
    pub probe_version: u32,
    pub status: ProbeStatus,
    pub runtime_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<DiagnosticsException>,
}

#[derive(Debug, Clone, Serialize)]
struct DiagnosticsEnvelope {
    diagnostics: ProbeDiagnostics,
}

/// Wire shape of one diagnostics event.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsMessage {
    pub ddsource: &'static str,
    pub service: String,
    debugger: DiagnosticsEnvelope,
}

impl DiagnosticsMessage {
    pub fn diagnostics(&self) -> &ProbeDiagnostics {
        &self.debugger.diagnostics
    }
}

/// Tracks the status state machine per probe version:
/// RECEIVED -> INSTALLED -> EMITTING, or RECEIVED -> ERROR while not yet
/// installed. Illegal transitions are dropped, EMITTING is reported once.
#[derive(Debug)]
pub struct DiagnosticsTracker {
    service: String,
    runtime_id: String,
    states: HashMap<(String, u32), ProbeStatus>,
}

impl DiagnosticsTracker {
    pub fn new(service: &str, runtime_id: &str) -> Self {
        DiagnosticsTracker {
            service: service.to_string(),
            runtime_id: runtime_id.to_string(),
            states: HashMap::new(),
        }
    }

    pub fn status(&self, probe_id: &str, version: u32) -> Option<ProbeStatus> {
        self.states.get(&(probe_id.to_string(), version)).copied()
    }

    /// Apply a transition; returns the message to ship when it is legal.
    pub fn transition(
        &mut self,
        probe_id: &str,
        version: u32,
        status: ProbeStatus,
        exception: Option<DiagnosticsException>,
    ) -> Option<DiagnosticsMessage> {
        let key = (probe_id.to_string(), version);
        let current = self.states.get(&key).copied();

        let legal = match status {
            ProbeStatus::Received => current.is_none(),
            ProbeStatus::Installed => current == Some(ProbeStatus::Received),
            ProbeStatus::Emitting => {
                matches!(current, Some(ProbeStatus::Installed))
            }
            ProbeStatus::Error => {
                matches!(current, None | Some(ProbeStatus::Received))
            }
        };
        if !legal {
            if current != Some(status) {
                warn!(probe_id, version, ?current, ?status, "dropping illegal status transition");
            }
            return None;
        }

        self.states.insert(key, status);
        Some(DiagnosticsMessage {
            ddsource: "dd_debugger",
            service: self.service.clone(),
            debugger: DiagnosticsEnvelope {
                diagnostics: ProbeDiagnostics {
                    probe_id: probe_id.to_string(),
                    probe_version: version,
                    status,
                    runtime_id: self.runtime_id.clone(),
                    exception,
                },
            },
        })
    }

    /// Drop every version of a removed probe.
    pub fn forget(&mut self, probe_id: &str) {
        self.states.retain(|(id, _), _| id != probe_id);
    }
}
