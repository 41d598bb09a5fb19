//! Fatal error taxonomy.
//!
//! Transient remote failures are retried inside the RPC helpers and never
//! surface here; deadline exhaustion degrades to a pending result instead of
//! an error. What remains is fatal: the run aborts, the error snapshot is
//! written, and the process exits non-zero.

use thiserror::Error;

use crate::session::SessionState;

/// Errors that abort the invocation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A stage was entered without the configuration it needs.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// The remote session reached a terminal failure state.
    #[error("session {session} ended with state {state}")]
    SessionFailed {
        session: String,
        state: SessionState,
    },

    /// The agent-session API rejected a request after retries.
    #[error("agent API error {status} for {method} {url}: {body}")]
    AgentApi {
        status: u16,
        method: String,
        url: String,
        body: String,
    },

    /// The code-host API rejected a request.
    #[error("code host API error {status} for {url}: {body}")]
    CodeHostApi {
        status: u16,
        url: String,
        body: String,
    },
}

impl OrchestratorError {
    /// Short category tag recorded in the error snapshot.
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingConfig(_) => "config",
            Self::SessionFailed { .. } => "session",
            Self::AgentApi { .. } => "agent_api",
            Self::CodeHostApi { .. } => "code_host",
        }
    }
}

/// Category for an arbitrary error chain, `"internal"` when it is not one of
/// the typed fatal errors.
pub fn categorize(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<OrchestratorError>()
        .map(OrchestratorError::category)
        .unwrap_or("internal")
}
