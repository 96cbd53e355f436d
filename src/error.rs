//! Top-level error taxonomy.
//!
//! Each component owns a `thiserror` enum for its own failure modes; this
//! module only wraps them so callers crossing component boundaries have one
//! error type to propagate with `?`. Component enums that participate in
//! retry decisions expose `is_transient()`, mirroring the teacher's
//! `TaskError`/`ClaudeApiError` split between permanent and transient causes.

use thiserror::Error;

use crate::agent::{ActionError, AgentError};
use crate::bus::BusError;
use crate::federation::FederationError;
use crate::orchestrator::OrchestratorError;
use crate::rpc::RpcError;
use crate::swarm::SwarmError;

/// Umbrella error for anything that can fail inside the core.
#[derive(Debug, Error)]
pub enum LoomError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LoomError {
    /// True when the failure is worth retrying (transient I/O), false when
    /// it represents a domain decision that will not change on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_transient(),
            Self::Rpc(e) => e.is_transient(),
            Self::Agent(e) => e.is_transient(),
            Self::Swarm(_) | Self::Federation(_) | Self::Orchestrator(_) | Self::Action(_) => {
                false
            }
            Self::Config(_) => false,
        }
    }
}

pub type Result<T, E = LoomError> = std::result::Result<T, E>;
