//! The bead collaborator.
//!
//! Beads are persisted and queried by an external system (out of scope per
//! spec §1); the core only needs the two operations it calls to drive the
//! PDA pipeline. `BeadCreator`/`BeadUpdater` are the minimal interfaces
//! spec §9 asks for so the orchestrator never depends on a concrete bead
//! store, mirroring the teacher's `AgentRepository`/`TaskRepository`
//! async-trait ports in `domain/ports.rs`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The bead types the core reads or creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Bug,
    Feature,
    Review,
    Test,
    Decision,
}

/// A unit of tracked work. Only the fields the core reads or writes are
/// modeled; everything else about a bead is owned by the external bead
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    pub priority: u8,
    pub project_id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: BeadContext,
}

/// Typed wrapper over a bead's free-form `context` dictionary, exposing the
/// keys the orchestrator reads and writes (spec §3) without scattering
/// string-keyed lookups across the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeadContext(pub BTreeMap<String, String>);

impl BeadContext {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn pda_plan_id(&self) -> Option<&str> {
        self.get("pda_plan_id")
    }

    pub fn pda_status(&self) -> Option<&str> {
        self.get("pda_status")
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get("correlation_id")
    }

    pub fn dispatch_count(&self) -> u32 {
        self.get("dispatch_count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn last_run_error(&self) -> Option<&str> {
        self.get("last_run_error")
    }

    /// Parsed `error_history` JSON array; empty if absent or malformed.
    pub fn error_history(&self) -> Vec<String> {
        self.get("error_history")
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        let mut history = self.error_history();
        history.push(error.clone());
        self.set(
            "error_history",
            serde_json::to_string(&history).unwrap_or_default(),
        );
        self.set("last_run_error", error);
    }

    pub fn ralph_blocked_reason(&self) -> Option<&str> {
        self.get("ralph_blocked_reason")
    }

    pub fn ralph_blocked_at(&self) -> Option<&str> {
        self.get("ralph_blocked_at")
    }

    pub fn loop_detected(&self) -> bool {
        self.get("loop_detected") == Some("true")
    }

    /// Clear the ralph-blocked markers (the "reset/unblock" operation of
    /// spec §7).
    pub fn clear_blocked(&mut self) {
        self.0.remove("ralph_blocked_reason");
        self.0.remove("ralph_blocked_at");
    }
}

/// A merge-update to a bead's fields, consumed by `BeadUpdater::update_bead`.
#[derive(Debug, Clone, Default)]
pub struct BeadUpdate {
    pub context: BTreeMap<String, String>,
}

impl BeadUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum BeadError {
    #[error("bead not found: {0}")]
    NotFound(String),
    #[error("bead store rejected the operation: {0}")]
    Rejected(String),
}

/// Minimal interface the orchestrator needs to create sub-beads. Concrete
/// implementations wrap the out-of-scope bead-persistence service (spec §1).
#[async_trait]
pub trait BeadCreator: Send + Sync {
    async fn create_bead(
        &self,
        project_id: &str,
        title: &str,
        description: &str,
        bead_type: BeadType,
        priority: u8,
        tags: &[String],
        parent_id: Option<&str>,
    ) -> Result<String, BeadError>;
}

/// Minimal interface the orchestrator needs to update a bead's context.
#[async_trait]
pub trait BeadUpdater: Send + Sync {
    async fn update_bead(&self, id: &str, update: BeadUpdate) -> Result<(), BeadError>;
}
