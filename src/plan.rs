//! The PDA plan shape: `PlanData`/`PlanStep` (the planner's output) and
//! `ActivePlan` (the orchestrator's in-memory bookkeeping of a plan that is
//! currently being driven). Grounded on the dependency-graph shape of
//! `services::dependency_resolver`/`services::dag_executor`, adapted from a
//! task DAG to a plan-step DAG.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coder,
    Reviewer,
    Qa,
    Pm,
    Architect,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Qa => "qa",
            Self::Pm => "pm",
            Self::Architect => "architect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Implement,
    Review,
    Test,
    Plan,
    Document,
}

impl Action {
    /// `action → bead_type` mapping from spec §4.7 step 2.
    pub fn bead_type(self) -> crate::bead::BeadType {
        match self {
            Self::Review => crate::bead::BeadType::Review,
            Self::Test => crate::bead::BeadType::Test,
            Self::Implement | Self::Plan | Self::Document => crate::bead::BeadType::Task,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Test => "test",
            Self::Plan => "plan",
            Self::Document => "document",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal monotone transition (spec §3's
    /// `pending -> in_progress -> {completed|failed}` invariant).
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub role: Role,
    pub action: Action,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub status: StepStatus,
}

impl PlanStep {
    pub fn new(
        step_id: impl Into<String>,
        role: Role,
        action: Action,
        description: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            role,
            action,
            description: description.into(),
            depends_on,
            context: Map::new(),
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanData {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub steps: Vec<PlanStep>,
}

/// What the orchestrator asks a `Planner` to decompose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub project_id: String,
    pub bead_id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// The orchestrator's in-memory record of a plan it is currently driving.
/// Owned exclusively by `orchestrator::PdaOrchestrator` (spec §3).
#[derive(Debug, Clone)]
pub struct ActivePlan {
    pub plan_id: Uuid,
    pub project_id: String,
    pub source_bead_id: String,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub plan: PlanData,
    pub step_beads: BTreeMap<String, String>,
    pub step_status: BTreeMap<String, StepStatus>,
}

impl ActivePlan {
    pub fn new(
        plan_id: Uuid,
        project_id: impl Into<String>,
        source_bead_id: impl Into<String>,
        correlation_id: Uuid,
        plan: PlanData,
    ) -> Self {
        Self {
            plan_id,
            project_id: project_id.into(),
            source_bead_id: source_bead_id.into(),
            correlation_id,
            created_at: Utc::now(),
            plan,
            step_beads: BTreeMap::new(),
            step_status: BTreeMap::new(),
        }
    }

    /// A step is ready iff it is `pending` and every id in `depends_on` is
    /// `completed` (spec §3/§8 dependency safety invariant).
    pub fn is_ready(&self, step: &PlanStep) -> bool {
        self.step_status.get(&step.step_id) == Some(&StepStatus::Pending)
            && step
                .depends_on
                .iter()
                .all(|dep| self.step_status.get(dep) == Some(&StepStatus::Completed))
    }

    pub fn ready_steps(&self) -> Vec<PlanStep> {
        self.plan
            .steps
            .iter()
            .filter(|s| self.is_ready(s))
            .cloned()
            .collect()
    }

    /// Plan is complete iff every known step status is terminal and there is
    /// at least one step.
    pub fn is_complete(&self) -> bool {
        !self.step_status.is_empty() && self.step_status.values().all(|s| s.is_terminal())
    }

    pub fn has_any_failure(&self) -> bool {
        self.step_status.values().any(|s| *s == StepStatus::Failed)
    }

    /// Transition a step's status, enforcing monotonicity (spec §8).
    /// Returns `false` (no-op) if the transition is illegal or the step is
    /// already in a terminal state -- callers treat that as "ignore, already
    /// handled" rather than an error, since at-least-once delivery means the
    /// same result can arrive twice.
    pub fn transition(&mut self, step_id: &str, next: StepStatus) -> bool {
        let current = self
            .step_status
            .get(step_id)
            .copied()
            .unwrap_or(StepStatus::Pending);
        if !current.can_transition_to(next) {
            return false;
        }
        self.step_status.insert(step_id.to_string(), next);
        true
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.plan.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn bead_for_step(&self, step_id: &str) -> Option<&str> {
        self.step_beads.get(step_id).map(String::as_str)
    }

    /// All step_ids currently known, used to validate `depends_on` closures.
    pub fn known_step_ids(&self) -> HashSet<&str> {
        self.plan.steps.iter().map(|s| s.step_id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> PlanStep {
        PlanStep::new(
            id,
            Role::Coder,
            Action::Implement,
            "desc",
            deps.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn plan_with(steps: Vec<PlanStep>) -> ActivePlan {
        let mut active = ActivePlan::new(
            Uuid::new_v4(),
            "proj",
            "bead-1",
            Uuid::new_v4(),
            PlanData {
                title: "t".into(),
                description: "d".into(),
                priority: 2,
                steps,
            },
        );
        for id in active.known_step_ids().into_iter().collect::<Vec<_>>() {
            active.step_status.insert(id.to_string(), StepStatus::Pending);
        }
        active
    }

    #[test]
    fn step_only_ready_when_deps_completed() {
        let mut active = plan_with(vec![step("s1", &[]), step("s2", &["s1"])]);
        assert!(active.is_ready(&step("s1", &[])));
        assert!(!active.is_ready(&step("s2", &["s1"])));

        active.transition("s1", StepStatus::InProgress);
        active.transition("s1", StepStatus::Completed);
        assert!(active.is_ready(&step("s2", &["s1"])));
    }

    #[test]
    fn monotone_transitions_only() {
        let mut active = plan_with(vec![step("s1", &[])]);
        assert!(active.transition("s1", StepStatus::InProgress));
        assert!(active.transition("s1", StepStatus::Completed));
        // Failed is terminal; no further transition is legal.
        assert!(!active.transition("s1", StepStatus::InProgress));
        assert!(!active.transition("s1", StepStatus::Failed));
    }

    #[test]
    fn complete_iff_all_terminal() {
        let mut active = plan_with(vec![step("s1", &[]), step("s2", &[])]);
        assert!(!active.is_complete());
        active.transition("s1", StepStatus::InProgress);
        active.transition("s1", StepStatus::Completed);
        assert!(!active.is_complete());
        active.transition("s2", StepStatus::InProgress);
        active.transition("s2", StepStatus::Failed);
        assert!(active.is_complete());
        assert!(active.has_any_failure());
    }
}
