//! The PDA (Plan -> Document -> Act) orchestrator (spec §3/§4.7): turns a
//! `PlanRequest` into a dependency-ordered set of sub-beads, dispatches each
//! step as it becomes ready, and reacts to results as they arrive. Owns the
//! `ActivePlan` table exclusively, mirroring the teacher's single-mutex
//! in-memory repositories.

pub mod gates;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bead::{BeadCreator, BeadError, BeadUpdate, BeadUpdater};
use crate::bus::{BusError, DynMessageBus, Subjects};
use crate::envelope::{EventBody, EventMessage, PlanMessage, ResultMessage, ResultStatus, TaskData, TaskMessage};
use crate::plan::{ActivePlan, Action, PlanRequest, PlanStep, StepStatus};
use crate::planner::{Planner, PlannerError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Bead(#[from] BeadError),
    #[error(transparent)]
    Planner(#[from] PlannerError),
    #[error("unknown plan: {0}")]
    UnknownPlan(Uuid),
}

/// Combines the two bead-store ports the orchestrator needs into one object
/// a caller can hand over without naming both traits at every call site.
pub trait BeadStore: BeadCreator + BeadUpdater + Send + Sync {}
impl<T: BeadCreator + BeadUpdater + Send + Sync> BeadStore for T {}

pub struct PdaOrchestrator {
    bus: DynMessageBus,
    subjects: Subjects,
    planner: Arc<dyn Planner>,
    beads: Arc<dyn BeadStore>,
    plans: Mutex<HashMap<Uuid, ActivePlan>>,
}

impl PdaOrchestrator {
    pub fn new(
        bus: DynMessageBus,
        subjects: Subjects,
        planner: Arc<dyn Planner>,
        beads: Arc<dyn BeadStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            subjects,
            planner,
            beads,
            plans: Mutex::new(HashMap::new()),
        })
    }

    /// Decomposes `request`, creates one sub-bead per step, and dispatches
    /// every step that is immediately ready (no `depends_on`). Review/QA
    /// gates are not injected here: they fire reactively, from
    /// `handle_result`, only once an `implement` step actually succeeds
    /// (spec §4.7 step 3).
    pub async fn start_plan(&self, request: PlanRequest) -> Result<Uuid, OrchestratorError> {
        let plan_data = self.planner.decompose(&request).await?;

        let plan_id = Uuid::new_v4();
        let correlation_id = Uuid::new_v4();
        let mut active = ActivePlan::new(plan_id, &request.project_id, &request.bead_id, correlation_id, plan_data.clone());

        for step in &plan_data.steps {
            let bead_id = self
                .beads
                .create_bead(
                    &request.project_id,
                    &step.description,
                    &step.description,
                    step.action.bead_type(),
                    plan_data.priority,
                    &[step.role.as_str().to_string(), step.action.as_str().to_string()],
                    Some(&request.bead_id),
                )
                .await?;
            active.step_beads.insert(step.step_id.clone(), bead_id);
            active.step_status.insert(step.step_id.clone(), StepStatus::Pending);
        }

        let event = EventMessage::new(
            "plan.created",
            "orchestrator",
            EventBody {
                action: "plan_created".to_string(),
                category: "orchestration".to_string(),
                description: format!("plan {plan_id} created with {} steps", plan_data.steps.len()),
                data: serde_json::Map::new(),
            },
        )
        .with_project(&request.project_id)
        .with_correlation(correlation_id);
        self.publish_event(event).await;

        let plan_msg = PlanMessage::created(plan_id, &request.project_id, &request.bead_id, correlation_id, plan_data);
        let subject = self.subjects.plans(&request.project_id)?;
        self.bus
            .publish(&subject, Bytes::from(serde_json::to_vec(&plan_msg).map_err(BusError::from)?))
            .await?;

        self.plans.lock().expect("plan table lock poisoned").insert(plan_id, active);
        self.dispatch_ready(plan_id).await?;
        Ok(plan_id)
    }

    /// Dispatches every currently-ready step of `plan_id` as a `TaskMessage`
    /// on its role's task subject, marking it `in_progress`.
    pub async fn dispatch_ready(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        let (project_id, correlation_id, ready): (String, Uuid, Vec<PlanStep>) = {
            let plans = self.plans.lock().expect("plan table lock poisoned");
            let active = plans.get(&plan_id).ok_or(OrchestratorError::UnknownPlan(plan_id))?;
            (active.project_id.clone(), active.correlation_id, active.ready_steps())
        };

        for step in ready {
            let bead_id = {
                let plans = self.plans.lock().expect("plan table lock poisoned");
                plans
                    .get(&plan_id)
                    .and_then(|p| p.bead_for_step(&step.step_id))
                    .map(str::to_string)
            };
            let Some(bead_id) = bead_id else { continue };

            let task_data = TaskData {
                title: step.description.clone(),
                description: step.description.clone(),
                priority: 2,
                task_type: step.action.as_str().to_string(),
                context: step.context.clone(),
                work_dir: project_id.clone(),
                memory_context: None,
            };
            let task = TaskMessage::new(&project_id, &bead_id, None, task_data, correlation_id);
            let subject = self.subjects.tasks_role(&project_id, step.role.as_str())?;
            self.bus
                .publish(&subject, Bytes::from(serde_json::to_vec(&task).map_err(BusError::from)?))
                .await?;

            {
                let mut plans = self.plans.lock().expect("plan table lock poisoned");
                if let Some(active) = plans.get_mut(&plan_id) {
                    active.transition(&step.step_id, StepStatus::InProgress);
                }
            }

            self.beads
                .update_bead(&bead_id, BeadUpdate::new().set("pda_status", "dispatched").set("pda_plan_id", plan_id.to_string()))
                .await?;
        }
        Ok(())
    }

    /// Applies an incoming `ResultMessage` to whichever plan/step it
    /// belongs to, then dispatches newly-ready steps or finalizes the plan.
    /// Unrecognized bead ids (results from tasks outside any active plan)
    /// are logged and ignored rather than treated as an error.
    pub async fn handle_result(&self, result: ResultMessage) -> Result<(), OrchestratorError> {
        let located = {
            let plans = self.plans.lock().expect("plan table lock poisoned");
            plans.iter().find_map(|(plan_id, active)| {
                active
                    .step_beads
                    .iter()
                    .find(|(_, bead_id)| bead_id.as_str() == result.bead_id)
                    .map(|(step_id, _)| (*plan_id, step_id.clone()))
            })
        };

        let Some((plan_id, step_id)) = located else {
            warn!(bead_id = %result.bead_id, "result for a bead not tracked by any active plan");
            return Ok(());
        };

        let next_status = match result.result.status {
            ResultStatus::Success => StepStatus::Completed,
            ResultStatus::Failure => StepStatus::Failed,
            ResultStatus::InProgress => return Ok(()),
        };

        let (transitioned, action) = {
            let mut plans = self.plans.lock().expect("plan table lock poisoned");
            match plans.get_mut(&plan_id) {
                Some(active) => {
                    let action = active.step(&step_id).map(|s| s.action);
                    (active.transition(&step_id, next_status), action)
                }
                None => (false, None),
            }
        };
        if !transitioned {
            return Ok(());
        }

        if next_status == StepStatus::Failed {
            error!(plan_id = %plan_id, step_id = %step_id, "plan step failed");
        }

        if next_status == StepStatus::Completed && action == Some(Action::Implement) {
            gates::run_review_gate(self, plan_id, &step_id).await?;
        }

        self.dispatch_ready(plan_id).await?;
        self.finalize_if_complete(plan_id).await
    }

    async fn finalize_if_complete(&self, plan_id: Uuid) -> Result<(), OrchestratorError> {
        let (complete, project_id, correlation_id, has_failure) = {
            let plans = self.plans.lock().expect("plan table lock poisoned");
            match plans.get(&plan_id) {
                Some(active) => (
                    active.is_complete(),
                    active.project_id.clone(),
                    active.correlation_id,
                    active.has_any_failure(),
                ),
                None => return Ok(()),
            }
        };
        if !complete {
            return Ok(());
        }

        let description = if has_failure {
            format!("plan {plan_id} finished with at least one failed step")
        } else {
            format!("plan {plan_id} completed successfully")
        };
        let event = EventMessage::new(
            "plan.completed",
            "orchestrator",
            EventBody {
                action: "plan_completed".to_string(),
                category: "orchestration".to_string(),
                description,
                data: serde_json::Map::new(),
            },
        )
        .with_project(&project_id)
        .with_correlation(correlation_id);
        self.publish_event(event).await;

        self.plans.lock().expect("plan table lock poisoned").remove(&plan_id);
        info!(plan_id = %plan_id, has_failure, "plan finalized");
        Ok(())
    }

    async fn publish_event(&self, event: EventMessage) {
        let event_type = event.kind.replace('.', "-");
        let subject = match self.subjects.events(&event_type) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not build event subject");
                return;
            }
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(error = %e, "could not serialize event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&subject, payload).await {
            warn!(error = %e, "failed publishing orchestrator event");
        }
    }

    pub fn plan_snapshot(&self, plan_id: Uuid) -> Option<ActivePlan> {
        self.plans.lock().expect("plan table lock poisoned").get(&plan_id).cloned()
    }
}
