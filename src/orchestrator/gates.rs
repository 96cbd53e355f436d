//! Reactively injects review/QA gates after an `implement` step succeeds
//! (spec §4.7 step 3), so a plan that only asked for code never skips
//! review and testing. Fires from `PdaOrchestrator::handle_result`, never at
//! plan-creation time: gating a step that hasn't succeeded yet would create
//! beads for review work that may never be needed.

use uuid::Uuid;

use crate::bead::BeadCreator;
use crate::plan::{Action, PlanStep, Role, StepStatus};

use super::{OrchestratorError, PdaOrchestrator};

/// Appends a `review-after-{step_id}` step and a
/// `qa-after-review-after-{step_id}` step (the second depending on the
/// first, the first depending on `step_id`), unless they already exist.
/// Idempotent on the `review-after-{step_id}` key: a step whose gate has
/// already been injected (e.g. a redelivered result) is left untouched.
pub async fn run_review_gate(
    orchestrator: &PdaOrchestrator,
    plan_id: Uuid,
    step_id: &str,
) -> Result<(), OrchestratorError> {
    let review_id = format!("review-after-{step_id}");
    let qa_id = format!("qa-after-{review_id}");

    // Read what we need and release the lock before the `.await`s below:
    // bead creation is async and must never run while holding a
    // `std::sync::Mutex` guard.
    let prepared = {
        let plans = orchestrator.plans.lock().expect("plan table lock poisoned");
        let active = plans.get(&plan_id).ok_or(OrchestratorError::UnknownPlan(plan_id))?;
        if active.known_step_ids().contains(review_id.as_str()) {
            None
        } else {
            Some((
                active.project_id.clone(),
                active.plan.priority,
                active.bead_for_step(step_id).map(str::to_string),
            ))
        }
    };

    let Some((project_id, priority, parent_bead)) = prepared else {
        return Ok(());
    };

    let review_bead = orchestrator
        .beads
        .create_bead(
            &project_id,
            &format!("Review changes from {step_id}"),
            &format!("Review the changes from step {step_id}"),
            Action::Review.bead_type(),
            priority,
            &[Role::Reviewer.as_str().to_string(), Action::Review.as_str().to_string()],
            parent_bead.as_deref(),
        )
        .await?;
    let qa_bead = orchestrator
        .beads
        .create_bead(
            &project_id,
            &format!("Test changes from {step_id}"),
            &format!("Test the changes from step {step_id}"),
            Action::Test.bead_type(),
            priority,
            &[Role::Qa.as_str().to_string(), Action::Test.as_str().to_string()],
            parent_bead.as_deref(),
        )
        .await?;

    let mut plans = orchestrator.plans.lock().expect("plan table lock poisoned");
    let Some(active) = plans.get_mut(&plan_id) else {
        return Ok(());
    };
    // A redelivered result for the same step could have raced us here;
    // re-check under the lock before inserting.
    if active.known_step_ids().contains(review_id.as_str()) {
        return Ok(());
    }

    active.plan.steps.push(PlanStep::new(
        &review_id,
        Role::Reviewer,
        Action::Review,
        format!("Review the changes from step {step_id}"),
        vec![step_id.to_string()],
    ));
    active.plan.steps.push(PlanStep::new(
        &qa_id,
        Role::Qa,
        Action::Test,
        format!("Test the changes from step {step_id}"),
        vec![review_id.clone()],
    ));
    active.step_beads.insert(review_id.clone(), review_bead);
    active.step_beads.insert(qa_id.clone(), qa_bead);
    active.step_status.insert(review_id, StepStatus::Pending);
    active.step_status.insert(qa_id, StepStatus::Pending);
    Ok(())
}
