//! Integration test: drives a plan from `start_plan` through the
//! auto-injected review/QA gates to completion, wiring a `PdaOrchestrator`,
//! one scripted `ProjectAgent` per role, and a results subscriber the way a
//! real host process would -- over a `FakeBus` standing in for NATS.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom::agent::ProjectAgent;
use loom::bead::{BeadCreator, BeadError, BeadType, BeadUpdate, BeadUpdater};
use loom::bus::fake::FakeBus;
use loom::bus::{DynMessageBus, MessageBus, Subjects, Subscription};
use loom::config::Config;
use loom::envelope::ResultMessage;
use loom::orchestrator::PdaOrchestrator;
use loom::plan::{Action, PlanData, PlanRequest, PlanStep, Role};
use loom::planner::{LlmClient, Planner, PlannerError, StaticPlanner};

struct InMemoryBeadStore {
    next_id: AtomicU64,
}

impl InMemoryBeadStore {
    fn new() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }
}

#[async_trait]
impl BeadCreator for InMemoryBeadStore {
    async fn create_bead(
        &self,
        _project_id: &str,
        _title: &str,
        _description: &str,
        _bead_type: BeadType,
        _priority: u8,
        _tags: &[String],
        _parent_id: Option<&str>,
    ) -> Result<String, BeadError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bead-{id}"))
    }
}

#[async_trait]
impl BeadUpdater for InMemoryBeadStore {
    async fn update_bead(&self, _id: &str, _update: BeadUpdate) -> Result<(), BeadError> {
        Ok(())
    }
}

/// Agents in this test don't run the action loop -- the point is to exercise
/// plan dispatch/completion over the bus, not LLM-driven execution (that is
/// covered by `agent::action_loop`'s own unit tests).
struct NeverCalled;

#[async_trait]
impl LlmClient for NeverCalled {
    async fn complete(&self, _prompt: &str) -> Result<String, PlannerError> {
        panic!("action loop is disabled for this test; llm should not be called");
    }
}

fn agent_config() -> Config {
    let mut config = Config::default();
    config.action_loop_enabled = false;
    config
}

async fn wait_until_finalized(orchestrator: &Arc<PdaOrchestrator>, plan_id: uuid::Uuid) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if orchestrator.plan_snapshot(plan_id).is_none() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("plan did not finalize in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn plan_runs_through_review_and_qa_gates_to_completion() {
    let bus: DynMessageBus = Arc::new(FakeBus::new());
    let subjects = Subjects::new("loom");
    let beads = Arc::new(InMemoryBeadStore::new());
    let planner: Arc<dyn Planner> = Arc::new(StaticPlanner);
    let orchestrator = PdaOrchestrator::new(bus.clone(), subjects.clone(), planner, beads);

    for role in ["coder", "reviewer", "qa"] {
        let agent = ProjectAgent::new(
            bus.clone(),
            subjects.clone(),
            role,
            format!("{role}-inst"),
            Arc::new(NeverCalled),
            &agent_config(),
        );
        tokio::spawn(async move {
            let _ = agent.run("proj").await;
        });
    }

    let orchestrator_for_results = orchestrator.clone();
    let bus_for_results = bus.clone();
    let subjects_for_results = subjects.clone();
    tokio::spawn(async move {
        let mut sub = bus_for_results
            .subscribe(&subjects_for_results.results_wildcard())
            .await
            .unwrap();
        while let Some(msg) = sub.next().await {
            if let Ok(result) = msg.deserialize::<ResultMessage>() {
                let _ = orchestrator_for_results.handle_result(result).await;
            }
        }
    });

    tokio::task::yield_now().await;

    let request = PlanRequest {
        project_id: "proj".to_string(),
        bead_id: "root-bead".to_string(),
        title: "ship the feature".to_string(),
        description: "implement the feature end to end".to_string(),
        context: Default::default(),
    };
    let plan_id = orchestrator.start_plan(request).await.unwrap();

    wait_until_finalized(&orchestrator, plan_id).await;
}

/// A single `Implement` step with no dependents, used where a test wants a
/// lone failure to finalize the plan immediately rather than exercising
/// `StaticPlanner`'s reviewer/qa chain.
struct SingleStepPlanner;

#[async_trait]
impl Planner for SingleStepPlanner {
    async fn decompose(&self, request: &PlanRequest) -> Result<PlanData, PlannerError> {
        Ok(PlanData {
            title: request.title.clone(),
            description: request.description.clone(),
            priority: 2,
            steps: vec![PlanStep::new("step-1", Role::Coder, Action::Implement, request.description.clone(), vec![])],
        })
    }
}

#[tokio::test]
async fn a_failed_step_still_finalizes_the_plan() {
    let bus: DynMessageBus = Arc::new(FakeBus::new());
    let subjects = Subjects::new("loom");
    let beads = Arc::new(InMemoryBeadStore::new());
    let planner: Arc<dyn Planner> = Arc::new(SingleStepPlanner);
    let orchestrator = PdaOrchestrator::new(bus.clone(), subjects.clone(), planner, beads);

    let mut tasks = bus.subscribe(&subjects.tasks_role("proj", "coder").unwrap()).await.unwrap();

    let request = PlanRequest {
        project_id: "proj".to_string(),
        bead_id: "root-bead".to_string(),
        title: "a task that will fail".to_string(),
        description: "this step reports failure".to_string(),
        context: Default::default(),
    };
    let plan_id = orchestrator.start_plan(request).await.unwrap();

    let dispatched = tokio::time::timeout(Duration::from_secs(1), tasks.next())
        .await
        .unwrap()
        .unwrap();
    let task: loom::envelope::TaskMessage = dispatched.deserialize().unwrap();

    let failure = ResultMessage::new(
        "proj",
        task.bead_id.clone(),
        "coder-inst",
        loom::envelope::TaskResult {
            status: loom::envelope::ResultStatus::Failure,
            output: String::new(),
            error: Some("build failed".to_string()),
            commits: vec![],
            artifacts: vec![],
            duration_ms: 5,
            next_action: None,
            context: Default::default(),
        },
        task.correlation_id,
    );
    orchestrator.handle_result(failure).await.unwrap();

    wait_until_finalized(&orchestrator, plan_id).await;
}
