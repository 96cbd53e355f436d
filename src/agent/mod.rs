//! The project agent (spec §4.8): a single role-scoped worker that
//! subscribes to its durable task subject, runs the action loop per task,
//! and reports a `ResultMessage`. Lifecycle mirrors the teacher's
//! `application::agent_executor`: a long-lived loop owning one subscription,
//! with per-task outcome tracked in shared status counters the HTTP surface
//! reads.

pub mod action_loop;
pub mod actions;
pub mod control_plane;
pub mod http;
pub mod llm;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{error, warn};

pub use actions::ActionError;
pub use http::AgentStatus;

use crate::bus::{BusError, DynMessageBus, Subjects};
use crate::config::Config;
use crate::envelope::{ResultMessage, ResultStatus, TaskMessage, TaskResult};
use crate::planner::LlmClient;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error("llm request failed: {0}")]
    LlmRequest(String),
    #[error("max loop iterations ({0}) reached without a done action")]
    MaxIterationsReached(u32),
}

impl AgentError {
    /// An LLM-request hiccup or bus blip is worth retrying (by letting
    /// JetStream redeliver); an action that genuinely failed, or a loop that
    /// burned its whole budget, is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_transient(),
            Self::LlmRequest(_) => true,
            Self::Action(_) | Self::MaxIterationsReached(_) => false,
        }
    }
}

pub struct ProjectAgent {
    bus: DynMessageBus,
    subjects: Subjects,
    role: String,
    instance_id: String,
    llm: Arc<dyn LlmClient>,
    max_loop_iterations: u32,
    action_loop_enabled: bool,
    status: Arc<AgentStatus>,
}

impl ProjectAgent {
    pub fn new(
        bus: DynMessageBus,
        subjects: Subjects,
        role: impl Into<String>,
        instance_id: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        config: &Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            subjects,
            role: role.into(),
            instance_id: instance_id.into(),
            llm,
            max_loop_iterations: config.max_loop_iterations,
            action_loop_enabled: config.action_loop_enabled,
            status: Arc::new(AgentStatus::default()),
        })
    }

    pub fn status_handle(&self) -> Arc<AgentStatus> {
        self.status.clone()
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribes to this role's task subject as a durable consumer and
    /// processes tasks until the subscription ends.
    pub async fn run(self: Arc<Self>, project_id: &str) -> Result<(), AgentError> {
        let subject = self.subjects.tasks_role(project_id, &self.role)?;
        let durable_name = format!("agent-{}-{}", self.role, self.instance_id);
        let mut sub = self.bus.subscribe_durable(&subject, &durable_name).await?;

        while let Some(msg) = sub.next().await {
            let task: TaskMessage = match msg.deserialize() {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "dropping malformed task message");
                    let _ = msg.ack().await;
                    continue;
                }
            };

            self.status.active_tasks.fetch_add(1, Ordering::Relaxed);
            let outcome = self.run_task(&task).await;
            self.status.active_tasks.fetch_sub(1, Ordering::Relaxed);

            let transient = matches!(&outcome, Err(e) if e.is_transient());
            match &outcome {
                Ok(_) => {
                    self.status.completed_tasks.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(bead_id = %task.bead_id, error = %e, "task failed");
                    self.status.failed_tasks.fetch_add(1, Ordering::Relaxed);
                }
            }

            let result = self.build_result(&task, outcome);
            self.publish_result(&task.project_id, result).await;

            // A transient failure leaves the message unacked so JetStream
            // redelivers it; anything else (success, or a failure already
            // reported on the results subject) is done with.
            if transient {
                let _ = msg.nak().await;
            } else {
                let _ = msg.ack().await;
            }
        }
        Ok(())
    }

    async fn run_task(&self, task: &TaskMessage) -> Result<String, AgentError> {
        if !self.action_loop_enabled {
            return Ok(format!(
                "action loop disabled; task '{}' acknowledged without execution",
                task.task_data.title
            ));
        }

        let work_dir = std::path::PathBuf::from(&task.task_data.work_dir);
        tokio::fs::create_dir_all(&work_dir).await.map_err(ActionError::from)?;

        let outcome = action_loop::run(
            self.llm.clone(),
            &task.task_data.description,
            &work_dir,
            self.max_loop_iterations,
        )
        .await?;
        Ok(outcome.summary)
    }

    fn build_result(&self, task: &TaskMessage, outcome: Result<String, AgentError>) -> ResultMessage {
        let result = match outcome {
            Ok(summary) => TaskResult {
                status: ResultStatus::Success,
                output: summary,
                error: None,
                commits: vec![],
                artifacts: vec![],
                duration_ms: 0,
                next_action: None,
                context: Default::default(),
            },
            Err(e) => TaskResult {
                status: ResultStatus::Failure,
                output: String::new(),
                error: Some(e.to_string()),
                commits: vec![],
                artifacts: vec![],
                duration_ms: 0,
                next_action: None,
                context: Default::default(),
            },
        };
        ResultMessage::new(&task.project_id, &task.bead_id, &self.instance_id, result, task.correlation_id)
    }

    async fn publish_result(&self, project_id: &str, result: ResultMessage) {
        let subject = match self.subjects.results(project_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not build results subject");
                return;
            }
        };
        let payload = match serde_json::to_vec(&result) {
            Ok(p) => Bytes::from(p),
            Err(e) => {
                warn!(error = %e, "could not serialize result");
                return;
            }
        };
        if let Err(e) = self.bus.publish(&subject, payload).await {
            error!(error = %e, "failed publishing task result");
        }
    }
}
