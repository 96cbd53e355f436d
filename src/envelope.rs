//! Message envelopes exchanged over the bus.
//!
//! Every envelope carries `r#type` (a dotted name such as `task.assigned`)
//! and an RFC 3339 nanosecond-precision `timestamp`; correlated flows also
//! carry a `correlation_id`. Constructors stamp both fields so call sites
//! never build an envelope with a missing or stale timestamp, mirroring the
//! teacher's `UnifiedEvent`/`EventId`/`SequenceNumber` construction style in
//! `services::event_bus`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Result status reported by an agent for a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    InProgress,
}

/// `task.assigned`: a unit of work dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub bead_id: String,
    pub assigned_to: Option<String>,
    pub task_data: TaskData,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub title: String,
    pub description: String,
    pub priority: u8,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    pub work_dir: String,
    #[serde(default)]
    pub memory_context: Option<String>,
}

impl TaskMessage {
    pub fn new(
        project_id: impl Into<String>,
        bead_id: impl Into<String>,
        assigned_to: Option<String>,
        task_data: TaskData,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            kind: "task.assigned".to_string(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            bead_id: bead_id.into(),
            assigned_to,
            task_data,
            correlation_id,
        }
    }
}

/// `task.completed` / `task.failed`: the outcome of an assigned task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub bead_id: String,
    pub agent_id: String,
    pub result: TaskResult,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub next_action: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ResultMessage {
    pub fn new(
        project_id: impl Into<String>,
        bead_id: impl Into<String>,
        agent_id: impl Into<String>,
        result: TaskResult,
        correlation_id: Uuid,
    ) -> Self {
        let kind = match result.status {
            ResultStatus::Success => "task.completed",
            ResultStatus::Failure => "task.failed",
            ResultStatus::InProgress => "task.progress",
        };
        Self {
            kind: kind.to_string(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            bead_id: bead_id.into(),
            agent_id: agent_id.into(),
            result,
            correlation_id,
        }
    }
}

/// A general-purpose domain event, broadcast on `events.{type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub project_id: Option<String>,
    pub entity_id: Option<String>,
    pub event: EventBody,
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBody {
    pub action: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EventMessage {
    pub fn new(
        kind: impl Into<String>,
        source: impl Into<String>,
        event: EventBody,
    ) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            project_id: None,
            entity_id: None,
            event,
            correlation_id: None,
            metadata: Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Mirrors `ActivePlan`, minus the mutable status maps, for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub plan_id: Uuid,
    pub project_id: String,
    pub source_bead_id: String,
    pub correlation_id: Uuid,
    pub plan: crate::plan::PlanData,
}

impl PlanMessage {
    pub fn created(
        plan_id: Uuid,
        project_id: impl Into<String>,
        source_bead_id: impl Into<String>,
        correlation_id: Uuid,
        plan: crate::plan::PlanData,
    ) -> Self {
        Self {
            kind: "plan.created".to_string(),
            timestamp: Utc::now(),
            plan_id,
            project_id: project_id.into(),
            source_bead_id: source_bead_id.into(),
            correlation_id,
            plan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    RequestChanges,
    Comment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub bead_id: String,
    pub reviewer_id: Option<String>,
    pub review: ReviewBody,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewBody {
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub decision: Option<ReviewDecision>,
    #[serde(default)]
    pub comments: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl ReviewMessage {
    pub fn requested(
        project_id: impl Into<String>,
        bead_id: impl Into<String>,
        review: ReviewBody,
    ) -> Self {
        Self {
            kind: "review.requested".to_string(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            bead_id: bead_id.into(),
            reviewer_id: None,
            review,
        }
    }

    pub fn completed(
        project_id: impl Into<String>,
        bead_id: impl Into<String>,
        reviewer_id: impl Into<String>,
        review: ReviewBody,
    ) -> Self {
        Self {
            kind: "review.completed".to_string(),
            timestamp: Utc::now(),
            project_id: project_id.into(),
            bead_id: bead_id.into(),
            reviewer_id: Some(reviewer_id.into()),
            review,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Online,
    Busy,
    Draining,
    Offline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmLoad {
    pub active_tasks: u32,
    pub max_tasks: u32,
    pub cpu_pct: f32,
    pub mem_pct: f32,
    pub uptime_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmMessage {
    #[serde(rename = "type")]
    pub kind: SwarmMessageKind,
    pub timestamp: DateTime<Utc>,
    pub service_id: String,
    pub service_type: String,
    pub instance_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub status: SwarmStatus,
    #[serde(default)]
    pub load: SwarmLoad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmMessageKind {
    Announce,
    Heartbeat,
    Leave,
}

impl SwarmMessage {
    pub fn new(
        kind: SwarmMessageKind,
        service_id: impl Into<String>,
        service_type: impl Into<String>,
        instance_id: impl Into<String>,
        status: SwarmStatus,
    ) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            service_id: service_id.into(),
            service_type: service_type.into(),
            instance_id: instance_id.into(),
            capabilities: Vec::new(),
            roles: Vec::new(),
            project_ids: Vec::new(),
            endpoint: None,
            status,
            load: SwarmLoad::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommunicationMessage {
    pub message_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub from_agent_id: String,
    pub to_agent_id: Option<String>,
    #[serde(default)]
    pub to_agent_ids: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(default)]
    pub in_reply_to: Option<Uuid>,
    pub source_container: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentCommunicationMessage {
    pub fn new(
        kind: impl Into<String>,
        from_agent_id: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        source_container: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            kind: kind.into(),
            from_agent_id: from_agent_id.into(),
            to_agent_id: None,
            to_agent_ids: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            payload: Map::new(),
            priority: 2,
            requires_response: false,
            in_reply_to: None,
            source_container: source_container.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to_agent_id.is_none() && self.to_agent_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_message_stamps_type_and_timestamp() {
        let data = TaskData {
            title: "fix login".into(),
            description: "desc".into(),
            priority: 1,
            task_type: "task".into(),
            context: Map::new(),
            work_dir: "/work".into(),
            memory_context: None,
        };
        let msg = TaskMessage::new("proj", "b1", Some("coder-1".into()), data, Uuid::new_v4());
        assert_eq!(msg.kind, "task.assigned");
        assert!(msg.timestamp <= Utc::now());
    }

    #[test]
    fn result_message_kind_follows_status() {
        let result = TaskResult {
            status: ResultStatus::Failure,
            output: String::new(),
            error: Some("boom".into()),
            commits: vec![],
            artifacts: vec![],
            duration_ms: 10,
            next_action: None,
            context: Map::new(),
        };
        let msg = ResultMessage::new("proj", "b1", "agent-1", result, Uuid::new_v4());
        assert_eq!(msg.kind, "task.failed");
    }

    #[test]
    fn agent_message_broadcast_detection() {
        let msg = AgentCommunicationMessage::new("note", "agent-1", "subj", "body", "c1");
        assert!(msg.is_broadcast());
    }

    #[test]
    fn round_trip_json() {
        let msg = SwarmMessage::new(
            SwarmMessageKind::Announce,
            "svc",
            "agent",
            "svc-abc123",
            SwarmStatus::Online,
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: SwarmMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, msg.instance_id);
        assert_eq!(back.kind, SwarmMessageKind::Announce);
    }
}
