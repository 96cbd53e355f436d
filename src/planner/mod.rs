//! Decomposes a `PlanRequest` into a `PlanData` (spec §4.7 step 1).
//!
//! `StaticPlanner` is the always-available fallback: a fixed three-step
//! coder/implement -> reviewer/review -> qa/test chain, each step depending
//! on the previous (spec §6). `LlmPlanner` asks a pluggable `LlmClient` for
//! a structured decomposition and extracts the first balanced JSON object
//! from its response -- brace-counting rather than the teacher's
//! `services::extract_json_from_response` naive `find`/`rfind`, so a JSON
//! object embedded in prose that itself mentions `{`/`}` (code fences,
//! examples) still extracts correctly.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::bead::BeadType;
use crate::jsonx::extract_balanced_json;
use crate::plan::{Action, PlanData, PlanRequest, PlanStep, Role};

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("llm request failed: {0}")]
    Request(String),
    #[error("no JSON object found in llm response")]
    NoJsonFound,
    #[error("llm response did not match the expected plan shape: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn decompose(&self, request: &PlanRequest) -> Result<PlanData, PlannerError>;
}

/// Fixed three-step plan: coder/implement -> reviewer/review -> qa/test,
/// each depending on the one before it. Used when no LLM planner is
/// configured.
pub struct StaticPlanner;

#[async_trait]
impl Planner for StaticPlanner {
    async fn decompose(&self, request: &PlanRequest) -> Result<PlanData, PlannerError> {
        Ok(PlanData {
            title: request.title.clone(),
            description: request.description.clone(),
            priority: 2,
            steps: vec![
                PlanStep::new("step-1", Role::Coder, Action::Implement, request.description.clone(), vec![]),
                PlanStep::new(
                    "step-2",
                    Role::Reviewer,
                    Action::Review,
                    format!("Review: {}", request.description),
                    vec!["step-1".to_string()],
                ),
                PlanStep::new(
                    "step-3",
                    Role::Qa,
                    Action::Test,
                    format!("Test: {}", request.description),
                    vec!["step-2".to_string()],
                ),
            ],
        })
    }
}

/// Abstraction over whatever LLM backend answers planning prompts, so
/// `LlmPlanner` doesn't depend on a specific provider's request/response
/// shape.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, PlannerError>;
}

/// HTTP-backed `LlmClient` speaking a minimal `{prompt} -> {content}` JSON
/// contract, with the endpoint and model configured externally (spec §6).
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, PlannerError> {
        let mut req = self.http.post(&self.endpoint).json(&CompletionRequest {
            model: &self.model,
            prompt,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| PlannerError::Request(e.to_string()))?
            .error_for_status()
            .map_err(|e| PlannerError::Request(e.to_string()))?
            .json::<CompletionResponse>()
            .await
            .map_err(|e| PlannerError::Request(e.to_string()))?;
        Ok(response.content)
    }
}

/// The JSON shape an LLM is prompted to produce; translated into `PlanData`
/// after extraction.
#[derive(Debug, Deserialize)]
struct LlmPlanSpec {
    title: String,
    description: String,
    #[serde(default = "default_priority")]
    priority: u8,
    steps: Vec<LlmStepSpec>,
}

fn default_priority() -> u8 {
    2
}

#[derive(Debug, Deserialize)]
struct LlmStepSpec {
    step_id: String,
    role: Role,
    action: Action,
    description: String,
    #[serde(default)]
    depends_on: Vec<String>,
}

pub struct LlmPlanner<C: LlmClient> {
    client: C,
}

impl<C: LlmClient> LlmPlanner<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: LlmClient> Planner for LlmPlanner<C> {
    async fn decompose(&self, request: &PlanRequest) -> Result<PlanData, PlannerError> {
        let prompt = build_prompt(request);
        let response = self.client.complete(&prompt).await?;
        let json = extract_balanced_json(&response).ok_or(PlannerError::NoJsonFound)?;
        let spec: LlmPlanSpec = serde_json::from_str(json)?;

        let steps = spec
            .steps
            .into_iter()
            .map(|s| PlanStep::new(s.step_id, s.role, s.action, s.description, s.depends_on))
            .collect();

        Ok(PlanData {
            title: spec.title,
            description: spec.description,
            priority: spec.priority,
            steps,
        })
    }
}

fn build_prompt(request: &PlanRequest) -> String {
    format!(
        "Decompose the following work into an ordered set of steps, each \
         assigned a role (coder, reviewer, qa, pm, architect) and an action \
         (implement, review, test, plan, document). Respond with a single \
         JSON object: {{\"title\", \"description\", \"priority\", \"steps\": \
         [{{\"step_id\", \"role\", \"action\", \"description\", \"depends_on\"}}]}}.\n\n\
         Title: {}\nDescription: {}",
        request.title, request.description
    )
}

/// Maps an LLM decomposition's step `action` onto a bead type, for whichever
/// caller needs it at sub-bead-creation time rather than going through
/// `Action::bead_type` directly (kept here so planner output and bead
/// creation agree on the same mapping without an extra hop through `Action`).
pub fn step_bead_type(action: Action) -> BeadType {
    action.bead_type()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_object_embedded_in_prose() {
        let text = "Sure, here's the plan:\n```json\n{\"a\": 1, \"b\": {\"c\": 2}}\n```\nHope that helps!";
        let json = extract_balanced_json(text).unwrap();
        assert_eq!(json, r#"{"a": 1, "b": {"c": 2}}"#);
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let text = r#"{"description": "uses a { brace } in prose", "ok": true}"#;
        let json = extract_balanced_json(text).unwrap();
        assert_eq!(json, text);
    }

    #[test]
    fn returns_none_when_no_object_present() {
        assert!(extract_balanced_json("no json here").is_none());
    }

    #[tokio::test]
    async fn static_planner_produces_coder_reviewer_qa_chain() {
        let request = PlanRequest {
            project_id: "proj".to_string(),
            bead_id: "bead-1".to_string(),
            title: "Add login".to_string(),
            description: "Implement login flow".to_string(),
            context: serde_json::Map::new(),
        };
        let plan = StaticPlanner.decompose(&request).await.unwrap();
        assert_eq!(plan.steps.len(), 3);

        assert_eq!(plan.steps[0].step_id, "step-1");
        assert_eq!(plan.steps[0].role, Role::Coder);
        assert_eq!(plan.steps[0].action, Action::Implement);
        assert!(plan.steps[0].depends_on.is_empty());

        assert_eq!(plan.steps[1].step_id, "step-2");
        assert_eq!(plan.steps[1].role, Role::Reviewer);
        assert_eq!(plan.steps[1].action, Action::Review);
        assert_eq!(plan.steps[1].depends_on, vec!["step-1".to_string()]);

        assert_eq!(plan.steps[2].step_id, "step-3");
        assert_eq!(plan.steps[2].role, Role::Qa);
        assert_eq!(plan.steps[2].action, Action::Test);
        assert_eq!(plan.steps[2].depends_on, vec!["step-2".to_string()]);
    }
}
