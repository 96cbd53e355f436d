//! The multi-turn action loop (spec §4.8): each turn, prompt the LLM with
//! the task and the transcript so far, parse its `{thinking?, actions[]}`
//! response, execute every action in order, and feed the results back as
//! the next turn's context. Stops as soon as any action is `done` or
//! `close_bead`, or when `max_iterations` is reached. Tolerates a single
//! consecutive parse failure (fed back to the model as a retry prompt) but
//! aborts on a second in a row.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use super::actions::{self, ActionError, AgentAction};
use super::AgentError;
use crate::jsonx::extract_balanced_json;
use crate::planner::LlmClient;

/// A long action output is truncated to its first/last halves around this
/// many bytes (spec §4.8 step 6); exactly-at-threshold outputs are left
/// untouched.
const TRUNCATE_THRESHOLD: usize = 4000;
const HEAD_LEN: usize = 2000;
const TAIL_LEN: usize = 2000;

const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 2;

pub struct ActionLoopOutcome {
    pub turns: u32,
    pub summary: String,
    pub transcript: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    #[serde(default)]
    #[allow(dead_code)]
    thinking: Option<String>,
    actions: Vec<AgentAction>,
}

/// Runs the action loop for a single task. `task_description` seeds the
/// first prompt; every subsequent turn appends the previous turn's actions
/// and their results to the transcript handed back to the LLM.
pub async fn run(
    llm: Arc<dyn LlmClient>,
    task_description: &str,
    work_dir: &Path,
    max_iterations: u32,
) -> Result<ActionLoopOutcome, AgentError> {
    let mut transcript: Vec<String> = Vec::new();
    let mut consecutive_parse_failures: u32 = 0;

    for turn in 1..=max_iterations {
        let prompt = build_prompt(task_description, &transcript);
        let response = llm
            .complete(&prompt)
            .await
            .map_err(|e| AgentError::LlmRequest(e.to_string()))?;

        let parsed = match parse_response(&response) {
            Ok(parsed) => parsed,
            Err(e) => {
                consecutive_parse_failures += 1;
                warn!(turn, error = %e, consecutive_parse_failures, "could not parse model response");
                if consecutive_parse_failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                    return Err(AgentError::Action(e));
                }
                transcript.push(format!("turn {turn}: FAILED -- could not parse response: {e}"));
                continue;
            }
        };
        consecutive_parse_failures = 0;

        for action in &parsed.actions {
            if let Some(summary) = terminal_summary(action) {
                transcript.push(format!("turn {turn}: done -- {summary}"));
                return Ok(ActionLoopOutcome {
                    turns: turn,
                    summary,
                    transcript,
                });
            }

            match actions::execute(action, work_dir).await {
                Ok(output) => {
                    debug!(turn, "action executed");
                    transcript.push(format!("turn {turn}: {action:?} -> {}", truncate_output(&output)));
                }
                Err(e) => {
                    transcript.push(format!("turn {turn}: {action:?} failed -- {}", truncate_output(&e.to_string())));
                }
            }
        }
    }

    Err(AgentError::MaxIterationsReached(max_iterations))
}

fn terminal_summary(action: &AgentAction) -> Option<String> {
    match action {
        AgentAction::Done { summary } | AgentAction::CloseBead { summary } => Some(summary.clone()),
        _ => None,
    }
}

fn parse_response(response: &str) -> Result<ModelResponse, ActionError> {
    let json = extract_balanced_json(response).ok_or(ActionError::NoActionFound)?;
    Ok(serde_json::from_str(json)?)
}

/// Head+tail truncation around `TRUNCATE_THRESHOLD` bytes: an output at
/// exactly the threshold is returned unchanged; anything longer keeps its
/// first `HEAD_LEN` and last `TAIL_LEN` bytes with a marker in between.
/// Boundaries are snapped to the nearest char boundary so multi-byte UTF-8
/// sequences never get split.
fn truncate_output(output: &str) -> String {
    if output.len() <= TRUNCATE_THRESHOLD {
        return output.to_string();
    }
    let head_end = floor_char_boundary(output, HEAD_LEN);
    let tail_start = ceil_char_boundary(output, output.len() - TAIL_LEN);
    format!(
        "{}\n... [truncated {} bytes] ...\n{}",
        &output[..head_end],
        tail_start - head_end,
        &output[tail_start..]
    )
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn build_prompt(task_description: &str, transcript: &[String]) -> String {
    let mut prompt = format!(
        "You are completing the following task. Respond with a single JSON \
         object: {{\"thinking\": \"...\" (optional), \"actions\": [{{\"action\": \
         \"bash\"|\"read\"|\"write\"|\"install\"|\"git\"|\"done\"|\"close_bead\", ...}}]}}.\n\
         Every action in the array is executed in order during this turn.\n\
         When finished, include {{\"action\": \"done\", \"summary\": \"...\"}} \
         (or \"close_bead\") as one of the actions.\n\n\
         Task: {task_description}\n"
    );
    if !transcript.is_empty() {
        prompt.push_str("\nTranscript so far:\n");
        for line in transcript {
            prompt.push_str(line);
            prompt.push('\n');
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::planner::PlannerError;

    struct ScriptedLlm {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, PlannerError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(PlannerError::NoJsonFound);
            }
            Ok(responses.remove(0))
        }
    }

    /// Panics if called more than `allowed` times, proving a stopped loop
    /// never makes a further LLM call.
    struct CountedFailures {
        responses: Mutex<Vec<String>>,
        allowed: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for CountedFailures {
        async fn complete(&self, _prompt: &str) -> Result<String, PlannerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(call < self.allowed, "llm called more times than allowed");
            let mut responses = self.responses.lock().unwrap();
            Ok(responses.remove(0))
        }
    }

    #[tokio::test]
    async fn stops_on_done_action() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![
                r#"{"actions": [{"action": "write", "path": "out.txt", "content": "hi"}]}"#.to_string(),
                r#"{"actions": [{"action": "done", "summary": "wrote the file"}]}"#.to_string(),
            ]),
        });

        let outcome = run(llm, "write a file", dir.path(), 10).await.unwrap();
        assert_eq!(outcome.turns, 2);
        assert_eq!(outcome.summary, "wrote the file");
    }

    #[tokio::test]
    async fn stops_on_close_bead_action() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![r#"{"actions": [{"action": "close_bead", "summary": "all done"}]}"#.to_string()]),
        });

        let outcome = run(llm, "finish up", dir.path(), 10).await.unwrap();
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.summary, "all done");
    }

    #[tokio::test]
    async fn executes_every_action_in_one_turn_before_stopping() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![
                r#"{"actions": [{"action": "bash", "command": "true"}, {"action": "done", "summary": "ran and done"}]}"#
                    .to_string(),
            ]),
        });

        let outcome = run(llm, "do two things", dir.path(), 10).await.unwrap();
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.summary, "ran and done");
    }

    #[tokio::test]
    async fn reaching_max_iterations_without_done_is_an_error() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![r#"{"actions": [{"action": "bash", "command": "true"}]}"#.to_string(); 3]),
        });

        let err = run(llm, "loop forever", dir.path(), 3).await.unwrap_err();
        assert!(matches!(err, AgentError::MaxIterationsReached(3)));
    }

    #[tokio::test]
    async fn a_single_parse_failure_is_tolerated_and_retried() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm {
            responses: Mutex::new(vec![
                "no json here".to_string(),
                r#"{"actions": [{"action": "done", "summary": "recovered"}]}"#.to_string(),
            ]),
        });

        let outcome = run(llm, "do something", dir.path(), 10).await.unwrap();
        assert_eq!(outcome.summary, "recovered");
    }

    #[tokio::test]
    async fn two_consecutive_parse_failures_abort_the_loop() {
        let dir = tempdir().unwrap();
        let llm: Arc<dyn LlmClient> = Arc::new(CountedFailures {
            responses: Mutex::new(vec!["no json here".to_string(), "still no json".to_string()]),
            allowed: 2,
            calls: AtomicU32::new(0),
        });

        let err = run(llm, "do something", dir.path(), 10).await.unwrap_err();
        assert!(matches!(err, AgentError::Action(ActionError::NoActionFound)));
    }

    #[test]
    fn output_at_exactly_threshold_is_not_truncated() {
        let output = "a".repeat(TRUNCATE_THRESHOLD);
        assert_eq!(truncate_output(&output), output);
    }

    #[test]
    fn output_over_threshold_is_head_tail_truncated() {
        let output = "a".repeat(TRUNCATE_THRESHOLD + 1);
        let truncated = truncate_output(&output);
        assert!(truncated.len() < output.len());
        assert!(truncated.starts_with(&"a".repeat(HEAD_LEN)));
        assert!(truncated.ends_with(&"a".repeat(TAIL_LEN)));
    }
}
