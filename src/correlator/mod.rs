//! In-memory result correlator: tracks outstanding dispatched tasks by
//! `correlation_id` and resolves them when the matching `ResultMessage`
//! arrives, the way the teacher's `services::event_store` tracks events by
//! id for later lookup -- here the lookup resolves a waiting future instead
//! of answering a query.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::envelope::ResultMessage;

/// A task dispatched and awaiting its result.
struct PendingTask {
    bead_id: String,
    dispatched_at: DateTime<Utc>,
    responder: oneshot::Sender<ResultMessage>,
}

/// Tracks correlation ids for tasks currently in flight. One instance is
/// shared (via `Arc`) between the dispatcher that creates entries and the
/// result-subscription loop that resolves them.
#[derive(Default)]
pub struct ResultCorrelator {
    pending: Mutex<HashMap<Uuid, PendingTask>>,
}

impl ResultCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task as in flight and returns a receiver that resolves
    /// when `handle_result` is called with the same `correlation_id`.
    pub fn track(&self, correlation_id: Uuid, bead_id: impl Into<String>) -> oneshot::Receiver<ResultMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("correlator lock poisoned").insert(
            correlation_id,
            PendingTask {
                bead_id: bead_id.into(),
                dispatched_at: Utc::now(),
                responder: tx,
            },
        );
        rx
    }

    /// Waits (with a deadline) for the result of a previously `track`ed
    /// correlation id.
    pub async fn wait(
        &self,
        correlation_id: Uuid,
        bead_id: impl Into<String>,
        timeout: Duration,
    ) -> Option<ResultMessage> {
        let rx = self.track(correlation_id, bead_id);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(_)) | Err(_) => {
                self.pending.lock().expect("correlator lock poisoned").remove(&correlation_id);
                None
            }
        }
    }

    /// Resolves a pending task if its correlation id is known; returns
    /// `true` if it was, `false` if the result is for a correlation id that
    /// was never tracked (already resolved, or from another process
    /// entirely) so the caller can log-and-ignore rather than error.
    pub fn handle_result(&self, result: ResultMessage) -> bool {
        let pending = self
            .pending
            .lock()
            .expect("correlator lock poisoned")
            .remove(&result.correlation_id);
        match pending {
            Some(task) => task.responder.send(result).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }

    pub fn bead_id_for(&self, correlation_id: Uuid) -> Option<String> {
        self.pending
            .lock()
            .expect("correlator lock poisoned")
            .get(&correlation_id)
            .map(|t| t.bead_id.clone())
    }

    /// Drops pending tasks dispatched more than `max_age` ago; they are
    /// treated as abandoned rather than resolved, since nothing will ever
    /// call `handle_result` for them.
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        let before = pending.len();
        pending.retain(|_, task| task.dispatched_at > cutoff);
        before - pending.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::envelope::{ResultMessage, ResultStatus, TaskResult};

    fn success_result(correlation_id: Uuid) -> ResultMessage {
        let result = TaskResult {
            status: ResultStatus::Success,
            output: "done".to_string(),
            error: None,
            commits: vec![],
            artifacts: vec![],
            duration_ms: 5,
            next_action: None,
            context: Map::new(),
        };
        ResultMessage::new("proj", "bead-1", "agent-1", result, correlation_id)
    }

    #[tokio::test]
    async fn wait_resolves_when_result_arrives() {
        let correlator = ResultCorrelator::new();
        let id = Uuid::new_v4();

        let correlator_ref = &correlator;
        let wait = correlator_ref.wait(id, "bead-1", Duration::from_secs(1));
        let resolve = async {
            // give `wait` a chance to register before resolving
            tokio::task::yield_now().await;
            assert!(correlator_ref.handle_result(success_result(id)));
        };

        let (result, ()) = tokio::join!(wait, resolve);
        assert!(result.is_some());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_and_cleans_up() {
        let correlator = ResultCorrelator::new();
        let id = Uuid::new_v4();
        let result = correlator.wait(id, "bead-1", Duration::from_millis(20)).await;
        assert!(result.is_none());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn unknown_correlation_id_is_ignored_not_errored() {
        let correlator = ResultCorrelator::new();
        assert!(!correlator.handle_result(success_result(Uuid::new_v4())));
    }
}
