//! Bridges an in-process broadcast bus (for local-only listeners, e.g. a
//! CLI event tail or the action-loop's own event feed) with the external
//! `MessageBus`, forwarding a selective, type-specific subset of traffic in
//! both directions (spec §4.3) rather than everything matching a subject
//! filter.
//!
//! Local -> external: an `agent.message.*`-kind event has its embedded
//! `AgentCommunicationMessage` extracted, stamped with this bridge's
//! `source_container`, and published to the external agent-messages
//! subject; a hand-picked set of other lifecycle events (bead/agent/
//! provider/decision/workflow) is forwarded as-is with
//! `metadata.source_container` stamped on the `EventMessage`. Anything else
//! published locally is left alone.
//!
//! External -> local: messages on `agent.messages.>` and `events.>` whose
//! `source_container` is this bridge's own are dropped (they're our own
//! forward coming back around); everything else is re-published locally as
//! an event with `Data["from_nats"] = true`, which the local->external path
//! checks to avoid forwarding it straight back out.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{BusError, BusMessage, DynMessageBus, MessageBus, Subjects, Subscription};
use crate::envelope::{AgentCommunicationMessage, EventBody, EventMessage};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

const SOURCE_CONTAINER_KEY: &str = "source_container";
const FROM_NATS_KEY: &str = "from_nats";

/// Lifecycle event kinds forwarded as-is (spec §4.3), alongside anything
/// prefixed `agent.message.` (forwarded via its embedded
/// `AgentCommunicationMessage` instead).
const SIGNIFICANT_EVENT_KINDS: &[&str] = &[
    "bead.created",
    "bead.completed",
    "bead.status_change",
    "agent.spawned",
    "agent.completed",
    "provider.registered",
    "provider.deleted",
    "decision.created",
    "decision.resolved",
    "workflow.started",
    "workflow.completed",
];

fn is_agent_message_event(kind: &str) -> bool {
    kind.starts_with("agent.message.")
}

fn is_forwardable_event(kind: &str) -> bool {
    is_agent_message_event(kind) || SIGNIFICANT_EVENT_KINDS.contains(&kind)
}

fn event_carries_from_nats(event: &EventMessage) -> bool {
    event.event.data.get(FROM_NATS_KEY).is_some()
}

/// A local, in-process-only publish/subscribe fabric. Anything published
/// here is visible to local subscribers immediately and, once a `Bridge` is
/// running, to the external bus too.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, msg: BusMessage) {
        // No local subscribers is a normal, unremarkable state.
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Joins a `LocalBus` with an external `MessageBus`, selectively forwarding
/// agent messages and significant lifecycle events in both directions.
pub struct Bridge {
    container: String,
    local: LocalBus,
    external: DynMessageBus,
    subjects: Subjects,
}

impl Bridge {
    pub fn new(local: LocalBus, external: DynMessageBus, subjects: Subjects) -> Self {
        Self {
            container: Uuid::new_v4().to_string(),
            local,
            external,
            subjects,
        }
    }

    pub fn local(&self) -> &LocalBus {
        &self.local
    }

    /// Spawns the two forwarding tasks and returns immediately; the tasks
    /// run until their subscriptions end (the process exits) or the bridge
    /// is dropped and the channels close.
    pub async fn run(&self) -> Result<(), BridgeError> {
        self.spawn_local_to_external();
        self.spawn_external_to_local().await?;
        Ok(())
    }

    fn spawn_local_to_external(&self) {
        let container = self.container.clone();
        let subjects = self.subjects.clone();
        let mut rx = self.local.subscribe();
        let external = self.external.clone();
        tokio::spawn(async move {
            loop {
                let msg = match rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge local->external receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Ok(mut event) = serde_json::from_slice::<EventMessage>(&msg.payload) else {
                    continue;
                };
                if event_carries_from_nats(&event) {
                    continue;
                }
                if is_agent_message_event(&event.kind) {
                    forward_agent_message(&external, &subjects, &container, &event).await;
                } else if is_forwardable_event(&event.kind) {
                    event
                        .metadata
                        .insert(SOURCE_CONTAINER_KEY.to_string(), Value::String(container.clone()));
                    forward_event(&external, &subjects, &event).await;
                }
            }
        });
    }

    async fn spawn_external_to_local(&self) -> Result<(), BridgeError> {
        let agent_sub = self.external.subscribe(&self.subjects.agent_messages_wildcard()).await?;
        let event_sub = self.external.subscribe(&self.subjects.events_wildcard()).await?;

        let container = self.container.clone();
        let local = self.local.clone();
        tokio::spawn(relay_agent_messages(agent_sub, local, container));

        let container = self.container.clone();
        let local = self.local.clone();
        tokio::spawn(relay_events(event_sub, local, container));

        Ok(())
    }
}

async fn forward_agent_message(external: &DynMessageBus, subjects: &Subjects, container: &str, event: &EventMessage) {
    let Ok(mut message) = serde_json::from_value::<AgentCommunicationMessage>(Value::Object(event.event.data.clone()))
    else {
        debug!(kind = %event.kind, "agent-message event has no valid embedded message, dropping");
        return;
    };
    message.source_container = container.to_string();

    let subject = if message.is_broadcast() {
        subjects.agent_messages_broadcast()
    } else {
        let target = message.to_agent_id.clone().unwrap_or_else(|| "broadcast".to_string());
        match subjects.agent_messages(&target) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, target = %target, "could not build agent-message subject");
                return;
            }
        }
    };

    let payload = match serde_json::to_vec(&message) {
        Ok(p) => Bytes::from(p),
        Err(e) => {
            warn!(error = %e, "could not serialize agent message for forwarding");
            return;
        }
    };
    if let Err(e) = external.publish(&subject, payload).await {
        warn!(error = %e, subject = %subject, "failed forwarding agent message to external bus");
    }
}

async fn forward_event(external: &DynMessageBus, subjects: &Subjects, event: &EventMessage) {
    let subject = match subjects.events(&event.kind.replace('.', "-")) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, kind = %event.kind, "could not build event subject");
            return;
        }
    };
    let payload = match serde_json::to_vec(event) {
        Ok(p) => Bytes::from(p),
        Err(e) => {
            warn!(error = %e, "could not serialize event for forwarding");
            return;
        }
    };
    if let Err(e) = external.publish(&subject, payload).await {
        warn!(error = %e, subject = %subject, "failed forwarding event to external bus");
    }
}

fn wrap_agent_message_as_event(message: AgentCommunicationMessage) -> EventMessage {
    let mut data = match serde_json::to_value(&message) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    data.insert(FROM_NATS_KEY.to_string(), Value::Bool(true));
    EventMessage::new(
        message.kind.clone(),
        "bridge",
        EventBody {
            action: "relayed".to_string(),
            category: "agent-message".to_string(),
            description: format!("agent message from {}", message.from_agent_id),
            data,
        },
    )
}

async fn relay_agent_messages(mut sub: Box<dyn Subscription>, local: LocalBus, container: String) {
    while let Some(msg) = sub.next().await {
        let Ok(message) = msg.deserialize::<AgentCommunicationMessage>() else {
            continue;
        };
        if message.source_container == container {
            continue;
        }
        let event = wrap_agent_message_as_event(message);
        let Ok(payload) = serde_json::to_vec(&event).map(Bytes::from) else {
            continue;
        };
        local.publish(BusMessage::new(msg.subject.clone(), payload));
    }
}

async fn relay_events(mut sub: Box<dyn Subscription>, local: LocalBus, container: String) {
    while let Some(msg) = sub.next().await {
        let Ok(mut event) = msg.deserialize::<EventMessage>() else {
            continue;
        };
        if event.metadata.get(SOURCE_CONTAINER_KEY).and_then(Value::as_str) == Some(container.as_str()) {
            continue;
        }
        event.event.data.insert(FROM_NATS_KEY.to_string(), Value::Bool(true));
        let Ok(payload) = serde_json::to_vec(&event).map(Bytes::from) else {
            continue;
        };
        local.publish(BusMessage::new(msg.subject.clone(), payload));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bus::fake::FakeBus;

    fn agent_message_event(from: &str, to: Option<&str>) -> EventMessage {
        let mut message = AgentCommunicationMessage::new("agent.message.note", from, "subj", "hello", "local-container");
        message.to_agent_id = to.map(str::to_string);
        wrap_agent_message_as_event(message)
    }

    #[tokio::test]
    async fn forwards_agent_message_to_external_with_source_container_stamped() {
        let local = LocalBus::default();
        let external: DynMessageBus = Arc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let bridge = Bridge::new(local.clone(), external.clone(), subjects.clone());

        let mut external_sub = external.subscribe(&subjects.agent_messages_broadcast()).await.unwrap();
        bridge.run().await.unwrap();
        tokio::task::yield_now().await;

        let mut event = agent_message_event("agent-a", None);
        event.event.data.remove(FROM_NATS_KEY);
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        local.publish(BusMessage::new("local.agent.message.note", payload));

        let forwarded = tokio::time::timeout(Duration::from_secs(1), external_sub.next())
            .await
            .unwrap()
            .unwrap();
        let message: AgentCommunicationMessage = forwarded.deserialize().unwrap();
        assert_eq!(message.source_container, bridge.container);
        assert_eq!(message.from_agent_id, "agent-a");
    }

    #[tokio::test]
    async fn forwards_significant_lifecycle_event_tagged_with_source_container() {
        let local = LocalBus::default();
        let external: DynMessageBus = Arc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let bridge = Bridge::new(local.clone(), external.clone(), subjects.clone());

        let mut external_sub = external.subscribe("loom.events.bead-created").await.unwrap();
        bridge.run().await.unwrap();
        tokio::task::yield_now().await;

        let event = EventMessage::new(
            "bead.created",
            "orchestrator",
            EventBody {
                action: "created".to_string(),
                category: "bead".to_string(),
                description: "bead created".to_string(),
                data: Default::default(),
            },
        );
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        local.publish(BusMessage::new("local.bead.created", payload));

        let forwarded = tokio::time::timeout(Duration::from_secs(1), external_sub.next())
            .await
            .unwrap()
            .unwrap();
        let received: EventMessage = forwarded.deserialize().unwrap();
        assert_eq!(
            received.metadata.get(SOURCE_CONTAINER_KEY).and_then(Value::as_str),
            Some(bridge.container.as_str())
        );
    }

    #[tokio::test]
    async fn ignores_local_event_kind_not_on_the_forward_list() {
        let local = LocalBus::default();
        let external: DynMessageBus = Arc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let bridge = Bridge::new(local.clone(), external.clone(), subjects.clone());

        let mut external_sub = external.subscribe("loom.events.>").await.unwrap();
        bridge.run().await.unwrap();
        tokio::task::yield_now().await;

        let event = EventMessage::new(
            "some.unrelated.kind",
            "orchestrator",
            EventBody {
                action: "noop".to_string(),
                category: "misc".to_string(),
                description: "not forwarded".to_string(),
                data: Default::default(),
            },
        );
        let payload = Bytes::from(serde_json::to_vec(&event).unwrap());
        local.publish(BusMessage::new("local.some.unrelated.kind", payload));

        let result = tokio::time::timeout(Duration::from_millis(200), external_sub.next()).await;
        assert!(result.is_err(), "non-forwardable event kind should not reach the external bus");
    }

    #[tokio::test]
    async fn drops_external_message_stamped_with_our_own_source_container() {
        let local = LocalBus::default();
        let external: DynMessageBus = Arc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let bridge = Bridge::new(local.clone(), external.clone(), subjects.clone());

        let mut local_sub = local.subscribe();
        bridge.run().await.unwrap();
        tokio::task::yield_now().await;

        let mut message = AgentCommunicationMessage::new("agent.message.note", "agent-a", "subj", "hi", "");
        message.source_container = bridge.container.clone();
        let payload = Bytes::from(serde_json::to_vec(&message).unwrap());
        external.publish(&subjects.agent_messages_broadcast(), payload).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(200), local_sub.recv()).await;
        assert!(result.is_err(), "a message carrying our own source_container should be dropped");
    }

    #[tokio::test]
    async fn applies_external_agent_message_locally_with_from_nats_marker() {
        let local = LocalBus::default();
        let external: DynMessageBus = Arc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let bridge = Bridge::new(local.clone(), external.clone(), subjects.clone());

        let mut local_sub = local.subscribe();
        bridge.run().await.unwrap();
        tokio::task::yield_now().await;

        let message = AgentCommunicationMessage::new("agent.message.note", "agent-a", "subj", "hi", "peer-container");
        let payload = Bytes::from(serde_json::to_vec(&message).unwrap());
        external.publish(&subjects.agent_messages_broadcast(), payload).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), local_sub.recv())
            .await
            .unwrap()
            .unwrap();
        let event: EventMessage = serde_json::from_slice(&received.payload).unwrap();
        assert_eq!(event.event.data.get(FROM_NATS_KEY), Some(&Value::Bool(true)));
    }
}
