//! The message bus abstraction (spec §4.1).
//!
//! `MessageBus` is the seam between the core (orchestrator, swarm, rpc,
//! bridge, federation) and the transport. The real implementation
//! (`nats::NatsMessageBus`) is backed by `async-nats` JetStream; `fake::FakeBus`
//! is an in-memory stand-in used by tests that don't want to depend on a live
//! NATS server. Mirrors the teacher's `ports.rs` pattern of defining a
//! `#[async_trait]` port the application layer depends on, with a concrete
//! infrastructure adapter behind it.

pub mod fake;
pub mod nats;
pub mod subjects;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use subjects::Subjects;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid subject component: {0}")]
    InvalidSubject(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("no responder for request")]
    NoResponder,
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl BusError {
    /// Connection hiccups and timeouts are worth retrying; a malformed
    /// subject or payload never gets better on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Publish(_) | Self::Subscribe(_) | Self::Ack(_) | Self::Timeout(_)
        )
    }
}

/// A message received from the bus, carrying its own ack handle when the
/// subscription it came from is durable (JetStream); `None` for core
/// (fire-and-forget) subscriptions.
#[derive(Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
    pub reply_to: Option<String>,
    acker: Option<Arc<dyn Acker>>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply_to: None,
            acker: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_reply_to_opt(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Acknowledge successful processing. A no-op for non-durable messages.
    pub async fn ack(&self) -> Result<(), BusError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Signal failed processing so JetStream redelivers per the consumer's
    /// `max_deliver` policy. A no-op for non-durable messages.
    pub async fn nak(&self) -> Result<(), BusError> {
        match &self.acker {
            Some(acker) => acker.nak().await,
            None => Ok(()),
        }
    }
}

/// Ack/nak handle for a single delivered message. Split out from
/// `BusMessage` so the fake bus can implement a trivial no-op version
/// without dragging JetStream types into test code.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    async fn nak(&self) -> Result<(), BusError>;
}

/// A handle to an active subscription; yields `BusMessage`s until dropped or
/// `unsubscribe` is called.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<BusMessage>;
    async fn unsubscribe(&mut self) -> Result<(), BusError>;
}

/// Transport-agnostic seam every component above it (rpc, bridge, swarm,
/// federation, orchestrator) is written against.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish without durability guarantees -- broadcasts, heartbeats,
    /// anything where losing a message under a restart is acceptable.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Publish with an explicit reply-to subject, for request/reply (spec
    /// §4.3's RPC layer).
    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: &str,
    ) -> Result<(), BusError>;

    /// Non-durable subscription: messages are delivered at-most-once, no ack
    /// required, nothing replayed after a restart.
    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError>;

    /// Durable, explicitly-acked subscription backed by a JetStream consumer
    /// (spec §4.1). `durable_name` identifies the consumer so redelivery and
    /// cursor position survive a restart.
    async fn subscribe_durable(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Request/reply with a deadline (spec §4.3). The default implementation
    /// is transport-independent: subscribe to a fresh inbox, publish with
    /// `reply_to` set to it, wait for the first reply or time out.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: std::time::Duration,
    ) -> Result<BusMessage, BusError> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4());
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, payload, &inbox).await?;
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::NoResponder),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

pub type DynMessageBus = Arc<dyn MessageBus>;
