//! In-memory `MessageBus` for tests that don't want a live NATS server.
//!
//! Implements the same NATS-style subject wildcards (`*` for one token, `>`
//! for the remainder) the real bus relies on, so routing logic exercised
//! against `FakeBus` behaves the same way against `NatsMessageBus`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Acker, BusError, BusMessage, MessageBus, Subscription};

struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), BusError> {
        Ok(())
    }

    async fn nak(&self) -> Result<(), BusError> {
        Ok(())
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;
    while pi < pattern_tokens.len() {
        match pattern_tokens[pi] {
            ">" => return true,
            "*" => {
                if si >= subject_tokens.len() {
                    return false;
                }
            }
            token => {
                if subject_tokens.get(si) != Some(&token) {
                    return false;
                }
            }
        }
        pi += 1;
        si += 1;
    }
    pi == pattern_tokens.len() && si == subject_tokens.len()
}

struct Subscriber {
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// An in-memory bus. Every `publish` is fanned out synchronously to every
/// currently-registered subscriber whose pattern matches; there is no
/// replay, so a subscription must exist before the publish it's meant to
/// observe, exactly like a non-durable NATS subscription.
#[derive(Default)]
pub struct FakeBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn fan_out(&self, msg: BusMessage) {
        let subscribers = self.subscribers.lock().expect("fake bus lock poisoned");
        for sub in subscribers.iter() {
            if subject_matches(&sub.pattern, &msg.subject) {
                let _ = sub.tx.send(msg.clone());
            }
        }
    }

    fn register(&self, pattern: &str) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("fake bus lock poisoned").push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        rx
    }
}

pub struct FakeSubscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.rx.close();
        Ok(())
    }
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.fan_out(
            BusMessage::new(subject, payload).with_acker(std::sync::Arc::new(NoopAcker)),
        );
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: &str,
    ) -> Result<(), BusError> {
        self.fan_out(
            BusMessage::new(subject, payload)
                .with_reply_to(reply_to)
                .with_acker(std::sync::Arc::new(NoopAcker)),
        );
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(FakeSubscription {
            rx: self.register(subject),
        }))
    }

    async fn subscribe_durable(
        &self,
        subject: &str,
        _durable_name: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        self.subscribe(subject).await
    }
}
