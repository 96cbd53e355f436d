//! `async-nats`/JetStream-backed `MessageBus` implementation (spec §4.1).
//!
//! Durable subscriptions are JetStream pull consumers with explicit acks;
//! core (non-durable) subscriptions use plain NATS pub/sub. `ensure_stream`
//! migrates a stream created under `WorkQueue` retention to `Limits`
//! retention, since a work-queue stream only lets one consumer ever see a
//! given message -- wrong for a bus with multiple independent durable
//! subscribers (role-routed task queues, the correlator, federation).

use std::time::Duration;

use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{Acker, BusError, BusMessage, MessageBus, Subscription};

const MAX_DELIVER: i64 = 3;
const ACK_WAIT: Duration = Duration::from_secs(30);

pub struct NatsMessageBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    stream_name: String,
}

impl NatsMessageBus {
    /// Connect and ensure the configured stream exists with `Limits`
    /// retention, capturing everything published under `subject_filter`
    /// (spec's `{ns}.>`).
    pub async fn connect(
        bus_url: &str,
        stream_name: &str,
        subject_filter: &str,
    ) -> Result<Self, BusError> {
        let client = async_nats::connect(bus_url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());
        ensure_stream(&jetstream, stream_name, subject_filter).await?;
        Ok(Self {
            client,
            jetstream,
            stream_name: stream_name.to_string(),
        })
    }
}

async fn create_stream(
    js: &jetstream::Context,
    stream_name: &str,
    subject_filter: &str,
) -> Result<(), BusError> {
    js.create_stream(StreamConfig {
        name: stream_name.to_string(),
        subjects: vec![subject_filter.to_string()],
        retention: RetentionPolicy::Limits,
        ..Default::default()
    })
    .await
    .map_err(|e| BusError::Connect(e.to_string()))?;
    Ok(())
}

async fn ensure_stream(
    js: &jetstream::Context,
    stream_name: &str,
    subject_filter: &str,
) -> Result<(), BusError> {
    match js.get_stream(stream_name).await {
        Ok(mut stream) => {
            let info = stream
                .info()
                .await
                .map_err(|e| BusError::Connect(e.to_string()))?;
            if info.config.retention == RetentionPolicy::WorkQueue {
                js.delete_stream(stream_name)
                    .await
                    .map_err(|e| BusError::Connect(e.to_string()))?;
                create_stream(js, stream_name, subject_filter).await
            } else {
                Ok(())
            }
        }
        Err(_) => create_stream(js, stream_name, subject_filter).await,
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

pub struct CoreSubscription {
    inner: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for CoreSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        let msg = self.inner.next().await?;
        Some(BusMessage::new(msg.subject.to_string(), msg.payload).with_reply_to_opt(
            msg.reply.map(|r| r.to_string()),
        ))
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.inner
            .unsubscribe()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))
    }
}

type MessageStream = std::pin::Pin<
    Box<
        dyn futures::Stream<Item = Result<jetstream::Message, jetstream::consumer::pull::MessagesError>>
            + Send,
    >,
>;

pub struct JetStreamSubscription {
    messages: MessageStream,
}

#[async_trait]
impl Subscription for JetStreamSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        loop {
            let next = self.messages.next().await?;
            match next {
                Ok(message) => {
                    let subject = message.subject.to_string();
                    let payload = message.payload.clone();
                    let acker = std::sync::Arc::new(JetStreamAcker { message });
                    return Some(BusMessage::new(subject, payload).with_acker(acker));
                }
                Err(_) => continue,
            }
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        Ok(())
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        // A publish only returns once the broker acks persistence (spec
        // §4.1): the outer await gets the ack future from the server, the
        // inner await waits for the ack itself.
        self.jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        payload: Bytes,
        reply_to: &str,
    ) -> Result<(), BusError> {
        self.client
            .publish_with_reply(subject.to_string(), reply_to.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
        let inner = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(CoreSubscription { inner }))
    }

    async fn subscribe_durable(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                PullConfig {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: MAX_DELIVER,
                    ack_wait: ACK_WAIT,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        Ok(Box::new(JetStreamSubscription {
            messages: Box::pin(messages),
        }))
    }
}
