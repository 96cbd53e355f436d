//! RPC-over-bus (spec §4.3): a caller addresses a service by name and
//! method; the bus's wildcard subject (`{ns}.rpc.{service}.*.{method}`)
//! lets any one live instance answer without the caller knowing which
//! instance it is. Built directly on `bus::MessageBus::request`, the same
//! way the teacher layers `services::command_bus` over its underlying
//! transport rather than reinventing request/reply semantics per caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::bus::{BusError, DynMessageBus, Subjects};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("remote returned an error: {0}")]
    Remote(String),
    #[error("request timed out")]
    Timeout,
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bus(e) => e.is_transient(),
            Self::Timeout => true,
            Self::Remote(_) => false,
        }
    }
}

/// Wire shape of an RPC response: exactly one of `ok`/`err` is set.
#[derive(Debug, Serialize, Deserialize)]
struct RpcEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    ok: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

/// Wire shape of an RPC request: identifies the caller and method alongside
/// the raw payload, so a handler can log/authorize by `caller_id` without
/// every `RpcHandler` needing its own envelope (spec §4.2).
#[derive(Debug, Serialize, Deserialize)]
struct RpcRequest {
    method: String,
    caller_id: String,
    payload: Value,
    trace_id: Uuid,
}

/// Call `service.method` on whichever instance answers first, identifying
/// this caller as `caller_id`.
pub async fn call<Req, Resp>(
    bus: &DynMessageBus,
    subjects: &Subjects,
    service: &str,
    method: &str,
    caller_id: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let subject = subjects.rpc_wildcard(service, method)?;
    let envelope = RpcRequest {
        method: method.to_string(),
        caller_id: caller_id.to_string(),
        payload: serde_json::to_value(request).map_err(BusError::from)?,
        trace_id: Uuid::new_v4(),
    };
    let payload = Bytes::from(serde_json::to_vec(&envelope).map_err(BusError::from)?);

    let reply = bus
        .request(&subject, payload, timeout)
        .await
        .map_err(|e| match e {
            BusError::Timeout(_) => RpcError::Timeout,
            other => RpcError::Bus(other),
        })?;

    let envelope: RpcEnvelope = reply.deserialize().map_err(RpcError::Bus)?;
    match envelope {
        RpcEnvelope { ok: Some(value), .. } => {
            serde_json::from_value(value).map_err(|e| RpcError::Bus(BusError::from(e)))
        }
        RpcEnvelope { err: Some(err), .. } => Err(RpcError::Remote(err)),
        RpcEnvelope { .. } => Err(RpcError::Remote("empty RPC response".to_string())),
    }
}

/// Implemented by whatever answers a given `service.method` RPC.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, String>;
}

/// Subscribes `instance` to `{ns}.rpc.{service}.{instance}.{method}` and
/// answers every request with `handler`, replying on the caller-supplied
/// reply-to inbox. Runs until the subscription ends or the process exits;
/// callers spawn this as a background task.
pub async fn serve(
    bus: DynMessageBus,
    subjects: &Subjects,
    service: &str,
    instance: &str,
    method: &str,
    handler: Arc<dyn RpcHandler>,
) -> Result<(), RpcError> {
    let subject = subjects.rpc(service, instance, method)?;
    let mut sub = bus.subscribe(&subject).await?;

    while let Some(msg) = sub.next().await {
        let Some(reply_to) = msg.reply_to.clone() else {
            warn!(subject = %msg.subject, "rpc request missing reply_to, dropping");
            continue;
        };
        let bus = bus.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let request: RpcRequest = match msg.deserialize() {
                Ok(v) => v,
                Err(e) => {
                    let _ = respond_err(&bus, &reply_to, &e.to_string()).await;
                    return;
                }
            };
            match handler.handle(request.payload).await {
                Ok(value) => {
                    let _ = respond_ok(&bus, &reply_to, value).await;
                }
                Err(err) => {
                    let _ = respond_err(&bus, &reply_to, &err).await;
                }
            }
        });
    }

    Ok(())
}

async fn respond_ok(bus: &DynMessageBus, reply_to: &str, value: Value) -> Result<(), RpcError> {
    let envelope = RpcEnvelope {
        ok: Some(value),
        err: None,
    };
    let payload = Bytes::from(serde_json::to_vec(&envelope).map_err(BusError::from)?);
    bus.publish(reply_to, payload).await?;
    Ok(())
}

async fn respond_err(bus: &DynMessageBus, reply_to: &str, err: &str) -> Result<(), RpcError> {
    let envelope = RpcEnvelope {
        ok: None,
        err: Some(err.to_string()),
    };
    let payload = Bytes::from(serde_json::to_vec(&envelope).map_err(BusError::from)?);
    bus.publish(reply_to, payload).await?;
    Ok(())
}
