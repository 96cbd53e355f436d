//! Federation (spec §4.5): forwards an allow-listed subset of subjects
//! between this node's bus and one or more peer buses, so independently
//! operated swarms can share events/tasks without merging into one NATS
//! account. Loop prevention is a single-hop rule: a message is only
//! forwarded to peers if it doesn't yet carry a `federation_source` tag: a
//! message received from a peer is applied locally but never re-forwarded,
//! so it can never bounce node A -> B -> C -> A.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{BusError, DynMessageBus};

#[derive(Debug, Error)]
pub enum FederationError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

const SOURCE_KEY: &str = "federation_source";
const GATEWAY_KEY: &str = "federation_gateway";

/// Stamps `federation_source` and `federation_gateway` onto a JSON payload,
/// overwriting either key if already present. Returns `None` for a payload
/// that isn't a JSON object, since there's nowhere to put the tags.
fn tag(source: &str, gateway_name: &str, payload: &Bytes) -> Option<Bytes> {
    let mut value: Value = serde_json::from_slice(payload).ok()?;
    match value {
        Value::Object(ref mut map) => {
            map.insert(SOURCE_KEY.to_string(), Value::String(source.to_string()));
            map.insert(GATEWAY_KEY.to_string(), Value::String(gateway_name.to_string()));
        }
        _ => return None,
    }
    serde_json::to_vec(&value).ok().map(Bytes::from)
}

fn has_source_tag(payload: &Bytes) -> bool {
    serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get(SOURCE_KEY).cloned())
        .is_some()
}

/// One allow-listed subject a gateway will forward, e.g. `"swarm.>"` or
/// `"plans.*"` (spec §6's `federation_allow_list`, already namespaced).
pub type AllowList = Vec<String>;

pub struct FederationGateway {
    name: String,
    local: DynMessageBus,
    peers: Vec<(String, DynMessageBus)>,
    allow_list: AllowList,
}

impl FederationGateway {
    /// `peers` pairs each peer bus with the URL/identity it's known by, so
    /// inbound forwards can stamp `federation_source` with the peer's own
    /// identity rather than this gateway's.
    pub fn new(
        name: impl Into<String>,
        local: DynMessageBus,
        peers: Vec<(String, DynMessageBus)>,
        allow_list: AllowList,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            peers,
            allow_list,
        }
    }

    /// Spawns one forwarding task per allow-listed subject in each direction
    /// (local -> every peer, each peer -> local) and returns immediately.
    pub async fn run(self: Arc<Self>) -> Result<(), FederationError> {
        for subject in self.allow_list.clone() {
            self.clone().spawn_local_to_peers(subject.clone()).await?;
            for (peer_url, peer_bus) in self.peers.clone() {
                self.clone().spawn_peer_to_local(peer_url, peer_bus, subject.clone()).await?;
            }
        }
        Ok(())
    }

    async fn spawn_local_to_peers(self: Arc<Self>, subject: String) -> Result<(), FederationError> {
        let mut sub = self.local.subscribe(&subject).await?;
        let gateway = self;
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                if has_source_tag(&msg.payload) {
                    continue;
                }
                let Some(tagged) = tag(&gateway.name, &gateway.name, &msg.payload) else {
                    debug!(subject = %msg.subject, "dropping non-object payload, cannot tag for federation");
                    continue;
                };
                for (_, peer) in &gateway.peers {
                    if let Err(e) = peer.publish(&msg.subject, tagged.clone()).await {
                        warn!(error = %e, subject = %msg.subject, "failed forwarding to federation peer");
                    }
                }
            }
        });
        Ok(())
    }

    async fn spawn_peer_to_local(
        self: Arc<Self>,
        peer_url: String,
        peer_bus: DynMessageBus,
        subject: String,
    ) -> Result<(), FederationError> {
        let mut sub = peer_bus.subscribe(&subject).await?;
        let gateway = self;
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let Some(tagged) = tag(&peer_url, &gateway.name, &msg.payload) else {
                    debug!(subject = %msg.subject, "dropping non-object payload, cannot tag for federation");
                    continue;
                };
                if let Err(e) = gateway.local.publish(&msg.subject, tagged).await {
                    warn!(error = %e, subject = %msg.subject, "failed applying federated message locally");
                }
            }
        });
        Ok(())
    }
}
