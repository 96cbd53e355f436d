//! Swarm membership (spec §4.2): agents announce themselves, heartbeat
//! periodically, and leave cleanly; a listener on every instance maintains
//! its own view of the membership table from the same broadcast stream,
//! with no central registrar. Stale entries (an agent that died without
//! sending `leave`) are reaped on a timer. One `Mutex`-owned table per
//! manager, matching the single-writer-table idiom the teacher uses for its
//! in-memory repositories.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{BusError, DynMessageBus, Subjects};
use crate::envelope::{SwarmLoad, SwarmMessage, SwarmMessageKind, SwarmStatus};

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Whether a member last seen at `last_seen` should be reaped against
/// `cutoff`: exactly-at-cutoff is retained, strictly older is reaped.
fn is_stale(last_seen: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    last_seen < cutoff
}

#[derive(Debug, Clone)]
pub struct SwarmMember {
    pub service_id: String,
    pub service_type: String,
    pub instance_id: String,
    pub capabilities: Vec<String>,
    pub roles: Vec<String>,
    pub project_ids: Vec<String>,
    pub endpoint: Option<String>,
    pub status: SwarmStatus,
    pub load: SwarmLoad,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SwarmMember {
    /// `joined_at` is passed in rather than stamped here: an announce for an
    /// instance already in the table keeps its original `joined_at`.
    fn from_message(msg: &SwarmMessage, joined_at: DateTime<Utc>) -> Self {
        Self {
            service_id: msg.service_id.clone(),
            service_type: msg.service_type.clone(),
            instance_id: msg.instance_id.clone(),
            capabilities: msg.capabilities.clone(),
            roles: msg.roles.clone(),
            project_ids: msg.project_ids.clone(),
            endpoint: msg.endpoint.clone(),
            status: msg.status,
            load: msg.load.clone(),
            joined_at,
            last_seen: Utc::now(),
        }
    }
}

/// Describes how this instance announces itself; passed once at startup and
/// reused for every heartbeat.
#[derive(Debug, Clone)]
pub struct SelfDescription {
    pub service_id: String,
    pub service_type: String,
    pub roles: Vec<String>,
    pub capabilities: Vec<String>,
    pub project_ids: Vec<String>,
    pub endpoint: Option<String>,
}

pub struct SwarmManager {
    bus: DynMessageBus,
    subjects: Subjects,
    instance_id: String,
    members: Mutex<HashMap<String, SwarmMember>>,
}

impl SwarmManager {
    pub fn new(bus: DynMessageBus, subjects: Subjects, instance_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            subjects,
            instance_id: instance_id.into(),
            members: Mutex::new(HashMap::new()),
        })
    }

    pub async fn announce(&self, me: &SelfDescription, load: SwarmLoad) -> Result<(), SwarmError> {
        self.publish(SwarmMessageKind::Announce, me, SwarmStatus::Online, load).await
    }

    pub async fn heartbeat(&self, me: &SelfDescription, status: SwarmStatus, load: SwarmLoad) -> Result<(), SwarmError> {
        self.publish(SwarmMessageKind::Heartbeat, me, status, load).await
    }

    pub async fn leave(&self, me: &SelfDescription) -> Result<(), SwarmError> {
        self.publish(SwarmMessageKind::Leave, me, SwarmStatus::Offline, SwarmLoad::default())
            .await
    }

    async fn publish(
        &self,
        kind: SwarmMessageKind,
        me: &SelfDescription,
        status: SwarmStatus,
        load: SwarmLoad,
    ) -> Result<(), SwarmError> {
        let mut msg = SwarmMessage::new(kind, &me.service_id, &me.service_type, &self.instance_id, status);
        msg.capabilities = me.capabilities.clone();
        msg.roles = me.roles.clone();
        msg.project_ids = me.project_ids.clone();
        msg.endpoint = me.endpoint.clone();
        msg.load = load;

        let subject = match kind {
            SwarmMessageKind::Announce => self.subjects.swarm_announce(),
            SwarmMessageKind::Heartbeat => self.subjects.swarm_heartbeat(),
            SwarmMessageKind::Leave => self.subjects.swarm_leave(),
        };
        let payload = Bytes::from(serde_json::to_vec(&msg).map_err(BusError::from)?);
        self.bus.publish(&subject, payload).await?;
        Ok(())
    }

    /// Runs until the subscription ends, applying every membership message
    /// (including our own, which is harmless -- it just refreshes our own
    /// `last_seen`) to the local table.
    pub async fn run_listener(self: Arc<Self>) -> Result<(), SwarmError> {
        let mut sub = self.bus.subscribe(&self.subjects.swarm_wildcard()).await?;
        while let Some(bus_msg) = sub.next().await {
            let msg: SwarmMessage = match bus_msg.deserialize() {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed swarm message");
                    continue;
                }
            };
            self.apply(&msg);
        }
        Ok(())
    }

    fn apply(&self, msg: &SwarmMessage) {
        let mut members = self.members.lock().expect("swarm table lock poisoned");
        match msg.kind {
            SwarmMessageKind::Announce => {
                debug!(instance = %msg.instance_id, "swarm announce");
                let joined_at = members.get(&msg.instance_id).map(|m| m.joined_at).unwrap_or_else(Utc::now);
                members.insert(msg.instance_id.clone(), SwarmMember::from_message(msg, joined_at));
            }
            SwarmMessageKind::Heartbeat => {
                match members.get_mut(&msg.instance_id) {
                    Some(existing) => {
                        debug!(instance = %msg.instance_id, "swarm heartbeat");
                        existing.status = msg.status;
                        existing.load = msg.load.clone();
                        existing.last_seen = Utc::now();
                    }
                    None => {
                        debug!(instance = %msg.instance_id, "heartbeat for unknown instance, ignoring");
                    }
                }
            }
            SwarmMessageKind::Leave => {
                info!(instance = %msg.instance_id, "swarm member left");
                members.remove(&msg.instance_id);
            }
        }
    }

    pub fn members(&self) -> Vec<SwarmMember> {
        self.members.lock().expect("swarm table lock poisoned").values().cloned().collect()
    }

    pub fn members_with_role(&self, role: &str) -> Vec<SwarmMember> {
        self.members()
            .into_iter()
            .filter(|m| m.roles.iter().any(|r| r == role))
            .collect()
    }

    /// Removes members whose last heartbeat/announce is older than
    /// `stale_threshold`. Returns the number reaped. A member exactly at the
    /// cutoff is retained; only strictly older entries are reaped.
    pub fn reap_stale(&self, stale_threshold: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(stale_threshold).unwrap_or_default();
        let mut members = self.members.lock().expect("swarm table lock poisoned");
        let before = members.len();
        members.retain(|_, m| !is_stale(m.last_seen, cutoff));
        let reaped = before - members.len();
        if reaped > 0 {
            info!(reaped, "reaped stale swarm members");
        }
        reaped
    }

    /// Spawns the periodic heartbeat; runs until the process exits.
    pub fn spawn_heartbeat_loop(self: Arc<Self>, me: SelfDescription, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.heartbeat(&me, SwarmStatus::Online, SwarmLoad::default()).await {
                    warn!(error = %e, "failed to publish heartbeat");
                }
            }
        });
    }

    /// Spawns the periodic stale-member reaper; runs until the process exits.
    pub fn spawn_reaper_loop(self: Arc<Self>, reap_interval: Duration, stale_threshold: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reap_interval);
            loop {
                ticker.tick().await;
                self.reap_stale(stale_threshold);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::bus::fake::FakeBus;

    fn me() -> SelfDescription {
        SelfDescription {
            service_id: "agent".to_string(),
            service_type: "project-agent".to_string(),
            roles: vec!["coder".to_string()],
            capabilities: vec![],
            project_ids: vec!["proj".to_string()],
            endpoint: None,
        }
    }

    #[tokio::test]
    async fn announce_then_listener_adds_member() {
        let bus: DynMessageBus = StdArc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let manager = SwarmManager::new(bus.clone(), subjects.clone(), "inst-1");

        let listener = manager.clone();
        tokio::spawn(async move {
            listener.run_listener().await.unwrap();
        });
        tokio::task::yield_now().await;

        manager.announce(&me(), SwarmLoad::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let members = manager.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].instance_id, "inst-1");
    }

    #[tokio::test]
    async fn leave_removes_member() {
        let bus: DynMessageBus = StdArc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let manager = SwarmManager::new(bus.clone(), subjects.clone(), "inst-1");

        let listener = manager.clone();
        tokio::spawn(async move {
            listener.run_listener().await.unwrap();
        });
        tokio::task::yield_now().await;

        manager.announce(&me(), SwarmLoad::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.members().len(), 1);

        manager.leave(&me()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.members().len(), 0);
    }

    #[test]
    fn reap_stale_removes_old_entries() {
        let bus: DynMessageBus = StdArc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let manager = SwarmManager::new(bus, subjects, "inst-1");
        {
            let mut members = manager.members.lock().unwrap();
            members.insert(
                "stale".to_string(),
                SwarmMember {
                    service_id: "svc".into(),
                    service_type: "agent".into(),
                    instance_id: "stale".into(),
                    capabilities: vec![],
                    roles: vec![],
                    project_ids: vec![],
                    endpoint: None,
                    status: SwarmStatus::Online,
                    load: SwarmLoad::default(),
                    joined_at: Utc::now() - chrono::Duration::seconds(120),
                    last_seen: Utc::now() - chrono::Duration::seconds(120),
                },
            );
        }
        assert_eq!(manager.reap_stale(Duration::from_secs(60)), 1);
        assert_eq!(manager.members().len(), 0);
    }

    #[test]
    fn member_exactly_at_cutoff_is_retained_strictly_older_is_reaped() {
        let cutoff = Utc::now();
        assert!(!is_stale(cutoff, cutoff));
        assert!(is_stale(cutoff - chrono::Duration::milliseconds(1), cutoff));
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_instance_is_ignored() {
        let bus: DynMessageBus = StdArc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let manager = SwarmManager::new(bus.clone(), subjects.clone(), "inst-1");

        let listener = manager.clone();
        tokio::spawn(async move {
            listener.run_listener().await.unwrap();
        });
        tokio::task::yield_now().await;

        manager.heartbeat(&me(), SwarmStatus::Online, SwarmLoad::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.members().len(), 0);
    }

    #[tokio::test]
    async fn reannounce_keeps_the_original_joined_at() {
        let bus: DynMessageBus = StdArc::new(FakeBus::new());
        let subjects = Subjects::new("loom");
        let manager = SwarmManager::new(bus.clone(), subjects.clone(), "inst-1");

        let listener = manager.clone();
        tokio::spawn(async move {
            listener.run_listener().await.unwrap();
        });
        tokio::task::yield_now().await;

        manager.announce(&me(), SwarmLoad::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let first_joined_at = manager.members()[0].joined_at;

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.announce(&me(), SwarmLoad::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let members = manager.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].joined_at, first_joined_at);
    }
}
