//! Subject-name construction for the `{ns}.>` namespace (spec §4.1/§6).
//!
//! Subject-name components are lowercase, dot-separated, and use only
//! `[a-z0-9-]`; `validate_component` enforces that once at construction time
//! rather than on every publish.

use std::sync::OnceLock;

use regex::Regex;

use crate::bus::BusError;

static COMPONENT_RE: OnceLock<Regex> = OnceLock::new();

fn component_re() -> &'static Regex {
    COMPONENT_RE.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("valid regex"))
}

fn validate_component(component: &str) -> Result<(), BusError> {
    if component_re().is_match(component) {
        Ok(())
    } else {
        Err(BusError::InvalidSubject(component.to_string()))
    }
}

/// Builds subjects under a configured namespace prefix `ns` (spec's `X`).
#[derive(Debug, Clone)]
pub struct Subjects {
    ns: String,
}

impl Subjects {
    pub fn new(ns: impl Into<String>) -> Self {
        Self { ns: ns.into() }
    }

    pub fn tasks(&self, project: &str) -> Result<String, BusError> {
        validate_component(project)?;
        Ok(format!("{}.tasks.{project}", self.ns))
    }

    pub fn tasks_role(&self, project: &str, role: &str) -> Result<String, BusError> {
        validate_component(project)?;
        validate_component(role)?;
        Ok(format!("{}.tasks.{project}.{role}", self.ns))
    }

    pub fn results(&self, project: &str) -> Result<String, BusError> {
        validate_component(project)?;
        Ok(format!("{}.results.{project}", self.ns))
    }

    pub fn results_wildcard(&self) -> String {
        format!("{}.results.*", self.ns)
    }

    pub fn events(&self, event_type: &str) -> Result<String, BusError> {
        validate_component(event_type)?;
        Ok(format!("{}.events.{event_type}", self.ns))
    }

    pub fn events_wildcard(&self) -> String {
        format!("{}.events.>", self.ns)
    }

    pub fn agent_messages(&self, agent_or_broadcast: &str) -> Result<String, BusError> {
        validate_component(agent_or_broadcast)?;
        Ok(format!("{}.agent.messages.{agent_or_broadcast}", self.ns))
    }

    pub fn agent_messages_broadcast(&self) -> String {
        format!("{}.agent.messages.broadcast", self.ns)
    }

    pub fn agent_messages_wildcard(&self) -> String {
        format!("{}.agent.messages.>", self.ns)
    }

    pub fn plans(&self, project: &str) -> Result<String, BusError> {
        validate_component(project)?;
        Ok(format!("{}.plans.{project}", self.ns))
    }

    pub fn reviews(&self, project: &str) -> Result<String, BusError> {
        validate_component(project)?;
        Ok(format!("{}.reviews.{project}", self.ns))
    }

    pub fn swarm_wildcard(&self) -> String {
        format!("{}.swarm.>", self.ns)
    }

    pub fn swarm_announce(&self) -> String {
        format!("{}.swarm.announce", self.ns)
    }

    pub fn swarm_heartbeat(&self) -> String {
        format!("{}.swarm.heartbeat", self.ns)
    }

    pub fn swarm_leave(&self) -> String {
        format!("{}.swarm.leave", self.ns)
    }

    /// `{ns}.rpc.{service}.{instance}.{method}`
    pub fn rpc(&self, service: &str, instance: &str, method: &str) -> Result<String, BusError> {
        validate_component(service)?;
        validate_component(instance)?;
        validate_component(method)?;
        Ok(format!("{}.rpc.{service}.{instance}.{method}", self.ns))
    }

    /// `{ns}.rpc.{service}.*.{method}` -- any instance.
    pub fn rpc_wildcard(&self, service: &str, method: &str) -> Result<String, BusError> {
        validate_component(service)?;
        validate_component(method)?;
        Ok(format!("{}.rpc.{service}.*.{method}", self.ns))
    }

    pub fn all(&self) -> String {
        format!("{}.>", self.ns)
    }
}
