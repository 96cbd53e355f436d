//! `loom`: a distributed orchestration substrate for fleets of autonomous
//! coding agents. See each module's doc comment for the piece of the system
//! it owns; `error::LoomError` is the umbrella type crossing module
//! boundaries.

pub mod agent;
pub mod bead;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod federation;
pub mod jsonx;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod rpc;
pub mod swarm;

pub use error::{LoomError, Result};
