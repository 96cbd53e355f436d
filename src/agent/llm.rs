//! The LLM provider seam the action loop drives. Reuses `planner::LlmClient`
//! rather than defining a second, near-identical completion trait -- both
//! the planner's decomposition call and the action loop's per-turn call are
//! "send a prompt, get text back".

pub use crate::planner::{HttpLlmClient, LlmClient};

use crate::config::Config;

/// Builds the configured `LlmClient` for a project agent from `Config`'s
/// `provider_*` fields (spec §6). Falls back to a placeholder endpoint when
/// none is configured, so an agent can still start up (and immediately fail
/// loudly on its first completion call) rather than panicking at wiring
/// time.
pub fn client_from_config(config: &Config) -> HttpLlmClient {
    let endpoint = config
        .provider_endpoint
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:0/v1/complete".to_string());
    HttpLlmClient::new(endpoint, config.provider_model.clone(), config.provider_api_key.clone())
}
