//! `loom-agent`: boots a single project-agent instance -- subscribes to its
//! role's task subject, runs the action loop per task, serves its local HTTP
//! surface, optionally registers with a control plane, and announces itself
//! to the swarm. Configuration loading and logging init mirror the teacher's
//! `main.rs` (`ConfigLoader::load` then `logging::init`), trimmed to the one
//! binary this crate ships (spec §1 keeps the orchestrator host process, and
//! any CLI wrapping it, out of scope).

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use loom::agent::control_plane::ControlPlaneClient;
use loom::agent::llm::client_from_config;
use loom::agent::{http as agent_http, ProjectAgent};
use loom::bus::nats::NatsMessageBus;
use loom::bus::{DynMessageBus, Subjects};
use loom::config::ConfigLoader;
use loom::logging;
use loom::swarm::{SelfDescription, SwarmManager};

#[derive(Debug, Parser)]
#[command(name = "loom-agent", about = "Runs a single loom project-agent instance")]
struct Cli {
    /// Project this agent instance serves.
    #[arg(long, env = "LOOM_PROJECT_ID")]
    project_id: String,

    /// Role this instance fills (coder, reviewer, qa, ...). Overrides config.
    #[arg(long, env = "LOOM_AGENT_ROLE")]
    role: Option<String>,

    /// Stable identity for this process; a random id is generated if absent.
    #[arg(long, env = "LOOM_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Local HTTP surface port for /healthz and /status.
    #[arg(long, env = "LOOM_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Sandbox root the action loop and HTTP file/exec routes operate in.
    #[arg(long, env = "LOOM_WORK_DIR", default_value = ".")]
    work_dir: PathBuf,

    /// Base URL of the project-agent control plane. When unset, this agent
    /// skips registration and heartbeats and relies solely on the bus.
    #[arg(long, env = "LOOM_CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load().context("failed to load configuration")?;
    let _logger = logging::init(&config.logging).context("failed to initialize logging")?;

    let role = cli
        .role
        .or_else(|| config.role.clone())
        .context("agent role not set (pass --role or set `role` in config)")?;
    let instance_id = cli
        .instance_id
        .unwrap_or_else(|| format!("{role}-{}", uuid::Uuid::new_v4()));

    tracing::info!(role = %role, instance_id = %instance_id, project_id = %cli.project_id, "starting loom-agent");

    let subjects = Subjects::new("loom");
    let bus: DynMessageBus = Arc::new(
        NatsMessageBus::connect(&config.bus_url, &config.stream_name, &subjects.all())
            .await
            .context("failed to connect to message bus")?,
    );

    let llm = Arc::new(client_from_config(&config));
    let agent = ProjectAgent::new(bus.clone(), subjects.clone(), role.clone(), instance_id.clone(), llm, &config);

    let swarm = SwarmManager::new(bus.clone(), subjects.clone(), instance_id.clone());
    let self_description = SelfDescription {
        service_id: "loom-agent".to_string(),
        service_type: "project-agent".to_string(),
        roles: vec![role.clone()],
        capabilities: Vec::new(),
        project_ids: vec![cli.project_id.clone()],
        endpoint: Some(format!("http://0.0.0.0:{}", cli.http_port)),
    };
    swarm
        .announce(&self_description, Default::default())
        .await
        .context("failed to announce to swarm")?;
    swarm.clone().spawn_heartbeat_loop(self_description, config.agent_heartbeat_interval());
    tokio::spawn({
        let swarm = swarm.clone();
        async move {
            if let Err(e) = swarm.run_listener().await {
                tracing::warn!(error = %e, "swarm listener ended");
            }
        }
    });

    if let Some(control_plane_url) = &cli.control_plane_url {
        let client = Arc::new(ControlPlaneClient::new(control_plane_url.clone()));
        let agent_url = format!("http://0.0.0.0:{}", cli.http_port);
        let work_dir_str = cli.work_dir.to_string_lossy().into_owned();
        client
            .register(&cli.project_id, &work_dir_str, &agent_url)
            .await
            .context("failed to register with control plane")?;

        let heartbeat_client = client.clone();
        let heartbeat_instance_id = instance_id.clone();
        let heartbeat_project_id = cli.project_id.clone();
        let heartbeat_status = agent.status_handle();
        let heartbeat_interval = config.agent_heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            loop {
                ticker.tick().await;
                let busy = heartbeat_status.active_tasks.load(Ordering::Relaxed) > 0;
                if let Err(e) = heartbeat_client.heartbeat(&heartbeat_instance_id, &heartbeat_project_id, busy).await {
                    tracing::warn!(error = %e, "control-plane heartbeat failed");
                }
            }
        });
    }

    let http_app = agent_http::router(cli.project_id.clone(), cli.work_dir.clone(), agent.status_handle());
    let http_listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.http_port))
        .await
        .context("failed to bind http listener")?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, http_app).await {
            tracing::error!(error = %e, "http server stopped");
        }
    });

    agent.run(&cli.project_id).await.context("agent loop ended")?;
    Ok(())
}
