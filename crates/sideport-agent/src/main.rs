use sideport_agent::{backend_from_name, AgentConfig, AgentServer};
use sideport_util::{
    agent_addr, finish_app_telemetry, init_app_telemetry, init_tracing, read_env_trimmed,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    init_app_telemetry("sideport-agent", env!("CARGO_PKG_VERSION"), "agent");

    let backend_name = read_env_trimmed("SIDEPORT_AGENT_BACKEND").unwrap_or_else(|| "input".into());
    let backend = backend_from_name(&backend_name)
        .ok_or_else(|| format!("unknown SIDEPORT_AGENT_BACKEND {backend_name:?} (expected input, input=<path> or log)"))?;
    if !backend.is_ready() {
        tracing::warn!("gesture backend {backend_name} is not ready; requests will fail");
    }

    let config = AgentConfig {
        addr: agent_addr(),
        ..AgentConfig::default()
    };
    let server = AgentServer::start(config, backend).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down ({} open connection(s))", server.connection_count());
    server.stop();
    finish_app_telemetry("agent", "ok");
    Ok(())
}
