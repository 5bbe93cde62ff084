use anyhow::Result;
use power_monitor_agent::{config, controller, telemetry};
use config::{BackendProvider, Config};
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    if cfg.backend.provider == BackendProvider::Firebase && cfg.backend.api_key.is_empty() {
        warn!("backend.api_key is empty - requests go out unauthenticated");
    }

    info!(
        backend = %cfg.backend.provider,
        meter = %cfg.meter.mode,
        actuator = %cfg.actuator.mode,
        "starting power monitor agent"
    );

    controller::run_agent(cfg, telemetry::shutdown_signal()).await?;

    warn!("shutdown complete");
    Ok(())
}
