use anyhow::Result;
use tracing::error;
use wa_gateway::config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    wa_telemetry::install("wa-gateway", env!("CARGO_PKG_VERSION"))?;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!(panic = %info, "uncaught panic");
        default_hook(info);
    }));

    let config = GatewayConfig::from_env()?;
    wa_gateway::run(config).await
}
