use anyhow::{Context, Result};
use mqtt_redirect_proxy::{config::ProxyConfig, proxy::MqttProxyService};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Initialize tracing; MQTT_PROXY_LOG_FORMAT=json switches to JSON lines
    let json = std::env::var("MQTT_PROXY_LOG_FORMAT").is_ok_and(|f| f == "json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqtt_redirect_proxy=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    tracing::info!("Starting MQTT redirect proxy");

    // Load configuration
    let config = ProxyConfig::from_env()?;
    tracing::info!("Configuration loaded: {:?}", config);

    let mut service = MqttProxyService::new(config)?;
    if let Err(e) = service.start() {
        service.close();
        return Err(e).context("Failed to start MQTT proxy");
    }

    // The service owns its own thread pools; this runtime only waits for Ctrl-C
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    let shutdown = signals.block_on(tokio::signal::ctrl_c());
    match shutdown {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    service.close();
    Ok(())
}
