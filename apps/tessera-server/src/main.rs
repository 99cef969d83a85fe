use tessera_server::{LocalCluster, ServerConfig};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tessera.yaml".to_string());

    tracing::info!("Loading configuration from: {}", config_path);

    let config = if std::path::Path::new(&config_path).exists() {
        ServerConfig::load_from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, loading from environment variables");
        ServerConfig::load_from_env()?
    };

    tracing::info!("Coordination quorum: {}", config.coord.quorum);
    tracing::info!("Parent node: {}", config.coord.parent_path);

    let cluster = LocalCluster::new(config)?;
    cluster.start().await?;

    tracing::info!("Tessera cluster is ready");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Received shutdown signal, gracefully shutting down...");
    cluster.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
