use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "cove.toml".to_string());
    let config = cove::Config::load(&config_path)?;

    info!(host = %config.hostname, port = config.port, "cove — where services talk IRC");

    let server = cove::Server::bind(config)?;
    server.run().await?;
    Ok(())
}
