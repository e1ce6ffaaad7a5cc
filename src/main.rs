use crudgraph::config::AppConfig;
use crudgraph::{build_configured_app, serve_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    // Initialize logging with explicit filter to suppress sqlx debug logs
    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    println!("crudgraph: generic CRUD server over an entity graph");

    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: server={}:{}, store={:?}",
        config.server.host, config.server.port, config.store.backend
    );

    let app = build_configured_app(&config).await?;
    println!("Serving on http://{}", config.server_address());

    serve_app(app, &config).await
}
