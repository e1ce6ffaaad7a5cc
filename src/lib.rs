pub mod api;
pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

use axum::Router;
use log::{info, warn};
use std::sync::Arc;

use crate::config::{AppConfig, StoreBackend};
use crate::logic::crud::ResourceService;
use crate::model::ResourceDef;

// Export API types
pub use api::handlers;
pub use api::routes;

pub use error::*;
pub use logic::crud::{DeleteReport, ListParams, UpdateMode, WriteResponse};
pub use model::*;

// Export store types
pub use store::{EntityStore, MemoryStore, PostgresStore};

/// Router serving `resources` on top of `store`.
pub fn build_app<S: EntityStore + 'static>(
    store: Arc<S>,
    resources: Vec<ResourceDef>,
) -> anyhow::Result<Router> {
    let service = ResourceService::new(store, resources)?;
    Ok(routes::create_router().with_state(Arc::new(service)))
}

fn seed_requested() -> bool {
    std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true"
}

async fn seed_store<S: EntityStore>(store: &S, config: &AppConfig) -> anyhow::Result<()> {
    if !seed_requested() {
        return Ok(());
    }
    if config.schema.path.is_some() {
        warn!("LOAD_SEED_DATA ignored, seed data only fits the built-in library schema");
        return Ok(());
    }
    info!("Loading seed data...");
    seed::load_seed_data(store).await
}

/// Build the configured store and the router on top of it.
pub async fn build_configured_app(config: &AppConfig) -> anyhow::Result<Router> {
    let (registry, resources) = config.load_schema()?;

    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            let store = Arc::new(MemoryStore::new(registry));
            seed_store(&*store, config).await?;
            build_app(store, resources)
        }
        StoreBackend::Postgres => {
            info!("Connecting to PostgreSQL...");
            let database_url = config.database_url()?;
            let postgres_store =
                PostgresStore::new(&database_url, config.max_connections(), registry).await?;

            info!("Running database migrations...");
            postgres_store.migrate().await?;

            let store = Arc::new(postgres_store);
            seed_store(&*store, config).await?;
            build_app(store, resources)
        }
    }
}

pub async fn serve_app(app: Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("crudgraph server running on http://{}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
