use axum::{routing::get, Router};

use crate::api::handlers::{self, AppState};
use crate::store::traits::EntityStore;

pub fn create_router<S: EntityStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Configured resources
        .route("/api", get(handlers::list_resources::<S>))
        .route(
            "/api/:resource",
            get(handlers::list_objects::<S>)
                .post(handlers::create_object::<S>)
                .delete(handlers::delete_objects::<S>),
        )
        .route(
            "/api/:resource/:id",
            get(handlers::get_object::<S>)
                .put(handlers::replace_object::<S>)
                .patch(handlers::patch_object::<S>)
                .delete(handlers::delete_object::<S>),
        )
}
