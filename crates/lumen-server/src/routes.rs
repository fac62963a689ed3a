use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Tenant-scoped CRUD plus the subscription operations.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/{tenant}/Subscription/{id}/$status",
            get(handlers::subscription_status),
        )
        .route(
            "/{tenant}/Subscription/{id}/$events",
            get(handlers::subscription_events),
        )
        .route("/{tenant}/{rtype}", post(handlers::create_resource))
        .route(
            "/{tenant}/{rtype}/{id}",
            get(handlers::read_resource)
                .put(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
