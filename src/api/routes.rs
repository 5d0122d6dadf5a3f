use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use crate::auth::{auth_middleware, AuthService};

use super::handlers::{get_context, health_check, AppState};

pub fn create_api_router(state: AppState, auth_service: Arc<AuthService>) -> Router {
    let state = Arc::new(state);

    let protected_routes = Router::new()
        .route("/v2/context/{ip}", get(get_context))
        .route_layer(middleware::from_fn(move |headers, req, next| {
            let auth = Arc::clone(&auth_service);
            auth_middleware(auth, headers, req, next)
        }))
        .with_state(Arc::clone(&state));

    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .merge(protected_routes)
}
