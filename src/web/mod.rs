pub mod handlers;
pub mod xml;

use crate::state::AppState;
use axum::{middleware, routing::get, Router};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root_handler))
        .route("/rootDesc.xml", get(handlers::description_handler))
        .route("/scpd/{service}", get(handlers::scpd_handler))
        .route("/ctl", axum::routing::post(handlers::control_handler))
        .route("/evt/{service}", axum::routing::any(handlers::event_handler))
        .route("/res", get(handlers::res_handler))
        .route("/icon", get(handlers::icon_handler))
        .route("/subtitle", get(handlers::subtitle_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            handlers::gate_middleware,
        ))
        .with_state(state)
}
