pub mod dashboard;
pub mod results;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(crate::api::router())
        .nest(
            "/api",
            Router::new().merge(results::router()).merge(dashboard::router()),
        )
        .with_state(state)
}
