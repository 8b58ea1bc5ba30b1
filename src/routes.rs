use axum::{
    routing::{get, post},
    Router,
};

use crate::engine::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/v1/track", post(api::track))
        .route(
            "/v1/customers/:customer_id/balances",
            get(api::customer_balances),
        )
}
