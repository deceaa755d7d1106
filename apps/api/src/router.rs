use axum::{
    Router,
    routing::get,
};

use telemedicine_cell::{router::telemedicine_routes, TelemedicineState};

pub fn create_router(state: TelemedicineState) -> Router {
    Router::new()
        .route("/", get(|| async { "Telemedicine API is running!" }))
        .merge(telemedicine_routes(state))
}
