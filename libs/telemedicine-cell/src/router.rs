// libs/telemedicine-cell/src/router.rs
use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_utils::extractor::auth_middleware;

use crate::handlers::*;
use crate::state::TelemedicineState;

/// Creates the telemedicine routes
pub fn telemedicine_routes(state: TelemedicineState) -> Router {
    // Public routes: webhooks authenticate with provider signatures, the
    // socket with its own token
    let public_routes = Router::new()
        .route("/health", get(telemedicine_health))
        .route("/webhooks/{provider}", post(provider_webhook))
        .route("/consultations/{consultation_id}/ws", get(consultation_socket));

    let protected_routes = Router::new()
        .route("/consultations", post(create_consultation))
        .route("/consultations/{consultation_id}", get(get_consultation))
        .route("/consultations/{consultation_id}/join", post(join_consultation))
        .route("/consultations/{consultation_id}/leave", post(leave_consultation))
        .route("/consultations/{consultation_id}/start", post(start_consultation))
        .route("/consultations/{consultation_id}/end", post(end_consultation))
        .route("/consultations/{consultation_id}/cancel", post(cancel_consultation))
        .route(
            "/consultations/{consultation_id}/messages",
            get(list_messages).post(send_message),
        )
        .route(
            "/consultations/{consultation_id}/issues",
            get(list_issues).post(report_issue),
        )
        .route(
            "/consultations/{consultation_id}/issues/{issue_id}/resolve",
            post(resolve_issue),
        )
        .route("/admin/sweep", post(sweep_waiting_rooms))
        .layer(middleware::from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
}
