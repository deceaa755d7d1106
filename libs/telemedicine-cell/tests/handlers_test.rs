mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{Harness, FAKE_SIGNATURE, FAKE_SIGNATURE_HEADER};
use shared_utils::test_utils::{JwtTestUtils, TestUser};
use telemedicine_cell::router::telemedicine_routes;

fn app(h: &Harness) -> Router {
    telemedicine_routes(h.state())
}

fn token(h: &Harness, user: &TestUser) -> String {
    JwtTestUtils::create_test_token(user, &h.config.supabase_jwt_secret, Some(24))
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn empty_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let h = Harness::new();

    let response = app(&h)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["providers"], json!(["zoom"]));
    assert_eq!(json["store_backend"], "memory");
}

#[tokio::test]
async fn test_create_requires_authentication() {
    let h = Harness::new();

    let response = app(&h)
        .oneshot(json_request(
            "POST",
            "/consultations",
            None,
            json!({ "doctor_id": h.doctor.id, "patient_id": h.patient.id, "provider": "zoom" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_and_fetch_consultation() {
    let h = Harness::new();
    let doctor_token = token(&h, &h.doctor);

    let response = app(&h)
        .oneshot(json_request(
            "POST",
            "/consultations",
            Some(&doctor_token),
            json!({ "doctor_id": h.doctor.id, "patient_id": h.patient.id, "provider": "zoom" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["consultation"]["status"], "scheduled");
    assert!(created["join_url"].as_str().unwrap().ends_with("?host=1"));
    let id = created["consultation"]["id"].as_str().unwrap().to_string();

    let patient_token = token(&h, &h.patient);
    let response = app(&h)
        .oneshot(empty_request("GET", &format!("/consultations/{}", id), &patient_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["consultation"]["last_seq"], 0);
    assert_eq!(fetched["consultation"]["presence"]["doctor_connected"], false);
    assert!(!fetched["join_url"].as_str().unwrap().contains("host"));

    let stranger = TestUser::patient("stranger@example.com");
    let response = app(&h)
        .oneshot(empty_request("GET", &format!("/consultations/{}", id), &token(&h, &stranger)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_invalid_transition_is_conflict() {
    let h = Harness::new();
    let consultation = h.consultation().await;

    let response = app(&h)
        .oneshot(empty_request(
            "POST",
            &format!("/consultations/{}/end", consultation.id),
            &token(&h, &h.doctor),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "invalid_transition");
    assert_eq!(json["attempted"], "end");
    assert_eq!(json["current"], "scheduled");
}

#[tokio::test]
async fn test_cancel_with_reason() {
    let h = Harness::new();
    let consultation = h.consultation().await;

    let response = app(&h)
        .oneshot(json_request(
            "POST",
            &format!("/consultations/{}/cancel", consultation.id),
            Some(&token(&h, &h.doctor)),
            json!({ "reason": "patient rescheduled" }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["consultation"]["status"], "cancelled");
    assert_eq!(json["consultation"]["status_reason"], "patient rescheduled");
    assert_eq!(json["previous_status"], "scheduled");
}

#[tokio::test]
async fn test_post_and_list_messages() {
    let h = Harness::new();
    let consultation = h.consultation().await;
    let patient_token = token(&h, &h.patient);
    let uri = format!("/consultations/{}/messages", consultation.id);

    for body in ["hello", "are you there?"] {
        let response = app(&h)
            .oneshot(json_request("POST", &uri, Some(&patient_token), json!({ "body": body })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app(&h)
        .oneshot(empty_request("GET", &format!("{}?since_seq=1", uri), &token(&h, &h.doctor)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["total"], 1);
    assert_eq!(json["messages"][0]["body"], "are you there?");
    assert_eq!(json["last_seq"], 2);
}

#[tokio::test]
async fn test_webhook_endpoint() {
    let h = Harness::new();
    let consultation = h.consultation().await;
    let payload = json!({ "id": "evt-1", "event": "started", "room": consultation.provider_room_id });

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhooks/zoom")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app(&h).oneshot(unsigned).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let signed = || {
        Request::builder()
            .method("POST")
            .uri("/webhooks/zoom")
            .header(FAKE_SIGNATURE_HEADER, FAKE_SIGNATURE)
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let response = app(&h).oneshot(signed()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["outcome"], "applied");
    assert_eq!(json["status"], "in_progress");

    let response = app(&h).oneshot(signed()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["outcome"], "duplicate");
}

#[tokio::test]
async fn test_signed_webhook_without_room_is_acknowledged() {
    let h = Harness::new();

    for body in [
        json!({ "id": "evt-9", "event": "endpoint.url_validation" }).to_string(),
        "{ truncated".to_string(),
    ] {
        let response = app(&h)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhooks/zoom")
                    .header(FAKE_SIGNATURE_HEADER, FAKE_SIGNATURE)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["outcome"], "ignored");
    }
}

#[tokio::test]
async fn test_webhook_for_unknown_provider() {
    let h = Harness::new();

    let response = app(&h)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhooks/skype")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_sweep_requires_admin() {
    let h = Harness::new();

    let response = app(&h)
        .oneshot(empty_request("POST", "/admin/sweep", &token(&h, &h.doctor)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(empty_request("POST", "/admin/sweep", &token(&h, &h.admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["cancelled"], json!([]));
}
