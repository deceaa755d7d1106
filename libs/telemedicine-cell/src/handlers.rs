// libs/telemedicine-cell/src/handlers.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shared_models::auth::User;
use shared_utils::extractor::{authenticate, bearer_token};

use crate::error::TelemedicineError;
use crate::models::{
    ClientFrame, ConnectQuery, Consultation, CreateConsultationRequest, MessagesQuery,
    ReportIssueRequest, SendMessageRequest, TransitionOutcome, TransitionRequest, VideoProvider,
};
use crate::services::gateway::RoomConnection;
use crate::services::ConsultationService;
use crate::state::TelemedicineState;

// ==============================================================================
// CONSULTATION LIFECYCLE HANDLERS
// ==============================================================================

/// Create a consultation (from a booking or explicit participants) and its provider room
#[axum::debug_handler]
pub async fn create_consultation(
    State(state): State<TelemedicineState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateConsultationRequest>,
) -> Result<(StatusCode, Json<Value>), TelemedicineError> {
    let consultation = state
        .consultations
        .create(request, &user, Some(auth.token()))
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "consultation": consultation,
            "join_url": caller_join_url(&consultation, &user),
            "message": "Consultation created"
        })),
    ))
}

/// Consultation with live presence and the caller's join URL
#[axum::debug_handler]
pub async fn get_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let snapshot = state.consultations.snapshot(consultation_id, &user).await?;
    let join_url = caller_join_url(&snapshot.consultation, &user);

    Ok(Json(json!({
        "success": true,
        "consultation": snapshot,
        "join_url": join_url
    })))
}

#[axum::debug_handler]
pub async fn join_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let outcome = state.consultations.join(consultation_id, &user).await?;
    let join_url = caller_join_url(&outcome.consultation, &user).map(str::to_string);

    let mut body = transition_body(outcome, "Joined waiting room");
    body["join_url"] = json!(join_url);
    Ok(Json(body))
}

#[axum::debug_handler]
pub async fn leave_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let was_connected = state.consultations.leave(consultation_id, &user).await?;

    Ok(Json(json!({
        "success": true,
        "was_connected": was_connected,
        "message": "Left consultation"
    })))
}

#[axum::debug_handler]
pub async fn start_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let outcome = state.consultations.start(consultation_id, &user).await?;
    Ok(Json(transition_body(outcome, "Consultation started")))
}

#[axum::debug_handler]
pub async fn end_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
    request: Option<Json<TransitionRequest>>,
) -> Result<Json<Value>, TelemedicineError> {
    let reason = request.and_then(|Json(request)| request.reason);
    let outcome = state.consultations.end(consultation_id, &user, reason).await?;
    Ok(Json(transition_body(outcome, "Consultation ended")))
}

#[axum::debug_handler]
pub async fn cancel_consultation(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
    request: Option<Json<TransitionRequest>>,
) -> Result<Json<Value>, TelemedicineError> {
    let reason = request.and_then(|Json(request)| request.reason);
    let outcome = state.consultations.cancel(consultation_id, &user, reason).await?;
    Ok(Json(transition_body(outcome, "Consultation cancelled")))
}

// ==============================================================================
// MESSAGES & ISSUES
// ==============================================================================

#[axum::debug_handler]
pub async fn list_messages(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let messages = state.consultations.messages(consultation_id, &user, query).await?;
    let last_seq = messages.last().map(|message| message.seq);

    Ok(Json(json!({
        "messages": messages,
        "total": messages.len(),
        "last_seq": last_seq
    })))
}

#[axum::debug_handler]
pub async fn send_message(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Value>), TelemedicineError> {
    let message = state
        .consultations
        .send_message(consultation_id, &user, request)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "message": message }))))
}

#[axum::debug_handler]
pub async fn list_issues(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let issues = state.consultations.issues(consultation_id, &user).await?;

    Ok(Json(json!({
        "issues": issues,
        "total": issues.len()
    })))
}

#[axum::debug_handler]
pub async fn report_issue(
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Extension(user): Extension<User>,
    Json(request): Json<ReportIssueRequest>,
) -> Result<(StatusCode, Json<Value>), TelemedicineError> {
    let issue = state
        .consultations
        .report_issue(consultation_id, &user, request)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "issue": issue }))))
}

#[axum::debug_handler]
pub async fn resolve_issue(
    State(state): State<TelemedicineState>,
    Path((consultation_id, issue_id)): Path<(Uuid, Uuid)>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    let issue = state
        .consultations
        .resolve_issue(consultation_id, issue_id, &user)
        .await?;

    Ok(Json(json!({ "success": true, "issue": issue })))
}

// ==============================================================================
// REALTIME
// ==============================================================================

/// WebSocket upgrade. Browsers cannot set headers on WebSocket requests, so
/// the bearer token may also arrive as `?token=`.
pub async fn consultation_socket(
    ws: WebSocketUpgrade,
    State(state): State<TelemedicineState>,
    Path(consultation_id): Path<Uuid>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    let token = match query.token.as_deref() {
        Some(token) => token,
        None => match bearer_token(&headers) {
            Ok(token) => token,
            Err(e) => return e.into_response(),
        },
    };
    let user = match authenticate(&state.config, token) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    let connection = match state
        .consultations
        .connect(consultation_id, &user, query.since_seq)
        .await
    {
        Ok((_, connection)) => connection,
        Err(e) => return e.into_response(),
    };

    info!(
        "Realtime connection {} opened for {} in {}",
        connection.connection_id, user.id, consultation_id
    );
    let consultations = state.consultations.clone();
    ws.on_upgrade(move |socket| run_socket(socket, consultations, user, connection))
}

async fn run_socket(
    socket: WebSocket,
    consultations: Arc<ConsultationService>,
    user: User,
    connection: RoomConnection,
) {
    let consultation_id = connection.participant.consultation_id;
    let connection_id = connection.connection_id;
    let mut frames = connection.frames;
    let (mut sink, mut stream) = socket.split();

    // Gateway frames -> socket. Ends when the gateway drops the connection.
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_client_frame(&consultations, consultation_id, &user, text.as_str()).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Realtime connection {} errored: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    consultations.drop_connection(consultation_id, connection_id).await;
    writer.abort();
    info!("Realtime connection {} closed", connection_id);
}

async fn handle_client_frame(
    consultations: &ConsultationService,
    consultation_id: Uuid,
    user: &User,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Unreadable client frame in {}: {}", consultation_id, e);
            return;
        }
    };

    let result = match frame {
        ClientFrame::Chat { body } => consultations
            .send_message(consultation_id, user, SendMessageRequest { body, file_reference: false })
            .await
            .map(|_| ()),
        ClientFrame::File { body } => consultations
            .send_message(consultation_id, user, SendMessageRequest { body, file_reference: true })
            .await
            .map(|_| ()),
        ClientFrame::Issue { description, severity } => consultations
            .report_issue(consultation_id, user, ReportIssueRequest { description, severity })
            .await
            .map(|_| ()),
        ClientFrame::Ping => Ok(()),
    };

    if let Err(e) = result {
        warn!("Client frame from {} in {} rejected: {}", user.id, consultation_id, e);
    }
}

// ==============================================================================
// PROVIDER WEBHOOKS
// ==============================================================================

/// Provider callback. Authentication failures are 401; anything the provider
/// should not retry is acknowledged with an `outcome`.
pub async fn provider_webhook(
    State(state): State<TelemedicineState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, TelemedicineError> {
    let provider: VideoProvider = provider.parse().map_err(TelemedicineError::validation)?;
    let outcome = state.reconciler.handle(provider, &headers, &body).await?;

    Ok(Json(json!(outcome)))
}

// ==============================================================================
// SYSTEM
// ==============================================================================

#[axum::debug_handler]
pub async fn telemedicine_health(State(state): State<TelemedicineState>) -> Json<Value> {
    let providers = state.consultations.providers().providers();

    Json(json!({
        "status": if providers.is_empty() { "degraded" } else { "healthy" },
        "providers": providers,
        "store_backend": format!("{:?}", state.config.telemedicine.store_backend).to_lowercase(),
        "open_rooms": state.consultations.gateway().open_rooms().await
    }))
}

/// Admin: run the waiting-room sweep now
#[axum::debug_handler]
pub async fn sweep_waiting_rooms(
    State(state): State<TelemedicineState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, TelemedicineError> {
    if !user.is_admin() {
        return Err(TelemedicineError::Unauthorized);
    }

    let cancelled = state.consultations.sweep_idle_waiting().await?;

    Ok(Json(json!({
        "success": true,
        "cancelled": cancelled,
        "message": format!("Cancelled {} idle consultations", cancelled.len())
    })))
}

// ==============================================================================
// HELPERS
// ==============================================================================

fn caller_join_url<'a>(consultation: &'a Consultation, user: &User) -> Option<&'a str> {
    user.user_id()
        .and_then(|id| consultation.role_of(id))
        .and_then(|role| consultation.join_url_for(role))
}

fn transition_body(outcome: TransitionOutcome, message: &str) -> Value {
    json!({
        "success": true,
        "changed": outcome.changed,
        "previous_status": outcome.previous,
        "consultation": outcome.consultation,
        "message": message
    })
}
