// libs/telemedicine-cell/src/services/providers/livekit.rs
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::{LiveKitConfig, TelemedicineSettings};

use crate::error::ProviderError;
use crate::models::{
    ParsedEvent, RecordingRef, RoomHandle, RoomMetadata, VideoProvider, WebhookEventKind,
};

use super::{header_str, id_string, parse_body, read_json, timestamp_from_epoch, VideoProviderAdapter};

const ROOM_SERVICE: &str = "/twirp/livekit.RoomService";
const EGRESS_SERVICE: &str = "/twirp/livekit.Egress";

/// Rooms are kept alive this long after the last participant leaves
const EMPTY_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_create: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_list: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_admin: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_record: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub room_join: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub video: VideoGrant,
}

/// Claims of the JWT in a webhook's Authorization header
#[derive(Debug, Deserialize)]
struct WebhookClaims {
    sha256: String,
}

/// LiveKit server via its Twirp API. The room name `consultation-{id}` is the
/// idempotency key: CreateRoom on an existing name returns that room.
pub struct LiveKitAdapter {
    client: Client,
    config: LiveKitConfig,
    token_ttl: Duration,
}

impl LiveKitAdapter {
    pub fn new(config: LiveKitConfig, settings: &TelemedicineSettings) -> Self {
        Self {
            client: Client::new(),
            config,
            token_ttl: Duration::seconds(settings.join_token_ttl_secs),
        }
    }

    pub fn room_name(consultation_id: Uuid) -> String {
        format!("consultation-{}", consultation_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }

    fn ws_url(&self) -> String {
        let host = self.config.host.trim_end_matches('/');
        if let Some(rest) = host.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = host.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            host.to_string()
        }
    }

    /// Sign an access token for `identity` carrying `grant`
    pub fn access_token(
        &self,
        identity: &str,
        grant: VideoGrant,
        valid_until: chrono::DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let claims = AccessTokenClaims {
            iss: self.config.api_key.clone(),
            sub: identity.to_string(),
            nbf: Utc::now().timestamp() - 10,
            exp: valid_until.timestamp(),
            name: None,
            video: grant,
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.api_secret.as_bytes()),
        )
        .map_err(|e| ProviderError::permanent(format!("failed to sign livekit token: {}", e)))
    }

    fn service_token(&self, grant: VideoGrant) -> Result<String, ProviderError> {
        self.access_token(&self.config.api_key, grant, Utc::now() + Duration::minutes(10))
    }

    fn join_url(
        &self,
        room: &str,
        identity: Uuid,
        admin: bool,
        valid_until: chrono::DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let token = self.access_token(
            &identity.to_string(),
            VideoGrant {
                room_join: true,
                room_admin: admin,
                room: Some(room.to_string()),
                ..VideoGrant::default()
            },
            valid_until,
        )?;

        Ok(format!(
            "{}?liveKitUrl={}&token={}",
            self.config.meet_url,
            urlencoding::encode(&self.ws_url()),
            urlencoding::encode(&token)
        ))
    }

    async fn twirp(&self, method: &str, grant: VideoGrant, body: Value) -> Result<reqwest::Response, ProviderError> {
        let token = self.service_token(grant)?;
        debug!("LiveKit Twirp call {}", method);

        Ok(self
            .client
            .post(self.url(method))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?)
    }

    fn parse_event(payload: Value) -> Result<ParsedEvent, ProviderError> {
        let event = payload["event"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("livekit webhook without event name"))?
            .to_string();

        let egress = field(&payload, "egressInfo", "egress_info");
        let kind = match event.as_str() {
            "room_started" => WebhookEventKind::MeetingStarted,
            "room_finished" => WebhookEventKind::MeetingEnded,
            "egress_ended" => WebhookEventKind::RecordingCompleted {
                recording: recording_from_egress(egress),
            },
            other => WebhookEventKind::Unknown(other.to_string()),
        };

        let room_name = payload["room"]["name"]
            .as_str()
            .or_else(|| field(egress, "roomName", "room_name").as_str());
        let provider_room_id = match (room_name, &kind) {
            (Some(name), _) => name.to_string(),
            // participant and track events for rooms we never created may omit it
            (None, WebhookEventKind::Unknown(_)) => String::new(),
            (None, _) => {
                return Err(ProviderError::permanent(format!(
                    "livekit {} event without room",
                    event
                )))
            }
        };

        let created_at = int_field(field(&payload, "createdAt", "created_at"));
        let occurred_at = created_at.and_then(timestamp_from_epoch).unwrap_or_else(Utc::now);

        let event_id = id_string(&payload["id"]).unwrap_or_else(|| {
            format!(
                "{}:{}:{}",
                event,
                provider_room_id,
                created_at.map(|ts| ts.to_string()).unwrap_or_default()
            )
        });

        Ok(ParsedEvent {
            event_id,
            kind,
            provider_room_id,
            occurred_at,
            raw: payload,
        })
    }
}

/// Protobuf JSON may use either camelCase or the original field names
fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> &'a Value {
    match value.get(camel) {
        Some(found) if !found.is_null() => found,
        _ => &value[snake],
    }
}

/// int64 fields are serialized as strings in protobuf JSON
fn int_field(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn egress_complete(egress: &Value) -> bool {
    match &egress["status"] {
        Value::String(status) => status == "EGRESS_COMPLETE",
        Value::Number(status) => status.as_i64() == Some(3),
        _ => false,
    }
}

fn recording_from_egress(egress: &Value) -> Option<RecordingRef> {
    if !egress_complete(egress) {
        return None;
    }

    let provider_recording_id = id_string(field(egress, "egressId", "egress_id"))?;
    let file = field(egress, "fileResults", "file_results")
        .as_array()
        .and_then(|files| files.first())
        .unwrap_or_else(|| field(egress, "file", "file"));

    Some(RecordingRef {
        provider_recording_id,
        url: file["location"].as_str().map(str::to_string),
        // durations are nanoseconds
        duration_seconds: int_field(&file["duration"]).map(|nanos| nanos / 1_000_000_000),
    })
}

#[async_trait]
impl VideoProviderAdapter for LiveKitAdapter {
    fn provider(&self) -> VideoProvider {
        VideoProvider::LiveKit
    }

    async fn create_room(
        &self,
        consultation_id: Uuid,
        metadata: &RoomMetadata,
    ) -> Result<RoomHandle, ProviderError> {
        let name = Self::room_name(consultation_id);
        info!("Creating LiveKit room {}", name);

        let response = self
            .twirp(
                &format!("{}/CreateRoom", ROOM_SERVICE),
                VideoGrant {
                    room_create: true,
                    ..VideoGrant::default()
                },
                json!({
                    "name": name,
                    "empty_timeout": EMPTY_TIMEOUT_SECS,
                    "max_participants": 8,
                    "metadata": json!({
                        "consultation_id": consultation_id,
                        "topic": metadata.topic,
                        "recording_enabled": metadata.recording_enabled,
                    })
                    .to_string(),
                }),
            )
            .await?;
        let room = read_json(VideoProvider::LiveKit, "CreateRoom", response).await?;

        let provider_room_id = room["name"].as_str().unwrap_or(&name).to_string();
        let valid_until = metadata.scheduled_time.max(Utc::now()) + self.token_ttl;

        Ok(RoomHandle {
            doctor_join_url: self.join_url(&provider_room_id, metadata.doctor_id, true, valid_until)?,
            patient_join_url: self.join_url(&provider_room_id, metadata.patient_id, false, valid_until)?,
            provider_room_id,
        })
    }

    async fn end_room(&self, provider_room_id: &str) -> Result<(), ProviderError> {
        let response = self
            .twirp(
                &format!("{}/DeleteRoom", ROOM_SERVICE),
                VideoGrant {
                    room_create: true,
                    room: Some(provider_room_id.to_string()),
                    ..VideoGrant::default()
                },
                json!({ "room": provider_room_id }),
            )
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!("LiveKit room {} already gone", provider_room_id);
            return Ok(());
        }
        read_json(VideoProvider::LiveKit, "DeleteRoom", response).await?;
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedEvent, ProviderError> {
        let auth = header_str(headers, AUTHORIZATION.as_str())?;
        let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.api_key.as_str()]);
        validation.validate_aud = false;

        let claims = decode::<WebhookClaims>(
            token,
            &DecodingKey::from_secret(self.config.api_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| ProviderError::signature(format!("invalid livekit webhook token: {}", e)))?
        .claims;

        let digest = STANDARD.encode(Sha256::digest(body));
        if !bool::from(digest.as_bytes().ct_eq(claims.sha256.as_bytes())) {
            return Err(ProviderError::signature("livekit body checksum mismatch"));
        }

        Self::parse_event(parse_body(body)?)
    }

    async fn fetch_recording(
        &self,
        provider_room_id: &str,
    ) -> Result<Option<RecordingRef>, ProviderError> {
        let response = self
            .twirp(
                &format!("{}/ListEgress", EGRESS_SERVICE),
                VideoGrant {
                    room_record: true,
                    ..VideoGrant::default()
                },
                json!({ "room_name": provider_room_id }),
            )
            .await?;
        let listing = read_json(VideoProvider::LiveKit, "ListEgress", response).await?;

        Ok(listing["items"]
            .as_array()
            .and_then(|items| items.iter().find_map(recording_from_egress)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::decode_header;
    use shared_utils::test_utils::TestConfig;

    fn adapter() -> LiveKitAdapter {
        let config = TestConfig::default().to_app_config();
        LiveKitAdapter::new(config.livekit.unwrap(), &config.telemedicine)
    }

    fn webhook_token(body: &[u8], key: &str, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &json!({
                "iss": key,
                "exp": (Utc::now() + Duration::minutes(5)).timestamp(),
                "sha256": STANDARD.encode(Sha256::digest(body)),
            }),
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(token).unwrap());
        headers
    }

    #[test]
    fn test_valid_webhook() {
        let body = serde_json::to_vec(&json!({
            "event": "room_finished",
            "id": "EV_abc123",
            "createdAt": "1700000000",
            "room": { "sid": "RM_1", "name": "consultation-1" }
        }))
        .unwrap();
        let token = webhook_token(&body, "test-livekit-key", "test-livekit-secret-that-is-long-enough");

        let event = adapter().verify_webhook(&headers(&token), &body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::MeetingEnded);
        assert_eq!(event.event_id, "EV_abc123");
        assert_eq!(event.provider_room_id, "consultation-1");
        assert_eq!(event.occurred_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_rejects_checksum_mismatch_and_foreign_key() {
        let body = br#"{"event":"room_started","id":"EV_1","room":{"name":"consultation-1"}}"#;
        let token = webhook_token(b"{}", "test-livekit-key", "test-livekit-secret-that-is-long-enough");
        assert!(matches!(
            adapter().verify_webhook(&headers(&token), body),
            Err(ProviderError::Signature { .. })
        ));

        let token = webhook_token(body, "other-key", "test-livekit-secret-that-is-long-enough");
        assert!(matches!(
            adapter().verify_webhook(&headers(&token), body),
            Err(ProviderError::Signature { .. })
        ));

        assert!(matches!(
            adapter().verify_webhook(&HeaderMap::new(), body),
            Err(ProviderError::Signature { .. })
        ));
    }

    #[test]
    fn test_egress_recording() {
        let event = LiveKitAdapter::parse_event(json!({
            "event": "egress_ended",
            "id": "EV_2",
            "egressInfo": {
                "egressId": "EG_1",
                "roomName": "consultation-1",
                "status": "EGRESS_COMPLETE",
                "fileResults": [{ "location": "s3://bucket/EG_1.mp4", "duration": "90000000000" }]
            }
        }))
        .unwrap();

        assert_eq!(event.provider_room_id, "consultation-1");
        assert_eq!(
            event.kind,
            WebhookEventKind::RecordingCompleted {
                recording: Some(RecordingRef {
                    provider_recording_id: "EG_1".to_string(),
                    url: Some("s3://bucket/EG_1.mp4".to_string()),
                    duration_seconds: Some(90),
                })
            }
        );
    }

    #[test]
    fn test_unknown_event_without_room() {
        let event = LiveKitAdapter::parse_event(json!({
            "event": "participant_joined",
            "id": "EV_3",
            "participant": { "identity": "observer" }
        }))
        .unwrap();
        assert_eq!(event.kind, WebhookEventKind::Unknown("participant_joined".to_string()));
        assert_eq!(event.provider_room_id, "");

        let err = LiveKitAdapter::parse_event(json!({ "event": "room_finished", "id": "EV_4" }));
        assert!(matches!(err, Err(ProviderError::Permanent { .. })));
    }

    #[test]
    fn test_join_token_grants() {
        let adapter = adapter();
        let token = adapter
            .access_token(
                "doctor",
                VideoGrant {
                    room_join: true,
                    room_admin: true,
                    room: Some("consultation-1".to_string()),
                    ..VideoGrant::default()
                },
                Utc::now() + Duration::hours(1),
            )
            .unwrap();

        assert_eq!(decode_header(&token).unwrap().alg, Algorithm::HS256);

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&["test-livekit-key"]);
        let claims = decode::<AccessTokenClaims>(
            &token,
            &DecodingKey::from_secret(b"test-livekit-secret-that-is-long-enough"),
            &validation,
        )
        .unwrap()
        .claims;

        assert_eq!(claims.sub, "doctor");
        assert!(claims.video.room_join && claims.video.room_admin);
        assert!(!claims.video.room_create);
        assert_eq!(adapter.ws_url(), "ws://localhost:9");
    }
}
