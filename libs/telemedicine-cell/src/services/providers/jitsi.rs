// libs/telemedicine-cell/src/services/providers/jitsi.rs
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use uuid::Uuid;

use shared_config::{JitsiConfig, TelemedicineSettings};

use crate::error::ProviderError;
use crate::models::{
    ParsedEvent, RecordingRef, RoomHandle, RoomMetadata, VideoProvider, WebhookEventKind,
};

use super::{header_str, id_string, parse_body, timestamp_from_epoch, VideoProviderAdapter};

/// Jitsi Meet. Rooms exist as soon as someone opens the URL, so provisioning
/// is local; with an app secret the join URLs carry signed JWTs.
pub struct JitsiAdapter {
    config: JitsiConfig,
    token_ttl: Duration,
}

impl JitsiAdapter {
    pub fn new(config: JitsiConfig, settings: &TelemedicineSettings) -> Self {
        Self {
            config,
            token_ttl: Duration::seconds(settings.join_token_ttl_secs),
        }
    }

    pub fn room_name(consultation_id: Uuid) -> String {
        format!("consultation-{}", consultation_id)
    }

    fn base_url(&self) -> String {
        let domain = self.config.domain.trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        }
    }

    fn host(&self) -> &str {
        let domain = self.config.domain.trim_end_matches('/');
        domain
            .strip_prefix("https://")
            .or_else(|| domain.strip_prefix("http://"))
            .unwrap_or(domain)
    }

    fn join_token(
        &self,
        secret: &str,
        room: &str,
        identity: Uuid,
        moderator: bool,
        valid_until: DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let claims = json!({
            "aud": "jitsi",
            "iss": self.config.app_id,
            "sub": self.host(),
            "room": room,
            "nbf": Utc::now().timestamp() - 10,
            "exp": valid_until.timestamp(),
            "context": {
                "user": {
                    "id": identity,
                    "moderator": moderator,
                }
            }
        });

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| ProviderError::permanent(format!("failed to sign jitsi token: {}", e)))
    }

    fn join_url(
        &self,
        room: &str,
        identity: Uuid,
        moderator: bool,
        valid_until: DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/{}", self.base_url(), room);
        match &self.config.app_secret {
            Some(secret) => {
                let token = self.join_token(secret, room, identity, moderator, valid_until)?;
                Ok(format!("{}?jwt={}", url, token))
            }
            None => Ok(url),
        }
    }

    fn parse_event(payload: Value) -> Result<ParsedEvent, ProviderError> {
        let event = payload["eventType"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("jitsi webhook without eventType"))?
            .to_string();

        // fqn is "<tenant>/<room>"
        let room = payload["fqn"]
            .as_str()
            .and_then(|fqn| fqn.rsplit('/').next())
            .filter(|room| !room.is_empty());
        let known = matches!(event.as_str(), "ROOM_CREATED" | "ROOM_DESTROYED" | "RECORDING_UPLOADED");
        let provider_room_id = match room {
            Some(room) => room.to_string(),
            None if !known => String::new(),
            None => {
                return Err(ProviderError::permanent(format!(
                    "jitsi {} event without fqn",
                    event
                )))
            }
        };

        let timestamp = payload["timestamp"].as_i64();
        let occurred_at = timestamp.and_then(timestamp_from_epoch).unwrap_or_else(Utc::now);

        let event_id = id_string(&payload["idempotencyKey"]).unwrap_or_else(|| {
            format!(
                "{}:{}:{}",
                event,
                provider_room_id,
                timestamp.map(|ts| ts.to_string()).unwrap_or_default()
            )
        });

        let kind = match event.as_str() {
            "ROOM_CREATED" => WebhookEventKind::MeetingStarted,
            "ROOM_DESTROYED" => WebhookEventKind::MeetingEnded,
            "RECORDING_UPLOADED" => {
                let data = &payload["data"];
                let recording = data["preAuthenticatedLink"].as_str().map(|link| RecordingRef {
                    provider_recording_id: id_string(&payload["sessionId"]).unwrap_or_else(|| event_id.clone()),
                    url: Some(link.to_string()),
                    duration_seconds: data["durationSec"].as_i64(),
                });
                WebhookEventKind::RecordingCompleted { recording }
            }
            other => WebhookEventKind::Unknown(other.to_string()),
        };

        Ok(ParsedEvent {
            event_id,
            kind,
            provider_room_id,
            occurred_at,
            raw: payload,
        })
    }
}

#[async_trait]
impl VideoProviderAdapter for JitsiAdapter {
    fn provider(&self) -> VideoProvider {
        VideoProvider::Jitsi
    }

    async fn create_room(
        &self,
        consultation_id: Uuid,
        metadata: &RoomMetadata,
    ) -> Result<RoomHandle, ProviderError> {
        let room = Self::room_name(consultation_id);
        let valid_until = metadata.scheduled_time.max(Utc::now()) + self.token_ttl;

        info!("Prepared Jitsi room {} on {}", room, self.host());

        Ok(RoomHandle {
            doctor_join_url: self.join_url(&room, metadata.doctor_id, true, valid_until)?,
            patient_join_url: self.join_url(&room, metadata.patient_id, false, valid_until)?,
            provider_room_id: room,
        })
    }

    async fn end_room(&self, provider_room_id: &str) -> Result<(), ProviderError> {
        // The meeting server destroys rooms once the last participant leaves
        debug!("Jitsi room {} closes on its own", provider_room_id);
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedEvent, ProviderError> {
        let auth = header_str(headers, AUTHORIZATION.as_str())?;
        let token = auth
            .strip_prefix("Bearer ")
            .ok_or_else(|| ProviderError::signature("jitsi webhook without bearer token"))?;

        if !bool::from(token.as_bytes().ct_eq(self.config.webhook_token.as_bytes())) {
            return Err(ProviderError::signature("jitsi webhook token mismatch"));
        }

        Self::parse_event(parse_body(body)?)
    }

    async fn fetch_recording(
        &self,
        provider_room_id: &str,
    ) -> Result<Option<RecordingRef>, ProviderError> {
        debug!("Jitsi recordings for {} arrive only by webhook", provider_room_id);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use shared_utils::test_utils::TestConfig;

    fn adapter() -> JitsiAdapter {
        let config = TestConfig::default().to_app_config();
        JitsiAdapter::new(config.jitsi.unwrap(), &config.telemedicine)
    }

    fn metadata() -> RoomMetadata {
        RoomMetadata {
            doctor_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            scheduled_time: Utc::now(),
            recording_enabled: false,
            topic: "Follow-up".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_room_is_deterministic() {
        let adapter = adapter();
        let id = Uuid::new_v4();
        let metadata = metadata();

        let first = adapter.create_room(id, &metadata).await.unwrap();
        let second = adapter.create_room(id, &metadata).await.unwrap();

        assert_eq!(first.provider_room_id, second.provider_room_id);
        assert!(first
            .patient_join_url
            .starts_with(&format!("https://meet.jitsi.test/consultation-{}?jwt=", id)));
    }

    #[tokio::test]
    async fn test_doctor_token_is_moderator() {
        let adapter = adapter();
        let handle = adapter.create_room(Uuid::new_v4(), &metadata()).await.unwrap();

        let moderator = |url: &str| {
            let token = url.split("jwt=").nth(1).unwrap();
            let mut validation = Validation::new(Algorithm::HS256);
            validation.set_audience(&["jitsi"]);
            decode::<Value>(token, &DecodingKey::from_secret(b"test-jitsi-app-secret"), &validation)
                .unwrap()
                .claims["context"]["user"]["moderator"]
                .as_bool()
                .unwrap()
        };

        assert!(moderator(&handle.doctor_join_url));
        assert!(!moderator(&handle.patient_join_url));
    }

    #[test]
    fn test_webhook_token() {
        let body = br#"{"eventType":"ROOM_DESTROYED","fqn":"tenant/consultation-1","idempotencyKey":"k-1","timestamp":1700000000000}"#;
        let mut headers = HeaderMap::new();

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(matches!(
            adapter().verify_webhook(&headers, body),
            Err(ProviderError::Signature { .. })
        ));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer test-jitsi-webhook-token"));
        let event = adapter().verify_webhook(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::MeetingEnded);
        assert_eq!(event.provider_room_id, "consultation-1");
        assert_eq!(event.event_id, "k-1");
    }

    #[test]
    fn test_recording_uploaded() {
        let event = JitsiAdapter::parse_event(json!({
            "eventType": "RECORDING_UPLOADED",
            "sessionId": "sess-1",
            "fqn": "tenant/consultation-2",
            "idempotencyKey": "k-2",
            "data": { "preAuthenticatedLink": "https://files.jitsi.test/rec.mp4" }
        }))
        .unwrap();

        assert_eq!(
            event.kind,
            WebhookEventKind::RecordingCompleted {
                recording: Some(RecordingRef {
                    provider_recording_id: "sess-1".to_string(),
                    url: Some("https://files.jitsi.test/rec.mp4".to_string()),
                    duration_seconds: None,
                })
            }
        );
    }

    #[tokio::test]
    async fn test_join_token_lifetime_follows_settings() {
        let mut config = TestConfig::default().to_app_config();
        config.telemedicine.join_token_ttl_secs = 600;
        let adapter = JitsiAdapter::new(config.jitsi.unwrap(), &config.telemedicine);

        let handle = adapter.create_room(Uuid::new_v4(), &metadata()).await.unwrap();
        let token = handle.patient_join_url.split("jwt=").nth(1).unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["jitsi"]);
        let exp = decode::<Value>(token, &DecodingKey::from_secret(b"test-jitsi-app-secret"), &validation)
            .unwrap()
            .claims["exp"]
            .as_i64()
            .unwrap();

        let remaining = exp - Utc::now().timestamp();
        assert!((590..=600).contains(&remaining), "remaining {}", remaining);
    }

    #[test]
    fn test_unknown_event_without_fqn() {
        let event = JitsiAdapter::parse_event(json!({
            "eventType": "SETTINGS_PROVISIONING",
            "idempotencyKey": "k-3"
        }))
        .unwrap();
        assert_eq!(event.kind, WebhookEventKind::Unknown("SETTINGS_PROVISIONING".to_string()));
        assert_eq!(event.provider_room_id, "");

        let err = JitsiAdapter::parse_event(json!({ "eventType": "ROOM_CREATED" }));
        assert!(matches!(err, Err(ProviderError::Permanent { .. })));
    }
}
