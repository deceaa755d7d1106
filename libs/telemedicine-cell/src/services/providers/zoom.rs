// libs/telemedicine-cell/src/services/providers/zoom.rs
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared_config::{TelemedicineSettings, ZoomConfig};

use crate::error::ProviderError;
use crate::models::{
    ParsedEvent, RecordingRef, RoomHandle, RoomMetadata, VideoProvider, WebhookEventKind,
};

use super::{
    header_str, id_string, parse_body, read_json, timestamp_from_epoch, VideoProviderAdapter,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-zm-signature";
pub const TIMESTAMP_HEADER: &str = "x-zm-request-timestamp";

/// Zoom REST v2 meetings. Webhooks are signed with the app's secret token:
/// `x-zm-signature: v0=hex(HMAC-SHA256(secret, "v0:{timestamp}:{body}"))`.
pub struct ZoomAdapter {
    client: Client,
    config: ZoomConfig,
    max_skew_secs: i64,
}

impl ZoomAdapter {
    pub fn new(config: ZoomConfig, settings: &TelemedicineSettings) -> Self {
        Self {
            client: Client::new(),
            config,
            max_skew_secs: settings.webhook_max_skew_secs,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    fn mac(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256, ProviderError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ProviderError::signature("unusable zoom webhook secret"))?;
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        Ok(mac)
    }

    /// Signature over `v0:{timestamp}:{body}` as sent in `x-zm-signature`
    pub fn sign(secret: &str, timestamp: &str, body: &[u8]) -> Result<String, ProviderError> {
        let mac = Self::mac(secret, timestamp, body)?;
        Ok(format!("v0={}", hex::encode(mac.finalize().into_bytes())))
    }

    fn parse_event(payload: Value) -> Result<ParsedEvent, ProviderError> {
        let event = payload["event"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("zoom webhook without event name"))?
            .to_string();
        let object = &payload["payload"]["object"];

        let kind = match event.as_str() {
            "meeting.started" => WebhookEventKind::MeetingStarted,
            "meeting.ended" => WebhookEventKind::MeetingEnded,
            "recording.completed" => WebhookEventKind::RecordingCompleted {
                recording: recording_from_object(object),
            },
            "meeting.deleted" => WebhookEventKind::RoomDeleted,
            other => WebhookEventKind::Unknown(other.to_string()),
        };

        // endpoint.url_validation and account-level events carry no meeting
        let provider_room_id = match (id_string(&object["id"]), &kind) {
            (Some(id), _) => id,
            (None, WebhookEventKind::Unknown(_)) => String::new(),
            (None, _) => {
                return Err(ProviderError::permanent(format!(
                    "zoom {} event without meeting id",
                    event
                )))
            }
        };

        let event_ts = payload["event_ts"].as_i64();
        let occurred_at = event_ts.and_then(timestamp_from_epoch).unwrap_or_else(Utc::now);

        // Meeting ids are reused by recurring meetings; the uuid identifies the instance
        let instance = id_string(&object["uuid"]).unwrap_or_else(|| provider_room_id.clone());
        let event_id = format!(
            "{}:{}:{}",
            event,
            instance,
            event_ts.map(|ts| ts.to_string()).unwrap_or_default()
        );

        Ok(ParsedEvent {
            event_id,
            kind,
            provider_room_id,
            occurred_at,
            raw: payload,
        })
    }
}

/// Recording summary from a meeting recordings object (webhook or REST)
fn recording_from_object(object: &Value) -> Option<RecordingRef> {
    let first_file = object["recording_files"]
        .as_array()
        .and_then(|files| files.iter().find(|file| id_string(&file["id"]).is_some()));

    let provider_recording_id = first_file
        .and_then(|file| id_string(&file["id"]))
        .or_else(|| id_string(&object["uuid"]))?;

    let url = object["share_url"]
        .as_str()
        .or_else(|| first_file.and_then(|file| file["play_url"].as_str()))
        .map(str::to_string);

    Some(RecordingRef {
        provider_recording_id,
        url,
        duration_seconds: object["duration"].as_i64().map(|minutes| minutes * 60),
    })
}

#[async_trait]
impl VideoProviderAdapter for ZoomAdapter {
    fn provider(&self) -> VideoProvider {
        VideoProvider::Zoom
    }

    async fn create_room(
        &self,
        consultation_id: Uuid,
        metadata: &RoomMetadata,
    ) -> Result<RoomHandle, ProviderError> {
        info!("Creating Zoom meeting for consultation {}", consultation_id);

        let url = self.url(&format!("/users/{}/meetings", self.config.user_id));
        let request_body = json!({
            "topic": metadata.topic,
            "type": 2,
            "start_time": metadata.scheduled_time.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            "timezone": "UTC",
            "duration": 30,
            "agenda": format!("consultation {}", consultation_id),
            "settings": {
                "host_video": true,
                "participant_video": true,
                "join_before_host": false,
                "waiting_room": true,
                "auto_recording": if metadata.recording_enabled { "cloud" } else { "none" },
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&request_body)
            .send()
            .await?;
        let meeting = read_json(VideoProvider::Zoom, "create meeting", response).await?;

        let provider_room_id = id_string(&meeting["id"])
            .ok_or_else(|| ProviderError::permanent("zoom meeting response without id"))?;
        let doctor_join_url = meeting["start_url"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("zoom meeting response without start_url"))?;
        let patient_join_url = meeting["join_url"]
            .as_str()
            .ok_or_else(|| ProviderError::permanent("zoom meeting response without join_url"))?;

        info!("Created Zoom meeting {} for consultation {}", provider_room_id, consultation_id);

        Ok(RoomHandle {
            provider_room_id,
            doctor_join_url: doctor_join_url.to_string(),
            patient_join_url: patient_join_url.to_string(),
        })
    }

    async fn end_room(&self, provider_room_id: &str) -> Result<(), ProviderError> {
        debug!("Ending Zoom meeting {}", provider_room_id);

        let response = self
            .client
            .put(self.url(&format!("/meetings/{}/status", provider_room_id)))
            .bearer_auth(&self.config.access_token)
            .json(&json!({ "action": "end" }))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            warn!("Zoom meeting {} already gone", provider_room_id);
            return Ok(());
        }
        read_json(VideoProvider::Zoom, "end meeting", response).await?;
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedEvent, ProviderError> {
        let timestamp = header_str(headers, TIMESTAMP_HEADER)?;
        let signature = header_str(headers, SIGNATURE_HEADER)?;

        let sent_at: i64 = timestamp
            .parse()
            .map_err(|_| ProviderError::signature("non-numeric zoom request timestamp"))?;
        if (Utc::now().timestamp() - sent_at).abs() > self.max_skew_secs {
            return Err(ProviderError::signature("zoom request timestamp outside allowed window"));
        }

        let sent_signature = signature
            .strip_prefix("v0=")
            .and_then(|hex_digest| hex::decode(hex_digest).ok())
            .ok_or_else(|| ProviderError::signature("malformed zoom signature"))?;
        Self::mac(&self.config.webhook_secret_token, timestamp, body)?
            .verify_slice(&sent_signature)
            .map_err(|_| ProviderError::signature("zoom signature mismatch"))?;

        Self::parse_event(parse_body(body)?)
    }

    async fn fetch_recording(
        &self,
        provider_room_id: &str,
    ) -> Result<Option<RecordingRef>, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("/meetings/{}/recordings", provider_room_id)))
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("No Zoom recording for meeting {}", provider_room_id);
            return Ok(None);
        }
        let recordings = read_json(VideoProvider::Zoom, "list recordings", response).await?;
        Ok(recording_from_object(&recordings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use shared_utils::test_utils::TestConfig;

    fn adapter() -> ZoomAdapter {
        let config = TestConfig::default().to_app_config();
        ZoomAdapter::new(config.zoom.unwrap(), &config.telemedicine)
    }

    fn signed_headers(body: &[u8], timestamp: i64, secret: &str) -> HeaderMap {
        let timestamp = timestamp.to_string();
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp).unwrap());
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&ZoomAdapter::sign(secret, &timestamp, body).unwrap()).unwrap(),
        );
        headers
    }

    fn meeting_event(event: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": event,
            "event_ts": 1_700_000_000_123i64,
            "payload": {
                "account_id": "acct",
                "object": { "id": 85746065432i64, "uuid": "4444AAAiAAAAAiAiAiiAii==" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_signature() {
        let body = meeting_event("meeting.started");
        let headers = signed_headers(&body, Utc::now().timestamp(), "test-zoom-webhook-secret");

        let event = adapter().verify_webhook(&headers, &body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::MeetingStarted);
        assert_eq!(event.provider_room_id, "85746065432");
        assert_eq!(event.event_id, "meeting.started:4444AAAiAAAAAiAiAiiAii==:1700000000123");
    }

    #[test]
    fn test_rejects_wrong_secret_and_tampered_body() {
        let body = meeting_event("meeting.ended");
        let headers = signed_headers(&body, Utc::now().timestamp(), "wrong-secret");
        assert!(matches!(
            adapter().verify_webhook(&headers, &body),
            Err(ProviderError::Signature { .. })
        ));

        let headers = signed_headers(&body, Utc::now().timestamp(), "test-zoom-webhook-secret");
        let tampered = meeting_event("meeting.deleted");
        assert!(matches!(
            adapter().verify_webhook(&headers, &tampered),
            Err(ProviderError::Signature { .. })
        ));
    }

    #[test]
    fn test_rejects_stale_timestamp() {
        let body = meeting_event("meeting.started");
        let headers = signed_headers(&body, Utc::now().timestamp() - 3600, "test-zoom-webhook-secret");
        assert!(matches!(
            adapter().verify_webhook(&headers, &body),
            Err(ProviderError::Signature { .. })
        ));
    }

    #[test]
    fn test_recording_completed_payload() {
        let payload = json!({
            "event": "recording.completed",
            "event_ts": 1_700_000_500_000i64,
            "payload": { "object": {
                "id": 85746065432i64,
                "uuid": "instance==",
                "duration": 25,
                "share_url": "https://zoom.us/rec/share/abc",
                "recording_files": [{ "id": "file-1", "play_url": "https://zoom.us/rec/play/abc" }]
            }}
        });

        let event = ZoomAdapter::parse_event(payload).unwrap();
        assert_eq!(
            event.kind,
            WebhookEventKind::RecordingCompleted {
                recording: Some(RecordingRef {
                    provider_recording_id: "file-1".to_string(),
                    url: Some("https://zoom.us/rec/share/abc".to_string()),
                    duration_seconds: Some(1500),
                })
            }
        );
    }

    #[test]
    fn test_unknown_event_is_preserved() {
        let event = ZoomAdapter::parse_event(json!({
            "event": "meeting.participant_joined",
            "payload": { "object": { "id": "1" } }
        }))
        .unwrap();
        assert_eq!(event.kind, WebhookEventKind::Unknown("meeting.participant_joined".to_string()));
    }

    #[test]
    fn test_signed_url_validation_without_meeting() {
        let body = br#"{"event":"endpoint.url_validation","payload":{"plainToken":"abc"}}"#;
        let headers = signed_headers(body, Utc::now().timestamp(), "test-zoom-webhook-secret");

        let event = adapter().verify_webhook(&headers, body).unwrap();
        assert_eq!(event.kind, WebhookEventKind::Unknown("endpoint.url_validation".to_string()));
        assert_eq!(event.provider_room_id, "");

        let err = ZoomAdapter::parse_event(json!({ "event": "meeting.ended", "payload": {} }));
        assert!(matches!(err, Err(ProviderError::Permanent { .. })));
    }

    #[test]
    fn test_rejects_malformed_signature() {
        let body = meeting_event("meeting.started");
        let timestamp = Utc::now().timestamp().to_string();

        for signature in ["v0=not-hex", "deadbeef", "v0="] {
            let mut headers = HeaderMap::new();
            headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&timestamp).unwrap());
            headers.insert(SIGNATURE_HEADER, HeaderValue::from_static(signature));
            assert!(matches!(
                adapter().verify_webhook(&headers, &body),
                Err(ProviderError::Signature { .. })
            ));
        }
    }
}
