// libs/telemedicine-cell/src/services/providers/mod.rs
use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use shared_config::AppConfig;

use crate::error::{ProviderError, TelemedicineError};
use crate::models::{ParsedEvent, RecordingRef, RoomHandle, RoomMetadata, VideoProvider};

pub mod jitsi;
pub mod livekit;
pub mod retry;
pub mod zoom;

pub use jitsi::JitsiAdapter;
pub use livekit::LiveKitAdapter;
pub use retry::RetryPolicy;
pub use zoom::ZoomAdapter;

/// Uniform contract over the external video platforms
#[async_trait]
pub trait VideoProviderAdapter: Send + Sync {
    fn provider(&self) -> VideoProvider;

    /// Provision the provider-side room for a consultation
    async fn create_room(
        &self,
        consultation_id: Uuid,
        metadata: &RoomMetadata,
    ) -> Result<RoomHandle, ProviderError>;

    /// Best-effort teardown; ending a room that no longer exists succeeds
    async fn end_room(&self, provider_room_id: &str) -> Result<(), ProviderError>;

    /// Authenticate a webhook delivery and normalize its payload
    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedEvent, ProviderError>;

    /// `Ok(None)` when no recording is available (yet)
    async fn fetch_recording(
        &self,
        provider_room_id: &str,
    ) -> Result<Option<RecordingRef>, ProviderError>;
}

/// Resolves adapters by provider. Built once at startup from `AppConfig`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<VideoProvider, Arc<dyn VideoProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let settings = &config.telemedicine;
        let mut registry = Self::new();

        if let Some(zoom) = &config.zoom {
            registry = registry.with_adapter(Arc::new(ZoomAdapter::new(zoom.clone(), settings)));
        }
        if let Some(livekit) = &config.livekit {
            registry = registry.with_adapter(Arc::new(LiveKitAdapter::new(livekit.clone(), settings)));
        }
        if let Some(jitsi) = &config.jitsi {
            registry = registry.with_adapter(Arc::new(JitsiAdapter::new(jitsi.clone(), settings)));
        }

        info!("Video providers enabled: {:?}", registry.providers());
        registry
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn VideoProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    pub fn get(&self, provider: VideoProvider) -> Result<Arc<dyn VideoProviderAdapter>, TelemedicineError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(TelemedicineError::ProviderNotConfigured(provider))
    }

    pub fn providers(&self) -> Vec<VideoProvider> {
        VideoProvider::ALL
            .into_iter()
            .filter(|provider| self.adapters.contains_key(provider))
            .collect()
    }
}

// ==============================================================================
// HELPERS SHARED BY ADAPTERS
// ==============================================================================

/// Read a provider response body, classifying non-success statuses
pub(crate) async fn read_json(
    provider: VideoProvider,
    operation: &str,
    response: reqwest::Response,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        error!("{} {} failed: {} - {}", provider, operation, status, text);
        return Err(ProviderError::from_status(status, &text));
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&text).map_err(|e| {
        ProviderError::permanent(format!("failed to parse {} {} response: {}", provider, operation, e))
    })
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProviderError> {
    headers
        .get(name)
        .ok_or_else(|| ProviderError::signature(format!("missing {} header", name)))?
        .to_str()
        .map_err(|_| ProviderError::signature(format!("malformed {} header", name)))
}

pub(crate) fn parse_body(body: &[u8]) -> Result<Value, ProviderError> {
    serde_json::from_slice(body).map_err(|e| ProviderError::permanent(format!("invalid webhook body: {}", e)))
}

/// Seconds or milliseconds since the epoch; providers use both
pub(crate) fn timestamp_from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Ids arrive as JSON strings or numbers depending on the provider
pub(crate) fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
