// libs/telemedicine-cell/src/services/reconciler.rs
use axum::http::HeaderMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{ProviderError, TelemedicineError};
use crate::models::{VideoProvider, WebhookOutcome};
use crate::services::consultation::ConsultationService;

/// Entry point for provider callbacks: authenticate with the provider's
/// adapter, then hand the normalized event to the orchestrator.
pub struct WebhookReconciler {
    consultations: Arc<ConsultationService>,
}

impl WebhookReconciler {
    pub fn new(consultations: Arc<ConsultationService>) -> Self {
        Self { consultations }
    }

    /// `Err` only for authentication and store failures. Once a delivery is
    /// authenticated it is always acknowledged, even if its body is unusable,
    /// so providers do not keep redelivering it.
    pub async fn handle(
        &self,
        provider: VideoProvider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, TelemedicineError> {
        let adapter = self.consultations.providers().get(provider)?;

        let event = match adapter.verify_webhook(headers, body) {
            Ok(event) => event,
            Err(ProviderError::Signature { message }) => {
                warn!("Rejected {} webhook: {}", provider, message);
                return Err(TelemedicineError::SignatureError { message });
            }
            Err(other) => {
                warn!("Unusable {} webhook acknowledged: {}", provider, other);
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("unusable delivery: {}", other),
                });
            }
        };

        info!(
            "{} webhook {} ({}) for room {}",
            provider,
            event.event_id,
            event.kind.name(),
            event.provider_room_id
        );

        match self.consultations.apply_webhook_event(provider, event).await {
            Err(TelemedicineError::UnknownRoom {
                provider,
                provider_room_id,
            }) => {
                warn!("{} webhook for unknown room {}", provider, provider_room_id);
                Ok(WebhookOutcome::Ignored {
                    reason: format!("unknown room {}", provider_room_id),
                })
            }
            Err(e) => {
                error!("Failed to apply {} webhook: {}", provider, e);
                Err(e)
            }
            ok => ok,
        }
    }
}
