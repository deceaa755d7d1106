// libs/telemedicine-cell/src/state.rs
use std::sync::Arc;

use shared_config::AppConfig;

use crate::services::{ConsultationService, WebhookReconciler};

/// Router state: built once at startup and cloned into every handler
#[derive(Clone)]
pub struct TelemedicineState {
    pub config: Arc<AppConfig>,
    pub consultations: Arc<ConsultationService>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl TelemedicineState {
    pub fn new(config: Arc<AppConfig>, consultations: Arc<ConsultationService>) -> Self {
        let reconciler = Arc::new(WebhookReconciler::new(consultations.clone()));
        Self {
            config,
            consultations,
            reconciler,
        }
    }

    pub fn from_config(config: Arc<AppConfig>) -> Self {
        let consultations = ConsultationService::from_config(&config);
        Self::new(config, consultations)
    }
}
