// libs/telemedicine-cell/src/lib.rs
//! # Telemedicine Cell
//!
//! Turns a booking into a live virtual visit: drives each consultation through
//! its lifecycle, provisions rooms on Zoom, LiveKit or Jitsi, reconciles
//! provider webhooks, and fans out chat, presence and status frames to the
//! participants connected over WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                     Telemedicine Cell                        |
//! +-------------------------------------------------------------+
//! |  handlers.rs       |  HTTP + WebSocket endpoint handlers     |
//! |  router.rs         |  Route definitions                      |
//! |  state.rs          |  Shared router state                    |
//! |  models.rs         |  Consultation model, frames & DTOs      |
//! |  error.rs          |  Error taxonomy and HTTP mapping        |
//! |  services/         |  Business logic layer                   |
//! |    lifecycle.rs    |  Consultation state machine             |
//! |    consultation.rs |  Orchestrator (single writer)           |
//! |    providers/      |  Zoom / LiveKit / Jitsi adapters        |
//! |    reconciler.rs   |  Webhook verification and dispatch      |
//! |    gateway.rs      |  Realtime rooms and fan-out             |
//! |    store.rs        |  Persistence (memory / Supabase)        |
//! |    booking.rs      |  Booking lookups                        |
//! |    sweeper.rs      |  Idle waiting-room cancellation         |
//! +-------------------------------------------------------------+
//! ```
//!
//! ## API Endpoints
//!
//! ### Consultations
//! - `POST /consultations` - Create a consultation and its provider room
//! - `GET /consultations/{id}` - Consultation, presence and caller join URL
//! - `POST /consultations/{id}/join` - Enter the waiting room
//! - `POST /consultations/{id}/leave` - Leave (never ends the consultation)
//! - `POST /consultations/{id}/start` - Start once doctor and patient are connected
//! - `POST /consultations/{id}/end` - End (doctor or admin)
//! - `POST /consultations/{id}/cancel` - Cancel (doctor or admin)
//!
//! ### Messages & Issues
//! - `GET|POST /consultations/{id}/messages` - Chat history / send
//! - `GET|POST /consultations/{id}/issues` - Technical issues
//! - `POST /consultations/{id}/issues/{issue_id}/resolve` - Resolve an issue
//!
//! ### Realtime & Providers
//! - `GET /consultations/{id}/ws?token=&since_seq=` - WebSocket room
//! - `POST /webhooks/{provider}` - Provider callbacks (`zoom`, `livekit`, `jitsi`)
//!
//! ### System
//! - `GET /health` - Configured providers and store backend
//! - `POST /admin/sweep` - Cancel idle waiting rooms now
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shared_config::AppConfig;
//! use telemedicine_cell::{router::telemedicine_routes, TelemedicineState};
//!
//! let config = Arc::new(AppConfig::from_env());
//! let routes = telemedicine_routes(TelemedicineState::from_config(config));
//! ```

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;
pub mod state;

pub use error::{ProviderError, TelemedicineError};
pub use models::{
    Consultation, ConsultationEvent, ConsultationStatus, Frame, FrameType, Message,
    ParticipantRole, TechnicalIssue, VideoProvider, WebhookOutcome,
};
pub use services::{
    ConsultationService, ConsultationStore, InMemoryConsultationStore, ProviderRegistry,
    RealtimeGateway, VideoProviderAdapter, WaitingRoomSweeper, WebhookReconciler,
};
pub use state::TelemedicineState;
