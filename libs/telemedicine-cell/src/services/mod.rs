// libs/telemedicine-cell/src/services/mod.rs

pub mod booking;
pub mod consultation;
pub mod gateway;
pub mod lifecycle;
pub mod locks;
pub mod providers;
pub mod reconciler;
pub mod store;
pub mod sweeper;

pub use booking::{BookingDirectory, BookingRecord, SupabaseBookingDirectory};
pub use consultation::ConsultationService;
pub use gateway::{RealtimeGateway, RoomActivity, RoomConnection};
pub use lifecycle::{ConsultationLifecycle, TransitionKind};
pub use providers::{ProviderRegistry, RetryPolicy, VideoProviderAdapter};
pub use reconciler::WebhookReconciler;
pub use store::{ConsultationStore, InMemoryConsultationStore, SupabaseConsultationStore};
pub use sweeper::{SweeperHandle, WaitingRoomSweeper};
