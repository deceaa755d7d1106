// libs/telemedicine-cell/src/services/consultation.rs
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::{AppConfig, StoreBackend};
use shared_models::auth::User;

use crate::error::TelemedicineError;
use crate::models::{
    Consultation, ConsultationEvent, ConsultationSnapshot, ConsultationStatus,
    CreateConsultationRequest, Frame, IssueStatus, Message, MessageKind, MessagesQuery,
    ParsedEvent, ParticipantRole, Recording, RecordingRef, ReportIssueRequest, RoomHandle,
    RoomMetadata, SendMessageRequest, TechnicalIssue, TransitionOutcome, VideoProvider,
    WebhookEventKind, WebhookOutcome,
};
use crate::services::booking::{BookingDirectory, SupabaseBookingDirectory};
use crate::services::gateway::{ConnectionId, RealtimeGateway, RoomActivity, RoomConnection};
use crate::services::lifecycle::{ConsultationLifecycle, TransitionKind, TransitionStep};
use crate::services::locks::KeyedLocks;
use crate::services::providers::{ProviderRegistry, RetryPolicy, VideoProviderAdapter};
use crate::services::store::{
    ConsultationStore, InMemoryConsultationStore, SupabaseConsultationStore,
};

const MAX_MESSAGE_LENGTH: usize = 4000;
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 500;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A room provisioned for a booking whose consultation was not stored yet
struct PendingRoom {
    consultation_id: Uuid,
    provider: VideoProvider,
    handle: RoomHandle,
    provisioned_at: DateTime<Utc>,
}

/// Orchestrates consultations: the only writer of consultation status.
/// Every state change for a consultation happens under its entry in `locks`.
pub struct ConsultationService {
    me: Weak<ConsultationService>,
    store: Arc<dyn ConsultationStore>,
    bookings: Arc<dyn BookingDirectory>,
    providers: ProviderRegistry,
    gateway: Arc<RealtimeGateway>,
    locks: KeyedLocks,
    booking_locks: KeyedLocks,
    pending_rooms: Mutex<HashMap<Uuid, PendingRoom>>,
    retry: RetryPolicy,
    events: broadcast::Sender<ConsultationEvent>,
    grace_period: Duration,
    waiting_room_timeout: chrono::Duration,
}

impl ConsultationService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ConsultationStore>,
        bookings: Arc<dyn BookingDirectory>,
        providers: ProviderRegistry,
    ) -> Arc<Self> {
        let settings = &config.telemedicine;
        let gateway = Arc::new(RealtimeGateway::new(
            store.clone(),
            settings.message_backlog_size,
            settings.outbound_buffer_size,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            bookings,
            providers,
            gateway,
            locks: KeyedLocks::new(),
            booking_locks: KeyedLocks::new(),
            pending_rooms: Mutex::new(HashMap::new()),
            retry: RetryPolicy::from_settings(settings),
            events,
            grace_period: Duration::from_secs(settings.room_grace_period_secs),
            waiting_room_timeout: chrono::Duration::seconds(settings.waiting_room_timeout_secs as i64),
        })
    }

    /// Production wiring: store backend from settings, bookings and providers from config
    pub fn from_config(config: &AppConfig) -> Arc<Self> {
        let store: Arc<dyn ConsultationStore> = match config.telemedicine.store_backend {
            StoreBackend::Memory => Arc::new(InMemoryConsultationStore::new()),
            StoreBackend::Supabase => Arc::new(SupabaseConsultationStore::new(config)),
        };
        info!("Consultation store backend: {:?}", config.telemedicine.store_backend);

        Self::new(
            config,
            store,
            Arc::new(SupabaseBookingDirectory::new(config)),
            ProviderRegistry::from_config(config),
        )
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn gateway(&self) -> &Arc<RealtimeGateway> {
        &self.gateway
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsultationEvent> {
        self.events.subscribe()
    }

    // ==============================================================================
    // CREATION
    // ==============================================================================

    /// Create a consultation and its provider room. Either both exist
    /// afterwards or neither does.
    #[instrument(skip(self, request, user, auth_token), fields(provider = %request.provider))]
    pub async fn create(
        &self,
        request: CreateConsultationRequest,
        user: &User,
        auth_token: Option<&str>,
    ) -> Result<Consultation, TelemedicineError> {
        let Some(booking_id) = request.booking_id else {
            let doctor_id = request
                .doctor_id
                .ok_or_else(|| TelemedicineError::invalid_participants("doctor_id is required"))?;
            let patient_id = request
                .patient_id
                .ok_or_else(|| TelemedicineError::invalid_participants("patient_id is required"))?;
            let scheduled_time = request.scheduled_time.unwrap_or_else(Utc::now);

            return self
                .create_consultation(None, doctor_id, patient_id, scheduled_time, &request, user)
                .await;
        };

        let _booking_guard = self.booking_locks.lock(booking_id).await;

        let booking = self.bookings.get_booking(booking_id, auth_token).await?;
        let mismatched = request.doctor_id.map_or(false, |id| id != booking.doctor_id)
            || request.patient_id.map_or(false, |id| id != booking.patient_id);
        if mismatched {
            return Err(TelemedicineError::invalid_participants(
                "participants do not match the booking",
            ));
        }

        if let Some(active) = self.store.find_active_by_booking(booking_id).await? {
            warn!("Booking {} already has active consultation {}", booking_id, active.id);
            return Err(TelemedicineError::ActiveConsultationExists {
                booking_id,
                consultation_id: active.id,
            });
        }

        let scheduled_time = request.scheduled_time.unwrap_or(booking.scheduled_time);
        self.create_consultation(
            Some(booking_id),
            booking.doctor_id,
            booking.patient_id,
            scheduled_time,
            &request,
            user,
        )
        .await
    }

    /// Entry point for the booking service
    pub async fn create_from_booking(
        &self,
        booking_id: Uuid,
        provider: VideoProvider,
        recording_enabled: bool,
        user: &User,
        auth_token: Option<&str>,
    ) -> Result<Consultation, TelemedicineError> {
        let request = CreateConsultationRequest {
            booking_id: Some(booking_id),
            doctor_id: None,
            patient_id: None,
            provider,
            scheduled_time: None,
            observers: Vec::new(),
            recording_enabled,
        };
        self.create(request, user, auth_token).await
    }

    async fn create_consultation(
        &self,
        booking_id: Option<Uuid>,
        doctor_id: Uuid,
        patient_id: Uuid,
        scheduled_time: DateTime<Utc>,
        request: &CreateConsultationRequest,
        user: &User,
    ) -> Result<Consultation, TelemedicineError> {
        if doctor_id.is_nil() || patient_id.is_nil() {
            return Err(TelemedicineError::invalid_participants("doctor and patient are required"));
        }
        if doctor_id == patient_id {
            return Err(TelemedicineError::invalid_participants(
                "doctor and patient must be different people",
            ));
        }

        let caller = caller_id(user)?;
        if !user.is_admin() && caller != doctor_id && caller != patient_id {
            return Err(TelemedicineError::Unauthorized);
        }

        let mut observers: Vec<Uuid> = request
            .observers
            .iter()
            .copied()
            .filter(|id| *id != doctor_id && *id != patient_id && !id.is_nil())
            .collect();
        observers.sort();
        observers.dedup();

        let provider = request.provider;
        let adapter = self.providers.get(provider)?;
        let metadata = RoomMetadata {
            doctor_id,
            patient_id,
            scheduled_time,
            recording_enabled: request.recording_enabled,
            topic: "Telemedicine consultation".to_string(),
        };

        let pending = booking_id.and_then(|key| self.take_pending_room(key, provider));
        let (consultation_id, handle) = match pending {
            Some(pending) => {
                info!(
                    "Reusing room {} provisioned for booking consultation {}",
                    pending.handle.provider_room_id, pending.consultation_id
                );
                (pending.consultation_id, pending.handle)
            }
            None => {
                let consultation_id = Uuid::new_v4();
                let handle = self.provision_room(&adapter, consultation_id, &metadata).await?;
                (consultation_id, handle)
            }
        };

        let now = Utc::now();
        let consultation = Consultation {
            id: consultation_id,
            booking_id,
            doctor_id,
            patient_id,
            observers,
            provider,
            provider_room_id: handle.provider_room_id.clone(),
            doctor_join_url: handle.doctor_join_url.clone(),
            patient_join_url: handle.patient_join_url.clone(),
            status: ConsultationStatus::Scheduled,
            scheduled_time,
            actual_start_time: None,
            actual_end_time: None,
            terminated_at: None,
            status_reason: None,
            recording_enabled: request.recording_enabled,
            recording: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert_consultation(&consultation).await {
            error!("Failed to store consultation {}: {}", consultation_id, e);
            match booking_id {
                // kept for the booking's next attempt
                Some(key) => self.remember_pending_room(
                    key,
                    PendingRoom {
                        consultation_id,
                        provider,
                        handle,
                        provisioned_at: now,
                    },
                ),
                None => self.spawn_room_cleanup(adapter, handle.provider_room_id),
            }
            return Err(e);
        }

        info!(
            "Created consultation {} ({} room {})",
            consultation.id, provider, consultation.provider_room_id
        );

        self.publish_event(ConsultationEvent::MeetingReady {
            consultation_id: consultation.id,
            booking_id,
            doctor_id,
            patient_id,
            provider,
            doctor_join_url: consultation.doctor_join_url.clone(),
            patient_join_url: consultation.patient_join_url.clone(),
            scheduled_time,
        });

        Ok(consultation)
    }

    async fn provision_room(
        &self,
        adapter: &Arc<dyn VideoProviderAdapter>,
        consultation_id: Uuid,
        metadata: &RoomMetadata,
    ) -> Result<RoomHandle, TelemedicineError> {
        let provider = adapter.provider();
        self.retry
            .run("create_room", || {
                let adapter = adapter.clone();
                let metadata = metadata.clone();
                async move { adapter.create_room(consultation_id, &metadata).await }
            })
            .await
            .map_err(|source| {
                error!("Failed to create {} room for {}: {}", provider, consultation_id, source);
                TelemedicineError::ProviderUnavailable { provider, source }
            })
    }

    fn take_pending_room(&self, booking_id: Uuid, provider: VideoProvider) -> Option<PendingRoom> {
        let mut pending = self.pending_rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match pending.remove(&booking_id) {
            Some(room) if room.provider == provider => Some(room),
            Some(room) => {
                self.spawn_room_cleanup_for(room.provider, room.handle.provider_room_id);
                None
            }
            None => None,
        }
    }

    fn remember_pending_room(&self, booking_id: Uuid, room: PendingRoom) {
        let mut pending = self.pending_rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.insert(booking_id, room);
    }

    /// End rooms whose booking was not retried within the waiting-room timeout
    fn release_stale_pending_rooms(&self, now: DateTime<Utc>) -> usize {
        let stale: Vec<(Uuid, PendingRoom)> = {
            let mut pending = self.pending_rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let expired: Vec<Uuid> = pending
                .iter()
                .filter(|(_, room)| now - room.provisioned_at > self.waiting_room_timeout)
                .map(|(booking_id, _)| *booking_id)
                .collect();
            expired
                .into_iter()
                .filter_map(|booking_id| pending.remove(&booking_id).map(|room| (booking_id, room)))
                .collect()
        };

        for (booking_id, room) in &stale {
            warn!(
                "Booking {} never retried, releasing {} room {}",
                booking_id, room.provider, room.handle.provider_room_id
            );
            self.spawn_room_cleanup_for(room.provider, room.handle.provider_room_id.clone());
        }
        stale.len()
    }

    // ==============================================================================
    // STATE MACHINE COMMANDS
    // ==============================================================================

    async fn load(&self, consultation_id: Uuid) -> Result<Consultation, TelemedicineError> {
        self.store
            .get_consultation(consultation_id)
            .await?
            .ok_or(TelemedicineError::ConsultationNotFound)
    }

    /// Apply one command to a consultation whose lock the caller holds
    async fn transition_locked(
        &self,
        consultation: Consultation,
        kind: TransitionKind,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, TelemedicineError> {
        self.transition_locked_at(consultation, kind, reason, Utc::now()).await
    }

    /// As `transition_locked`, with start/end times taken from when the
    /// provider says the change happened
    async fn transition_locked_at(
        &self,
        consultation: Consultation,
        kind: TransitionKind,
        reason: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, TelemedicineError> {
        let previous = consultation.status;
        let mut updated = consultation.clone();

        let step = ConsultationLifecycle::apply(&mut updated, kind, reason, occurred_at, Utc::now())?;
        if step == TransitionStep::NoOp {
            return Ok(TransitionOutcome {
                consultation,
                previous,
                changed: false,
            });
        }

        self.store.update_consultation(&updated).await?;
        info!("Consultation {}: {} -> {}", updated.id, previous, updated.status);

        self.after_transition(&updated, previous).await;

        Ok(TransitionOutcome {
            consultation: updated,
            previous,
            changed: true,
        })
    }

    async fn after_transition(&self, consultation: &Consultation, previous: ConsultationStatus) {
        let id = consultation.id;

        self.publish_event(ConsultationEvent::StatusChanged {
            consultation_id: id,
            from: previous,
            to: consultation.status,
            reason: consultation.status_reason.clone(),
            at: consultation.updated_at,
        });

        self.gateway
            .broadcast_status(
                id,
                Frame::status(
                    id,
                    consultation.status,
                    Some(previous),
                    consultation.status_reason.as_deref(),
                ),
            )
            .await;

        if !consultation.is_terminal() {
            return;
        }

        let notice = match consultation.status_reason.as_deref() {
            Some(reason) => format!("Consultation {}: {}", consultation.status, reason),
            None => format!("Consultation {}", consultation.status),
        };
        if let Err(e) = self
            .gateway
            .publish_message(id, None, None, MessageKind::System, notice)
            .await
        {
            warn!("Failed to post closing message for {}: {}", id, e);
        }
        self.gateway.schedule_close(id, self.grace_period);

        match self.providers.get(consultation.provider) {
            Ok(adapter) => {
                if consultation.status == ConsultationStatus::Failed && consultation.recording_enabled {
                    self.spawn_recording_recovery(adapter.clone(), id, consultation.provider_room_id.clone());
                }
                self.spawn_room_cleanup(adapter, consultation.provider_room_id.clone());
            }
            Err(e) => warn!("Skipping provider cleanup for {}: {}", id, e),
        }
    }

    #[instrument(skip(self, user))]
    pub async fn join(&self, consultation_id: Uuid, user: &User) -> Result<TransitionOutcome, TelemedicineError> {
        let caller = caller_id(user)?;
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        participant_role(&consultation, caller)?;

        self.transition_locked(consultation, TransitionKind::JoinWaiting, None).await
    }

    /// Client-initiated start: both doctor and patient must hold a live connection
    #[instrument(skip(self, user))]
    pub async fn start(&self, consultation_id: Uuid, user: &User) -> Result<TransitionOutcome, TelemedicineError> {
        let caller = caller_id(user)?;
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;

        match participant_role(&consultation, caller)? {
            ParticipantRole::Doctor | ParticipantRole::Patient => {}
            ParticipantRole::Observer => return Err(TelemedicineError::Unauthorized),
        }

        if let TransitionStep::Move(_) = ConsultationLifecycle::resolve(consultation.status, TransitionKind::Start)? {
            let presence = self.gateway.presence(consultation_id).await;
            if !(presence.doctor_connected && presence.patient_connected) {
                return Err(TelemedicineError::ParticipantsNotPresent);
            }
        }

        self.transition_locked(consultation, TransitionKind::Start, None).await
    }

    #[instrument(skip(self, user))]
    pub async fn end(
        &self,
        consultation_id: Uuid,
        user: &User,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, TelemedicineError> {
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        require_doctor_or_admin(&consultation, user)?;

        let reason = reason.or_else(|| Some("ended by doctor".to_string()));
        self.transition_locked(consultation, TransitionKind::End, reason).await
    }

    #[instrument(skip(self, user))]
    pub async fn cancel(
        &self,
        consultation_id: Uuid,
        user: &User,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, TelemedicineError> {
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        require_doctor_or_admin(&consultation, user)?;

        self.transition_locked(consultation, TransitionKind::Cancel, reason).await
    }

    /// Unrecoverable provider condition
    #[instrument(skip(self))]
    pub async fn fail(&self, consultation_id: Uuid, reason: String) -> Result<TransitionOutcome, TelemedicineError> {
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;

        error!("Failing consultation {}: {}", consultation_id, reason);
        self.transition_locked(consultation, TransitionKind::Fail, Some(reason)).await
    }

    /// Attach a provider recording; allowed in any status
    pub async fn attach_recording(
        &self,
        consultation_id: Uuid,
        recording: RecordingRef,
    ) -> Result<Consultation, TelemedicineError> {
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        self.attach_recording_locked(consultation, recording).await
    }

    async fn attach_recording_locked(
        &self,
        mut consultation: Consultation,
        recording: RecordingRef,
    ) -> Result<Consultation, TelemedicineError> {
        let now = Utc::now();
        consultation.recording = Some(recording.clone());
        consultation.updated_at = now;
        self.store.update_consultation(&consultation).await?;

        self.store
            .save_recording(&Recording {
                id: Uuid::new_v4(),
                consultation_id: consultation.id,
                provider: consultation.provider,
                provider_room_id: consultation.provider_room_id.clone(),
                reference: recording.clone(),
                created_at: now,
            })
            .await?;

        info!(
            "Recording {} attached to consultation {}",
            recording.provider_recording_id, consultation.id
        );
        self.publish_event(ConsultationEvent::RecordingAvailable {
            consultation_id: consultation.id,
            recording,
        });

        Ok(consultation)
    }

    // ==============================================================================
    // WEBHOOK APPLICATION
    // ==============================================================================

    /// Apply a verified provider event at most once per (consultation, event id).
    /// `UnknownRoom` is returned when no consultation owns the room.
    #[instrument(skip(self, event), fields(event_id = %event.event_id, kind = event.kind.name()))]
    pub async fn apply_webhook_event(
        &self,
        provider: VideoProvider,
        event: ParsedEvent,
    ) -> Result<WebhookOutcome, TelemedicineError> {
        // may carry no room at all
        if let WebhookEventKind::Unknown(name) = &event.kind {
            return Ok(ignore_unknown_event(provider, name));
        }

        let found = self
            .store
            .find_by_room(provider, &event.provider_room_id)
            .await?
            .ok_or_else(|| TelemedicineError::UnknownRoom {
                provider,
                provider_room_id: event.provider_room_id.clone(),
            })?;

        let _guard = self.locks.lock(found.id).await;
        let consultation = self.load(found.id).await?;
        let id = consultation.id;

        if self.store.is_event_processed(id, provider, &event.event_id).await? {
            info!("Duplicate {} event {} for {}", provider, event.event_id, id);
            return Ok(WebhookOutcome::Duplicate {
                consultation_id: id,
                event_id: event.event_id,
            });
        }

        let at = event.occurred_at;
        let result = match event.kind {
            WebhookEventKind::MeetingStarted => {
                let consultation = if consultation.status == ConsultationStatus::Scheduled {
                    self.transition_locked_at(consultation, TransitionKind::JoinWaiting, None, at)
                        .await?
                        .consultation
                } else {
                    consultation
                };
                self.transition_locked_at(consultation, TransitionKind::Start, None, at).await
            }
            WebhookEventKind::MeetingEnded => {
                self.transition_locked_at(
                    consultation,
                    TransitionKind::End,
                    Some("meeting ended by provider".to_string()),
                    at,
                )
                .await
            }
            WebhookEventKind::RoomDeleted => {
                error!("{} room {} deleted externally", provider, event.provider_room_id);
                self.transition_locked_at(
                    consultation,
                    TransitionKind::Fail,
                    Some("room deleted by provider".to_string()),
                    at,
                )
                .await
            }
            WebhookEventKind::RecordingCompleted { recording } => {
                let recording = match recording {
                    Some(recording) => Some(recording),
                    None => self.fetch_recording(&consultation).await,
                };
                let Some(recording) = recording else {
                    // not recorded as processed: a redelivery may find it
                    warn!("Recording for {} not available yet", id);
                    return Ok(WebhookOutcome::Ignored {
                        reason: "recording not available".to_string(),
                    });
                };
                self.attach_recording_locked(consultation, recording).await?;
                self.store.mark_event_processed(id, provider, &event.event_id).await?;
                return Ok(WebhookOutcome::RecordingAttached { consultation_id: id });
            }
            WebhookEventKind::Unknown(name) => return Ok(ignore_unknown_event(provider, &name)),
        };

        let outcome = match result {
            Ok(TransitionOutcome {
                consultation,
                changed: true,
                ..
            }) => WebhookOutcome::Applied {
                consultation_id: id,
                status: consultation.status,
            },
            Ok(TransitionOutcome { consultation, .. }) => WebhookOutcome::NoOp {
                consultation_id: id,
                status: consultation.status,
            },
            Err(err @ TelemedicineError::InvalidTransition { .. }) => {
                warn!("Webhook {} rejected for {}: {}", event.event_id, id, err);
                WebhookOutcome::Rejected {
                    consultation_id: id,
                    reason: err.to_string(),
                }
            }
            Err(err) => return Err(err),
        };

        self.store.mark_event_processed(id, provider, &event.event_id).await?;
        Ok(outcome)
    }

    async fn fetch_recording(&self, consultation: &Consultation) -> Option<RecordingRef> {
        let adapter = match self.providers.get(consultation.provider) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Cannot fetch recording for {}: {}", consultation.id, e);
                return None;
            }
        };
        let room = consultation.provider_room_id.clone();

        match self
            .retry
            .run("fetch_recording", || {
                let adapter = adapter.clone();
                let room = room.clone();
                async move { adapter.fetch_recording(&room).await }
            })
            .await
        {
            Ok(recording) => recording,
            Err(e) => {
                warn!("Failed to fetch recording for {}: {}", consultation.id, e);
                None
            }
        }
    }

    // ==============================================================================
    // REALTIME ROOM
    // ==============================================================================

    /// Open a realtime connection; the first arrival moves a scheduled consultation to waiting
    #[instrument(skip(self, user))]
    pub async fn connect(
        &self,
        consultation_id: Uuid,
        user: &User,
        since_seq: Option<u64>,
    ) -> Result<(Consultation, RoomConnection), TelemedicineError> {
        let caller = caller_id(user)?;
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        let role = participant_role(&consultation, caller)?;

        if consultation.is_terminal() {
            return Err(TelemedicineError::RoomClosed);
        }

        let connection = self.gateway.connect(&consultation, caller, role, since_seq).await?;
        let outcome = self
            .transition_locked(consultation, TransitionKind::JoinWaiting, None)
            .await?;

        Ok((outcome.consultation, connection))
    }

    /// Explicit leave; never ends the consultation
    #[instrument(skip(self, user))]
    pub async fn leave(&self, consultation_id: Uuid, user: &User) -> Result<bool, TelemedicineError> {
        let caller = caller_id(user)?;
        let _guard = self.locks.lock(consultation_id).await;
        let consultation = self.load(consultation_id).await?;
        participant_role(&consultation, caller)?;

        self.gateway.disconnect(consultation_id, caller).await
    }

    /// Transport loss of one realtime connection
    pub async fn drop_connection(&self, consultation_id: Uuid, connection_id: ConnectionId) {
        let _guard = self.locks.lock(consultation_id).await;
        self.gateway.drop_connection(consultation_id, connection_id).await;
    }

    pub async fn send_message(
        &self,
        consultation_id: Uuid,
        user: &User,
        request: SendMessageRequest,
    ) -> Result<Message, TelemedicineError> {
        let caller = caller_id(user)?;
        let consultation = self.load(consultation_id).await?;
        let role = participant_role(&consultation, caller)?;

        let body = request.body.trim();
        if body.is_empty() {
            return Err(TelemedicineError::validation("message body is empty"));
        }
        if body.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(TelemedicineError::validation(format!(
                "message body exceeds {} characters",
                MAX_MESSAGE_LENGTH
            )));
        }

        let grace = chrono::Duration::from_std(self.grace_period).unwrap_or_else(|_| chrono::Duration::zero());
        if consultation.room_is_closed(grace, Utc::now()) {
            return Err(TelemedicineError::RoomClosed);
        }

        let kind = if request.file_reference {
            MessageKind::FileReference
        } else {
            MessageKind::Chat
        };

        let message = self
            .gateway
            .publish_message(consultation_id, Some(caller), Some(role), kind, body.to_string())
            .await?;
        debug!("Message {} in {} from {}", message.seq, consultation_id, caller);
        Ok(message)
    }

    // ==============================================================================
    // TECHNICAL ISSUES
    // ==============================================================================

    #[instrument(skip(self, user, request))]
    pub async fn report_issue(
        &self,
        consultation_id: Uuid,
        user: &User,
        request: ReportIssueRequest,
    ) -> Result<TechnicalIssue, TelemedicineError> {
        let caller = caller_id(user)?;
        let consultation = self.load(consultation_id).await?;
        let role = participant_role(&consultation, caller)?;

        if consultation.is_terminal() {
            return Err(TelemedicineError::RoomClosed);
        }
        let description = request.description.trim();
        if description.is_empty() {
            return Err(TelemedicineError::validation("issue description is empty"));
        }

        let issue = TechnicalIssue {
            id: Uuid::new_v4(),
            consultation_id,
            reported_by: caller,
            reporter_role: role,
            severity: request.severity,
            description: description.to_string(),
            status: IssueStatus::Open,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };
        self.store.append_issue(&issue).await?;

        warn!(
            "Technical issue ({:?}) reported in {} by {:?}: {}",
            issue.severity, consultation_id, role, issue.description
        );
        self.gateway.notify_doctors(consultation_id, Frame::issue(&issue)).await;

        Ok(issue)
    }

    pub async fn resolve_issue(
        &self,
        consultation_id: Uuid,
        issue_id: Uuid,
        user: &User,
    ) -> Result<TechnicalIssue, TelemedicineError> {
        let consultation = self.load(consultation_id).await?;
        require_doctor_or_admin(&consultation, user)?;

        let mut issue = self
            .store
            .list_issues(consultation_id)
            .await?
            .into_iter()
            .find(|issue| issue.id == issue_id)
            .ok_or_else(|| TelemedicineError::validation(format!("issue {} not found", issue_id)))?;

        if issue.status == IssueStatus::Resolved {
            return Ok(issue);
        }

        issue.status = IssueStatus::Resolved;
        issue.resolved_at = Some(Utc::now());
        issue.resolved_by = user.user_id();
        self.store.update_issue(&issue).await?;

        info!("Issue {} in {} resolved", issue_id, consultation_id);
        Ok(issue)
    }

    // ==============================================================================
    // READS
    // ==============================================================================

    pub async fn snapshot(&self, consultation_id: Uuid, user: &User) -> Result<ConsultationSnapshot, TelemedicineError> {
        let consultation = self.load(consultation_id).await?;
        require_viewer(&consultation, user)?;

        Ok(ConsultationSnapshot {
            presence: self.gateway.presence(consultation_id).await,
            participant_history: self.store.participant_history(consultation_id).await?,
            last_seq: self.gateway.last_seq(consultation_id).await?,
            consultation,
        })
    }

    pub async fn messages(
        &self,
        consultation_id: Uuid,
        user: &User,
        query: MessagesQuery,
    ) -> Result<Vec<Message>, TelemedicineError> {
        let consultation = self.load(consultation_id).await?;
        require_viewer(&consultation, user)?;

        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.store
            .messages_after(consultation_id, query.since_seq.unwrap_or(0), limit)
            .await
    }

    pub async fn issues(&self, consultation_id: Uuid, user: &User) -> Result<Vec<TechnicalIssue>, TelemedicineError> {
        let consultation = self.load(consultation_id).await?;
        require_viewer(&consultation, user)?;

        self.store.list_issues(consultation_id).await
    }

    // ==============================================================================
    // BACKGROUND MAINTENANCE
    // ==============================================================================

    /// Cancel waiting consultations nobody has been connected to for longer
    /// than the waiting-room timeout, and end rooms left over from failed
    /// booking creations. Returns the cancelled ids.
    pub async fn sweep_idle_waiting(&self) -> Result<Vec<Uuid>, TelemedicineError> {
        let now = Utc::now();
        let mut cancelled = Vec::new();

        for candidate in self.store.list_by_status(ConsultationStatus::Waiting).await? {
            if !self.idle_too_long(&candidate, now).await {
                continue;
            }

            let _guard = self.locks.lock(candidate.id).await;
            let consultation = match self.load(candidate.id).await {
                Ok(consultation) => consultation,
                Err(e) => {
                    error!("Failed to reload idle consultation {}: {}", candidate.id, e);
                    continue;
                }
            };
            if consultation.status != ConsultationStatus::Waiting || !self.idle_too_long(&consultation, now).await {
                continue;
            }

            info!("Waiting room for {} idle past timeout, cancelling", consultation.id);
            match self
                .transition_locked(
                    consultation,
                    TransitionKind::Cancel,
                    Some("waiting room timed out".to_string()),
                )
                .await
            {
                Ok(outcome) => cancelled.push(outcome.consultation.id),
                Err(e) => error!("Failed to cancel idle consultation {}: {}", candidate.id, e),
            }
        }

        let released = self.release_stale_pending_rooms(now);
        let pruned = self.locks.prune() + self.booking_locks.prune();
        debug!(
            "Sweep cancelled {} consultations, released {} pending rooms, pruned {} locks ({} remain)",
            cancelled.len(),
            released,
            pruned,
            self.locks.len() + self.booking_locks.len()
        );
        Ok(cancelled)
    }

    async fn idle_too_long(&self, consultation: &Consultation, now: DateTime<Utc>) -> bool {
        let idle_since = match self.gateway.activity(consultation.id).await {
            RoomActivity::Connected(_) => return false,
            RoomActivity::IdleSince(at) => at.max(consultation.updated_at),
            RoomActivity::NotLoaded => consultation.updated_at,
        };
        now - idle_since > self.waiting_room_timeout
    }

    // ==============================================================================
    // PROVIDER SIDE EFFECTS
    // ==============================================================================

    fn spawn_room_cleanup_for(&self, provider: VideoProvider, provider_room_id: String) {
        match self.providers.get(provider) {
            Ok(adapter) => self.spawn_room_cleanup(adapter, provider_room_id),
            Err(e) => warn!("Cannot clean up room {}: {}", provider_room_id, e),
        }
    }

    /// Provider-side teardown off the request path; failures are logged only
    fn spawn_room_cleanup(&self, adapter: Arc<dyn VideoProviderAdapter>, provider_room_id: String) {
        let retry = self.retry.clone();
        tokio::spawn(async move {
            let result = retry
                .run("end_room", || {
                    let adapter = adapter.clone();
                    let room = provider_room_id.clone();
                    async move { adapter.end_room(&room).await }
                })
                .await;

            match result {
                Ok(()) => debug!("{} room {} cleaned up", adapter.provider(), provider_room_id),
                Err(e) => error!("Failed to end {} room {}: {}", adapter.provider(), provider_room_id, e),
            }
        });
    }

    /// One best-effort attempt to keep a recording of a failed consultation
    fn spawn_recording_recovery(
        &self,
        adapter: Arc<dyn VideoProviderAdapter>,
        consultation_id: Uuid,
        provider_room_id: String,
    ) {
        let Some(service) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match adapter.fetch_recording(&provider_room_id).await {
                Ok(Some(recording)) => {
                    if let Err(e) = service.attach_recording(consultation_id, recording).await {
                        warn!("Failed to attach recording for failed consultation {}: {}", consultation_id, e);
                    }
                }
                Ok(None) => warn!("No recording recoverable for failed consultation {}", consultation_id),
                Err(e) => warn!("Recording recovery for {} failed: {}", consultation_id, e),
            }
        });
    }

    fn publish_event(&self, event: ConsultationEvent) {
        if self.events.send(event).is_err() {
            debug!("No consultation event subscribers");
        }
    }
}

fn ignore_unknown_event(provider: VideoProvider, name: &str) -> WebhookOutcome {
    warn!("Ignoring unknown {} event {}", provider, name);
    WebhookOutcome::Ignored {
        reason: format!("unknown event {}", name),
    }
}

// ==============================================================================
// AUTHORIZATION
// ==============================================================================

fn caller_id(user: &User) -> Result<Uuid, TelemedicineError> {
    user.user_id().ok_or(TelemedicineError::Unauthorized)
}

fn participant_role(consultation: &Consultation, caller: Uuid) -> Result<ParticipantRole, TelemedicineError> {
    consultation.role_of(caller).ok_or(TelemedicineError::Unauthorized)
}

fn require_doctor_or_admin(consultation: &Consultation, user: &User) -> Result<(), TelemedicineError> {
    if user.is_admin() || user.user_id() == Some(consultation.doctor_id) {
        Ok(())
    } else {
        Err(TelemedicineError::Unauthorized)
    }
}

fn require_viewer(consultation: &Consultation, user: &User) -> Result<(), TelemedicineError> {
    let is_participant = user
        .user_id()
        .map_or(false, |id| consultation.role_of(id).is_some());
    if user.is_admin() || is_participant {
        Ok(())
    } else {
        Err(TelemedicineError::Unauthorized)
    }
}
