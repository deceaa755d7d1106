#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use shared_config::{AppConfig, TelemedicineSettings};
use shared_utils::test_utils::{TestConfig, TestUser};
use telemedicine_cell::error::{ProviderError, TelemedicineError};
use telemedicine_cell::models::{
    Consultation, ConsultationStatus, CreateConsultationRequest, Frame, Message, ParsedEvent,
    ParticipantEvent, Recording, RecordingRef, RoomHandle, RoomMetadata, TechnicalIssue,
    VideoProvider, WebhookEventKind,
};
use telemedicine_cell::services::booking::{BookingDirectory, BookingRecord};
use telemedicine_cell::services::{
    ConsultationService, ConsultationStore, InMemoryConsultationStore, ProviderRegistry,
    VideoProviderAdapter,
};
use telemedicine_cell::state::TelemedicineState;

pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";
pub const FAKE_SIGNATURE: &str = "valid";

// ==============================================================================
// FAKE PROVIDER
// ==============================================================================

/// Scriptable adapter registered in place of a real provider
pub struct FakeProvider {
    provider: VideoProvider,
    create_failures: Mutex<VecDeque<ProviderError>>,
    recording: Mutex<Option<RecordingRef>>,
    ended: Mutex<Vec<String>>,
    pub create_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(provider: VideoProvider) -> Self {
        Self {
            provider,
            create_failures: Mutex::new(VecDeque::new()),
            recording: Mutex::new(None),
            ended: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_create(&self, error: ProviderError) {
        self.create_failures.lock().unwrap().push_back(error);
    }

    pub fn set_recording(&self, recording: Option<RecordingRef>) {
        *self.recording.lock().unwrap() = recording;
    }

    pub fn ended_rooms(&self) -> Vec<String> {
        self.ended.lock().unwrap().clone()
    }

    pub fn create_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn room_for(consultation_id: Uuid) -> String {
        format!("fake-{}", consultation_id)
    }
}

#[async_trait]
impl VideoProviderAdapter for FakeProvider {
    fn provider(&self) -> VideoProvider {
        self.provider
    }

    async fn create_room(
        &self,
        consultation_id: Uuid,
        _metadata: &RoomMetadata,
    ) -> Result<RoomHandle, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.create_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let room = Self::room_for(consultation_id);
        Ok(RoomHandle {
            doctor_join_url: format!("https://video.test/{}?host=1", room),
            patient_join_url: format!("https://video.test/{}", room),
            provider_room_id: room,
        })
    }

    async fn end_room(&self, provider_room_id: &str) -> Result<(), ProviderError> {
        self.ended.lock().unwrap().push(provider_room_id.to_string());
        Ok(())
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<ParsedEvent, ProviderError> {
        let signed = headers
            .get(FAKE_SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok())
            == Some(FAKE_SIGNATURE);
        if !signed {
            return Err(ProviderError::signature("bad fake signature"));
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::permanent(e.to_string()))?;
        let kind = match payload["event"].as_str().unwrap_or_default() {
            "started" => WebhookEventKind::MeetingStarted,
            "ended" => WebhookEventKind::MeetingEnded,
            "deleted" => WebhookEventKind::RoomDeleted,
            "recording" => WebhookEventKind::RecordingCompleted {
                recording: payload["recording_url"].as_str().map(|url| RecordingRef {
                    provider_recording_id: "rec-from-webhook".to_string(),
                    url: Some(url.to_string()),
                    duration_seconds: Some(600),
                }),
            },
            other => WebhookEventKind::Unknown(other.to_string()),
        };

        Ok(ParsedEvent {
            event_id: payload["id"].as_str().unwrap_or_default().to_string(),
            kind,
            provider_room_id: payload["room"].as_str().unwrap_or_default().to_string(),
            occurred_at: Utc::now(),
            raw: payload,
        })
    }

    async fn fetch_recording(&self, _provider_room_id: &str) -> Result<Option<RecordingRef>, ProviderError> {
        Ok(self.recording.lock().unwrap().clone())
    }
}

/// Headers and body of a fake provider webhook delivery
pub fn fake_webhook(event_id: &str, event: &str, room: &str) -> (HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    headers.insert(FAKE_SIGNATURE_HEADER, HeaderValue::from_static(FAKE_SIGNATURE));
    let body = json!({ "id": event_id, "event": event, "room": room });
    (headers, serde_json::to_vec(&body).unwrap())
}

pub fn fake_event(event_id: &str, kind: WebhookEventKind, room: &str) -> ParsedEvent {
    ParsedEvent {
        event_id: event_id.to_string(),
        kind,
        provider_room_id: room.to_string(),
        occurred_at: Utc::now(),
        raw: Value::Null,
    }
}

// ==============================================================================
// FLAKY STORE
// ==============================================================================

/// In-memory store that can be told to fail writes
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: InMemoryConsultationStore,
    failing_inserts: Arc<AtomicUsize>,
    failing_updates: Arc<AtomicUsize>,
    failing_gets: Arc<AtomicUsize>,
}

impl FlakyStore {
    pub fn fail_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn fail_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConsultationStore for FlakyStore {
    async fn insert_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        if Self::take_failure(&self.failing_inserts) {
            return Err(TelemedicineError::database("injected insert failure"));
        }
        self.inner.insert_consultation(consultation).await
    }

    async fn update_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        if Self::take_failure(&self.failing_updates) {
            return Err(TelemedicineError::database("injected update failure"));
        }
        self.inner.update_consultation(consultation).await
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        if Self::take_failure(&self.failing_gets) {
            return Err(TelemedicineError::database("injected read failure"));
        }
        self.inner.get_consultation(id).await
    }

    async fn find_by_room(
        &self,
        provider: VideoProvider,
        provider_room_id: &str,
    ) -> Result<Option<Consultation>, TelemedicineError> {
        self.inner.find_by_room(provider, provider_room_id).await
    }

    async fn find_active_by_booking(&self, booking_id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        self.inner.find_active_by_booking(booking_id).await
    }

    async fn list_by_status(&self, status: ConsultationStatus) -> Result<Vec<Consultation>, TelemedicineError> {
        self.inner.list_by_status(status).await
    }

    async fn append_message(&self, message: &Message) -> Result<(), TelemedicineError> {
        self.inner.append_message(message).await
    }

    async fn messages_after(
        &self,
        consultation_id: Uuid,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>, TelemedicineError> {
        self.inner.messages_after(consultation_id, since_seq, limit).await
    }

    async fn recent_messages(&self, consultation_id: Uuid, limit: usize) -> Result<Vec<Message>, TelemedicineError> {
        self.inner.recent_messages(consultation_id, limit).await
    }

    async fn last_message_seq(&self, consultation_id: Uuid) -> Result<u64, TelemedicineError> {
        self.inner.last_message_seq(consultation_id).await
    }

    async fn record_participant_event(&self, event: &ParticipantEvent) -> Result<(), TelemedicineError> {
        self.inner.record_participant_event(event).await
    }

    async fn participant_history(&self, consultation_id: Uuid) -> Result<Vec<ParticipantEvent>, TelemedicineError> {
        self.inner.participant_history(consultation_id).await
    }

    async fn append_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        self.inner.append_issue(issue).await
    }

    async fn update_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        self.inner.update_issue(issue).await
    }

    async fn list_issues(&self, consultation_id: Uuid) -> Result<Vec<TechnicalIssue>, TelemedicineError> {
        self.inner.list_issues(consultation_id).await
    }

    async fn save_recording(&self, recording: &Recording) -> Result<(), TelemedicineError> {
        self.inner.save_recording(recording).await
    }

    async fn is_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        self.inner.is_event_processed(consultation_id, provider, event_id).await
    }

    async fn mark_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        self.inner.mark_event_processed(consultation_id, provider, event_id).await
    }
}

// ==============================================================================
// FAKE BOOKINGS
// ==============================================================================

#[derive(Default)]
pub struct FakeBookings {
    bookings: Mutex<HashMap<Uuid, BookingRecord>>,
}

impl FakeBookings {
    pub fn add(&self, doctor_id: Uuid, patient_id: Uuid, status: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.bookings.lock().unwrap().insert(
            id,
            BookingRecord {
                id,
                doctor_id,
                patient_id,
                scheduled_time: Utc::now() + chrono::Duration::hours(1),
                status: status.to_string(),
            },
        );
        id
    }
}

#[async_trait]
impl BookingDirectory for FakeBookings {
    async fn get_booking(&self, booking_id: Uuid, _auth_token: Option<&str>) -> Result<BookingRecord, TelemedicineError> {
        let booking = self
            .bookings
            .lock()
            .unwrap()
            .get(&booking_id)
            .cloned()
            .ok_or(TelemedicineError::BookingNotFound)?;
        if booking.is_cancelled() {
            return Err(TelemedicineError::validation("booking is cancelled"));
        }
        Ok(booking)
    }
}

// ==============================================================================
// HARNESS
// ==============================================================================

pub struct Harness {
    pub config: AppConfig,
    pub service: Arc<ConsultationService>,
    pub store: FlakyStore,
    pub provider: Arc<FakeProvider>,
    pub bookings: Arc<FakeBookings>,
    pub doctor: TestUser,
    pub patient: TestUser,
    pub observer: TestUser,
    pub admin: TestUser,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    /// The fake provider stands in for Zoom
    pub fn with_settings(adjust: impl FnOnce(&mut TelemedicineSettings)) -> Self {
        let mut config = TestConfig::default().to_app_config();
        adjust(&mut config.telemedicine);

        let store = FlakyStore::default();
        let provider = Arc::new(FakeProvider::new(VideoProvider::Zoom));
        let bookings = Arc::new(FakeBookings::default());
        let registry = ProviderRegistry::new().with_adapter(provider.clone());

        let service = ConsultationService::new(&config, Arc::new(store.clone()), bookings.clone(), registry);

        Self {
            config,
            service,
            store,
            provider,
            bookings,
            doctor: TestUser::doctor("doctor@example.com"),
            patient: TestUser::patient("patient@example.com"),
            observer: TestUser::new("nurse@example.com", "nurse"),
            admin: TestUser::admin("admin@example.com"),
        }
    }

    pub fn state(&self) -> TelemedicineState {
        TelemedicineState::new(Arc::new(self.config.clone()), self.service.clone())
    }

    pub fn request(&self) -> CreateConsultationRequest {
        CreateConsultationRequest {
            booking_id: None,
            doctor_id: Some(self.doctor.id),
            patient_id: Some(self.patient.id),
            provider: VideoProvider::Zoom,
            scheduled_time: None,
            observers: vec![self.observer.id],
            recording_enabled: false,
        }
    }

    /// A fresh scheduled consultation created by the doctor
    pub async fn consultation(&self) -> Consultation {
        self.service
            .create(self.request(), &self.doctor.to_user(), None)
            .await
            .unwrap()
    }

    /// Doctor and patient connected, consultation in progress
    pub async fn in_progress(&self) -> (Consultation, mpsc::Receiver<Frame>, mpsc::Receiver<Frame>) {
        let consultation = self.consultation().await;
        let (_, doctor) = self
            .service
            .connect(consultation.id, &self.doctor.to_user(), None)
            .await
            .unwrap();
        let (_, patient) = self
            .service
            .connect(consultation.id, &self.patient.to_user(), None)
            .await
            .unwrap();
        let outcome = self.service.start(consultation.id, &self.doctor.to_user()).await.unwrap();
        assert_eq!(outcome.consultation.status, ConsultationStatus::InProgress);
        (outcome.consultation, doctor.frames, patient.frames)
    }

    pub async fn reload(&self, id: Uuid) -> Consultation {
        self.store.get_consultation(id).await.unwrap().unwrap()
    }
}

pub fn drain(frames: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Ok(frame) = frames.try_recv() {
        out.push(frame);
    }
    out
}

/// Wait until spawned side effects (room cleanup, closing rooms) have run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}
