// libs/telemedicine-cell/src/services/store.rs
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::TelemedicineError;
use crate::models::{
    Consultation, ConsultationStatus, Message, ParticipantEvent, Recording, TechnicalIssue,
    VideoProvider,
};

/// Durable system of record for consultations and their append-only logs.
/// In-memory room state is rebuilt from here after a restart.
#[async_trait]
pub trait ConsultationStore: Send + Sync {
    async fn insert_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError>;

    async fn update_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError>;

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, TelemedicineError>;

    async fn find_by_room(
        &self,
        provider: VideoProvider,
        provider_room_id: &str,
    ) -> Result<Option<Consultation>, TelemedicineError>;

    async fn find_active_by_booking(&self, booking_id: Uuid) -> Result<Option<Consultation>, TelemedicineError>;

    async fn list_by_status(&self, status: ConsultationStatus) -> Result<Vec<Consultation>, TelemedicineError>;

    async fn append_message(&self, message: &Message) -> Result<(), TelemedicineError>;

    /// Messages with `seq > since_seq`, oldest first, at most `limit`
    async fn messages_after(
        &self,
        consultation_id: Uuid,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>, TelemedicineError>;

    /// The newest `limit` messages, oldest first
    async fn recent_messages(&self, consultation_id: Uuid, limit: usize) -> Result<Vec<Message>, TelemedicineError>;

    async fn last_message_seq(&self, consultation_id: Uuid) -> Result<u64, TelemedicineError>;

    async fn record_participant_event(&self, event: &ParticipantEvent) -> Result<(), TelemedicineError>;

    async fn participant_history(&self, consultation_id: Uuid) -> Result<Vec<ParticipantEvent>, TelemedicineError>;

    async fn append_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError>;

    /// Only the resolution fields of an issue may change
    async fn update_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError>;

    async fn list_issues(&self, consultation_id: Uuid) -> Result<Vec<TechnicalIssue>, TelemedicineError>;

    async fn save_recording(&self, recording: &Recording) -> Result<(), TelemedicineError>;

    async fn is_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError>;

    /// Record a provider event id; returns false if it was already recorded
    async fn mark_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError>;
}

// ==============================================================================
// IN-MEMORY STORE
// ==============================================================================

#[derive(Default)]
struct MemoryTables {
    consultations: HashMap<Uuid, Consultation>,
    messages: HashMap<Uuid, Vec<Message>>,
    participants: HashMap<Uuid, Vec<ParticipantEvent>>,
    issues: HashMap<Uuid, Vec<TechnicalIssue>>,
    recordings: HashMap<Uuid, Vec<Recording>>,
    processed_events: HashSet<(Uuid, VideoProvider, String)>,
}

/// Process-local store used by default and in tests
#[derive(Default, Clone)]
pub struct InMemoryConsultationStore {
    tables: Arc<RwLock<MemoryTables>>,
}

impl InMemoryConsultationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn consultation_count(&self) -> usize {
        self.tables.read().await.consultations.len()
    }

    pub async fn recordings(&self, consultation_id: Uuid) -> Vec<Recording> {
        self.tables
            .read()
            .await
            .recordings
            .get(&consultation_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ConsultationStore for InMemoryConsultationStore {
    async fn insert_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        if tables.consultations.contains_key(&consultation.id) {
            return Err(TelemedicineError::database(format!(
                "consultation {} already exists",
                consultation.id
            )));
        }
        tables.consultations.insert(consultation.id, consultation.clone());
        Ok(())
    }

    async fn update_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        match tables.consultations.get_mut(&consultation.id) {
            Some(existing) => {
                *existing = consultation.clone();
                Ok(())
            }
            None => Err(TelemedicineError::ConsultationNotFound),
        }
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        Ok(self.tables.read().await.consultations.get(&id).cloned())
    }

    async fn find_by_room(
        &self,
        provider: VideoProvider,
        provider_room_id: &str,
    ) -> Result<Option<Consultation>, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .consultations
            .values()
            .find(|c| c.provider == provider && c.provider_room_id == provider_room_id)
            .cloned())
    }

    async fn find_active_by_booking(&self, booking_id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .consultations
            .values()
            .find(|c| c.booking_id == Some(booking_id) && !c.is_terminal())
            .cloned())
    }

    async fn list_by_status(&self, status: ConsultationStatus) -> Result<Vec<Consultation>, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .consultations
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }

    async fn append_message(&self, message: &Message) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        let messages = tables.messages.entry(message.consultation_id).or_default();
        // Concurrent appends may land out of seq order; keep the log sorted
        let position = messages.partition_point(|m| m.seq < message.seq);
        messages.insert(position, message.clone());
        Ok(())
    }

    async fn messages_after(
        &self,
        consultation_id: Uuid,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>, TelemedicineError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(&consultation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|m| m.seq > since_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn recent_messages(&self, consultation_id: Uuid, limit: usize) -> Result<Vec<Message>, TelemedicineError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(&consultation_id)
            .map(|messages| messages[messages.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }

    async fn last_message_seq(&self, consultation_id: Uuid) -> Result<u64, TelemedicineError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(&consultation_id)
            .and_then(|messages| messages.last())
            .map_or(0, |m| m.seq))
    }

    async fn record_participant_event(&self, event: &ParticipantEvent) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        tables
            .participants
            .entry(event.consultation_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn participant_history(&self, consultation_id: Uuid) -> Result<Vec<ParticipantEvent>, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .get(&consultation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        tables.issues.entry(issue.consultation_id).or_default().push(issue.clone());
        Ok(())
    }

    async fn update_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .issues
            .get_mut(&issue.consultation_id)
            .and_then(|issues| issues.iter_mut().find(|i| i.id == issue.id))
            .ok_or_else(|| TelemedicineError::validation(format!("issue {} not found", issue.id)))?;

        existing.status = issue.status;
        existing.resolved_at = issue.resolved_at;
        existing.resolved_by = issue.resolved_by;
        Ok(())
    }

    async fn list_issues(&self, consultation_id: Uuid) -> Result<Vec<TechnicalIssue>, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .issues
            .get(&consultation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_recording(&self, recording: &Recording) -> Result<(), TelemedicineError> {
        let mut tables = self.tables.write().await;
        tables
            .recordings
            .entry(recording.consultation_id)
            .or_default()
            .push(recording.clone());
        Ok(())
    }

    async fn is_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        Ok(self
            .tables
            .read()
            .await
            .processed_events
            .contains(&(consultation_id, provider, event_id.to_string())))
    }

    async fn mark_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        Ok(self
            .tables
            .write()
            .await
            .processed_events
            .insert((consultation_id, provider, event_id.to_string())))
    }
}

// ==============================================================================
// SUPABASE STORE
// ==============================================================================

/// PostgREST-backed store. Tables: consultations, consultation_messages,
/// consultation_participants, consultation_issues, consultation_recordings,
/// consultation_webhook_events (unique on consultation_id, provider, event_id).
pub struct SupabaseConsultationStore {
    supabase: SupabaseClient,
}

impl SupabaseConsultationStore {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
        }
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, TelemedicineError> {
        let rows: Vec<T> = self.supabase.request(Method::GET, path, None, None).await?;
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Vec<Value>, TelemedicineError> {
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                &format!("/rest/v1/{}", table),
                None,
                Some(row),
                &[("prefer", "return=representation")],
            )
            .await?;
        Ok(rows)
    }

    async fn patch(&self, path: &str, changes: Value) -> Result<Vec<Value>, TelemedicineError> {
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::PATCH,
                path,
                None,
                Some(changes),
                &[("prefer", "return=representation")],
            )
            .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ConsultationStore for SupabaseConsultationStore {
    async fn insert_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        self.insert("consultations", json!(consultation)).await?;
        debug!("Stored consultation {}", consultation.id);
        Ok(())
    }

    async fn update_consultation(&self, consultation: &Consultation) -> Result<(), TelemedicineError> {
        let rows = self
            .patch(
                &format!("/rest/v1/consultations?id=eq.{}", consultation.id),
                json!(consultation),
            )
            .await?;
        if rows.is_empty() {
            return Err(TelemedicineError::ConsultationNotFound);
        }
        Ok(())
    }

    async fn get_consultation(&self, id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        let rows: Vec<Consultation> = self
            .select(&format!("/rest/v1/consultations?id=eq.{}&select=*", id))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn find_by_room(
        &self,
        provider: VideoProvider,
        provider_room_id: &str,
    ) -> Result<Option<Consultation>, TelemedicineError> {
        let rows: Vec<Consultation> = self
            .select(&format!(
                "/rest/v1/consultations?provider=eq.{}&provider_room_id=eq.{}&select=*&limit=1",
                provider,
                urlencoding::encode(provider_room_id)
            ))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn find_active_by_booking(&self, booking_id: Uuid) -> Result<Option<Consultation>, TelemedicineError> {
        let rows: Vec<Consultation> = self
            .select(&format!(
                "/rest/v1/consultations?booking_id=eq.{}&status=not.in.(ended,cancelled,failed)&select=*&limit=1",
                booking_id
            ))
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn list_by_status(&self, status: ConsultationStatus) -> Result<Vec<Consultation>, TelemedicineError> {
        self.select(&format!("/rest/v1/consultations?status=eq.{}&select=*", status))
            .await
    }

    async fn append_message(&self, message: &Message) -> Result<(), TelemedicineError> {
        self.insert("consultation_messages", json!(message)).await?;
        Ok(())
    }

    async fn messages_after(
        &self,
        consultation_id: Uuid,
        since_seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>, TelemedicineError> {
        self.select(&format!(
            "/rest/v1/consultation_messages?consultation_id=eq.{}&seq=gt.{}&order=seq.asc&limit={}",
            consultation_id, since_seq, limit
        ))
        .await
    }

    async fn recent_messages(&self, consultation_id: Uuid, limit: usize) -> Result<Vec<Message>, TelemedicineError> {
        let mut messages: Vec<Message> = self
            .select(&format!(
                "/rest/v1/consultation_messages?consultation_id=eq.{}&order=seq.desc&limit={}",
                consultation_id, limit
            ))
            .await?;
        messages.reverse();
        Ok(messages)
    }

    async fn last_message_seq(&self, consultation_id: Uuid) -> Result<u64, TelemedicineError> {
        let rows: Vec<Value> = self
            .select(&format!(
                "/rest/v1/consultation_messages?consultation_id=eq.{}&select=seq&order=seq.desc&limit=1",
                consultation_id
            ))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row["seq"].as_u64())
            .unwrap_or(0))
    }

    async fn record_participant_event(&self, event: &ParticipantEvent) -> Result<(), TelemedicineError> {
        self.insert("consultation_participants", json!(event)).await?;
        Ok(())
    }

    async fn participant_history(&self, consultation_id: Uuid) -> Result<Vec<ParticipantEvent>, TelemedicineError> {
        self.select(&format!(
            "/rest/v1/consultation_participants?consultation_id=eq.{}&order=at.asc",
            consultation_id
        ))
        .await
    }

    async fn append_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        self.insert("consultation_issues", json!(issue)).await?;
        Ok(())
    }

    async fn update_issue(&self, issue: &TechnicalIssue) -> Result<(), TelemedicineError> {
        let rows = self
            .patch(
                &format!("/rest/v1/consultation_issues?id=eq.{}", issue.id),
                json!({
                    "status": issue.status,
                    "resolved_at": issue.resolved_at,
                    "resolved_by": issue.resolved_by,
                }),
            )
            .await?;
        if rows.is_empty() {
            return Err(TelemedicineError::validation(format!("issue {} not found", issue.id)));
        }
        Ok(())
    }

    async fn list_issues(&self, consultation_id: Uuid) -> Result<Vec<TechnicalIssue>, TelemedicineError> {
        self.select(&format!(
            "/rest/v1/consultation_issues?consultation_id=eq.{}&order=created_at.asc",
            consultation_id
        ))
        .await
    }

    async fn save_recording(&self, recording: &Recording) -> Result<(), TelemedicineError> {
        self.insert("consultation_recordings", json!(recording)).await?;
        Ok(())
    }

    async fn is_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        let rows: Vec<Value> = self
            .select(&format!(
                "/rest/v1/consultation_webhook_events?consultation_id=eq.{}&provider=eq.{}&event_id=eq.{}&select=event_id",
                consultation_id,
                provider,
                urlencoding::encode(event_id)
            ))
            .await?;
        Ok(!rows.is_empty())
    }

    async fn mark_event_processed(
        &self,
        consultation_id: Uuid,
        provider: VideoProvider,
        event_id: &str,
    ) -> Result<bool, TelemedicineError> {
        // ignore-duplicates returns no row when the unique key already exists
        let rows: Vec<Value> = self
            .supabase
            .request_with_headers(
                Method::POST,
                "/rest/v1/consultation_webhook_events",
                None,
                Some(json!({
                    "consultation_id": consultation_id,
                    "provider": provider,
                    "event_id": event_id,
                })),
                &[("prefer", "resolution=ignore-duplicates,return=representation")],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}
