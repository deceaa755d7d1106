// libs/telemedicine-cell/src/models.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

// ==============================================================================
// PROVIDERS
// ==============================================================================

/// External video platform hosting the media for a consultation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoProvider {
    Zoom,
    #[serde(rename = "livekit")]
    LiveKit,
    Jitsi,
}

impl VideoProvider {
    pub const ALL: [VideoProvider; 3] = [VideoProvider::Zoom, VideoProvider::LiveKit, VideoProvider::Jitsi];

    pub fn as_str(&self) -> &'static str {
        match self {
            VideoProvider::Zoom => "zoom",
            VideoProvider::LiveKit => "livekit",
            VideoProvider::Jitsi => "jitsi",
        }
    }
}

impl fmt::Display for VideoProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VideoProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        VideoProvider::ALL
            .into_iter()
            .find(|provider| provider.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown video provider: {}", value))
    }
}

/// Provider-side room, returned by `create_room`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHandle {
    pub provider_room_id: String,
    pub doctor_join_url: String,
    pub patient_join_url: String,
}

/// What an adapter needs to know to provision a room
#[derive(Debug, Clone, Serialize)]
pub struct RoomMetadata {
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    pub scheduled_time: DateTime<Utc>,
    pub recording_enabled: bool,
    pub topic: String,
}

/// Reference to a provider-hosted recording artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRef {
    pub provider_recording_id: String,
    pub url: Option<String>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub consultation_id: Uuid,
    pub provider: VideoProvider,
    pub provider_room_id: String,
    #[serde(flatten)]
    pub reference: RecordingRef,
    pub created_at: DateTime<Utc>,
}

/// Provider-independent webhook event kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    MeetingStarted,
    MeetingEnded,
    RecordingCompleted { recording: Option<RecordingRef> },
    RoomDeleted,
    Unknown(String),
}

impl WebhookEventKind {
    pub fn name(&self) -> &str {
        match self {
            WebhookEventKind::MeetingStarted => "meeting.started",
            WebhookEventKind::MeetingEnded => "meeting.ended",
            WebhookEventKind::RecordingCompleted { .. } => "recording.completed",
            WebhookEventKind::RoomDeleted => "room.deleted",
            WebhookEventKind::Unknown(name) => name,
        }
    }
}

/// A verified webhook, normalized by the provider adapter
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_id: String,
    pub kind: WebhookEventKind,
    pub provider_room_id: String,
    pub occurred_at: DateTime<Utc>,
    pub raw: Value,
}

// ==============================================================================
// CONSULTATION
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultationStatus {
    Scheduled,
    Waiting,
    InProgress,
    Ended,
    Cancelled,
    Failed,
}

impl ConsultationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsultationStatus::Ended | ConsultationStatus::Cancelled | ConsultationStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsultationStatus::Scheduled => "scheduled",
            ConsultationStatus::Waiting => "waiting",
            ConsultationStatus::InProgress => "in_progress",
            ConsultationStatus::Ended => "ended",
            ConsultationStatus::Cancelled => "cancelled",
            ConsultationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ConsultationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Doctor,
    Patient,
    Observer,
}

/// One virtual visit between a doctor and a patient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consultation {
    pub id: Uuid,
    pub booking_id: Option<Uuid>,
    pub doctor_id: Uuid,
    pub patient_id: Uuid,
    #[serde(default)]
    pub observers: Vec<Uuid>,

    pub provider: VideoProvider,
    pub provider_room_id: String,
    pub doctor_join_url: String,
    pub patient_join_url: String,

    pub status: ConsultationStatus,
    pub scheduled_time: DateTime<Utc>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    /// When the consultation reached any terminal state
    pub terminated_at: Option<DateTime<Utc>>,
    pub status_reason: Option<String>,

    pub recording_enabled: bool,
    pub recording: Option<RecordingRef>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Consultation {
    pub fn role_of(&self, identity: Uuid) -> Option<ParticipantRole> {
        if identity == self.doctor_id {
            Some(ParticipantRole::Doctor)
        } else if identity == self.patient_id {
            Some(ParticipantRole::Patient)
        } else if self.observers.contains(&identity) {
            Some(ParticipantRole::Observer)
        } else {
            None
        }
    }

    /// Provider join URL for a role; observers only take part in the realtime room
    pub fn join_url_for(&self, role: ParticipantRole) -> Option<&str> {
        match role {
            ParticipantRole::Doctor => Some(&self.doctor_join_url),
            ParticipantRole::Patient => Some(&self.patient_join_url),
            ParticipantRole::Observer => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Instant after which the realtime room no longer accepts messages
    pub fn room_closes_at(&self, grace: Duration) -> Option<DateTime<Utc>> {
        self.terminated_at.map(|at| at + grace)
    }

    pub fn room_is_closed(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        self.room_closes_at(grace).map_or(false, |closes_at| now >= closes_at)
    }
}

/// Result of a state-machine command
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub consultation: Consultation,
    pub previous: ConsultationStatus,
    /// False when the command was an accepted no-op (e.g. a repeated start)
    pub changed: bool,
}

// ==============================================================================
// PARTICIPANTS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Session-scoped presence record; at most one per identity per consultation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub consultation_id: Uuid,
    pub identity: Uuid,
    pub role: ParticipantRole,
    pub state: ConnectionState,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceChange {
    Joined,
    Left,
}

/// Participant history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantEvent {
    pub consultation_id: Uuid,
    pub identity: Uuid,
    pub role: ParticipantRole,
    pub change: PresenceChange,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresenceSnapshot {
    pub doctor_connected: bool,
    pub patient_connected: bool,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsultationSnapshot {
    #[serde(flatten)]
    pub consultation: Consultation,
    pub presence: PresenceSnapshot,
    /// Every join and leave, oldest first
    pub participant_history: Vec<ParticipantEvent>,
    pub last_seq: u64,
}

// ==============================================================================
// MESSAGES & ISSUES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    System,
    FileReference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub consultation_id: Uuid,
    /// Per-room, strictly increasing, starting at 1
    pub seq: u64,
    pub sender_id: Option<Uuid>,
    pub sender_role: Option<ParticipantRole>,
    pub kind: MessageKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for IssueSeverity {
    fn default() -> Self {
        IssueSeverity::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalIssue {
    pub id: Uuid,
    pub consultation_id: Uuid,
    pub reported_by: Uuid,
    pub reporter_role: ParticipantRole,
    pub severity: IssueSeverity,
    pub description: String,
    pub status: IssueStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<Uuid>,
}

// ==============================================================================
// REALTIME FRAMES
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Chat,
    Presence,
    Status,
    Issue,
}

/// Outbound realtime frame. `seq` is set only for transcript messages; presence,
/// status and issue frames are ephemeral and never replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub seq: Option<u64>,
    pub payload: Value,
}

impl Frame {
    pub fn message(message: &Message) -> Self {
        Self {
            frame_type: FrameType::Chat,
            seq: Some(message.seq),
            payload: json!(message),
        }
    }

    pub fn presence(participant: &Participant, change: PresenceChange) -> Self {
        Self {
            frame_type: FrameType::Presence,
            seq: None,
            payload: json!({
                "event": match change {
                    PresenceChange::Joined => "participant_joined",
                    PresenceChange::Left => "participant_left",
                },
                "participant": participant,
            }),
        }
    }

    pub fn status(
        consultation_id: Uuid,
        status: ConsultationStatus,
        previous: Option<ConsultationStatus>,
        reason: Option<&str>,
    ) -> Self {
        Self {
            frame_type: FrameType::Status,
            seq: None,
            payload: json!({
                "consultation_id": consultation_id,
                "status": status,
                "previous": previous,
                "terminal": status.is_terminal(),
                "reason": reason,
                "at": Utc::now(),
            }),
        }
    }

    pub fn issue(issue: &TechnicalIssue) -> Self {
        Self {
            frame_type: FrameType::Issue,
            seq: None,
            payload: json!({
                "issue_id": issue.id,
                "severity": issue.severity,
                "description": issue.description,
                "reported_by": issue.reported_by,
                "reporter_role": issue.reporter_role,
            }),
        }
    }

    pub fn is_terminal_status(&self) -> bool {
        self.frame_type == FrameType::Status && self.payload["terminal"] == Value::Bool(true)
    }
}

/// Inbound frame from a realtime client
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Chat {
        body: String,
    },
    File {
        body: String,
    },
    Issue {
        description: String,
        #[serde(default)]
        severity: IssueSeverity,
    },
    Ping,
}

// ==============================================================================
// NOTIFICATIONS
// ==============================================================================

/// Events published for the notification service and other subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsultationEvent {
    MeetingReady {
        consultation_id: Uuid,
        booking_id: Option<Uuid>,
        doctor_id: Uuid,
        patient_id: Uuid,
        provider: VideoProvider,
        doctor_join_url: String,
        patient_join_url: String,
        scheduled_time: DateTime<Utc>,
    },
    StatusChanged {
        consultation_id: Uuid,
        from: ConsultationStatus,
        to: ConsultationStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    RecordingAvailable {
        consultation_id: Uuid,
        recording: RecordingRef,
    },
}

// ==============================================================================
// REQUEST / RESPONSE DTOs
// ==============================================================================

/// Either `booking_id`, or explicit `doctor_id` + `patient_id`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateConsultationRequest {
    pub booking_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub provider: VideoProvider,
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observers: Vec<Uuid>,
    #[serde(default)]
    pub recording_enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitionRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub file_reference: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportIssueRequest {
    pub description: String,
    #[serde(default)]
    pub severity: IssueSeverity,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    pub since_seq: Option<u64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub since_seq: Option<u64>,
}

/// How a webhook delivery was handled; always acknowledged with 2xx
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        consultation_id: Uuid,
        status: ConsultationStatus,
    },
    NoOp {
        consultation_id: Uuid,
        status: ConsultationStatus,
    },
    RecordingAttached {
        consultation_id: Uuid,
    },
    Duplicate {
        consultation_id: Uuid,
        event_id: String,
    },
    Rejected {
        consultation_id: Uuid,
        reason: String,
    },
    Ignored {
        reason: String,
    },
}
