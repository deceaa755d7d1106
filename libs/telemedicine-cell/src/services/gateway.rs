// libs/telemedicine-cell/src/services/gateway.rs
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TelemedicineError;
use crate::models::{
    ConnectionState, Consultation, Frame, Message, MessageKind, Participant, ParticipantEvent,
    ParticipantRole, PresenceChange, PresenceSnapshot,
};
use crate::services::store::ConsultationStore;

pub type ConnectionId = Uuid;

struct Connection {
    identity: Uuid,
    role: ParticipantRole,
    sender: mpsc::Sender<Frame>,
}

#[derive(Clone, Copy)]
enum Audience {
    Everyone,
    Doctors,
}

/// Everything mutable about one room, behind a single lock so sequence
/// assignment, fan-out and membership changes are totally ordered.
struct RoomState {
    next_seq: u64,
    backlog: VecDeque<Message>,
    connections: HashMap<ConnectionId, Connection>,
    presence: HashMap<Uuid, Participant>,
    empty_since: DateTime<Utc>,
    closed: bool,
}

struct Room {
    state: Mutex<RoomState>,
}

impl Room {
    fn new(last_seq: u64, backlog: Vec<Message>) -> Self {
        Self {
            state: Mutex::new(RoomState {
                next_seq: last_seq + 1,
                backlog: backlog.into(),
                connections: HashMap::new(),
                presence: HashMap::new(),
                empty_since: Utc::now(),
                closed: false,
            }),
        }
    }
}

/// A registered realtime connection. Frames for this connection arrive on
/// `frames`; the channel closes when the gateway drops the connection.
#[derive(Debug)]
pub struct RoomConnection {
    pub connection_id: ConnectionId,
    pub participant: Participant,
    pub frames: mpsc::Receiver<Frame>,
}

/// Whether anyone is connected to a consultation's room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomActivity {
    Connected(usize),
    IdleSince(DateTime<Utc>),
    /// No room in memory (never opened, closed, or lost in a restart)
    NotLoaded,
}

/// In-memory registry of realtime rooms, one per consultation
pub struct RealtimeGateway {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    store: Arc<dyn ConsultationStore>,
    backlog_size: usize,
    outbound_buffer: usize,
}

impl RealtimeGateway {
    pub fn new(store: Arc<dyn ConsultationStore>, backlog_size: usize, outbound_buffer: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            backlog_size,
            outbound_buffer: outbound_buffer.max(1),
        }
    }

    async fn existing_room(&self, consultation_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&consultation_id).cloned()
    }

    /// Get the room, rebuilding its sequence counter and backlog from the store
    async fn room(&self, consultation_id: Uuid) -> Result<Arc<Room>, TelemedicineError> {
        if let Some(room) = self.existing_room(consultation_id).await {
            return Ok(room);
        }

        let last_seq = self.store.last_message_seq(consultation_id).await?;
        let backlog = self.store.recent_messages(consultation_id, self.backlog_size).await?;

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(consultation_id)
            .or_insert_with(|| {
                debug!("Opened room {} at seq {}", consultation_id, last_seq);
                Arc::new(Room::new(last_seq, backlog))
            })
            .clone();
        Ok(room)
    }

    /// Register a connection: replay backlog after `since_seq`, send the current
    /// status, then announce the participant to the room.
    pub async fn connect(
        &self,
        consultation: &Consultation,
        identity: Uuid,
        role: ParticipantRole,
        since_seq: Option<u64>,
    ) -> Result<RoomConnection, TelemedicineError> {
        let room = self.room(consultation.id).await?;
        let mut state = room.state.lock().await;
        if state.closed {
            return Err(TelemedicineError::RoomClosed);
        }

        let now = Utc::now();
        self.store
            .record_participant_event(&ParticipantEvent {
                consultation_id: consultation.id,
                identity,
                role,
                change: PresenceChange::Joined,
                at: now,
            })
            .await?;

        let since = since_seq.unwrap_or(0);
        let replay: Vec<Frame> = state
            .backlog
            .iter()
            .filter(|message| message.seq > since)
            .map(Frame::message)
            .collect();

        let (sender, frames) = mpsc::channel(self.outbound_buffer.max(replay.len() + 2));
        let replayed = replay.len();
        for frame in replay {
            sender
                .try_send(frame)
                .map_err(|_| TelemedicineError::Internal { message: "backlog replay overflow".to_string() })?;
        }
        sender
            .try_send(Frame::status(
                consultation.id,
                consultation.status,
                None,
                consultation.status_reason.as_deref(),
            ))
            .map_err(|_| TelemedicineError::Internal { message: "status frame overflow".to_string() })?;

        // A reconnect supersedes any connection the identity still holds
        let superseded: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, connection)| connection.identity == identity)
            .map(|(id, _)| *id)
            .collect();
        for id in superseded {
            debug!("Connection {} superseded by reconnect of {}", id, identity);
            state.connections.remove(&id);
        }

        let participant = Participant {
            consultation_id: consultation.id,
            identity,
            role,
            state: ConnectionState::Connected,
            joined_at: now,
            left_at: None,
        };
        state.presence.insert(identity, participant.clone());

        let connection_id = Uuid::new_v4();
        state.connections.insert(connection_id, Connection { identity, role, sender });

        info!(
            "{:?} {} connected to consultation {} ({} backlog frames)",
            role, identity, consultation.id, replayed
        );

        self.broadcast_locked(
            consultation.id,
            &mut state,
            Frame::presence(&participant, PresenceChange::Joined),
            Audience::Everyone,
        )
        .await;

        Ok(RoomConnection {
            connection_id,
            participant,
            frames,
        })
    }

    /// Explicit leave: drops every connection of `identity`. Returns whether it was present.
    pub async fn disconnect(&self, consultation_id: Uuid, identity: Uuid) -> Result<bool, TelemedicineError> {
        let Some(room) = self.existing_room(consultation_id).await else {
            return Ok(false);
        };
        let mut state = room.state.lock().await;

        state.connections.retain(|_, connection| connection.identity != identity);
        let was_connected = state
            .presence
            .get(&identity)
            .map_or(false, |p| p.state == ConnectionState::Connected);
        if !was_connected {
            return Ok(false);
        }

        if let Some(frame) = self.mark_left(consultation_id, &mut state, identity).await? {
            self.broadcast_locked(consultation_id, &mut state, frame, Audience::Everyone).await;
        }
        Ok(true)
    }

    /// Transport loss for one connection. A no-op if the connection was already
    /// superseded or dropped.
    pub async fn drop_connection(&self, consultation_id: Uuid, connection_id: ConnectionId) {
        let Some(room) = self.existing_room(consultation_id).await else {
            return;
        };
        let mut state = room.state.lock().await;

        let Some(connection) = state.connections.remove(&connection_id) else {
            return;
        };
        debug!("Connection {} to consultation {} closed", connection_id, consultation_id);

        match self.mark_left(consultation_id, &mut state, connection.identity).await {
            Ok(Some(frame)) => {
                self.broadcast_locked(consultation_id, &mut state, frame, Audience::Everyone).await
            }
            Ok(None) => {}
            Err(e) => error!("Failed to record departure from {}: {}", consultation_id, e),
        }
    }

    /// Assign the next sequence number, persist, then fan out in sequence order
    pub async fn publish_message(
        &self,
        consultation_id: Uuid,
        sender_id: Option<Uuid>,
        sender_role: Option<ParticipantRole>,
        kind: MessageKind,
        body: String,
    ) -> Result<Message, TelemedicineError> {
        let room = self.room(consultation_id).await?;
        let mut state = room.state.lock().await;
        if state.closed {
            return Err(TelemedicineError::RoomClosed);
        }

        let message = Message {
            id: Uuid::new_v4(),
            consultation_id,
            seq: state.next_seq,
            sender_id,
            sender_role,
            kind,
            body,
            created_at: Utc::now(),
        };
        self.store.append_message(&message).await?;

        state.next_seq += 1;
        state.backlog.push_back(message.clone());
        while state.backlog.len() > self.backlog_size {
            state.backlog.pop_front();
        }

        self.broadcast_locked(consultation_id, &mut state, Frame::message(&message), Audience::Everyone)
            .await;
        Ok(message)
    }

    /// Send a status frame to everyone connected; rooms are not opened for this
    pub async fn broadcast_status(&self, consultation_id: Uuid, frame: Frame) {
        if let Some(room) = self.existing_room(consultation_id).await {
            let mut state = room.state.lock().await;
            self.broadcast_locked(consultation_id, &mut state, frame, Audience::Everyone).await;
        }
    }

    /// Send a frame to doctor connections only
    pub async fn notify_doctors(&self, consultation_id: Uuid, frame: Frame) {
        if let Some(room) = self.existing_room(consultation_id).await {
            let mut state = room.state.lock().await;
            self.broadcast_locked(consultation_id, &mut state, frame, Audience::Doctors).await;
        }
    }

    pub async fn presence(&self, consultation_id: Uuid) -> PresenceSnapshot {
        let Some(room) = self.existing_room(consultation_id).await else {
            return PresenceSnapshot::default();
        };
        let state = room.state.lock().await;

        let connected = |role: ParticipantRole| {
            state
                .presence
                .values()
                .any(|p| p.role == role && p.state == ConnectionState::Connected)
        };
        let mut participants: Vec<Participant> = state.presence.values().cloned().collect();
        participants.sort_by_key(|p| p.joined_at);

        PresenceSnapshot {
            doctor_connected: connected(ParticipantRole::Doctor),
            patient_connected: connected(ParticipantRole::Patient),
            participants,
        }
    }

    /// Highest assigned sequence number, from memory or the store
    pub async fn last_seq(&self, consultation_id: Uuid) -> Result<u64, TelemedicineError> {
        match self.existing_room(consultation_id).await {
            Some(room) => Ok(room.state.lock().await.next_seq - 1),
            None => self.store.last_message_seq(consultation_id).await,
        }
    }

    pub async fn activity(&self, consultation_id: Uuid) -> RoomActivity {
        match self.existing_room(consultation_id).await {
            Some(room) => {
                let state = room.state.lock().await;
                if state.connections.is_empty() {
                    RoomActivity::IdleSince(state.empty_since)
                } else {
                    RoomActivity::Connected(state.connections.len())
                }
            }
            None => RoomActivity::NotLoaded,
        }
    }

    pub async fn open_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop every connection and forget the room. Clients see their frame
    /// stream end after whatever was already queued.
    pub async fn close_room(&self, consultation_id: Uuid) {
        let Some(room) = self.rooms.write().await.remove(&consultation_id) else {
            return;
        };
        let mut state = room.state.lock().await;
        state.closed = true;
        state.connections.clear();

        let still_connected: Vec<Uuid> = state
            .presence
            .values()
            .filter(|p| p.state == ConnectionState::Connected)
            .map(|p| p.identity)
            .collect();
        for identity in still_connected {
            if let Err(e) = self.mark_left(consultation_id, &mut state, identity).await {
                error!("Failed to record departure from {}: {}", consultation_id, e);
            }
        }

        info!("Closed realtime room for consultation {}", consultation_id);
    }

    /// Close the room once the grace period for trailing messages has passed
    pub fn schedule_close(self: &Arc<Self>, consultation_id: Uuid, grace: Duration) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            gateway.close_room(consultation_id).await;
        });
    }

    /// Mark `identity` disconnected if it holds no connection any more
    async fn mark_left(
        &self,
        consultation_id: Uuid,
        state: &mut RoomState,
        identity: Uuid,
    ) -> Result<Option<Frame>, TelemedicineError> {
        if state.connections.values().any(|c| c.identity == identity) {
            return Ok(None);
        }
        if state.connections.is_empty() {
            state.empty_since = Utc::now();
        }

        let Some(participant) = state.presence.get_mut(&identity) else {
            return Ok(None);
        };
        if participant.state == ConnectionState::Disconnected {
            return Ok(None);
        }

        let now = Utc::now();
        participant.state = ConnectionState::Disconnected;
        participant.left_at = Some(now);
        let frame = Frame::presence(participant, PresenceChange::Left);
        let event = ParticipantEvent {
            consultation_id,
            identity,
            role: participant.role,
            change: PresenceChange::Left,
            at: now,
        };

        info!("{:?} {} left consultation {}", event.role, identity, consultation_id);
        self.store.record_participant_event(&event).await?;
        Ok(Some(frame))
    }

    /// Fan a frame out without blocking: a connection whose buffer is full is
    /// dropped, and its departure is announced to whoever remains.
    async fn broadcast_locked(
        &self,
        consultation_id: Uuid,
        state: &mut RoomState,
        frame: Frame,
        audience: Audience,
    ) {
        let mut pending = VecDeque::from([(frame, audience)]);

        while let Some((frame, audience)) = pending.pop_front() {
            let mut dropped = Vec::new();
            for (id, connection) in &state.connections {
                if matches!(audience, Audience::Doctors) && connection.role != ParticipantRole::Doctor {
                    continue;
                }
                match connection.sender.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            "Dropping slow connection {} ({}) from consultation {}",
                            id, connection.identity, consultation_id
                        );
                        dropped.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => dropped.push(*id),
                }
            }

            for id in dropped {
                let Some(connection) = state.connections.remove(&id) else {
                    continue;
                };
                match self.mark_left(consultation_id, state, connection.identity).await {
                    Ok(Some(left)) => pending.push_back((left, Audience::Everyone)),
                    Ok(None) => {}
                    Err(e) => error!("Failed to record departure from {}: {}", consultation_id, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConsultationStatus, FrameType, VideoProvider};
    use crate::services::store::InMemoryConsultationStore;

    fn consultation() -> Consultation {
        let now = Utc::now();
        Consultation {
            id: Uuid::new_v4(),
            booking_id: None,
            doctor_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            observers: vec![],
            provider: VideoProvider::Jitsi,
            provider_room_id: "room".to_string(),
            doctor_join_url: "https://meet.test/room".to_string(),
            patient_join_url: "https://meet.test/room".to_string(),
            status: ConsultationStatus::Waiting,
            scheduled_time: now,
            actual_start_time: None,
            actual_end_time: None,
            terminated_at: None,
            status_reason: None,
            recording_enabled: false,
            recording: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn gateway(backlog: usize, buffer: usize) -> RealtimeGateway {
        RealtimeGateway::new(Arc::new(InMemoryConsultationStore::new()), backlog, buffer)
    }

    fn drain(frames: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(frame);
        }
        out
    }

    fn seqs(frames: &[Frame]) -> Vec<u64> {
        frames.iter().filter_map(|f| f.seq).collect()
    }

    #[tokio::test]
    async fn test_messages_fan_out_in_sequence() {
        let gateway = gateway(10, 16);
        let c = consultation();

        let mut doctor = gateway.connect(&c, c.doctor_id, ParticipantRole::Doctor, None).await.unwrap();
        let mut patient = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, None).await.unwrap();

        for i in 0..3 {
            gateway
                .publish_message(c.id, Some(c.patient_id), Some(ParticipantRole::Patient), MessageKind::Chat, format!("m{}", i))
                .await
                .unwrap();
        }

        assert_eq!(seqs(&drain(&mut doctor.frames)), vec![1, 2, 3]);
        assert_eq!(seqs(&drain(&mut patient.frames)), vec![1, 2, 3]);
        assert_eq!(gateway.last_seq(c.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_replays_backlog_after_since_seq() {
        let gateway = gateway(3, 16);
        let c = consultation();

        for i in 0..5 {
            gateway
                .publish_message(c.id, None, None, MessageKind::System, format!("s{}", i))
                .await
                .unwrap();
        }

        let mut all = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, None).await.unwrap();
        let frames = drain(&mut all.frames);
        assert_eq!(seqs(&frames), vec![3, 4, 5]);
        assert_eq!(frames[3].frame_type, FrameType::Status);

        let mut partial = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, Some(4)).await.unwrap();
        assert_eq!(seqs(&drain(&mut partial.frames)), vec![5]);
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped() {
        let gateway = gateway(10, 4);
        let c = consultation();

        let mut doctor = gateway.connect(&c, c.doctor_id, ParticipantRole::Doctor, None).await.unwrap();
        drain(&mut doctor.frames);
        let slow = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, None).await.unwrap();
        drain(&mut doctor.frames);

        for i in 0..6 {
            gateway
                .publish_message(c.id, Some(c.doctor_id), Some(ParticipantRole::Doctor), MessageKind::Chat, format!("m{}", i))
                .await
                .unwrap();
            // the doctor keeps up
            drain(&mut doctor.frames);
        }

        let presence = gateway.presence(c.id).await;
        assert!(presence.doctor_connected);
        assert!(!presence.patient_connected);
        drop(slow);
    }

    #[tokio::test]
    async fn test_issue_frames_reach_doctors_only() {
        let gateway = gateway(10, 16);
        let c = consultation();

        let mut doctor = gateway.connect(&c, c.doctor_id, ParticipantRole::Doctor, None).await.unwrap();
        let mut patient = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, None).await.unwrap();
        drain(&mut doctor.frames);
        drain(&mut patient.frames);

        gateway
            .notify_doctors(
                c.id,
                Frame {
                    frame_type: FrameType::Issue,
                    seq: None,
                    payload: serde_json::json!({ "description": "no audio" }),
                },
            )
            .await;

        assert_eq!(drain(&mut doctor.frames).len(), 1);
        assert!(drain(&mut patient.frames).is_empty());
    }

    #[tokio::test]
    async fn test_close_room_ends_streams() {
        let gateway = gateway(10, 16);
        let c = consultation();

        let mut patient = gateway.connect(&c, c.patient_id, ParticipantRole::Patient, None).await.unwrap();
        gateway.close_room(c.id).await;

        drain(&mut patient.frames);
        assert!(patient.frames.recv().await.is_none());
        assert_eq!(gateway.activity(c.id).await, RoomActivity::NotLoaded);
    }
}
