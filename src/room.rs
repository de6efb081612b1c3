use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ParticipantInfo, ServerMessage};

/// Opaque room identifier, generated server-side.
///
/// Kept as a string on the wire so that a mistyped id reaches the registry
/// and fails with `RoomNotFound` instead of a decode error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Fresh identifier backed by a v4 UUID (122 random bits).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one logical transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound half of a client connection: who it is and where to push frames.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ParticipantId,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: ParticipantId::new(),
            tx,
        }
    }

    /// Queue a message for this connection. Returns `false` if the socket task is gone.
    pub fn send(&self, msg: ServerMessage) -> bool {
        self.tx.send(msg).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Joining,
    Active,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Open,
    Ended,
}

#[derive(Debug)]
pub struct Participant {
    pub conn: Connection,
    pub display_name: String,
    pub role: Role,
    pub video_muted: bool,
    pub speaking: bool,
    pub presence: Presence,
}

impl Participant {
    pub fn new(conn: Connection, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            conn,
            display_name: display_name.into(),
            role,
            video_muted: false,
            speaking: false,
            presence: Presence::Joining,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.conn.id
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id(),
            display_name: self.display_name.clone(),
            is_host: self.is_host(),
            is_video_off: self.video_muted,
        }
    }

    fn deliver(&self, msg: ServerMessage) {
        if !self.conn.send(msg) {
            tracing::debug!(participant = %self.id(), "outbound channel closed, dropping message");
        }
    }
}

/// One call session. Only ever touched under its registry mutex.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    host: ParticipantId,
    // ordered by join time
    members: Vec<Participant>,
    state: RoomState,
}

impl Room {
    pub fn new(id: RoomId, mut host: Participant) -> Self {
        host.role = Role::Host;
        host.presence = Presence::Active;
        Self {
            id,
            host: host.id(),
            members: vec![host],
            state: RoomState::Open,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn host(&self) -> ParticipantId {
        self.host
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == RoomState::Open
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|p| p.id() == *id)
    }

    pub fn member(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.iter().find(|p| p.id() == *id)
    }

    pub fn member_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.members.iter_mut().find(|p| p.id() == *id)
    }

    pub fn member_ids(&self) -> Vec<ParticipantId> {
        self.members.iter().map(Participant::id).collect()
    }

    pub fn snapshot(&self) -> Vec<ParticipantInfo> {
        self.members.iter().map(Participant::info).collect()
    }

    pub fn insert(&mut self, mut participant: Participant) {
        participant.presence = Presence::Active;
        self.members.push(participant);
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let idx = self.members.iter().position(|p| p.id() == *id)?;
        let mut participant = self.members.remove(idx);
        participant.presence = Presence::Left;
        if self.members.is_empty() {
            self.state = RoomState::Ended;
        }
        Some(participant)
    }

    /// Addressed delivery. Returns `false` when the target is not a member.
    pub fn send_to(&self, id: &ParticipantId, msg: ServerMessage) -> bool {
        match self.member(id) {
            Some(p) => {
                p.deliver(msg);
                true
            }
            None => false,
        }
    }

    /// Room-wide delivery to everyone except `except`.
    pub fn broadcast_except(&self, except: &ParticipantId, msg: &ServerMessage) {
        for p in self.members.iter().filter(|p| p.id() != *except) {
            p.deliver(msg.clone());
        }
    }

    pub fn notify_member_joined(&self, joined: &Participant) {
        let msg = ServerMessage::UserJoined {
            participant: joined.info(),
        };
        self.broadcast_except(&joined.id(), &msg);
    }

    pub fn notify_member_left(&self, left: &Participant) {
        let msg = ServerMessage::UserLeft {
            participant: left.info(),
        };
        self.broadcast_except(&left.id(), &msg);
    }

    /// Ends the room: every remaining member except `ended_by` gets exactly one
    /// `callEnded`, and all members are drained with a `Left` transition.
    ///
    /// A second call finds the room already `Ended` and returns nothing.
    pub fn end(&mut self, ended_by: Option<&ParticipantId>) -> Vec<Participant> {
        if self.state == RoomState::Ended && self.members.is_empty() {
            return Vec::new();
        }
        self.state = RoomState::Ended;
        let mut drained: Vec<Participant> = self.members.drain(..).collect();
        for p in drained.iter_mut() {
            if Some(&p.id()) != ended_by {
                p.deliver(ServerMessage::CallEnded);
            }
            p.presence = Presence::Left;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(name: &str, role: Role) -> (Participant, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Participant::new(Connection::new(tx), name, role), rx)
    }

    #[test]
    fn new_room_has_host_as_sole_active_member() {
        let (host, _rx) = participant("alice", Role::Guest);
        let host_id = host.id();
        let room = Room::new(RoomId::generate(), host);

        assert_eq!(room.host(), host_id);
        assert_eq!(room.len(), 1);
        assert!(room.is_open());
        let info = &room.snapshot()[0];
        assert!(info.is_host);
        assert_eq!(room.member(&host_id).map(|p| p.presence), Some(Presence::Active));
    }

    #[test]
    fn snapshot_preserves_join_order() {
        let (host, _h) = participant("host", Role::Host);
        let mut room = Room::new(RoomId::generate(), host);
        let (a, _a) = participant("a", Role::Guest);
        let (b, _b) = participant("b", Role::Guest);
        let (a_id, b_id) = (a.id(), b.id());
        room.insert(a);
        room.insert(b);

        let ids: Vec<_> = room.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids[1..], [a_id, b_id]);
    }

    #[test]
    fn removing_last_member_ends_room() {
        let (host, _rx) = participant("host", Role::Host);
        let id = host.id();
        let mut room = Room::new(RoomId::generate(), host);

        let removed = room.remove(&id).unwrap();
        assert_eq!(removed.presence, Presence::Left);
        assert_eq!(room.state(), RoomState::Ended);
        assert!(room.remove(&id).is_none());
    }

    #[test]
    fn end_notifies_each_other_member_once() {
        let (host, mut host_rx) = participant("host", Role::Host);
        let host_id = host.id();
        let mut room = Room::new(RoomId::generate(), host);
        let (guest, mut guest_rx) = participant("guest", Role::Guest);
        room.insert(guest);

        let drained = room.end(Some(&host_id));
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|p| p.presence == Presence::Left));
        assert!(matches!(guest_rx.try_recv(), Ok(ServerMessage::CallEnded)));
        assert!(guest_rx.try_recv().is_err());
        assert!(host_rx.try_recv().is_err());

        assert!(room.end(Some(&host_id)).is_empty());
        assert!(guest_rx.try_recv().is_err());
    }

    #[test]
    fn send_to_non_member_is_rejected() {
        let (host, _rx) = participant("host", Role::Host);
        let room = Room::new(RoomId::generate(), host);
        assert!(!room.send_to(&ParticipantId::new(), ServerMessage::CallEnded));
    }
}
