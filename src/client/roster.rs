//! Keeps the local view of the room in step with server notifications and
//! turns membership changes into peer-link actions.
//!
//! Mesh rule: whoever was already in the room initiates toward a newcomer.
//! A newcomer never initiates toward the members listed in its own
//! `roomJoined`; it answers their offers instead. Every pair is therefore
//! negotiated exactly once.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::engine::{EngineEvent, EngineTag};
use super::peer::PeerOrchestrator;
use crate::error::SignalError;
use crate::protocol::{ClientMessage, ParticipantInfo, ServerMessage};
use crate::room::{ParticipantId, RoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub info: ParticipantInfo,
    pub speaking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterAction {
    Connect(ParticipantId),
    Disconnect(ParticipantId),
    DisconnectAll,
    HostChanged(bool),
}

/// Remote members of the room the local participant is in.
#[derive(Debug, Clone)]
pub struct Roster {
    local: ParticipantId,
    room: Option<RoomId>,
    is_host: bool,
    members: Vec<RosterEntry>,
}

impl Roster {
    pub fn new(local: ParticipantId) -> Self {
        Self {
            local,
            room: None,
            is_host: false,
            members: Vec::new(),
        }
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn members(&self) -> &[RosterEntry] {
        &self.members
    }

    pub fn member(&self, id: &ParticipantId) -> Option<&RosterEntry> {
        self.members.iter().find(|m| m.info.id == *id)
    }

    fn member_mut(&mut self, id: &ParticipantId) -> Option<&mut RosterEntry> {
        self.members.iter_mut().find(|m| m.info.id == *id)
    }

    /// Forget the current room. Returns it, if there was one.
    pub fn reset(&mut self) -> Option<RoomId> {
        self.members.clear();
        self.is_host = false;
        self.room.take()
    }

    pub fn apply(&mut self, msg: &ServerMessage) -> Vec<RosterAction> {
        match msg {
            ServerMessage::RoomCreated { room_id } => {
                let mut actions = self.switch_room();
                self.room = Some(room_id.clone());
                self.is_host = true;
                actions.push(RosterAction::HostChanged(true));
                actions
            }
            ServerMessage::RoomJoined {
                room_id,
                members,
                is_host,
            } => {
                let mut actions = self.switch_room();
                self.room = Some(room_id.clone());
                self.is_host = *is_host;
                self.members = members
                    .iter()
                    .filter(|m| m.id != self.local)
                    .map(|info| RosterEntry {
                        info: info.clone(),
                        speaking: false,
                    })
                    .collect();
                actions.push(RosterAction::HostChanged(*is_host));
                actions
            }
            ServerMessage::UserJoined { participant } => {
                if self.room.is_none()
                    || participant.id == self.local
                    || self.member(&participant.id).is_some()
                {
                    return Vec::new();
                }
                self.members.push(RosterEntry {
                    info: participant.clone(),
                    speaking: false,
                });
                vec![RosterAction::Connect(participant.id)]
            }
            ServerMessage::UserLeft { participant } => {
                self.members.retain(|m| m.info.id != participant.id);
                vec![RosterAction::Disconnect(participant.id)]
            }
            ServerMessage::CallEnded => {
                self.room = None;
                self.is_host = false;
                self.members.clear();
                vec![RosterAction::DisconnectAll, RosterAction::HostChanged(false)]
            }
            ServerMessage::VideoStateChanged {
                participant_id,
                is_video_off,
            } => {
                if let Some(m) = self.member_mut(participant_id) {
                    m.info.is_video_off = *is_video_off;
                }
                Vec::new()
            }
            ServerMessage::UserSpeaking {
                participant_id,
                speaking,
            } => {
                if let Some(m) = self.member_mut(participant_id) {
                    m.speaking = *speaking;
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    // the server has already moved us out of the previous room
    fn switch_room(&mut self) -> Vec<RosterAction> {
        match self.reset() {
            Some(_) => vec![RosterAction::DisconnectAll],
            None => Vec::new(),
        }
    }
}

/// One client's call: server notifications and engine callbacks in, peer
/// links out.
pub struct CallSession {
    roster: Mutex<Roster>,
    peers: Arc<PeerOrchestrator>,
}

impl CallSession {
    pub fn new(peers: Arc<PeerOrchestrator>) -> Self {
        Self {
            roster: Mutex::new(Roster::new(peers.local())),
            peers,
        }
    }

    pub fn peers(&self) -> &Arc<PeerOrchestrator> {
        &self.peers
    }

    pub async fn roster(&self) -> Roster {
        self.roster.lock().await.clone()
    }

    /// Leave the current room. Links are released before the server is told.
    /// Returns `false` when not in a room.
    pub async fn leave_room(&self) -> bool {
        let Some(room_id) = self.roster.lock().await.reset() else {
            return false;
        };
        self.teardown().await;
        self.peers.signal(ClientMessage::LeaveRoom { room_id });
        true
    }

    /// End the call for everyone. Host only.
    pub async fn end_call(&self) -> Result<(), SignalError> {
        let room_id = {
            let mut roster = self.roster.lock().await;
            if !roster.is_host() {
                return Err(SignalError::NotAuthorized("only the host can end the call"));
            }
            roster.reset()
        };
        let Some(room_id) = room_id else {
            return Err(SignalError::NotAuthorized("not in a room"));
        };
        self.teardown().await;
        self.peers.signal(ClientMessage::EndCall { room_id });
        Ok(())
    }

    async fn teardown(&self) {
        let closed = self.peers.close_all().await;
        self.peers.set_host(false);
        tracing::info!(closed, "left the call");
    }

    pub async fn handle_server_message(&self, msg: ServerMessage) {
        let negotiation = matches!(
            msg,
            ServerMessage::Offer { .. }
                | ServerMessage::Answer { .. }
                | ServerMessage::Candidate { .. }
        );
        if negotiation && self.roster.lock().await.room().is_none() {
            tracing::debug!("negotiation frame outside a room, dropped");
            return;
        }
        match msg {
            ServerMessage::Offer { from, payload } => self.peers.on_offer(from, payload).await,
            ServerMessage::Answer { from, payload } => self.peers.on_answer(from, payload).await,
            ServerMessage::Candidate { from, payload } => {
                self.peers.on_candidate(from, payload).await
            }
            ServerMessage::Error { message, code } => {
                tracing::warn!(%code, "server refused request: {}", message);
            }
            ServerMessage::ChatMessage {
                display_name, text, ..
            } => {
                tracing::debug!(from = %display_name, "chat: {}", text);
            }
            other => {
                let actions = self.roster.lock().await.apply(&other);
                for action in actions {
                    self.perform(action).await;
                }
            }
        }
    }

    async fn perform(&self, action: RosterAction) {
        match action {
            RosterAction::Connect(remote) => {
                self.peers.initiate(remote).await;
            }
            RosterAction::Disconnect(remote) => {
                self.peers.close(remote).await;
            }
            RosterAction::DisconnectAll => {
                let closed = self.peers.close_all().await;
                tracing::info!(closed, "call ended");
            }
            RosterAction::HostChanged(is_host) => self.peers.set_host(is_host),
        }
    }

    /// Drive the session until the signaling channel closes, then release
    /// every link.
    pub async fn run(
        &self,
        mut server_rx: mpsc::UnboundedReceiver<ServerMessage>,
        mut engine_rx: mpsc::UnboundedReceiver<(EngineTag, EngineEvent)>,
    ) {
        loop {
            tokio::select! {
                msg = server_rx.recv() => match msg {
                    Some(msg) => self.handle_server_message(msg).await,
                    None => break,
                },
                Some((tag, event)) = engine_rx.recv() => {
                    self.peers.handle_engine_event(tag, event).await;
                }
            }
        }
        self.peers.close_all().await;
    }
}
