use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, SignalError};
use crate::protocol::{ServerMessage, SignalKind};
use crate::registry::RoomRegistry;
use crate::room::{ParticipantId, Room, RoomId};

/// Presence flags every member of a room must observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceUpdate {
    Video { is_video_off: bool },
    Speaking { speaking: bool },
}

/// Server-side chat timestamps: epoch millis, strictly increasing.
#[derive(Debug, Default)]
pub struct ChatClock {
    last: AtomicI64,
}

impl ChatClock {
    pub fn next(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }
}

/// Forwards negotiation and room-wide messages between members of one room.
///
/// Sender identity always comes from the connection that issued the request.
pub struct SignalRouter {
    registry: Arc<RoomRegistry>,
    clock: ChatClock,
}

impl SignalRouter {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            clock: ChatClock::default(),
        }
    }

    /// Addressed 1:1 delivery of an offer, answer or candidate.
    ///
    /// Dropped when the sender has no room, when the target is the sender or
    /// when the target is not in the sender's room.
    pub async fn relay(
        &self,
        kind: SignalKind,
        sender: &ParticipantId,
        target: &ParticipantId,
        payload: Value,
    ) -> Result<()> {
        if sender == target {
            return Err(SignalError::InvalidTarget(*target));
        }
        let room = self
            .registry
            .lock_room_of(sender)
            .await
            .ok_or(SignalError::NotAuthorized("sender is not in a room"))?;

        if !room.send_to(target, ServerMessage::signal(kind, *sender, payload)) {
            return Err(SignalError::InvalidTarget(*target));
        }

        tracing::trace!(
            room_id = %room.id(),
            kind = kind.as_str(),
            from = %sender.short(),
            to = %target.short(),
            "relayed"
        );
        Ok(())
    }

    /// Delivers chat text to every other member of the sender's room.
    ///
    /// Empty messages are dropped; returns the assigned timestamp otherwise.
    pub async fn broadcast_chat(
        &self,
        sender: &ParticipantId,
        room_id: &RoomId,
        text: &str,
    ) -> Result<Option<i64>> {
        let room = self.sender_room(sender, room_id).await?;

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let max = self.registry.settings().max_chat_len;
        let text: String = text.chars().take(max).collect();

        let Some(author) = room.member(sender) else {
            return Err(SignalError::NotAuthorized("sender is not in a room"));
        };
        let timestamp = self.clock.next();
        let msg = ServerMessage::ChatMessage {
            participant_id: *sender,
            display_name: author.display_name.clone(),
            is_host: author.is_host(),
            text,
            timestamp,
        };
        room.broadcast_except(sender, &msg);
        Ok(Some(timestamp))
    }

    /// Records a presence flag on the sender and fans it out to the room.
    pub async fn broadcast_presence(
        &self,
        sender: &ParticipantId,
        room_id: &RoomId,
        update: PresenceUpdate,
    ) -> Result<()> {
        let mut room = self.sender_room(sender, room_id).await?;

        let msg = match update {
            PresenceUpdate::Video { is_video_off } => {
                if let Some(p) = room.member_mut(sender) {
                    p.video_muted = is_video_off;
                }
                ServerMessage::VideoStateChanged {
                    participant_id: *sender,
                    is_video_off,
                }
            }
            PresenceUpdate::Speaking { speaking } => {
                if let Some(p) = room.member_mut(sender) {
                    p.speaking = speaking;
                }
                ServerMessage::UserSpeaking {
                    participant_id: *sender,
                    speaking,
                }
            }
        };
        room.broadcast_except(sender, &msg);
        Ok(())
    }

    /// The sender's room, which must be the room the client named.
    async fn sender_room(
        &self,
        sender: &ParticipantId,
        room_id: &RoomId,
    ) -> Result<OwnedMutexGuard<Room>> {
        let room = self
            .registry
            .lock_room_of(sender)
            .await
            .ok_or(SignalError::NotAuthorized("sender is not in a room"))?;
        if room.id() != room_id {
            return Err(SignalError::NotAuthorized("not a member of this room"));
        }
        Ok(room)
    }
}
