//! Room registry: room existence, membership and host designation.
//!
//! # Locking
//!
//! ```text
//! rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>     (held only for lookup/insert/remove)
//! memberships: RwLock<HashMap<ParticipantId, RoomId>>  (held only for lookup/insert/remove)
//! ```
//!
//! Every mutation of a room happens under that room's own mutex, so rooms
//! never block each other. Lock order is always room mutex first, then one of
//! the two maps; the maps are never held across an `.await` on a room mutex.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::config::RoomSettings;
use crate::error::{Result, SignalError};
use crate::protocol::{ParticipantInfo, ServerMessage};
use crate::room::{Connection, Participant, ParticipantId, Role, Room, RoomId};

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    memberships: RwLock<HashMap<ParticipantId, RoomId>>,
    settings: RoomSettings,
}

impl RoomRegistry {
    pub fn new(settings: RoomSettings) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Create a room with `conn` as host and sole member.
    ///
    /// Any room the connection was already in is left first. The creator is
    /// sent `roomCreated`.
    pub async fn create_room(&self, conn: &Connection, display_name: &str) -> RoomId {
        self.leave_room(&conn.id).await;

        let room_id = RoomId::generate();
        let host = Participant::new(conn.clone(), display_name, Role::Host);
        let room = Room::new(room_id.clone(), host);

        self.rooms
            .write()
            .await
            .insert(room_id.clone(), Arc::new(Mutex::new(room)));
        self.memberships
            .write()
            .await
            .insert(conn.id, room_id.clone());

        conn.send(ServerMessage::RoomCreated {
            room_id: room_id.clone(),
        });
        tracing::info!(room_id = %room_id, host = %conn.id.short(), "room created");

        room_id
    }

    /// Add `conn` to an open room as a guest.
    ///
    /// Returns the members present *before* the join. The joiner gets
    /// `roomJoined` with that snapshot before any prior member learns about
    /// it, so the joiner never sees an offer from someone it has not been
    /// told about yet.
    pub async fn join_room(
        &self,
        conn: &Connection,
        room_id: &RoomId,
        display_name: &str,
    ) -> Result<Vec<ParticipantInfo>> {
        self.admissible(room_id, &conn.id).await?;

        if self.room_of(&conn.id).await.is_some() {
            self.leave_room(&conn.id).await;
        }

        // re-checked under the room lock: the room may have ended meanwhile
        let room_arc = self
            .room(room_id)
            .await
            .ok_or_else(|| SignalError::RoomNotFound(room_id.clone()))?;
        let mut room = room_arc.lock().await;
        self.check_admissible(&room)?;

        let snapshot = room.snapshot();
        let participant = Participant::new(conn.clone(), display_name, Role::Guest);

        conn.send(ServerMessage::RoomJoined {
            room_id: room_id.clone(),
            members: snapshot.clone(),
            is_host: false,
        });
        room.notify_member_joined(&participant);
        room.insert(participant);
        self.memberships
            .write()
            .await
            .insert(conn.id, room_id.clone());

        tracing::info!(
            room_id = %room_id,
            participant = %conn.id.short(),
            members = room.len(),
            "participant joined"
        );

        Ok(snapshot)
    }

    /// Remove a participant from whatever room it is in. No-op when it is in none.
    ///
    /// A departing host ends the room for everyone; a room left empty is ended
    /// and discarded.
    pub async fn leave_room(&self, participant: &ParticipantId) {
        let Some(mut room) = self.lock_room_of(participant).await else {
            return;
        };

        let Some(left) = room.remove(participant) else {
            return;
        };
        self.memberships.write().await.remove(participant);

        if left.is_host() && !room.is_empty() {
            tracing::info!(room_id = %room.id(), host = %participant.short(), "host left, ending room");
            self.finish(&mut room, Some(participant)).await;
            return;
        }

        room.notify_member_left(&left);
        tracing::info!(
            room_id = %room.id(),
            participant = %participant.short(),
            remaining = room.len(),
            "participant left"
        );

        if room.is_empty() {
            self.finish(&mut room, None).await;
        }
    }

    /// Transport-level disconnect. Same as leaving explicitly.
    pub async fn on_disconnect(&self, participant: &ParticipantId) {
        tracing::debug!(participant = %participant.short(), "connection closed");
        self.leave_room(participant).await;
    }

    /// Host-only: end `room_id` for every member.
    ///
    /// Ending a room that no longer exists is a no-op.
    pub async fn end_room(&self, participant: &ParticipantId, room_id: &RoomId) -> Result<()> {
        let Some(room_arc) = self.room(room_id).await else {
            return Ok(());
        };
        let mut room = room_arc.lock().await;
        if !room.is_open() {
            return Ok(());
        }
        if !room.contains(participant) {
            return Err(SignalError::NotAuthorized("not a member of this room"));
        }
        if room.host() != *participant {
            return Err(SignalError::NotAuthorized("only the host can end the call"));
        }

        tracing::info!(room_id = %room_id, members = room.len(), "call ended by host");
        self.finish(&mut room, Some(participant)).await;
        Ok(())
    }

    /// The room `participant` currently belongs to.
    pub async fn room_of(&self, participant: &ParticipantId) -> Option<RoomId> {
        self.memberships.read().await.get(participant).cloned()
    }

    /// Member snapshot of an open room.
    pub async fn members(&self, room_id: &RoomId) -> Option<Vec<ParticipantInfo>> {
        let room_arc = self.room(room_id).await?;
        let room = room_arc.lock().await;
        room.is_open().then(|| room.snapshot())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Lock the room `participant` is in, verifying it is still a member once
    /// the lock is held.
    pub(crate) async fn lock_room_of(
        &self,
        participant: &ParticipantId,
    ) -> Option<OwnedMutexGuard<Room>> {
        let room_id = self.room_of(participant).await?;
        let room_arc = self.room(&room_id).await?;
        let room = room_arc.lock_owned().await;
        room.contains(participant).then_some(room)
    }

    async fn room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    async fn admissible(&self, room_id: &RoomId, joiner: &ParticipantId) -> Result<()> {
        let room_arc = self
            .room(room_id)
            .await
            .ok_or_else(|| SignalError::RoomNotFound(room_id.clone()))?;
        let room = room_arc.lock().await;
        if room.contains(joiner) {
            return Err(SignalError::NotAuthorized("already a member of this room"));
        }
        self.check_admissible(&room)
    }

    fn check_admissible(&self, room: &Room) -> Result<()> {
        if !room.is_open() {
            return Err(SignalError::RoomNotFound(room.id().clone()));
        }
        if room.len() >= self.settings.max_participants {
            return Err(SignalError::NotAuthorized("room is full"));
        }
        Ok(())
    }

    /// End and discard a room. Caller holds the room lock.
    async fn finish(&self, room: &mut Room, ended_by: Option<&ParticipantId>) {
        let drained = room.end(ended_by);
        {
            let mut memberships = self.memberships.write().await;
            for p in &drained {
                memberships.remove(&p.id());
            }
        }
        self.rooms.write().await.remove(room.id());
        tracing::debug!(room_id = %room.id(), "room discarded");
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(RoomSettings::default())
    }
}
