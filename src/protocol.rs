//! Wire envelopes exchanged over the signaling socket.
//!
//! Every frame is a JSON object tagged by `event`, with camelCase fields:
//!
//! ```text
//! → {"event":"joinRoom","roomId":"…","displayName":"bob"}
//! ← {"event":"roomJoined","roomId":"…","members":[…],"isHost":false}
//! → {"event":"offer","to":"<participant>","payload":{…}}
//! ← {"event":"offer","from":"<participant>","payload":{…}}
//! ```
//!
//! Negotiation payloads are opaque `serde_json::Value`s; the server never
//! looks inside them. The sender of a relayed message is never read from the
//! client frame, it is stamped by the server from the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;
use crate::room::{ParticipantId, RoomId};

/// Public view of a room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub display_name: String,
    pub is_host: bool,
    pub is_video_off: bool,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateRoom { display_name: String },
    JoinRoom { room_id: RoomId, display_name: String },
    LeaveRoom { room_id: RoomId },
    EndCall { room_id: RoomId },
    Offer { to: ParticipantId, payload: Value },
    Answer { to: ParticipantId, payload: Value },
    Candidate { to: ParticipantId, payload: Value },
    ChatMessage { room_id: RoomId, text: String },
    VideoStateChange { room_id: RoomId, is_video_off: bool },
    SpeakingStateChange { room_id: RoomId, speaking: bool },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// First frame on every socket: tells the client its own identifier.
    Connected { participant_id: ParticipantId },
    RoomCreated { room_id: RoomId },
    RoomJoined {
        room_id: RoomId,
        members: Vec<ParticipantInfo>,
        is_host: bool,
    },
    UserJoined { participant: ParticipantInfo },
    UserLeft { participant: ParticipantInfo },
    Offer { from: ParticipantId, payload: Value },
    Answer { from: ParticipantId, payload: Value },
    Candidate { from: ParticipantId, payload: Value },
    ChatMessage {
        participant_id: ParticipantId,
        display_name: String,
        is_host: bool,
        text: String,
        timestamp: i64,
    },
    VideoStateChanged {
        participant_id: ParticipantId,
        is_video_off: bool,
    },
    UserSpeaking {
        participant_id: ParticipantId,
        speaking: bool,
    },
    CallEnded,
    Error { message: String, code: String },
}

/// The three negotiation message kinds the router relays 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl ClientMessage {
    /// Builds the outbound frame for a negotiation message addressed to `to`.
    pub fn signal(kind: SignalKind, to: ParticipantId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => ClientMessage::Offer { to, payload },
            SignalKind::Answer => ClientMessage::Answer { to, payload },
            SignalKind::Candidate => ClientMessage::Candidate { to, payload },
        }
    }
}

impl ServerMessage {
    pub fn signal(kind: SignalKind, from: ParticipantId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => ServerMessage::Offer { from, payload },
            SignalKind::Answer => ServerMessage::Answer { from, payload },
            SignalKind::Candidate => ServerMessage::Candidate { from, payload },
        }
    }

    pub fn error(err: &SignalError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_use_event_tag_and_camel_case() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "event": "joinRoom",
            "roomId": "r1",
            "displayName": "bob"
        }))
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::JoinRoom {
                room_id: RoomId::from("r1"),
                display_name: "bob".into()
            }
        );
    }

    #[test]
    fn call_ended_has_no_payload() {
        let json = serde_json::to_value(ServerMessage::CallEnded).unwrap();
        assert_eq!(json, json!({ "event": "callEnded" }));
    }

    #[test]
    fn relayed_offer_carries_sender() {
        let from = ParticipantId::new();
        let json = serde_json::to_value(ServerMessage::signal(
            SignalKind::Offer,
            from,
            json!({"sdp": "v=0"}),
        ))
        .unwrap();

        assert_eq!(json["event"], "offer");
        assert_eq!(json["from"], from.to_string());
        assert_eq!(json["payload"]["sdp"], "v=0");
    }

    #[test]
    fn client_cannot_declare_sender() {
        // a `from` field is not part of the client frame and is ignored
        let msg: ClientMessage = serde_json::from_value(json!({
            "event": "candidate",
            "to": ParticipantId::new(),
            "from": ParticipantId::new(),
            "payload": {}
        }))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Candidate { .. }));
    }

    #[test]
    fn unknown_event_is_rejected() {
        let res = serde_json::from_value::<ClientMessage>(json!({ "event": "teleport" }));
        assert!(res.is_err());
    }

    #[test]
    fn error_frame_carries_code() {
        let err = SignalError::RoomNotFound(RoomId::from("gone"));
        let json = serde_json::to_value(ServerMessage::error(&err)).unwrap();
        assert_eq!(json["code"], "ROOM_NOT_FOUND");
    }
}
