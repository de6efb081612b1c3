//! Rendezvous service and mesh-call orchestration for group video calls.
//!
//! Server side: [`registry::RoomRegistry`] owns rooms and membership,
//! [`signal::SignalRouter`] relays negotiation messages 1:1 inside a room,
//! [`socket`] binds both to an axum WebSocket endpoint.
//!
//! Client side: [`client`] runs one [`client::PeerLink`] per remote
//! participant and reconciles the roster from server notifications.

pub mod app_state;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod signal;
pub mod socket;

pub use app_state::AppState;
pub use error::{MediaError, SignalError};
pub use protocol::{ClientMessage, ParticipantInfo, ServerMessage, SignalKind};
pub use room::{ParticipantId, RoomId};
