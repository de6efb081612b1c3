//! Client side of a call: one negotiated link per remote participant in a
//! full mesh, driven by room notifications from the server.
//!
//! The actual media engine sits behind [`NegotiationEngine`]; camera and
//! microphone capture behind [`MediaProvider`].

pub mod engine;
pub mod media;
pub mod peer;
pub mod roster;
pub mod transport;

pub use engine::{Connectivity, EngineEvent, EngineEvents, EngineFactory, EngineTag, NegotiationEngine};
pub use media::{
    acquire_with_fallback, AcquiredMedia, LocalMedia, LocalTrack, MediaProvider, TrackKind,
};
pub use peer::{LinkState, OrchestratorChannels, PeerEvent, PeerLink, PeerOrchestrator, SignalSink};
pub use roster::{CallSession, Roster, RosterAction, RosterEntry};
pub use transport::SignalingClient;
