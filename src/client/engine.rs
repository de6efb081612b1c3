//! Seam to the negotiation engine (the browser's or webrtc-rs's peer connection).
//!
//! The orchestrator only drives the engine through [`NegotiationEngine`] and
//! learns about it through [`EngineEvent`]s pushed into an [`EngineEvents`]
//! handle; it never looks at SDP or candidate contents.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::media::{LocalMedia, LocalTrack, TrackKind};
use crate::room::ParticipantId;

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn add_local_tracks(&self, media: &LocalMedia) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<Value>;
    async fn create_answer(&self) -> anyhow::Result<Value>;
    async fn set_local_description(&self, description: Value) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: Value) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: Value) -> anyhow::Result<()>;

    /// Swap the outgoing video track in place, without renegotiating.
    /// `None` stops sending video.
    async fn replace_video_track(&self, track: Option<&LocalTrack>) -> anyhow::Result<()>;

    /// Ask the engine to gather fresh candidates after an ICE failure.
    async fn restart_ice(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self);
}

/// Builds one engine per peer link.
pub trait EngineFactory: Send + Sync {
    fn create(&self, events: EngineEvents) -> anyhow::Result<Arc<dyn NegotiationEngine>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Connectivity::New => "new",
            Connectivity::Checking => "checking",
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
            Connectivity::Failed => "failed",
            Connectivity::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Callbacks of one engine instance, as data.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    IceCandidate(Value),
    Track {
        stream_id: String,
        track_id: String,
        kind: TrackKind,
    },
    TrackMuted {
        kind: TrackKind,
        muted: bool,
    },
    TrackEnded {
        kind: TrackKind,
    },
    IceConnectionState(Connectivity),
    ConnectionState(Connectivity),
}

/// Tags each event with the link it belongs to.
///
/// `generation` distinguishes successive engines of the same remote so that
/// late callbacks from a torn-down engine are recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTag {
    pub remote: ParticipantId,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct EngineEvents {
    tag: EngineTag,
    tx: mpsc::UnboundedSender<(EngineTag, EngineEvent)>,
}

impl EngineEvents {
    pub(crate) fn new(tag: EngineTag, tx: mpsc::UnboundedSender<(EngineTag, EngineEvent)>) -> Self {
        Self { tag, tx }
    }

    pub fn tag(&self) -> EngineTag {
        self.tag
    }

    pub fn emit(&self, event: EngineEvent) {
        if self.tx.send((self.tag, event)).is_err() {
            tracing::trace!(remote = %self.tag.remote.short(), "engine event after shutdown");
        }
    }
}
