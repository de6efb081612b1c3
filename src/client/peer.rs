//! Per-remote-participant connection orchestration.
//!
//! ```text
//! Idle ─initiate─▶ Offering ─▶ AwaitingAnswer ─answer─▶ Connected
//!   │                                                    │  ▲
//!   └──────────────── offer ─────────────────────────────┘  │ offer / retry
//!                                                           │
//!                        Connected ─engine failed─▶ Reconnecting ─retries exhausted─▶ Failed
//!
//! any non-terminal state ─close─▶ Closed
//! ```
//!
//! Links live in one keyed table. Each link has its own mutex, so events for
//! different remotes never wait on each other; the table lock is only held to
//! look up, insert or remove an entry. An event that is not valid in the
//! link's current state is logged and dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::engine::{
    Connectivity, EngineEvent, EngineEvents, EngineFactory, EngineTag, NegotiationEngine,
};
use super::media::{LocalMedia, LocalTrack, MediaProvider, TrackKind};
use crate::config::ReconnectPolicy;
use crate::error::{MediaError, SignalError};
use crate::protocol::{ClientMessage, SignalKind};
use crate::room::ParticipantId;

/// Where outgoing signaling frames go.
pub trait SignalSink: Send + Sync {
    fn deliver(&self, msg: ClientMessage);
}

impl SignalSink for mpsc::UnboundedSender<ClientMessage> {
    fn deliver(&self, msg: ClientMessage) {
        if mpsc::UnboundedSender::send(self, msg).is_err() {
            tracing::debug!("signaling channel closed, frame dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Offering,
    AwaitingAnswer,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Offering => "Offering",
            LinkState::AwaitingAnswer => "AwaitingAnswer",
            LinkState::Connected => "Connected",
            LinkState::Reconnecting => "Reconnecting",
            LinkState::Failed => "Failed",
            LinkState::Closed => "Closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator reports upward (to the UI).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged {
        remote: ParticipantId,
        state: LinkState,
    },
    /// The engine confirmed a working media path.
    Established { remote: ParticipantId },
    StreamAdded {
        remote: ParticipantId,
        stream_id: String,
    },
    StreamRemoved { remote: ParticipantId },
    VideoMuted {
        remote: ParticipantId,
        muted: bool,
    },
    /// Given up on this participant; shown as disconnected.
    Dropped { remote: ParticipantId },
}

pub struct PeerLink {
    remote: ParticipantId,
    state: LinkState,
    engine: Option<Arc<dyn NegotiationEngine>>,
    generation: u64,
    remote_description_set: bool,
    pending_candidates: Vec<Value>,
    established: bool,
    stream_id: Option<String>,
    video_muted: bool,
    attempts: u32,
    retry: Option<JoinHandle<()>>,
}

impl PeerLink {
    fn new(remote: ParticipantId) -> Self {
        Self {
            remote,
            state: LinkState::Idle,
            engine: None,
            generation: 0,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            established: false,
            stream_id: None,
            video_muted: false,
            attempts: 0,
            retry: None,
        }
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    pub fn video_muted(&self) -> bool {
        self.video_muted
    }

    fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
    }

    async fn release_engine(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        self.remote_description_set = false;
        self.established = false;
    }
}

/// Receivers handed out once, at construction.
pub struct OrchestratorChannels {
    pub engine_events: mpsc::UnboundedReceiver<(EngineTag, EngineEvent)>,
    pub peer_events: mpsc::UnboundedReceiver<PeerEvent>,
}

pub struct PeerOrchestrator {
    local: ParticipantId,
    is_host: AtomicBool,
    camera: LocalMedia,
    // what links attach and send; differs from `camera` while sharing
    outgoing: Mutex<LocalMedia>,
    sharing: AtomicBool,
    policy: ReconnectPolicy,
    signaling: Arc<dyn SignalSink>,
    engines: Arc<dyn EngineFactory>,
    engine_tx: mpsc::UnboundedSender<(EngineTag, EngineEvent)>,
    events: mpsc::UnboundedSender<PeerEvent>,
    generations: AtomicU64,
    links: Mutex<HashMap<ParticipantId, Arc<Mutex<PeerLink>>>>,
}

impl PeerOrchestrator {
    pub fn new(
        local: ParticipantId,
        media: LocalMedia,
        policy: ReconnectPolicy,
        signaling: Arc<dyn SignalSink>,
        engines: Arc<dyn EngineFactory>,
    ) -> (Arc<Self>, OrchestratorChannels) {
        let (engine_tx, engine_events) = mpsc::unbounded_channel();
        let (events, peer_events) = mpsc::unbounded_channel();
        let orchestrator = Arc::new(Self {
            local,
            is_host: AtomicBool::new(false),
            outgoing: Mutex::new(media.clone()),
            camera: media,
            sharing: AtomicBool::new(false),
            policy,
            signaling,
            engines,
            engine_tx,
            events,
            generations: AtomicU64::new(0),
            links: Mutex::new(HashMap::new()),
        });
        (
            orchestrator,
            OrchestratorChannels {
                engine_events,
                peer_events,
            },
        )
    }

    pub fn local(&self) -> ParticipantId {
        self.local
    }

    pub fn set_host(&self, is_host: bool) {
        self.is_host.store(is_host, Ordering::SeqCst);
    }

    pub fn is_host(&self) -> bool {
        self.is_host.load(Ordering::SeqCst)
    }

    /// Send a frame to the server on this participant's behalf.
    pub fn signal(&self, msg: ClientMessage) {
        self.signaling.deliver(msg);
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing.load(Ordering::SeqCst)
    }

    /// The stream every link sends, with the screen in place of the camera
    /// while sharing.
    pub async fn outgoing_media(&self) -> LocalMedia {
        self.outgoing.lock().await.clone()
    }

    /// Send the screen instead of the camera on every link, and on links
    /// created later. Returns how many links switched.
    pub async fn share_screen(&self, provider: &dyn MediaProvider) -> Result<usize, SignalError> {
        let display = provider
            .acquire_display_media()
            .await
            .map_err(SignalError::MediaUnavailable)?;
        let track = display
            .video_track()
            .cloned()
            .ok_or(SignalError::MediaUnavailable(MediaError::NotFound))?;

        self.sharing.store(true, Ordering::SeqCst);
        tracing::info!(track = %track.id, "screen share started");
        Ok(self.swap_video(Some(track)).await)
    }

    /// Back to the camera (or to no video after an audio-only fallback).
    pub async fn stop_sharing(&self) -> usize {
        if !self.sharing.swap(false, Ordering::SeqCst) {
            return 0;
        }
        tracing::info!("screen share stopped");
        self.swap_video(self.camera.video_track().cloned()).await
    }

    pub async fn link_state(&self, remote: &ParticipantId) -> Option<LinkState> {
        let link = self.link(remote).await?;
        let state = link.lock().await.state;
        Some(state)
    }

    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Inspect one link under its lock.
    pub async fn with_link<R>(
        &self,
        remote: &ParticipantId,
        f: impl FnOnce(&PeerLink) -> R,
    ) -> Option<R> {
        let link = self.link(remote).await?;
        let guard = link.lock().await;
        Some(f(&guard))
    }

    /// Start negotiating toward `remote`. Only a fresh link can be initiated,
    /// so concurrent or repeated calls produce exactly one offer.
    pub async fn initiate(self: &Arc<Self>, remote: ParticipantId) -> bool {
        if remote == self.local {
            return false;
        }
        let (link, created) = self.link_or_insert(remote).await;
        if !created {
            tracing::debug!(remote = %remote.short(), "initiate ignored, link already exists");
            return false;
        }
        let mut link = link.lock().await;
        if link.state != LinkState::Idle {
            return false;
        }
        self.offer(&mut link).await
    }

    /// Incoming offer: accepted for a new link, an idle one, or one being
    /// recovered (including a remote restarting a connected link).
    pub async fn on_offer(self: &Arc<Self>, remote: ParticipantId, offer: Value) {
        if remote == self.local {
            return;
        }
        let (link, _) = self.link_or_insert(remote).await;
        let mut link = link.lock().await;
        match link.state {
            LinkState::Idle | LinkState::Reconnecting | LinkState::Connected => {}
            state => {
                self.conflict(&link, state, "offer");
                return;
            }
        }

        link.cancel_retry();
        link.release_engine().await;
        if link.stream_id.take().is_some() {
            self.emit(PeerEvent::StreamRemoved { remote });
        }

        let engine = match self.spawn_engine(&mut link) {
            Ok(engine) => engine,
            Err(e) => return self.abandon(&mut link, e).await,
        };
        if let Err(e) = engine.set_remote_description(offer).await {
            return self.abandon(&mut link, e).await;
        }
        link.remote_description_set = true;
        self.flush_candidates(&mut link, &engine).await;

        let media = self.outgoing_media().await;
        let answered: anyhow::Result<Value> = async {
            engine.add_local_tracks(&media).await?;
            let answer = engine.create_answer().await?;
            engine.set_local_description(answer.clone()).await?;
            Ok(answer)
        }
        .await;

        match answered {
            Ok(answer) => {
                self.signaling
                    .deliver(ClientMessage::signal(SignalKind::Answer, remote, answer));
                self.set_state(&mut link, LinkState::Connected);
            }
            Err(e) => self.abandon(&mut link, e).await,
        }
    }

    /// Answer to our offer. Anything but a link awaiting an answer ignores it.
    pub async fn on_answer(&self, remote: ParticipantId, answer: Value) {
        let Some(link) = self.link(&remote).await else {
            tracing::debug!(remote = %remote.short(), "answer for unknown link ignored");
            return;
        };
        let mut link = link.lock().await;
        if link.state != LinkState::AwaitingAnswer {
            let state = link.state;
            self.conflict(&link, state, "answer");
            return;
        }
        let Some(engine) = link.engine.clone() else {
            return;
        };
        if let Err(e) = engine.set_remote_description(answer).await {
            return self.abandon(&mut link, e).await;
        }
        link.remote_description_set = true;
        self.flush_candidates(&mut link, &engine).await;
        self.set_state(&mut link, LinkState::Connected);
    }

    /// Remote candidate: applied once a remote description is in place,
    /// buffered in arrival order until then.
    pub async fn on_candidate(&self, remote: ParticipantId, candidate: Value) {
        let Some(link) = self.link(&remote).await else {
            tracing::debug!(remote = %remote.short(), "candidate for unknown link ignored");
            return;
        };
        let mut link = link.lock().await;
        if link.state.is_terminal() {
            return;
        }
        match (&link.engine, link.remote_description_set) {
            (Some(engine), true) => {
                if let Err(e) = engine.add_ice_candidate(candidate).await {
                    tracing::warn!(remote = %remote.short(), "failed to add candidate: {}", e);
                }
            }
            _ => link.pending_candidates.push(candidate),
        }
    }

    /// Callback from one of our engines.
    pub async fn handle_engine_event(self: &Arc<Self>, tag: EngineTag, event: EngineEvent) {
        let Some(link) = self.link(&tag.remote).await else {
            return;
        };
        let mut link = link.lock().await;
        if link.generation != tag.generation || link.engine.is_none() {
            tracing::trace!(remote = %tag.remote.short(), "event from released engine dropped");
            return;
        }
        let remote = link.remote;

        match event {
            EngineEvent::IceCandidate(candidate) => {
                self.signaling
                    .deliver(ClientMessage::signal(SignalKind::Candidate, remote, candidate));
            }
            EngineEvent::Track { stream_id, .. } => {
                // one stream per link, however many tracks ride on it
                if link.stream_id.is_none() {
                    link.stream_id = Some(stream_id.clone());
                    self.emit(PeerEvent::StreamAdded { remote, stream_id });
                }
            }
            EngineEvent::TrackMuted {
                kind: TrackKind::Video,
                muted,
            } => {
                link.video_muted = muted;
                self.emit(PeerEvent::VideoMuted { remote, muted });
            }
            EngineEvent::TrackEnded {
                kind: TrackKind::Video,
            } => {
                link.video_muted = true;
                self.emit(PeerEvent::VideoMuted {
                    remote,
                    muted: true,
                });
            }
            EngineEvent::TrackMuted { .. } | EngineEvent::TrackEnded { .. } => {}
            EngineEvent::IceConnectionState(Connectivity::Failed) => {
                tracing::info!(remote = %remote.short(), "ICE failed, restarting");
                if let Some(engine) = link.engine.clone() {
                    if let Err(e) = engine.restart_ice().await {
                        tracing::warn!(remote = %remote.short(), "ICE restart failed: {}", e);
                    }
                }
            }
            EngineEvent::IceConnectionState(Connectivity::Connected)
            | EngineEvent::ConnectionState(Connectivity::Connected) => {
                if link.state == LinkState::Connected && !link.established {
                    link.established = true;
                    link.attempts = 0;
                    tracing::info!(remote = %remote.short(), "peer connected");
                    self.emit(PeerEvent::Established { remote });
                }
            }
            EngineEvent::ConnectionState(Connectivity::Failed) => {
                self.connectivity_lost(&mut link).await;
            }
            EngineEvent::IceConnectionState(state) | EngineEvent::ConnectionState(state) => {
                tracing::trace!(remote = %remote.short(), %state, "connectivity changed");
            }
        }
    }

    /// Tear down the link to `remote`. Returns `false` if there was none.
    pub async fn close(&self, remote: ParticipantId) -> bool {
        let link = self.links.lock().await.remove(&remote);
        let Some(link) = link else {
            return false;
        };
        let mut link = link.lock().await;
        self.shutdown(&mut link).await;
        true
    }

    /// Tear down every link, e.g. when the room ends.
    pub async fn close_all(&self) -> usize {
        let links: Vec<_> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        let count = links.len();
        for link in links {
            let mut link = link.lock().await;
            self.shutdown(&mut link).await;
        }
        count
    }

    async fn swap_video(&self, track: Option<LocalTrack>) -> usize {
        {
            let mut outgoing = self.outgoing.lock().await;
            let next = outgoing.with_video(track.clone());
            *outgoing = next;
        }

        let links: Vec<_> = self.links.lock().await.values().cloned().collect();
        let mut swapped = 0;
        for link in links {
            let link = link.lock().await;
            let Some(engine) = link.engine.clone() else {
                continue;
            };
            match engine.replace_video_track(track.as_ref()).await {
                Ok(()) => swapped += 1,
                Err(e) => {
                    tracing::warn!(remote = %link.remote.short(), "failed to switch video: {}", e);
                }
            }
        }
        swapped
    }

    async fn link(&self, remote: &ParticipantId) -> Option<Arc<Mutex<PeerLink>>> {
        self.links.lock().await.get(remote).cloned()
    }

    async fn link_or_insert(&self, remote: ParticipantId) -> (Arc<Mutex<PeerLink>>, bool) {
        let mut links = self.links.lock().await;
        let mut created = false;
        let link = links
            .entry(remote)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(PeerLink::new(remote)))
            })
            .clone();
        (link, created)
    }

    fn spawn_engine(&self, link: &mut PeerLink) -> anyhow::Result<Arc<dyn NegotiationEngine>> {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let tag = EngineTag {
            remote: link.remote,
            generation,
        };
        let engine = self
            .engines
            .create(EngineEvents::new(tag, self.engine_tx.clone()))?;
        link.generation = generation;
        link.engine = Some(engine.clone());
        Ok(engine)
    }

    async fn offer(self: &Arc<Self>, link: &mut PeerLink) -> bool {
        self.set_state(link, LinkState::Offering);
        let engine = match self.spawn_engine(link) {
            Ok(engine) => engine,
            Err(e) => {
                self.abandon(link, e).await;
                return false;
            }
        };

        let media = self.outgoing_media().await;
        let offered: anyhow::Result<Value> = async {
            engine.add_local_tracks(&media).await?;
            let offer = engine.create_offer().await?;
            engine.set_local_description(offer.clone()).await?;
            Ok(offer)
        }
        .await;

        match offered {
            Ok(offer) => {
                self.signaling
                    .deliver(ClientMessage::signal(SignalKind::Offer, link.remote, offer));
                self.set_state(link, LinkState::AwaitingAnswer);
                true
            }
            Err(e) => {
                self.abandon(link, e).await;
                false
            }
        }
    }

    async fn flush_candidates(&self, link: &mut PeerLink, engine: &Arc<dyn NegotiationEngine>) {
        let pending = std::mem::take(&mut link.pending_candidates);
        if !pending.is_empty() {
            tracing::debug!(remote = %link.remote.short(), count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            if let Err(e) = engine.add_ice_candidate(candidate).await {
                tracing::warn!(remote = %link.remote.short(), "failed to add candidate: {}", e);
            }
        }
    }

    async fn connectivity_lost(self: &Arc<Self>, link: &mut PeerLink) {
        if !matches!(link.state, LinkState::Connected | LinkState::AwaitingAnswer) {
            return;
        }
        let remote = link.remote;
        tracing::warn!(
            remote = %remote.short(),
            "{}",
            SignalError::ConnectivityLost(remote)
        );

        link.release_engine().await;
        link.pending_candidates.clear();
        if link.stream_id.take().is_some() {
            self.emit(PeerEvent::StreamRemoved { remote });
        }

        if !(self.is_host() || self.policy.non_host_retries) {
            // the host, or the remote itself, re-offers
            self.set_state(link, LinkState::Reconnecting);
            return;
        }
        if link.attempts >= self.policy.max_attempts {
            tracing::warn!(remote = %remote.short(), attempts = link.attempts, "giving up on peer");
            self.set_state(link, LinkState::Failed);
            self.emit(PeerEvent::Dropped { remote });
            return;
        }

        link.attempts += 1;
        self.set_state(link, LinkState::Reconnecting);

        let this = Arc::clone(self);
        let delay = self.policy.delay();
        link.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry(remote).await;
        }));
    }

    async fn retry(self: &Arc<Self>, remote: ParticipantId) {
        let Some(link) = self.link(&remote).await else {
            return;
        };
        let mut link = link.lock().await;
        link.retry = None;
        if link.state != LinkState::Reconnecting {
            return;
        }
        tracing::info!(remote = %remote.short(), attempt = link.attempts, "re-offering");
        self.offer(&mut link).await;
    }

    /// Unrecoverable negotiation error: release everything and report the peer dropped.
    async fn abandon(&self, link: &mut PeerLink, err: anyhow::Error) {
        tracing::warn!(remote = %link.remote.short(), state = %link.state, "negotiation failed: {:#}", err);
        link.cancel_retry();
        link.release_engine().await;
        link.pending_candidates.clear();
        self.set_state(link, LinkState::Failed);
        self.emit(PeerEvent::Dropped {
            remote: link.remote,
        });
    }

    async fn shutdown(&self, link: &mut PeerLink) {
        if link.state == LinkState::Closed {
            return;
        }
        link.cancel_retry();
        link.release_engine().await;
        link.pending_candidates.clear();
        if link.stream_id.take().is_some() {
            self.emit(PeerEvent::StreamRemoved {
                remote: link.remote,
            });
        }
        self.set_state(link, LinkState::Closed);
        tracing::debug!(remote = %link.remote.short(), "link closed");
    }

    fn set_state(&self, link: &mut PeerLink, state: LinkState) {
        if link.state == state {
            return;
        }
        tracing::debug!(remote = %link.remote.short(), from = %link.state, to = %state, "link state");
        link.state = state;
        self.emit(PeerEvent::StateChanged {
            remote: link.remote,
            state,
        });
    }

    fn conflict(&self, link: &PeerLink, state: LinkState, event: &'static str) {
        let err = SignalError::NegotiationConflict {
            state: state.as_str(),
            event,
        };
        tracing::debug!(remote = %link.remote.short(), "ignored: {}", err);
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}
