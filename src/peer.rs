//! Peer session - the single owner of the live peer connection
//!
//! Translates call intents into transport primitives and reports transport
//! events upward. Negotiation failures are never retried here; the state
//! machine above decides what a failed connection means for the call.

use crate::error::{Error, Result};
use crate::media::{CameraFacing, LocalMedia, LocalTrack, MediaSource, RemoteStream, TrackKind};
use crate::IceServer;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    New,
    HasLocalStream,
    HasOffer,
    HasAnswer,
    Negotiating,
    Connected,
    Closed,
}

/// Transport events reported upward. The receiver forwards local candidates
/// through the relay and maps connection-state changes onto the call.
pub enum PeerEvent {
    LocalIceCandidate(RTCIceCandidateInit),
    RemoteTrack(Arc<TrackRemote>),
    ConnectionState(RTCPeerConnectionState),
}

/// Owns one peer connection and the local/remote media handles attached to
/// it. At most one session is open at a time; the call manager force-closes
/// the previous one before opening the next.
pub struct PeerSession {
    media: Arc<dyn MediaSource>,
    ice_servers: Vec<IceServer>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    phase: Arc<Mutex<PeerPhase>>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    local: Mutex<Option<LocalMedia>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    // Candidates that arrived before the remote description was set. They
    // are applied in arrival order the moment the description lands;
    // feeding a candidate to the transport any earlier fails negotiation.
    pending_ice: Mutex<Vec<RTCIceCandidateInit>>,
    remote_desc_set: AtomicBool,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(
        media: Arc<dyn MediaSource>,
        ice_servers: Vec<IceServer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            media,
            ice_servers,
            events_tx,
            phase: Arc::new(Mutex::new(PeerPhase::New)),
            pc: Mutex::new(None),
            local: Mutex::new(None),
            video_sender: Mutex::new(None),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
            pending_ice: Mutex::new(Vec::new()),
            remote_desc_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        (session, events_rx)
    }

    pub fn phase(&self) -> PeerPhase {
        *self.phase.lock()
    }

    pub fn local_media(&self) -> Option<LocalMedia> {
        self.local.lock().clone()
    }

    pub fn remote_stream(&self) -> RemoteStream {
        RemoteStream::new(self.remote_tracks.lock().clone())
    }

    /// Number of remote candidates still waiting for the remote description.
    pub fn queued_candidates(&self) -> usize {
        self.pending_ice.lock().len()
    }

    /// Requests device capture. A device failure is fatal to the attempt and
    /// surfaces as-is; there is no retry at this level.
    pub async fn acquire_local_media(&self, video: bool, audio: bool) -> Result<LocalMedia> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }

        let mut tracks = Vec::new();
        if audio {
            tracks.push(self.media.open_audio().await?);
        }
        if video {
            tracks.push(self.media.open_video(CameraFacing::Front).await?);
        }
        if tracks.is_empty() {
            return Err(Error::Device("no media requested".to_string()));
        }

        let media = LocalMedia::new(tracks);
        *self.local.lock() = Some(media.clone());
        *self.phase.lock() = PeerPhase::HasLocalStream;

        Ok(media)
    }

    async fn build_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone(),
                credential: s.credential.clone(),
                ..Default::default()
            })
            .collect();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let tx = self.events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalIceCandidate(init));
                    }
                    Err(e) => log::warn!("local candidate serialization failed: {}", e),
                }
            })
        }));

        let tx = self.events_tx.clone();
        let remote_tracks = self.remote_tracks.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let remote_tracks = remote_tracks.clone();
            Box::pin(async move {
                log::debug!("remote track arrived");
                remote_tracks.lock().push(track.clone());
                let _ = tx.send(PeerEvent::RemoteTrack(track));
            })
        }));

        let tx = self.events_tx.clone();
        let phase = self.phase.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let phase = phase.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Connected {
                    *phase.lock() = PeerPhase::Connected;
                }
                let _ = tx.send(PeerEvent::ConnectionState(state));
            })
        }));

        let local = self
            .local
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("local media not acquired".to_string()))?;
        for track in local.tracks() {
            let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp();
            let sender = pc.add_track(rtp).await?;
            if track.kind() == TrackKind::Video {
                *self.video_sender.lock() = Some(sender);
            }
        }

        Ok(pc)
    }

    /// Builds the peer connection and generates an offer. Must run before
    /// any remote description exists.
    pub async fn create_offer(&self) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.pc.lock().is_some() {
            return Err(Error::InvalidState(
                "peer connection already exists".to_string(),
            ));
        }

        let pc = self.build_connection().await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        *self.pc.lock() = Some(pc);
        *self.phase.lock() = PeerPhase::HasOffer;

        Ok(offer.sdp)
    }

    /// Builds the peer connection, applies the remote offer and generates
    /// the answer. Candidates queued before this point are applied as soon
    /// as the remote description is in place.
    pub async fn create_answer(&self, remote_offer_sdp: String) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if self.pc.lock().is_some() {
            return Err(Error::InvalidState(
                "peer connection already exists".to_string(),
            ));
        }

        let pc = self.build_connection().await?;
        let offer = RTCSessionDescription::offer(remote_offer_sdp)?;
        pc.set_remote_description(offer).await?;
        *self.pc.lock() = Some(pc.clone());
        self.remote_desc_set.store(true, Ordering::SeqCst);
        self.drain_pending(&pc).await;

        let answer = pc.create_answer(None).await?;
        *self.phase.lock() = PeerPhase::HasAnswer;
        pc.set_local_description(answer.clone()).await?;
        *self.phase.lock() = PeerPhase::Negotiating;

        Ok(answer.sdp)
    }

    /// Valid only after `create_offer`. Sets the remote description and
    /// drains the pending candidate queue.
    pub async fn apply_remote_answer(&self, answer_sdp: String) -> Result<()> {
        let pc = self
            .pc
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidState("no peer connection".to_string()))?;

        let answer = RTCSessionDescription::answer(answer_sdp)?;
        pc.set_remote_description(answer).await?;
        self.remote_desc_set.store(true, Ordering::SeqCst);
        *self.phase.lock() = PeerPhase::Negotiating;
        self.drain_pending(&pc).await;

        Ok(())
    }

    /// Applies the candidate immediately when the remote description is
    /// already set, otherwise queues it for the drain.
    pub async fn ingest_remote_ice(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.remote_desc_set.load(Ordering::SeqCst) {
            let pc = self.pc.lock().clone();
            if let Some(pc) = pc {
                pc.add_ice_candidate(candidate).await?;
            }
            return Ok(());
        }

        self.pending_ice.lock().push(candidate);
        Ok(())
    }

    async fn drain_pending(&self, pc: &Arc<RTCPeerConnection>) {
        let queued: Vec<_> = std::mem::take(&mut *self.pending_ice.lock());
        for candidate in queued {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                log::warn!("buffered candidate rejected: {}", e);
            }
        }
    }

    /// Returns the new muted state; false when there is no audio track.
    pub fn toggle_mute(&self) -> bool {
        let local = self.local.lock();
        match local.as_ref().and_then(|m| m.audio()) {
            Some(track) => !track.toggle_enabled(),
            None => false,
        }
    }

    /// Returns the new video-disabled state; false when there is no video
    /// track.
    pub fn toggle_video(&self) -> bool {
        let local = self.local.lock();
        match local.as_ref().and_then(|m| m.video()) {
            Some(track) => !track.toggle_enabled(),
            None => false,
        }
    }

    /// Re-acquires local video with the opposite facing and hot-swaps the
    /// outgoing track without renegotiation. Returns None on failure, in
    /// which case the previous track keeps running.
    pub async fn switch_camera(&self) -> Option<Arc<LocalTrack>> {
        let current = self.local.lock().as_ref().and_then(|m| m.video().cloned())?;
        let facing = current
            .facing()
            .map(|f| f.opposite())
            .unwrap_or(CameraFacing::Front);

        let fresh = match self.media.open_video(facing).await {
            Ok(track) => track,
            Err(e) => {
                log::warn!("camera switch failed to open {:?} camera: {}", facing, e);
                return None;
            }
        };
        fresh.set_enabled(current.is_enabled());

        let sender = self.video_sender.lock().clone();
        if let Some(sender) = sender {
            let rtp: Arc<dyn TrackLocal + Send + Sync> = fresh.rtp();
            if let Err(e) = sender.replace_track(Some(rtp)).await {
                log::warn!("camera switch failed to replace track: {}", e);
                fresh.stop();
                return None;
            }
        }

        current.stop();
        if let Some(media) = self.local.lock().as_mut() {
            media.replace_video(fresh.clone());
        }

        Some(fresh)
    }

    /// Stops all local tracks, closes the peer connection and clears the
    /// candidate queue. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(media) = self.local.lock().take() {
            media.stop_all();
        }
        self.pending_ice.lock().clear();
        *self.video_sender.lock() = None;

        let pc = self.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                log::debug!("peer connection close: {}", e);
            }
        }

        *self.phase.lock() = PeerPhase::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StaticMediaSource;

    fn session() -> (Arc<PeerSession>, mpsc::UnboundedReceiver<PeerEvent>) {
        PeerSession::new(Arc::new(StaticMediaSource), Vec::new())
    }

    fn host_candidate(port: u16) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: format!("candidate:1 1 UDP 2122260223 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_offer_requires_local_media() {
        let (caller, _events) = session();
        let result = caller.create_offer().await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let (caller, _caller_events) = session();
        let (callee, _callee_events) = session();

        caller.acquire_local_media(false, true).await.unwrap();
        let offer = caller.create_offer().await.unwrap();
        assert_eq!(caller.phase(), PeerPhase::HasOffer);

        // Candidates arriving before the answer stay queued in order.
        caller.ingest_remote_ice(host_candidate(40000)).await.unwrap();
        caller.ingest_remote_ice(host_candidate(40001)).await.unwrap();
        assert_eq!(caller.queued_candidates(), 2);

        callee.acquire_local_media(false, true).await.unwrap();
        let answer = callee.create_answer(offer).await.unwrap();

        caller.apply_remote_answer(answer).await.unwrap();
        assert_eq!(caller.queued_candidates(), 0);
        assert_eq!(caller.phase(), PeerPhase::Negotiating);

        // With the description in place new candidates apply immediately.
        caller.ingest_remote_ice(host_candidate(40002)).await.unwrap();
        assert_eq!(caller.queued_candidates(), 0);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_answer_side_drains_early_candidates() {
        let (caller, _caller_events) = session();
        let (callee, _callee_events) = session();

        caller.acquire_local_media(true, true).await.unwrap();
        let offer = caller.create_offer().await.unwrap();

        callee.ingest_remote_ice(host_candidate(41000)).await.unwrap();
        assert_eq!(callee.queued_candidates(), 1);

        callee.acquire_local_media(true, true).await.unwrap();
        callee.create_answer(offer).await.unwrap();
        assert_eq!(callee.queued_candidates(), 0);

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_toggles_without_tracks_are_noops() {
        let (session, _events) = session();
        assert!(!session.toggle_mute());
        assert!(!session.toggle_video());
    }

    #[tokio::test]
    async fn test_toggles_report_disabled_state() {
        let (session, _events) = session();
        session.acquire_local_media(true, true).await.unwrap();

        assert!(session.toggle_mute());
        assert!(!session.toggle_mute());
        assert!(session.toggle_video());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_tracks() {
        let (session, _events) = session();
        let media = session.acquire_local_media(true, true).await.unwrap();
        session.create_offer().await.unwrap();

        session.close().await;
        session.close().await;

        assert!(session.is_closed());
        assert_eq!(session.phase(), PeerPhase::Closed);
        assert!(media.tracks().iter().all(|t| !t.is_enabled()));
        assert_eq!(session.queued_candidates(), 0);
    }

    #[tokio::test]
    async fn test_switch_camera_swaps_facing() {
        let (session, _events) = session();
        session.acquire_local_media(true, true).await.unwrap();
        session.create_offer().await.unwrap();

        let old = session.local_media().unwrap().video().cloned().unwrap();
        let fresh = session.switch_camera().await.unwrap();

        assert_eq!(fresh.facing(), Some(CameraFacing::Back));
        assert!(old.is_stopped());
        assert_eq!(
            session.local_media().unwrap().video().unwrap().facing(),
            Some(CameraFacing::Back)
        );

        session.close().await;
    }
}
