//! Local media capture boundary and track handles
//!
//! Device capture itself (camera/microphone enumeration and sampling) lives
//! outside this crate; a `MediaSource` adapts it. Tracks handed out here
//! carry the RTP-side handle plus the enable/stop flags the capture loop is
//! expected to honour.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

impl CameraFacing {
    pub fn opposite(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

/// One captured local track. The capture loop feeding `rtp` must stop
/// writing samples once `is_enabled` is false and shut down once
/// `is_stopped` is set.
pub struct LocalTrack {
    kind: TrackKind,
    facing: Option<CameraFacing>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(
        kind: TrackKind,
        facing: Option<CameraFacing>,
        rtp: Arc<TrackLocalStaticSample>,
    ) -> Self {
        Self {
            kind,
            facing,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn facing(&self) -> Option<CameraFacing> {
        self.facing
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle_enabled(&self) -> bool {
        let enabled = !self.is_enabled();
        self.set_enabled(enabled);
        enabled
    }

    /// Stops the track for good. A stopped track is never enabled.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }
}

/// The set of local tracks captured for one session.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn replace_video(&mut self, track: Arc<LocalTrack>) {
        self.tracks.retain(|t| t.kind() != TrackKind::Video);
        self.tracks.push(track);
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Remote tracks that have arrived over the peer connection, in arrival
/// order.
#[derive(Clone, Default)]
pub struct RemoteStream {
    tracks: Vec<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn new(tracks: Vec<Arc<TrackRemote>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<TrackRemote>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Adapter over the platform capture primitives. Failures (permission
/// denied, device busy, no device) surface as `Error::Device` and are fatal
/// to the session attempt; nothing here retries.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open_audio(&self) -> Result<Arc<LocalTrack>>;

    async fn open_video(&self, facing: CameraFacing) -> Result<Arc<LocalTrack>>;
}

/// Media source producing detached static-sample tracks without touching
/// any capture device. Used by tests and headless deployments.
pub struct StaticMediaSource;

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn open_audio(&self) -> Result<Arc<LocalTrack>> {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "wavecall".to_owned(),
        ));
        Ok(Arc::new(LocalTrack::new(TrackKind::Audio, None, rtp)))
    }

    async fn open_video(&self, facing: CameraFacing) -> Result<Arc<LocalTrack>> {
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "wavecall".to_owned(),
        ));
        Ok(Arc::new(LocalTrack::new(TrackKind::Video, Some(facing), rtp)))
    }
}
