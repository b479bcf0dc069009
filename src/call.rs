//! Call state machine - the single source of truth for the local call
//!
//! One manager per logged-in user. It owns the inbound signal subscription
//! (opened once, kept across calls), drives the peer session, and enforces
//! the single-active-call rule: `start_call` outside Idle is rejected and
//! an inbound offer while busy gets a busy reply instead of a second
//! session.

use crate::error::{Error, Result};
use crate::media::{LocalMedia, LocalTrack, MediaSource, RemoteStream};
use crate::models::*;
use crate::peer::{PeerEvent, PeerSession};
use crate::relay::SignalingRelay;
use crate::CallConfig;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::track::track_remote::TrackRemote;

/// Directory lookup for the other party's display info. Best-effort; a
/// lookup failure never aborts a call.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<RemoteProfile>;
}

/// Events pushed to UI subscribers. Subscribe as many receivers as needed;
/// dropping a receiver unregisters it.
#[derive(Clone)]
pub enum CallEvent {
    PhaseChanged {
        call_id: Option<String>,
        phase: CallPhase,
    },
    IncomingCall {
        call_id: String,
        caller: RemoteProfile,
        mode: CallMode,
    },
    RemoteTrackAdded {
        call_id: String,
        track: Arc<TrackRemote>,
    },
    DurationTick {
        call_id: String,
        seconds: i64,
    },
    CallEnded {
        call_id: String,
        reason: EndReason,
    },
}

/// What a successful `start_call` hands back to the UI.
pub struct OutgoingCall {
    pub call_id: String,
    pub local_media: LocalMedia,
}

struct PendingOffer {
    signal_id: String,
    sdp: String,
}

struct Session {
    phase: CallPhase,
    call_id: Option<String>,
    mode: Option<CallMode>,
    remote_user_id: Option<String>,
    remote_profile: Option<RemoteProfile>,
    pending_offer: Option<PendingOffer>,
    // Candidates that arrive while ringing, before the peer session exists.
    early_ice: Vec<RTCIceCandidateInit>,
    started_at: Option<i64>,
    duration_seconds: i64,
    muted: bool,
    video_disabled: bool,
    speaker_on: bool,
    last_error: Option<String>,
    // Bumped on every reset to Idle; in-flight async steps compare it
    // before touching anything.
    epoch: u64,
}

impl Session {
    fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            mode: None,
            remote_user_id: None,
            remote_profile: None,
            pending_offer: None,
            early_ice: Vec::new(),
            started_at: None,
            duration_seconds: 0,
            muted: false,
            video_disabled: false,
            speaker_on: false,
            last_error: None,
            epoch: 0,
        }
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.phase = CallPhase::Idle;
        self.call_id = None;
        self.mode = None;
        self.remote_user_id = None;
        self.remote_profile = None;
        self.pending_offer = None;
        self.early_ice.clear();
        self.started_at = None;
        self.duration_seconds = 0;
        self.muted = false;
        self.video_disabled = false;
        self.speaker_on = false;
        // last_error stays visible until the next call starts
    }
}

fn closing_status(phase: CallPhase, reason: EndReason) -> CallStatus {
    match reason {
        EndReason::Rejected => CallStatus::Rejected,
        EndReason::Busy => CallStatus::Failed,
        EndReason::Timeout => CallStatus::Missed,
        EndReason::ConnectionFailed => {
            if phase == CallPhase::Connected {
                CallStatus::Ended
            } else {
                CallStatus::Failed
            }
        }
        EndReason::Hangup => {
            if phase == CallPhase::Ringing {
                CallStatus::Missed
            } else {
                CallStatus::Ended
            }
        }
    }
}

fn take_if<T>(slot: &Mutex<Option<(u64, T)>>, epoch: u64) -> Option<T> {
    let mut guard = slot.lock();
    if matches!(guard.as_ref(), Some((e, _)) if *e == epoch) {
        guard.take().map(|(_, v)| v)
    } else {
        None
    }
}

struct Inner {
    config: CallConfig,
    relay: Arc<SignalingRelay>,
    media: Arc<dyn MediaSource>,
    profiles: Option<Arc<dyn ProfileSource>>,
    session: RwLock<Session>,
    // Serializes caller-initiated operations so a second start/answer can
    // never interleave with one already in flight.
    op_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CallEvent>,
    peer: Mutex<Option<(u64, Arc<PeerSession>)>>,
    pump: Mutex<Option<(u64, JoinHandle<()>)>>,
    timer: Mutex<Option<(u64, JoinHandle<()>)>>,
    timeout: Mutex<Option<(u64, JoinHandle<()>)>>,
}

/// The component the surrounding UI talks to.
pub struct CallManager {
    inner: Arc<Inner>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl CallManager {
    /// Builds the manager and opens the inbound signal subscription for
    /// `config.local_user_id`. Must run inside a tokio runtime.
    pub fn new(
        config: CallConfig,
        relay: Arc<SignalingRelay>,
        media: Arc<dyn MediaSource>,
        profiles: Option<Arc<dyn ProfileSource>>,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        let mut subscription = relay.subscribe_inbound(&config.local_user_id, config.backoff);

        let inner = Arc::new(Inner {
            config,
            relay,
            media,
            profiles,
            session: RwLock::new(Session::new()),
            op_lock: tokio::sync::Mutex::new(()),
            events,
            peer: Mutex::new(None),
            pump: Mutex::new(None),
            timer: Mutex::new(None),
            timeout: Mutex::new(None),
        });

        let dispatch_inner = inner.clone();
        let dispatch = tokio::spawn(async move {
            while let Some(signal) = subscription.recv().await {
                dispatch_inner.handle_signal(signal).await;
            }
            log::debug!("inbound signal subscription ended");
        });

        Self {
            inner,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let s = self.inner.session.read();
        CallSnapshot {
            phase: s.phase,
            call_id: s.call_id.clone(),
            mode: s.mode,
            local_user_id: self.inner.config.local_user_id.clone(),
            remote_user_id: s.remote_user_id.clone(),
            remote_profile: s.remote_profile.clone(),
            started_at: s.started_at,
            duration_seconds: s.duration_seconds,
            muted: s.muted,
            video_disabled: s.video_disabled,
            speaker_on: s.speaker_on,
            last_error: s.last_error.clone(),
        }
    }

    /// Starts an outgoing call. Rejected outside Idle; on any failure in
    /// the setup sequence the session is back in Idle with all acquired
    /// resources released before the error is returned.
    pub async fn start_call(&self, remote_user_id: &str, mode: CallMode) -> Result<OutgoingCall> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (call_id, epoch) = {
            let mut s = inner.session.write();
            if s.phase != CallPhase::Idle {
                return Err(Error::AlreadyInCall);
            }
            let call_id = uuid::Uuid::new_v4().to_string();
            s.phase = CallPhase::Calling;
            s.call_id = Some(call_id.clone());
            s.mode = Some(mode);
            s.remote_user_id = Some(remote_user_id.to_string());
            s.last_error = None;
            (call_id, s.epoch)
        };
        log::info!("starting {:?} call {} to {}", mode, call_id, remote_user_id);
        inner.emit_phase(Some(&call_id), CallPhase::Calling);

        inner.lookup_profile(remote_user_id, epoch).await;

        let (peer, peer_events) = inner.open_peer(epoch).await;
        let local_media = match peer.acquire_local_media(mode.has_video(), true).await {
            Ok(media) => media,
            Err(e) => return inner.abort_setup(epoch, None, e).await,
        };
        if !inner.epoch_is(epoch) {
            // the call was torn down while capture was in flight
            peer.close().await;
            return Err(Error::Closed);
        }

        let offer_sdp = match peer.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => return inner.abort_setup(epoch, None, e).await,
        };

        if let Err(e) = inner
            .relay
            .create_call(&inner.config.local_user_id, remote_user_id, &call_id, mode)
            .await
        {
            return inner.abort_setup(epoch, None, e).await;
        }

        let payload = SignalPayload::Offer {
            sdp: offer_sdp,
            mode,
        };
        if let Err(e) = inner
            .relay
            .send_signal(&call_id, &inner.config.local_user_id, remote_user_id, payload)
            .await
        {
            return inner.abort_setup(epoch, Some(&call_id), e).await;
        }

        inner.spawn_pump(peer_events, &call_id, remote_user_id, epoch);
        inner.arm_setup_timeout(epoch);

        Ok(OutgoingCall {
            call_id,
            local_media,
        })
    }

    /// Answers the ringing call: acquires media matching the offer's mode,
    /// sends the answer, consumes the stored offer and marks the record
    /// answered. The duration timer starts later, on the transport's
    /// connected event.
    pub async fn answer_call(&self) -> Result<LocalMedia> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (epoch, call_id, remote_user_id, mode, offer) = {
            let mut s = inner.session.write();
            if s.phase != CallPhase::Ringing {
                return Err(Error::InvalidState(format!(
                    "cannot answer from {:?}",
                    s.phase
                )));
            }
            let offer = match s.pending_offer.take() {
                Some(offer) => offer,
                None => return Err(Error::InvalidState("no stored offer".to_string())),
            };
            s.phase = CallPhase::Connecting;
            (
                s.epoch,
                s.call_id.clone().unwrap_or_default(),
                s.remote_user_id.clone().unwrap_or_default(),
                s.mode.unwrap_or(CallMode::Voice),
                offer,
            )
        };
        log::info!("answering call {}", call_id);
        inner.emit_phase(Some(&call_id), CallPhase::Connecting);

        let (peer, peer_events) = inner.open_peer(epoch).await;
        let local_media = match peer.acquire_local_media(mode.has_video(), true).await {
            Ok(media) => media,
            Err(e) => return inner.abort_answer(epoch, &call_id, &remote_user_id, e).await,
        };
        if !inner.epoch_is(epoch) {
            peer.close().await;
            return Err(Error::Closed);
        }

        // Candidates that arrived while ringing go into the peer queue
        // first, so the whole set is applied in arrival order once the
        // remote description lands.
        let early = {
            let mut s = inner.session.write();
            if s.epoch == epoch {
                std::mem::take(&mut s.early_ice)
            } else {
                Vec::new()
            }
        };
        for candidate in early {
            if let Err(e) = peer.ingest_remote_ice(candidate).await {
                log::warn!("early candidate for {} rejected: {}", call_id, e);
            }
        }

        let answer_sdp = match peer.create_answer(offer.sdp).await {
            Ok(sdp) => sdp,
            Err(e) => return inner.abort_answer(epoch, &call_id, &remote_user_id, e).await,
        };

        if let Err(e) = inner
            .relay
            .send_signal(
                &call_id,
                &inner.config.local_user_id,
                &remote_user_id,
                SignalPayload::Answer { sdp: answer_sdp },
            )
            .await
        {
            return inner.abort_answer(epoch, &call_id, &remote_user_id, e).await;
        }

        inner.spawn_pump(peer_events, &call_id, &remote_user_id, epoch);

        // The offer is consumed; a redelivery must not ring again. Failure
        // here is tolerable since redeliveries are ignored by state anyway.
        inner.mark_processed_quietly(&offer.signal_id).await;

        if let Err(e) = inner
            .relay
            .update_call_status(&call_id, CallStatus::Answered, None)
            .await
        {
            return inner.abort_answer(epoch, &call_id, &remote_user_id, e).await;
        }

        Ok(local_media)
    }

    /// Declines the ringing call. Internal failures are logged and
    /// swallowed: the local user has already dismissed the call, so the
    /// session always lands back in Idle.
    pub async fn reject_call(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (epoch, offer_id) = {
            let s = inner.session.read();
            if s.phase != CallPhase::Ringing {
                log::debug!("reject outside ringing ignored");
                return Ok(());
            }
            (s.epoch, s.pending_offer.as_ref().map(|o| o.signal_id.clone()))
        };

        if let Some(signal_id) = offer_id {
            inner.mark_processed_quietly(&signal_id).await;
        }
        inner.finish_call(epoch, EndReason::Rejected, true).await;
        Ok(())
    }

    /// Hangs up. A no-op from Idle; from Ringing it behaves like a reject.
    pub async fn end_call(&self) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (epoch, phase, offer_id) = {
            let s = inner.session.read();
            (
                s.epoch,
                s.phase,
                s.pending_offer.as_ref().map(|o| o.signal_id.clone()),
            )
        };

        match phase {
            CallPhase::Idle | CallPhase::Ended => Ok(()),
            CallPhase::Ringing => {
                if let Some(signal_id) = offer_id {
                    inner.mark_processed_quietly(&signal_id).await;
                }
                inner.finish_call(epoch, EndReason::Rejected, true).await;
                Ok(())
            }
            _ => {
                inner.finish_call(epoch, EndReason::Hangup, true).await;
                Ok(())
            }
        }
    }

    /// Returns the new muted state; false when no call or audio track.
    pub fn toggle_mute(&self) -> bool {
        let peer = self.inner.current_peer_any();
        let Some(peer) = peer else { return false };
        let muted = peer.toggle_mute();
        self.inner.session.write().muted = muted;
        muted
    }

    /// Returns the new video-disabled state; false when no call or video
    /// track.
    pub fn toggle_video(&self) -> bool {
        let peer = self.inner.current_peer_any();
        let Some(peer) = peer else { return false };
        let disabled = peer.toggle_video();
        self.inner.session.write().video_disabled = disabled;
        disabled
    }

    pub fn set_speaker(&self, on: bool) -> bool {
        self.inner.session.write().speaker_on = on;
        on
    }

    pub async fn switch_camera(&self) -> Option<Arc<LocalTrack>> {
        let peer = self.inner.current_peer_any()?;
        peer.switch_camera().await
    }

    pub fn local_media(&self) -> Option<LocalMedia> {
        self.inner.current_peer_any().and_then(|p| p.local_media())
    }

    pub fn remote_stream(&self) -> RemoteStream {
        self.inner
            .current_peer_any()
            .map(|p| p.remote_stream())
            .unwrap_or_default()
    }

    pub async fn call_history(&self) -> Result<Vec<CallRecord>> {
        self.inner
            .relay
            .call_history(&self.inner.config.local_user_id)
            .await
    }

    /// Ends any active call and closes the inbound subscription.
    pub async fn shutdown(&self) {
        let epoch = self.inner.session.read().epoch;
        self.inner
            .finish_call(epoch, EndReason::Hangup, true)
            .await;
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
        for slot in [&self.inner.pump, &self.inner.timer, &self.inner.timeout] {
            if let Some((_, handle)) = slot.lock().take() {
                handle.abort();
            }
        }
    }
}

enum OfferVerdict {
    Ring(u64),
    Duplicate,
    Busy,
}

impl Inner {
    fn emit_phase(&self, call_id: Option<&str>, phase: CallPhase) {
        let _ = self.events.send(CallEvent::PhaseChanged {
            call_id: call_id.map(|s| s.to_string()),
            phase,
        });
    }

    fn epoch_is(&self, epoch: u64) -> bool {
        self.session.read().epoch == epoch
    }

    fn current_peer(&self, epoch: u64) -> Option<Arc<PeerSession>> {
        let guard = self.peer.lock();
        match guard.as_ref() {
            Some((e, peer)) if *e == epoch => Some(peer.clone()),
            _ => None,
        }
    }

    fn current_peer_any(&self) -> Option<Arc<PeerSession>> {
        self.peer.lock().as_ref().map(|(_, peer)| peer.clone())
    }

    async fn mark_processed_quietly(&self, signal_id: &str) {
        if let Err(e) = self.relay.mark_processed(signal_id).await {
            log::debug!("signal {} not marked processed: {}", signal_id, e);
        }
    }

    async fn lookup_profile(self: &Arc<Self>, user_id: &str, epoch: u64) -> RemoteProfile {
        let profile = match &self.profiles {
            Some(profiles) => match profiles.fetch_profile(user_id).await {
                Ok(profile) => profile,
                Err(e) => {
                    log::debug!("profile lookup for {} failed: {}", user_id, e);
                    RemoteProfile::bare(user_id)
                }
            },
            None => RemoteProfile::bare(user_id),
        };

        let mut s = self.session.write();
        if s.epoch == epoch {
            s.remote_profile = Some(profile.clone());
        }
        profile
    }

    /// Creates the peer session for this call, force-closing any leftover
    /// one. The returned event receiver buffers transport events until the
    /// pump is started with `spawn_pump`.
    async fn open_peer(&self, epoch: u64) -> (Arc<PeerSession>, mpsc::UnboundedReceiver<PeerEvent>) {
        let stale = self.peer.lock().take();
        if let Some((_, stale)) = stale {
            log::warn!("closing leftover peer session");
            stale.close().await;
        }

        let (peer, events) = PeerSession::new(self.media.clone(), self.config.ice_servers.clone());
        *self.peer.lock() = Some((epoch, peer.clone()));

        (peer, events)
    }

    /// Starts relaying transport events. Deliberately deferred until the
    /// offer/answer signal has been sent, so trickled candidates can never
    /// reach the store before the description they belong to.
    fn spawn_pump(
        self: &Arc<Self>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        call_id: &str,
        remote_user_id: &str,
        epoch: u64,
    ) {
        let pump = tokio::spawn(peer_pump(
            self.clone(),
            events,
            call_id.to_string(),
            remote_user_id.to_string(),
            epoch,
        ));
        if let Some((_, old)) = self.pump.lock().replace((epoch, pump)) {
            old.abort();
        }
    }

    fn arm_setup_timeout(self: &Arc<Self>, epoch: u64) {
        let inner = self.clone();
        let timeout = self.config.setup_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let s = inner.session.read();
                s.epoch == epoch
                    && matches!(
                        s.phase,
                        CallPhase::Calling | CallPhase::Ringing | CallPhase::Connecting
                    )
            };
            if expired {
                log::info!("call setup timed out");
                inner.finish_call(epoch, EndReason::Timeout, true).await;
            }
        });
        *self.timeout.lock() = Some((epoch, handle));
    }

    fn start_timer(self: &Arc<Self>, call_id: String, epoch: u64) {
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                let seconds = {
                    let mut s = inner.session.write();
                    if s.epoch != epoch || s.phase != CallPhase::Connected {
                        None
                    } else {
                        s.duration_seconds += 1;
                        Some(s.duration_seconds)
                    }
                };
                match seconds {
                    Some(seconds) => {
                        let _ = inner.events.send(CallEvent::DurationTick {
                            call_id: call_id.clone(),
                            seconds,
                        });
                    }
                    None => break,
                }
            }
        });
        *self.timer.lock() = Some((epoch, handle));
    }

    fn on_transport_connected(self: &Arc<Self>, call_id: &str, epoch: u64) {
        {
            let mut s = self.session.write();
            if s.epoch != epoch || s.phase != CallPhase::Connecting {
                return;
            }
            s.phase = CallPhase::Connected;
            s.started_at = Some(chrono::Utc::now().timestamp_millis());
            s.duration_seconds = 0;
        }
        log::info!("call {} connected", call_id);
        self.emit_phase(Some(call_id), CallPhase::Connected);
        if let Some(handle) = take_if(&self.timeout, epoch) {
            handle.abort();
        }
        self.start_timer(call_id.to_string(), epoch);
    }

    /// Common teardown for hangup, reject, timeout, busy refusal on the
    /// caller side, remote call-end and transport failure.
    async fn finish_call(self: &Arc<Self>, epoch: u64, reason: EndReason, notify_remote: bool) {
        let (call_id, remote_user_id, phase, duration) = {
            let s = self.session.read();
            if s.epoch != epoch || s.phase == CallPhase::Idle {
                return;
            }
            let duration = if s.phase == CallPhase::Connected {
                Some(s.duration_seconds)
            } else {
                None
            };
            (
                s.call_id.clone(),
                s.remote_user_id.clone(),
                s.phase,
                duration,
            )
        };
        let Some(call_id) = call_id else { return };

        if notify_remote {
            if let Some(remote) = &remote_user_id {
                let payload = SignalPayload::CallEnd {
                    reason,
                    duration_seconds: duration,
                };
                // The local user has already moved on; relay failures here
                // are logged, never surfaced.
                if let Err(e) = self
                    .relay
                    .send_signal(&call_id, &self.config.local_user_id, remote, payload)
                    .await
                {
                    log::warn!("call end for {} not relayed: {}", call_id, e);
                }
            }
        }

        let status = closing_status(phase, reason);
        if let Err(e) = self.relay.update_call_status(&call_id, status, duration).await {
            log::warn!("history update for {} failed: {}", call_id, e);
        }

        self.teardown(epoch).await;
        let _ = self.events.send(CallEvent::CallEnded { call_id, reason });
    }

    /// Resets the session to Idle and releases everything owned by this
    /// call. Stale epochs are ignored, so late async completions cannot
    /// tear down a newer call.
    async fn teardown(self: &Arc<Self>, epoch: u64) {
        {
            let mut s = self.session.write();
            if s.epoch != epoch {
                return;
            }
            s.reset();
        }
        if let Some(handle) = take_if(&self.timer, epoch) {
            handle.abort();
        }
        if let Some(handle) = take_if(&self.timeout, epoch) {
            handle.abort();
        }
        if let Some(peer) = take_if(&self.peer, epoch) {
            peer.close().await;
        }
        if let Some(handle) = take_if(&self.pump, epoch) {
            handle.abort();
        }
        self.emit_phase(None, CallPhase::Idle);
    }

    async fn abort_setup<T>(
        self: &Arc<Self>,
        epoch: u64,
        recorded_call: Option<&str>,
        error: Error,
    ) -> Result<T> {
        log::warn!("call setup failed: {}", error);
        if let Some(call_id) = recorded_call {
            if let Err(e) = self
                .relay
                .update_call_status(call_id, CallStatus::Failed, None)
                .await
            {
                log::warn!("history update for {} failed: {}", call_id, e);
            }
        }
        {
            let mut s = self.session.write();
            if s.epoch == epoch {
                s.last_error = Some(error.to_string());
            }
        }
        self.teardown(epoch).await;
        Err(error)
    }

    async fn abort_answer<T>(
        self: &Arc<Self>,
        epoch: u64,
        call_id: &str,
        remote_user_id: &str,
        error: Error,
    ) -> Result<T> {
        log::warn!("answer for {} failed: {}", call_id, error);
        let payload = SignalPayload::CallEnd {
            reason: EndReason::ConnectionFailed,
            duration_seconds: None,
        };
        if let Err(e) = self
            .relay
            .send_signal(call_id, &self.config.local_user_id, remote_user_id, payload)
            .await
        {
            log::warn!("failure notice for {} not relayed: {}", call_id, e);
        }
        if let Err(e) = self
            .relay
            .update_call_status(call_id, CallStatus::Failed, None)
            .await
        {
            log::warn!("history update for {} failed: {}", call_id, e);
        }
        {
            let mut s = self.session.write();
            if s.epoch == epoch {
                s.last_error = Some(error.to_string());
            }
        }
        self.teardown(epoch).await;
        Err(error)
    }

    // ========================================================================
    // Inbound signals
    // ========================================================================

    async fn handle_signal(self: &Arc<Self>, signal: SignalMessage) {
        match signal.payload.clone() {
            SignalPayload::Offer { sdp, mode } => self.handle_offer(signal, sdp, mode).await,
            SignalPayload::Answer { sdp } => self.handle_answer(signal, sdp).await,
            SignalPayload::IceCandidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.handle_candidate(signal, candidate, sdp_mid, sdp_mline_index)
                    .await
            }
            SignalPayload::CallEnd { reason, .. } => self.handle_call_end(signal, reason).await,
        }
    }

    async fn handle_offer(self: &Arc<Self>, signal: SignalMessage, sdp: String, mode: CallMode) {
        let verdict = {
            let mut s = self.session.write();
            if s.phase == CallPhase::Idle {
                s.phase = CallPhase::Ringing;
                s.call_id = Some(signal.call_id.clone());
                s.mode = Some(mode);
                s.remote_user_id = Some(signal.from_user_id.clone());
                s.pending_offer = Some(PendingOffer {
                    signal_id: signal.signal_id.clone(),
                    sdp,
                });
                s.last_error = None;
                OfferVerdict::Ring(s.epoch)
            } else if s.call_id.as_deref() == Some(signal.call_id.as_str()) {
                OfferVerdict::Duplicate
            } else {
                OfferVerdict::Busy
            }
        };

        match verdict {
            OfferVerdict::Ring(epoch) => {
                log::info!(
                    "incoming {:?} call {} from {}",
                    mode,
                    signal.call_id,
                    signal.from_user_id
                );
                self.emit_phase(Some(&signal.call_id), CallPhase::Ringing);
                self.arm_setup_timeout(epoch);

                let caller = self.lookup_profile(&signal.from_user_id, epoch).await;
                let _ = self.events.send(CallEvent::IncomingCall {
                    call_id: signal.call_id.clone(),
                    caller,
                    mode,
                });
                // the offer stays unprocessed until answered or rejected
            }
            OfferVerdict::Duplicate => {
                log::debug!("duplicate offer for {} ignored", signal.call_id);
            }
            OfferVerdict::Busy => {
                // The line is busy: refuse the caller without touching the
                // active session.
                log::info!(
                    "busy, refusing call {} from {}",
                    signal.call_id,
                    signal.from_user_id
                );
                let payload = SignalPayload::CallEnd {
                    reason: EndReason::Busy,
                    duration_seconds: None,
                };
                if let Err(e) = self
                    .relay
                    .send_signal(
                        &signal.call_id,
                        &self.config.local_user_id,
                        &signal.from_user_id,
                        payload,
                    )
                    .await
                {
                    log::warn!("busy reply for {} not relayed: {}", signal.call_id, e);
                }
                self.mark_processed_quietly(&signal.signal_id).await;
            }
        }
    }

    async fn handle_answer(self: &Arc<Self>, signal: SignalMessage, sdp: String) {
        let epoch = {
            let s = self.session.read();
            if s.phase == CallPhase::Calling
                && s.call_id.as_deref() == Some(signal.call_id.as_str())
            {
                Some(s.epoch)
            } else {
                None
            }
        };
        let Some(epoch) = epoch else {
            // A duplicate answer after Connected lands here and is dropped.
            log::debug!("answer for {} ignored", signal.call_id);
            self.mark_processed_quietly(&signal.signal_id).await;
            return;
        };

        let Some(peer) = self.current_peer(epoch) else {
            self.mark_processed_quietly(&signal.signal_id).await;
            return;
        };

        if let Err(e) = peer.apply_remote_answer(sdp).await {
            log::error!("remote answer for {} rejected: {}", signal.call_id, e);
            self.mark_processed_quietly(&signal.signal_id).await;
            self.finish_call(epoch, EndReason::ConnectionFailed, true).await;
            return;
        }
        self.mark_processed_quietly(&signal.signal_id).await;

        let advanced = {
            let mut s = self.session.write();
            if s.epoch == epoch && s.phase == CallPhase::Calling {
                s.phase = CallPhase::Connecting;
                true
            } else {
                false
            }
        };
        if advanced {
            self.emit_phase(Some(&signal.call_id), CallPhase::Connecting);
        }
    }

    async fn handle_candidate(
        self: &Arc<Self>,
        signal: SignalMessage,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) {
        let epoch = {
            let s = self.session.read();
            if s.phase != CallPhase::Idle
                && s.call_id.as_deref() == Some(signal.call_id.as_str())
            {
                Some(s.epoch)
            } else {
                None
            }
        };
        let Some(epoch) = epoch else {
            log::debug!("candidate for {} ignored", signal.call_id);
            self.mark_processed_quietly(&signal.signal_id).await;
            return;
        };

        let init = RTCIceCandidateInit {
            candidate,
            sdp_mid,
            sdp_mline_index,
            ..Default::default()
        };

        match self.current_peer(epoch) {
            Some(peer) => {
                if let Err(e) = peer.ingest_remote_ice(init).await {
                    log::warn!("candidate for {} rejected: {}", signal.call_id, e);
                }
            }
            None => {
                // Still ringing: the peer session is created at answer
                // time, so hold the candidate until then.
                let mut s = self.session.write();
                if s.epoch == epoch {
                    s.early_ice.push(init);
                }
            }
        }
        self.mark_processed_quietly(&signal.signal_id).await;
    }

    async fn handle_call_end(self: &Arc<Self>, signal: SignalMessage, reason: EndReason) {
        let epoch = {
            let s = self.session.read();
            if s.phase != CallPhase::Idle
                && s.call_id.as_deref() == Some(signal.call_id.as_str())
            {
                Some(s.epoch)
            } else {
                None
            }
        };
        self.mark_processed_quietly(&signal.signal_id).await;

        let Some(epoch) = epoch else {
            log::debug!("call end for {} ignored", signal.call_id);
            return;
        };

        log::info!("remote ended call {}: {:?}", signal.call_id, reason);
        self.finish_call(epoch, reason, false).await;
    }
}

async fn peer_pump(
    inner: Arc<Inner>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    call_id: String,
    remote_user_id: String,
    epoch: u64,
) {
    while let Some(event) = events.recv().await {
        if !inner.epoch_is(epoch) {
            break;
        }
        match event {
            PeerEvent::LocalIceCandidate(init) => {
                let payload = SignalPayload::IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                };
                if let Err(e) = inner
                    .relay
                    .send_signal(&call_id, &inner.config.local_user_id, &remote_user_id, payload)
                    .await
                {
                    log::warn!("candidate for {} not relayed: {}", call_id, e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let _ = inner.events.send(CallEvent::RemoteTrackAdded {
                    call_id: call_id.clone(),
                    track,
                });
            }
            PeerEvent::ConnectionState(state) => {
                log::debug!("peer connection state for {}: {}", call_id, state);
                match state {
                    RTCPeerConnectionState::Connected => {
                        inner.on_transport_connected(&call_id, epoch);
                    }
                    RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                        // A dropped transport is a remote hangup in effect.
                        inner
                            .finish_call(epoch, EndReason::ConnectionFailed, false)
                            .await;
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CameraFacing, StaticMediaSource};
    use crate::storage::{SignalStore, SqliteStore};
    use std::time::Duration;

    struct DeniedMedia;

    #[async_trait]
    impl MediaSource for DeniedMedia {
        async fn open_audio(&self) -> Result<Arc<LocalTrack>> {
            Err(Error::Device("permission denied".to_string()))
        }

        async fn open_video(&self, _facing: CameraFacing) -> Result<Arc<LocalTrack>> {
            Err(Error::Device("permission denied".to_string()))
        }
    }

    fn manager_with(user: &str, store: Arc<SqliteStore>, media: Arc<dyn MediaSource>) -> CallManager {
        let relay = Arc::new(SignalingRelay::new(store as Arc<dyn SignalStore>));
        let mut config = CallConfig::new(user);
        config.setup_timeout_secs = 30;
        CallManager::new(config, relay, media, None)
    }

    fn manager(user: &str, store: Arc<SqliteStore>) -> CallManager {
        manager_with(user, store, Arc::new(StaticMediaSource))
    }

    #[tokio::test]
    async fn test_second_start_call_is_rejected() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alice = manager("alice", store);

        let outgoing = alice.start_call("bob", CallMode::Voice).await.unwrap();
        assert_eq!(alice.snapshot().phase, CallPhase::Calling);

        let result = alice.start_call("carol", CallMode::Voice).await;
        assert!(matches!(result, Err(Error::AlreadyInCall)));
        // the active call is untouched by the rejected attempt
        assert_eq!(alice.snapshot().call_id, Some(outgoing.call_id));

        alice.end_call().await.unwrap();
        assert_eq!(alice.snapshot().phase, CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_end_call_closes_history_record() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alice = manager("alice", store.clone());

        let outgoing = alice.start_call("bob", CallMode::Video).await.unwrap();
        alice.end_call().await.unwrap();

        let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Ended);
        assert!(record.ended_at.is_some());
        assert!(outgoing
            .local_media
            .tracks()
            .iter()
            .all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn test_device_failure_rolls_back_without_record() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alice = manager_with("alice", store.clone(), Arc::new(DeniedMedia));

        let result = alice.start_call("bob", CallMode::Video).await;
        assert!(matches!(result, Err(Error::Device(_))));

        let snapshot = alice.snapshot();
        assert_eq!(snapshot.phase, CallPhase::Idle);
        assert!(snapshot.last_error.is_some());
        assert!(store.calls_for_user("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_and_end_are_noops_when_idle() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let alice = manager("alice", store);

        alice.reject_call().await.unwrap();
        alice.end_call().await.unwrap();
        assert_eq!(alice.snapshot().phase, CallPhase::Idle);

        assert!(!alice.toggle_mute());
        assert!(!alice.toggle_video());
        assert!(alice.switch_camera().await.is_none());
    }

    #[tokio::test]
    async fn test_setup_timeout_marks_call_missed() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let relay = Arc::new(SignalingRelay::new(
            store.clone() as Arc<dyn SignalStore>
        ));
        let mut config = CallConfig::new("alice");
        config.setup_timeout_secs = 1;
        let alice = CallManager::new(config, relay, Arc::new(StaticMediaSource), None);

        let mut events = alice.subscribe();
        let outgoing = alice.start_call("nobody", CallMode::Voice).await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(CallEvent::CallEnded { reason, .. }) = events.recv().await {
                    return reason;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(ended, EndReason::Timeout);
        assert_eq!(alice.snapshot().phase, CallPhase::Idle);
        let record = store.get_call(&outgoing.call_id).await.unwrap().unwrap();
        assert_eq!(record.status, CallStatus::Missed);
    }
}
