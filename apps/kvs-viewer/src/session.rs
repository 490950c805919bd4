//! Call lifecycle for one viewer connection.
//!
//! A [`ViewerSession`] owns the signaling handle, the peer connection, the
//! media sink and the stats timer for exactly one call. Every callback only
//! enqueues a [`SessionEvent`]; [`ViewerSession::run`] consumes them in
//! order on a single task, so no state is shared with the callbacks.

use std::sync::Arc;
use std::time::Duration;

use kvs_signaling::{IceCandidate, SessionDescription, Signaling, SignalingEvent, StatusResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::CandidatePolicy;
use crate::error::{ViewerError, ViewerResult};
use crate::media::{LocalCapture, MediaSink};
use crate::peer::{CallConnector, CallParts, OfferOptions, PeerConnection, PeerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Open,
    OfferSent,
    Answered,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    /// Local request to end the call.
    Hangup,
    StatsTick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionOptions {
    pub candidate_policy: CandidatePolicy,
    pub stats_interval: Option<Duration>,
    pub offer: OfferOptions,
}

/// Lets other tasks end the call. Once the session has torn down,
/// [`CallHandle::hangup`] reports [`ViewerError::Closed`].
#[derive(Debug, Clone)]
pub struct CallHandle {
    control: mpsc::UnboundedSender<SessionEvent>,
}

impl CallHandle {
    pub fn hangup(&self) -> ViewerResult<()> {
        self.control
            .send(SessionEvent::Hangup)
            .map_err(|_| ViewerError::Closed)
    }
}

pub struct ViewerSession {
    state: CallState,
    options: SessionOptions,
    signaling: Option<Arc<dyn Signaling>>,
    peer: Option<Arc<dyn PeerConnection>>,
    media: MediaSink,
    stats_timer: Option<JoinHandle<()>>,
    offer_sent: bool,
    remote_description_applied: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
    signaling_rx: mpsc::UnboundedReceiver<SignalingEvent>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    control_tx: mpsc::UnboundedSender<SessionEvent>,
    control_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ViewerSession {
    /// Builds the call's collaborators through `connector`. Nothing is
    /// opened until [`ViewerSession::start`].
    pub async fn connect(
        connector: &dyn CallConnector,
        media: MediaSink,
        options: SessionOptions,
    ) -> ViewerResult<(Self, CallHandle)> {
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let CallParts { signaling, peer } = connector.connect(signaling_tx, peer_tx).await?;

        let handle = CallHandle {
            control: control_tx.clone(),
        };
        let session = Self {
            state: CallState::Idle,
            options,
            signaling: Some(signaling),
            peer: Some(peer),
            media,
            stats_timer: None,
            offer_sent: false,
            remote_description_applied: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
            signaling_rx,
            peer_rx,
            control_tx,
            control_rx,
        };
        Ok((session, handle))
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn media(&self) -> &MediaSink {
        &self.media
    }

    pub fn has_signaling(&self) -> bool {
        self.signaling.is_some()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn has_stats_timer(&self) -> bool {
        self.stats_timer.is_some()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    pub async fn start_preview(&mut self, capture: &dyn LocalCapture) {
        self.media.start_preview(capture).await;
    }

    /// Requests the signaling connection. A failure tears the call down.
    pub async fn start(&mut self) -> ViewerResult<()> {
        match self.state {
            CallState::Idle => {}
            CallState::Closed => return Err(ViewerError::Closed),
            state => {
                debug!(?state, "call already started");
                return Ok(());
            }
        }
        let Some(signaling) = self.signaling.clone() else {
            return Err(ViewerError::Closed);
        };
        info!("starting viewer connection");
        self.state = CallState::Connecting;
        if let Err(err) = signaling.open() {
            error!(error = %err, "failed to open signaling connection");
            self.teardown().await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Processes events until the call closes, then releases everything.
    pub async fn run(&mut self) {
        while self.state != CallState::Closed {
            let event = tokio::select! {
                biased;
                Some(event) = self.control_rx.recv() => event,
                Some(event) = self.signaling_rx.recv() => SessionEvent::Signaling(event),
                Some(event) = self.peer_rx.recv() => SessionEvent::Peer(event),
                else => break,
            };
            self.handle_event(event).await;
        }
        self.teardown().await;
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if self.state == CallState::Closed {
            trace!(?event, "event after close ignored");
            return;
        }
        match event {
            SessionEvent::Signaling(event) => self.on_signaling(event).await,
            SessionEvent::Peer(event) => self.on_peer(event).await,
            SessionEvent::Hangup => {
                info!("hangup requested");
                self.teardown().await;
            }
            SessionEvent::StatsTick => self.log_stats().await,
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Open => self.on_open().await,
            SignalingEvent::SdpAnswer { description, .. } => self.on_answer(description).await,
            SignalingEvent::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await
            }
            SignalingEvent::SdpOffer {
                sender_client_id, ..
            } => {
                info!(sender = ?sender_client_id, "ignoring sdp offer; viewers do not answer");
            }
            SignalingEvent::StatusResponse(status) => log_status_response(&status),
            SignalingEvent::Close => {
                info!("disconnected from signaling channel");
                self.teardown().await;
            }
            SignalingEvent::Error(message) => {
                error!(error = %message, "signaling client error");
            }
        }
    }

    async fn on_open(&mut self) {
        if self.state != CallState::Connecting || self.offer_sent {
            debug!(state = ?self.state, "duplicate open event ignored");
            return;
        }
        info!("connected to signaling service");
        self.state = CallState::Open;

        let (Some(peer), Some(signaling)) = (self.peer.clone(), self.signaling.clone()) else {
            return;
        };

        debug!("creating sdp offer");
        let offer = match peer.create_offer(self.options.offer).await {
            Ok(offer) => offer,
            Err(err) => {
                error!(error = %err, "failed to create sdp offer");
                return;
            }
        };
        if let Err(err) = peer.set_local_description(offer).await {
            error!(error = %err, "failed to apply local description");
            return;
        }
        let Some(local) = peer.local_description().await else {
            error!("peer connection has no local description after applying the offer");
            return;
        };

        info!(sdp_len = local.sdp.len(), "sending sdp offer");
        if let Err(err) = signaling.send_sdp_offer(&local) {
            error!(error = %err, "failed to send sdp offer");
            return;
        }
        self.offer_sent = true;
        self.state = CallState::OfferSent;

        for candidate in std::mem::take(&mut self.pending_local) {
            self.send_local_candidate(&signaling, &candidate);
        }
    }

    async fn on_answer(&mut self, description: SessionDescription) {
        if self.state != CallState::OfferSent {
            warn!(state = ?self.state, "unexpected sdp answer ignored");
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        info!("received sdp answer");
        if let Err(err) = peer.set_remote_description(description).await {
            error!(error = %err, "failed to apply sdp answer");
            return;
        }
        self.remote_description_applied = true;
        self.state = CallState::Answered;

        let buffered = std::mem::take(&mut self.pending_remote);
        if !buffered.is_empty() {
            debug!(count = buffered.len(), "applying buffered remote candidates");
        }
        for candidate in buffered {
            apply_remote_candidate(peer.as_ref(), candidate).await;
        }
        self.start_stats_timer();

        // Media may already be bound if a track beat the answer.
        if self.media.remote_stream().is_some() {
            self.state = CallState::Connected;
            info!("remote media connected");
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        debug!(candidate = %candidate.candidate, "received ice candidate");
        match self.options.candidate_policy {
            CandidatePolicy::BufferUntilAnswer if !self.remote_description_applied => {
                self.pending_remote.push(candidate);
            }
            _ => apply_remote_candidate(peer.as_ref(), candidate).await,
        }
    }

    async fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(Some(candidate)) => {
                let Some(signaling) = self.signaling.clone() else {
                    return;
                };
                if !self.offer_sent {
                    self.pending_local.push(candidate);
                    return;
                }
                self.send_local_candidate(&signaling, &candidate);
            }
            PeerEvent::LocalCandidate(None) => {
                info!("all ice candidates have been generated");
            }
            PeerEvent::Track(event) => {
                info!(track = event.track.id(), kind = ?event.track.kind(), "received remote track");
                if self.media.on_track(&event) && self.state == CallState::Answered {
                    self.state = CallState::Connected;
                    info!("remote media connected");
                }
            }
        }
    }

    fn send_local_candidate(&self, signaling: &Arc<dyn Signaling>, candidate: &IceCandidate) {
        debug!(candidate = %candidate.candidate, "sending ice candidate");
        if let Err(err) = signaling.send_ice_candidate(candidate) {
            warn!(error = %err, "failed to send ice candidate");
        }
    }

    fn start_stats_timer(&mut self) {
        let Some(interval) = self.options.stats_interval else {
            return;
        };
        if self.stats_timer.is_some() {
            return;
        }
        let control = self.control_tx.clone();
        self.stats_timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if control.send(SessionEvent::StatsTick).is_err() {
                    break;
                }
            }
        }));
    }

    async fn log_stats(&self) {
        let Some(peer) = &self.peer else {
            return;
        };
        match peer.stats().await {
            Ok(stats) => info!(
                state = %stats.connection_state,
                reports = stats.report_count,
                "peer connection stats"
            ),
            Err(err) => debug!(error = %err, "stats unavailable"),
        }
        if let Some(stream) = self.media.remote_stream() {
            for track in stream.tracks() {
                info!(
                    track = track.id(),
                    kind = ?track.kind(),
                    live = track.is_live(),
                    packets = track.packets_received(),
                    "remote track stats"
                );
            }
        }
    }

    /// Releases everything the call holds: signaling first, then the peer
    /// connection, remote tracks, the stats timer, the surface binding and
    /// the local preview. Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        if self.state != CallState::Closed {
            info!("stopping viewer connection");
        }
        self.state = CallState::Closed;

        if let Some(signaling) = self.signaling.take() {
            signaling.close();
        }
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                warn!(error = %err, "failed to close peer connection");
            }
        }
        self.media.stop_remote().await;
        if let Some(timer) = self.stats_timer.take() {
            timer.abort();
        }
        self.media.clear_surface();
        self.media.stop_preview().await;

        self.pending_remote.clear();
        self.pending_local.clear();
        self.control_rx.close();
    }
}

async fn apply_remote_candidate(peer: &dyn PeerConnection, candidate: IceCandidate) {
    if let Err(err) = peer.add_ice_candidate(candidate).await {
        warn!(error = %err, "failed to add remote ice candidate");
    }
}

fn log_status_response(status: &StatusResponse) {
    warn!(
        correlation_id = ?status.correlation_id,
        error_type = ?status.error_type,
        status_code = ?status.status_code,
        description = ?status.description,
        "signaling service reported an error"
    );
}
