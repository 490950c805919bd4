use std::sync::Arc;

use async_trait::async_trait;
use kvs_signaling::{IceCandidate, SessionDescription, Signaling, SignalingEvent};
use tokio::sync::mpsc;

use crate::error::ViewerResult;
use crate::media::TrackEvent;

/// What the offer asks the remote side to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStats {
    pub connection_state: String,
    pub report_count: usize,
}

/// Events raised by the peer connection. They are only ever queued; the
/// call session consumes them on its own loop.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// `None` marks the end of candidate gathering.
    LocalCandidate(Option<IceCandidate>),
    Track(TrackEvent),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> ViewerResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> ViewerResult<()>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn set_remote_description(&self, description: SessionDescription) -> ViewerResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> ViewerResult<()>;
    async fn stats(&self) -> ViewerResult<PeerStats>;
    async fn close(&self) -> ViewerResult<()>;
}

/// The two per-call collaborators a session drives.
pub struct CallParts {
    pub signaling: Arc<dyn Signaling>,
    pub peer: Arc<dyn PeerConnection>,
}

/// Builds the signaling connection and peer connection for one call. Both
/// must report their events through the supplied senders.
#[async_trait]
pub trait CallConnector: Send + Sync {
    async fn connect(
        &self,
        signaling_events: mpsc::UnboundedSender<SignalingEvent>,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
    ) -> ViewerResult<CallParts>;
}
