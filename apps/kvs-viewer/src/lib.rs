//! Viewer side of a Kinesis Video Streams WebRTC call.

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod session;

pub use config::{CandidatePolicy, IceTransportPolicy, ViewerArgs, ViewerConfig};
pub use error::{ViewerError, ViewerResult};
pub use media::{
    CaptureConstraints, LocalCapture, LoggingSurface, MediaSink, MediaStream, MediaTrack,
    NoCapture, RenderSurface, TrackEvent, TrackKind,
};
pub use peer::{CallConnector, CallParts, OfferOptions, PeerConnection, PeerEvent, PeerStats};
pub use rtc::{RtcConnector, RtcPeer};
pub use session::{CallHandle, CallState, SessionEvent, SessionOptions, ViewerSession};
