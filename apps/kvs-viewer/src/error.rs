use kvs_signaling::SignalingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("peer connection error: {0}")]
    Peer(String),
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("call is closed")]
    Closed,
}

impl From<webrtc::Error> for ViewerError {
    fn from(err: webrtc::Error) -> Self {
        ViewerError::Peer(err.to_string())
    }
}

pub type ViewerResult<T> = Result<T, ViewerError>;
