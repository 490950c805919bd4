use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} rejected with status {status}: {error_type}: {message}")]
    Api {
        operation: &'static str,
        status: u16,
        error_type: String,
        message: String,
    },
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling channel {0} not found")]
    ChannelNotFound(String),
    #[error("signaling channel {arn} is {status}, expected ACTIVE")]
    ChannelNotActive { arn: String, status: String },
    #[error("no {0} endpoint returned for channel")]
    MissingEndpoint(&'static str),
    #[error("viewer connections need a client id")]
    MissingClientId,
    #[error("signaling connection is not open")]
    NotOpen,
    #[error("signaling connection was already started")]
    AlreadyOpen,
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("undecodable message payload: {0}")]
    Payload(String),
}

pub type SignalingResult<T> = Result<T, SignalingError>;
