//! Client side of a Kinesis Video Streams signaling channel: control-plane
//! lookups, request signing and the WebSocket signaling connection.

pub mod api;
pub mod client;
pub mod error;
pub mod protocol;
pub mod resolver;
pub mod sigv4;

pub use api::{ChannelApi, ChannelRole, KinesisVideoClient, Protocol};
pub use client::{Signaling, SignalingClient, SignalingClientConfig};
pub use error::{SignalingError, SignalingResult};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalingEvent, StatusResponse};
pub use resolver::{
    ChannelIdentity, ChannelResolver, EndpointSet, IceServer, ResolvedChannel, ResolverOptions,
};
pub use sigv4::{Credentials, SigV4Signer};

/// Random client id in the style the browser SDK uses for viewers.
pub fn generate_client_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
