use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::api::ChannelRole;
use crate::error::{SignalingError, SignalingResult};
use crate::protocol::{
    IceCandidate, InboundMessage, OutboundMessage, SessionDescription, SignalingEvent,
};
use crate::sigv4::{PRESIGN_EXPIRES_SECS, SigV4Signer};

/// How long `close` waits for the server to finish the close handshake
/// before dropping the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Operations the call session needs from a signaling connection. Events
/// are delivered through the channel handed over at construction time.
pub trait Signaling: Send + Sync {
    fn open(&self) -> SignalingResult<()>;
    fn close(&self);
    fn send_sdp_offer(&self, description: &SessionDescription) -> SignalingResult<()>;
    fn send_ice_candidate(&self, candidate: &IceCandidate) -> SignalingResult<()>;
}

#[derive(Debug, Clone)]
pub struct SignalingClientConfig {
    pub channel_arn: String,
    /// The channel's `WSS` endpoint.
    pub channel_endpoint: String,
    pub role: ChannelRole,
    /// Required for viewers, ignored for masters.
    pub client_id: Option<String>,
    /// Viewers leave this unset; the service routes to the master.
    pub recipient_client_id: Option<String>,
}

#[derive(Default)]
struct ConnectionState {
    started: AtomicBool,
    closing: AtomicBool,
    close_emitted: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionState {
    fn emit_close(&self, events: &mpsc::UnboundedSender<SignalingEvent>) {
        if !self.close_emitted.swap(true, Ordering::SeqCst) {
            let _ = events.send(SignalingEvent::Close);
        }
    }
}

/// WebSocket signaling client. One instance serves one connection; it is
/// not reopened after it closes.
pub struct SignalingClient {
    config: SignalingClientConfig,
    signer: SigV4Signer,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: Arc<ConnectionState>,
}

impl SignalingClientConfig {
    pub fn viewer(
        channel_arn: impl Into<String>,
        channel_endpoint: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            channel_arn: channel_arn.into(),
            channel_endpoint: channel_endpoint.into(),
            role: ChannelRole::Viewer,
            client_id: Some(client_id.into()),
            recipient_client_id: None,
        }
    }
}

impl SignalingClient {
    pub fn new(
        config: SignalingClientConfig,
        signer: SigV4Signer,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        Self {
            config,
            signer,
            events,
            state: Arc::new(ConnectionState::default()),
        }
    }

    /// The presigned URL used to open the connection.
    pub fn connect_url(&self) -> SignalingResult<Url> {
        let mut url = Url::parse(&self.config.channel_endpoint).map_err(|err| {
            SignalingError::InvalidUrl {
                url: self.config.channel_endpoint.clone(),
                reason: err.to_string(),
            }
        })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("X-Amz-ChannelARN", &self.config.channel_arn);
            if self.config.role == ChannelRole::Viewer {
                if let Some(client_id) = &self.config.client_id {
                    query.append_pair("X-Amz-ClientId", client_id);
                }
            }
        }
        Ok(self
            .signer
            .presign_url(&url, self.signer.now(), PRESIGN_EXPIRES_SECS))
    }

    fn send(&self, message: OutboundMessage) -> SignalingResult<()> {
        let text = message.to_text()?;
        let sender = self
            .state
            .outbound
            .lock()
            .clone()
            .ok_or(SignalingError::NotOpen)?;
        trace!(action = ?message.action, len = text.len(), "ws_out");
        sender
            .send(Message::Text(text))
            .map_err(|_| SignalingError::NotOpen)
    }
}

impl Signaling for SignalingClient {
    fn open(&self) -> SignalingResult<()> {
        if self.config.role == ChannelRole::Viewer && self.config.client_id.is_none() {
            return Err(SignalingError::MissingClientId);
        }
        let url = self.connect_url()?;
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Err(SignalingError::AlreadyOpen);
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            run_connection(url, state, events).await;
        });
        self.state.tasks.lock().push(handle);
        Ok(())
    }

    fn close(&self) {
        if self.state.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let outbound = self.state.outbound.lock().take();
        match outbound {
            Some(sender) => {
                debug!("closing signaling connection");
                let _ = sender.send(Message::Close(None));
            }
            None if !self.state.started.load(Ordering::SeqCst) => {
                self.state.emit_close(&self.events);
                return;
            }
            None => {}
        }

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                tokio::time::sleep(CLOSE_GRACE).await;
                for task in state.tasks.lock().drain(..) {
                    task.abort();
                }
                state.emit_close(&events);
            });
        } else {
            for task in self.state.tasks.lock().drain(..) {
                task.abort();
            }
            self.state.emit_close(&self.events);
        }
    }

    fn send_sdp_offer(&self, description: &SessionDescription) -> SignalingResult<()> {
        self.send(OutboundMessage::sdp_offer(
            description,
            self.config.recipient_client_id.clone(),
        )?)
    }

    fn send_ice_candidate(&self, candidate: &IceCandidate) -> SignalingResult<()> {
        self.send(OutboundMessage::ice_candidate(
            candidate,
            self.config.recipient_client_id.clone(),
        )?)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.state.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_connection(
    url: Url,
    state: Arc<ConnectionState>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(error = %err, "signaling websocket connect failed");
            let _ = events.send(SignalingEvent::Error(format!(
                "websocket connect failed: {err}"
            )));
            state.emit_close(&events);
            return;
        }
    };
    let (mut ws_write, mut ws_read) = ws_stream.split();

    if state.closing.load(Ordering::SeqCst) {
        let _ = ws_write.send(Message::Close(None)).await;
        state.emit_close(&events);
        return;
    }

    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
    *state.outbound.lock() = Some(send_tx);
    info!(host = url.host_str().unwrap_or_default(), "connected to signaling service");
    let _ = events.send(SignalingEvent::Open);

    let writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(msg) = ws_read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                trace!(event = "ws_in", kind = "text", len = text.len());
                dispatch_text(&text, &events);
            }
            Ok(Message::Binary(data)) => {
                trace!(event = "ws_in", kind = "binary", len = data.len());
                if let Ok(text) = String::from_utf8(data) {
                    dispatch_text(&text, &events);
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "signaling websocket close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!("signaling websocket closed: {err}");
                    }
                    _ if state.closing.load(Ordering::SeqCst) => {
                        debug!("signaling websocket error while closing: {err}");
                    }
                    _ => {
                        warn!("signaling websocket error: {err}");
                        let _ = events.send(SignalingEvent::Error(err.to_string()));
                    }
                }
                break;
            }
        }
    }

    state.outbound.lock().take();
    writer.abort();
    info!("disconnected from signaling channel");
    state.emit_close(&events);
}

fn dispatch_text(text: &str, events: &mpsc::UnboundedSender<SignalingEvent>) {
    if text.trim().is_empty() {
        return;
    }
    let parsed = InboundMessage::parse(text).and_then(InboundMessage::into_event);
    match parsed {
        Ok(Some(event)) => {
            let _ = events.send(event);
        }
        Ok(None) => debug!("ignoring unrecognised signaling message"),
        Err(err) => warn!(error = %err, "failed to parse signaling message"),
    }
}
