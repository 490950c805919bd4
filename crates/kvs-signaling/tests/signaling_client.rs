use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use kvs_signaling::{
    Credentials, IceCandidate, SessionDescription, SigV4Signer, Signaling, SignalingClient,
    SignalingClientConfig, SignalingError, SignalingEvent,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::timeout;

const CHANNEL_ARN: &str = "arn:aws:kinesisvideo:us-east-1:620899590002:channel/testing-webRTC/1650029117785";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct FakeSignalingService {
    inbound: mpsc::UnboundedSender<Value>,
    outbound: Arc<AsyncMutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
    queries: Arc<AsyncMutex<Vec<String>>>,
}

impl FakeSignalingService {
    async fn push(&self, message: WsMessage) {
        let guard = self.outbound.lock().await;
        let sender = guard.as_ref().expect("viewer connected");
        sender.send(message).expect("socket task alive");
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<FakeSignalingService>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    service.queries.lock().await.push(query.unwrap_or_default());
    ws.on_upgrade(move |socket| handle_socket(socket, service))
}

async fn handle_socket(socket: WebSocket, service: FakeSignalingService) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    *service.outbound.lock().await = Some(tx);

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            WsMessage::Text(text) => {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    let _ = service.inbound.send(value);
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn spawn_signaling_service() -> (String, FakeSignalingService, mpsc::UnboundedReceiver<Value>) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let service = FakeSignalingService {
        inbound: inbound_tx,
        outbound: Arc::new(AsyncMutex::new(None)),
        queries: Arc::new(AsyncMutex::new(Vec::new())),
    };
    let router = Router::new()
        .route("/", get(ws_handler))
        .with_state(service.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind signaling service");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (format!("ws://{addr}"), service, inbound_rx)
}

fn signer() -> SigV4Signer {
    SigV4Signer::new(
        Credentials::new("AKIDEXAMPLE", "secret").with_session_token(Some("session-token".into())),
        "us-east-1",
    )
}

fn viewer(endpoint: &str) -> (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let client = SignalingClient::new(
        SignalingClientConfig::viewer(CHANNEL_ARN, endpoint, "viewer-1"),
        signer(),
        events_tx,
    );
    (client, events_rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("signaling event in time")
        .expect("event channel open")
}

async fn next_inbound(inbound: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, inbound.recv())
        .await
        .expect("message at service in time")
        .expect("service channel open")
}

fn decode_payload(message: &Value) -> Value {
    let raw = STANDARD
        .decode(message["messagePayload"].as_str().expect("payload"))
        .expect("base64 payload");
    serde_json::from_slice(&raw).expect("payload json")
}

fn service_message(message_type: &str, payload: Value) -> WsMessage {
    WsMessage::Text(
        json!({
            "messageType": message_type,
            "messagePayload": STANDARD.encode(payload.to_string()),
            "senderClientId": "",
        })
        .to_string(),
    )
}

#[tokio::test]
async fn viewer_exchanges_offer_answer_and_candidates() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (endpoint, service, mut inbound) = spawn_signaling_service().await;
    let (client, mut events) = viewer(&endpoint);

    client.open().expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);

    let query = service.queries.lock().await[0].clone();
    assert!(query.contains("X-Amz-ChannelARN="));
    assert!(query.contains("X-Amz-ClientId=viewer-1"));
    assert!(query.contains("X-Amz-Security-Token=session-token"));
    assert!(query.contains("X-Amz-Expires=299"));
    let signature_at = query.find("X-Amz-Signature=").expect("signature param");
    assert!(!query[signature_at..].contains('&'));

    client
        .send_sdp_offer(&SessionDescription::offer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"))
        .expect("send offer");
    let offer = next_inbound(&mut inbound).await;
    assert_eq!(offer["action"], "SDP_OFFER");
    assert!(offer.get("recipientClientId").is_none());
    assert_eq!(
        decode_payload(&offer),
        json!({ "type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n" })
    );

    let candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 192.168.1.10 50000 typ host".into(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    };
    client.send_ice_candidate(&candidate).expect("send candidate");
    let sent = next_inbound(&mut inbound).await;
    assert_eq!(sent["action"], "ICE_CANDIDATE");
    assert_eq!(decode_payload(&sent)["sdpMid"], "0");

    service
        .push(service_message("SDP_ANSWER", json!({ "type": "answer", "sdp": "v=0\r\n" })))
        .await;
    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::SdpAnswer {
            description: SessionDescription::answer("v=0\r\n"),
            sender_client_id: Some(String::new()),
        }
    );

    service
        .push(service_message(
            "ICE_CANDIDATE",
            json!({ "candidate": "candidate:2 1 udp 1 10.0.0.9 9 typ relay", "sdpMid": "1", "sdpMLineIndex": 1 }),
        ))
        .await;
    match next_event(&mut events).await {
        SignalingEvent::IceCandidate { candidate, .. } => {
            assert_eq!(candidate.sdp_mid.as_deref(), Some("1"));
            assert_eq!(candidate.sdp_mline_index, Some(1));
        }
        other => panic!("unexpected event {other:?}"),
    }

    client.close();
    assert_eq!(next_event(&mut events).await, SignalingEvent::Close);
    assert!(matches!(
        client.send_ice_candidate(&candidate),
        Err(SignalingError::NotOpen)
    ));
}

#[tokio::test]
async fn blank_and_malformed_frames_are_skipped() {
    let (endpoint, service, mut inbound) = spawn_signaling_service().await;
    let (client, mut events) = viewer(&endpoint);
    client.open().expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);

    client
        .send_sdp_offer(&SessionDescription::offer("v=0\r\n"))
        .expect("send offer");
    next_inbound(&mut inbound).await;

    service.push(WsMessage::Text(String::new())).await;
    service.push(WsMessage::Text("not json".into())).await;
    service
        .push(WsMessage::Text(json!({ "messageType": "GO_AWAY" }).to_string()))
        .await;
    service
        .push(service_message("SDP_ANSWER", json!({ "type": "answer", "sdp": "v=0" })))
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        SignalingEvent::SdpAnswer { .. }
    ));
}

#[tokio::test]
async fn status_response_is_reported_without_closing() {
    let (endpoint, service, mut inbound) = spawn_signaling_service().await;
    let (client, mut events) = viewer(&endpoint);
    client.open().expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
    client
        .send_sdp_offer(&SessionDescription::offer("v=0\r\n"))
        .expect("send offer");
    next_inbound(&mut inbound).await;

    service
        .push(WsMessage::Text(
            json!({
                "messageType": "STATUS_RESPONSE",
                "statusResponse": {
                    "correlationId": "1",
                    "errorType": "InvalidArgumentException",
                    "statusCode": "400",
                    "description": "Message payload is invalid"
                }
            })
            .to_string(),
        ))
        .await;
    match next_event(&mut events).await {
        SignalingEvent::StatusResponse(status) => {
            assert_eq!(status.error_type.as_deref(), Some("InvalidArgumentException"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client
        .send_sdp_offer(&SessionDescription::offer("v=0\r\n"))
        .is_ok());
}

#[tokio::test]
async fn service_close_emits_single_close_event() {
    let (endpoint, service, mut inbound) = spawn_signaling_service().await;
    let (client, mut events) = viewer(&endpoint);
    client.open().expect("open");
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
    client
        .send_sdp_offer(&SessionDescription::offer("v=0\r\n"))
        .expect("send offer");
    next_inbound(&mut inbound).await;

    service.push(WsMessage::Close(None)).await;
    assert_eq!(next_event(&mut events).await, SignalingEvent::Close);

    client.close();
    let extra = timeout(Duration::from_millis(300), events.recv()).await;
    assert!(extra.is_err() || matches!(extra, Ok(None)), "unexpected extra event {extra:?}");
}

#[tokio::test]
async fn unreachable_endpoint_reports_error_then_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (client, mut events) = viewer(&format!("ws://{addr}"));
    client.open().expect("open is asynchronous");
    assert!(matches!(next_event(&mut events).await, SignalingEvent::Error(_)));
    assert_eq!(next_event(&mut events).await, SignalingEvent::Close);
    assert!(matches!(
        client.send_sdp_offer(&SessionDescription::offer("v=0")),
        Err(SignalingError::NotOpen)
    ));
}

#[tokio::test]
async fn second_open_is_rejected() {
    let (endpoint, _service, _inbound) = spawn_signaling_service().await;
    let (client, mut events) = viewer(&endpoint);
    client.open().expect("open");
    assert!(matches!(client.open(), Err(SignalingError::AlreadyOpen)));
    assert_eq!(next_event(&mut events).await, SignalingEvent::Open);
}

#[tokio::test]
async fn viewer_without_client_id_cannot_open() {
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let mut config = SignalingClientConfig::viewer(CHANNEL_ARN, "ws://127.0.0.1:9", "unused");
    config.client_id = None;
    let client = SignalingClient::new(config, signer(), events_tx);
    assert!(matches!(client.open(), Err(SignalingError::MissingClientId)));
}

#[tokio::test]
async fn sending_before_open_fails() {
    let (client, _events) = viewer("ws://127.0.0.1:9");
    assert!(matches!(
        client.send_sdp_offer(&SessionDescription::offer("v=0")),
        Err(SignalingError::NotOpen)
    ));
}
