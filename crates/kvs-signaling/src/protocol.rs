//! JSON messages exchanged with the signaling WebSocket. Payloads travel as
//! base64-encoded JSON inside `messagePayload`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SignalingError, SignalingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SdpOffer,
    IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub action: Action,
    pub message_payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient_client_id: Option<String>,
}

impl OutboundMessage {
    pub fn sdp_offer(
        description: &SessionDescription,
        recipient_client_id: Option<String>,
    ) -> SignalingResult<Self> {
        Self::encode(Action::SdpOffer, description, recipient_client_id)
    }

    pub fn ice_candidate(
        candidate: &IceCandidate,
        recipient_client_id: Option<String>,
    ) -> SignalingResult<Self> {
        Self::encode(Action::IceCandidate, candidate, recipient_client_id)
    }

    fn encode<T: Serialize>(
        action: Action,
        payload: &T,
        recipient_client_id: Option<String>,
    ) -> SignalingResult<Self> {
        Ok(Self {
            action,
            message_payload: STANDARD.encode(serde_json::to_vec(payload)?),
            recipient_client_id,
        })
    }

    pub fn to_text(&self) -> SignalingResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SdpAnswer,
    SdpOffer,
    IceCandidate,
    StatusResponse,
    #[serde(other)]
    Unknown,
}

/// Service-side result for a previously sent message, usually an error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub status_code: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_type: MessageType,
    #[serde(default)]
    pub message_payload: Option<String>,
    #[serde(default)]
    pub sender_client_id: Option<String>,
    #[serde(default)]
    pub status_response: Option<StatusResponse>,
}

/// Everything the signaling connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Open,
    SdpAnswer {
        description: SessionDescription,
        sender_client_id: Option<String>,
    },
    SdpOffer {
        description: SessionDescription,
        sender_client_id: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        sender_client_id: Option<String>,
    },
    StatusResponse(StatusResponse),
    Close,
    Error(String),
}

impl InboundMessage {
    pub fn parse(text: &str) -> SignalingResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// `Ok(None)` for message types this client does not understand.
    pub fn into_event(self) -> SignalingResult<Option<SignalingEvent>> {
        let sender_client_id = self.sender_client_id.clone();
        let event = match self.message_type {
            MessageType::SdpAnswer => SignalingEvent::SdpAnswer {
                description: self.decode_payload()?,
                sender_client_id,
            },
            MessageType::SdpOffer => SignalingEvent::SdpOffer {
                description: self.decode_payload()?,
                sender_client_id,
            },
            MessageType::IceCandidate => SignalingEvent::IceCandidate {
                candidate: self.decode_payload()?,
                sender_client_id,
            },
            MessageType::StatusResponse => match self.status_response {
                Some(status) => SignalingEvent::StatusResponse(status),
                None => {
                    return Err(SignalingError::Payload(
                        "status response without body".into(),
                    ));
                }
            },
            MessageType::Unknown => return Ok(None),
        };
        Ok(Some(event))
    }

    fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> SignalingResult<T> {
        let encoded = self
            .message_payload
            .as_deref()
            .ok_or_else(|| SignalingError::Payload("missing messagePayload".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|err| SignalingError::Payload(err.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(message_type: &str, payload: &Value) -> String {
        json!({
            "messageType": message_type,
            "messagePayload": STANDARD.encode(payload.to_string()),
            "senderClientId": "master"
        })
        .to_string()
    }

    #[test]
    fn offer_wraps_description_in_base64_payload() {
        let offer = OutboundMessage::sdp_offer(&SessionDescription::offer("v=0\r\n"), None)
            .expect("encode");
        let value: Value = serde_json::from_str(&offer.to_text().expect("text")).expect("json");
        assert_eq!(value["action"], "SDP_OFFER");
        assert!(value.get("recipientClientId").is_none());
        assert_eq!(value.as_object().map(|fields| fields.len()), Some(2));

        let payload = STANDARD
            .decode(value["messagePayload"].as_str().expect("payload"))
            .expect("base64");
        let decoded: Value = serde_json::from_slice(&payload).expect("payload json");
        assert_eq!(decoded, json!({ "type": "offer", "sdp": "v=0\r\n" }));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let message = OutboundMessage::ice_candidate(&candidate, Some("master".into()))
            .expect("encode");
        assert_eq!(message.action, Action::IceCandidate);
        assert_eq!(message.recipient_client_id.as_deref(), Some("master"));
        let payload = STANDARD.decode(&message.message_payload).expect("base64");
        let decoded: Value = serde_json::from_slice(&payload).expect("json");
        assert_eq!(
            decoded,
            json!({
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            })
        );
    }

    #[test]
    fn answer_becomes_sdp_answer_event() {
        let text = inbound("SDP_ANSWER", &json!({ "type": "answer", "sdp": "v=0" }));
        let event = InboundMessage::parse(&text)
            .expect("parse")
            .into_event()
            .expect("event");
        assert_eq!(
            event,
            Some(SignalingEvent::SdpAnswer {
                description: SessionDescription::answer("v=0"),
                sender_client_id: Some("master".into()),
            })
        );
    }

    #[test]
    fn candidate_with_null_mid_decodes() {
        let text = inbound(
            "ICE_CANDIDATE",
            &json!({ "candidate": "candidate:2", "sdpMid": null, "sdpMLineIndex": 1 }),
        );
        let event = InboundMessage::parse(&text)
            .expect("parse")
            .into_event()
            .expect("event");
        match event {
            Some(SignalingEvent::IceCandidate { candidate, .. }) => {
                assert_eq!(candidate.sdp_mid, None);
                assert_eq!(candidate.sdp_mline_index, Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn status_response_keeps_error_details() {
        let text = json!({
            "messageType": "STATUS_RESPONSE",
            "statusResponse": {
                "correlationId": "c-1",
                "errorType": "InvalidArgumentException",
                "statusCode": "400",
                "description": "bad offer"
            }
        })
        .to_string();
        let event = InboundMessage::parse(&text)
            .expect("parse")
            .into_event()
            .expect("event");
        match event {
            Some(SignalingEvent::StatusResponse(status)) => {
                assert_eq!(status.error_type.as_deref(), Some("InvalidArgumentException"));
                assert_eq!(status.description.as_deref(), Some("bad offer"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_is_skipped() {
        let text = json!({ "messageType": "GO_AWAY" }).to_string();
        let event = InboundMessage::parse(&text)
            .expect("parse")
            .into_event()
            .expect("event");
        assert!(event.is_none());
    }

    #[test]
    fn corrupt_payload_is_reported() {
        let text = json!({ "messageType": "SDP_ANSWER", "messagePayload": "%%%" }).to_string();
        let result = InboundMessage::parse(&text).expect("parse").into_event();
        assert!(matches!(result, Err(SignalingError::Payload(_))));
    }
}
