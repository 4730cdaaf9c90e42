use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// A complete inbound signaling document, one per client stream.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Offer(OfferPayload),
    Coordinates(CoordinatesPayload),
    IceCandidate(IceCandidatePayload),
    /// Parsed fine but carries a `type` we do not handle.
    Unknown(String),
}

/// `{"type":"offer","sdp":"..."}`. `sdp` stays optional so a truncated
/// offer reaches the session and is rejected there.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct OfferPayload {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub sdp: Option<String>,
}

/// `{"type":"coords","x":..,"y":..}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct CoordinatesPayload {
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

/// `{"type":"ice-candidate","candidate":"...","sdpMid":"0","sdpMLineIndex":0}`
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl InboundMessage {
    /// Parse one finished stream payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let message = match kind.as_str() {
            "offer" => InboundMessage::Offer(serde_json::from_value(value)?),
            "coords" => InboundMessage::Coordinates(serde_json::from_value(value)?),
            "ice-candidate" => InboundMessage::IceCandidate(serde_json::from_value(value)?),
            _ => InboundMessage::Unknown(kind),
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Offer(_) => "offer",
            InboundMessage::Coordinates(_) => "coords",
            InboundMessage::IceCandidate(_) => "ice-candidate",
            InboundMessage::Unknown(kind) => kind,
        }
    }
}

/// Distance between reported and true position, or `"N/A"` when no
/// producer is running.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScoreError {
    Distance(f64),
    Unavailable,
}

impl Serialize for ScoreError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScoreError::Distance(d) => serializer.serialize_f64(*d),
            ScoreError::Unavailable => serializer.serialize_str("N/A"),
        }
    }
}

/// Documents the server writes, one per outbound stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Answer {
        sdp: String,
    },
    Error {
        error: ScoreError,
        client_x: f64,
        client_y: f64,
        true_x: Option<f64>,
        true_y: Option<f64>,
    },
}

impl OutboundMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_offer_and_coords() {
        let offer = InboundMessage::parse(br#"{"type":"offer","sdp":"v=0"}"#).unwrap();
        assert_eq!(
            offer,
            InboundMessage::Offer(OfferPayload {
                kind: Some("offer".into()),
                sdp: Some("v=0".into()),
            })
        );

        let coords = InboundMessage::parse(br#"{"type":"coords","x":1.5,"y":2}"#).unwrap();
        assert_eq!(
            coords,
            InboundMessage::Coordinates(CoordinatesPayload { x: Some(1.5), y: Some(2.0) })
        );
    }

    #[test]
    fn offer_without_sdp_still_parses() {
        match InboundMessage::parse(br#"{"type":"offer"}"#).unwrap() {
            InboundMessage::Offer(p) => assert!(p.sdp.is_none()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let msg = InboundMessage::parse(
            br#"{"type":"ice-candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::IceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_and_untyped_documents() {
        assert_eq!(
            InboundMessage::parse(br#"{"type":"bye"}"#).unwrap(),
            InboundMessage::Unknown("bye".into())
        );
        assert_eq!(InboundMessage::parse(br#"[1,2]"#).unwrap().kind(), "unknown");
        assert!(InboundMessage::parse(b"{not json").is_err());
    }

    #[test]
    fn error_message_wire_shape() {
        let scored = OutboundMessage::Error {
            error: ScoreError::Distance(14.142135623730951),
            client_x: 110.0,
            client_y: 160.0,
            true_x: Some(100.0),
            true_y: Some(150.0),
        };
        let v: Value = serde_json::from_slice(&scored.to_bytes().unwrap()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["error"], 14.142135623730951);
        assert_eq!(v["true_x"], 100.0);

        let unscored = OutboundMessage::Error {
            error: ScoreError::Unavailable,
            client_x: 1.0,
            client_y: 2.0,
            true_x: None,
            true_y: None,
        };
        let v: Value = serde_json::from_slice(&unscored.to_bytes().unwrap()).unwrap();
        assert_eq!(v["error"], "N/A");
        assert!(v["true_x"].is_null());
        assert!(v["true_y"].is_null());
    }

    #[test]
    fn answer_wire_shape() {
        let bytes = OutboundMessage::Answer { sdp: "v=0".into() }.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"answer","sdp":"v=0"}"#.to_vec());
    }
}
