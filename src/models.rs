use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

/// Signal types carried over the relay. The hub never interprets them
/// except `state-update` (cached for late joiners) and `participant-left`
/// (emitted by the hub itself).
pub mod kind {
    pub const WEBRTC_OFFER: &str = "webrtc-offer";
    pub const WEBRTC_ANSWER: &str = "webrtc-answer";
    pub const WEBRTC_CANDIDATE: &str = "webrtc-candidate";
    pub const CAMERA_DISCONNECTED: &str = "camera-disconnected";
    pub const CAMERA_ZOOM: &str = "camera-zoom";
    pub const DISPLAY_READY: &str = "display-ready";
    pub const DISPLAY_OFFER: &str = "display-webrtc-offer";
    pub const DISPLAY_ANSWER: &str = "display-webrtc-answer";
    pub const DISPLAY_CANDIDATE: &str = "display-webrtc-candidate";
    pub const STATE_UPDATE: &str = "state-update";
    pub const PARTICIPANT_LEFT: &str = "participant-left";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Camera,
    Display,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Camera => "camera",
            Role::Display => "display",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera slot identifier. Clients send it either as a number or a string;
/// both forms compare equal once normalised.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        SlotId(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form, used by the controller to index its camera slots.
    pub fn number(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        SlotId(id.to_string())
    }
}

impl From<&str> for SlotId {
    fn from(id: &str) -> Self {
        SlotId::new(id)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SlotId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SlotId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => SlotId(n.to_string()),
            Raw::Text(s) => SlotId::new(s),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub session_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
}

/// The routed unit of the relay.
///
/// Fields the hub does not know about are kept in `extra` so that a relayed
/// frame reaches its recipients with everything the sender put in it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Role>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalMessage {
    pub fn new(session_id: impl Into<String>, kind: impl Into<String>) -> Self {
        SignalMessage {
            session_id: Some(session_id.into()),
            kind: kind.into(),
            slot_id: None,
            payload: None,
            target: None,
            extra: Map::new(),
        }
    }

    pub fn slot(mut self, slot_id: impl Into<SlotId>) -> Self {
        self.slot_id = Some(slot_id.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn target(mut self, role: Role) -> Self {
        self.target = Some(role);
        self
    }

    /// Whether a participant with `role` should act on this message.
    pub fn is_for(&self, role: Role) -> bool {
        self.target.map_or(true, |target| target == role)
    }

    pub fn is_slot(&self, slot_id: &SlotId) -> bool {
        self.slot_id.as_ref() == Some(slot_id)
    }
}

/// Frame envelope on the signaling socket, in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum WireMessage {
    Join(JoinRequest),
    Signal(SignalMessage),
}

impl WireMessage {
    pub fn to_text(&self) -> String {
        // Serialising these types cannot fail: every map key is a string.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn signal_keeps_unknown_fields() {
        let raw = json!({
            "event": "signal",
            "sessionId": "abc",
            "type": "webrtc-offer",
            "slotId": 1,
            "target": "controller",
            "payload": { "type": "offer", "sdp": "v=0" },
            "sentAt": 1234
        });

        let parsed: WireMessage = serde_json::from_value(raw).unwrap();
        let WireMessage::Signal(signal) = parsed else {
            panic!("expected a signal");
        };
        assert_eq!(signal.slot_id, Some(SlotId::from(1)));
        assert_eq!(signal.target, Some(Role::Controller));
        assert_eq!(signal.extra.get("sentAt"), Some(&json!(1234)));

        let echoed: Value = serde_json::from_str(&WireMessage::Signal(signal).to_text()).unwrap();
        assert_eq!(echoed["sentAt"], json!(1234));
        assert_eq!(echoed["slotId"], json!("1"));
    }

    #[test]
    fn numeric_and_text_slots_compare_equal() {
        let a: SlotId = serde_json::from_value(json!(2)).unwrap();
        let b: SlotId = serde_json::from_value(json!(" 2 ")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.number(), Some(2));
    }

    #[test]
    fn join_without_slot() {
        let join: WireMessage =
            serde_json::from_str(r#"{"event":"join","sessionId":"abc","role":"display"}"#).unwrap();
        assert_eq!(
            join,
            WireMessage::Join(JoinRequest {
                session_id: "abc".into(),
                role: Role::Display,
                slot_id: None,
            })
        );
    }

    #[test]
    fn untargeted_signal_is_for_everyone() {
        let signal = SignalMessage::new("abc", kind::STATE_UPDATE);
        assert!(signal.is_for(Role::Display));
        assert!(signal.is_for(Role::Camera));
        let targeted = signal.target(Role::Camera);
        assert!(!targeted.is_for(Role::Display));
    }
}
