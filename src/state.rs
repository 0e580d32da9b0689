//! Production state: the controller-owned description of the program output.
//!
//! The controller is the only writer. Every change is published as a full
//! snapshot (`state-update`, no target) so a display that joins or
//! reconnects at any point is correct after a single message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::helpers::send_payload;
use crate::models::{kind, SignalMessage, WireMessage};
use crate::types::Outbound;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStyle {
    #[default]
    Cut,
    Fade,
    Dissolve,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Local,
    Controller,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnimationStyle {
    #[default]
    Fade,
    SlideUp,
    SlideDown,
    Scroll,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicPosition {
    Top,
    Middle,
    #[default]
    Bottom,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    Left,
    #[default]
    Center,
    Right,
}

/// Styling shared by the text overlays.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OverlayStyle {
    pub font_size: String,
    pub font_family: String,
    pub text_color: String,
    pub text_align: TextAlign,
    pub background_color: String,
    pub background_opacity: f64,
    pub animation_style: AnimationStyle,
    pub position: GraphicPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        OverlayStyle {
            font_size: "2rem".to_string(),
            font_family: "sans-serif".to_string(),
            text_color: "#ffffff".to_string(),
            text_align: TextAlign::Center,
            background_color: "#000000".to_string(),
            background_opacity: 0.6,
            animation_style: AnimationStyle::Fade,
            position: GraphicPosition::Bottom,
            scale: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LowerThirdConfig {
    pub is_visible: bool,
    pub top_text: String,
    pub main_text: String,
    pub logo_icon: String,
    pub accent_color: String,
    pub main_bar_color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnouncementConfig {
    pub is_visible: bool,
    pub text: String,
    #[serde(flatten)]
    pub style: OverlayStyle,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Song {
    pub title: String,
    pub verses: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LyricsConfig {
    pub is_visible: bool,
    pub song: Option<Song>,
    pub verse_index: usize,
    #[serde(flatten)]
    pub style: OverlayStyle,
}

impl LyricsConfig {
    pub fn current_verse(&self) -> Option<&str> {
        self.song
            .as_ref()
            .and_then(|song| song.verses.get(self.verse_index))
            .map(String::as_str)
    }

    /// Step to the next verse, staying on the last one.
    pub fn next_verse(&mut self) {
        if let Some(song) = &self.song {
            if self.verse_index + 1 < song.verses.len() {
                self.verse_index += 1;
            }
        }
    }

    pub fn previous_verse(&mut self) {
        self.verse_index = self.verse_index.saturating_sub(1);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BibleVerseConfig {
    pub is_visible: bool,
    pub text: String,
    pub reference: String,
    #[serde(flatten)]
    pub style: OverlayStyle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    #[default]
    Disconnected,
    Connected,
    Active,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Remote,
}

/// Camera slot as seen by the display: no media, only status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CameraSlotSummary {
    pub id: u32,
    pub name: String,
    pub status: SlotStatus,
    pub source_type: Option<SourceType>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductionState {
    #[serde(alias = "activeCamera")]
    pub active_camera_id: Option<u32>,
    pub is_live: bool,
    pub transition: TransitionStyle,
    pub source_mode: SourceMode,
    pub active_camera_zoom: Option<f64>,
    #[serde(alias = "lowerThird")]
    pub lower_third_config: LowerThirdConfig,
    pub lower_third_animation_key: u64,
    #[serde(alias = "announcement")]
    pub announcement_config: AnnouncementConfig,
    #[serde(alias = "lyrics")]
    pub lyrics_config: LyricsConfig,
    #[serde(alias = "bibleVerse")]
    pub bible_verse_config: BibleVerseConfig,
    pub camera_slots: Vec<CameraSlotSummary>,
}

impl ProductionState {
    /// Default program state with `slots` empty camera slots numbered from 1.
    pub fn with_slots(slots: u32) -> Self {
        ProductionState {
            camera_slots: (1..=slots)
                .map(|id| CameraSlotSummary {
                    id,
                    name: format!("Camera {}", id),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn slot_mut(&mut self, id: u32) -> Option<&mut CameraSlotSummary> {
        self.camera_slots.iter_mut().find(|slot| slot.id == id)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        ProductionState::deserialize(payload)
    }
}

/// Publishes full-state snapshots for one session.
#[derive(Clone, Debug)]
pub struct StateBroadcaster {
    session_id: String,
    outbound: Outbound,
    published: u64,
}

impl StateBroadcaster {
    pub fn new(session_id: impl Into<String>, outbound: Outbound) -> Self {
        StateBroadcaster {
            session_id: session_id.into(),
            outbound,
            published: 0,
        }
    }

    /// Relay `state` as a `state-update` broadcast to the whole session.
    pub fn publish(&mut self, state: &ProductionState) -> bool {
        let payload = match serde_json::to_value(state) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(session = %self.session_id, "could not serialise production state: {}", err);
                return false;
            }
        };
        let signal = SignalMessage::new(self.session_id.clone(), kind::STATE_UPDATE).payload(payload);
        let sent = send_payload(&self.outbound, WireMessage::Signal(signal));
        if sent {
            self.published += 1;
        }
        sent
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_channel::mpsc::unbounded;
    use serde_json::json;

    #[test]
    fn partial_payload_fills_defaults() {
        let state = ProductionState::from_payload(&json!({
            "activeCamera": 1,
            "lowerThird": { "isVisible": true, "mainText": "Welcome" }
        }))
        .unwrap();

        assert_eq!(state.active_camera_id, Some(1));
        assert!(state.lower_third_config.is_visible);
        assert_eq!(state.lower_third_config.main_text, "Welcome");
        assert_eq!(state.source_mode, SourceMode::Local);
        assert!(!state.lyrics_config.is_visible);
    }

    #[test]
    fn overlay_style_is_flattened_in_camel_case() {
        let mut state = ProductionState::default();
        state.announcement_config.text = "Potluck after service".into();
        state.announcement_config.style.animation_style = AnimationStyle::SlideUp;

        let json = serde_json::to_value(&state).unwrap();
        let announcement = &json["announcementConfig"];
        assert_eq!(announcement["text"], "Potluck after service");
        assert_eq!(announcement["animationStyle"], "slideUp");
        assert_eq!(announcement["backgroundOpacity"], json!(0.6));
        assert_eq!(json["sourceMode"], "local");
    }

    #[test]
    fn lyrics_verse_navigation_stays_in_bounds() {
        let mut lyrics = LyricsConfig {
            song: Some(Song {
                title: "Amazing Grace".into(),
                verses: vec!["first".into(), "second".into()],
            }),
            ..Default::default()
        };
        lyrics.previous_verse();
        assert_eq!(lyrics.current_verse(), Some("first"));
        lyrics.next_verse();
        lyrics.next_verse();
        assert_eq!(lyrics.current_verse(), Some("second"));
    }

    #[test]
    fn publish_sends_untargeted_full_snapshot() {
        let (tx, mut rx) = unbounded();
        let mut broadcaster = StateBroadcaster::new("abc", tx);
        let mut state = ProductionState::with_slots(3);
        state.lower_third_config.main_text = "Welcome".into();

        assert!(broadcaster.publish(&state));
        assert_eq!(broadcaster.published(), 1);

        let Ok(Some(WireMessage::Signal(signal))) = rx.try_next() else {
            panic!("expected a state-update");
        };
        assert_eq!(signal.kind, kind::STATE_UPDATE);
        assert_eq!(signal.target, None);
        let echoed = ProductionState::from_payload(signal.payload.as_ref().unwrap()).unwrap();
        assert_eq!(echoed, state);
    }
}
