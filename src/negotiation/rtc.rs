//! [`PeerBackend`] on top of the `webrtc` crate.
//!
//! A controller-side factory owns a [`ProgramFeed`]: RTP arriving on the
//! camera link that is currently on program is rewritten into one pair of
//! local tracks, and every display link sends those tracks.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        setting_engine::SettingEngine,
        APIBuilder, API,
    },
    ice_transport::{ice_candidate::RTCIceCandidate, ice_candidate::RTCIceCandidateInit},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication,
    rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use super::peer::{PeerBackend, PeerContext, PeerFactory, PeerState};
use super::LinkKey;
use crate::error::NegotiationError;
use crate::models::SlotId;
use crate::utils::rtc_config;

const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

fn vp8() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        ..Default::default()
    }
}

fn opus() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        ..Default::default()
    }
}

fn build_api_with(settings: SettingEngine, program_codecs: bool) -> Result<API, webrtc::Error> {
    let mut media_engine = MediaEngine::default();

    if program_codecs {
        // Forwarded packets keep their payload, so cameras must send what
        // the display links carry.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: vp8(),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
    } else {
        media_engine.register_default_codecs()?;
    }

    let registry = Registry::new();
    let registry = register_default_interceptors(registry, &mut media_engine)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build())
}

pub fn build_api() -> Result<API, webrtc::Error> {
    build_api_with(SettingEngine::default(), false)
}

/// The program output of a controller.
pub struct ProgramFeed {
    video: Arc<TrackLocalStaticRTP>,
    audio: Arc<TrackLocalStaticRTP>,
    on_program: watch::Sender<Option<SlotId>>,
}

impl ProgramFeed {
    pub fn new() -> Self {
        let (on_program, _) = watch::channel(None);
        ProgramFeed {
            video: Arc::new(TrackLocalStaticRTP::new(vp8(), "program-video".to_owned(), "program".to_owned())),
            audio: Arc::new(TrackLocalStaticRTP::new(opus(), "program-audio".to_owned(), "program".to_owned())),
            on_program,
        }
    }

    /// Put `slot` on program, or nothing with `None`.
    pub fn select(&self, slot: Option<SlotId>) {
        self.on_program.send_if_modified(|current| {
            if *current == slot {
                false
            } else {
                info!(slot = ?slot, "program source changed");
                *current = slot;
                true
            }
        });
    }

    pub fn selected(&self) -> Option<SlotId> {
        self.on_program.borrow().clone()
    }

    fn tracks(&self) -> [Arc<dyn TrackLocal + Send + Sync>; 2] {
        [
            Arc::clone(&self.video) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    /// Copy RTP from a camera track into the program while its slot is
    /// selected. Returns when the remote track ends.
    async fn forward(&self, slot: SlotId, track: Arc<TrackRemote>) {
        let output = match track.kind() {
            RTPCodecType::Video => &self.video,
            RTPCodecType::Audio => &self.audio,
            _ => return,
        };
        let program = self.on_program.subscribe();

        while let Ok((packet, _)) = track.read_rtp().await {
            if program.borrow().as_ref() != Some(&slot) {
                continue;
            }
            if let Err(err) = output.write_rtp(&packet).await {
                if err != webrtc::Error::ErrClosedPipe {
                    warn!(%slot, "program track write failed: {}", err);
                    break;
                }
            }
        }
        debug!(%slot, kind = %track.kind(), "camera track ended");
    }
}

impl Default for ProgramFeed {
    fn default() -> Self {
        ProgramFeed::new()
    }
}

pub struct RtcPeerFactory {
    api: API,
    config: RTCConfiguration,
    program: Option<Arc<ProgramFeed>>,
}

impl RtcPeerFactory {
    /// Factory for camera and display endpoints.
    pub fn new() -> Result<Self, NegotiationError> {
        Ok(RtcPeerFactory {
            api: build_api()?,
            config: rtc_config(),
            program: None,
        })
    }

    /// Factory for a controller: camera links feed the program, display
    /// links send it.
    pub fn with_program_feed() -> Result<Self, NegotiationError> {
        Ok(RtcPeerFactory {
            api: build_api_with(SettingEngine::default(), true)?,
            config: rtc_config(),
            program: Some(Arc::new(ProgramFeed::new())),
        })
    }

    pub fn with_config(mut self, config: RTCConfiguration) -> Self {
        self.config = config;
        self
    }

    pub fn program_feed(&self) -> Option<&Arc<ProgramFeed>> {
        self.program.as_ref()
    }
}

pub struct RtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
}

fn parse<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> Result<T, NegotiationError> {
    serde_json::from_value(value).map_err(|err| NegotiationError::Backend(format!("invalid {}: {}", what, err)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, NegotiationError> {
    serde_json::to_value(value).map_err(|err| NegotiationError::Backend(err.to_string()))
}

fn handle_candidate_event(peer_connection: &RTCPeerConnection, context: &PeerContext) {
    let sink = context.candidates.clone();
    let link = context.link.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        let link = link.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(%link, "ICE gathering complete");
                return;
            };
            match candidate.to_json().map(|init| serde_json::to_value(init)) {
                Ok(Ok(json)) => sink.emit(json),
                Ok(Err(err)) => warn!(%link, "could not encode ICE candidate: {}", err),
                Err(err) => warn!(%link, "could not read ICE candidate: {}", err),
            }
        })
    }));
}

fn handle_state_event(peer_connection: &RTCPeerConnection, context: &PeerContext) {
    let context = context.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        info!(link = %context.link, "peer connection state has changed: {}", state);
        match state {
            RTCPeerConnectionState::Connected => context.report(PeerState::Connected),
            RTCPeerConnectionState::Failed => context.report(PeerState::Failed),
            RTCPeerConnectionState::Closed => context.report(PeerState::Closed),
            _ => {}
        }
        Box::pin(async {})
    }));
}

/// Ask the camera for a keyframe on an interval so a switch to its slot
/// shows a picture quickly.
async fn request_keyframes(peer_connection: Weak<RTCPeerConnection>, media_ssrc: u32) {
    let mut ticker = tokio::time::interval(KEYFRAME_INTERVAL);
    loop {
        ticker.tick().await;
        let Some(pc) = peer_connection.upgrade() else {
            break;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
            break;
        }
    }
}

fn handle_camera_tracks(peer_connection: &Arc<RTCPeerConnection>, slot: SlotId, feed: Arc<ProgramFeed>) {
    let pc = Arc::downgrade(peer_connection);
    peer_connection.on_track(Box::new(move |track, _, _| {
        info!(%slot, kind = %track.kind(), ssrc = track.ssrc(), "camera track");
        if track.kind() == RTPCodecType::Video {
            tokio::spawn(request_keyframes(pc.clone(), track.ssrc()));
        }
        let feed = Arc::clone(&feed);
        let slot = slot.clone();
        tokio::spawn(async move { feed.forward(slot, track).await });
        Box::pin(async {})
    }));
}

fn log_remote_tracks(peer_connection: &RTCPeerConnection, link: LinkKey) {
    peer_connection.on_track(Box::new(move |track, _, _| {
        info!(%link, kind = %track.kind(), ssrc = track.ssrc(), "remote track");
        Box::pin(async {})
    }));
}

async fn send_program(peer_connection: &RTCPeerConnection, feed: &ProgramFeed) -> Result<(), NegotiationError> {
    for track in feed.tracks() {
        let rtp_sender = peer_connection.add_track(track).await?;
        // Drain RTCP so the interceptors see it.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });
    }
    Ok(())
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    type Peer = RtcPeer;

    async fn create(&self, context: PeerContext) -> Result<RtcPeer, NegotiationError> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        handle_candidate_event(&peer_connection, &context);
        handle_state_event(&peer_connection, &context);

        match (&context.link, &self.program) {
            (LinkKey::Camera(slot), Some(feed)) => {
                handle_camera_tracks(&peer_connection, slot.clone(), Arc::clone(feed));
            }
            (LinkKey::Display, Some(feed)) => {
                if let Err(err) = send_program(&peer_connection, feed).await {
                    let _ = peer_connection.close().await;
                    return Err(err);
                }
            }
            (link, None) => log_remote_tracks(&peer_connection, link.clone()),
        }

        Ok(RtcPeer { peer_connection })
    }

    fn select_program(&self, slot: Option<&SlotId>) {
        if let Some(feed) = &self.program {
            feed.select(slot.cloned());
        }
    }
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn create_offer(&self) -> Result<Value, NegotiationError> {
        if self.peer_connection.get_transceivers().await.is_empty() {
            self.peer_connection
                .add_transceiver_from_kind(RTPCodecType::Video, None)
                .await?;
            self.peer_connection
                .add_transceiver_from_kind(RTPCodecType::Audio, None)
                .await?;
        }

        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        to_json(&offer)
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, NegotiationError> {
        let desc: RTCSessionDescription = parse(offer, "offer")?;
        self.peer_connection.set_remote_description(desc).await?;

        let answer = self.peer_connection.create_answer(None).await?;
        // Sets the LocalDescription, and starts our UDP listeners
        self.peer_connection.set_local_description(answer.clone()).await?;
        to_json(&answer)
    }

    async fn accept_answer(&self, answer: Value) -> Result<(), NegotiationError> {
        let desc: RTCSessionDescription = parse(answer, "answer")?;
        self.peer_connection.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = parse(candidate, "ICE candidate")?;
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            warn!("error closing peer connection: {}", err);
        }
    }
}
