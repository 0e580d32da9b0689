//! The production controller: receives every camera slot, composes the
//! program and feeds it to the display.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{log_failure, peer_context, required_payload, ActiveLink, Endpoint, Signaller};
use crate::error::NegotiationError;
use crate::models::{kind, Role, SignalMessage, SlotId};
use crate::negotiation::peer::{PeerEvent, PeerFactory, PeerState};
use crate::negotiation::{LinkKey, LinkState};
use crate::state::{CameraSlotSummary, ProductionState, SlotStatus, SourceMode, SourceType, StateBroadcaster};
use crate::types::Outbound;

const CAMERA_FAILURE: &str = "failed to establish video connection with camera";
const DISPLAY_FAILURE: &str = "failed to establish video connection with display";
/// Remote candidates held per slot before its offer arrives.
const MAX_EARLY_CANDIDATES: usize = 32;

pub struct ControllerEndpoint<F: PeerFactory> {
    signaller: Signaller,
    factory: F,
    events: UnboundedSender<PeerEvent>,
    cameras: HashMap<SlotId, ActiveLink<F::Peer>>,
    // remote candidates for slots whose offer has not arrived yet;
    // cleared when the slot's camera leaves
    early_candidates: HashMap<SlotId, Vec<Value>>,
    display: Option<ActiveLink<F::Peer>>,
    display_ready: bool,
    generation: u64,
    state: ProductionState,
    broadcaster: StateBroadcaster,
    last_error: Option<String>,
}

impl<F: PeerFactory> ControllerEndpoint<F> {
    /// Build a controller with `slots` camera slots. The returned receiver
    /// carries the connection events of every peer this controller creates
    /// and goes to [`run_endpoint`](super::run_endpoint).
    pub fn new(
        session_id: &str,
        outbound: Outbound,
        factory: F,
        slots: u32,
    ) -> (Self, UnboundedReceiver<PeerEvent>) {
        let signaller = Signaller::new(session_id, outbound);
        let broadcaster = StateBroadcaster::new(signaller.session_id(), signaller.outbound().clone());
        let (events, peer_events) = unbounded();
        let endpoint = ControllerEndpoint {
            signaller,
            factory,
            events,
            cameras: HashMap::new(),
            early_candidates: HashMap::new(),
            display: None,
            display_ready: false,
            generation: 0,
            state: ProductionState::with_slots(slots),
            broadcaster,
            last_error: None,
        };
        (endpoint, peer_events)
    }

    pub fn state(&self) -> &ProductionState {
        &self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn camera_link_state(&self, slot_id: &SlotId) -> Option<LinkState> {
        self.cameras.get(slot_id).map(ActiveLink::state)
    }

    pub fn camera_link_count(&self) -> usize {
        self.cameras.len()
    }

    pub fn display_link_state(&self) -> Option<LinkState> {
        self.display.as_ref().map(ActiveLink::state)
    }

    /// Apply a local change to the production state and publish the new
    /// snapshot. The display link is renegotiated when the program source
    /// it carries changes.
    pub async fn update_state<M>(&mut self, mutate: M)
    where
        M: FnOnce(&mut ProductionState),
    {
        let before = (self.state.active_camera_id, self.state.source_mode);
        mutate(&mut self.state);
        self.publish();

        let after = (self.state.active_camera_id, self.state.source_mode);
        if before != after && self.display_ready && self.state.source_mode == SourceMode::Controller {
            if let Err(err) = self.offer_to_display().await {
                log_failure(Role::Controller, kind::DISPLAY_OFFER, None, &err);
                self.last_error = Some(DISPLAY_FAILURE.to_string());
            }
        }
    }

    /// Put a connected camera on program. Returns false if the slot has no
    /// connected link.
    pub async fn select_camera(&mut self, slot_id: u32) -> bool {
        let connected = self
            .cameras
            .get(&SlotId::from(slot_id))
            .map_or(false, |link| link.state() == LinkState::Connected);
        if !connected {
            return false;
        }
        self.update_state(|state| {
            state.active_camera_id = Some(slot_id);
            state.active_camera_zoom = None;
        })
        .await;
        true
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn publish(&mut self) {
        self.refresh_slots();
        let program = self.state.active_camera_id.map(SlotId::from);
        self.factory.select_program(program.as_ref());
        self.broadcaster.publish(&self.state);
    }

    /// Derive the slot summaries from the live camera links.
    fn refresh_slots(&mut self) {
        for id in self.cameras.keys().filter_map(SlotId::number) {
            if self.state.slot_mut(id).is_none() {
                self.state.camera_slots.push(CameraSlotSummary {
                    id,
                    name: format!("Camera {}", id),
                    ..Default::default()
                });
            }
        }

        let active = self.state.active_camera_id;
        for slot in &mut self.state.camera_slots {
            let connected = self
                .cameras
                .get(&SlotId::from(slot.id))
                .map_or(false, |link| link.state() == LinkState::Connected);
            if connected {
                slot.status = if active == Some(slot.id) {
                    SlotStatus::Active
                } else {
                    SlotStatus::Connected
                };
                slot.source_type = Some(SourceType::Remote);
            } else {
                slot.status = SlotStatus::Disconnected;
                slot.source_type = None;
            }
        }
    }

    async fn accept_camera_offer(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let Some(slot_id) = signal.slot_id.clone() else {
            return Err(NegotiationError::MissingPayload("slotId".to_string()));
        };
        let offer = required_payload(signal)?;

        if let Some(previous) = self.cameras.remove(&slot_id) {
            info!(session = %self.signaller.session_id(), slot = %slot_id, "replacing camera link");
            previous.close().await;
        }

        let key = LinkKey::Camera(slot_id.clone());
        let generation = self.next_generation();
        let context = peer_context(
            &self.signaller,
            &self.events,
            key.clone(),
            generation,
            kind::WEBRTC_CANDIDATE,
            Role::Camera,
        );
        let peer = self.factory.create(context).await?;
        let mut link = ActiveLink::new(key, generation, peer);

        let early = self.early_candidates.remove(&slot_id).unwrap_or_default();
        let negotiated = match link.hold(early) {
            Ok(()) => link.answer(offer).await,
            Err(err) => Err(err),
        };

        match negotiated {
            Ok(answer) => {
                self.signaller
                    .send(kind::WEBRTC_ANSWER, Some(&slot_id), Some(answer), Some(Role::Camera));
                self.cameras.insert(slot_id, link);
                Ok(())
            }
            Err(err) => {
                link.fail();
                link.close().await;
                self.last_error = Some(CAMERA_FAILURE.to_string());
                Err(err)
            }
        }
    }

    async fn camera_candidate(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        if signal.target != Some(Role::Controller) {
            return Ok(());
        }
        let Some(slot_id) = signal.slot_id.clone() else {
            return Ok(());
        };
        let candidate = required_payload(signal)?;

        match self.cameras.get_mut(&slot_id) {
            Some(link) => link.remote_candidate(candidate).await,
            None => {
                let held = self.early_candidates.entry(slot_id.clone()).or_default();
                if held.len() >= MAX_EARLY_CANDIDATES {
                    warn!(slot = %slot_id, "dropping candidate, too many waiting for an offer");
                } else {
                    debug!(slot = %slot_id, "holding candidate until the camera offer arrives");
                    held.push(candidate);
                }
                Ok(())
            }
        }
    }

    /// Forget a camera slot and move the program off it if it was live.
    async fn drop_camera(&mut self, slot_id: &SlotId) {
        self.early_candidates.remove(slot_id);
        if let Some(link) = self.cameras.remove(slot_id) {
            link.close().await;
        }
        if slot_id.number().is_some() && self.state.active_camera_id == slot_id.number() {
            self.state.active_camera_id = None;
            self.state.active_camera_zoom = None;
            if self.state.source_mode == SourceMode::Controller {
                self.state.source_mode = SourceMode::Local;
            }
        }
        info!(session = %self.signaller.session_id(), slot = %slot_id, "camera left");
        self.publish();
    }

    async fn close_display(&mut self) {
        self.display_ready = false;
        if let Some(link) = self.display.take() {
            link.close().await;
        }
    }

    async fn participant_left(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let role = signal
            .payload
            .as_ref()
            .and_then(|payload| payload.get("role"))
            .and_then(Value::as_str);
        match (role, &signal.slot_id) {
            (Some("camera"), Some(slot_id)) => {
                let slot_id = slot_id.clone();
                self.drop_camera(&slot_id).await;
            }
            (Some("display"), _) => self.close_display().await,
            _ => {}
        }
        Ok(())
    }

    fn camera_zoom(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let zoom = required_payload(signal)?
            .get("zoom")
            .and_then(Value::as_f64)
            .ok_or_else(|| NegotiationError::MissingPayload("zoom".to_string()))?;
        let from_active = self.state.active_camera_id.is_some()
            && signal.slot_id.as_ref().and_then(SlotId::number) == self.state.active_camera_id;
        if from_active && zoom > 0.0 {
            self.state.active_camera_zoom = Some(zoom);
            self.publish();
        }
        Ok(())
    }

    async fn offer_to_display(&mut self) -> Result<(), NegotiationError> {
        if let Some(previous) = self.display.take() {
            previous.close().await;
        }

        let generation = self.next_generation();
        let context = peer_context(
            &self.signaller,
            &self.events,
            LinkKey::Display,
            generation,
            kind::DISPLAY_CANDIDATE,
            Role::Display,
        );
        let peer = self.factory.create(context).await?;
        let mut link = ActiveLink::new(LinkKey::Display, generation, peer);

        match link.offer().await {
            Ok(offer) => {
                self.signaller
                    .send(kind::DISPLAY_OFFER, None, Some(offer), Some(Role::Display));
                self.display = Some(link);
                Ok(())
            }
            Err(err) => {
                link.fail();
                link.close().await;
                Err(err)
            }
        }
    }

    async fn display_ready(&mut self) -> Result<(), NegotiationError> {
        self.display_ready = true;
        self.publish();
        self.offer_to_display().await.map_err(|err| {
            self.last_error = Some(DISPLAY_FAILURE.to_string());
            err
        })
    }

    async fn display_answer(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let answer = required_payload(signal)?;
        let link = self
            .display
            .as_mut()
            .ok_or_else(|| NegotiationError::NoLink(LinkKey::Display.to_string()))?;
        if let Err(err) = link.accept_answer(answer).await {
            if let Some(mut link) = self.display.take() {
                link.fail();
                link.close().await;
            }
            self.last_error = Some(DISPLAY_FAILURE.to_string());
            return Err(err);
        }
        Ok(())
    }

    async fn display_candidate(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        if signal.target != Some(Role::Controller) {
            return Ok(());
        }
        let candidate = required_payload(signal)?;
        match self.display.as_mut() {
            Some(link) => link.remote_candidate(candidate).await,
            None => Err(NegotiationError::NoLink(LinkKey::Display.to_string())),
        }
    }

    async fn camera_event(&mut self, slot_id: SlotId, event: PeerEvent) {
        let Some(link) = self.cameras.get_mut(&slot_id) else {
            debug!(slot = %slot_id, "event for a camera link that is gone");
            return;
        };
        if !link.owns(&event) {
            debug!(slot = %slot_id, generation = event.generation, "ignoring event of a replaced peer");
            return;
        }

        match event.state {
            PeerState::Connected => {
                if let Err(err) = link.connected() {
                    log_failure(Role::Controller, "peer-connected", Some(&slot_id), &err);
                    return;
                }
                info!(session = %self.signaller.session_id(), slot = %slot_id, "camera connected");
                if self.state.active_camera_id.is_none() {
                    self.state.active_camera_id = slot_id.number();
                }
                self.publish();
            }
            PeerState::Failed => {
                warn!(session = %self.signaller.session_id(), slot = %slot_id, "camera link failed");
                self.last_error = Some(CAMERA_FAILURE.to_string());
                self.drop_camera(&slot_id).await;
            }
            PeerState::Closed => self.drop_camera(&slot_id).await,
        }
    }

    async fn display_event(&mut self, event: PeerEvent) {
        let Some(link) = self.display.as_mut() else {
            return;
        };
        if !link.owns(&event) {
            debug!(generation = event.generation, "ignoring event of a replaced display peer");
            return;
        }

        match event.state {
            PeerState::Connected => {
                if let Err(err) = link.connected() {
                    log_failure(Role::Controller, "peer-connected", None, &err);
                } else {
                    info!(session = %self.signaller.session_id(), "display connected");
                }
            }
            PeerState::Failed | PeerState::Closed => {
                if event.state == PeerState::Failed {
                    self.last_error = Some(DISPLAY_FAILURE.to_string());
                }
                if let Some(link) = self.display.take() {
                    link.close().await;
                }
            }
        }
    }
}

#[async_trait]
impl<F: PeerFactory> Endpoint for ControllerEndpoint<F> {
    async fn start(&mut self) -> Result<(), NegotiationError> {
        if !self.signaller.join(Role::Controller, None) {
            return Err(NegotiationError::ChannelClosed);
        }
        self.publish();
        Ok(())
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        if !signal.is_for(Role::Controller) {
            return;
        }

        let result = match signal.kind.as_str() {
            kind::WEBRTC_OFFER => self.accept_camera_offer(&signal).await,
            kind::WEBRTC_CANDIDATE => self.camera_candidate(&signal).await,
            kind::CAMERA_DISCONNECTED => {
                if let Some(slot_id) = signal.slot_id.clone() {
                    self.drop_camera(&slot_id).await;
                }
                Ok(())
            }
            kind::PARTICIPANT_LEFT => self.participant_left(&signal).await,
            kind::CAMERA_ZOOM => self.camera_zoom(&signal),
            kind::DISPLAY_READY => self.display_ready().await,
            kind::DISPLAY_ANSWER => self.display_answer(&signal).await,
            kind::DISPLAY_CANDIDATE => self.display_candidate(&signal).await,
            other => {
                debug!(kind = other, "controller ignores signal");
                Ok(())
            }
        };

        if let Err(err) = result {
            log_failure(Role::Controller, &signal.kind, signal.slot_id.as_ref(), &err);
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event.link.clone() {
            LinkKey::Camera(slot_id) => self.camera_event(slot_id, event).await,
            LinkKey::Display => self.display_event(event).await,
        }
    }

    async fn shutdown(&mut self) {
        for (_, link) in self.cameras.drain() {
            link.close().await;
        }
        self.close_display().await;
    }
}
