//! A camera feeding one slot of the production.

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{log_failure, peer_context, required_payload, ActiveLink, Endpoint, Signaller};
use crate::error::NegotiationError;
use crate::models::{kind, Role, SignalMessage, SlotId};
use crate::negotiation::peer::{PeerEvent, PeerFactory, PeerState};
use crate::negotiation::{LinkKey, LinkState};
use crate::types::Outbound;

const CONNECT_FAILURE: &str = "failed to establish video connection with controller";
const CONTROLLER_LEFT: &str = "controller left the session";

pub struct CameraEndpoint<F: PeerFactory> {
    signaller: Signaller,
    slot_id: SlotId,
    factory: F,
    events: UnboundedSender<PeerEvent>,
    link: Option<ActiveLink<F::Peer>>,
    generation: u64,
    last_error: Option<String>,
}

impl<F: PeerFactory> CameraEndpoint<F> {
    pub fn new(
        session_id: &str,
        slot_id: SlotId,
        outbound: Outbound,
        factory: F,
    ) -> (Self, UnboundedReceiver<PeerEvent>) {
        let (events, peer_events) = unbounded();
        let endpoint = CameraEndpoint {
            signaller: Signaller::new(session_id, outbound),
            slot_id,
            factory,
            events,
            link: None,
            generation: 0,
            last_error: None,
        };
        (endpoint, peer_events)
    }

    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.link.as_ref().map(ActiveLink::state)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Throw away the current link and negotiate again from scratch.
    pub async fn restart(&mut self) -> Result<(), NegotiationError> {
        self.last_error = None;
        self.offer().await
    }

    /// Report a zoom change to the controller.
    pub fn zoom(&self, zoom: f64) -> bool {
        self.signaller.send(
            kind::CAMERA_ZOOM,
            Some(&self.slot_id),
            Some(json!({ "zoom": zoom })),
            Some(Role::Controller),
        )
    }

    /// Announce departure and close the link.
    pub async fn leave(&mut self) {
        self.signaller
            .send(kind::CAMERA_DISCONNECTED, Some(&self.slot_id), None, None);
        self.close_link().await;
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    async fn offer(&mut self) -> Result<(), NegotiationError> {
        self.close_link().await;

        self.generation += 1;
        let key = LinkKey::Camera(self.slot_id.clone());
        let context = peer_context(
            &self.signaller,
            &self.events,
            key.clone(),
            self.generation,
            kind::WEBRTC_CANDIDATE,
            Role::Controller,
        );
        let peer = self.factory.create(context).await?;
        let mut link = ActiveLink::new(key, self.generation, peer);

        match link.offer().await {
            Ok(offer) => {
                self.signaller.send(
                    kind::WEBRTC_OFFER,
                    Some(&self.slot_id),
                    Some(offer),
                    Some(Role::Controller),
                );
                self.link = Some(link);
                Ok(())
            }
            Err(err) => {
                link.fail();
                link.close().await;
                self.last_error = Some(CONNECT_FAILURE.to_string());
                Err(err)
            }
        }
    }

    async fn accept_answer(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let answer = required_payload(signal)?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| NegotiationError::NoLink(LinkKey::Camera(self.slot_id.clone()).to_string()))?;
        if let Err(err) = link.accept_answer(answer).await {
            if let Some(mut link) = self.link.take() {
                link.fail();
                link.close().await;
            }
            self.last_error = Some(CONNECT_FAILURE.to_string());
            return Err(err);
        }
        Ok(())
    }

    async fn remote_candidate(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let candidate = required_payload(signal)?;
        match self.link.as_mut() {
            Some(link) => link.remote_candidate(candidate).await,
            None => Err(NegotiationError::NoLink(LinkKey::Camera(self.slot_id.clone()).to_string())),
        }
    }

    fn is_mine(&self, signal: &SignalMessage) -> bool {
        signal.target == Some(Role::Camera) && signal.is_slot(&self.slot_id)
    }
}

#[async_trait]
impl<F: PeerFactory> Endpoint for CameraEndpoint<F> {
    async fn start(&mut self) -> Result<(), NegotiationError> {
        if !self.signaller.join(Role::Camera, Some(self.slot_id.clone())) {
            return Err(NegotiationError::ChannelClosed);
        }
        self.offer().await
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        let result = match signal.kind.as_str() {
            kind::WEBRTC_ANSWER if self.is_mine(&signal) => self.accept_answer(&signal).await,
            kind::WEBRTC_CANDIDATE if self.is_mine(&signal) => self.remote_candidate(&signal).await,
            kind::PARTICIPANT_LEFT => {
                let role = signal
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.get("role"))
                    .and_then(Value::as_str);
                if role == Some("controller") && self.link.is_some() {
                    info!(slot = %self.slot_id, "{}", CONTROLLER_LEFT);
                    self.close_link().await;
                    self.last_error = Some(CONTROLLER_LEFT.to_string());
                }
                Ok(())
            }
            other => {
                debug!(kind = other, slot = %self.slot_id, "camera ignores signal");
                Ok(())
            }
        };

        if let Err(err) = result {
            log_failure(Role::Camera, &signal.kind, Some(&self.slot_id), &err);
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.owns(&event) {
            debug!(slot = %self.slot_id, generation = event.generation, "ignoring event of a replaced peer");
            return;
        }

        match event.state {
            PeerState::Connected => match link.connected() {
                Ok(()) => info!(slot = %self.slot_id, "connected to controller"),
                Err(err) => log_failure(Role::Camera, "peer-connected", Some(&self.slot_id), &err),
            },
            PeerState::Failed => {
                warn!(slot = %self.slot_id, "link to controller failed");
                self.last_error = Some(CONNECT_FAILURE.to_string());
                self.close_link().await;
            }
            PeerState::Closed => self.close_link().await,
        }
    }

    async fn shutdown(&mut self) {
        self.leave().await;
    }
}
