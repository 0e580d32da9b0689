//! The program display: renders the controller's output and overlays.

use async_trait::async_trait;
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{log_failure, peer_context, required_payload, ActiveLink, Endpoint, Signaller};
use crate::error::NegotiationError;
use crate::models::{kind, Role, SignalMessage};
use crate::negotiation::peer::{PeerEvent, PeerFactory, PeerState};
use crate::negotiation::{LinkKey, LinkState};
use crate::state::{ProductionState, SourceMode};
use crate::types::Outbound;

const CONNECT_FAILURE: &str = "failed to establish video connection with controller";

/// What the display is actually showing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisibleSource {
    /// The display's own fallback feed.
    Local,
    /// The controller's program feed.
    Controller,
}

pub struct DisplayEndpoint<F: PeerFactory> {
    signaller: Signaller,
    factory: F,
    events: UnboundedSender<PeerEvent>,
    link: Option<ActiveLink<F::Peer>>,
    pending_candidates: Vec<Value>,
    generation: u64,
    state: ProductionState,
    controller_feed_live: bool,
    visible: VisibleSource,
    last_error: Option<String>,
}

impl<F: PeerFactory> DisplayEndpoint<F> {
    pub fn new(session_id: &str, outbound: Outbound, factory: F) -> (Self, UnboundedReceiver<PeerEvent>) {
        let (events, peer_events) = unbounded();
        let endpoint = DisplayEndpoint {
            signaller: Signaller::new(session_id, outbound),
            factory,
            events,
            link: None,
            pending_candidates: Vec::new(),
            generation: 0,
            state: ProductionState::default(),
            controller_feed_live: false,
            visible: VisibleSource::Local,
            last_error: None,
        };
        (endpoint, peer_events)
    }

    pub fn state(&self) -> &ProductionState {
        &self.state
    }

    pub fn visible_source(&self) -> VisibleSource {
        self.visible
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.link.as_ref().map(ActiveLink::state)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// A `controller` source is only shown once its media is actually live;
    /// until then the local fallback stays on screen.
    fn refresh_visible(&mut self) {
        let next = match self.state.source_mode {
            SourceMode::Controller if self.controller_feed_live => VisibleSource::Controller,
            _ => VisibleSource::Local,
        };
        if next != self.visible {
            info!(session = %self.signaller.session_id(), source = ?next, "switching visible source");
            self.visible = next;
        }
    }

    async fn close_link(&mut self) {
        self.controller_feed_live = false;
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.refresh_visible();
    }

    fn apply_state(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let payload = required_payload(signal)?;
        match ProductionState::from_payload(&payload) {
            Ok(state) => {
                self.state = state;
                self.refresh_visible();
            }
            // keep what is on screen
            Err(err) => warn!(session = %self.signaller.session_id(), "ignoring malformed state-update: {}", err),
        }
        Ok(())
    }

    async fn accept_offer(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        let offer = required_payload(signal)?;
        self.close_link().await;

        self.generation += 1;
        let context = peer_context(
            &self.signaller,
            &self.events,
            LinkKey::Display,
            self.generation,
            kind::DISPLAY_CANDIDATE,
            Role::Controller,
        );
        let peer = self.factory.create(context).await?;
        let mut link = ActiveLink::new(LinkKey::Display, self.generation, peer);

        let early = std::mem::take(&mut self.pending_candidates);
        let negotiated = match link.hold(early) {
            Ok(()) => link.answer(offer).await,
            Err(err) => Err(err),
        };

        match negotiated {
            Ok(answer) => {
                self.signaller
                    .send(kind::DISPLAY_ANSWER, None, Some(answer), Some(Role::Controller));
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

    async fn remote_candidate(&mut self, signal: &SignalMessage) -> Result<(), NegotiationError> {
        if signal.target != Some(Role::Display) {
            return Ok(());
        }
        let candidate = required_payload(signal)?;
        match self.link.as_mut() {
            Some(link) => link.remote_candidate(candidate).await,
            None => {
                self.pending_candidates.push(candidate);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<F: PeerFactory> Endpoint for DisplayEndpoint<F> {
    async fn start(&mut self) -> Result<(), NegotiationError> {
        if !self.signaller.join(Role::Display, None) {
            return Err(NegotiationError::ChannelClosed);
        }
        self.signaller
            .send(kind::DISPLAY_READY, None, None, Some(Role::Controller));
        Ok(())
    }

    async fn handle_signal(&mut self, signal: SignalMessage) {
        if !signal.is_for(Role::Display) {
            return;
        }

        let result = match signal.kind.as_str() {
            kind::STATE_UPDATE => self.apply_state(&signal),
            kind::DISPLAY_OFFER => self.accept_offer(&signal).await,
            kind::DISPLAY_CANDIDATE => self.remote_candidate(&signal).await,
            kind::PARTICIPANT_LEFT => {
                let role = signal
                    .payload
                    .as_ref()
                    .and_then(|payload| payload.get("role"))
                    .and_then(Value::as_str);
                if role == Some("controller") {
                    self.pending_candidates.clear();
                    self.close_link().await;
                }
                Ok(())
            }
            other => {
                debug!(kind = other, "display ignores signal");
                Ok(())
            }
        };

        if let Err(err) = result {
            log_failure(Role::Display, &signal.kind, None, &err);
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if !link.owns(&event) {
            debug!(generation = event.generation, "ignoring event of a replaced peer");
            return;
        }

        match event.state {
            PeerState::Connected => {
                if let Err(err) = link.connected() {
                    log_failure(Role::Display, "peer-connected", None, &err);
                    return;
                }
                self.last_error = None;
                self.controller_feed_live = true;
                self.refresh_visible();
            }
            PeerState::Failed => {
                self.last_error = Some(CONNECT_FAILURE.to_string());
                self.close_link().await;
            }
            PeerState::Closed => self.close_link().await,
        }
    }

    async fn shutdown(&mut self) {
        self.close_link().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WireMessage;
    use crate::negotiation::peer::fake::FakeFactory;
    use serde_json::json;

    fn display() -> (DisplayEndpoint<FakeFactory>, FakeFactory, UnboundedReceiver<WireMessage>) {
        let (tx, rx) = unbounded();
        let factory = FakeFactory::default();
        let (endpoint, _events) = DisplayEndpoint::new("abc", tx, factory.clone());
        (endpoint, factory, rx)
    }

    fn state_update(payload: Value) -> SignalMessage {
        SignalMessage::new("abc", kind::STATE_UPDATE).payload(payload)
    }

    fn offer() -> SignalMessage {
        SignalMessage::new("abc", kind::DISPLAY_OFFER)
            .payload(json!({"type": "offer", "sdp": "v=0"}))
            .target(Role::Display)
    }

    fn connected(endpoint: &DisplayEndpoint<FakeFactory>) -> PeerEvent {
        PeerEvent {
            link: LinkKey::Display,
            generation: endpoint.generation,
            state: PeerState::Connected,
        }
    }

    #[tokio::test]
    async fn start_announces_readiness_to_the_controller() {
        let (mut endpoint, _factory, mut rx) = display();
        endpoint.start().await.unwrap();

        assert!(matches!(rx.try_next(), Ok(Some(WireMessage::Join(join))) if join.role == Role::Display));
        let Ok(Some(WireMessage::Signal(ready))) = rx.try_next() else {
            panic!("expected display-ready");
        };
        assert_eq!(ready.kind, kind::DISPLAY_READY);
        assert_eq!(ready.target, Some(Role::Controller));
    }

    #[tokio::test]
    async fn state_update_replaces_state_wholesale() {
        let (mut endpoint, _factory, _rx) = display();
        endpoint
            .handle_signal(state_update(json!({
                "activeCamera": 1,
                "lowerThird": { "isVisible": true, "mainText": "Welcome" }
            })))
            .await;
        assert_eq!(endpoint.state().active_camera_id, Some(1));
        assert_eq!(endpoint.state().lower_third_config.main_text, "Welcome");

        endpoint
            .handle_signal(state_update(json!({ "activeCameraId": 2 })))
            .await;
        assert_eq!(endpoint.state().active_camera_id, Some(2));
        assert!(!endpoint.state().lower_third_config.is_visible);
        assert_eq!(endpoint.state().lower_third_config.main_text, "");
    }

    #[tokio::test]
    async fn malformed_state_keeps_the_current_one() {
        let (mut endpoint, _factory, _rx) = display();
        endpoint
            .handle_signal(state_update(json!({ "lowerThird": { "mainText": "Welcome" } })))
            .await;
        endpoint
            .handle_signal(state_update(json!({ "sourceMode": "satellite" })))
            .await;
        assert_eq!(endpoint.state().lower_third_config.main_text, "Welcome");
    }

    #[tokio::test]
    async fn controller_source_waits_for_live_media() {
        let (mut endpoint, _factory, _rx) = display();
        endpoint
            .handle_signal(state_update(json!({ "sourceMode": "controller" })))
            .await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Local);

        endpoint.handle_signal(offer()).await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Local);

        let event = connected(&endpoint);
        endpoint.handle_peer_event(event).await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Controller);

        let failed = PeerEvent {
            state: PeerState::Failed,
            ..connected(&endpoint)
        };
        endpoint.handle_peer_event(failed).await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Local);
        assert_eq!(endpoint.last_error(), Some(CONNECT_FAILURE));
    }

    #[tokio::test]
    async fn offer_is_answered_and_replaces_the_previous_link() {
        let (mut endpoint, factory, mut rx) = display();
        endpoint
            .handle_signal(
                SignalMessage::new("abc", kind::DISPLAY_CANDIDATE)
                    .payload(json!({"candidate": "early"}))
                    .target(Role::Display),
            )
            .await;
        endpoint.handle_signal(offer()).await;
        endpoint.handle_signal(offer()).await;

        assert_eq!(factory.stats.live(), 1);
        assert_eq!(endpoint.link_state(), Some(LinkState::AnswerSent));
        // the early candidate went to the first link only
        assert_eq!(factory.stats.candidates.lock().unwrap().len(), 1);

        let mut answers = 0;
        while let Ok(Some(WireMessage::Signal(signal))) = rx.try_next() {
            if signal.kind == kind::DISPLAY_ANSWER {
                assert_eq!(signal.target, Some(Role::Controller));
                answers += 1;
            }
        }
        assert_eq!(answers, 2);
    }

    #[tokio::test]
    async fn local_mode_ignores_feed_state() {
        let (mut endpoint, _factory, _rx) = display();
        endpoint.handle_signal(offer()).await;
        let event = connected(&endpoint);
        endpoint.handle_peer_event(event).await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Local);

        endpoint
            .handle_signal(state_update(json!({ "sourceMode": "controller" })))
            .await;
        assert_eq!(endpoint.visible_source(), VisibleSource::Controller);
    }
}
