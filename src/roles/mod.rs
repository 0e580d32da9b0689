//! Endpoint glue for the three participant roles.
//!
//! Each endpoint consumes the signals the hub relays to it plus the
//! connection events of its own peer backends, and answers through an
//! [`Outbound`] queue. They hold no sockets; [`run_endpoint`] wires one to
//! a [`SignalClient`](crate::client::SignalClient).

pub mod camera;
pub mod controller;
pub mod display;

use async_trait::async_trait;
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::NegotiationError;
use crate::helpers::send_payload;
use crate::models::{JoinRequest, Role, SignalMessage, SlotId, WireMessage};
use crate::negotiation::peer::{CandidateSink, PeerBackend, PeerContext, PeerEvent};
use crate::negotiation::{LinkKey, LinkState, NegotiationLink};
use crate::types::Outbound;
use crate::utils::normalize_session_id;

pub use camera::CameraEndpoint;
pub use controller::ControllerEndpoint;
pub use display::{DisplayEndpoint, VisibleSource};

/// Addressing shared by every endpoint of one session.
#[derive(Clone, Debug)]
pub struct Signaller {
    session_id: String,
    outbound: Outbound,
}

impl Signaller {
    pub fn new(session_id: &str, outbound: Outbound) -> Self {
        let session_id = normalize_session_id(session_id).unwrap_or_else(|| session_id.to_string());
        Signaller { session_id, outbound }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn join(&self, role: Role, slot_id: Option<SlotId>) -> bool {
        send_payload(
            &self.outbound,
            WireMessage::Join(JoinRequest {
                session_id: self.session_id.clone(),
                role,
                slot_id,
            }),
        )
    }

    pub fn send(
        &self,
        kind: &str,
        slot_id: Option<&SlotId>,
        payload: Option<Value>,
        target: Option<Role>,
    ) -> bool {
        let mut signal = SignalMessage::new(self.session_id.clone(), kind);
        signal.slot_id = slot_id.cloned();
        signal.payload = payload;
        signal.target = target;
        send_payload(&self.outbound, WireMessage::Signal(signal))
    }
}

/// A peer connection together with the protocol state of its link.
pub(crate) struct ActiveLink<P> {
    negotiation: NegotiationLink,
    generation: u64,
    peer: P,
}

impl<P: PeerBackend> ActiveLink<P> {
    fn new(key: LinkKey, generation: u64, peer: P) -> Self {
        ActiveLink {
            negotiation: NegotiationLink::new(key),
            generation,
            peer,
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        self.negotiation.state()
    }

    fn owns(&self, event: &PeerEvent) -> bool {
        self.generation == event.generation && self.negotiation.key() == &event.link
    }

    /// Offerer side: create and apply the local offer.
    async fn offer(&mut self) -> Result<Value, NegotiationError> {
        let offer = self.peer.create_offer().await?;
        self.negotiation.offer_sent()?;
        Ok(offer)
    }

    /// Answerer side: apply the remote offer, produce the answer and
    /// release any candidates that were waiting for it.
    async fn answer(&mut self, offer: Value) -> Result<Value, NegotiationError> {
        self.negotiation.offer_received()?;
        let answer = self.peer.accept_offer(offer).await?;
        self.negotiation.answer_sent()?;
        self.flush_pending().await?;
        Ok(answer)
    }

    async fn accept_answer(&mut self, answer: Value) -> Result<(), NegotiationError> {
        self.negotiation.answer_received()?;
        self.peer.accept_answer(answer).await?;
        self.flush_pending().await
    }

    fn connected(&mut self) -> Result<(), NegotiationError> {
        self.negotiation.connected()
    }

    fn fail(&mut self) {
        self.negotiation.fail();
    }

    /// Queue candidates that arrived before this link existed. Only valid
    /// before the remote description is applied.
    fn hold(&mut self, candidates: Vec<Value>) -> Result<(), NegotiationError> {
        for candidate in candidates {
            if self.negotiation.remote_candidate(candidate)?.is_some() {
                return Err(NegotiationError::IllegalTransition {
                    state: self.state().as_str(),
                    event: "hold-candidate",
                });
            }
        }
        Ok(())
    }

    async fn remote_candidate(&mut self, candidate: Value) -> Result<(), NegotiationError> {
        if let Some(candidate) = self.negotiation.remote_candidate(candidate)? {
            self.peer.add_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<(), NegotiationError> {
        for candidate in self.negotiation.take_pending() {
            self.peer.add_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn close(mut self) {
        self.negotiation.close();
        self.peer.close().await;
    }
}

fn peer_context(
    signaller: &Signaller,
    events: &UnboundedSender<PeerEvent>,
    link: LinkKey,
    generation: u64,
    candidate_kind: &'static str,
    target: Role,
) -> PeerContext {
    let slot_id = match &link {
        LinkKey::Camera(slot) => Some(slot.clone()),
        LinkKey::Display => None,
    };
    PeerContext {
        candidates: CandidateSink::new(
            signaller.outbound().clone(),
            signaller.session_id(),
            candidate_kind,
            slot_id,
            target,
        ),
        link,
        generation,
        events: events.clone(),
    }
}

fn required_payload(signal: &SignalMessage) -> Result<Value, NegotiationError> {
    signal
        .payload
        .clone()
        .ok_or_else(|| NegotiationError::MissingPayload(signal.kind.clone()))
}

#[async_trait]
pub trait Endpoint: Send {
    /// Announce the endpoint (join, first offer or readiness ping).
    async fn start(&mut self) -> Result<(), NegotiationError>;

    async fn handle_signal(&mut self, signal: SignalMessage);

    async fn handle_peer_event(&mut self, event: PeerEvent);

    /// Tear down every link before the socket closes.
    async fn shutdown(&mut self);
}

/// Drive `endpoint` until the signaling stream ends.
pub async fn run_endpoint<E: Endpoint>(
    endpoint: &mut E,
    mut signals: UnboundedReceiver<SignalMessage>,
    mut peer_events: UnboundedReceiver<PeerEvent>,
) -> Result<(), NegotiationError> {
    endpoint.start().await?;

    loop {
        tokio::select! {
            signal = signals.next() => match signal {
                Some(signal) => endpoint.handle_signal(signal).await,
                None => {
                    debug!("signaling stream ended");
                    break;
                }
            },
            Some(event) = peer_events.next() => endpoint.handle_peer_event(event).await,
        }
    }

    endpoint.shutdown().await;
    Ok(())
}

fn log_failure(role: Role, kind: &str, slot_id: Option<&SlotId>, err: &NegotiationError) {
    warn!(role = %role, kind, slot = ?slot_id, "signal handling failed: {}", err);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kind;
    use crate::negotiation::peer::fake::FakeFactory;
    use futures_channel::mpsc::unbounded;
    use serde_json::json;

    #[tokio::test]
    async fn run_endpoint_drives_until_the_stream_ends() {
        let (outbound, mut sent) = unbounded();
        let (mut display, peer_events) = DisplayEndpoint::new("session:abc", outbound, FakeFactory::default());
        let (signals_tx, signals) = unbounded();

        signals_tx
            .unbounded_send(
                SignalMessage::new("abc", kind::STATE_UPDATE)
                    .payload(json!({ "lowerThird": { "isVisible": true, "mainText": "Welcome" } })),
            )
            .unwrap();
        drop(signals_tx);

        run_endpoint(&mut display, signals, peer_events).await.unwrap();

        assert_eq!(display.state().lower_third_config.main_text, "Welcome");
        let Ok(Some(WireMessage::Join(join))) = sent.try_next() else {
            panic!("expected a join");
        };
        assert_eq!(join.session_id, "abc");
    }

    #[test]
    fn signaller_normalises_the_session_id() {
        let (outbound, _sent) = unbounded();
        let signaller = Signaller::new(" prostream: abc ", outbound);
        assert_eq!(signaller.session_id(), "abc");
    }
}
