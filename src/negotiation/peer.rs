//! Seam between the signaling protocol and a media stack.

use async_trait::async_trait;
use futures_channel::mpsc::UnboundedSender;
use serde_json::Value;

use super::LinkKey;
use crate::error::NegotiationError;
use crate::helpers::send_payload;
use crate::models::{Role, SignalMessage, SlotId, WireMessage};
use crate::types::Outbound;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    Failed,
    Closed,
}

/// Connection-level change reported by a peer backend.
///
/// `generation` identifies the peer the event came from, so events of a
/// peer that has since been replaced on the same link can be told apart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEvent {
    pub link: LinkKey,
    pub generation: u64,
    pub state: PeerState,
}

/// Turns locally gathered ICE candidates into relay signals addressed to
/// the other side of the link.
#[derive(Clone, Debug)]
pub struct CandidateSink {
    outbound: Outbound,
    session_id: String,
    kind: &'static str,
    slot_id: Option<SlotId>,
    target: Role,
}

impl CandidateSink {
    pub fn new(
        outbound: Outbound,
        session_id: impl Into<String>,
        kind: &'static str,
        slot_id: Option<SlotId>,
        target: Role,
    ) -> Self {
        CandidateSink {
            outbound,
            session_id: session_id.into(),
            kind,
            slot_id,
            target,
        }
    }

    pub fn emit(&self, candidate: Value) {
        let mut signal = SignalMessage::new(self.session_id.clone(), self.kind)
            .payload(candidate)
            .target(self.target);
        signal.slot_id = self.slot_id.clone();
        send_payload(&self.outbound, WireMessage::Signal(signal));
    }
}

/// Everything a backend needs to report back for one link.
#[derive(Clone, Debug)]
pub struct PeerContext {
    pub link: LinkKey,
    pub generation: u64,
    pub candidates: CandidateSink,
    pub events: UnboundedSender<PeerEvent>,
}

impl PeerContext {
    pub fn report(&self, state: PeerState) {
        let _ = self.events.unbounded_send(PeerEvent {
            link: self.link.clone(),
            generation: self.generation,
            state,
        });
    }
}

/// One peer connection. Descriptions and candidates travel as the JSON
/// objects browsers exchange (`{type, sdp}`, `{candidate, sdpMid, ...}`).
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create an offer and apply it as the local description.
    async fn create_offer(&self) -> Result<Value, NegotiationError>;

    /// Apply a remote offer, then create and apply the local answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value, NegotiationError>;

    async fn accept_answer(&self, answer: Value) -> Result<(), NegotiationError>;

    async fn add_candidate(&self, candidate: Value) -> Result<(), NegotiationError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    type Peer: PeerBackend;

    async fn create(&self, context: PeerContext) -> Result<Self::Peer, NegotiationError>;

    /// Camera slot whose media outgoing links should carry. Factories
    /// without a program output ignore it.
    fn select_program(&self, _slot: Option<&SlotId>) {}
}
