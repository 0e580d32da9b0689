//! Per-link offer/answer state machine.
//!
//! Every media link (one per camera slot, plus the controller to display
//! link) negotiates independently:
//!
//! ```text
//! offerer:  Idle -> OfferSent -> AnswerReceived -> Connected
//! answerer: Idle -> OfferReceived -> AnswerSent -> Connected
//! any:      -> Failed | Closed
//! ```
//!
//! There is no renegotiation in place. A failed or closed link is replaced
//! by a fresh one starting from `Idle`.

pub mod peer;
pub mod rtc;

use std::fmt;

use serde_json::Value;

use crate::error::NegotiationError;
use crate::models::SlotId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::OfferSent => "offer-sent",
            LinkState::OfferReceived => "offer-received",
            LinkState::AnswerSent => "answer-sent",
            LinkState::AnswerReceived => "answer-received",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }

    /// Whether the remote description has been applied, so remote ICE
    /// candidates may be added.
    pub fn has_remote_description(&self) -> bool {
        matches!(
            self,
            LinkState::OfferReceived
                | LinkState::AnswerSent
                | LinkState::AnswerReceived
                | LinkState::Connected
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a media link within one endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LinkKey {
    Camera(SlotId),
    Display,
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKey::Camera(slot) => write!(f, "camera slot {}", slot),
            LinkKey::Display => f.write_str("display link"),
        }
    }
}

/// Protocol state of one link, with remote candidates that arrived
/// before the remote description.
#[derive(Debug)]
pub struct NegotiationLink {
    key: LinkKey,
    state: LinkState,
    pending_candidates: Vec<Value>,
}

impl NegotiationLink {
    pub fn new(key: LinkKey) -> Self {
        NegotiationLink {
            key,
            state: LinkState::Idle,
            pending_candidates: Vec::new(),
        }
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    fn transition(
        &mut self,
        event: &'static str,
        allowed: &[LinkState],
        next: LinkState,
    ) -> Result<(), NegotiationError> {
        if allowed.contains(&self.state) {
            self.state = next;
            Ok(())
        } else {
            Err(NegotiationError::IllegalTransition {
                state: self.state.as_str(),
                event,
            })
        }
    }

    pub fn offer_sent(&mut self) -> Result<(), NegotiationError> {
        self.transition("offer-sent", &[LinkState::Idle], LinkState::OfferSent)
    }

    pub fn offer_received(&mut self) -> Result<(), NegotiationError> {
        self.transition("offer-received", &[LinkState::Idle], LinkState::OfferReceived)
    }

    pub fn answer_sent(&mut self) -> Result<(), NegotiationError> {
        self.transition("answer-sent", &[LinkState::OfferReceived], LinkState::AnswerSent)
    }

    pub fn answer_received(&mut self) -> Result<(), NegotiationError> {
        self.transition("answer-received", &[LinkState::OfferSent], LinkState::AnswerReceived)
    }

    pub fn connected(&mut self) -> Result<(), NegotiationError> {
        self.transition(
            "connected",
            &[LinkState::AnswerSent, LinkState::AnswerReceived, LinkState::Connected],
            LinkState::Connected,
        )
    }

    pub fn fail(&mut self) {
        if self.state != LinkState::Closed {
            self.state = LinkState::Failed;
        }
        self.pending_candidates.clear();
    }

    pub fn close(&mut self) {
        self.state = LinkState::Closed;
        self.pending_candidates.clear();
    }

    /// Record a remote candidate. Returns it back when it can be applied
    /// now; otherwise it is held until [`take_pending`](Self::take_pending).
    pub fn remote_candidate(&mut self, candidate: Value) -> Result<Option<Value>, NegotiationError> {
        if self.state.is_terminal() {
            return Err(NegotiationError::IllegalTransition {
                state: self.state.as_str(),
                event: "remote-candidate",
            });
        }
        if self.state.has_remote_description() {
            Ok(Some(candidate))
        } else {
            self.pending_candidates.push(candidate);
            Ok(None)
        }
    }

    /// Candidates queued before the remote description was applied.
    pub fn take_pending(&mut self) -> Vec<Value> {
        if self.state.has_remote_description() {
            std::mem::take(&mut self.pending_candidates)
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offerer_path() {
        let mut link = NegotiationLink::new(LinkKey::Camera(SlotId::from(1)));
        link.offer_sent().unwrap();
        link.answer_received().unwrap();
        link.connected().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn answerer_path() {
        let mut link = NegotiationLink::new(LinkKey::Display);
        link.offer_received().unwrap();
        link.answer_sent().unwrap();
        link.connected().unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn answer_before_offer_is_illegal() {
        let mut link = NegotiationLink::new(LinkKey::Display);
        let err = link.answer_received().unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::IllegalTransition {
                state: "idle",
                event: "answer-received"
            }
        ));
        assert_eq!(link.state(), LinkState::Idle);
    }

    #[test]
    fn no_renegotiation_in_place() {
        let mut link = NegotiationLink::new(LinkKey::Display);
        link.offer_sent().unwrap();
        link.answer_received().unwrap();
        assert!(link.offer_sent().is_err());
        link.fail();
        assert!(link.offer_sent().is_err());
    }

    #[test]
    fn early_candidates_wait_for_the_answer() {
        let mut link = NegotiationLink::new(LinkKey::Camera(SlotId::from(2)));
        link.offer_sent().unwrap();

        assert_eq!(link.remote_candidate(json!({"candidate": "a"})).unwrap(), None);
        assert!(link.take_pending().is_empty());

        link.answer_received().unwrap();
        assert_eq!(link.take_pending(), vec![json!({"candidate": "a"})]);
        assert_eq!(
            link.remote_candidate(json!({"candidate": "b"})).unwrap(),
            Some(json!({"candidate": "b"}))
        );
    }

    #[test]
    fn closed_link_rejects_candidates() {
        let mut link = NegotiationLink::new(LinkKey::Display);
        link.close();
        assert!(link.remote_candidate(json!({})).is_err());
    }
}
