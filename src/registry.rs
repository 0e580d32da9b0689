//! Session registry and signaling relay.
//!
//! Maps a session id to the participants joined under it and fans signal
//! messages out to them. Nothing is persisted; sessions live until the
//! reaper finds them empty for longer than the idle timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::models::{kind, JoinRequest, Role, SignalMessage, SlotId, WireMessage};
use crate::types::{ConnectionId, Tx};
use crate::utils::{lock, session_key};

#[derive(Debug)]
pub struct Participant {
    pub tx: Tx,
    pub role: Role,
    pub slot_id: Option<SlotId>,
}

#[derive(Debug)]
struct Session {
    participants: HashMap<ConnectionId, Participant>,
    /// Most recent `state-update` relayed in this session.
    last_state: Option<SignalMessage>,
    /// Set when the last participant left.
    empty_since: Option<Instant>,
}

impl Session {
    fn new() -> Session {
        Session {
            participants: HashMap::new(),
            last_state: None,
            empty_since: None,
        }
    }
}

/// Where a connection is registered.
#[derive(Clone, Debug, PartialEq)]
pub struct Membership {
    pub session_id: String,
    pub role: Role,
    pub slot_id: Option<SlotId>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    members: Mutex<HashMap<ConnectionId, Membership>>,
    next_connection: AtomicU64,
    idle_timeout: Duration,
}

fn deliver(tx: &Tx, frame: &Message) -> bool {
    match tx.unbounded_send(frame.clone()) {
        Ok(()) => true,
        Err(err) => {
            debug!("dropping frame for closed participant: {}", err);
            false
        }
    }
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            members: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            idle_timeout,
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `conn` under the session, role and slot of `request`.
    ///
    /// No uniqueness is enforced on (session, role, slot) so a client can
    /// rejoin after a transient drop. A connection belongs to one session at
    /// a time; joining again moves it. Controllers and displays are handed
    /// the session's last published state straight away.
    pub fn join(&self, conn: ConnectionId, tx: Tx, request: JoinRequest) -> Result<Membership, RelayError> {
        let session_id = session_key(&request.session_id).ok_or_else(|| {
            RelayError::MissingSessionId {
                kind: "join".to_string(),
            }
        })?;

        let previous = lock(&self.members).get(&conn).cloned();
        if let Some(previous) = previous {
            if previous.session_id != session_id {
                self.leave(conn);
            }
        }

        let membership = Membership {
            session_id: session_id.clone(),
            role: request.role,
            slot_id: request.slot_id,
        };

        let mut sessions = lock(&self.sessions);
        let session = sessions.entry(session_id.clone()).or_insert_with(Session::new);
        session.empty_since = None;

        if matches!(membership.role, Role::Controller | Role::Display) {
            if let Some(state) = &session.last_state {
                let frame = Message::Text(WireMessage::Signal(state.clone()).to_text());
                deliver(&tx, &frame);
            }
        }

        session.participants.insert(
            conn,
            Participant {
                tx,
                role: membership.role,
                slot_id: membership.slot_id.clone(),
            },
        );
        info!(
            session = %session_id,
            role = %membership.role,
            slot = ?membership.slot_id,
            participants = session.participants.len(),
            "participant joined"
        );
        drop(sessions);

        lock(&self.members).insert(conn, membership.clone());
        Ok(membership)
    }

    /// Forward `signal` from `from` to the other participants of its session.
    ///
    /// With a `target`, only participants of that role receive it; without
    /// one, everybody else does. The sender never gets its own message back
    /// and must itself be joined to the session it addresses. Only a
    /// controller's `state-update` is kept for replay. Returns the number of
    /// participants the frame was handed to.
    pub fn relay(&self, from: ConnectionId, mut signal: SignalMessage) -> Result<usize, RelayError> {
        let session_id = signal
            .session_id
            .as_deref()
            .and_then(session_key)
            .ok_or_else(|| RelayError::MissingSessionId {
                kind: signal.kind.clone(),
            })?;
        signal.session_id = Some(session_id.clone());

        let sender = lock(&self.members)
            .get(&from)
            .filter(|membership| membership.session_id == session_id)
            .map(|membership| membership.role);
        let Some(sender_role) = sender else {
            return Err(RelayError::NotMember { session_id });
        };

        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(&session_id) else {
            debug!(session = %session_id, kind = %signal.kind, "signal for unknown session");
            return Ok(0);
        };

        if signal.kind == kind::STATE_UPDATE {
            if sender_role == Role::Controller {
                session.last_state = Some(signal.clone());
            } else {
                debug!(session = %session_id, role = %sender_role, "state-update not kept for replay");
            }
        }

        let frame = Message::Text(WireMessage::Signal(signal.clone()).to_text());
        let delivered = session
            .participants
            .iter()
            .filter(|(conn, _)| **conn != from)
            .filter(|(_, participant)| signal.target.map_or(true, |role| participant.role == role))
            .filter(|(_, participant)| deliver(&participant.tx, &frame))
            .count();

        debug!(
            session = %session_id,
            kind = %signal.kind,
            target = ?signal.target,
            slot = ?signal.slot_id,
            delivered,
            "relayed signal"
        );
        Ok(delivered)
    }

    /// Remove `conn` from its session and tell the rest of the room.
    pub fn leave(&self, conn: ConnectionId) -> Option<Membership> {
        let membership = lock(&self.members).remove(&conn)?;

        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(&membership.session_id) else {
            return Some(membership);
        };
        if session.participants.remove(&conn).is_none() {
            return Some(membership);
        }

        let mut notice = SignalMessage::new(membership.session_id.clone(), kind::PARTICIPANT_LEFT)
            .payload(json!({ "role": membership.role }));
        notice.slot_id = membership.slot_id.clone();
        let frame = Message::Text(WireMessage::Signal(notice).to_text());
        for participant in session.participants.values() {
            deliver(&participant.tx, &frame);
        }

        if session.participants.is_empty() {
            session.empty_since = Some(Instant::now());
        }
        info!(
            session = %membership.session_id,
            role = %membership.role,
            slot = ?membership.slot_id,
            remaining = session.participants.len(),
            "participant left"
        );
        Some(membership)
    }

    /// Drop sessions that have had no participants for longer than the idle timeout.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let mut sessions = lock(&self.sessions);
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let expired = session.participants.is_empty()
                && session
                    .empty_since
                    .map_or(true, |since| now.saturating_duration_since(since) >= self.idle_timeout);
            if expired {
                info!(session = %session_id, "reaped idle session");
            }
            !expired
        });
        before - sessions.len()
    }

    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle(Instant::now());
                if reaped > 0 {
                    debug!(reaped, "session reaper pass");
                }
            }
        })
    }

    pub fn membership(&self, conn: ConnectionId) -> Option<Membership> {
        lock(&self.members).get(&conn).cloned()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn participant_count(&self, session_id: &str) -> usize {
        let Some(session_id) = session_key(session_id) else {
            return 0;
        };
        lock(&self.sessions)
            .get(&session_id)
            .map_or(0, |session| session.participants.len())
    }

    pub fn last_state(&self, session_id: &str) -> Option<SignalMessage> {
        let session_id = session_key(session_id)?;
        lock(&self.sessions)
            .get(&session_id)
            .and_then(|session| session.last_state.clone())
    }
}

/// Log-and-drop wrapper used by the connection handler.
pub fn relay_or_log(registry: &SessionRegistry, from: ConnectionId, signal: SignalMessage) {
    if let Err(err) = registry.relay(from, signal) {
        warn!(connection = from, "dropping signal: {}", err);
    }
}
