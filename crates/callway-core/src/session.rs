//! Call session tracking.
//!
//! Sessions live only while a call is in progress. The tracker keeps three
//! views in step: sessions by ID, the active session of each ordered
//! (caller, callee) pair, and the active session of each participant.

use crate::registry::UserId;
use callway_protocol::CallType;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

/// Identifier of a call session, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Get the raw value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call_{}", self.0)
    }
}

/// Non-terminal lifecycle states. A session that ends is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Callee notified, waiting for accept or reject.
    Ringing,
    /// Accepted; session descriptions are being exchanged.
    Negotiating,
    /// An answer went through; the peers are connected.
    Active,
}

impl CallState {
    /// Label used for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
        }
    }
}

/// Side of a call a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// The other side.
    #[must_use]
    pub fn other(self) -> Role {
        match self {
            Role::Caller => Role::Callee,
            Role::Callee => Role::Caller,
        }
    }
}

/// A tracked call.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: SessionId,
    pub caller: UserId,
    pub callee: UserId,
    pub call_type: CallType,
    /// Caller display data, passed through to the callee.
    pub caller_info: Option<Value>,
    pub state: CallState,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl CallSession {
    /// The user on the given side.
    #[must_use]
    pub fn participant(&self, role: Role) -> &str {
        match role {
            Role::Caller => &self.caller,
            Role::Callee => &self.callee,
        }
    }

    /// The side `user` is on, if they take part in this call.
    #[must_use]
    pub fn role_of(&self, user: &str) -> Option<Role> {
        if self.caller == user {
            Some(Role::Caller)
        } else if self.callee == user {
            Some(Role::Callee)
        } else {
            None
        }
    }
}

/// Reasons a new session cannot be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    /// The caller named themselves.
    #[error("Cannot call yourself")]
    SelfCall,

    /// The caller is already in a call.
    #[error("Caller {0} is already in a call")]
    CallerBusy(UserId),

    /// The callee is already in a call.
    #[error("Callee {0} is already in a call")]
    CalleeBusy(UserId),
}

/// Registry of active call sessions.
#[derive(Debug)]
pub struct CallTracker {
    sessions: HashMap<SessionId, CallSession>,
    pairs: HashMap<(UserId, UserId), SessionId>,
    participants: HashMap<UserId, SessionId>,
    next_id: u64,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
            pairs: HashMap::new(),
            participants: HashMap::new(),
            next_id: 1,
        }
    }
}

impl CallTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session in the `Ringing` state.
    ///
    /// # Errors
    ///
    /// Fails if either participant is already in a call or the caller is the
    /// callee.
    pub fn open(
        &mut self,
        caller: &str,
        callee: &str,
        call_type: CallType,
        caller_info: Option<Value>,
    ) -> Result<&CallSession, TrackerError> {
        if caller == callee {
            return Err(TrackerError::SelfCall);
        }
        if self.is_busy(caller) {
            return Err(TrackerError::CallerBusy(caller.to_string()));
        }
        if self.is_busy(callee) {
            return Err(TrackerError::CalleeBusy(callee.to_string()));
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;

        let session = CallSession {
            id,
            caller: caller.to_string(),
            callee: callee.to_string(),
            call_type,
            caller_info,
            state: CallState::Ringing,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };

        self.pairs
            .insert((caller.to_string(), callee.to_string()), id);
        self.participants.insert(caller.to_string(), id);
        self.participants.insert(callee.to_string(), id);

        debug!(
            session = %id,
            caller = %caller,
            callee = %callee,
            call_type = %call_type,
            "Tracker: session opened"
        );

        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Get a session by ID.
    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<&CallSession> {
        self.sessions.get(&id)
    }

    /// Get the active session a user takes part in.
    #[must_use]
    pub fn session_of(&self, user: &str) -> Option<&CallSession> {
        self.participants
            .get(user)
            .and_then(|id| self.sessions.get(id))
    }

    /// Get the active session for an ordered (caller, callee) pair.
    #[must_use]
    pub fn session_between(&self, caller: &str, callee: &str) -> Option<&CallSession> {
        self.pairs
            .get(&(caller.to_string(), callee.to_string()))
            .and_then(|id| self.sessions.get(id))
    }

    /// Check whether a user is in an active session.
    #[must_use]
    pub fn is_busy(&self, user: &str) -> bool {
        self.participants.contains_key(user)
    }

    /// Move a session to a new state.
    ///
    /// Returns the previous state, or `None` if the session does not exist.
    pub fn set_state(&mut self, id: SessionId, state: CallState) -> Option<CallState> {
        let session = self.sessions.get_mut(&id)?;
        let previous = session.state;
        session.state = state;
        if previous != state {
            debug!(
                session = %id,
                from = previous.as_str(),
                to = state.as_str(),
                "Tracker: state changed"
            );
        }
        Some(previous)
    }

    /// Remove a session and every index entry pointing at it.
    pub fn close(&mut self, id: SessionId) -> Option<CallSession> {
        let session = self.sessions.remove(&id)?;

        self.pairs
            .remove(&(session.caller.clone(), session.callee.clone()));
        for user in [&session.caller, &session.callee] {
            if self.participants.get(user.as_str()) == Some(&id) {
                self.participants.remove(user.as_str());
            }
        }

        debug!(session = %id, "Tracker: session closed");
        Some(session)
    }

    /// Number of active sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no call is in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_indexes_both_participants() {
        let mut tracker = CallTracker::new();
        let id = tracker
            .open("alice", "bob", CallType::Video, None)
            .unwrap()
            .id;

        assert_eq!(tracker.session_of("alice").map(|s| s.id), Some(id));
        assert_eq!(tracker.session_of("bob").map(|s| s.id), Some(id));
        assert_eq!(tracker.session_between("alice", "bob").map(|s| s.id), Some(id));
        assert!(tracker.session_between("bob", "alice").is_none());
        assert_eq!(tracker.get(id).unwrap().state, CallState::Ringing);
    }

    #[test]
    fn test_one_session_per_user() {
        let mut tracker = CallTracker::new();
        tracker.open("alice", "bob", CallType::Audio, None).unwrap();

        assert_eq!(
            tracker.open("carol", "bob", CallType::Audio, None).unwrap_err(),
            TrackerError::CalleeBusy("bob".into())
        );
        assert_eq!(
            tracker.open("alice", "carol", CallType::Audio, None).unwrap_err(),
            TrackerError::CallerBusy("alice".into())
        );
        assert_eq!(
            tracker.open("alice", "bob", CallType::Audio, None).unwrap_err(),
            TrackerError::CallerBusy("alice".into())
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_self_call_rejected() {
        let mut tracker = CallTracker::new();
        assert_eq!(
            tracker.open("alice", "alice", CallType::Audio, None).unwrap_err(),
            TrackerError::SelfCall
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_close_clears_indexes() {
        let mut tracker = CallTracker::new();
        let id = tracker
            .open("alice", "bob", CallType::Audio, None)
            .unwrap()
            .id;

        let closed = tracker.close(id).unwrap();
        assert_eq!(closed.caller, "alice");
        assert!(tracker.get(id).is_none());
        assert!(tracker.session_of("alice").is_none());
        assert!(tracker.session_of("bob").is_none());
        assert!(!tracker.is_busy("bob"));
        assert!(tracker.close(id).is_none());

        // The pair is free for a new, independent attempt.
        let next = tracker
            .open("alice", "bob", CallType::Video, None)
            .unwrap()
            .id;
        assert_ne!(next, id);
    }

    #[test]
    fn test_set_state() {
        let mut tracker = CallTracker::new();
        let id = tracker
            .open("alice", "bob", CallType::Audio, None)
            .unwrap()
            .id;

        assert_eq!(
            tracker.set_state(id, CallState::Negotiating),
            Some(CallState::Ringing)
        );
        assert_eq!(tracker.get(id).unwrap().state, CallState::Negotiating);
        tracker.close(id);
        assert_eq!(tracker.set_state(id, CallState::Active), None);
    }

    #[test]
    fn test_roles() {
        let mut tracker = CallTracker::new();
        let session = tracker
            .open("alice", "bob", CallType::Audio, None)
            .unwrap()
            .clone();

        assert_eq!(session.role_of("alice"), Some(Role::Caller));
        assert_eq!(session.role_of("bob"), Some(Role::Callee));
        assert_eq!(session.role_of("carol"), None);
        assert_eq!(session.participant(Role::Caller.other()), "bob");
    }
}
