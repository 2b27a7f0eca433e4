//! The single active call context and its owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::ids::{ConversationId, SessionId};
use crate::session::{RemoteSession, SessionFlags};

/// A relay (STUN/TURN) server descriptor handed out on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("already in a call for conversation {0}")]
    AlreadyInCall(ConversationId),
}

/// Outcome of folding one server-reported session into the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpsert {
    Inserted,
    Updated,
    Unchanged,
    /// The server reported our own session; nothing is stored.
    IsSelf,
}

/// Roster changes produced by a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterDiff {
    pub added: Vec<SessionId>,
    pub removed: Vec<SessionId>,
}

impl RosterDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Top-level state of the one call we are in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    conversation_id: ConversationId,
    self_session_id: SessionId,
    ice_servers: Vec<IceServer>,
    sessions: BTreeMap<SessionId, RemoteSession>,
    started_at: DateTime<Utc>,
    /// Monotonic token distinguishing this call from earlier ones; timers
    /// armed for a previous call carry a stale epoch.
    epoch: u64,
}

impl CallContext {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn self_session_id(&self) -> SessionId {
        self.self_session_id
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self, id: SessionId) -> Option<&RemoteSession> {
        self.sessions.get(&id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &RemoteSession> {
        self.sessions.values()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn upsert_session(&mut self, session: RemoteSession) -> SessionUpsert {
        if session.id == self.self_session_id {
            return SessionUpsert::IsSelf;
        }
        match self.sessions.get_mut(&session.id) {
            Some(existing) => {
                let before = existing.clone();
                existing.merge_server_view(&session);
                if before.flags == existing.flags
                    && before.member_id == existing.member_id
                    && before.provisional == existing.provisional
                {
                    SessionUpsert::Unchanged
                } else {
                    SessionUpsert::Updated
                }
            }
            None => {
                self.sessions.insert(session.id, session);
                SessionUpsert::Inserted
            }
        }
    }

    /// Insert a placeholder for a session only known from a relayed message.
    /// Returns false if the session is already present or is our own.
    pub fn insert_provisional(&mut self, id: SessionId) -> bool {
        if id == self.self_session_id || self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(id, RemoteSession::provisional(id));
        true
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<RemoteSession> {
        self.sessions.remove(&id)
    }

    pub fn apply_flags(&mut self, id: SessionId, flags: SessionFlags) -> bool {
        self.sessions
            .get_mut(&id)
            .is_some_and(|session| session.apply_flags(flags))
    }

    /// Reconcile against a liveness-ping answer. Sessions listed as dropped,
    /// and sessions the server did not confirm as active, leave the roster.
    pub fn reconcile(&mut self, active: &[RemoteSession], dropped: &[SessionId]) -> RosterDiff {
        let mut diff = RosterDiff::default();
        let confirmed: BTreeSet<SessionId> = active.iter().map(|s| s.id).collect();

        for session in active {
            if self.upsert_session(session.clone()) == SessionUpsert::Inserted {
                diff.added.push(session.id);
            }
        }

        let stale: Vec<SessionId> = self
            .sessions
            .keys()
            .copied()
            .filter(|id| dropped.contains(id) || !confirmed.contains(id))
            .collect();
        for id in stale {
            self.sessions.remove(&id);
            diff.removed.push(id);
        }
        diff
    }
}

/// Owner of the (at most one) active call context. Every mutation of the
/// call's top-level state goes through this type.
#[derive(Debug, Default)]
pub struct CallState {
    context: Option<CallContext>,
    last_epoch: u64,
}

impl CallState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> Option<&CallContext> {
        self.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut CallContext> {
        self.context.as_mut()
    }

    pub fn is_in_call(&self) -> bool {
        self.context.is_some()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.context.as_ref().map(|c| c.conversation_id)
    }

    /// Current epoch, or `None` outside a call.
    pub fn epoch(&self) -> Option<u64> {
        self.context.as_ref().map(|c| c.epoch)
    }

    /// Start a new call context. Fails if one already exists: callers must
    /// tear the previous call down first.
    pub fn begin(
        &mut self,
        conversation_id: ConversationId,
        self_session_id: SessionId,
        ice_servers: Vec<IceServer>,
        sessions: Vec<RemoteSession>,
    ) -> Result<&mut CallContext, StateError> {
        if let Some(existing) = &self.context {
            return Err(StateError::AlreadyInCall(existing.conversation_id));
        }
        self.last_epoch += 1;
        let mut context = CallContext {
            conversation_id,
            self_session_id,
            ice_servers,
            sessions: BTreeMap::new(),
            started_at: Utc::now(),
            epoch: self.last_epoch,
        };
        for session in sessions {
            context.upsert_session(session);
        }
        Ok(self.context.insert(context))
    }

    /// Drop the call context. Returns `None` when no call was active.
    pub fn end(&mut self) -> Option<CallContext> {
        self.context.take()
    }
}
