//! Canonical store of live sessions.
//!
//! The store exclusively owns session records; transports own their private
//! handles and release them when the manager closes a session. Records are
//! kept in a concurrent map, with filtered listing for status surfaces.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::core::TransportType;

/// Errors from session-store operations
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The global session cap is reached
    #[error("session limit reached ({current}/{max})")]
    Exhausted {
        /// Live sessions at the time of the attempt
        current: usize,
        /// Configured cap
        max: usize,
    },

    /// The tenant's quota is reached
    #[error("tenant '{tenant}' session quota reached ({max})")]
    QuotaExceeded {
        /// Tenant that hit its quota
        tenant: String,
        /// Configured per-tenant quota
        max: usize,
    },

    /// No session with the given id
    #[error("session {0} not found")]
    NotFound(Uuid),
}

/// Session lifecycle states. Transitions are monotonic; `Closed` and
/// `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, transport handle not yet live
    Initializing,
    /// Exchanging messages
    Active,
    /// Ended cleanly
    Closed,
    /// Ended by failure
    Error,
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

/// One live (or recently ended) session record.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier
    pub id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Bound backend, when routed to a specific server
    pub backend_id: Option<Uuid>,
    /// Namespace the session was addressed through, if any
    pub namespace: Option<String>,
    /// Carrying transport
    pub transport: TransportType,
    /// Lifecycle state
    pub state: SessionState,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Last observed activity
    pub last_activity: DateTime<Utc>,
    /// End time; always `>= started_at` when set
    pub ended_at: Option<DateTime<Utc>>,
    /// Client-reported identifier for observability
    pub client_id: Option<String>,
    /// Transport-level connection identifier for observability
    pub connection_id: Option<String>,
}

/// Externally safe view of a session: everything but private handles.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier
    pub id: Uuid,
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Bound backend
    pub backend_id: Option<Uuid>,
    /// Namespace the session was addressed through
    pub namespace: Option<String>,
    /// Carrying transport
    pub transport: TransportType,
    /// Lifecycle state
    pub state: SessionState,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Last observed activity
    pub last_activity: DateTime<Utc>,
    /// End time
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            tenant: s.tenant.clone(),
            user: s.user.clone(),
            backend_id: s.backend_id,
            namespace: s.namespace.clone(),
            transport: s.transport,
            state: s.state,
            started_at: s.started_at,
            last_activity: s.last_activity,
            ended_at: s.ended_at,
        }
    }
}

/// Filter for [`SessionStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Match a tenant
    pub tenant: Option<String>,
    /// Match a user
    pub user: Option<String>,
    /// Match a bound backend
    pub backend_id: Option<Uuid>,
    /// Match a namespace
    pub namespace: Option<String>,
    /// Match a transport kind
    pub transport: Option<TransportType>,
    /// Match a lifecycle state
    pub state: Option<SessionState>,
}

impl SessionFilter {
    fn matches(&self, s: &Session) -> bool {
        self.tenant.as_deref().is_none_or(|t| t == s.tenant)
            && self.user.as_deref().is_none_or(|u| u == s.user)
            && self.backend_id.is_none_or(|b| Some(b) == s.backend_id)
            && self
                .namespace
                .as_deref()
                .is_none_or(|n| Some(n) == s.namespace.as_deref())
            && self.transport.is_none_or(|t| t == s.transport)
            && self.state.is_none_or(|st| st == s.state)
    }
}

/// Capacity limits enforced on create.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Global cap on live sessions
    pub max_sessions: usize,
    /// Per-tenant cap on live sessions
    pub max_sessions_per_tenant: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            max_sessions_per_tenant: 1_000,
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Owning tenant
    pub tenant: String,
    /// Authenticated user
    pub user: String,
    /// Bound backend
    pub backend_id: Option<Uuid>,
    /// Namespace the request was addressed through
    pub namespace: Option<String>,
    /// Carrying transport
    pub transport: TransportType,
    /// Client-reported identifier
    pub client_id: Option<String>,
}

/// Concurrent session store. Records are mutated only through the methods
/// here; `touch` and `close` are safe from any task.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<Uuid, Session>,
    limits: SessionLimits,
}

impl SessionStore {
    /// Create a store with the given capacity limits.
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    /// Create a session record in `Initializing` state.
    ///
    /// Fails with [`SessionError::Exhausted`] at the global cap and
    /// [`SessionError::QuotaExceeded`] at the tenant quota. Terminal
    /// sessions do not count against either.
    pub fn create(&self, new: NewSession) -> Result<Session, SessionError> {
        let live = self.live_count();
        if live >= self.limits.max_sessions {
            return Err(SessionError::Exhausted {
                current: live,
                max: self.limits.max_sessions,
            });
        }
        let tenant_live = self
            .sessions
            .iter()
            .filter(|e| !e.state.is_terminal() && e.tenant == new.tenant)
            .count();
        if tenant_live >= self.limits.max_sessions_per_tenant {
            return Err(SessionError::QuotaExceeded {
                tenant: new.tenant,
                max: self.limits.max_sessions_per_tenant,
            });
        }

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            tenant: new.tenant,
            user: new.user,
            backend_id: new.backend_id,
            namespace: new.namespace,
            transport: new.transport,
            state: SessionState::Initializing,
            started_at: now,
            last_activity: now,
            ended_at: None,
            client_id: new.client_id,
            connection_id: None,
        };
        self.sessions.insert(session.id, session.clone());
        debug!(session_id = %session.id, transport = %session.transport, "session created");
        Ok(session)
    }

    /// Move a session from `Initializing` to `Active`, recording the
    /// transport's connection identifier.
    pub fn activate(&self, id: Uuid, connection_id: Option<String>) -> Result<(), SessionError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        if entry.state == SessionState::Initializing {
            entry.state = SessionState::Active;
            entry.connection_id = connection_id;
            entry.last_activity = Utc::now();
        }
        Ok(())
    }

    /// Snapshot of a session for status reporting.
    pub fn get(&self, id: Uuid) -> Result<SessionSnapshot, SessionError> {
        self.sessions
            .get(&id)
            .map(|s| SessionSnapshot::from(&*s))
            .ok_or(SessionError::NotFound(id))
    }

    /// Record activity. `last_activity` only moves forward.
    pub fn touch(&self, id: Uuid) -> Result<(), SessionError> {
        let mut entry = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        let now = Utc::now();
        if now > entry.last_activity {
            entry.last_activity = now;
        }
        Ok(())
    }

    /// Mark a session terminal. Idempotent: the first call wins and later
    /// calls (including with a different outcome) are no-ops.
    ///
    /// Returns `true` if this call performed the transition.
    pub fn close(&self, id: Uuid, outcome: SessionState) -> bool {
        debug_assert!(outcome.is_terminal());
        let Some(mut entry) = self.sessions.get_mut(&id) else {
            return false;
        };
        if entry.state.is_terminal() {
            return false;
        }
        entry.state = outcome;
        let now = Utc::now();
        entry.ended_at = Some(now.max(entry.started_at));
        debug!(session_id = %id, state = ?outcome, "session ended");
        true
    }

    /// Remove a terminal session record entirely.
    pub fn evict(&self, id: Uuid) {
        self.sessions.remove_if(&id, |_, s| s.state.is_terminal());
    }

    /// List snapshots matching a filter.
    pub fn list(&self, filter: &SessionFilter) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .filter(|e| filter.matches(&e))
            .map(|e| SessionSnapshot::from(&*e))
            .collect()
    }

    /// Ids of non-terminal sessions idle longer than the ttl configured for
    /// their transport kind.
    pub fn idle_sessions(
        &self,
        ttls: &HashMap<TransportType, chrono::Duration>,
        now: DateTime<Utc>,
    ) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|e| {
                if e.state.is_terminal() {
                    return false;
                }
                ttls.get(&e.transport)
                    .is_some_and(|ttl| now - e.last_activity > *ttl)
            })
            .map(|e| e.id)
            .collect()
    }

    /// Ids of terminal sessions that ended before `cutoff`, for eviction.
    pub fn terminal_before(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|e| e.state.is_terminal() && e.ended_at.is_some_and(|t| t < cutoff))
            .map(|e| e.id)
            .collect()
    }

    /// Ids of all non-terminal sessions.
    pub fn live_ids(&self) -> Vec<Uuid> {
        self.sessions
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.id)
            .collect()
    }

    /// Count of non-terminal sessions.
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.state.is_terminal()).count()
    }
}
