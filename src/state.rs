//! The single owned [`AuthState`] and its listeners.
//!
//! Every mutation goes through [`AuthStateCell`], which:
//! - serializes writers behind one lock,
//! - discards writes from operations that started before the last applied
//!   one (sequence [`Ticket`]s),
//! - fans each transition out to listeners while still holding the lock, so
//!   every listener sees every transition exactly once and in order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::types::{AuthState, AuthStatus, RoleStatus, UserId};

/// Monotonic sequence number taken when an operation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Ticket(u64);

/// Session-level outcome an operation wants to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    Initializing,
    Authenticated(UserId),
    Unauthenticated,
    Error,
}

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<AuthState>,
}

struct Inner {
    state: AuthState,
    session_ticket: Ticket,
    role_ticket: Ticket,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

pub(crate) struct AuthStateCell {
    inner: Mutex<Inner>,
    next_ticket: AtomicU64,
    alive: AtomicBool,
}

impl AuthStateCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: AuthState::default(),
                session_ticket: Ticket(0),
                role_ticket: Ticket(0),
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            next_ticket: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        })
    }

    pub(crate) fn ticket(&self) -> Ticket {
        Ticket(self.next_ticket.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> AuthState {
        self.inner.lock().state.clone()
    }

    /// Apply a session verdict. Returns `false` when the write was stale
    /// or the cell is closed.
    pub(crate) fn apply(
        &self,
        ticket: Ticket,
        verdict: Verdict,
        verified_at: Option<OffsetDateTime>,
    ) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut inner = self.inner.lock();
        if ticket < inner.session_ticket {
            tracing::debug!(?ticket, latest = ?inner.session_ticket, "Discarding stale session write");
            return false;
        }
        inner.session_ticket = ticket;

        let mut next = inner.state.clone();
        match verdict {
            Verdict::Initializing => next.status = AuthStatus::Initializing,
            Verdict::Authenticated(user_id) => {
                if next.user_id.as_ref() != Some(&user_id) {
                    next.role = RoleStatus::Unknown;
                }
                next.status = AuthStatus::Authenticated;
                next.user_id = Some(user_id);
            }
            Verdict::Unauthenticated => {
                next.status = AuthStatus::Unauthenticated;
                next.user_id = None;
                next.role = RoleStatus::Unknown;
            }
            Verdict::Error => next.status = AuthStatus::Error,
        }
        if verified_at.is_some() {
            next.last_verified_at = verified_at;
        }

        inner.publish(next);
        true
    }

    /// Apply a role for `user_id`. Dropped when stale, when the user has
    /// changed, or when the session is no longer authenticated.
    pub(crate) fn apply_role(&self, ticket: Ticket, user_id: &UserId, role: RoleStatus) -> bool {
        if !self.is_alive() {
            return false;
        }
        let mut inner = self.inner.lock();
        if ticket < inner.role_ticket {
            tracing::debug!(?ticket, latest = ?inner.role_ticket, "Discarding stale role write");
            return false;
        }
        if inner.state.status != AuthStatus::Authenticated
            || inner.state.user_id.as_ref() != Some(user_id)
        {
            tracing::debug!(user_id = %user_id, "Discarding role for inactive user");
            return false;
        }
        inner.role_ticket = ticket;

        let mut next = inner.state.clone();
        next.role = role;
        inner.publish(next);
        true
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        if self.is_alive() {
            inner.listeners.push(Listener { id, tx });
        }
        Subscription {
            id,
            rx,
            cell: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.inner.lock().listeners.retain(|l| l.id != id);
    }

    /// Stop accepting writes and release every listener.
    pub(crate) fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.inner.lock().listeners.clear();
    }
}

impl Inner {
    fn publish(&mut self, next: AuthState) {
        let changed = !self.state.same_transition_state(&next);
        self.state = next;
        if !changed {
            return;
        }

        tracing::info!(
            status = ?self.state.status,
            user_id = ?self.state.user_id,
            role = ?self.state.role,
            "Auth state transition"
        );
        let state = &self.state;
        self.listeners.retain(|l| l.tx.send(state.clone()).is_ok());
    }
}

/// Handle delivering every [`AuthState`] transition after subscription.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<AuthState>,
    cell: Weak<AuthStateCell>,
}

impl Subscription {
    /// Next transition, or `None` once the state machine has shut down.
    pub async fn recv(&mut self) -> Option<AuthState> {
        self.rx.recv().await
    }

    /// Next already-delivered transition, if any.
    pub fn try_recv(&mut self) -> Option<AuthState> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
