//! Session registry
//!
//! The single owner of session lifetime. Sessions live in a map keyed by
//! client id; connections never hold a session directly but a
//! [`SessionKey`] (client id plus the id of the connection that attached),
//! which stops resolving as soon as another connection takes over or the
//! session is destroyed.
//!
//! Locking: the map sits behind a reader/writer lock and each session has
//! its own mutex. Per-packet work takes the read lock and one session
//! mutex. Attach, detach, expiry and takeover take the write lock, so a
//! concurrent routing pass never sees a session mid-transition. When the
//! subscription registry is also needed, it is always locked after this
//! one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{ConnectionId, Session, SessionLimits, SessionState};
use crate::broker::connection::Connection;
use crate::protocol::Will;
use crate::topic::SubscriptionRegistry;

/// Key a connection uses to reach its session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    client_id: Arc<str>,
    connection_id: ConnectionId,
}

impl SessionKey {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_id_arc(&self) -> &Arc<str> {
        &self.client_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

/// Result of attaching a connection
pub struct Attach {
    pub key: SessionKey,
    /// A prior, non-expired session was resumed
    pub session_present: bool,
    /// Live connection that was attached before this one
    pub evicted: Option<Arc<dyn Connection>>,
    /// Packets resent or flushed from the queue while attaching
    pub resumed: usize,
    /// Subscriptions removed with a discarded prior session
    pub discarded_subscriptions: usize,
    /// The prior session had passed its expiry deadline
    pub expired: bool,
    /// Will of that expired session, still owed to subscribers
    pub expired_will: Option<Will>,
}

/// Result of detaching a connection
#[derive(Debug)]
pub struct Detach {
    /// Session destroyed right away (expiry interval 0)
    pub destroyed: bool,
    /// Subscriptions removed with a destroyed session
    pub removed_subscriptions: usize,
    /// Will to publish now
    pub will: Option<Will>,
}

/// Result of an expiry timer firing
#[derive(Debug)]
pub struct Expired {
    pub removed_subscriptions: usize,
    /// Will whose delay had not elapsed yet; published at expiry
    pub will: Option<Will>,
}

/// Snapshot of a session for introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_id: Arc<str>,
    pub state: SessionState,
    pub connection_id: Option<ConnectionId>,
    pub session_expiry_interval: u32,
    pub inflight: usize,
    pub pending: usize,
    pub has_will: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<AHashMap<Arc<str>, Mutex<Session>>>,
    next_connection_id: AtomicU64,
    limits: SessionLimits,
}

impl SessionRegistry {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: RwLock::new(AHashMap::new()),
            next_connection_id: AtomicU64::new(1),
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Attach a connection to the session for its client id
    ///
    /// The whole takeover runs under the write lock: a prior session is
    /// resumed unless `clean_start` is set or it has expired, in which case
    /// it is torn down (subscriptions included) and replaced. The previously
    /// attached connection, if any, is handed back for the caller to close.
    /// Unacknowledged messages are resent before the lock is released, so
    /// they reach the client ahead of any newly routed message.
    pub fn connect(
        &self,
        connection: &Arc<dyn Connection>,
        clean_start: bool,
        session_expiry_interval: u32,
        will: Option<Will>,
        subscriptions: &SubscriptionRegistry,
    ) -> Attach {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut sessions = self.sessions.write();

        let (client_id, expired) = match sessions.get_key_value(connection.client_id()) {
            Some((client_id, session)) => (client_id.clone(), session.lock().is_expired(now)),
            None => (Arc::from(connection.client_id()), false),
        };
        let resumable = sessions.contains_key(&client_id) && !clean_start && !expired;

        let mut evicted = None;
        let mut discarded_subscriptions = 0;
        let mut expired_will = None;
        if !resumable {
            if let Some(old) = sessions.remove(&client_id) {
                let mut old = old.into_inner();
                old.cancel_timers();
                // Expiry ended the old session before its timer got to it
                if expired {
                    expired_will = old.take_will();
                }
                evicted = old.detach();
                old.discard_state();
                old.state = SessionState::Expired;
                discarded_subscriptions = subscriptions.unsubscribe_all(&client_id);
                debug!(client_id = %client_id, "discarded previous session");
            }
        }

        let session = sessions
            .entry(client_id.clone())
            .or_insert_with(|| Mutex::new(Session::new(client_id.clone(), self.limits)))
            .get_mut();
        if let Some(previous) = session.attach(connection_id, connection) {
            evicted = Some(previous);
        }
        session.session_expiry_interval = session_expiry_interval;
        session.will = will;
        let resumed = if resumable {
            session.resume_delivery()
        } else {
            0
        };

        if resumable {
            info!(client_id = %client_id, resumed, "session resumed");
        } else {
            info!(client_id = %client_id, "session created");
        }

        Attach {
            key: SessionKey {
                client_id,
                connection_id,
            },
            session_present: resumable,
            evicted,
            resumed,
            discarded_subscriptions,
            expired,
            expired_will,
        }
    }

    /// Detach the connection identified by `key`
    ///
    /// With an expiry interval of 0 the session is destroyed before the
    /// lock is released. Otherwise `arm` runs on the detached session, still
    /// under the write lock, to schedule its expiry and will timers.
    /// Returns `None` if the key no longer resolves.
    pub fn disconnect<F>(
        &self,
        key: &SessionKey,
        send_will: bool,
        subscriptions: &SubscriptionRegistry,
        arm: F,
    ) -> Option<Detach>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(key.client_id())?.get_mut();
        if !is_current(session, key) {
            return None;
        }

        session.detach();
        if !send_will {
            session.will = None;
        }

        if session.session_expiry_interval == 0 {
            let mut session = sessions.remove(key.client_id())?.into_inner();
            let will = session.take_will();
            session.cancel_timers();
            session.discard_state();
            session.state = SessionState::Expired;
            let removed_subscriptions = subscriptions.unsubscribe_all(key.client_id());
            debug!(client_id = %key.client_id, "session destroyed on disconnect");
            return Some(Detach {
                destroyed: true,
                removed_subscriptions,
                will,
            });
        }

        let immediate = session
            .will
            .as_ref()
            .is_some_and(|w| w.properties.will_delay_interval.unwrap_or(0) == 0);
        let will = if immediate { session.will.take() } else { None };
        arm(session);

        Some(Detach {
            destroyed: false,
            removed_subscriptions: 0,
            will,
        })
    }

    /// Destroy a detached session whose expiry timer fired
    ///
    /// Does nothing unless the session is still in the epoch the timer was
    /// armed for.
    pub fn expire(
        &self,
        client_id: &str,
        epoch: u64,
        subscriptions: &SubscriptionRegistry,
    ) -> Option<Expired> {
        let mut sessions = self.sessions.write();
        {
            let session = sessions.get_mut(client_id)?.get_mut();
            if session.epoch() != epoch || session.state != SessionState::Detached {
                return None;
            }
            // The firing timer's own handle
            session.expiry_timer = None;
        }

        let mut session = sessions.remove(client_id)?.into_inner();
        let will = session.take_will();
        session.cancel_timers();
        session.discard_state();
        session.state = SessionState::Expired;
        let removed_subscriptions = subscriptions.unsubscribe_all(client_id);
        info!(client_id, "session expired");

        Some(Expired {
            removed_subscriptions,
            will,
        })
    }

    /// Take the will of a detached session whose will delay elapsed
    ///
    /// Runs under the write lock, like the other timer-driven transitions.
    pub fn take_delayed_will(&self, client_id: &str, epoch: u64) -> Option<Will> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(client_id)?.get_mut();
        if session.epoch() != epoch || session.state != SessionState::Detached {
            return None;
        }
        // The firing timer's own handle
        session.will_timer = None;
        session.will.take()
    }

    /// Remove a session outright, whatever its state
    pub fn destroy(&self, client_id: &str, subscriptions: &SubscriptionRegistry) -> bool {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.remove(client_id) else {
            return false;
        };
        let mut session = session.into_inner();
        session.cancel_timers();
        if let Some(connection) = session.detach() {
            connection.close();
        }
        session.discard_state();
        session.state = SessionState::Expired;
        subscriptions.unsubscribe_all(client_id);
        true
    }

    /// Run `f` on the session `key` is attached to
    pub fn resolve<R>(&self, key: &SessionKey, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let sessions = self.sessions.read();
        let mut session = sessions.get(key.client_id())?.lock();
        if !is_current(&session, key) {
            return None;
        }
        Some(f(&mut session))
    }

    /// Run `f` on the session for a client id, attached or not
    pub fn with_session<R>(&self, client_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let sessions = self.sessions.read();
        let mut session = sessions.get(client_id)?.lock();
        Some(f(&mut session))
    }

    /// Run `f` on the session of each client id under one read lock
    ///
    /// Client ids with no session are skipped.
    pub fn for_each_session<T, I, F>(&self, items: I, mut f: F)
    where
        I: IntoIterator<Item = (Arc<str>, T)>,
        F: FnMut(T, &mut Session),
    {
        let sessions = self.sessions.read();
        for (client_id, item) in items {
            if let Some(session) = sessions.get(&client_id) {
                f(item, &mut *session.lock());
            }
        }
    }

    pub fn session_info(&self, client_id: &str) -> Option<SessionInfo> {
        self.with_session(client_id, |s| SessionInfo {
            client_id: s.client_id.clone(),
            state: s.state,
            connection_id: s.connection_id(),
            session_expiry_interval: s.session_expiry_interval,
            inflight: s.inflight_count(),
            pending: s.pending_count(),
            has_will: s.will.is_some(),
        })
    }

    /// Outbound messages awaiting acknowledgement across all sessions
    pub fn inflight_total(&self) -> usize {
        self.sessions
            .read()
            .values()
            .map(|s| s.lock().inflight_count())
            .sum()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.read().contains_key(client_id)
    }

    /// Get session count
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionLimits::default())
    }
}

fn is_current(session: &Session, key: &SessionKey) -> bool {
    session.is_attached() && session.connection_id() == Some(key.connection_id)
}
