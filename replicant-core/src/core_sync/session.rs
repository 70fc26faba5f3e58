//! Who is using the client, and whether it is connected.
//!
//! Every change of the session bumps an epoch. Backoff timers remember the
//! epoch they were started in and give up if it changed while they slept.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why the client went offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineReason {
    /// Too many consecutive stream failures
    ConnectionLost,
    /// The server rejected the credentials
    AuthFailed,
}

impl OfflineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfflineReason::ConnectionLost => "connection_lost",
            OfflineReason::AuthFailed => "auth_failed",
        }
    }
}

impl fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Externally visible connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    #[default]
    Online,
    Offline(OfflineReason),
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<u64>,
    guests_enabled: bool,
}

/// Active user and guest policy
#[derive(Debug, Default)]
pub struct Session {
    state: RwLock<SessionState>,
    epoch: AtomicU64,
}

impl Session {
    pub fn new(user: Option<u64>, guests_enabled: bool) -> Self {
        Self {
            state: RwLock::new(SessionState {
                user,
                guests_enabled,
            }),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn user(&self) -> Option<u64> {
        self.state.read().user
    }

    pub fn guests_enabled(&self) -> bool {
        self.state.read().guests_enabled
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Reconnecting only makes sense for a logged-in user or a guest.
    pub fn should_retry(&self) -> bool {
        let state = self.state.read();
        state.user.is_some() || state.guests_enabled
    }

    pub fn set_user(&self, user: Option<u64>) {
        let mut state = self.state.write();
        if state.user != user {
            state.user = user;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn set_guests_enabled(&self, enabled: bool) {
        let mut state = self.state.write();
        if state.guests_enabled != enabled {
            state.guests_enabled = enabled;
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
    }
}
