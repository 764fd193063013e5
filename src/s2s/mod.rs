//! Outgoing server-to-server (S2S) federation.
//!
//! This module implements the outbound half of S2S federation:
//! - DNS SRV discovery with weighted ordering and A/AAAA fallback
//! - Per-pair outgoing session state machines (one logical session per
//!   `(local domain, remote domain)` pair)
//! - STARTTLS and SASL EXTERNAL negotiation
//! - Server Dialback (XEP-0220), including verifier sub-sessions
//! - Stanza queueing while connecting, bounce on failure, and
//!   exponential retry backoff
//!
//! # Architecture
//!
//! Each session is a tokio task with a mailbox. The state machine
//! itself ([`session::SessionCore`]) is a pure transition function;
//! the task driver owns the socket and timers and executes the actions
//! the core emits. The [`registry::S2sRegistry`] maps pairs to their
//! authoritative session and is the `send(local, remote, stanza)`
//! entry point for the router.
//!
//! The incoming S2S listener is a collaborator: it consumes
//! [`registry::S2sRegistry::has_key`] to validate dialback keys it is
//! asked about and [`registry::S2sRegistry::request_verify`] to run
//! the callback side of dialback.

pub mod dialback;
pub mod dns;
pub mod registry;
pub mod session;
pub mod transport;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub use dialback::{DialbackKey, DialbackResult, NS_DIALBACK, NS_DIALBACK_FEATURES};
pub use dns::{SrvResolver, SrvTarget, DEFAULT_S2S_PORT};
pub use registry::S2sRegistry;
pub use session::{SessionCore, SessionRole, SessionState};

/// Counters for the outgoing S2S subsystem.
#[derive(Debug, Default)]
pub struct S2sMetrics {
    sessions_started: AtomicI64,
    sessions_established: AtomicI64,
    active_sessions: AtomicI64,
    tls_upgrades: AtomicI64,
    stanzas_relayed: AtomicU64,
    stanzas_bounced: AtomicU64,
}

impl S2sMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a session task starting.
    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session reaching `stream_established`.
    pub fn record_session_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session terminating.
    pub fn record_session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a completed STARTTLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stanza written to a remote stream.
    pub fn record_stanza_relayed(&self) {
        self.stanzas_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stanza bounced back to its sender.
    pub fn record_stanza_bounced(&self) {
        self.stanzas_bounced.fetch_add(1, Ordering::Relaxed);
    }

    /// Current number of live session tasks.
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Total stanzas bounced so far.
    pub fn total_bounced(&self) -> u64 {
        self.stanzas_bounced.load(Ordering::Relaxed)
    }

    /// Total stanzas relayed so far.
    pub fn total_relayed(&self) -> u64 {
        self.stanzas_relayed.load(Ordering::Relaxed)
    }
}
