//! Registry of outgoing S2S sessions.
//!
//! Maps each `(local, remote)` pair to its single authoritative
//! session and is the `send` entry point the router uses. The slot is
//! claimed with compare-and-set semantics: a session that loses the
//! race exits quietly, and a stale session cannot evict a fresh one
//! because removal compares the per-session token stored at claim
//! time.
//!
//! Dialback verifier sub-sessions are spawned here too but never
//! occupy a pair slot; their verdicts come back through one-shot
//! waiters keyed by `(pair, stream id)`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use minidom::Element;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::S2sConfig;
use crate::router::RouterHandle;
use crate::s2s::dialback::DialbackKey;
use crate::s2s::dns::SrvResolver;
use crate::s2s::session::{SessionCommand, SessionDriver, SessionHandle, SessionRole};
use crate::s2s::S2sMetrics;
use crate::types::{DomainPair, SessionId};
use crate::XmppError;

struct RegistryEntry {
    session: SessionId,
    token: u64,
    /// Dialback key the session asserts in its `db:result`.
    key: String,
    handle: SessionHandle,
}

/// Registry and spawner for outgoing S2S sessions.
pub struct S2sRegistry {
    config: Arc<S2sConfig>,
    router: RouterHandle,
    dialback: DialbackKey,
    resolver: SrvResolver,
    tls: std::sync::RwLock<Option<TlsConnector>>,
    table: DashMap<DomainPair, RegistryEntry>,
    verify_waiters: DashMap<(DomainPair, String), oneshot::Sender<bool>>,
    next_session: AtomicU64,
    metrics: Arc<S2sMetrics>,
    /// Back-reference handed to session tasks so a dropped registry
    /// tears its sessions down.
    self_ref: std::sync::Weak<Self>,
}

impl S2sRegistry {
    /// Create a registry. `secret` seeds the dialback key generator
    /// and must stay stable for the process lifetime.
    pub fn new(config: S2sConfig, router: RouterHandle, secret: Vec<u8>) -> Arc<Self> {
        let resolver = SrvResolver::new(&config.dns, config.connect.clone());
        Arc::new_cyclic(|weak| Self {
            config: Arc::new(config),
            router,
            dialback: DialbackKey::new(secret),
            resolver,
            tls: std::sync::RwLock::new(None),
            table: DashMap::new(),
            verify_waiters: DashMap::new(),
            next_session: AtomicU64::new(1),
            metrics: Arc::new(S2sMetrics::new()),
            self_ref: weak.clone(),
        })
    }

    /// Attach the TLS connector used for STARTTLS upgrades. Without
    /// one, sessions negotiate dialback over plaintext only.
    pub fn set_tls_connector(&self, connector: TlsConnector) {
        *self.tls.write().expect("tls lock poisoned") = Some(connector);
    }

    fn tls_connector(&self) -> Option<TlsConnector> {
        self.tls.read().expect("tls lock poisoned").clone()
    }

    /// Subsystem metrics.
    pub fn metrics(&self) -> &Arc<S2sMetrics> {
        &self.metrics
    }

    /// Route a stanza towards `remote`, asserting `local`. Reuses the
    /// pair's session or spawns one; stanzas sent before the stream is
    /// established are queued in arrival order.
    #[instrument(skip(self, stanza), fields(local = %local, remote = %remote))]
    pub fn send(&self, local: &str, remote: &str, stanza: Element) -> Result<(), XmppError> {
        let pair = DomainPair::new(local, remote);

        // One retry: a dead handle means the task exited between our
        // lookup and the send, so evict and spawn fresh.
        for _ in 0..2 {
            let handle = {
                let entry = self
                    .table
                    .entry(pair.clone())
                    .or_insert_with(|| self.new_entry(&pair));
                entry.handle.clone()
            };

            if handle.command(SessionCommand::Send(stanza.clone())) {
                return Ok(());
            }

            debug!(pair = %pair, "Session mailbox closed, evicting stale entry");
            self.table
                .remove_if(&pair, |_, e| e.session == handle.id);
        }

        warn!(pair = %pair, "Could not hand stanza to a session");
        self.bounce(stanza, XmppError::remote_server_not_found());
        Ok(())
    }

    fn new_entry(&self, pair: &DomainPair) -> RegistryEntry {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let token = rand::random::<u64>();

        // The asserted key is derived from a fresh nonce so every
        // session asserts a distinct value; incoming `db:verify`
        // requests are answered from the table via `has_key`.
        let nonce = Uuid::new_v4().to_string();
        let key = self.dialback.generate(&nonce, &pair.remote, &pair.local);

        let handle = SessionDriver::spawn(
            pair.clone(),
            SessionRole::New { key: key.clone() },
            session,
            token,
            Arc::clone(&self.config),
            self.resolver.clone(),
            self.tls_connector(),
            self.self_ref.clone(),
            Arc::clone(&self.metrics),
        );

        debug!(pair = %pair, id = %session, "Spawned outgoing S2S session");
        RegistryEntry {
            session,
            token,
            key,
            handle,
        }
    }

    /// Claim confirmation for a newly spawned session: returns the
    /// stored key when `session` holds the pair slot, `None` when it
    /// lost the race and must exit.
    pub fn try_register(&self, pair: &DomainPair, session: SessionId) -> Option<String> {
        self.table
            .get(pair)
            .filter(|entry| entry.session == session)
            .map(|entry| entry.key.clone())
    }

    /// Compare-and-clear removal: only the session that still holds
    /// the slot (same id and token) may clear it.
    pub fn remove_connection(&self, pair: &DomainPair, session: SessionId, token: u64) {
        let removed = self
            .table
            .remove_if(pair, |_, entry| {
                entry.session == session && entry.token == token
            })
            .is_some();
        if removed {
            debug!(pair = %pair, id = %session, "Removed S2S registry entry");
        }
    }

    /// Session ids currently registered for a pair (at most one).
    pub fn get_connections(&self, pair: &DomainPair) -> Vec<SessionId> {
        self.table
            .get(pair)
            .map(|entry| vec![entry.session])
            .unwrap_or_default()
    }

    /// Whether `key` is the key the pair's session asserts. The
    /// incoming listener uses this to answer `db:verify` requests from
    /// remote servers calling us back.
    pub fn has_key(&self, pair: &DomainPair, key: &str) -> bool {
        self.table
            .get(pair)
            .map(|entry| entry.key == key)
            .unwrap_or(false)
    }

    /// Terminate the pair's session if it is sitting out a retry
    /// delay, so the next send attempts a fresh connection at once.
    pub fn terminate_if_waiting_delay(&self, local: &str, remote: &str) {
        let pair = DomainPair::new(local, remote);
        if let Some(entry) = self.table.get(&pair) {
            entry.handle.command(SessionCommand::CancelRetry);
        }
    }

    /// Run the callback side of dialback: verify `key` for the stream
    /// `id` against the authoritative server for `remote`. The verdict
    /// arrives on the returned receiver; a dropped sender means the
    /// verification could not be carried out.
    pub fn request_verify(
        &self,
        local: &str,
        remote: &str,
        id: &str,
        key: &str,
    ) -> oneshot::Receiver<bool> {
        let pair = DomainPair::new(local, remote);
        let (tx, rx) = oneshot::channel();
        self.verify_waiters
            .insert((pair.clone(), id.to_string()), tx);

        // Reuse the established session to the authoritative server
        // when there is one; otherwise run a verifier sub-session.
        let relayed = self
            .table
            .get(&pair)
            .map(|entry| {
                entry.handle.command(SessionCommand::Verify {
                    id: id.to_string(),
                    key: key.to_string(),
                })
            })
            .unwrap_or(false);

        if !relayed {
            let session = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
            SessionDriver::spawn(
                pair.clone(),
                SessionRole::Verify {
                    request_id: id.to_string(),
                    key: key.to_string(),
                    stream_id: id.to_string(),
                },
                session,
                rand::random::<u64>(),
                Arc::clone(&self.config),
                self.resolver.clone(),
                self.tls_connector(),
                self.self_ref.clone(),
                Arc::clone(&self.metrics),
            );
            debug!(pair = %pair, id = %session, "Spawned dialback verifier session");
        }

        rx
    }

    /// Deliver a verify verdict to its waiter.
    pub fn complete_verify(&self, pair: &DomainPair, request_id: &str, valid: bool) {
        if let Some((_, tx)) = self
            .verify_waiters
            .remove(&(pair.clone(), request_id.to_string()))
        {
            let _ = tx.send(valid);
        } else {
            debug!(pair = %pair, id = %request_id, "Verify verdict with no waiter");
        }
    }

    /// Bounce an unroutable stanza back to its sender with the given
    /// error. `error`- and `result`-typed stanzas are dropped silently
    /// to avoid error loops.
    pub fn bounce(&self, stanza: Element, error: XmppError) {
        match bounce_reply(&stanza, &error) {
            Some(reply) => {
                self.metrics.record_stanza_bounced();
                if let Err(e) = self.router.route(reply) {
                    warn!(error = %e, "Could not route bounce reply");
                }
            }
            None => {
                debug!(name = %stanza.name(), "Dropping unbounceable stanza");
            }
        }
    }
}

/// Build the error reply for a bounced stanza, or `None` when the
/// stanza must be dropped (`error`/`result` types, or no sender).
pub fn bounce_reply(stanza: &Element, error: &XmppError) -> Option<Element> {
    if matches!(stanza.attr("type"), Some("error") | Some("result")) {
        return None;
    }
    let sender = stanza.attr("from")?;

    let ns = stanza.ns();
    let mut builder = Element::builder(stanza.name(), ns.clone())
        .attr("type", "error")
        .attr("to", sender);

    if let Some(receiver) = stanza.attr("to") {
        builder = builder.attr("from", receiver);
    }
    if let Some(id) = stanza.attr("id") {
        builder = builder.attr("id", id);
    }

    for child in stanza.children() {
        builder = builder.append(child.clone());
    }
    builder = builder.append(error.to_error_element(&ns));

    Some(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ns;

    fn registry() -> Arc<S2sRegistry> {
        let (router, _rx) = crate::router::router_channel();
        S2sRegistry::new(S2sConfig::default(), router, b"registry-test-secret".to_vec())
    }

    fn message(from: &str, to: &str) -> Element {
        Element::builder("message", ns::JABBER_SERVER)
            .attr("from", from)
            .attr("to", to)
            .attr("id", "m1")
            .attr("type", "chat")
            .append(Element::builder("body", ns::JABBER_SERVER).append("hi".to_string()).build())
            .build()
    }

    #[test]
    fn test_bounce_reply_swaps_addresses() {
        let stanza = message("user@a.example", "peer@b.example");
        let reply = bounce_reply(&stanza, &XmppError::remote_server_not_found()).unwrap();

        assert_eq!(reply.attr("to"), Some("user@a.example"));
        assert_eq!(reply.attr("from"), Some("peer@b.example"));
        assert_eq!(reply.attr("type"), Some("error"));
        assert_eq!(reply.attr("id"), Some("m1"));

        let error = reply
            .children()
            .find(|c| c.name() == "error")
            .expect("error child");
        assert!(error
            .get_child("remote-server-not-found", crate::error::NS_STANZAS)
            .is_some());
        // Original payload is echoed back.
        assert!(reply.children().any(|c| c.name() == "body"));
    }

    #[test]
    fn test_bounce_reply_drops_error_and_result_types() {
        let mut stanza = message("user@a.example", "peer@b.example");
        stanza.set_attr("type", "error");
        assert!(bounce_reply(&stanza, &XmppError::remote_server_not_found()).is_none());

        let mut stanza = message("user@a.example", "peer@b.example");
        stanza.set_attr("type", "result");
        assert!(bounce_reply(&stanza, &XmppError::remote_server_not_found()).is_none());
    }

    #[test]
    fn test_bounce_reply_requires_sender() {
        let stanza = Element::builder("message", ns::JABBER_SERVER)
            .attr("to", "peer@b.example")
            .build();
        assert!(bounce_reply(&stanza, &XmppError::remote_server_not_found()).is_none());
    }

    #[tokio::test]
    async fn test_send_registers_one_session_per_pair() {
        let registry = registry();
        let pair = DomainPair::new("a.example", "b.example");

        registry
            .send("a.example", "b.example", message("u@a.example", "p@b.example"))
            .unwrap();
        registry
            .send("a.example", "b.example", message("u@a.example", "p@b.example"))
            .unwrap();

        let sessions = registry.get_connections(&pair);
        assert_eq!(sessions.len(), 1);

        // The winning session can confirm its claim; an impostor
        // cannot.
        assert!(registry.try_register(&pair, sessions[0]).is_some());
        assert!(registry.try_register(&pair, SessionId(9999)).is_none());
    }

    #[tokio::test]
    async fn test_remove_connection_is_compare_and_clear() {
        let registry = registry();
        let pair = DomainPair::new("a.example", "b.example");

        registry
            .send("a.example", "b.example", message("u@a.example", "p@b.example"))
            .unwrap();
        let session = registry.get_connections(&pair)[0];

        // Wrong token: entry survives.
        registry.remove_connection(&pair, session, 0);
        assert_eq!(registry.get_connections(&pair).len(), 1);

        // Wrong session id: entry survives.
        registry.remove_connection(&pair, SessionId(9999), 0);
        assert_eq!(registry.get_connections(&pair).len(), 1);
    }

    #[tokio::test]
    async fn test_has_key_matches_stored_key() {
        let registry = registry();
        let pair = DomainPair::new("a.example", "b.example");

        registry
            .send("a.example", "b.example", message("u@a.example", "p@b.example"))
            .unwrap();
        let session = registry.get_connections(&pair)[0];
        let key = registry.try_register(&pair, session).unwrap();

        assert!(registry.has_key(&pair, &key));
        assert!(!registry.has_key(&pair, "not-the-key"));
        assert!(!registry.has_key(&DomainPair::new("a.example", "c.example"), &key));
    }

    #[tokio::test]
    async fn test_complete_verify_wakes_waiter() {
        let registry = registry();
        let pair = DomainPair::new("a.example", "unresolvable.invalid");

        let rx = registry.request_verify("a.example", "unresolvable.invalid", "sid-7", "k");
        registry.complete_verify(&pair, "sid-7", true);

        assert_eq!(rx.await, Ok(true));
    }
}
