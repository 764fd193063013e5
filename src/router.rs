//! Stanza routing between the local server and remote domains.
//!
//! The router is a task with a mailbox: producers (the pub/sub
//! broadcaster, bounce paths, the incoming S2S listener) hand it
//! stanzas through a cheap [`RouterHandle`], and it dispatches each to
//! local delivery or to the outgoing S2S registry based on the
//! destination domain. Local delivery itself belongs to the C2S layer
//! and is reached through the [`LocalDelivery`] seam.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::s2s::registry::S2sRegistry;
use crate::XmppError;

/// Where a stanza is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingDestination {
    /// Destination domain is served by this process.
    Local,
    /// Destination domain requires federation.
    Remote {
        /// The remote domain
        domain: String,
    },
}

/// Delivery of stanzas to locally connected entities.
pub trait LocalDelivery: Send + Sync + 'static {
    /// Deliver a stanza to a local recipient (or store it offline).
    fn deliver(&self, stanza: Element) -> impl Future<Output = Result<(), XmppError>> + Send;
}

/// Cheap cloneable handle used to enqueue stanzas for routing.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<Element>,
}

impl RouterHandle {
    /// Enqueue a stanza for routing.
    pub fn route(&self, stanza: Element) -> Result<(), XmppError> {
        self.tx
            .send(stanza)
            .map_err(|_| XmppError::internal("router task is gone"))
    }
}

/// Create a router mailbox.
pub fn router_channel() -> (RouterHandle, mpsc::UnboundedReceiver<Element>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RouterHandle { tx }, rx)
}

/// The router task.
pub struct StanzaRouter<L: LocalDelivery> {
    local_domains: HashSet<String>,
    default_local: String,
    local: Arc<L>,
    registry: Arc<S2sRegistry>,
}

impl<L: LocalDelivery> StanzaRouter<L> {
    /// Create a router for the given served domains. The first domain
    /// is asserted on outgoing streams when a stanza carries no usable
    /// `from`.
    pub fn new(
        local_domains: Vec<String>,
        local: Arc<L>,
        registry: Arc<S2sRegistry>,
    ) -> Self {
        let default_local = local_domains
            .first()
            .cloned()
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            local_domains: local_domains.into_iter().collect(),
            default_local,
            local,
            registry,
        }
    }

    /// Classify a destination domain.
    pub fn destination(&self, domain: &str) -> RoutingDestination {
        if self.local_domains.contains(domain) {
            RoutingDestination::Local
        } else {
            RoutingDestination::Remote {
                domain: domain.to_string(),
            }
        }
    }

    /// Run the routing loop until all handles are dropped.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Element>) {
        while let Some(stanza) = rx.recv().await {
            if let Err(e) = self.dispatch(stanza).await {
                warn!(error = %e, "Failed to route stanza");
            }
        }
        debug!("Router mailbox closed, stopping");
    }

    async fn dispatch(&self, stanza: Element) -> Result<(), XmppError> {
        let Some(to) = stanza.attr("to") else {
            warn!(stanza = %stanza.name(), "Dropping stanza without 'to'");
            return Ok(());
        };

        let to_jid: Jid = to
            .parse()
            .map_err(|_| XmppError::xml_parse(format!("malformed destination JID: {}", to)))?;
        let domain = to_jid.domain().to_string();

        match self.destination(&domain) {
            RoutingDestination::Local => self.local.deliver(stanza).await,
            RoutingDestination::Remote { domain } => {
                let local = self.local_domain_for(&stanza);
                self.registry.send(&local, &domain, stanza)
            }
        }
    }

    /// Pick the local domain a stanza should be asserted from: the
    /// `from` domain when it is one of ours, the default otherwise.
    fn local_domain_for(&self, stanza: &Element) -> String {
        stanza
            .attr("from")
            .and_then(|from| from.parse::<Jid>().ok())
            .map(|jid| jid.domain().to_string())
            .filter(|domain| self.local_domains.contains(domain))
            .unwrap_or_else(|| self.default_local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDelivery;

    impl LocalDelivery for NullDelivery {
        async fn deliver(&self, _stanza: Element) -> Result<(), XmppError> {
            Ok(())
        }
    }

    fn test_router() -> StanzaRouter<NullDelivery> {
        let (handle, _rx) = router_channel();
        let registry =
            S2sRegistry::new(crate::config::S2sConfig::default(), handle, b"secret".to_vec());
        StanzaRouter::new(
            vec!["a.example".to_string(), "muc.a.example".to_string()],
            Arc::new(NullDelivery),
            registry,
        )
    }

    #[test]
    fn test_destination_classification() {
        let router = test_router();

        assert_eq!(router.destination("a.example"), RoutingDestination::Local);
        assert_eq!(
            router.destination("muc.a.example"),
            RoutingDestination::Local
        );
        assert_eq!(
            router.destination("b.example"),
            RoutingDestination::Remote {
                domain: "b.example".to_string()
            }
        );
    }

    #[test]
    fn test_local_domain_selection() {
        let router = test_router();

        let stanza = Element::builder("message", "jabber:server")
            .attr("from", "user@a.example")
            .attr("to", "peer@b.example")
            .build();
        assert_eq!(router.local_domain_for(&stanza), "a.example");

        // Foreign 'from' falls back to the default local domain.
        let stanza = Element::builder("message", "jabber:server")
            .attr("from", "user@elsewhere.example")
            .attr("to", "peer@b.example")
            .build();
        assert_eq!(router.local_domain_for(&stanza), "a.example");
    }
}
