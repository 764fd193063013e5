//! XEP-0060 Publish-Subscribe and XEP-0163 PEP core.
//!
//! The pub/sub core is a node tree where each node carries an access
//! policy, an affiliation/subscription table, and a bounded item
//! store. The [`controller::PubSubService`] implements the protocol
//! verbs, the [`broadcaster`] computes filtered recipient sets, and
//! the [`store`] holds the tables behind a transactional seam.
//!
//! One service instance exists per host: a service domain for regular
//! pub/sub, a bare JID for PEP. PEP hosts differ in their defaults
//! (presence access model, presence-driven last-item delivery) and in
//! the sender identity of their notifications.

pub mod broadcaster;
pub mod controller;
pub mod node;
pub mod pep;
pub mod plugin;
pub mod stanzas;
pub mod store;

pub use broadcaster::{compute_recipients, EventClass, EventSender, Recipient};
pub use controller::{PubSubService, PublishOutcome, SubscribeOutcome};
pub use node::{
    AccessModel, NodeOptions, NotificationType, PublishModel, SendLastPublishedItem, SubOptions,
    SubscriptionDepth, SubscriptionType,
};
pub use plugin::{plugin, FlatPlugin, HometreePlugin, NodePlugin, PepPlugin, StorageMode};
pub use stanzas::{
    is_pubsub_iq, parse_pubsub_iq, PubSubItem, PubSubRequest, NS_PUBSUB, NS_PUBSUB_EVENT,
    NS_PUBSUB_OWNER, NS_SHIM,
};
pub use store::{Affiliation, Host, Item, MemoryNodeStore, Node, NodeIdx, SubState};

/// Service discovery identity of a host: `(category, type)`.
pub fn service_identity(host: &Host) -> (&'static str, &'static str) {
    if host.is_pep() {
        ("pubsub", "pep")
    } else {
        ("pubsub", "service")
    }
}

/// Service discovery identity of a node: a node other nodes list as
/// their parent is a collection, everything else is a leaf.
pub fn node_identity(has_children: bool) -> (&'static str, &'static str) {
    ("pubsub", if has_children { "collection" } else { "leaf" })
}

/// Disco feature vars advertised for a host, derived from its default
/// plugin's feature table.
pub fn service_features(node_plugin: &dyn NodePlugin) -> Vec<String> {
    let mut features = vec![NS_PUBSUB.to_string()];
    features.extend(
        node_plugin
            .features()
            .iter()
            .map(|f| format!("{}#{}", NS_PUBSUB, f)),
    );
    features
}
