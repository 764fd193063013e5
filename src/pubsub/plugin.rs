//! Node type plugins.
//!
//! A plugin is a capability table for one node type: the feature set
//! it advertises, the option defaults it applies, who may create nodes
//! under it, and how it talks to the store. Defaults live on the trait
//! and the variants override what differs, mirroring the way the
//! original plugin modules layer over a base table.

use jid::BareJid;

use crate::config::{NodeCreationPolicy, PubSubConfig};
use crate::pubsub::node::{AccessModel, NodeOptions, SendLastPublishedItem};
use crate::pubsub::store::{Host, Node};

/// How a plugin accesses the node store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Full transactions for every mutation.
    Transaction,
    /// Single-operation writes for item publishing.
    SyncDirty,
}

/// Features every plugin supports unless it says otherwise.
const BASE_FEATURES: &[&str] = &[
    "create-nodes",
    "auto-create",
    "access-authorize",
    "delete-nodes",
    "delete-items",
    "instant-nodes",
    "manage-subscriptions",
    "modify-affiliations",
    "outcast-affiliation",
    "persistent-items",
    "publish",
    "purge-nodes",
    "retract-items",
    "retrieve-affiliations",
    "retrieve-items",
    "retrieve-subscriptions",
    "subscribe",
    "subscription-notifications",
    "subscription-options",
];

/// Capability table for one node type.
pub trait NodePlugin: Send + Sync + 'static {
    /// Plugin (node type) name.
    fn name(&self) -> &'static str;

    /// Features this type advertises (`pubsub#<feature>` disco vars).
    fn features(&self) -> Vec<&'static str> {
        BASE_FEATURES.to_vec()
    }

    /// Whether a feature is supported.
    fn has_feature(&self, feature: &str) -> bool {
        self.features().contains(&feature)
    }

    /// Option defaults for newly created nodes.
    fn default_options(&self, config: &PubSubConfig) -> NodeOptions {
        NodeOptions {
            max_items: config.max_items_node,
            ..NodeOptions::default()
        }
    }

    /// Whether `creator` may create a node under `parent` on `host`.
    fn create_permitted(
        &self,
        host: &Host,
        parent: Option<&Node>,
        creator: &BareJid,
        policy: NodeCreationPolicy,
        is_admin: bool,
    ) -> bool {
        if is_admin {
            return true;
        }
        // A parent collection restricts creation to its owners.
        if let Some(parent) = parent {
            return parent.owners.contains(creator);
        }
        match policy {
            NodeCreationPolicy::Open => !host.is_pep(),
            NodeCreationPolicy::AdminOnly => false,
        }
    }

    /// Whether one entity may hold several subscriptions to one node.
    fn multi_subscribe(&self) -> bool {
        false
    }

    /// Store access mode for item writes.
    fn storage_mode(&self) -> StorageMode {
        StorageMode::Transaction
    }
}

/// The default flat node type: no hierarchy semantics of its own.
pub struct FlatPlugin;

impl NodePlugin for FlatPlugin {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn storage_mode(&self) -> StorageMode {
        StorageMode::SyncDirty
    }
}

/// PEP nodes: hosted on a bare JID, presence access, auto-created.
pub struct PepPlugin;

impl NodePlugin for PepPlugin {
    fn name(&self) -> &'static str {
        "pep"
    }

    fn features(&self) -> Vec<&'static str> {
        let mut features = BASE_FEATURES.to_vec();
        features.push("access-presence");
        features.push("auto-subscribe");
        features.push("filtered-notifications");
        features.retain(|f| *f != "instant-nodes");
        features
    }

    fn default_options(&self, config: &PubSubConfig) -> NodeOptions {
        NodeOptions {
            access_model: AccessModel::Presence,
            send_last_published_item: SendLastPublishedItem::OnSubAndPresence,
            presence_based_delivery: true,
            max_items: config.max_items_node.max(1),
            ..NodeOptions::default()
        }
    }

    fn create_permitted(
        &self,
        host: &Host,
        _parent: Option<&Node>,
        creator: &BareJid,
        _policy: NodeCreationPolicy,
        is_admin: bool,
    ) -> bool {
        // Only the account itself publishes into its PEP tree.
        match host {
            Host::Account(account) => is_admin || account == creator,
            Host::Domain(_) => false,
        }
    }
}

/// Home-tree nodes: per-user subtrees under `/home/<domain>/<user>`.
pub struct HometreePlugin;

impl HometreePlugin {
    /// The subtree prefix a user owns.
    pub fn home_prefix(creator: &BareJid) -> String {
        let node = creator.node().map(|n| n.to_string()).unwrap_or_default();
        format!("/home/{}/{}", creator.domain(), node)
    }
}

impl NodePlugin for HometreePlugin {
    fn name(&self) -> &'static str {
        "hometree"
    }

    fn create_permitted(
        &self,
        host: &Host,
        parent: Option<&Node>,
        creator: &BareJid,
        policy: NodeCreationPolicy,
        is_admin: bool,
    ) -> bool {
        if is_admin {
            return true;
        }
        if host.is_pep() {
            return false;
        }
        if let Some(parent) = parent {
            if parent.owners.contains(creator) {
                return true;
            }
        }
        // Anyone may build inside their own home subtree; elsewhere
        // the service policy decides.
        matches!(policy, NodeCreationPolicy::Open)
    }
}

/// Look up a plugin by node type name.
pub fn plugin(name: &str) -> Option<&'static dyn NodePlugin> {
    static FLAT: FlatPlugin = FlatPlugin;
    static PEP: PepPlugin = PepPlugin;
    static HOMETREE: HometreePlugin = HometreePlugin;

    match name {
        "flat" => Some(&FLAT),
        "pep" => Some(&PEP),
        "hometree" => Some(&HOMETREE),
        _ => None,
    }
}
