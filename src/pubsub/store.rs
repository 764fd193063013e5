//! Node tree and per-node state tables.
//!
//! The backing engine is used as an opaque transactional store: the
//! [`MemoryNodeStore`] offers `transaction` (atomic, state restored on
//! error) and `sync_dirty` (single operation, no isolation) over the
//! [`Tables`]. Node-mutating paths go through `transaction`; read
//! paths and item publishing may use `sync_dirty` when the plugin opts
//! in.
//!
//! `NodeIdx` values are allocated monotonically from 1 and act as the
//! foreign key for every per-node table; deleted indexes are reclaimed
//! through a free list.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use jid::BareJid;
use minidom::Element;

use crate::pubsub::node::{NodeOptions, SubOptions};
use crate::XmppError;

/// Stable numeric node identifier.
pub type NodeIdx = u64;

/// A pub/sub service host: a domain for a regular service, a bare JID
/// for PEP.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// Dedicated service domain (e.g. `pubsub.example.org`).
    Domain(String),
    /// PEP service on a user's bare JID.
    Account(BareJid),
}

impl Host {
    /// Whether this is a PEP host.
    pub fn is_pep(&self) -> bool {
        matches!(self, Self::Account(_))
    }

    /// The JID string notifications are sent from.
    pub fn jid_str(&self) -> String {
        match self {
            Self::Domain(domain) => domain.clone(),
            Self::Account(jid) => jid.to_string(),
        }
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.jid_str())
    }
}

/// Affiliation of an entity with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affiliation {
    /// Full control.
    Owner,
    /// May publish.
    Publisher,
    /// May subscribe/retrieve on whitelisted nodes.
    Member,
    /// Banned.
    Outcast,
    /// No affiliation.
    #[default]
    None,
}

impl Affiliation {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Publisher => "publisher",
            Self::Member => "member",
            Self::Outcast => "outcast",
            Self::None => "none",
        }
    }

    /// Parse a wire value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "publisher" => Some(Self::Publisher),
            "member" => Some(Self::Member),
            "outcast" => Some(Self::Outcast),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    /// Active.
    Subscribed,
    /// Awaiting owner authorization.
    Pending,
    /// Awaiting required configuration.
    Unconfigured,
}

impl SubState {
    /// Wire value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Pending => "pending",
            Self::Unconfigured => "unconfigured",
        }
    }
}

/// Per-`(entity, node)` state record.
#[derive(Debug, Clone, Default)]
pub struct StateRecord {
    /// The entity's affiliation.
    pub affiliation: Affiliation,
    /// Ordered `(state, subid)` pairs.
    pub subscriptions: Vec<(SubState, String)>,
}

impl StateRecord {
    /// Whether any subscription is in the given state.
    pub fn has_subscription_state(&self, state: SubState) -> bool {
        self.subscriptions.iter().any(|(s, _)| *s == state)
    }

    /// Whether the record carries nothing worth persisting.
    pub fn is_empty(&self) -> bool {
        self.affiliation == Affiliation::None && self.subscriptions.is_empty()
    }
}

/// A stored item.
#[derive(Debug, Clone)]
pub struct Item {
    /// Item id, unique within its node.
    pub id: String,
    /// Opaque payload fragments.
    pub payload: Vec<Element>,
    /// First-publish stamp: time and publisher bare JID.
    pub creation: (DateTime<Utc>, BareJid),
    /// Last-publish stamp.
    pub modification: (DateTime<Utc>, BareJid),
}

/// A node in the tree.
#[derive(Debug, Clone)]
pub struct Node {
    /// Owning host.
    pub host: Host,
    /// Node path (the wire `node` attribute).
    pub path: String,
    /// Stable index, immutable once assigned.
    pub idx: NodeIdx,
    /// Plugin (node type) name.
    pub plugin: String,
    /// Owner bare JIDs; never empty for a live node.
    pub owners: Vec<BareJid>,
    /// Configuration.
    pub options: NodeOptions,
}

/// All pub/sub tables. Cloned wholesale for transaction rollback.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    by_path: HashMap<(Host, String), NodeIdx>,
    nodes: HashMap<NodeIdx, Node>,
    states: HashMap<(BareJid, NodeIdx), StateRecord>,
    /// Items per node, newest first.
    items: HashMap<NodeIdx, Vec<Item>>,
    sub_options: HashMap<String, SubOptions>,
    /// RAM last-item cache, single writer per node.
    last_items: HashMap<NodeIdx, Item>,
    next_idx: NodeIdx,
    free_list: Vec<NodeIdx>,
}

impl Tables {
    /// Allocate the next node index, reusing freed ones.
    fn alloc_idx(&mut self) -> NodeIdx {
        if let Some(idx) = self.free_list.pop() {
            return idx;
        }
        self.next_idx += 1;
        self.next_idx
    }

    /// Insert a node; `conflict` when the path exists.
    pub fn create_node(
        &mut self,
        host: Host,
        path: String,
        plugin: String,
        owner: BareJid,
        options: NodeOptions,
    ) -> Result<NodeIdx, XmppError> {
        let key = (host.clone(), path.clone());
        if self.by_path.contains_key(&key) {
            return Err(XmppError::conflict(Some(format!(
                "node {} already exists",
                path
            ))));
        }

        let idx = self.alloc_idx();
        self.by_path.insert(key, idx);
        self.nodes.insert(
            idx,
            Node {
                host,
                path,
                idx,
                plugin,
                owners: vec![owner.clone()],
                options,
            },
        );
        self.states.insert(
            (owner, idx),
            StateRecord {
                affiliation: Affiliation::Owner,
                subscriptions: Vec::new(),
            },
        );
        Ok(idx)
    }

    /// Look up a node by host and path.
    pub fn node_by_path(&self, host: &Host, path: &str) -> Option<&Node> {
        let idx = self.by_path.get(&(host.clone(), path.to_string()))?;
        self.nodes.get(idx)
    }

    /// Look up a node by index.
    pub fn node(&self, idx: NodeIdx) -> Option<&Node> {
        self.nodes.get(&idx)
    }

    /// Mutable node access.
    pub fn node_mut(&mut self, idx: NodeIdx) -> Option<&mut Node> {
        self.nodes.get_mut(&idx)
    }

    /// All nodes of a host.
    pub fn nodes_of_host(&self, host: &Host) -> Vec<&Node> {
        let mut nodes: Vec<&Node> = self.nodes.values().filter(|n| &n.host == host).collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        nodes
    }

    /// Delete a node and cascade its per-node state. Returns the
    /// removed node.
    pub fn remove_node(&mut self, idx: NodeIdx) -> Option<Node> {
        let node = self.nodes.remove(&idx)?;
        self.by_path.remove(&(node.host.clone(), node.path.clone()));

        let entities: Vec<BareJid> = self
            .states
            .keys()
            .filter(|(_, i)| *i == idx)
            .map(|(jid, _)| jid.clone())
            .collect();
        for entity in entities {
            if let Some(record) = self.states.remove(&(entity, idx)) {
                for (_, subid) in record.subscriptions {
                    self.sub_options.remove(&subid);
                }
            }
        }

        self.items.remove(&idx);
        self.last_items.remove(&idx);
        self.free_list.push(idx);
        Some(node)
    }

    /// State record of an entity on a node, if any.
    pub fn state(&self, entity: &BareJid, idx: NodeIdx) -> Option<&StateRecord> {
        self.states.get(&(entity.clone(), idx))
    }

    /// Mutable state record, created on demand.
    pub fn state_mut(&mut self, entity: &BareJid, idx: NodeIdx) -> &mut StateRecord {
        self.states.entry((entity.clone(), idx)).or_default()
    }

    /// Drop a state record when it no longer carries anything.
    pub fn gc_state(&mut self, entity: &BareJid, idx: NodeIdx) {
        let key = (entity.clone(), idx);
        if self.states.get(&key).map(StateRecord::is_empty).unwrap_or(false) {
            self.states.remove(&key);
        }
    }

    /// All `(entity, record)` pairs attached to a node.
    pub fn node_states(&self, idx: NodeIdx) -> Vec<(BareJid, StateRecord)> {
        self.states
            .iter()
            .filter(|((_, i), _)| *i == idx)
            .map(|((jid, _), record)| (jid.clone(), record.clone()))
            .collect()
    }

    /// Subscription options for a subid.
    pub fn sub_options(&self, subid: &str) -> Option<&SubOptions> {
        self.sub_options.get(subid)
    }

    /// Store subscription options.
    pub fn set_sub_options(&mut self, subid: String, options: SubOptions) {
        self.sub_options.insert(subid, options);
    }

    /// Drop subscription options.
    pub fn remove_sub_options(&mut self, subid: &str) {
        self.sub_options.remove(subid);
    }

    /// Store an item (prepended as newest), updating an existing id in
    /// place. Evicts beyond `max_items`, returning the evicted ids
    /// oldest-first.
    pub fn store_item(&mut self, idx: NodeIdx, item: Item, max_items: u32) -> Vec<String> {
        let items = self.items.entry(idx).or_default();

        if let Some(pos) = items.iter().position(|i| i.id == item.id) {
            let mut existing = items.remove(pos);
            existing.payload = item.payload;
            existing.modification = item.modification;
            items.insert(0, existing);
        } else {
            items.insert(0, item);
        }

        let mut evicted = Vec::new();
        while items.len() > max_items as usize {
            if let Some(old) = items.pop() {
                evicted.push(old.id);
            }
        }
        evicted
    }

    /// Items of a node, newest first, optionally capped.
    pub fn get_items(&self, idx: NodeIdx, max: Option<usize>) -> Vec<Item> {
        let items = self.items.get(&idx).cloned().unwrap_or_default();
        match max {
            Some(max) => items.into_iter().take(max).collect(),
            None => items,
        }
    }

    /// One item by id.
    pub fn get_item(&self, idx: NodeIdx, id: &str) -> Option<Item> {
        self.items
            .get(&idx)
            .and_then(|items| items.iter().find(|i| i.id == id))
            .cloned()
    }

    /// Remove one item by id; `true` when it existed.
    pub fn retract_item(&mut self, idx: NodeIdx, id: &str) -> bool {
        let Some(items) = self.items.get_mut(&idx) else {
            return false;
        };
        let before = items.len();
        items.retain(|i| i.id != id);
        if let Some(cached) = self.last_items.get(&idx) {
            if cached.id == id {
                self.last_items.remove(&idx);
            }
        }
        items.len() < before
    }

    /// Drop all items of a node, returning their ids newest-first.
    pub fn purge_items(&mut self, idx: NodeIdx) -> Vec<String> {
        self.last_items.remove(&idx);
        self.items
            .remove(&idx)
            .map(|items| items.into_iter().map(|i| i.id).collect())
            .unwrap_or_default()
    }

    /// Drop all items published by `publisher`, returning their ids.
    pub fn purge_items_of_publisher(&mut self, idx: NodeIdx, publisher: &BareJid) -> Vec<String> {
        let Some(items) = self.items.get_mut(&idx) else {
            return Vec::new();
        };
        let purged: Vec<String> = items
            .iter()
            .filter(|i| &i.modification.1 == publisher)
            .map(|i| i.id.clone())
            .collect();
        items.retain(|i| &i.modification.1 != publisher);
        if let Some(cached) = self.last_items.get(&idx) {
            if purged.contains(&cached.id) {
                self.last_items.remove(&idx);
            }
        }
        purged
    }

    /// Update the last-item cache.
    pub fn cache_last_item(&mut self, idx: NodeIdx, item: Item) {
        self.last_items.insert(idx, item);
    }

    /// Cached last item of a node, falling back to the item store.
    pub fn last_item(&self, idx: NodeIdx) -> Option<Item> {
        self.last_items
            .get(&idx)
            .cloned()
            .or_else(|| self.items.get(&idx).and_then(|items| items.first().cloned()))
    }
}

/// In-memory transactional store over [`Tables`].
#[derive(Default)]
pub struct MemoryNodeStore {
    tables: Mutex<Tables>,
}

impl MemoryNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` atomically: on `Err`, all table mutations are rolled
    /// back.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, XmppError>,
    ) -> Result<T, XmppError> {
        let mut guard = self.tables.lock().expect("store lock poisoned");
        let snapshot = guard.clone();
        match f(&mut guard) {
            Ok(value) => Ok(value),
            Err(e) => {
                *guard = snapshot;
                Err(e)
            }
        }
    }

    /// Run `f` without rollback protection. For single-operation reads
    /// and writes on plugins that opt in.
    pub fn sync_dirty<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, XmppError>,
    ) -> Result<T, XmppError> {
        let mut guard = self.tables.lock().expect("store lock poisoned");
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> BareJid {
        s.parse().expect("valid jid")
    }

    fn host() -> Host {
        Host::Domain("pubsub.a.example".to_string())
    }

    fn item(id: &str, publisher: &str) -> Item {
        let now = Utc::now();
        Item {
            id: id.to_string(),
            payload: Vec::new(),
            creation: (now, jid(publisher)),
            modification: (now, jid(publisher)),
        }
    }

    #[test]
    fn test_node_indexes_are_unique_and_reused() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");

        let idx1 = tables
            .create_node(host(), "/one".into(), "flat".into(), owner.clone(), NodeOptions::default())
            .unwrap();
        let idx2 = tables
            .create_node(host(), "/two".into(), "flat".into(), owner.clone(), NodeOptions::default())
            .unwrap();
        assert_eq!(idx1, 1);
        assert_eq!(idx2, 2);

        tables.remove_node(idx1);
        let idx3 = tables
            .create_node(host(), "/three".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap();
        // Freed index is reclaimed.
        assert_eq!(idx3, idx1);
    }

    #[test]
    fn test_create_duplicate_path_conflicts() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");

        tables
            .create_node(host(), "/dup".into(), "flat".into(), owner.clone(), NodeOptions::default())
            .unwrap();
        let err = tables
            .create_node(host(), "/dup".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            XmppError::Stanza {
                condition: crate::error::StanzaErrorCondition::Conflict,
                ..
            }
        ));
    }

    #[test]
    fn test_creation_grants_owner_affiliation() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner.clone(), NodeOptions::default())
            .unwrap();

        assert_eq!(
            tables.state(&owner, idx).unwrap().affiliation,
            Affiliation::Owner
        );
    }

    #[test]
    fn test_item_eviction_returns_oldest_ids() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap();

        assert!(tables.store_item(idx, item("i1", "p@a.example"), 2).is_empty());
        assert!(tables.store_item(idx, item("i2", "p@a.example"), 2).is_empty());
        let evicted = tables.store_item(idx, item("i3", "p@a.example"), 2);
        assert_eq!(evicted, vec!["i1".to_string()]);

        let ids: Vec<String> = tables
            .get_items(idx, None)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["i3".to_string(), "i2".to_string()]);
    }

    #[test]
    fn test_republish_updates_in_place() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap();

        tables.store_item(idx, item("i1", "p@a.example"), 10);
        tables.store_item(idx, item("i2", "p@a.example"), 10);
        // Republishing i1 moves it to the front without duplication.
        tables.store_item(idx, item("i1", "q@a.example"), 10);

        let items = tables.get_items(idx, None);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "i1");
        assert_eq!(items[0].modification.1, jid("q@a.example"));
        // Creation stamp survives the republish.
        assert_eq!(items[0].creation.1, jid("p@a.example"));
    }

    #[test]
    fn test_purge_by_publisher() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap();

        tables.store_item(idx, item("i1", "gone@a.example"), 10);
        tables.store_item(idx, item("i2", "stays@a.example"), 10);
        tables.store_item(idx, item("i3", "gone@a.example"), 10);

        let purged = tables.purge_items_of_publisher(idx, &jid("gone@a.example"));
        assert_eq!(purged.len(), 2);
        assert!(purged.contains(&"i1".to_string()));
        assert!(purged.contains(&"i3".to_string()));

        let remaining: Vec<String> = tables
            .get_items(idx, None)
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(remaining, vec!["i2".to_string()]);
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let sub = jid("sub@b.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner.clone(), NodeOptions::default())
            .unwrap();

        tables
            .state_mut(&sub, idx)
            .subscriptions
            .push((SubState::Subscribed, "sid-1".to_string()));
        tables.set_sub_options("sid-1".to_string(), SubOptions::default());
        tables.store_item(idx, item("i1", "owner@a.example"), 10);

        tables.remove_node(idx);

        assert!(tables.node(idx).is_none());
        assert!(tables.node_by_path(&host(), "/n").is_none());
        assert!(tables.state(&sub, idx).is_none());
        assert!(tables.sub_options("sid-1").is_none());
        assert!(tables.get_items(idx, None).is_empty());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = MemoryNodeStore::new();
        let owner = jid("owner@a.example");

        let result: Result<(), XmppError> = store.transaction(|tables| {
            tables.create_node(
                host(),
                "/n".into(),
                "flat".into(),
                owner.clone(),
                NodeOptions::default(),
            )?;
            Err(XmppError::internal("boom"))
        });
        assert!(result.is_err());

        store
            .sync_dirty(|tables| {
                assert!(tables.node_by_path(&host(), "/n").is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_last_item_cache_and_fallback() {
        let mut tables = Tables::default();
        let owner = jid("owner@a.example");
        let idx = tables
            .create_node(host(), "/n".into(), "flat".into(), owner, NodeOptions::default())
            .unwrap();

        tables.store_item(idx, item("i1", "p@a.example"), 10);
        assert_eq!(tables.last_item(idx).unwrap().id, "i1");

        tables.cache_last_item(idx, item("cached", "p@a.example"));
        assert_eq!(tables.last_item(idx).unwrap().id, "cached");
    }
}
