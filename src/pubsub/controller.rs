//! The pub/sub request controller.
//!
//! One [`PubSubService`] instance owns one service host (a domain, or
//! a bare JID for PEP). Every verb checks permissions, mutates the
//! node store inside a transaction, and on success hands the resulting
//! event to the broadcaster. A request returns to the caller before
//! its broadcast is delivered; ordering across distinct publishes is
//! not a contract.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};
use uuid::Uuid;
use xmpp_parsers::iq::Iq;

use crate::config::PubSubConfigHandle;
use crate::parser::element_to_string;
use crate::presence::PresenceDirectory;
use crate::pubsub::broadcaster::{
    broadcast, compute_recipients, EventClass, EventSender, Recipient,
};
use crate::pubsub::node::{
    AccessModel, NodeOptions, PublishModel, SendLastPublishedItem, SubOptions,
};
use crate::pubsub::plugin::{plugin, NodePlugin, StorageMode};
use crate::pubsub::stanzas::{
    self, build_affiliations_result, build_authorization_request, build_configure_result,
    build_create_result, build_error_iq, build_items_result, build_publish_result,
    build_subscription_result, build_subscriptions_result, build_success, event_create,
    event_delete, event_items, event_purge, event_retract, event_subscription, parse_pubsub_iq,
    AuthorizationDecision, EventItem, PubSubRequest,
};
use crate::pubsub::store::{
    Affiliation, Host, Item, MemoryNodeStore, Node, NodeIdx, SubState, Tables,
};
use crate::router::RouterHandle;
use crate::XmppError;

/// Outcome of a subscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// Resulting state.
    pub state: SubState,
    /// Assigned subscription id.
    pub subid: String,
}

/// Outcome of a publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// The stored (possibly generated) item id.
    pub item_id: String,
    /// Ids evicted by the retention bound, oldest first.
    pub evicted: Vec<String>,
}

/// Controller for one pub/sub service host.
pub struct PubSubService<P: PresenceDirectory> {
    host: Host,
    service_jid: String,
    config: PubSubConfigHandle,
    store: Arc<MemoryNodeStore>,
    router: RouterHandle,
    presence: Arc<P>,
    admins: HashSet<BareJid>,
    /// PEP last-item sends already made, per available resource.
    pep_sent: Mutex<HashSet<(String, NodeIdx)>>,
}

impl<P: PresenceDirectory> PubSubService<P> {
    /// Create a service for `host`.
    pub fn new(
        host: Host,
        config: PubSubConfigHandle,
        store: Arc<MemoryNodeStore>,
        router: RouterHandle,
        presence: Arc<P>,
    ) -> Self {
        let service_jid = host.jid_str();
        Self {
            host,
            service_jid,
            config,
            store,
            router,
            presence,
            admins: HashSet::new(),
            pep_sent: Mutex::new(HashSet::new()),
        }
    }

    /// Grant service-admin rights to these JIDs.
    pub fn with_admins(mut self, admins: impl IntoIterator<Item = BareJid>) -> Self {
        self.admins = admins.into_iter().collect();
        self
    }

    /// The host this service answers for.
    pub fn host(&self) -> &Host {
        &self.host
    }

    fn is_admin(&self, jid: &BareJid) -> bool {
        self.admins.contains(jid)
    }

    fn default_plugin(&self) -> &'static dyn NodePlugin {
        if self.host.is_pep() {
            return plugin("pep").expect("pep plugin registered");
        }
        let config = self.config.load();
        config
            .plugins
            .first()
            .and_then(|name| plugin(name))
            .unwrap_or_else(|| plugin("flat").expect("flat plugin registered"))
    }

    fn node_plugin(&self, node: &Node) -> &'static dyn NodePlugin {
        plugin(&node.plugin).unwrap_or_else(|| self.default_plugin())
    }

    fn require_feature(
        &self,
        plugin: &dyn NodePlugin,
        feature: &'static str,
    ) -> Result<(), XmppError> {
        if plugin.has_feature(feature) {
            Ok(())
        } else {
            Err(XmppError::unsupported(feature))
        }
    }

    fn node_or_not_found(tables: &Tables, host: &Host, path: &str) -> Result<Node, XmppError> {
        tables
            .node_by_path(host, path)
            .cloned()
            .ok_or_else(|| XmppError::item_not_found(Some(format!("node {} does not exist", path))))
    }

    // -----------------------------------------------------------------
    // Node lifecycle
    // -----------------------------------------------------------------

    /// Create a node. An empty path requests an instant node with a
    /// generated path.
    #[instrument(skip(self, config_fields), fields(host = %self.host))]
    pub fn create_node(
        &self,
        path: &str,
        owner: &BareJid,
        plugin_name: Option<&str>,
        config_fields: &[(String, Vec<String>)],
    ) -> Result<String, XmppError> {
        let config = self.config.load();
        let node_plugin = match plugin_name {
            Some(name) => plugin(name).ok_or_else(|| {
                XmppError::not_acceptable(Some(format!("unknown node type {}", name)))
            })?,
            None => self.default_plugin(),
        };

        if !self.host.is_pep() && !config.plugins.iter().any(|p| p.as_str() == node_plugin.name()) {
            return Err(XmppError::not_acceptable(Some(format!(
                "node type {} is not enabled",
                node_plugin.name()
            ))));
        }

        if path.is_empty() {
            self.require_feature(node_plugin, "instant-nodes")?;
            let generated = Uuid::new_v4().to_string();
            return self.create_node(&generated, owner, Some(node_plugin.name()), config_fields);
        }

        let mut options = node_plugin.default_options(&config);
        options.apply_form(config_fields)?;

        let host = self.host.clone();
        let is_admin = self.is_admin(owner);
        let policy = config.access_createnode;
        let path_owned = path.to_string();
        let owner_owned = owner.clone();
        let plugin_name = node_plugin.name().to_string();

        let created = self.store.transaction(move |tables| {
            let parent = match options.collection.first() {
                Some(parent_path) => Some(
                    tables
                        .node_by_path(&host, parent_path)
                        .cloned()
                        .ok_or_else(|| {
                            XmppError::item_not_found(Some(format!(
                                "parent node {} does not exist",
                                parent_path
                            )))
                        })?,
                ),
                None => None,
            };

            if !node_plugin.create_permitted(
                &host,
                parent.as_ref(),
                &owner_owned,
                policy,
                is_admin,
            ) {
                return Err(XmppError::forbidden(Some(
                    "node creation not permitted".to_string(),
                )));
            }

            let idx = tables.create_node(
                host.clone(),
                path_owned.clone(),
                plugin_name,
                owner_owned.clone(),
                options,
            )?;
            Ok(tables.node(idx).cloned().expect("node just created"))
        })?;

        self.broadcast_structural(&created, event_create(&created.path), None);
        debug!(node = %created.path, idx = created.idx, "Node created");
        Ok(created.path)
    }

    /// Delete a node and every descendant reachable through the
    /// collection tree.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn delete_node(&self, path: &str, actor: &BareJid) -> Result<(), XmppError> {
        let host = self.host.clone();
        let actor_owned = actor.clone();
        let is_admin = self.is_admin(actor);
        let path_owned = path.to_string();
        let presence = Arc::clone(&self.presence);

        let removed = self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            if !is_admin && !node.owners.contains(&actor_owned) {
                return Err(XmppError::forbidden(Some(
                    "owner affiliation required".to_string(),
                )));
            }

            // Gather the subtree before tearing anything down, so the
            // delete broadcasts still see the subscriber tables.
            let mut doomed = vec![node.clone()];
            let mut frontier = vec![node.path.clone()];
            while let Some(parent_path) = frontier.pop() {
                let children: Vec<Node> = tables
                    .nodes_of_host(&host)
                    .into_iter()
                    .filter(|n| n.options.collection.contains(&parent_path))
                    .filter(|n| !doomed.iter().any(|d| d.idx == n.idx))
                    .cloned()
                    .collect();
                for child in children {
                    frontier.push(child.path.clone());
                    doomed.push(child);
                }
            }

            let mut removed = Vec::new();
            for node in &doomed {
                let recipients = compute_recipients(tables, node, EventClass::Nodes, &*presence);
                removed.push((node.clone(), recipients));
            }
            for (node, _) in &removed {
                tables.remove_node(node.idx);
            }
            Ok(removed)
        })?;

        for (node, recipients) in removed {
            if node.options.notify_delete {
                self.broadcast_for(&node, &recipients, event_delete(&node.path), None);
            }
        }
        Ok(())
    }

    /// Remove every item of a node.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn purge_node(&self, path: &str, actor: &BareJid) -> Result<(), XmppError> {
        let host = self.host.clone();
        let actor_owned = actor.clone();
        let is_admin = self.is_admin(actor);
        let path_owned = path.to_string();

        let (node, recipients) = {
            let presence = Arc::clone(&self.presence);
            self.store.transaction(move |tables| {
                let node = Self::node_or_not_found(tables, &host, &path_owned)?;
                let node_plugin = plugin(&node.plugin)
                    .ok_or_else(|| XmppError::internal_server_error(None))?;
                if !node_plugin.has_feature("purge-nodes") {
                    return Err(XmppError::unsupported("purge-nodes"));
                }
                if !node.options.persist_items {
                    return Err(XmppError::unsupported("persistent-items"));
                }
                if !is_admin && !node.owners.contains(&actor_owned) {
                    return Err(XmppError::forbidden(Some(
                        "owner affiliation required".to_string(),
                    )));
                }
                tables.purge_items(node.idx);
                let recipients =
                    compute_recipients(tables, &node, EventClass::Items, &*presence);
                Ok((node, recipients))
            })?
        };

        if node.options.deliver_notifications {
            self.broadcast_for(&node, &recipients, event_purge(&node.path), None);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    /// Subscribe `jid` to a node. Returns the resulting state; pending
    /// subscriptions trigger an authorization form to each owner.
    #[instrument(skip(self, options_fields), fields(host = %self.host))]
    pub fn subscribe_node(
        &self,
        path: &str,
        requester: &Jid,
        jid: &str,
        options_fields: Option<&[(String, Vec<String>)]>,
    ) -> Result<SubscribeOutcome, XmppError> {
        let requester_bare = requester.to_bare();
        let target: BareJid = jid
            .parse::<Jid>()
            .map(|j| j.to_bare())
            .map_err(|_| XmppError::bad_request(Some("malformed subscriber JID".to_string())))?;
        if target != requester_bare {
            return Err(XmppError::bad_request(Some(
                "subscriber JID must match the requester".to_string(),
            )));
        }

        let host = self.host.clone();
        let path_owned = path.to_string();
        let presence = Arc::clone(&self.presence);
        let requester_owned = requester_bare.clone();

        let mut sub_options = SubOptions::default();

        let (node, outcome) = self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            let node_plugin =
                plugin(&node.plugin).ok_or_else(|| XmppError::internal_server_error(None))?;

            if !node_plugin.has_feature("subscribe") {
                return Err(XmppError::unsupported("subscribe"));
            }
            if !node.options.subscribe {
                return Err(XmppError::not_allowed(Some(
                    "subscriptions are disabled on this node".to_string(),
                )));
            }
            if options_fields.is_some() {
                if !node_plugin.has_feature("subscription-options") {
                    return Err(XmppError::unsupported("subscription-options"));
                }
            }
            if let Some(fields) = options_fields {
                sub_options.apply_form(fields)?;
            }

            let record = tables.state(&requester_owned, node.idx).cloned().unwrap_or_default();
            if record.affiliation == Affiliation::Outcast {
                return Err(XmppError::forbidden(None));
            }

            // One live subscription per entity unless the plugin
            // allows more; re-subscribing returns the existing one.
            if !node_plugin.multi_subscribe() {
                if let Some((state, subid)) = record.subscriptions.first() {
                    return Ok((
                        node,
                        SubscribeOutcome {
                            state: *state,
                            subid: subid.clone(),
                        },
                    ));
                }
            }

            let state = match gate_subscription(
                &node,
                &record.affiliation,
                &requester_owned,
                &*presence,
            )? {
                GateOutcome::Allowed => SubState::Subscribed,
                GateOutcome::Pending => SubState::Pending,
            };

            let subid = Uuid::new_v4().to_string();
            tables
                .state_mut(&requester_owned, node.idx)
                .subscriptions
                .push((state, subid.clone()));
            tables.set_sub_options(subid.clone(), sub_options.clone());

            Ok((node, SubscribeOutcome { state, subid }))
        })?;

        match outcome.state {
            SubState::Pending => {
                for owner in &node.owners {
                    let form = build_authorization_request(
                        &self.service_jid,
                        &owner.to_string(),
                        &node.path,
                        &requester_bare.to_string(),
                    );
                    let _ = self.router.route(form);
                }
            }
            SubState::Subscribed => {
                if matches!(
                    node.options.send_last_published_item,
                    SendLastPublishedItem::OnSub | SendLastPublishedItem::OnSubAndPresence
                ) {
                    self.push_last_item(&node, &requester_bare.to_string(), &outcome.subid);
                }
            }
            SubState::Unconfigured => {}
        }

        if node.options.notify_sub {
            let recipients = self.recipients_of_snapshot(&node, EventClass::Nodes);
            let compat = self.config.load().compat_misspelled_sub_attr;
            self.broadcast_for(
                &node,
                &recipients,
                event_subscription(
                    &node.path,
                    &requester_bare.to_string(),
                    outcome.state.as_str(),
                    Some(&outcome.subid),
                    compat,
                ),
                None,
            );
        }

        Ok(outcome)
    }

    /// Remove a subscription.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn unsubscribe_node(
        &self,
        path: &str,
        requester: &Jid,
        jid: &str,
        subid: Option<&str>,
    ) -> Result<(), XmppError> {
        let requester_bare = requester.to_bare();
        let target: BareJid = jid
            .parse::<Jid>()
            .map(|j| j.to_bare())
            .map_err(|_| XmppError::bad_request(Some("malformed subscriber JID".to_string())))?;
        if target != requester_bare {
            return Err(XmppError::forbidden(None));
        }

        let host = self.host.clone();
        let path_owned = path.to_string();
        let subid_owned = subid.map(String::from);

        self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            let record = tables.state_mut(&target, node.idx);

            let before = record.subscriptions.len();
            let dropped: Vec<String> = match &subid_owned {
                Some(subid) => {
                    record.subscriptions.retain(|(_, s)| s != subid);
                    vec![subid.clone()]
                }
                None => {
                    if before > 1 {
                        return Err(XmppError::bad_request(Some(
                            "subid required with multiple subscriptions".to_string(),
                        )));
                    }
                    record.subscriptions.drain(..).map(|(_, s)| s).collect()
                }
            };
            if record.subscriptions.len() == before {
                return Err(XmppError::item_not_found(Some(
                    "no such subscription".to_string(),
                )));
            }
            for subid in dropped {
                tables.remove_sub_options(&subid);
            }
            tables.gc_state(&target, node.idx);
            Ok(())
        })
    }

    /// Apply an owner's decision on a pending subscription.
    #[instrument(skip(self, decision), fields(host = %self.host))]
    pub fn handle_authorization_decision(
        &self,
        owner: &BareJid,
        decision: &AuthorizationDecision,
    ) -> Result<(), XmppError> {
        let subscriber: BareJid = decision
            .subscriber
            .parse()
            .map_err(|_| XmppError::bad_request(Some("malformed subscriber JID".to_string())))?;

        let host = self.host.clone();
        let owner_owned = owner.clone();
        let path = decision.node.clone();
        let allow = decision.allow;
        let subscriber_owned = subscriber.clone();

        let (node, state, subid) = self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path)?;
            if !node.owners.contains(&owner_owned) {
                return Err(XmppError::forbidden(Some(
                    "owner affiliation required".to_string(),
                )));
            }

            let record = tables.state_mut(&subscriber_owned, node.idx);
            let Some(position) = record
                .subscriptions
                .iter()
                .position(|(state, _)| *state == SubState::Pending)
            else {
                return Err(XmppError::item_not_found(Some(
                    "no pending subscription".to_string(),
                )));
            };

            if allow {
                let subid = record.subscriptions[position].1.clone();
                record.subscriptions[position].0 = SubState::Subscribed;
                Ok((node, SubState::Subscribed, Some(subid)))
            } else {
                let (_, subid) = record.subscriptions.remove(position);
                tables.remove_sub_options(&subid);
                tables.gc_state(&subscriber_owned, node.idx);
                Ok((node, SubState::Subscribed, None))
            }
        })?;

        // Tell the subject where it ended up.
        let compat = self.config.load().compat_misspelled_sub_attr;
        let (state_str, subid_ref) = match &subid {
            Some(subid) => (state.as_str(), Some(subid.as_str())),
            None => ("none", None),
        };
        self.notify_subject(
            &node,
            &subscriber.to_string(),
            state_str,
            subid_ref,
            compat,
        );

        if let Some(subid) = subid {
            if matches!(
                node.options.send_last_published_item,
                SendLastPublishedItem::OnSub | SendLastPublishedItem::OnSubAndPresence
            ) {
                self.push_last_item(&node, &subscriber.to_string(), &subid);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------

    /// Publish an item, auto-creating the node when the type supports
    /// it.
    #[instrument(skip(self, payload), fields(host = %self.host))]
    pub fn publish_item(
        &self,
        path: &str,
        publisher: &Jid,
        item_id: Option<&str>,
        payload: Vec<Element>,
    ) -> Result<PublishOutcome, XmppError> {
        let config = self.config.load();
        let publisher_bare = publisher.to_bare();

        if self.host.is_pep()
            && config.ignore_pep_from_offline
            && self.presence.available_resources(&publisher_bare).is_empty()
        {
            return Err(XmppError::not_allowed(Some(
                "PEP publish from an offline resource".to_string(),
            )));
        }

        let exists = self.store.sync_dirty(|tables| {
            Ok(tables.node_by_path(&self.host, path).is_some())
        })?;
        if !exists {
            let node_plugin = self.pep_plugin_for(path, &config);
            self.require_feature(node_plugin, "auto-create")?;
            self.create_node(path, &publisher_bare, Some(node_plugin.name()), &[])?;
        }

        let id = item_id
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let host = self.host.clone();
        let path_owned = path.to_string();
        let presence = Arc::clone(&self.presence);
        let publisher_owned = publisher_bare.clone();
        let id_owned = id.clone();
        let cache_last = config.last_item_cache;

        let write = move |tables: &mut Tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;

            let record = tables
                .state(&publisher_owned, node.idx)
                .cloned()
                .unwrap_or_default();
            check_publish_permission(&node, &record.affiliation, &record)?;
            check_payload(&node.options, &payload)?;

            let now = chrono::Utc::now();
            let item = Item {
                id: id_owned.clone(),
                payload: payload.clone(),
                creation: (now, publisher_owned.clone()),
                modification: (now, publisher_owned.clone()),
            };

            let evicted = if node.options.persist_items {
                tables.store_item(node.idx, item.clone(), node.options.max_items)
            } else {
                Vec::new()
            };

            if cache_last
                || node.options.send_last_published_item != SendLastPublishedItem::Never
            {
                tables.cache_last_item(node.idx, item.clone());
            }

            let recipients = compute_recipients(tables, &node, EventClass::Items, &*presence);
            Ok((node, item, evicted, recipients))
        };

        let node_plugin = self
            .store
            .sync_dirty(|tables| {
                let node = Self::node_or_not_found(tables, &self.host, path)?;
                Ok(self.node_plugin(&node))
            })?;

        let (node, item, evicted, recipients) = match node_plugin.storage_mode() {
            StorageMode::Transaction => self.store.transaction(write)?,
            StorageMode::SyncDirty => self.store.sync_dirty(write)?,
        };

        if node.options.deliver_notifications {
            let event_payload = event_items(
                &node.path,
                &[EventItem {
                    id: Some(item.id.clone()),
                    payload: if node.options.deliver_payloads {
                        item.payload.clone()
                    } else {
                        Vec::new()
                    },
                    publisher: self
                        .host
                        .is_pep()
                        .then(|| publisher_bare.to_string()),
                }],
            );
            self.broadcast_for(&node, &recipients, event_payload, Some(publisher));

            if !evicted.is_empty() && node.options.notify_retract {
                self.broadcast_for(
                    &node,
                    &recipients,
                    event_retract(&node.path, &evicted),
                    Some(publisher),
                );
            }
        }

        Ok(PublishOutcome {
            item_id: item.id,
            evicted,
        })
    }

    /// Remove one item.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn retract_item(
        &self,
        path: &str,
        publisher: &Jid,
        item_id: &str,
        force_notify: bool,
    ) -> Result<(), XmppError> {
        let publisher_bare = publisher.to_bare();
        let host = self.host.clone();
        let path_owned = path.to_string();
        let item_owned = item_id.to_string();
        let presence = Arc::clone(&self.presence);

        let (node, recipients) = self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            let node_plugin =
                plugin(&node.plugin).ok_or_else(|| XmppError::internal_server_error(None))?;

            if !node_plugin.has_feature("persistent-items") || !node.options.persist_items {
                return Err(XmppError::unsupported("persistent-items"));
            }
            if !node_plugin.has_feature("delete-items") {
                return Err(XmppError::unsupported("delete-items"));
            }

            let item = tables
                .get_item(node.idx, &item_owned)
                .ok_or_else(|| XmppError::item_not_found(None))?;

            let record = tables
                .state(&publisher_bare, node.idx)
                .cloned()
                .unwrap_or_default();
            let privileged = matches!(
                record.affiliation,
                Affiliation::Owner | Affiliation::Publisher
            );
            if !privileged && item.modification.1 != publisher_bare {
                return Err(XmppError::forbidden(None));
            }

            tables.retract_item(node.idx, &item_owned);
            let recipients = compute_recipients(tables, &node, EventClass::Items, &*presence);
            Ok((node, recipients))
        })?;

        if force_notify || node.options.notify_retract {
            self.broadcast_for(
                &node,
                &recipients,
                event_retract(&node.path, &[item_id.to_string()]),
                None,
            );
        }
        Ok(())
    }

    /// Retrieve items, newest first, honouring the access model.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn get_items(
        &self,
        path: &str,
        requester: &Jid,
        max: Option<u32>,
        item_ids: &[String],
    ) -> Result<Vec<Item>, XmppError> {
        let requester_bare = requester.to_bare();

        self.store.sync_dirty(|tables| {
            let node = Self::node_or_not_found(tables, &self.host, path)?;

            let record = tables
                .state(&requester_bare, node.idx)
                .cloned()
                .unwrap_or_default();
            check_retrieve_access(&node, &record, &requester_bare, &*self.presence)?;

            if !item_ids.is_empty() {
                let mut found = Vec::new();
                for id in item_ids {
                    found.push(
                        tables
                            .get_item(node.idx, id)
                            .ok_or_else(|| XmppError::item_not_found(None))?,
                    );
                }
                return Ok(found);
            }

            let cap = max
                .map(|m| m.min(node.options.max_items))
                .unwrap_or(node.options.max_items) as usize;
            Ok(tables.get_items(node.idx, Some(cap)))
        })
    }

    /// Retrieve one item by id.
    pub fn get_item(&self, path: &str, requester: &Jid, item_id: &str) -> Result<Item, XmppError> {
        let items = self.get_items(path, requester, None, &[item_id.to_string()])?;
        items.into_iter().next().ok_or_else(|| XmppError::item_not_found(None))
    }

    // -----------------------------------------------------------------
    // Affiliations and subscription management
    // -----------------------------------------------------------------

    /// The requester's affiliations across this host.
    pub fn get_affiliations(&self, requester: &BareJid) -> Result<Vec<(String, Affiliation)>, XmppError> {
        self.store.sync_dirty(|tables| {
            let mut result = Vec::new();
            for node in tables.nodes_of_host(&self.host) {
                if let Some(record) = tables.state(requester, node.idx) {
                    if record.affiliation != Affiliation::None {
                        result.push((node.path.clone(), record.affiliation));
                    }
                }
            }
            Ok(result)
        })
    }

    /// All affiliations on a node (owner view).
    pub fn get_node_affiliations(
        &self,
        path: &str,
        actor: &BareJid,
    ) -> Result<Vec<(BareJid, Affiliation)>, XmppError> {
        let is_admin = self.is_admin(actor);
        self.store.sync_dirty(|tables| {
            let node = Self::node_or_not_found(tables, &self.host, path)?;
            if !is_admin && !node.owners.contains(actor) {
                return Err(XmppError::forbidden(None));
            }
            Ok(tables
                .node_states(node.idx)
                .into_iter()
                .filter(|(_, record)| record.affiliation != Affiliation::None)
                .map(|(jid, record)| (jid, record.affiliation))
                .collect())
        })
    }

    /// Owner-only affiliation changes. Setting `owner` extends the
    /// node owner set; setting `none` removes the entry but never the
    /// last owner.
    #[instrument(skip(self, entries), fields(host = %self.host))]
    pub fn set_affiliations(
        &self,
        path: &str,
        actor: &BareJid,
        entries: &[(String, String)],
    ) -> Result<(), XmppError> {
        let host = self.host.clone();
        let actor_owned = actor.clone();
        let is_admin = self.is_admin(actor);
        let path_owned = path.to_string();
        let entries_owned = entries.to_vec();

        self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            if !is_admin && !node.owners.contains(&actor_owned) {
                return Err(XmppError::forbidden(None));
            }

            for (jid_str, affiliation_str) in &entries_owned {
                let jid: BareJid = jid_str.parse().map_err(|_| {
                    XmppError::bad_request(Some(format!("malformed JID {}", jid_str)))
                })?;
                let affiliation = Affiliation::parse(affiliation_str).ok_or_else(|| {
                    XmppError::bad_request(Some(format!(
                        "invalid affiliation {}",
                        affiliation_str
                    )))
                })?;

                let node_ref = tables.node_mut(node.idx).expect("node exists");
                match affiliation {
                    Affiliation::Owner => {
                        if !node_ref.owners.contains(&jid) {
                            node_ref.owners.push(jid.clone());
                        }
                    }
                    // Any other affiliation takes the entity out of the
                    // owner set; a node must always keep one owner, so
                    // demotion of the sole owner is refused like removal.
                    _ => {
                        if node_ref.owners.len() == 1 && node_ref.owners[0] == jid {
                            return Err(XmppError::not_acceptable(Some(
                                "cannot remove the last owner".to_string(),
                            )));
                        }
                        node_ref.owners.retain(|o| o != &jid);
                    }
                }

                tables.state_mut(&jid, node.idx).affiliation = affiliation;
                tables.gc_state(&jid, node.idx);
            }
            Ok(())
        })
    }

    /// The requester's subscriptions across this host.
    pub fn get_subscriptions(
        &self,
        requester: &BareJid,
    ) -> Result<Vec<(String, SubState, String)>, XmppError> {
        self.store.sync_dirty(|tables| {
            let mut result = Vec::new();
            for node in tables.nodes_of_host(&self.host) {
                if let Some(record) = tables.state(requester, node.idx) {
                    for (state, subid) in &record.subscriptions {
                        result.push((node.path.clone(), *state, subid.clone()));
                    }
                }
            }
            Ok(result)
        })
    }

    /// All subscriptions on a node (owner view).
    pub fn get_node_subscriptions(
        &self,
        path: &str,
        actor: &BareJid,
    ) -> Result<Vec<(BareJid, SubState, String)>, XmppError> {
        let is_admin = self.is_admin(actor);
        self.store.sync_dirty(|tables| {
            let node = Self::node_or_not_found(tables, &self.host, path)?;
            if !is_admin && !node.owners.contains(actor) {
                return Err(XmppError::forbidden(None));
            }
            let mut result = Vec::new();
            for (jid, record) in tables.node_states(node.idx) {
                for (state, subid) in record.subscriptions {
                    result.push((jid.clone(), state, subid));
                }
            }
            Ok(result)
        })
    }

    /// Owner-only subscription-state changes. Entries are applied in
    /// order and each commits on its own; the first failing entry
    /// stops the batch with `not-acceptable`, but entries already
    /// applied stay applied and each notifies its subject. Callers
    /// that need all-or-nothing submit entries one at a time.
    #[instrument(skip(self, entries), fields(host = %self.host))]
    pub fn set_subscriptions(
        &self,
        path: &str,
        actor: &BareJid,
        entries: &[(String, String, Option<String>)],
    ) -> Result<(), XmppError> {
        let is_admin = self.is_admin(actor);
        let node = self.store.sync_dirty(|tables| {
            let node = Self::node_or_not_found(tables, &self.host, path)?;
            if !is_admin && !node.owners.contains(actor) {
                return Err(XmppError::forbidden(None));
            }
            Ok(node)
        })?;

        let compat = self.config.load().compat_misspelled_sub_attr;

        for (jid_str, state_str, subid) in entries {
            let applied = self.store.sync_dirty(|tables| {
                let jid: BareJid = jid_str.parse().map_err(|_| {
                    XmppError::not_acceptable(Some(format!("malformed JID {}", jid_str)))
                })?;
                let new_state = match state_str.as_str() {
                    "subscribed" => Some(SubState::Subscribed),
                    "pending" => Some(SubState::Pending),
                    "none" => None,
                    _ => {
                        return Err(XmppError::not_acceptable(Some(format!(
                            "invalid subscription state {}",
                            state_str
                        ))))
                    }
                };

                let record = tables.state_mut(&jid, node.idx);
                match new_state {
                    Some(state) => {
                        let target = match subid {
                            Some(subid) => record
                                .subscriptions
                                .iter_mut()
                                .find(|(_, s)| s == subid),
                            None => record.subscriptions.first_mut(),
                        };
                        match target {
                            Some(entry) => entry.0 = state,
                            None => {
                                let subid =
                                    subid.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                                record.subscriptions.push((state, subid.clone()));
                                tables.set_sub_options(subid, SubOptions::default());
                            }
                        }
                        let subid = match subid {
                            Some(s) => s.clone(),
                            None => tables
                                .state(&jid, node.idx)
                                .and_then(|r| r.subscriptions.first().map(|(_, s)| s.clone()))
                                .unwrap_or_default(),
                        };
                        Ok((jid, state.as_str(), subid))
                    }
                    None => {
                        let dropped: Vec<String> = match subid {
                            Some(subid) => {
                                record.subscriptions.retain(|(_, s)| s != subid);
                                vec![subid.clone()]
                            }
                            None => record.subscriptions.drain(..).map(|(_, s)| s).collect(),
                        };
                        for subid in dropped {
                            tables.remove_sub_options(&subid);
                        }
                        tables.gc_state(&jid, node.idx);
                        Ok((jid, "none", String::new()))
                    }
                }
            })?;

            let (jid, state, subid) = applied;
            let subid_ref = (!subid.is_empty()).then_some(subid.as_str());
            self.notify_subject(&node, &jid.to_string(), state, subid_ref, compat);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------

    /// Current configuration form of a node (owner view).
    pub fn get_node_configuration(
        &self,
        path: &str,
        actor: &BareJid,
    ) -> Result<Vec<(String, Vec<String>)>, XmppError> {
        let is_admin = self.is_admin(actor);
        self.store.sync_dirty(|tables| {
            let node = Self::node_or_not_found(tables, &self.host, path)?;
            if !is_admin && !node.owners.contains(actor) {
                return Err(XmppError::forbidden(None));
            }
            Ok(node.options.to_form())
        })
    }

    /// Owner-only reconfiguration. Unknown fields are ignored; a
    /// successful change broadcasts the node configuration when
    /// `notify_config` is set.
    #[instrument(skip(self, fields), fields(host = %self.host))]
    pub fn configure_node(
        &self,
        path: &str,
        actor: &BareJid,
        fields: &[(String, Vec<String>)],
    ) -> Result<(), XmppError> {
        let host = self.host.clone();
        let actor_owned = actor.clone();
        let is_admin = self.is_admin(actor);
        let path_owned = path.to_string();
        let fields_owned = fields.to_vec();
        let presence = Arc::clone(&self.presence);

        let (node, recipients) = self.store.transaction(move |tables| {
            let node = Self::node_or_not_found(tables, &host, &path_owned)?;
            if !is_admin && !node.owners.contains(&actor_owned) {
                return Err(XmppError::forbidden(None));
            }

            let mut options = node.options.clone();
            options.apply_form(&fields_owned)?;
            tables.node_mut(node.idx).expect("node exists").options = options;

            let node = tables.node(node.idx).cloned().expect("node exists");
            let recipients = compute_recipients(tables, &node, EventClass::Nodes, &*presence);
            Ok((node, recipients))
        })?;

        if node.options.notify_config {
            let payload =
                stanzas::event_configuration(&node.path, Some(&node.options.to_form()));
            self.broadcast_for(&node, &recipients, payload, None);
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // IQ dispatch
    // -----------------------------------------------------------------

    /// Handle a pub/sub IQ addressed to this service, producing the
    /// response IQ. Errors are mapped onto error replies.
    pub fn handle_iq(&self, iq: &Iq) -> Iq {
        match self.dispatch_iq(iq) {
            Ok(reply) => reply,
            Err(e) => build_error_iq(iq, &e),
        }
    }

    fn dispatch_iq(&self, iq: &Iq) -> Result<Iq, XmppError> {
        let from = iq
            .from
            .clone()
            .ok_or_else(|| XmppError::bad_request(Some("missing from".to_string())))?;
        let from_bare = from.to_bare();

        match parse_pubsub_iq(iq)? {
            PubSubRequest::Publish { node, item } => {
                let outcome =
                    self.publish_item(&node, &from, item.id.as_deref(), item.payload)?;
                Ok(build_publish_result(iq, &node, &outcome.item_id))
            }
            PubSubRequest::Retract {
                node,
                item_id,
                notify,
            } => {
                self.retract_item(&node, &from, &item_id, notify)?;
                Ok(build_success(iq))
            }
            PubSubRequest::Items {
                node,
                max_items,
                item_ids,
            } => {
                let items = self.get_items(&node, &from, max_items, &item_ids)?;
                let entries: Vec<EventItem> = items
                    .into_iter()
                    .map(|item| EventItem {
                        id: Some(item.id),
                        payload: item.payload,
                        publisher: None,
                    })
                    .collect();
                Ok(build_items_result(iq, &node, &entries))
            }
            PubSubRequest::Create { node, config } => {
                let path = self.create_node(&node, &from_bare, None, &config)?;
                Ok(build_create_result(iq, &path))
            }
            PubSubRequest::Subscribe { node, jid, options } => {
                let outcome = self.subscribe_node(&node, &from, &jid, options.as_deref())?;
                Ok(build_subscription_result(
                    iq,
                    &node,
                    &jid,
                    outcome.state.as_str(),
                    Some(&outcome.subid),
                ))
            }
            PubSubRequest::Unsubscribe { node, jid, subid } => {
                self.unsubscribe_node(&node, &from, &jid, subid.as_deref())?;
                Ok(build_success(iq))
            }
            PubSubRequest::Delete { node } => {
                self.delete_node(&node, &from_bare)?;
                Ok(build_success(iq))
            }
            PubSubRequest::Purge { node } => {
                self.purge_node(&node, &from_bare)?;
                Ok(build_success(iq))
            }
            PubSubRequest::ConfigureGet { node } => {
                let fields = self.get_node_configuration(&node, &from_bare)?;
                Ok(build_configure_result(iq, &node, &fields))
            }
            PubSubRequest::ConfigureSet { node, fields } => {
                self.configure_node(&node, &from_bare, &fields)?;
                Ok(build_success(iq))
            }
            PubSubRequest::AffiliationsGet { node, owner } => {
                if owner {
                    let node = node.ok_or_else(|| {
                        XmppError::bad_request(Some("missing node attribute".to_string()))
                    })?;
                    let entries: Vec<(String, &'static str, String)> = self
                        .get_node_affiliations(&node, &from_bare)?
                        .into_iter()
                        .map(|(jid, aff)| (jid.to_string(), aff.as_str(), String::new()))
                        .collect();
                    Ok(build_affiliations_result(iq, Some(&node), true, &entries))
                } else {
                    let entries: Vec<(String, &'static str, String)> = self
                        .get_affiliations(&from_bare)?
                        .into_iter()
                        .map(|(path, aff)| (path, aff.as_str(), String::new()))
                        .collect();
                    Ok(build_affiliations_result(iq, None, false, &entries))
                }
            }
            PubSubRequest::AffiliationsSet { node, entries } => {
                self.set_affiliations(&node, &from_bare, &entries)?;
                Ok(build_success(iq))
            }
            PubSubRequest::SubscriptionsGet { node, owner } => {
                if owner {
                    let node = node.ok_or_else(|| {
                        XmppError::bad_request(Some("missing node attribute".to_string()))
                    })?;
                    let entries: Vec<(String, String, &'static str, String)> = self
                        .get_node_subscriptions(&node, &from_bare)?
                        .into_iter()
                        .map(|(jid, state, subid)| {
                            (jid.to_string(), node.clone(), state.as_str(), subid)
                        })
                        .collect();
                    Ok(build_subscriptions_result(iq, Some(&node), true, &entries))
                } else {
                    let entries: Vec<(String, String, &'static str, String)> = self
                        .get_subscriptions(&from_bare)?
                        .into_iter()
                        .map(|(path, state, subid)| {
                            (from_bare.to_string(), path, state.as_str(), subid)
                        })
                        .collect();
                    Ok(build_subscriptions_result(iq, None, false, &entries))
                }
            }
            PubSubRequest::SubscriptionsSet { node, entries } => {
                self.set_subscriptions(&node, &from_bare, &entries)?;
                Ok(build_success(iq))
            }
        }
    }

    /// Handle a message carrying a submitted authorization form.
    /// Returns `true` when the message was consumed.
    pub fn handle_authorization_message(&self, from: &Jid, message: &Element) -> bool {
        let Some(form) = message.get_child("x", stanzas::NS_DATA) else {
            return false;
        };
        let Some(decision) = stanzas::parse_authorization_submit(form) else {
            return false;
        };
        if let Err(e) = self.handle_authorization_decision(&from.to_bare(), &decision) {
            debug!(error = %e, "Authorization decision rejected");
        }
        true
    }

    // -----------------------------------------------------------------
    // PEP presence hooks
    // -----------------------------------------------------------------

    /// A contact's resource came online: deliver last items of nodes
    /// configured for presence-driven delivery, once per resource.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn presence_available(&self, contact: &FullJid) {
        let contact_bare = contact.to_bare();
        let nodes: Vec<Node> = match self.store.sync_dirty(|tables| {
            Ok(tables
                .nodes_of_host(&self.host)
                .into_iter()
                .filter(|n| {
                    n.options.send_last_published_item == SendLastPublishedItem::OnSubAndPresence
                })
                .cloned()
                .collect())
        }) {
            Ok(nodes) => nodes,
            Err(_) => return,
        };

        for node in nodes {
            let gate = {
                let record = self
                    .store
                    .sync_dirty(|tables| {
                        Ok(tables.state(&contact_bare, node.idx).cloned().unwrap_or_default())
                    })
                    .unwrap_or_default();
                gate_subscription(&node, &record.affiliation, &contact_bare, &*self.presence)
            };
            if !matches!(gate, Ok(GateOutcome::Allowed)) {
                continue;
            }

            let key = (contact.to_string(), node.idx);
            {
                let mut sent = self.pep_sent.lock().expect("pep_sent lock poisoned");
                if !sent.insert(key) {
                    continue;
                }
            }
            self.push_last_item(&node, &contact.to_string(), "");
        }
    }

    /// A contact's resource went offline: forget its last-item marks
    /// and apply `purge_offline` when the account's last resource is
    /// gone.
    #[instrument(skip(self), fields(host = %self.host))]
    pub fn presence_unavailable(&self, contact: &FullJid) {
        let full = contact.to_string();
        self.pep_sent
            .lock()
            .expect("pep_sent lock poisoned")
            .retain(|(jid, _)| jid != &full);

        let contact_bare = contact.to_bare();
        if !self.presence.available_resources(&contact_bare).is_empty() {
            return;
        }

        let purged = self.store.transaction(|tables| {
            let mut purged = Vec::new();
            let nodes: Vec<Node> = tables
                .nodes_of_host(&self.host)
                .into_iter()
                .filter(|n| n.options.purge_offline)
                .cloned()
                .collect();
            for node in nodes {
                let ids = tables.purge_items_of_publisher(node.idx, &contact_bare);
                if !ids.is_empty() {
                    let recipients =
                        compute_recipients(tables, &node, EventClass::Items, &*self.presence);
                    purged.push((node, ids, recipients));
                }
            }
            Ok(purged)
        });

        if let Ok(purged) = purged {
            for (node, ids, recipients) in purged {
                if node.options.notify_retract {
                    self.broadcast_for(&node, &recipients, event_retract(&node.path, &ids), None);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn pep_plugin_for(&self, path: &str, config: &crate::config::PubSubConfig) -> &'static dyn NodePlugin {
        if self.host.is_pep() {
            if let Some(mapped) = config.pep_mapping.get(path) {
                if let Some(found) = plugin(mapped) {
                    return found;
                }
            }
            return plugin("pep").expect("pep plugin registered");
        }
        self.default_plugin()
    }

    fn sender_for(&self, publisher: Option<&Jid>) -> EventSender {
        if self.host.is_pep() {
            if let Some(publisher) = publisher {
                return EventSender::Pep {
                    bare: publisher.to_bare().to_string(),
                    full: publisher.resource().map(|_| publisher.to_string()),
                };
            }
        }
        EventSender::Service(self.service_jid.clone())
    }

    fn broadcast_for(
        &self,
        node: &Node,
        recipients: &[Recipient],
        payload: Element,
        publisher: Option<&Jid>,
    ) {
        broadcast(
            &self.router,
            &self.sender_for(publisher),
            node.options.notification_type,
            recipients,
            payload,
        );
    }

    fn broadcast_structural(&self, node: &Node, payload: Element, publisher: Option<&Jid>) {
        let recipients = self.recipients_of_snapshot(node, EventClass::Nodes);
        self.broadcast_for(node, &recipients, payload, publisher);
    }

    fn recipients_of_snapshot(&self, node: &Node, class: EventClass) -> Vec<Recipient> {
        self.store
            .sync_dirty(|tables| Ok(compute_recipients(tables, node, class, &*self.presence)))
            .unwrap_or_default()
    }

    /// Push the node's last item to one recipient as a normal event.
    fn push_last_item(&self, node: &Node, to: &str, subid: &str) {
        let item = match self
            .store
            .sync_dirty(|tables| Ok(tables.last_item(node.idx)))
        {
            Ok(Some(item)) => item,
            _ => return,
        };

        let payload = event_items(
            &node.path,
            &[EventItem {
                id: Some(item.id.clone()),
                payload: if node.options.deliver_payloads {
                    item.payload.clone()
                } else {
                    Vec::new()
                },
                publisher: None,
            }],
        );
        let subids = if subid.is_empty() {
            Vec::new()
        } else {
            vec![subid.to_string()]
        };
        let message = stanzas::wrap_event(
            &stanzas::EventEnvelope {
                from: &self.service_jid,
                to,
                message_type: node.options.notification_type.as_str(),
                subids: &subids,
                collection: None,
                replyto: None,
            },
            payload,
        );
        let _ = self.router.route(message);
    }

    /// Direct subscription-state notification to its subject.
    fn notify_subject(
        &self,
        node: &Node,
        subject: &str,
        state: &str,
        subid: Option<&str>,
        compat: bool,
    ) {
        let payload = event_subscription(&node.path, subject, state, subid, compat);
        let message = stanzas::wrap_event(
            &stanzas::EventEnvelope {
                from: &self.service_jid,
                to: subject,
                message_type: node.options.notification_type.as_str(),
                subids: &[],
                collection: None,
                replyto: None,
            },
            payload,
        );
        let _ = self.router.route(message);
    }
}

/// Outcome of the access-model gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateOutcome {
    Allowed,
    Pending,
}

/// The subscription access gate (one arm per access model).
fn gate_subscription<P: PresenceDirectory>(
    node: &Node,
    affiliation: &Affiliation,
    requester: &BareJid,
    presence: &P,
) -> Result<GateOutcome, XmppError> {
    // Privileged affiliations bypass the gate.
    if matches!(affiliation, Affiliation::Owner | Affiliation::Publisher) {
        return Ok(GateOutcome::Allowed);
    }

    match node.options.access_model {
        AccessModel::Open => Ok(GateOutcome::Allowed),
        AccessModel::Presence => {
            let allowed = node
                .owners
                .iter()
                .any(|owner| presence.has_presence_subscription(owner, requester));
            if allowed {
                Ok(GateOutcome::Allowed)
            } else {
                Err(XmppError::not_authorized(Some(
                    "presence subscription required".to_string(),
                )))
            }
        }
        AccessModel::Roster => {
            let allowed = node.owners.iter().any(|owner| {
                presence.has_presence_subscription(owner, requester)
                    && presence
                        .roster_groups(owner, requester)
                        .iter()
                        .any(|group| node.options.roster_groups_allowed.contains(group))
            });
            if allowed {
                Ok(GateOutcome::Allowed)
            } else {
                Err(XmppError::not_authorized(Some(
                    "not in an allowed roster group".to_string(),
                )))
            }
        }
        AccessModel::Authorize => Ok(GateOutcome::Pending),
        // A non-member on a whitelisted node goes through the owner
        // authorization workflow rather than being refused outright.
        AccessModel::Whitelist => {
            if matches!(affiliation, Affiliation::Member) {
                Ok(GateOutcome::Allowed)
            } else {
                Ok(GateOutcome::Pending)
            }
        }
    }
}

/// Retrieval access check for `get_items`.
fn check_retrieve_access<P: PresenceDirectory>(
    node: &Node,
    record: &crate::pubsub::store::StateRecord,
    requester: &BareJid,
    presence: &P,
) -> Result<(), XmppError> {
    match record.affiliation {
        Affiliation::Outcast => return Err(XmppError::forbidden(None)),
        Affiliation::Owner | Affiliation::Publisher | Affiliation::Member => return Ok(()),
        Affiliation::None => {}
    }

    match node.options.access_model {
        AccessModel::Open => Ok(()),
        AccessModel::Presence | AccessModel::Roster => {
            gate_subscription(node, &record.affiliation, requester, presence).map(|_| ())
        }
        AccessModel::Authorize | AccessModel::Whitelist => {
            if record.has_subscription_state(SubState::Subscribed) {
                Ok(())
            } else {
                Err(XmppError::not_authorized(Some(
                    "approved subscription required".to_string(),
                )))
            }
        }
    }
}

/// Publish-model permission check.
fn check_publish_permission(
    node: &Node,
    affiliation: &Affiliation,
    record: &crate::pubsub::store::StateRecord,
) -> Result<(), XmppError> {
    if matches!(affiliation, Affiliation::Outcast) {
        return Err(XmppError::forbidden(None));
    }
    let allowed = match node.options.publish_model {
        PublishModel::Open => true,
        PublishModel::Publishers => {
            matches!(affiliation, Affiliation::Owner | Affiliation::Publisher)
        }
        PublishModel::Subscribers => {
            matches!(affiliation, Affiliation::Owner | Affiliation::Publisher)
                || record.has_subscription_state(SubState::Subscribed)
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(XmppError::forbidden(None))
    }
}

/// Payload validation per node options.
fn check_payload(options: &NodeOptions, payload: &[Element]) -> Result<(), XmppError> {
    let payload_expected = options.deliver_payloads || options.persist_items;
    if payload_expected && payload.is_empty() {
        return Err(XmppError::bad_request(Some("payload required".to_string())));
    }
    if !payload_expected && !payload.is_empty() {
        return Err(XmppError::bad_request(Some("payload forbidden".to_string())));
    }
    if payload_expected && payload.len() != 1 {
        return Err(XmppError::bad_request(Some(
            "item must carry exactly one payload element".to_string(),
        )));
    }

    let size: usize = payload
        .iter()
        .map(|fragment| element_to_string(fragment).map(|s| s.len()).unwrap_or(usize::MAX))
        .sum();
    if size > options.max_payload_size {
        return Err(XmppError::not_acceptable(Some("payload too big".to_string())));
    }

    if let Some(required_ns) = &options.payload_type {
        let matches = payload
            .first()
            .map(|fragment| fragment.ns() == *required_ns)
            .unwrap_or(false);
        if !matches {
            return Err(XmppError::bad_request(Some("wrong payload type".to_string())));
        }
    }
    Ok(())
}
