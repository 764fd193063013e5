//! Event fan-out.
//!
//! For every node event the broadcaster walks the node's ancestor
//! collection chain, gathers the live subscriptions of every node on
//! the way, applies the per-subscription delivery filters (type,
//! depth, deliver flag, expiry, presence show state), deduplicates by
//! bare JID, and emits one notification message per recipient through
//! the router. Remote recipients then travel the S2S layer like any
//! other stanza.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, warn};

use crate::presence::PresenceDirectory;
use crate::pubsub::node::{NotificationType, SubOptions, SubscriptionType};
use crate::pubsub::stanzas::{wrap_event, EventEnvelope};
use crate::pubsub::store::{Node, SubState, Tables};
use crate::router::RouterHandle;

/// One computed notification target.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Target bare JID.
    pub jid: BareJid,
    /// All matching subscription ids, merged into one message.
    pub subids: Vec<String>,
    /// Ancestor collection path the match came through, if any.
    pub collection: Option<String>,
}

/// Whether an event concerns items or node structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Publish/retract.
    Items,
    /// Create/delete/purge/configure/subscription changes.
    Nodes,
}

/// Compute the deduplicated recipient set for an event on `node`.
///
/// `tables` must be a consistent view (called under the store lock or
/// inside a transaction); the returned set is self-contained so the
/// actual sends happen after the lock is released.
pub fn compute_recipients<P: PresenceDirectory>(
    tables: &Tables,
    node: &Node,
    class: EventClass,
    presence: &P,
) -> Vec<Recipient> {
    let now = Utc::now();
    let default_options = SubOptions::default();

    // Ancestor chain, breadth-first over parent collections; the
    // paths-as-strings representation bounds this walk and a visited
    // set guards against cycles introduced by deletion races.
    let mut chain: Vec<(&Node, u32)> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut frontier = VecDeque::new();
    frontier.push_back((node, 0u32));
    visited.insert(node.path.as_str());

    while let Some((current, distance)) = frontier.pop_front() {
        chain.push((current, distance));
        for parent_path in &current.options.collection {
            if visited.insert(parent_path.as_str()) {
                if let Some(parent) = tables.node_by_path(&node.host, parent_path) {
                    frontier.push_back((parent, distance + 1));
                }
            }
        }
    }

    let mut merged: HashMap<BareJid, Recipient> = HashMap::new();

    for (member, distance) in chain {
        for (entity, record) in tables.node_states(member.idx) {
            for (state, subid) in &record.subscriptions {
                if *state != SubState::Subscribed {
                    continue;
                }
                let options = tables.sub_options(subid).unwrap_or(&default_options);

                let wanted = match class {
                    EventClass::Items => options.subscription_type == SubscriptionType::Items,
                    EventClass::Nodes => options.subscription_type == SubscriptionType::Nodes,
                };
                if !wanted || !options.depth.admits(distance) || !options.is_live(now) {
                    continue;
                }

                let resources = presence.available_resources(&entity);
                if node.options.presence_based_delivery && resources.is_empty() {
                    continue;
                }
                if !options.show_values.is_empty()
                    && !resources.iter().any(|(_, show)| options.admits_show(*show))
                {
                    continue;
                }

                let entry = merged.entry(entity.clone()).or_insert_with(|| Recipient {
                    jid: entity.clone(),
                    subids: Vec::new(),
                    collection: (distance > 0).then(|| member.path.clone()),
                });
                if !entry.subids.contains(subid) {
                    entry.subids.push(subid.clone());
                }
            }
        }
    }

    let mut recipients: Vec<Recipient> = merged.into_values().collect();
    recipients.sort_by(|a, b| a.jid.to_string().cmp(&b.jid.to_string()));
    recipients
}

/// Sender identity for a batch of notifications.
#[derive(Debug, Clone)]
pub enum EventSender {
    /// Regular service: the service JID.
    Service(String),
    /// PEP: the publisher's bare JID, plus the full JID for the
    /// `replyto` extended address.
    Pep {
        /// Publisher bare JID (message `from`).
        bare: String,
        /// Full publisher JID for `replyto`.
        full: Option<String>,
    },
}

impl EventSender {
    fn from_attr(&self) -> &str {
        match self {
            Self::Service(jid) => jid,
            Self::Pep { bare, .. } => bare,
        }
    }

    fn replyto(&self) -> Option<&str> {
        match self {
            Self::Pep { full, .. } => full.as_deref(),
            Self::Service(_) => None,
        }
    }
}

/// Send one event payload to every recipient.
pub fn broadcast(
    router: &RouterHandle,
    sender: &EventSender,
    notification_type: NotificationType,
    recipients: &[Recipient],
    payload: Element,
) {
    for recipient in recipients {
        let message = wrap_event(
            &EventEnvelope {
                from: sender.from_attr(),
                to: &recipient.jid.to_string(),
                message_type: notification_type.as_str(),
                subids: &recipient.subids,
                collection: recipient.collection.as_deref(),
                replyto: sender.replyto(),
            },
            payload.clone(),
        );
        if let Err(e) = router.route(message) {
            warn!(to = %recipient.jid, error = %e, "Failed to route notification");
        }
    }
    debug!(count = recipients.len(), "Broadcast complete");
}
