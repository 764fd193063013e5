//! Node and subscription configuration.
//!
//! Node options are carried on the wire as `jabber:x:data` submit
//! forms with `pubsub#<key>` field vars. Unknown fields are ignored;
//! malformed values reject the whole form with `not-acceptable`.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::presence::ShowState;
use crate::XmppError;

/// Access model for a node: who may subscribe and retrieve items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessModel {
    /// Anyone can subscribe and retrieve items.
    #[default]
    Open,
    /// Entities with a presence subscription from an owner.
    Presence,
    /// Entities in one of the allowed roster groups of an owner.
    Roster,
    /// Anyone may ask; owners approve each subscription.
    Authorize,
    /// Only explicitly whitelisted JIDs.
    Whitelist,
}

impl AccessModel {
    /// Parse a form value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "presence" => Some(Self::Presence),
            "roster" => Some(Self::Roster),
            "authorize" => Some(Self::Authorize),
            "whitelist" => Some(Self::Whitelist),
            _ => None,
        }
    }
}

impl fmt::Display for AccessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Presence => "presence",
            Self::Roster => "roster",
            Self::Authorize => "authorize",
            Self::Whitelist => "whitelist",
        };
        write!(f, "{}", s)
    }
}

/// Publish model: who may publish to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishModel {
    /// Owners and publishers only.
    #[default]
    Publishers,
    /// Any subscriber.
    Subscribers,
    /// Anyone.
    Open,
}

impl PublishModel {
    /// Parse a form value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publishers" => Some(Self::Publishers),
            "subscribers" => Some(Self::Subscribers),
            "open" => Some(Self::Open),
            _ => None,
        }
    }
}

impl fmt::Display for PublishModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Publishers => "publishers",
            Self::Subscribers => "subscribers",
            Self::Open => "open",
        };
        write!(f, "{}", s)
    }
}

/// Message type used for event notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationType {
    /// `type='headline'` (the XEP-0060 default)
    #[default]
    Headline,
    /// `type='normal'`
    Normal,
}

impl NotificationType {
    /// Parse a form value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "headline" => Some(Self::Headline),
            "normal" => Some(Self::Normal),
            _ => None,
        }
    }

    /// The message `type` attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Headline => "headline",
            Self::Normal => "normal",
        }
    }
}

/// When to push the last published item to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendLastPublishedItem {
    /// Never send automatically.
    Never,
    /// On subscription only.
    #[default]
    OnSub,
    /// On subscription and whenever a contact comes online (PEP).
    OnSubAndPresence,
}

impl SendLastPublishedItem {
    /// Parse a form value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(Self::Never),
            "on_sub" => Some(Self::OnSub),
            "on_sub_and_presence" => Some(Self::OnSubAndPresence),
            _ => None,
        }
    }
}

impl fmt::Display for SendLastPublishedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Never => "never",
            Self::OnSub => "on_sub",
            Self::OnSubAndPresence => "on_sub_and_presence",
        };
        write!(f, "{}", s)
    }
}

/// Full option set of a node (`pubsub#<key>` form fields).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOptions {
    /// Include payloads in notifications.
    pub deliver_payloads: bool,
    /// Deliver event notifications at all.
    pub deliver_notifications: bool,
    /// Broadcast configuration changes.
    pub notify_config: bool,
    /// Broadcast node deletion.
    pub notify_delete: bool,
    /// Broadcast item retraction.
    pub notify_retract: bool,
    /// Notify owners about subscription changes.
    pub notify_sub: bool,
    /// Persist items in the item store.
    pub persist_items: bool,
    /// Retention bound for persisted items.
    pub max_items: u32,
    /// Whether subscribing is enabled at all.
    pub subscribe: bool,
    /// Access model.
    pub access_model: AccessModel,
    /// Roster groups admitted under the `roster` access model.
    pub roster_groups_allowed: Vec<String>,
    /// Publish model.
    pub publish_model: PublishModel,
    /// Purge a user's items when their last resource goes offline.
    pub purge_offline: bool,
    /// Notification message type.
    pub notification_type: NotificationType,
    /// Maximum accepted payload size in bytes.
    pub max_payload_size: usize,
    /// Last-item delivery policy.
    pub send_last_published_item: SendLastPublishedItem,
    /// Only deliver to subscribers with shared presence.
    pub presence_based_delivery: bool,
    /// Parent collection node paths.
    pub collection: Vec<String>,
    /// Required payload namespace, when constrained.
    pub payload_type: Option<String>,
    /// Human-readable title.
    pub title: String,
    /// XSLT for body generation, when configured.
    pub body_xslt: String,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            deliver_payloads: true,
            deliver_notifications: true,
            notify_config: false,
            notify_delete: false,
            notify_retract: true,
            notify_sub: false,
            persist_items: true,
            max_items: 10,
            subscribe: true,
            access_model: AccessModel::Open,
            roster_groups_allowed: Vec::new(),
            publish_model: PublishModel::Publishers,
            purge_offline: false,
            notification_type: NotificationType::Headline,
            max_payload_size: 60_000,
            send_last_published_item: SendLastPublishedItem::OnSub,
            presence_based_delivery: false,
            collection: Vec::new(),
            payload_type: None,
            title: String::new(),
            body_xslt: String::new(),
        }
    }
}

fn parse_bool(value: &str) -> Result<bool, XmppError> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(XmppError::not_acceptable(Some(format!(
            "invalid boolean value: {}",
            other
        )))),
    }
}

impl NodeOptions {
    /// Merge submitted `pubsub#<key>` form fields over these options.
    /// Unknown vars are ignored; malformed values fail the form.
    pub fn apply_form(&mut self, fields: &[(String, Vec<String>)]) -> Result<(), XmppError> {
        for (var, values) in fields {
            let Some(key) = var.strip_prefix("pubsub#") else {
                continue;
            };
            let first = values.first().map(String::as_str).unwrap_or("");

            match key {
                "deliver_payloads" => self.deliver_payloads = parse_bool(first)?,
                "deliver_notifications" => self.deliver_notifications = parse_bool(first)?,
                "notify_config" => self.notify_config = parse_bool(first)?,
                "notify_delete" => self.notify_delete = parse_bool(first)?,
                "notify_retract" => self.notify_retract = parse_bool(first)?,
                "notify_sub" => self.notify_sub = parse_bool(first)?,
                "persist_items" => self.persist_items = parse_bool(first)?,
                "subscribe" => self.subscribe = parse_bool(first)?,
                "purge_offline" => self.purge_offline = parse_bool(first)?,
                "presence_based_delivery" => self.presence_based_delivery = parse_bool(first)?,
                "max_items" => {
                    self.max_items = first.parse().map_err(|_| {
                        XmppError::not_acceptable(Some("invalid max_items".to_string()))
                    })?
                }
                "max_payload_size" => {
                    self.max_payload_size = first.parse().map_err(|_| {
                        XmppError::not_acceptable(Some("invalid max_payload_size".to_string()))
                    })?
                }
                "access_model" => {
                    self.access_model = AccessModel::parse(first).ok_or_else(|| {
                        XmppError::not_acceptable(Some("invalid access_model".to_string()))
                    })?
                }
                "publish_model" => {
                    self.publish_model = PublishModel::parse(first).ok_or_else(|| {
                        XmppError::not_acceptable(Some("invalid publish_model".to_string()))
                    })?
                }
                "notification_type" => {
                    self.notification_type = NotificationType::parse(first).ok_or_else(|| {
                        XmppError::not_acceptable(Some("invalid notification_type".to_string()))
                    })?
                }
                "send_last_published_item" => {
                    self.send_last_published_item = SendLastPublishedItem::parse(first)
                        .ok_or_else(|| {
                            XmppError::not_acceptable(Some(
                                "invalid send_last_published_item".to_string(),
                            ))
                        })?
                }
                "roster_groups_allowed" => self.roster_groups_allowed = values.clone(),
                "collection" => {
                    self.collection = values.iter().filter(|v| !v.is_empty()).cloned().collect()
                }
                "type" => {
                    self.payload_type = if first.is_empty() {
                        None
                    } else {
                        Some(first.to_string())
                    }
                }
                "title" => self.title = first.to_string(),
                "body_xslt" => self.body_xslt = first.to_string(),
                _ => {}
            }
        }
        Ok(())
    }

    /// The options as form fields, for configuration retrieval.
    pub fn to_form(&self) -> Vec<(String, Vec<String>)> {
        fn flag(value: bool) -> Vec<String> {
            vec![if value { "1" } else { "0" }.to_string()]
        }

        vec![
            ("pubsub#deliver_payloads".into(), flag(self.deliver_payloads)),
            (
                "pubsub#deliver_notifications".into(),
                flag(self.deliver_notifications),
            ),
            ("pubsub#notify_config".into(), flag(self.notify_config)),
            ("pubsub#notify_delete".into(), flag(self.notify_delete)),
            ("pubsub#notify_retract".into(), flag(self.notify_retract)),
            ("pubsub#notify_sub".into(), flag(self.notify_sub)),
            ("pubsub#persist_items".into(), flag(self.persist_items)),
            ("pubsub#max_items".into(), vec![self.max_items.to_string()]),
            ("pubsub#subscribe".into(), flag(self.subscribe)),
            (
                "pubsub#access_model".into(),
                vec![self.access_model.to_string()],
            ),
            (
                "pubsub#roster_groups_allowed".into(),
                self.roster_groups_allowed.clone(),
            ),
            (
                "pubsub#publish_model".into(),
                vec![self.publish_model.to_string()],
            ),
            ("pubsub#purge_offline".into(), flag(self.purge_offline)),
            (
                "pubsub#notification_type".into(),
                vec![self.notification_type.as_str().to_string()],
            ),
            (
                "pubsub#max_payload_size".into(),
                vec![self.max_payload_size.to_string()],
            ),
            (
                "pubsub#send_last_published_item".into(),
                vec![self.send_last_published_item.to_string()],
            ),
            (
                "pubsub#presence_based_delivery".into(),
                flag(self.presence_based_delivery),
            ),
            ("pubsub#collection".into(), self.collection.clone()),
            (
                "pubsub#type".into(),
                vec![self.payload_type.clone().unwrap_or_default()],
            ),
            ("pubsub#title".into(), vec![self.title.clone()]),
            ("pubsub#body_xslt".into(), vec![self.body_xslt.clone()]),
        ]
    }
}

/// Depth filter of a collection subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionDepth {
    /// Any descendant depth.
    #[default]
    All,
    /// Events at most this many levels below the subscribed node.
    Limit(u32),
}

impl SubscriptionDepth {
    /// Whether an event `distance` levels below passes the filter.
    pub fn admits(&self, distance: u32) -> bool {
        match self {
            Self::All => true,
            Self::Limit(max) => distance <= *max,
        }
    }
}

/// Whether a subscription wants item events, structural node events,
/// or both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionType {
    /// Item publish/retract events.
    #[default]
    Items,
    /// Node creation/deletion/configuration events.
    Nodes,
}

/// Per-subscription delivery options (keyed by SubID).
#[derive(Debug, Clone, PartialEq)]
pub struct SubOptions {
    /// Master switch; `false` mutes the subscription.
    pub deliver: bool,
    /// Collection depth filter.
    pub depth: SubscriptionDepth,
    /// Item vs node events.
    pub subscription_type: SubscriptionType,
    /// Only deliver while the subscriber's presence show is one of
    /// these. Empty means no filter.
    pub show_values: Vec<ShowState>,
    /// Subscription expiry.
    pub expire: Option<DateTime<Utc>>,
    /// Plugin-defined extra keys, passed through untouched.
    pub extra: Vec<(String, Vec<String>)>,
}

impl Default for SubOptions {
    fn default() -> Self {
        Self {
            deliver: true,
            depth: SubscriptionDepth::All,
            subscription_type: SubscriptionType::Items,
            show_values: Vec::new(),
            expire: None,
            extra: Vec::new(),
        }
    }
}

impl SubOptions {
    /// Merge submitted subscribe-options form fields.
    pub fn apply_form(&mut self, fields: &[(String, Vec<String>)]) -> Result<(), XmppError> {
        for (var, values) in fields {
            let Some(key) = var.strip_prefix("pubsub#") else {
                continue;
            };
            let first = values.first().map(String::as_str).unwrap_or("");

            match key {
                "deliver" => self.deliver = parse_bool(first)?,
                "subscription_depth" => {
                    self.depth = if first == "all" {
                        SubscriptionDepth::All
                    } else {
                        SubscriptionDepth::Limit(first.parse().map_err(|_| {
                            XmppError::not_acceptable(Some(
                                "invalid subscription_depth".to_string(),
                            ))
                        })?)
                    }
                }
                "subscription_type" => {
                    self.subscription_type = match first {
                        "items" => SubscriptionType::Items,
                        "nodes" => SubscriptionType::Nodes,
                        _ => {
                            return Err(XmppError::not_acceptable(Some(
                                "invalid subscription_type".to_string(),
                            )))
                        }
                    }
                }
                "show-values" => {
                    let mut shows = Vec::new();
                    for value in values {
                        match ShowState::from_token(value) {
                            Some(show) => shows.push(show),
                            None => {
                                return Err(XmppError::not_acceptable(Some(format!(
                                    "invalid show value: {}",
                                    value
                                ))))
                            }
                        }
                    }
                    self.show_values = shows;
                }
                "expire" => {
                    self.expire = if first.is_empty() {
                        None
                    } else {
                        Some(
                            first
                                .parse::<DateTime<Utc>>()
                                .map_err(|_| {
                                    XmppError::not_acceptable(Some(
                                        "invalid expire timestamp".to_string(),
                                    ))
                                })?,
                        )
                    }
                }
                _ => self.extra.push((var.clone(), values.clone())),
            }
        }
        Ok(())
    }

    /// Whether this subscription is live at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.deliver && self.expire.map(|at| at > now).unwrap_or(true)
    }

    /// Whether `show` passes the presence filter.
    pub fn admits_show(&self, show: ShowState) -> bool {
        self.show_values.is_empty() || self.show_values.contains(&show)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(var: &str, value: &str) -> (String, Vec<String>) {
        (var.to_string(), vec![value.to_string()])
    }

    #[test]
    fn test_access_model_parse() {
        assert_eq!(AccessModel::parse("open"), Some(AccessModel::Open));
        assert_eq!(AccessModel::parse("whitelist"), Some(AccessModel::Whitelist));
        assert_eq!(AccessModel::parse("authorize"), Some(AccessModel::Authorize));
        assert_eq!(AccessModel::parse("invalid"), None);
    }

    #[test]
    fn test_apply_form_merges_over_defaults() {
        let mut options = NodeOptions::default();
        options
            .apply_form(&[
                field("pubsub#access_model", "whitelist"),
                field("pubsub#max_items", "3"),
                field("pubsub#persist_items", "0"),
                field("pubsub#title", "Build alerts"),
                ("pubsub#collection".to_string(), vec!["/alerts".to_string()]),
            ])
            .unwrap();

        assert_eq!(options.access_model, AccessModel::Whitelist);
        assert_eq!(options.max_items, 3);
        assert!(!options.persist_items);
        assert_eq!(options.title, "Build alerts");
        assert_eq!(options.collection, vec!["/alerts".to_string()]);
        // Untouched keys keep their defaults.
        assert!(options.subscribe);
    }

    #[test]
    fn test_apply_form_ignores_unknown_fields() {
        let mut options = NodeOptions::default();
        options
            .apply_form(&[
                field("pubsub#no_such_option", "whatever"),
                field("FORM_TYPE", "http://jabber.org/protocol/pubsub#node_config"),
            ])
            .unwrap();
        assert_eq!(options, NodeOptions::default());
    }

    #[test]
    fn test_apply_form_rejects_malformed_values() {
        let mut options = NodeOptions::default();
        assert!(options
            .apply_form(&[field("pubsub#max_items", "many")])
            .is_err());
        assert!(options
            .apply_form(&[field("pubsub#deliver_payloads", "yes please")])
            .is_err());
        assert!(options
            .apply_form(&[field("pubsub#access_model", "secret")])
            .is_err());
    }

    #[test]
    fn test_form_round_trip() {
        let mut options = NodeOptions::default();
        options.access_model = AccessModel::Roster;
        options.roster_groups_allowed = vec!["friends".to_string()];
        options.max_items = 42;

        let mut parsed = NodeOptions::default();
        parsed.apply_form(&options.to_form()).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn test_subscription_depth() {
        assert!(SubscriptionDepth::All.admits(7));
        assert!(SubscriptionDepth::Limit(1).admits(0));
        assert!(SubscriptionDepth::Limit(1).admits(1));
        assert!(!SubscriptionDepth::Limit(1).admits(2));
    }

    #[test]
    fn test_sub_options_form() {
        let mut options = SubOptions::default();
        options
            .apply_form(&[
                field("pubsub#deliver", "0"),
                field("pubsub#subscription_depth", "all"),
                field("pubsub#subscription_type", "nodes"),
                (
                    "pubsub#show-values".to_string(),
                    vec!["online".to_string(), "chat".to_string()],
                ),
            ])
            .unwrap();

        assert!(!options.deliver);
        assert_eq!(options.depth, SubscriptionDepth::All);
        assert_eq!(options.subscription_type, SubscriptionType::Nodes);
        assert_eq!(options.show_values, vec![ShowState::Online, ShowState::Chat]);
    }

    #[test]
    fn test_sub_options_show_filter() {
        let mut options = SubOptions::default();
        assert!(options.admits_show(ShowState::Dnd));

        options.show_values = vec![ShowState::Online];
        assert!(options.admits_show(ShowState::Online));
        assert!(!options.admits_show(ShowState::Dnd));
    }

    #[test]
    fn test_sub_options_expiry() {
        let mut options = SubOptions::default();
        let now = Utc::now();
        assert!(options.is_live(now));

        options.expire = Some(now - chrono::Duration::seconds(1));
        assert!(!options.is_live(now));

        options.expire = Some(now + chrono::Duration::hours(1));
        assert!(options.is_live(now));

        options.deliver = false;
        assert!(!options.is_live(now));
    }
}
