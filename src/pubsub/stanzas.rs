//! Pub/sub stanza parsing and building (XEP-0060 wire layer).

use minidom::Element;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::error::{StanzaErrorCondition, StanzaErrorType};
use crate::parser::ns::JABBER_CLIENT;
use crate::XmppError;

/// Main PubSub namespace (XEP-0060).
pub const NS_PUBSUB: &str = "http://jabber.org/protocol/pubsub";

/// PubSub event namespace for notifications.
pub const NS_PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";

/// PubSub owner namespace for node management.
pub const NS_PUBSUB_OWNER: &str = "http://jabber.org/protocol/pubsub#owner";

/// Data forms namespace.
pub const NS_DATA: &str = "jabber:x:data";

/// SHIM headers namespace (XEP-0131).
pub const NS_SHIM: &str = "http://jabber.org/protocol/shim";

/// Extended addressing namespace (XEP-0033), used for PEP `replyto`.
pub const NS_ADDRESS: &str = "http://jabber.org/protocol/address";

/// FORM_TYPE of the subscription authorization form.
pub const NS_SUB_AUTHORIZATION: &str = "http://jabber.org/protocol/pubsub#subscribe_authorization";

/// An item as carried on the wire.
#[derive(Debug, Clone, Default)]
pub struct PubSubItem {
    /// Item id; `None` asks the service to generate one.
    pub id: Option<String>,
    /// Payload fragments.
    pub payload: Vec<Element>,
}

impl PubSubItem {
    /// Parse an `<item/>` element.
    pub fn from_element(elem: &Element) -> Self {
        Self {
            id: elem.attr("id").map(String::from),
            payload: elem.children().cloned().collect(),
        }
    }
}

/// Parsed pub/sub request.
#[derive(Debug, Clone)]
pub enum PubSubRequest {
    /// Publish an item.
    Publish {
        /// Node path.
        node: String,
        /// The submitted item.
        item: PubSubItem,
    },
    /// Retract an item.
    Retract {
        /// Node path.
        node: String,
        /// Item id.
        item_id: String,
        /// Force a retract notification.
        notify: bool,
    },
    /// Retrieve items.
    Items {
        /// Node path.
        node: String,
        /// Requested cap.
        max_items: Option<u32>,
        /// Specific ids, when given.
        item_ids: Vec<String>,
    },
    /// Create a node, optionally with configuration.
    Create {
        /// Node path; empty requests an instant node.
        node: String,
        /// Submitted configure form fields.
        config: Vec<(String, Vec<String>)>,
    },
    /// Subscribe to a node.
    Subscribe {
        /// Node path.
        node: String,
        /// Subscriber JID.
        jid: String,
        /// Submitted subscription options.
        options: Option<Vec<(String, Vec<String>)>>,
    },
    /// Unsubscribe from a node.
    Unsubscribe {
        /// Node path.
        node: String,
        /// Subscriber JID.
        jid: String,
        /// Which subscription, when there are several.
        subid: Option<String>,
    },
    /// Delete a node (owner namespace).
    Delete {
        /// Node path.
        node: String,
    },
    /// Purge all items (owner namespace).
    Purge {
        /// Node path.
        node: String,
    },
    /// Retrieve node configuration (owner namespace).
    ConfigureGet {
        /// Node path.
        node: String,
    },
    /// Submit node configuration (owner namespace).
    ConfigureSet {
        /// Node path.
        node: String,
        /// Submitted form fields.
        fields: Vec<(String, Vec<String>)>,
    },
    /// Retrieve affiliations. In the default namespace this returns
    /// the requester's own affiliations; in the owner namespace, the
    /// node's.
    AffiliationsGet {
        /// Node path (owner namespace only).
        node: Option<String>,
        /// Whether this is the owner-namespace variant.
        owner: bool,
    },
    /// Modify affiliations (owner namespace).
    AffiliationsSet {
        /// Node path.
        node: String,
        /// `(jid, affiliation)` entries.
        entries: Vec<(String, String)>,
    },
    /// Retrieve subscriptions. Same dual meaning as affiliations.
    SubscriptionsGet {
        /// Node path (owner namespace only).
        node: Option<String>,
        /// Whether this is the owner-namespace variant.
        owner: bool,
    },
    /// Modify subscriptions (owner namespace).
    SubscriptionsSet {
        /// Node path.
        node: String,
        /// `(jid, state, subid)` entries.
        entries: Vec<(String, String, Option<String>)>,
    },
}

/// Check if an IQ is a pub/sub request.
pub fn is_pubsub_iq(iq: &Iq) -> bool {
    match &iq.payload {
        IqType::Get(elem) | IqType::Set(elem) => {
            elem.name() == "pubsub" && (elem.ns() == NS_PUBSUB || elem.ns() == NS_PUBSUB_OWNER)
        }
        _ => false,
    }
}

fn node_attr(elem: &Element) -> Result<String, XmppError> {
    elem.attr("node")
        .map(String::from)
        .ok_or_else(|| XmppError::bad_request(Some("missing node attribute".to_string())))
}

fn jid_attr(elem: &Element) -> Result<String, XmppError> {
    elem.attr("jid")
        .map(String::from)
        .ok_or_else(|| XmppError::bad_request(Some("missing jid attribute".to_string())))
}

/// Parse a pub/sub IQ into a structured request.
pub fn parse_pubsub_iq(iq: &Iq) -> Result<PubSubRequest, XmppError> {
    let (pubsub, is_set) = match &iq.payload {
        IqType::Get(elem) if elem.name() == "pubsub" => (elem, false),
        IqType::Set(elem) if elem.name() == "pubsub" => (elem, true),
        _ => {
            return Err(XmppError::bad_request(Some(
                "pubsub IQ must be get or set".to_string(),
            )))
        }
    };

    let owner_ns = pubsub.ns() == NS_PUBSUB_OWNER;
    let ns = if owner_ns { NS_PUBSUB_OWNER } else { NS_PUBSUB };

    if let Some(publish) = pubsub.get_child("publish", ns) {
        let node = node_attr(publish)?;
        let item = publish
            .get_child("item", ns)
            .map(PubSubItem::from_element)
            .unwrap_or_default();
        return Ok(PubSubRequest::Publish { node, item });
    }

    if let Some(retract) = pubsub.get_child("retract", ns) {
        let node = node_attr(retract)?;
        let notify = retract
            .attr("notify")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let item_id = retract
            .get_child("item", ns)
            .and_then(|item| item.attr("id"))
            .ok_or_else(|| XmppError::bad_request(Some("missing item id".to_string())))?
            .to_string();
        return Ok(PubSubRequest::Retract {
            node,
            item_id,
            notify,
        });
    }

    if let Some(items) = pubsub.get_child("items", ns) {
        let node = node_attr(items)?;
        let max_items = items.attr("max_items").and_then(|s| s.parse().ok());
        let item_ids: Vec<String> = items
            .children()
            .filter(|c| c.name() == "item")
            .filter_map(|c| c.attr("id").map(String::from))
            .collect();
        return Ok(PubSubRequest::Items {
            node,
            max_items,
            item_ids,
        });
    }

    if let Some(create) = pubsub.get_child("create", ns) {
        let node = create.attr("node").unwrap_or("").to_string();
        let config = pubsub
            .get_child("configure", ns)
            .and_then(|configure| find_form(configure))
            .map(parse_form)
            .unwrap_or_default();
        return Ok(PubSubRequest::Create { node, config });
    }

    if let Some(subscribe) = pubsub.get_child("subscribe", ns) {
        let node = node_attr(subscribe)?;
        let jid = jid_attr(subscribe)?;
        let options = pubsub
            .get_child("options", ns)
            .and_then(|options| find_form(options))
            .map(parse_form);
        return Ok(PubSubRequest::Subscribe { node, jid, options });
    }

    if let Some(unsubscribe) = pubsub.get_child("unsubscribe", ns) {
        let node = node_attr(unsubscribe)?;
        let jid = jid_attr(unsubscribe)?;
        let subid = unsubscribe.attr("subid").map(String::from);
        return Ok(PubSubRequest::Unsubscribe { node, jid, subid });
    }

    if owner_ns {
        if let Some(delete) = pubsub.get_child("delete", ns) {
            return Ok(PubSubRequest::Delete {
                node: node_attr(delete)?,
            });
        }

        if let Some(purge) = pubsub.get_child("purge", ns) {
            return Ok(PubSubRequest::Purge {
                node: node_attr(purge)?,
            });
        }

        if let Some(configure) = pubsub.get_child("configure", ns) {
            let node = node_attr(configure)?;
            return Ok(match find_form(configure) {
                Some(form) if is_set => PubSubRequest::ConfigureSet {
                    node,
                    fields: parse_form(form),
                },
                _ => PubSubRequest::ConfigureGet { node },
            });
        }
    }

    if let Some(affiliations) = pubsub.get_child("affiliations", ns) {
        if owner_ns && is_set {
            let node = node_attr(affiliations)?;
            let entries = affiliations
                .children()
                .filter(|c| c.name() == "affiliation")
                .map(|c| {
                    Ok((
                        jid_attr(c)?,
                        c.attr("affiliation")
                            .ok_or_else(|| {
                                XmppError::bad_request(Some(
                                    "missing affiliation attribute".to_string(),
                                ))
                            })?
                            .to_string(),
                    ))
                })
                .collect::<Result<Vec<_>, XmppError>>()?;
            return Ok(PubSubRequest::AffiliationsSet { node, entries });
        }
        return Ok(PubSubRequest::AffiliationsGet {
            node: affiliations.attr("node").map(String::from),
            owner: owner_ns,
        });
    }

    if let Some(subscriptions) = pubsub.get_child("subscriptions", ns) {
        if owner_ns && is_set {
            let node = node_attr(subscriptions)?;
            let entries = subscriptions
                .children()
                .filter(|c| c.name() == "subscription")
                .map(|c| {
                    Ok((
                        jid_attr(c)?,
                        c.attr("subscription")
                            .ok_or_else(|| {
                                XmppError::bad_request(Some(
                                    "missing subscription attribute".to_string(),
                                ))
                            })?
                            .to_string(),
                        c.attr("subid").map(String::from),
                    ))
                })
                .collect::<Result<Vec<_>, XmppError>>()?;
            return Ok(PubSubRequest::SubscriptionsSet { node, entries });
        }
        return Ok(PubSubRequest::SubscriptionsGet {
            node: subscriptions.attr("node").map(String::from),
            owner: owner_ns,
        });
    }

    Err(XmppError::bad_request(Some(
        "unsupported pubsub operation".to_string(),
    )))
}

// ---------------------------------------------------------------------
// Data forms
// ---------------------------------------------------------------------

/// Find the `jabber:x:data` form inside an element.
pub fn find_form(parent: &Element) -> Option<&Element> {
    parent.get_child("x", NS_DATA)
}

/// Flatten a data form into `(var, values)` pairs.
pub fn parse_form(form: &Element) -> Vec<(String, Vec<String>)> {
    form.children()
        .filter(|c| c.name() == "field")
        .filter_map(|field| {
            let var = field.attr("var")?.to_string();
            let values = field
                .children()
                .filter(|c| c.name() == "value")
                .map(|v| v.text())
                .collect();
            Some((var, values))
        })
        .collect()
}

/// Build a data form of the given type.
pub fn build_form(form_type: &str, fields: &[(String, Vec<String>)]) -> Element {
    let mut builder = Element::builder("x", NS_DATA).attr("type", form_type);
    for (var, values) in fields {
        let mut field = Element::builder("field", NS_DATA).attr("var", var);
        for value in values {
            field = field.append(Element::builder("value", NS_DATA).append(value.clone()).build());
        }
        builder = builder.append(field.build());
    }
    builder.build()
}

// ---------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------

/// One item inside an `<items/>` event.
#[derive(Debug, Clone)]
pub struct EventItem {
    /// Item id.
    pub id: Option<String>,
    /// Payload fragments (empty when `deliver_payloads` is off).
    pub payload: Vec<Element>,
    /// Publisher attribute, when exposed.
    pub publisher: Option<String>,
}

/// Build the `<items/>` payload of a publish event.
pub fn event_items(node: &str, items: &[EventItem]) -> Element {
    let mut builder = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node);
    for item in items {
        let mut item_builder = Element::builder("item", NS_PUBSUB_EVENT);
        if let Some(ref id) = item.id {
            item_builder = item_builder.attr("id", id.as_str());
        }
        if let Some(ref publisher) = item.publisher {
            item_builder = item_builder.attr("publisher", publisher.as_str());
        }
        for fragment in &item.payload {
            item_builder = item_builder.append(fragment.clone());
        }
        builder = builder.append(item_builder.build());
    }
    builder.build()
}

/// Build the `<items/>` payload of a retract event.
pub fn event_retract(node: &str, item_ids: &[String]) -> Element {
    let mut builder = Element::builder("items", NS_PUBSUB_EVENT).attr("node", node);
    for id in item_ids {
        builder = builder.append(
            Element::builder("retract", NS_PUBSUB_EVENT)
                .attr("id", id.as_str())
                .build(),
        );
    }
    builder.build()
}

/// Build the `<create/>` payload of a node-creation event.
pub fn event_create(node: &str) -> Element {
    Element::builder("create", NS_PUBSUB_EVENT)
        .attr("node", node)
        .build()
}

/// Build the `<delete/>` payload of a node-deletion event.
pub fn event_delete(node: &str) -> Element {
    Element::builder("delete", NS_PUBSUB_EVENT)
        .attr("node", node)
        .build()
}

/// Build the `<purge/>` payload of a purge event.
pub fn event_purge(node: &str) -> Element {
    Element::builder("purge", NS_PUBSUB_EVENT)
        .attr("node", node)
        .build()
}

/// Build the `<configuration/>` payload of a configuration event.
pub fn event_configuration(node: &str, fields: Option<&[(String, Vec<String>)]>) -> Element {
    let mut builder = Element::builder("configuration", NS_PUBSUB_EVENT).attr("node", node);
    if let Some(fields) = fields {
        builder = builder.append(build_form("result", fields));
    }
    builder.build()
}

/// Build the `<subscription/>` payload of a subscription-change event.
///
/// The attribute is spelled correctly; `compat_misspelled` additionally
/// emits the historical misspelling for peers that depend on it.
pub fn event_subscription(
    node: &str,
    jid: &str,
    state: &str,
    subid: Option<&str>,
    compat_misspelled: bool,
) -> Element {
    let mut builder = Element::builder("subscription", NS_PUBSUB_EVENT)
        .attr("node", node)
        .attr("jid", jid)
        .attr("subscription", state);
    if compat_misspelled {
        builder = builder.attr("subsription", state);
    }
    if let Some(subid) = subid {
        builder = builder.attr("subid", subid);
    }
    builder.build()
}

/// Addressing and headers of an event notification.
#[derive(Debug, Clone)]
pub struct EventEnvelope<'a> {
    /// Sender: the service JID, or the publisher's bare JID for PEP.
    pub from: &'a str,
    /// Recipient bare JID (or full JID for presence-targeted sends).
    pub to: &'a str,
    /// Message type attribute.
    pub message_type: &'a str,
    /// SHIM `SubId` headers, one per matching subscription.
    pub subids: &'a [String],
    /// SHIM `Collection` header, set when the event was routed through
    /// an ancestor collection.
    pub collection: Option<&'a str>,
    /// XEP-0033 `replyto` address (full publisher JID, PEP only).
    pub replyto: Option<&'a str>,
}

/// Wrap an event payload into a notification message.
pub fn wrap_event(envelope: &EventEnvelope<'_>, payload: Element) -> Element {
    let mut builder = Element::builder("message", JABBER_CLIENT)
        .attr("from", envelope.from)
        .attr("to", envelope.to)
        .attr("type", envelope.message_type)
        .append(
            Element::builder("event", NS_PUBSUB_EVENT)
                .append(payload)
                .build(),
        );

    if envelope.collection.is_some() || !envelope.subids.is_empty() {
        let mut headers = Element::builder("headers", NS_SHIM);
        if let Some(collection) = envelope.collection {
            headers = headers.append(
                Element::builder("header", NS_SHIM)
                    .attr("name", "Collection")
                    .append(collection.to_string())
                    .build(),
            );
        }
        for subid in envelope.subids {
            headers = headers.append(
                Element::builder("header", NS_SHIM)
                    .attr("name", "SubId")
                    .append(subid.clone())
                    .build(),
            );
        }
        builder = builder.append(headers.build());
    }

    if let Some(replyto) = envelope.replyto {
        builder = builder.append(
            Element::builder("addresses", NS_ADDRESS)
                .append(
                    Element::builder("address", NS_ADDRESS)
                        .attr("type", "replyto")
                        .attr("jid", replyto)
                        .build(),
                )
                .build(),
        );
    }

    builder.build()
}

// ---------------------------------------------------------------------
// IQ responses
// ---------------------------------------------------------------------

fn result_iq(original: &Iq, payload: Option<Element>) -> Iq {
    Iq {
        from: original.to.clone(),
        to: original.from.clone(),
        id: original.id.clone(),
        payload: IqType::Result(payload),
    }
}

/// Empty success result.
pub fn build_success(original: &Iq) -> Iq {
    result_iq(original, None)
}

/// Result for a publish request.
pub fn build_publish_result(original: &Iq, node: &str, item_id: &str) -> Iq {
    let pubsub = Element::builder("pubsub", NS_PUBSUB)
        .append(
            Element::builder("publish", NS_PUBSUB)
                .attr("node", node)
                .append(
                    Element::builder("item", NS_PUBSUB)
                        .attr("id", item_id)
                        .build(),
                )
                .build(),
        )
        .build();
    result_iq(original, Some(pubsub))
}

/// Result for an items request.
pub fn build_items_result(original: &Iq, node: &str, items: &[EventItem]) -> Iq {
    let mut items_elem = Element::builder("items", NS_PUBSUB).attr("node", node);
    for item in items {
        let mut item_builder = Element::builder("item", NS_PUBSUB);
        if let Some(ref id) = item.id {
            item_builder = item_builder.attr("id", id.as_str());
        }
        for fragment in &item.payload {
            item_builder = item_builder.append(fragment.clone());
        }
        items_elem = items_elem.append(item_builder.build());
    }
    let pubsub = Element::builder("pubsub", NS_PUBSUB)
        .append(items_elem.build())
        .build();
    result_iq(original, Some(pubsub))
}

/// Result for a subscribe request.
pub fn build_subscription_result(
    original: &Iq,
    node: &str,
    jid: &str,
    state: &str,
    subid: Option<&str>,
) -> Iq {
    let mut sub = Element::builder("subscription", NS_PUBSUB)
        .attr("node", node)
        .attr("jid", jid)
        .attr("subscription", state);
    if let Some(subid) = subid {
        sub = sub.attr("subid", subid);
    }
    let pubsub = Element::builder("pubsub", NS_PUBSUB).append(sub.build()).build();
    result_iq(original, Some(pubsub))
}

/// Result for a create request.
pub fn build_create_result(original: &Iq, node: &str) -> Iq {
    let pubsub = Element::builder("pubsub", NS_PUBSUB)
        .append(Element::builder("create", NS_PUBSUB).attr("node", node).build())
        .build();
    result_iq(original, Some(pubsub))
}

/// Result for a configuration retrieval.
pub fn build_configure_result(original: &Iq, node: &str, fields: &[(String, Vec<String>)]) -> Iq {
    let pubsub = Element::builder("pubsub", NS_PUBSUB_OWNER)
        .append(
            Element::builder("configure", NS_PUBSUB_OWNER)
                .attr("node", node)
                .append(build_form("form", fields))
                .build(),
        )
        .build();
    result_iq(original, Some(pubsub))
}

/// Result for an affiliations retrieval.
pub fn build_affiliations_result(
    original: &Iq,
    node: Option<&str>,
    owner: bool,
    entries: &[(String, &'static str, String)],
) -> Iq {
    let ns = if owner { NS_PUBSUB_OWNER } else { NS_PUBSUB };
    let mut affs = Element::builder("affiliations", ns);
    if let Some(node) = node {
        affs = affs.attr("node", node);
    }
    for (jid_or_node, affiliation, _) in entries {
        let attr_name = if owner { "jid" } else { "node" };
        affs = affs.append(
            Element::builder("affiliation", ns)
                .attr(attr_name, jid_or_node.as_str())
                .attr("affiliation", *affiliation)
                .build(),
        );
    }
    let pubsub = Element::builder("pubsub", ns).append(affs.build()).build();
    result_iq(original, Some(pubsub))
}

/// Result for a subscriptions retrieval.
pub fn build_subscriptions_result(
    original: &Iq,
    node: Option<&str>,
    owner: bool,
    entries: &[(String, String, &'static str, String)],
) -> Iq {
    let ns = if owner { NS_PUBSUB_OWNER } else { NS_PUBSUB };
    let mut subs = Element::builder("subscriptions", ns);
    if let Some(node) = node {
        subs = subs.attr("node", node);
    }
    for (jid, node_path, state, subid) in entries {
        let mut sub = Element::builder("subscription", ns)
            .attr("jid", jid.as_str())
            .attr("subscription", *state)
            .attr("subid", subid.as_str());
        if !owner {
            sub = sub.attr("node", node_path.as_str());
        }
        subs = subs.append(sub.build());
    }
    let pubsub = Element::builder("pubsub", ns).append(subs.build()).build();
    result_iq(original, Some(pubsub))
}

/// Map an [`XmppError`] onto an error IQ.
pub fn build_error_iq(original: &Iq, error: &XmppError) -> Iq {
    Iq {
        from: original.to.clone(),
        to: original.from.clone(),
        id: original.id.clone(),
        payload: IqType::Error(stanza_error_of(error)),
    }
}

fn stanza_error_of(error: &XmppError) -> StanzaError {
    let (condition, error_type, text, unsupported) = match error {
        XmppError::Stanza {
            condition,
            error_type,
            text,
            unsupported_feature,
        } => (
            *condition,
            *error_type,
            text.clone().unwrap_or_default(),
            unsupported_feature.clone(),
        ),
        other => (
            StanzaErrorCondition::InternalServerError,
            StanzaErrorType::Wait,
            other.to_string(),
            None,
        ),
    };

    let type_ = match error_type {
        StanzaErrorType::Auth => ErrorType::Auth,
        StanzaErrorType::Cancel => ErrorType::Cancel,
        StanzaErrorType::Modify => ErrorType::Modify,
        StanzaErrorType::Wait => ErrorType::Wait,
    };

    let defined = match condition {
        StanzaErrorCondition::BadRequest => DefinedCondition::BadRequest,
        StanzaErrorCondition::Conflict => DefinedCondition::Conflict,
        StanzaErrorCondition::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
        StanzaErrorCondition::Forbidden => DefinedCondition::Forbidden,
        StanzaErrorCondition::InternalServerError => DefinedCondition::InternalServerError,
        StanzaErrorCondition::ItemNotFound => DefinedCondition::ItemNotFound,
        StanzaErrorCondition::JidMalformed => DefinedCondition::JidMalformed,
        StanzaErrorCondition::NotAcceptable => DefinedCondition::NotAcceptable,
        StanzaErrorCondition::NotAllowed => DefinedCondition::NotAllowed,
        StanzaErrorCondition::NotAuthorized => DefinedCondition::NotAuthorized,
        StanzaErrorCondition::PolicyViolation => DefinedCondition::PolicyViolation,
        StanzaErrorCondition::RemoteServerNotFound => DefinedCondition::RemoteServerNotFound,
        StanzaErrorCondition::RemoteServerTimeout => DefinedCondition::RemoteServerTimeout,
        StanzaErrorCondition::ResourceConstraint => DefinedCondition::ResourceConstraint,
        StanzaErrorCondition::ServiceUnavailable => DefinedCondition::ServiceUnavailable,
        StanzaErrorCondition::UndefinedCondition => DefinedCondition::UndefinedCondition,
        StanzaErrorCondition::UnexpectedRequest => DefinedCondition::UnexpectedRequest,
    };

    let mut stanza_error = StanzaError::new(type_, defined, "en", text);
    if let Some(feature) = unsupported {
        stanza_error.other = Some(
            Element::builder("unsupported", crate::error::NS_PUBSUB_ERRORS)
                .attr("feature", feature)
                .build(),
        );
    }
    stanza_error
}

// ---------------------------------------------------------------------
// Authorization workflow (XEP-0060 §8.6)
// ---------------------------------------------------------------------

/// Build the authorization request form sent to each owner of a node
/// with a pending subscription.
pub fn build_authorization_request(
    service_jid: &str,
    owner: &str,
    node: &str,
    subscriber: &str,
) -> Element {
    let fields = vec![
        (
            "FORM_TYPE".to_string(),
            vec![NS_SUB_AUTHORIZATION.to_string()],
        ),
        ("pubsub#node".to_string(), vec![node.to_string()]),
        (
            "pubsub#subscriber_jid".to_string(),
            vec![subscriber.to_string()],
        ),
        ("pubsub#allow".to_string(), vec!["false".to_string()]),
    ];

    Element::builder("message", JABBER_CLIENT)
        .attr("from", service_jid)
        .attr("to", owner)
        .append(build_form("form", &fields))
        .build()
}

/// A parsed authorization decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    /// The node path.
    pub node: String,
    /// The subscriber the decision concerns.
    pub subscriber: String,
    /// Whether the subscription was approved.
    pub allow: bool,
}

/// Parse a submitted authorization form, if that is what the element
/// carries.
pub fn parse_authorization_submit(form: &Element) -> Option<AuthorizationDecision> {
    if form.name() != "x" || form.ns() != NS_DATA {
        return None;
    }
    let fields = parse_form(form);
    let value = |var: &str| -> Option<String> {
        fields
            .iter()
            .find(|(v, _)| v == var)
            .and_then(|(_, values)| values.first().cloned())
    };

    if value("FORM_TYPE")? != NS_SUB_AUTHORIZATION {
        return None;
    }
    let allow = matches!(value("pubsub#allow")?.as_str(), "1" | "true");
    Some(AuthorizationDecision {
        node: value("pubsub#node")?,
        subscriber: value("pubsub#subscriber_jid")?,
        allow,
    })
}
