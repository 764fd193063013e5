//! XEP-0163 Personal Eventing helpers.
//!
//! PEP is a pub/sub profile where the service lives on the user's own
//! bare JID. The heavy lifting (presence-driven last-item delivery,
//! offline purging, the presence access model) sits in the controller
//! with a PEP [`crate::pubsub::Host`]; this module carries the request
//! classification and the well-known node table.

use jid::BareJid;
use xmpp_parsers::iq::Iq;

use super::stanzas::is_pubsub_iq;

/// Check if an IQ is a PEP request for `user`'s own service: a pub/sub
/// IQ whose `to` is absent (implicit self) or the user's bare JID.
pub fn is_pep_request(iq: &Iq, user_jid: &BareJid) -> bool {
    if !is_pubsub_iq(iq) {
        return false;
    }
    match &iq.to {
        None => true,
        Some(to_jid) => to_jid.to_bare() == *user_jid,
    }
}

/// Well-known PEP node namespaces with special handling rules.
pub fn is_well_known_node(node: &str) -> bool {
    node == "urn:xmpp:bookmarks:1"
        || node == "urn:xmpp:avatar:data"
        || node == "urn:xmpp:avatar:metadata"
        || node == "http://jabber.org/protocol/nick"
        || node == "http://jabber.org/protocol/mood"
        || node == "http://jabber.org/protocol/activity"
        || node == "http://jabber.org/protocol/tune"
        || node == "http://jabber.org/protocol/geoloc"
        || node == "urn:xmpp:microblog:0"
        || node.starts_with("eu.siacs.conversations.axolotl")
}

/// Default access model override for well-known nodes. Bookmarks stay
/// private; OMEMO device lists must be world-readable.
pub fn default_access_model_for_node(node: &str) -> super::node::AccessModel {
    use super::node::AccessModel;

    if node == "urn:xmpp:bookmarks:1" {
        return AccessModel::Whitelist;
    }
    if node.starts_with("eu.siacs.conversations.axolotl") {
        return AccessModel::Open;
    }
    AccessModel::Presence
}
