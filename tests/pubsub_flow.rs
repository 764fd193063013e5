//! Pub/sub end-to-end flows: create/subscribe/publish/notify, the
//! whitelist authorization workflow, retention and eviction, access
//! gates, PEP presence-driven delivery, and offline purging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;

use rookery_xmpp::config::{PubSubConfig, PubSubConfigHandle};
use rookery_xmpp::presence::{PresenceDirectory, ShowState};
use rookery_xmpp::pubsub::{
    Host, MemoryNodeStore, PubSubService, SubState, NS_PUBSUB_EVENT, NS_SHIM,
};
use rookery_xmpp::router_channel;

/// Scriptable presence/roster directory.
#[derive(Default)]
struct TestPresence {
    inner: Mutex<TestPresenceState>,
}

#[derive(Default)]
struct TestPresenceState {
    /// `(owner, contact)` pairs with a presence subscription.
    subscriptions: Vec<(BareJid, BareJid)>,
    /// Roster groups per `(owner, contact)`.
    groups: HashMap<(BareJid, BareJid), Vec<String>>,
    /// Available resources per bare JID.
    online: HashMap<BareJid, Vec<(String, ShowState)>>,
}

impl TestPresence {
    fn subscribe(&self, owner: &str, contact: &str) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .push((jid(owner), jid(contact)));
    }

    fn set_groups(&self, owner: &str, contact: &str, groups: &[&str]) {
        self.inner.lock().unwrap().groups.insert(
            (jid(owner), jid(contact)),
            groups.iter().map(|g| g.to_string()).collect(),
        );
    }

    fn set_online(&self, who: &str, resources: &[(&str, ShowState)]) {
        self.inner.lock().unwrap().online.insert(
            jid(who),
            resources
                .iter()
                .map(|(r, s)| (r.to_string(), *s))
                .collect(),
        );
    }

    fn set_offline(&self, who: &str) {
        self.inner.lock().unwrap().online.remove(&jid(who));
    }
}

impl PresenceDirectory for TestPresence {
    fn has_presence_subscription(&self, owner: &BareJid, contact: &BareJid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .any(|(o, c)| o == owner && c == contact)
    }

    fn roster_groups(&self, owner: &BareJid, contact: &BareJid) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .groups
            .get(&(owner.clone(), contact.clone()))
            .cloned()
            .unwrap_or_default()
    }

    fn available_resources(&self, jid: &BareJid) -> Vec<(String, ShowState)> {
        self.inner
            .lock()
            .unwrap()
            .online
            .get(jid)
            .cloned()
            .unwrap_or_default()
    }
}

fn jid(s: &str) -> BareJid {
    s.parse().expect("valid bare jid")
}

fn full(s: &str) -> FullJid {
    s.parse().expect("valid full jid")
}

fn any(s: &str) -> Jid {
    s.parse().expect("valid jid")
}

fn payload(text: &str) -> Vec<Element> {
    vec![Element::builder("entry", "urn:example:blog")
        .append(text.to_string())
        .build()]
}

struct Fixture {
    service: PubSubService<TestPresence>,
    presence: Arc<TestPresence>,
    rx: mpsc::UnboundedReceiver<Element>,
}

fn fixture(host: Host) -> Fixture {
    fixture_with_config(host, PubSubConfig::default())
}

fn fixture_with_config(host: Host, config: PubSubConfig) -> Fixture {
    let (router, rx) = router_channel();
    let presence = Arc::new(TestPresence::default());
    let service = PubSubService::new(
        host,
        PubSubConfigHandle::new(config),
        Arc::new(MemoryNodeStore::new()),
        router,
        Arc::clone(&presence),
    );
    Fixture {
        service,
        presence,
        rx,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Element>) -> Vec<Element> {
    let mut out = Vec::new();
    while let Ok(elem) = rx.try_recv() {
        out.push(elem);
    }
    out
}

fn field(var: &str, value: &str) -> (String, Vec<String>) {
    (var.to_string(), vec![value.to_string()])
}

#[test]
fn test_create_subscribe_publish_notify() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    fx.presence
        .set_online("sub@b.example", &[("home", ShowState::Online)]);

    fx.service
        .create_node("/tests", &jid("owner@a.example"), None, &[])
        .unwrap();
    drain(&mut fx.rx);

    let outcome = fx
        .service
        .subscribe_node("/tests", &any("sub@b.example/home"), "sub@b.example", None)
        .unwrap();
    assert_eq!(outcome.state, SubState::Subscribed);
    assert!(!outcome.subid.is_empty());
    drain(&mut fx.rx);

    let published = fx
        .service
        .publish_item(
            "/tests",
            &any("owner@a.example/desk"),
            Some("x1"),
            payload("first post"),
        )
        .unwrap();
    assert_eq!(published.item_id, "x1");
    assert!(published.evicted.is_empty());

    let messages = drain(&mut fx.rx);
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.attr("to"), Some("sub@b.example"));
    assert_eq!(message.attr("type"), Some("headline"));
    assert_eq!(message.attr("from"), Some("pubsub.a.example"));

    let event = message.get_child("event", NS_PUBSUB_EVENT).expect("event");
    let items = event.get_child("items", NS_PUBSUB_EVENT).expect("items");
    assert_eq!(items.attr("node"), Some("/tests"));
    let item = items.children().next().expect("item");
    assert_eq!(item.attr("id"), Some("x1"));
    assert!(item.children().next().is_some(), "payload delivered");
}

#[test]
fn test_publish_then_retrieve_and_eviction() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));

    fx.service
        .create_node(
            "/bounded",
            &jid("owner@a.example"),
            None,
            &[field("pubsub#max_items", "2")],
        )
        .unwrap();

    let owner = any("owner@a.example/desk");
    fx.service
        .publish_item("/bounded", &owner, Some("i1"), payload("one"))
        .unwrap();
    fx.service
        .publish_item("/bounded", &owner, Some("i2"), payload("two"))
        .unwrap();

    // Publish-then-retrieve: the latest item is among the newest k.
    let items = fx
        .service
        .get_items("/bounded", &owner, None, &[])
        .unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["i2", "i1"]);

    // The (k+1)-th publish evicts the first item.
    let third = fx
        .service
        .publish_item("/bounded", &owner, Some("i3"), payload("three"))
        .unwrap();
    assert_eq!(third.evicted, vec!["i1".to_string()]);

    let items = fx
        .service
        .get_items("/bounded", &owner, None, &[])
        .unwrap();
    let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["i3", "i2"]);

    drain(&mut fx.rx);
}

#[test]
fn test_whitelist_authorization_workflow() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    fx.presence
        .set_online("stranger@b.example", &[("home", ShowState::Online)]);

    fx.service
        .create_node(
            "/private",
            &jid("owner@a.example"),
            None,
            &[field("pubsub#access_model", "whitelist")],
        )
        .unwrap();
    drain(&mut fx.rx);

    // Unknown JID ends up pending and each owner receives a form.
    let outcome = fx
        .service
        .subscribe_node(
            "/private",
            &any("stranger@b.example/home"),
            "stranger@b.example",
            None,
        )
        .unwrap();
    assert_eq!(outcome.state, SubState::Pending);

    let messages = drain(&mut fx.rx);
    assert_eq!(messages.len(), 1);
    let form_message = &messages[0];
    assert_eq!(form_message.attr("to"), Some("owner@a.example"));
    let form = form_message
        .get_child("x", "jabber:x:data")
        .expect("authorization form");
    let form_xml = String::from_utf8(
        {
            let mut out = Vec::new();
            form.write_to(&mut out).unwrap();
            out
        },
    )
    .unwrap();
    assert!(form_xml.contains("pubsub#subscriber_jid"));
    assert!(form_xml.contains("stranger@b.example"));

    // The owner flips allow to true and submits.
    let fields = vec![
        field(
            "FORM_TYPE",
            "http://jabber.org/protocol/pubsub#subscribe_authorization",
        ),
        field("pubsub#node", "/private"),
        field("pubsub#subscriber_jid", "stranger@b.example"),
        field("pubsub#allow", "true"),
    ];
    let submit = rookery_xmpp::pubsub::stanzas::build_form("submit", &fields);
    let consumed = fx.service.handle_authorization_message(
        &any("owner@a.example/desk"),
        &Element::builder("message", "jabber:client").append(submit).build(),
    );
    assert!(consumed);

    // The subject learns it is now subscribed.
    let messages = drain(&mut fx.rx);
    let notification = messages
        .iter()
        .find(|m| m.attr("to") == Some("stranger@b.example"))
        .expect("subject notification");
    let event = notification
        .get_child("event", NS_PUBSUB_EVENT)
        .expect("event");
    let subscription = event
        .get_child("subscription", NS_PUBSUB_EVENT)
        .expect("subscription");
    assert_eq!(subscription.attr("subscription"), Some("subscribed"));

    let subs = fx
        .service
        .get_subscriptions(&jid("stranger@b.example"))
        .unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].1, SubState::Subscribed);
}

#[test]
fn test_access_gates() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    let owner = jid("owner@a.example");

    for (path, model) in [
        ("/open", "open"),
        ("/presence", "presence"),
        ("/roster", "roster"),
        ("/authorize", "authorize"),
    ] {
        fx.service
            .create_node(path, &owner, None, &[field("pubsub#access_model", model)])
            .unwrap();
    }
    fx.service
        .configure_node(
            "/roster",
            &owner,
            &[(
                "pubsub#roster_groups_allowed".to_string(),
                vec!["friends".to_string()],
            )],
        )
        .unwrap();
    drain(&mut fx.rx);

    let requester = any("guest@b.example/home");

    // open: always allowed.
    let outcome = fx
        .service
        .subscribe_node("/open", &requester, "guest@b.example", None)
        .unwrap();
    assert_eq!(outcome.state, SubState::Subscribed);

    // presence: refused without a presence subscription from an owner.
    assert!(fx
        .service
        .subscribe_node("/presence", &requester, "guest@b.example", None)
        .is_err());
    fx.presence.subscribe("owner@a.example", "guest@b.example");
    let outcome = fx
        .service
        .subscribe_node("/presence", &requester, "guest@b.example", None)
        .unwrap();
    assert_eq!(outcome.state, SubState::Subscribed);

    // roster: presence plus membership in an allowed group.
    assert!(fx
        .service
        .subscribe_node("/roster", &requester, "guest@b.example", None)
        .is_err());
    fx.presence
        .set_groups("owner@a.example", "guest@b.example", &["friends"]);
    let outcome = fx
        .service
        .subscribe_node("/roster", &requester, "guest@b.example", None)
        .unwrap();
    assert_eq!(outcome.state, SubState::Subscribed);

    // authorize: always pending.
    let outcome = fx
        .service
        .subscribe_node("/authorize", &requester, "guest@b.example", None)
        .unwrap();
    assert_eq!(outcome.state, SubState::Pending);

    drain(&mut fx.rx);
}

#[test]
fn test_broadcast_delivery_filters() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    let owner = jid("owner@a.example");
    fx.presence
        .set_online("muted@b.example", &[("home", ShowState::Online)]);
    fx.presence
        .set_online("busy@b.example", &[("home", ShowState::Dnd)]);
    fx.presence
        .set_online("keen@b.example", &[("home", ShowState::Online)]);

    fx.service.create_node("/filtered", &owner, None, &[]).unwrap();

    // deliver=false mutes the subscription entirely.
    fx.service
        .subscribe_node(
            "/filtered",
            &any("muted@b.example/home"),
            "muted@b.example",
            Some(&[field("pubsub#deliver", "0")]),
        )
        .unwrap();
    // show-values=[online] excludes a dnd resource.
    fx.service
        .subscribe_node(
            "/filtered",
            &any("busy@b.example/home"),
            "busy@b.example",
            Some(&[("pubsub#show-values".to_string(), vec!["online".to_string()])]),
        )
        .unwrap();
    fx.service
        .subscribe_node(
            "/filtered",
            &any("keen@b.example/home"),
            "keen@b.example",
            None,
        )
        .unwrap();
    drain(&mut fx.rx);

    fx.service
        .publish_item(
            "/filtered",
            &any("owner@a.example/desk"),
            Some("f1"),
            payload("filtered"),
        )
        .unwrap();

    let messages = drain(&mut fx.rx);
    let targets: Vec<&str> = messages.iter().filter_map(|m| m.attr("to")).collect();
    assert_eq!(targets, vec!["keen@b.example"]);
}

#[test]
fn test_pep_presence_driven_last_item() {
    let mut fx = fixture(Host::Account(jid("alice@a.example")));
    fx.presence
        .set_online("alice@a.example", &[("desk", ShowState::Online)]);
    fx.presence.subscribe("alice@a.example", "bob@b.example");

    // Auto-created PEP node; defaults give on_sub_and_presence.
    fx.service
        .publish_item(
            "urn:example:mood",
            &any("alice@a.example/desk"),
            Some("latest"),
            payload("cheerful"),
        )
        .unwrap();
    drain(&mut fx.rx);

    // Bob's resource comes online: the last item arrives exactly once.
    fx.presence
        .set_online("bob@b.example", &[("phone", ShowState::Online)]);
    fx.service.presence_available(&full("bob@b.example/phone"));

    let messages = drain(&mut fx.rx);
    assert_eq!(messages.len(), 1);
    let message = &messages[0];
    assert_eq!(message.attr("to"), Some("bob@b.example/phone"));
    let event = message.get_child("event", NS_PUBSUB_EVENT).expect("event");
    let items = event.get_child("items", NS_PUBSUB_EVENT).expect("items");
    let item = items.children().next().expect("item");
    assert_eq!(item.attr("id"), Some("latest"));

    // The same resource does not get it twice.
    fx.service.presence_available(&full("bob@b.example/phone"));
    assert!(drain(&mut fx.rx).is_empty());

    // After going offline and back online, it is sent again.
    fx.service.presence_unavailable(&full("bob@b.example/phone"));
    fx.service.presence_available(&full("bob@b.example/phone"));
    assert_eq!(drain(&mut fx.rx).len(), 1);
}

#[test]
fn test_pep_publish_from_offline_is_refused() {
    let fx = fixture(Host::Account(jid("alice@a.example")));

    let result = fx.service.publish_item(
        "urn:example:mood",
        &any("alice@a.example/desk"),
        None,
        payload("ghost"),
    );
    assert!(result.is_err());
}

#[test]
fn test_purge_offline_retracts_published_items() {
    let mut fx = fixture(Host::Account(jid("alice@a.example")));
    fx.presence
        .set_online("alice@a.example", &[("desk", ShowState::Online)]);
    fx.presence.subscribe("alice@a.example", "bob@b.example");
    fx.presence
        .set_online("bob@b.example", &[("phone", ShowState::Online)]);

    fx.service
        .publish_item(
            "urn:example:notes",
            &any("alice@a.example/desk"),
            Some("n1"),
            payload("draft"),
        )
        .unwrap();
    fx.service
        .configure_node(
            "urn:example:notes",
            &jid("alice@a.example"),
            &[
                field("pubsub#purge_offline", "1"),
                field("pubsub#notify_retract", "1"),
            ],
        )
        .unwrap();
    fx.service
        .subscribe_node(
            "urn:example:notes",
            &any("bob@b.example/phone"),
            "bob@b.example",
            None,
        )
        .unwrap();
    drain(&mut fx.rx);

    // Alice's last resource disconnects.
    fx.presence.set_offline("alice@a.example");
    fx.service
        .presence_unavailable(&full("alice@a.example/desk"));

    let messages = drain(&mut fx.rx);
    let retract = messages
        .iter()
        .find_map(|m| {
            m.get_child("event", NS_PUBSUB_EVENT)
                .and_then(|e| e.get_child("items", NS_PUBSUB_EVENT))
                .filter(|items| items.children().any(|c| c.name() == "retract"))
        })
        .expect("retract notification");
    let retracted = retract
        .children()
        .find(|c| c.name() == "retract")
        .expect("retract entry");
    assert_eq!(retracted.attr("id"), Some("n1"));

    // The items are gone.
    let items = fx
        .service
        .get_items("urn:example:notes", &any("alice@a.example"), None, &[])
        .unwrap();
    assert!(items.is_empty());
}

#[test]
fn test_eviction_broadcasts_retract_and_subids_merge() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    fx.presence
        .set_online("sub@b.example", &[("home", ShowState::Online)]);

    fx.service
        .create_node(
            "/ring",
            &jid("owner@a.example"),
            None,
            &[field("pubsub#max_items", "1")],
        )
        .unwrap();
    fx.service
        .subscribe_node("/ring", &any("sub@b.example/home"), "sub@b.example", None)
        .unwrap();
    drain(&mut fx.rx);

    let owner = any("owner@a.example/desk");
    fx.service
        .publish_item("/ring", &owner, Some("r1"), payload("one"))
        .unwrap();
    drain(&mut fx.rx);

    fx.service
        .publish_item("/ring", &owner, Some("r2"), payload("two"))
        .unwrap();

    let messages = drain(&mut fx.rx);
    // One publish notification and one retract notification.
    assert_eq!(messages.len(), 2);
    let has_retract = messages.iter().any(|m| {
        m.get_child("event", NS_PUBSUB_EVENT)
            .and_then(|e| e.get_child("items", NS_PUBSUB_EVENT))
            .map(|items| items.children().any(|c| c.name() == "retract"))
            .unwrap_or(false)
    });
    assert!(has_retract, "eviction must broadcast a retract");

    // The publish notification carries the SubId SHIM header.
    let publish_message = messages
        .iter()
        .find(|m| {
            m.get_child("event", NS_PUBSUB_EVENT)
                .and_then(|e| e.get_child("items", NS_PUBSUB_EVENT))
                .map(|items| items.children().any(|c| c.name() == "item"))
                .unwrap_or(false)
        })
        .expect("publish notification");
    let headers = publish_message
        .get_child("headers", NS_SHIM)
        .expect("SHIM headers");
    assert!(headers
        .children()
        .any(|h| h.attr("name") == Some("SubId")));
}

#[test]
fn test_owner_management_and_last_owner_protection() {
    let fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    let owner = jid("owner@a.example");

    fx.service.create_node("/team", &owner, None, &[]).unwrap();

    // Non-owners may not reconfigure.
    assert!(fx
        .service
        .configure_node("/team", &jid("random@b.example"), &[])
        .is_err());

    // Promote a second owner, then drop the first.
    fx.service
        .set_affiliations(
            "/team",
            &owner,
            &[("helper@a.example".to_string(), "owner".to_string())],
        )
        .unwrap();
    fx.service
        .set_affiliations(
            "/team",
            &owner,
            &[("owner@a.example".to_string(), "none".to_string())],
        )
        .unwrap();

    // The remaining owner cannot be removed.
    let err = fx.service.set_affiliations(
        "/team",
        &jid("helper@a.example"),
        &[("helper@a.example".to_string(), "none".to_string())],
    );
    assert!(err.is_err());

    // Demoting the sole owner out of the owner set is removal too.
    for demoted in ["member", "publisher", "outcast"] {
        let err = fx.service.set_affiliations(
            "/team",
            &jid("helper@a.example"),
            &[("helper@a.example".to_string(), demoted.to_string())],
        );
        assert!(err.is_err(), "demotion to {} must be refused", demoted);
    }
    // The node is still configurable by its owner afterwards.
    fx.service
        .configure_node("/team", &jid("helper@a.example"), &[])
        .unwrap();

    // Outcasts cannot subscribe.
    fx.service
        .set_affiliations(
            "/team",
            &jid("helper@a.example"),
            &[("banned@b.example".to_string(), "outcast".to_string())],
        )
        .unwrap();
    assert!(fx
        .service
        .subscribe_node("/team", &any("banned@b.example/x"), "banned@b.example", None)
        .is_err());
}

#[test]
fn test_set_subscriptions_commits_entries_before_a_failure() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    let owner = jid("owner@a.example");

    fx.service.create_node("/batch", &owner, None, &[]).unwrap();
    drain(&mut fx.rx);

    // The second entry carries an invalid state; the batch stops
    // there, but the first entry stays applied.
    let err = fx.service.set_subscriptions(
        "/batch",
        &owner,
        &[
            ("pal@b.example".to_string(), "subscribed".to_string(), None),
            ("other@b.example".to_string(), "frozen".to_string(), None),
        ],
    );
    assert!(err.is_err());

    let subs = fx.service.get_node_subscriptions("/batch", &owner).unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].0, jid("pal@b.example"));
    assert_eq!(subs[0].1, SubState::Subscribed);

    // The applied entry's subject was notified before the failure.
    let messages = drain(&mut fx.rx);
    let notification = messages
        .iter()
        .find(|m| m.attr("to") == Some("pal@b.example"))
        .expect("subject notification");
    let event = notification
        .get_child("event", NS_PUBSUB_EVENT)
        .expect("event");
    let subscription = event
        .get_child("subscription", NS_PUBSUB_EVENT)
        .expect("subscription");
    assert_eq!(subscription.attr("subscription"), Some("subscribed"));
}

#[test]
fn test_collection_depth_zero_excludes_descendants() {
    let mut fx = fixture(Host::Domain("pubsub.a.example".to_string()));
    let owner = jid("owner@a.example");
    fx.presence
        .set_online("watcher@b.example", &[("home", ShowState::Online)]);

    fx.service.create_node("/col", &owner, None, &[]).unwrap();
    fx.service
        .create_node(
            "/col/leaf",
            &owner,
            None,
            &[("pubsub#collection".to_string(), vec!["/col".to_string()])],
        )
        .unwrap();

    fx.service
        .subscribe_node(
            "/col",
            &any("watcher@b.example/home"),
            "watcher@b.example",
            Some(&[field("pubsub#subscription_depth", "0")]),
        )
        .unwrap();
    drain(&mut fx.rx);

    // Publishing into the leaf is one level below the subscription.
    fx.service
        .publish_item(
            "/col/leaf",
            &any("owner@a.example/desk"),
            Some("deep"),
            payload("below"),
        )
        .unwrap();
    assert!(drain(&mut fx.rx).is_empty(), "depth 0 excludes descendants");

    // Direct publishes on the collection node itself still arrive.
    fx.service
        .publish_item(
            "/col",
            &any("owner@a.example/desk"),
            Some("direct"),
            payload("here"),
        )
        .unwrap();
    assert_eq!(drain(&mut fx.rx).len(), 1);
}

#[test]
fn test_pep_sender_is_publisher_with_replyto() {
    let mut fx = fixture(Host::Account(jid("alice@a.example")));
    fx.presence
        .set_online("alice@a.example", &[("desk", ShowState::Online)]);
    fx.presence.subscribe("alice@a.example", "bob@b.example");
    fx.presence
        .set_online("bob@b.example", &[("phone", ShowState::Online)]);

    fx.service
        .publish_item(
            "urn:example:mood",
            &any("alice@a.example/desk"),
            Some("m1"),
            payload("sunny"),
        )
        .unwrap();
    drain(&mut fx.rx);

    fx.service
        .subscribe_node(
            "urn:example:mood",
            &any("bob@b.example/phone"),
            "bob@b.example",
            None,
        )
        .unwrap();
    drain(&mut fx.rx);

    fx.service
        .publish_item(
            "urn:example:mood",
            &any("alice@a.example/desk"),
            Some("m2"),
            payload("stormy"),
        )
        .unwrap();

    let messages = drain(&mut fx.rx);
    let notification = messages
        .iter()
        .find(|m| m.attr("to") == Some("bob@b.example"))
        .expect("notification");
    assert_eq!(notification.attr("from"), Some("alice@a.example"));

    let addresses = notification
        .get_child("addresses", "http://jabber.org/protocol/address")
        .expect("replyto addresses");
    let address = addresses.children().next().expect("address");
    assert_eq!(address.attr("jid"), Some("alice@a.example/desk"));
}
