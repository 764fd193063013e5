//! Process-wide configuration for the federation layer.
//!
//! Loading these structs from a config file is the embedding server's
//! concern; here they are plain data with defaults matching deployed
//! behavior. Per-host pub/sub configuration is published through an
//! atomic `Arc` swap so a reload never tears a running broadcast.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// STARTTLS policy for outgoing S2S streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartTlsPolicy {
    /// Never negotiate TLS; dialback over plaintext only.
    Disabled,
    /// Use TLS when the peer offers it.
    #[default]
    Optional,
    /// Refuse to relay stanzas over a plaintext stream.
    Required,
}

impl StartTlsPolicy {
    /// Whether this policy permits a STARTTLS attempt at all.
    pub fn allows_tls(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Address family preference for outbound connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4 (A records)
    V4,
    /// IPv6 (AAAA records)
    V6,
}

/// DNS resolution options (`s2s_dns_options`).
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Per-query timeout.
    pub timeout: Duration,
    /// Number of attempts per query.
    pub attempts: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 2,
        }
    }
}

/// Outbound connect options (`outgoing_s2s_options` and friends).
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Address families tried in order.
    pub family_order: Vec<AddressFamily>,
    /// TCP connect timeout per candidate address.
    pub connect_timeout: Duration,
    /// Local address to bind outgoing sockets to, if any.
    pub local_address: Option<IpAddr>,
    /// Port used when no SRV record exists.
    pub default_port: u16,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            family_order: vec![AddressFamily::V4, AddressFamily::V6],
            connect_timeout: Duration::from_secs(10),
            local_address: None,
            default_port: 5269,
        }
    }
}

/// Configuration for the outgoing S2S subsystem.
#[derive(Debug, Clone)]
pub struct S2sConfig {
    /// STARTTLS policy (`s2s_use_starttls`).
    pub use_starttls: StartTlsPolicy,
    /// Default certificate for SASL EXTERNAL (`s2s_certfile`).
    pub certfile: Option<PathBuf>,
    /// Per-domain certificate override (`domain_certfile`).
    pub domain_certfile: HashMap<String, PathBuf>,
    /// Connect options.
    pub connect: ConnectConfig,
    /// DNS options.
    pub dns: DnsConfig,
    /// Base per-state negotiation deadline.
    pub state_timeout: Duration,
    /// Bound on a single socket send.
    pub send_timeout: Duration,
    /// Idle watchdog for established streams.
    pub idle_timeout: Duration,
    /// Cap on the retry backoff delay (`s2s_max_retry_delay`).
    pub max_retry_delay: Duration,
    /// Cap on the per-session pending queue (`max_fsm_queue`).
    pub max_queue: usize,
}

impl Default for S2sConfig {
    fn default() -> Self {
        Self {
            use_starttls: StartTlsPolicy::Optional,
            certfile: None,
            domain_certfile: HashMap::new(),
            connect: ConnectConfig::default(),
            dns: DnsConfig::default(),
            state_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(600),
            max_retry_delay: Duration::from_secs(300),
            max_queue: 10_000,
        }
    }
}

impl S2sConfig {
    /// Certificate used when asserting `domain`, honouring the
    /// per-domain override table.
    pub fn certfile_for(&self, domain: &str) -> Option<&PathBuf> {
        self.domain_certfile.get(domain).or(self.certfile.as_ref())
    }

    /// Whether a certificate is available for SASL EXTERNAL as `domain`.
    pub fn can_auth_external(&self, domain: &str) -> bool {
        self.certfile_for(domain).is_some()
    }
}

/// Who may create nodes on a pub/sub service (`access_createnode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeCreationPolicy {
    /// Any local entity may create nodes.
    #[default]
    Open,
    /// Only service administrators may create nodes.
    AdminOnly,
}

/// Configuration for one pub/sub service host.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Node creation ACL.
    pub access_createnode: NodeCreationPolicy,
    /// Drop PEP publishes from accounts with no available resource.
    pub ignore_pep_from_offline: bool,
    /// Keep a RAM cache of each node's last item.
    pub last_item_cache: bool,
    /// Default `max_items` for new nodes (`max_items_node`).
    pub max_items_node: u32,
    /// PEP namespace-to-node-type mapping (`pep_mapping`).
    pub pep_mapping: HashMap<String, String>,
    /// Enabled node plugins, first entry is the default type.
    pub plugins: Vec<String>,
    /// Node tree backend name (`nodetree`).
    pub nodetree: String,
    /// Also emit the historically misspelled `subsription` attribute
    /// alongside the correct one in subscription-change notifications.
    pub compat_misspelled_sub_attr: bool,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            access_createnode: NodeCreationPolicy::Open,
            ignore_pep_from_offline: true,
            last_item_cache: false,
            max_items_node: 10,
            pep_mapping: HashMap::new(),
            plugins: vec!["flat".to_string()],
            nodetree: "tree".to_string(),
            compat_misspelled_sub_attr: false,
        }
    }
}

/// Shared handle to a host's pub/sub configuration, replaced
/// wholesale on reload.
#[derive(Clone)]
pub struct PubSubConfigHandle {
    inner: Arc<RwLock<Arc<PubSubConfig>>>,
}

impl PubSubConfigHandle {
    /// Wrap an initial configuration.
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current configuration snapshot.
    pub fn load(&self) -> Arc<PubSubConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new configuration.
    pub fn store(&self, config: PubSubConfig) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
    }
}
