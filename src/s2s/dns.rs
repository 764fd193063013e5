//! Address resolution for outgoing S2S connections.
//!
//! Resolution process (RFC 6120 Section 3.2):
//! 1. IDNA-encode the remote domain
//! 2. Query `_xmpp-server._tcp.{domain}` SRV records, falling back to
//!    the legacy `_jabber._tcp.{domain}` service label
//! 3. Order records by priority, weighted-random within a priority
//! 4. Resolve each target host to addresses in the configured
//!    address-family order
//! 5. With no SRV records at all, fall back to `{domain}:5269`
//!
//! A total failure yields an empty candidate list; the session then
//! enters its retry-backoff state rather than surfacing an error.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use rand::Rng;
use tracing::{debug, instrument, warn};

use crate::config::{AddressFamily, ConnectConfig, DnsConfig};

/// Default XMPP S2S port as per RFC 6120.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// An SRV target before host resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// The hostname from the SRV record.
    pub host: String,
    /// The port number.
    pub port: u16,
    /// The SRV priority (lower is tried first).
    pub priority: u16,
    /// The SRV weight (relative share within one priority).
    pub weight: u16,
}

impl SrvTarget {
    /// Create a new SRV target.
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }
}

/// Order SRV targets: priority ascending, weighted-random inside one
/// priority. Each record gets the key
/// `priority * 65536 - (weight + 1) * U` with `U` uniform in `[0, 1)`;
/// zero-weight records keep the bare `priority * 65536` key and so sort
/// after their weighted siblings.
pub fn order_srv_targets<R: Rng>(targets: Vec<SrvTarget>, rng: &mut R) -> Vec<SrvTarget> {
    let mut keyed: Vec<(f64, SrvTarget)> = targets
        .into_iter()
        .map(|t| {
            let base = t.priority as f64 * 65536.0;
            let key = if t.weight == 0 {
                base
            } else {
                base - (t.weight as f64 + 1.0) * rng.random::<f64>()
            };
            (key, t)
        })
        .collect();

    keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
    keyed.into_iter().map(|(_, t)| t).collect()
}

/// Type alias for the Tokio-based resolver.
pub type TokioResolver = Resolver<TokioConnectionProvider>;

/// DNS resolver for outgoing S2S sessions.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
    connect: ConnectConfig,
}

impl SrvResolver {
    /// Create a resolver with the given DNS and connect options.
    pub fn new(dns: &DnsConfig, connect: ConnectConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = dns.timeout;
        opts.attempts = dns.attempts;

        let resolver =
            Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver: Arc::new(resolver),
            connect,
        }
    }

    /// Resolve a remote domain to an ordered list of socket addresses.
    ///
    /// Returns an empty list when nothing resolves.
    #[instrument(skip(self), name = "s2s.dns.resolve")]
    pub async fn resolve(&self, domain: &str) -> Vec<SocketAddr> {
        // Address-literal domains need no lookup at all.
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, self.connect.default_port)];
        }

        let ascii = match idna::domain_to_ascii(domain) {
            Ok(ascii) => ascii,
            Err(e) => {
                warn!(domain = %domain, error = %e, "IDNA encoding failed");
                return Vec::new();
            }
        };

        let targets = match self.resolve_srv(&ascii).await {
            Some(records) => order_srv_targets(records, &mut rand::rng()),
            None => {
                debug!(domain = %ascii, "No SRV records, using domain fallback");
                vec![SrvTarget::new(
                    ascii.clone(),
                    self.connect.default_port,
                    0,
                    0,
                )]
            }
        };

        let mut addrs = Vec::new();
        for target in &targets {
            addrs.extend(self.resolve_host(&target.host, target.port).await);
        }

        debug!(
            domain = %ascii,
            count = addrs.len(),
            "Resolved S2S candidate addresses"
        );
        addrs
    }

    /// SRV lookup with the legacy service-label fallback. `None` means
    /// "no SRV service declared" (as opposed to a lookup error, which
    /// is treated the same way after logging).
    async fn resolve_srv(&self, domain: &str) -> Option<Vec<SrvTarget>> {
        for service in ["_xmpp-server._tcp", "_jabber._tcp"] {
            let name = format!("{}.{}", service, domain);
            match self.resolver.srv_lookup(&name).await {
                Ok(response) => {
                    let records: Vec<&SRV> = response.iter().collect();
                    let targets = process_srv_records(&records);
                    if !targets.is_empty() {
                        debug!(srv = %name, count = targets.len(), "SRV lookup succeeded");
                        return Some(targets);
                    }
                }
                Err(e) if is_no_records_error(&e) => {
                    debug!(srv = %name, "No SRV records");
                }
                Err(e) => {
                    warn!(srv = %name, error = %e, "SRV lookup failed");
                }
            }
        }
        None
    }

    /// Resolve one host to addresses in the configured family order.
    async fn resolve_host(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        // A literal address needs no lookup.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return vec![SocketAddr::new(ip, port)];
        }

        let mut addrs = Vec::new();
        for family in &self.connect.family_order {
            match family {
                AddressFamily::V4 => match self.resolver.ipv4_lookup(host).await {
                    Ok(response) => {
                        addrs.extend(
                            response
                                .iter()
                                .map(|a| SocketAddr::new(IpAddr::V4(a.0), port)),
                        );
                    }
                    Err(e) => {
                        if !is_no_records_error(&e) {
                            warn!(host = %host, error = %e, "A lookup failed");
                        }
                    }
                },
                AddressFamily::V6 => match self.resolver.ipv6_lookup(host).await {
                    Ok(response) => {
                        addrs.extend(
                            response
                                .iter()
                                .map(|a| SocketAddr::new(IpAddr::V6(a.0), port)),
                        );
                    }
                    Err(e) => {
                        if !is_no_records_error(&e) {
                            warn!(host = %host, error = %e, "AAAA lookup failed");
                        }
                    }
                },
            }
        }
        addrs
    }
}

/// Process SRV records into targets, dropping the root target "."
/// which means "no service available".
fn process_srv_records(records: &[&SRV]) -> Vec<SrvTarget> {
    records
        .iter()
        .filter_map(|srv| {
            let target = srv.target().to_utf8();
            if target == "." || target.is_empty() {
                return None;
            }
            let host = target.trim_end_matches('.');
            Some(SrvTarget::new(host, srv.port(), srv.priority(), srv.weight()))
        })
        .collect()
}

/// Check if a resolve error indicates no records exist.
///
/// In hickory-resolver 0.25, NoRecordsFound is in ProtoErrorKind,
/// not ResolveErrorKind.
fn is_no_records_error(error: &ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto_error) = error.kind() {
        matches!(proto_error.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}
