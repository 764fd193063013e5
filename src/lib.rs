//! # rookery-xmpp
//!
//! Federation layer of the Rookery XMPP server: outgoing
//! server-to-server (S2S) session management and the
//! publish-subscribe core that fans event notifications out across
//! those sessions.
//!
//! ## Architecture
//!
//! - **S2S sessions**: one tokio task per `(local, remote)` domain
//!   pair, driving an XML stream state machine through DNS/SRV
//!   discovery, STARTTLS, SASL EXTERNAL, and Server Dialback
//!   (XEP-0220). Stanzas queue while a session negotiates and bounce
//!   with `remote-server-not-found` when it fails; failed pairs retry
//!   with exponential backoff.
//! - **S2S registry**: the `(local, remote) -> session` map with
//!   compare-and-set slot claiming, the `send` entry point, and the
//!   dialback verifier plumbing.
//! - **Pub/Sub**: XEP-0060 node tree, access models, bounded item
//!   retention, the owner authorization workflow, XEP-0163 PEP
//!   semantics, and filtered broadcast fan-out with SHIM headers.
//! - **Router**: dispatches stanzas between local delivery (a seam
//!   towards the C2S layer) and the S2S registry.
//!
//! The XML stream framing lives in [`parser`]; stanzas are
//! `minidom::Element`s with `xmpp-parsers` types at the IQ surface.

pub mod config;
pub mod parser;
pub mod presence;
pub mod pubsub;
pub mod router;
pub mod s2s;

mod error;
mod types;

pub use error::{
    generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError,
};
pub use parser::{ns, ParsedFrame, StreamFeatures, StreamHeader};
pub use router::{router_channel, LocalDelivery, RouterHandle, RoutingDestination, StanzaRouter};
pub use types::{DomainPair, SessionId, StanzaType};
