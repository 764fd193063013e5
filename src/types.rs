//! Common types shared across the federation layer.

use serde::{Deserialize, Serialize};

/// An ordered `(local domain, remote domain)` pair identifying an
/// outgoing S2S session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainPair {
    /// Our asserting domain.
    pub local: String,
    /// The remote domain we are connecting to.
    pub remote: String,
}

impl DomainPair {
    /// Create a new domain pair.
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl std::fmt::Display for DomainPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s2s-{}", self.0)
    }
}

/// Stanza category used by the bounce procedure and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Anything else
    Other,
}

impl StanzaType {
    /// Classify a stanza by element name.
    pub fn of(name: &str) -> Self {
        match name {
            "message" => Self::Message,
            "presence" => Self::Presence,
            "iq" => Self::Iq,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
            StanzaType::Other => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_pair_display() {
        let pair = DomainPair::new("a.example", "b.example");
        assert_eq!(pair.to_string(), "a.example -> b.example");
    }

    #[test]
    fn test_stanza_type_of() {
        assert_eq!(StanzaType::of("message"), StanzaType::Message);
        assert_eq!(StanzaType::of("db:verify"), StanzaType::Other);
    }
}
