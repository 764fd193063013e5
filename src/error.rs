//! Error types for the federation layer.

use minidom::Element;
use thiserror::Error;

/// Namespace for stanza error conditions (RFC 6120 Section 8.3).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Namespace for stream error conditions.
pub const NS_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Namespace for the PubSub extended error children (XEP-0060).
pub const NS_PUBSUB_ERRORS: &str = "http://jabber.org/protocol/pubsub#errors";

/// Federation layer errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream-level error (fatal for the stream)
    #[error("Stream error: {0}")]
    Stream(String),

    /// Send did not complete within the send timeout
    #[error("Send timed out")]
    SendTimeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (mapped to an error reply for the requester)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
        /// Optional XEP-0060 `unsupported` feature name
        unsupported_feature: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn stanza(
        condition: StanzaErrorCondition,
        error_type: StanzaErrorType,
        text: Option<String>,
    ) -> Self {
        Self::Stanza {
            condition,
            error_type,
            text,
            unsupported_feature: None,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, StanzaErrorType::Modify, text)
    }

    /// Create a stanza error for 'not-acceptable'.
    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAcceptable, StanzaErrorType::Modify, text)
    }

    /// Create a stanza error for 'not-allowed'.
    pub fn not_allowed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAllowed, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'not-authorized'.
    pub fn not_authorized(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAuthorized, StanzaErrorType::Auth, text)
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'conflict'.
    pub fn conflict(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Conflict, StanzaErrorType::Cancel, text)
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, StanzaErrorType::Auth, text)
    }

    /// Create a stanza error for 'policy-violation'.
    pub fn policy_violation(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::PolicyViolation, StanzaErrorType::Modify, text)
    }

    /// Create a 'feature-not-implemented' stanza error carrying the
    /// XEP-0060 `unsupported` child with the feature name.
    pub fn unsupported(feature: &str) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::FeatureNotImplemented,
            error_type: StanzaErrorType::Cancel,
            text: None,
            unsupported_feature: Some(feature.to_string()),
        }
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::InternalServerError,
            StanzaErrorType::Wait,
            text,
        )
    }

    /// Create a stanza error for 'remote-server-not-found'.
    pub fn remote_server_not_found() -> Self {
        Self::stanza(
            StanzaErrorCondition::RemoteServerNotFound,
            StanzaErrorType::Cancel,
            None,
        )
    }

    /// Create a stanza error for 'remote-server-timeout'.
    pub fn remote_server_timeout() -> Self {
        Self::stanza(
            StanzaErrorCondition::RemoteServerTimeout,
            StanzaErrorType::Wait,
            None,
        )
    }

    /// Create a stanza error for 'resource-constraint'.
    pub fn resource_constraint(text: Option<String>) -> Self {
        Self::stanza(
            StanzaErrorCondition::ResourceConstraint,
            StanzaErrorType::Wait,
            text,
        )
    }

    /// Build the `<error/>` element for a stanza-level error, in the
    /// namespace of the stanza it will be attached to.
    ///
    /// Non-stanza variants collapse to `internal-server-error`.
    pub fn to_error_element(&self, stanza_ns: &str) -> Element {
        let (condition, error_type, text, unsupported) = match self {
            Self::Stanza {
                condition,
                error_type,
                text,
                unsupported_feature,
            } => (*condition, *error_type, text.clone(), unsupported_feature.clone()),
            other => (
                StanzaErrorCondition::InternalServerError,
                StanzaErrorType::Wait,
                Some(other.to_string()),
                None,
            ),
        };

        let mut builder = Element::builder("error", stanza_ns)
            .attr("type", error_type.as_str())
            .append(Element::bare(condition.as_str(), NS_STANZAS));

        if let Some(feature) = unsupported {
            builder = builder.append(
                Element::builder("unsupported", NS_PUBSUB_ERRORS)
                    .attr("feature", feature)
                    .build(),
            );
        }

        if let Some(text) = text {
            builder = builder.append(
                Element::builder("text", NS_STANZAS)
                    .attr("xml:lang", "en")
                    .append(text)
                    .build(),
            );
        }

        builder.build()
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., node already exists)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate a stream error followed by the stream close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!("<stream:error><{} xmlns='{}'/>", condition, NS_STREAMS);

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            NS_STREAMS, t
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions used by the S2S layer.
pub mod stream_errors {
    /// Stream error: bad format
    pub const BAD_FORMAT: &str = "bad-format";
    /// Stream error: connection timeout
    pub const CONNECTION_TIMEOUT: &str = "connection-timeout";
    /// Stream error: invalid namespace
    pub const INVALID_NAMESPACE: &str = "invalid-namespace";
    /// Stream error: XML not well-formed (legacy RFC 3920 name, still
    /// emitted by deployed dialback-only servers)
    pub const XML_NOT_WELL_FORMED: &str = "xml-not-well-formed";
    /// Stream error: undefined condition
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
}
