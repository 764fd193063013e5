//! Incremental framing for outgoing S2S XML streams.
//!
//! XMPP uses a single long-lived XML document per stream, so the frames
//! arriving from the socket have to be accumulated and cut into
//! complete top-level elements before they can be handed to the session
//! state machine. The real XML parser/serializer lives behind
//! `minidom`; this module only does stream framing and the handful of
//! negotiation elements that are not well-formed on their own
//! (stream headers, dialback elements with undeclared prefixes).

use minidom::Element;

use crate::XmppError;

/// Namespace URIs used on the S2S wire.
pub mod ns {
    /// Server-to-server stanza namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// Client stanza namespace (used when rebuilding routed stanzas)
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Stream framing namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Server Dialback namespace (XEP-0220)
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Server Dialback stream feature namespace
    pub const DIALBACK_FEATURES: &str = "urn:xmpp:features:dialback";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by the receiving server)
    pub id: Option<String>,
    /// The 'version' attribute ("1.0" for RFC 6120 streams)
    pub version: Option<String>,
    /// The declared default namespace
    pub xmlns: Option<String>,
    /// Whether the dialback namespace prefix was declared
    pub db_declared: bool,
}

impl StreamHeader {
    /// Parse a stream header from raw XML data.
    ///
    /// Stream headers are intentionally unclosed XML, so the attributes
    /// are pulled out of the opening tag by hand.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !tag.contains("<stream:stream") && !tag.contains("<stream ") {
            return Err(XmppError::xml_parse("No stream:stream element found"));
        }

        Ok(StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            xmlns: extract_attribute(tag, "xmlns"),
            db_declared: extract_attribute(tag, "xmlns:db").as_deref() == Some(ns::DIALBACK),
        })
    }

    /// Whether the peer opened an RFC 6120 (version 1.0) stream.
    pub fn is_v10(&self) -> bool {
        self.version.as_deref() == Some("1.0")
    }

    /// Whether the declared default namespace is `jabber:server`.
    pub fn server_namespace(&self) -> bool {
        self.xmlns.as_deref() == Some(ns::JABBER_SERVER)
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        let mut search_from = 0;
        while let Some(offset) = tag[search_from..].find(&pattern) {
            let start = search_from + offset;
            // Reject partial matches like `previd=` matching `id=`.
            let at_boundary =
                start == 0 || tag.as_bytes()[start - 1].is_ascii_whitespace();
            if at_boundary {
                let value_start = start + pattern.len();
                if let Some(value_end) = tag[value_start..].find(quote) {
                    return Some(tag[value_start..value_start + value_end].to_string());
                }
                return None;
            }
            search_from = start + pattern.len();
        }
    }
    None
}

/// Stream features advertised by the receiving server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// `<starttls/>` offered
    pub starttls: bool,
    /// `<starttls><required/></starttls>`
    pub starttls_required: bool,
    /// Dialback feature advertised
    pub dialback: bool,
    /// SASL EXTERNAL mechanism offered
    pub sasl_external: bool,
}

/// Framed events emitted by the parser, in stream order.
#[derive(Debug, Clone)]
pub enum ParsedFrame {
    /// Stream opening received
    StreamStart(StreamHeader),
    /// Stream features element
    Features(StreamFeatures),
    /// `<proceed/>` for STARTTLS
    TlsProceed,
    /// `<failure/>` in the TLS namespace
    TlsFailure,
    /// `<success/>` for SASL
    SaslSuccess,
    /// `<failure/>` in the SASL namespace
    SaslFailure,
    /// `db:result` element (dialback answer on this stream)
    DialbackResult {
        /// Asserting domain
        from: String,
        /// Receiving domain
        to: String,
        /// `type` attribute, absent on a challenge
        response: Option<String>,
        /// Key text, present on a challenge
        key: Option<String>,
    },
    /// `db:verify` element (verification answer or request)
    DialbackVerify {
        /// Authoritative domain
        from: String,
        /// Asking domain
        to: String,
        /// Stream id the key was generated for
        id: String,
        /// `type` attribute, absent on a request
        response: Option<String>,
        /// Key text
        key: Option<String>,
    },
    /// A routable stanza (message, presence, iq)
    Stanza(Element),
    /// Fatal stream error from the peer
    StreamError {
        /// Condition element name
        condition: String,
    },
    /// `</stream:stream>` received
    StreamEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    StreamEnd,
    Features,
    Proceed,
    Failure,
    Success,
    DbResult,
    DbVerify,
    StreamError,
    Message,
    Presence,
    Iq,
}

const PATTERNS: &[(&str, FrameKind)] = &[
    ("</stream:stream>", FrameKind::StreamEnd),
    ("<stream:features", FrameKind::Features),
    ("<proceed", FrameKind::Proceed),
    ("<failure", FrameKind::Failure),
    ("<success", FrameKind::Success),
    ("<db:result", FrameKind::DbResult),
    ("<db:verify", FrameKind::DbVerify),
    ("<stream:error", FrameKind::StreamError),
    ("<message", FrameKind::Message),
    ("<presence", FrameKind::Presence),
    ("<iq", FrameKind::Iq),
];

/// Incremental frame parser for one S2S stream.
pub struct XmlParser {
    buffer: Vec<u8>,
    header_taken: bool,
}

impl XmlParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            header_taken: false,
        }
    }

    /// Feed raw bytes into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop all buffered state, e.g. after a TLS upgrade or SASL
    /// stream reset.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header_taken = false;
    }

    /// Return the next complete frame, or `None` if more bytes are
    /// needed.
    pub fn next_frame(&mut self) -> Result<Option<ParsedFrame>, XmppError> {
        if !self.header_taken {
            return self.try_take_header();
        }

        let data = String::from_utf8_lossy(&self.buffer).to_string();

        // Dispatch on the earliest pattern so frame order is preserved
        // even when several elements arrived in one read.
        let mut earliest: Option<(usize, FrameKind, &str)> = None;
        for (pattern, kind) in PATTERNS {
            if let Some(pos) = data.find(pattern) {
                if earliest.map(|(p, _, _)| pos < p).unwrap_or(true) {
                    earliest = Some((pos, *kind, pattern));
                }
            }
        }

        let Some((start, kind, pattern)) = earliest else {
            return Ok(None);
        };

        if kind == FrameKind::StreamEnd {
            self.buffer.drain(..start + pattern.len());
            return Ok(Some(ParsedFrame::StreamEnd));
        }

        let tag_name = &pattern[1..];
        let Some(end) = find_element_end(&data, start, tag_name) else {
            return Ok(None);
        };

        let raw = data[start..end].to_string();
        self.buffer.drain(..end);

        let frame = match kind {
            FrameKind::Features => ParsedFrame::Features(parse_features(&raw)),
            FrameKind::Proceed => ParsedFrame::TlsProceed,
            FrameKind::Failure => {
                if raw.contains(ns::TLS) {
                    ParsedFrame::TlsFailure
                } else {
                    ParsedFrame::SaslFailure
                }
            }
            FrameKind::Success => ParsedFrame::SaslSuccess,
            FrameKind::DbResult => parse_db_result(&raw)?,
            FrameKind::DbVerify => parse_db_verify(&raw)?,
            FrameKind::StreamError => ParsedFrame::StreamError {
                condition: parse_stream_error_condition(&raw),
            },
            FrameKind::Message | FrameKind::Presence | FrameKind::Iq => {
                ParsedFrame::Stanza(parse_stanza_element(&raw)?)
            }
            FrameKind::StreamEnd => unreachable!(),
        };

        Ok(Some(frame))
    }

    fn try_take_header(&mut self) -> Result<Option<ParsedFrame>, XmppError> {
        let data = String::from_utf8_lossy(&self.buffer).to_string();

        let Some(start) = data.find("<stream:stream").or_else(|| data.find("<stream ")) else {
            return Ok(None);
        };
        let Some(end) = data[start..].find('>').map(|i| start + i) else {
            return Ok(None);
        };

        let header = StreamHeader::parse(&data[start..=end])?;
        self.buffer.drain(..end + 1);
        self.header_taken = true;

        Ok(Some(ParsedFrame::StreamStart(header)))
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the end position of an element (after the closing tag or
/// self-closing `/>`).
fn find_element_end(data: &str, start: usize, tag_name: &str) -> Option<usize> {
    let after_start = &data[start..];

    if let Some(gt_pos) = after_start.find('>') {
        if gt_pos > 0 && after_start.as_bytes()[gt_pos - 1] == b'/' {
            return Some(start + gt_pos + 1);
        }
    }

    let close_tag = format!("</{}", tag_name);
    if let Some(close_start) = after_start.find(&close_tag) {
        if let Some(close_end) = after_start[close_start..].find('>') {
            return Some(start + close_start + close_end + 1);
        }
    }

    None
}

/// Element text content: everything between the first `>` and the
/// closing tag. Empty for self-closing elements.
fn element_text(raw: &str) -> Option<String> {
    let open_end = raw.find('>')?;
    if raw.as_bytes()[open_end - 1] == b'/' {
        return None;
    }
    let close = raw.rfind("</")?;
    if close <= open_end {
        return None;
    }
    let text = raw[open_end + 1..close].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn parse_features(raw: &str) -> StreamFeatures {
    let starttls = raw.contains("<starttls");
    StreamFeatures {
        starttls,
        starttls_required: starttls && raw.contains("<required"),
        dialback: raw.contains(ns::DIALBACK_FEATURES) || raw.contains("<dialback"),
        sasl_external: raw.contains(">EXTERNAL<"),
    }
}

fn parse_db_result(raw: &str) -> Result<ParsedFrame, XmppError> {
    let from = extract_attribute(raw, "from")
        .ok_or_else(|| XmppError::xml_parse("db:result missing 'from'"))?;
    let to = extract_attribute(raw, "to")
        .ok_or_else(|| XmppError::xml_parse("db:result missing 'to'"))?;
    Ok(ParsedFrame::DialbackResult {
        from,
        to,
        response: extract_attribute(raw, "type"),
        key: element_text(raw),
    })
}

fn parse_db_verify(raw: &str) -> Result<ParsedFrame, XmppError> {
    let from = extract_attribute(raw, "from")
        .ok_or_else(|| XmppError::xml_parse("db:verify missing 'from'"))?;
    let to = extract_attribute(raw, "to")
        .ok_or_else(|| XmppError::xml_parse("db:verify missing 'to'"))?;
    let id = extract_attribute(raw, "id")
        .ok_or_else(|| XmppError::xml_parse("db:verify missing 'id'"))?;
    Ok(ParsedFrame::DialbackVerify {
        from,
        to,
        id,
        response: extract_attribute(raw, "type"),
        key: element_text(raw),
    })
}

fn parse_stream_error_condition(raw: &str) -> String {
    // First child element name inside <stream:error>.
    let Some(open_end) = raw.find('>') else {
        return "undefined-condition".to_string();
    };
    let inner = &raw[open_end + 1..];
    let Some(lt) = inner.find('<') else {
        return "undefined-condition".to_string();
    };
    let rest = &inner[lt + 1..];
    let end = rest
        .find(|c: char| c == ' ' || c == '/' || c == '>')
        .unwrap_or(rest.len());
    let name = &rest[..end];
    if name.is_empty() {
        "undefined-condition".to_string()
    } else {
        name.to_string()
    }
}

/// Parse a routable stanza, injecting the stream's default namespace
/// when the element relies on inheriting it.
fn parse_stanza_element(raw: &str) -> Result<Element, XmppError> {
    let with_ns = if raw.contains("xmlns=") {
        raw.to_string()
    } else {
        match raw.find(|c: char| c == ' ' || c == '>' || c == '/') {
            Some(pos) => format!(
                "{} xmlns='{}'{}",
                &raw[..pos],
                ns::JABBER_SERVER,
                &raw[pos..]
            ),
            None => raw.to_string(),
        }
    };

    with_ns
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse stanza: {}", e)))
}

/// Convert a minidom Element to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}
