//! Incremental framing of the XMPP client stream.
//!
//! A client session is one long-lived XML document. The parser buffers raw
//! bytes and cuts them into frames: the opening `<stream:stream>` tag, each
//! complete top-level element, runs of character data between elements
//! (whitespace keepalives) and the closing `</stream:stream>`. Boundaries are
//! found with quick-xml; complete elements are then materialized as minidom
//! trees.

use minidom::Element;
use quick_xml::errors::{IllFormedError, SyntaxError};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Roster namespace
    pub const ROSTER: &str = "jabber:iq:roster";
    /// XEP-0199 ping namespace
    pub const PING: &str = "urn:xmpp:ping";
    /// Keepalive feature namespace
    pub const KEEPALIVE: &str = "urn:xmpp:keepalive:0";
}

/// Largest amount of unframed data buffered before the stream is rejected.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Parsed stream header information.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'id' attribute
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    fn from_start(start: &BytesStart<'_>) -> Self {
        let mut header = StreamHeader::default();
        for attr in start.attributes().flatten() {
            let value = String::from_utf8_lossy(&attr.value).into_owned();
            match attr.key.as_ref() {
                b"to" => header.to = Some(value),
                b"from" => header.from = Some(value),
                b"id" => header.id = Some(value),
                b"version" => header.version = Some(value),
                b"xml:lang" => header.lang = Some(value),
                _ => {}
            }
        }
        header
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self) -> Result<(), XmppError> {
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(XmppError::stream(format!(
                    "Unsupported XMPP version: {}",
                    version
                )));
            }
        }
        Ok(())
    }
}

/// One unit cut from the inbound byte stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// `<stream:stream ...>` opening tag
    StreamOpen(StreamHeader),
    /// `</stream:stream>`
    StreamClose,
    /// A complete top-level element
    Element(Element),
    /// Character data between top-level elements
    Text(String),
}

/// Incremental XML framer for a client stream.
pub struct XmlParser {
    buffer: Vec<u8>,
}

impl XmlParser {
    /// Create a new XML parser.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered data (stream restart after STARTTLS or SASL).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Cut the next frame from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, XmppError> {
        let Some((frame, consumed)) = scan_frame(&self.buffer)? else {
            if self.buffer.len() > MAX_FRAME_SIZE {
                return Err(XmppError::xml_parse(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_SIZE
                )));
            }
            return Ok(None);
        };
        self.buffer.drain(..consumed);
        Ok(Some(frame))
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream" || name == b"stream"
}

fn is_incomplete(err: &quick_xml::Error) -> bool {
    matches!(
        err,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
        )
    )
}

/// Find the first frame in `buffer`, returning it with the bytes it spans.
fn scan_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, XmppError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: usize = 0;
    // (start offset, root name length, root lacks a default namespace)
    let mut root: Option<(usize, usize, bool)> = None;

    loop {
        let pos = reader.buffer_position() as usize;
        let event = match reader.read_event() {
            Ok(event) => event,
            Err(e) if is_incomplete(&e) => return Ok(None),
            // The reader has no matching start tag for a bare stream close.
            Err(quick_xml::Error::IllFormed(IllFormedError::UnmatchedEndTag(name)))
                if root.is_none() && is_stream_tag(name.as_bytes()) =>
            {
                let Some(offset) = buffer[pos..].iter().position(|&b| b == b'>') else {
                    return Ok(None);
                };
                return Ok(Some((Frame::StreamClose, pos + offset + 1)));
            }
            Err(e) => return Err(XmppError::xml_parse(e.to_string())),
        };
        let end = reader.buffer_position() as usize;

        match event {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            Event::Start(e) => {
                if root.is_none() && is_stream_tag(e.name().as_ref()) {
                    return Ok(Some((Frame::StreamOpen(StreamHeader::from_start(&e)), end)));
                }
                if root.is_none() {
                    root = Some((pos, e.name().as_ref().len(), lacks_default_ns(&e)));
                }
                depth += 1;
            }
            Event::Empty(e) => {
                if root.is_none() {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some((
                            Frame::StreamOpen(StreamHeader::from_start(&e)),
                            end,
                        )));
                    }
                    let element = parse_fragment(
                        &buffer[pos..end],
                        e.name().as_ref().len(),
                        lacks_default_ns(&e),
                    )?;
                    return Ok(Some((Frame::Element(element), end)));
                }
            }
            Event::End(e) => {
                if root.is_none() {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Some((Frame::StreamClose, end)));
                    }
                    return Err(XmppError::xml_parse(format!(
                        "unexpected closing tag </{}>",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some((start, name_len, lacks_ns)) = root {
                        let element = parse_fragment(&buffer[start..end], name_len, lacks_ns)?;
                        return Ok(Some((Frame::Element(element), end)));
                    }
                }
            }
            Event::Text(t) => {
                if root.is_none() {
                    let text = String::from_utf8_lossy(&t).into_owned();
                    return Ok(Some((Frame::Text(text), end)));
                }
            }
            Event::CData(_) => {}
            Event::Eof => return Ok(None),
        }
    }
}

fn lacks_default_ns(start: &BytesStart<'_>) -> bool {
    !start
        .attributes()
        .flatten()
        .any(|attr| attr.key.as_ref() == b"xmlns")
}

/// Parse one top-level element, supplying `jabber:client` when the client
/// relied on the stream's default namespace.
fn parse_fragment(raw: &[u8], name_len: usize, lacks_ns: bool) -> Result<Element, XmppError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
    if !lacks_ns {
        return parse_element(text);
    }
    let split = 1 + name_len;
    if split > text.len() {
        return Err(XmppError::xml_parse("truncated element"));
    }
    let mut owned = String::with_capacity(text.len() + 24);
    owned.push_str(&text[..split]);
    owned.push_str(" xmlns='");
    owned.push_str(ns::JABBER_CLIENT);
    owned.push('\'');
    owned.push_str(&text[split..]);
    parse_element(&owned)
}

/// Parse a standalone XML element.
pub fn parse_element(data: &str) -> Result<Element, XmppError> {
    data.parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}

/// Escape text for use inside a single-quoted attribute or element body.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
