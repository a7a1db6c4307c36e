//! Incremental XML parsing for chat streams.
//!
//! A stream is one long-lived XML document per connection, so parsing must
//! accept partial data and surface events as they complete. Each connection
//! owns a [`StreamParser`] that is fed raw byte chunks and yields
//! [`StreamEvent`]s: the stream header, granular element/text events for the
//! handshake state machines, and fully built stanza subtrees for routing.

use std::collections::HashMap;

use rustyxml::{Element, ElementBuilder, Event, Parser};
use tracing::trace;

use crate::error::ChatError;

/// Namespace URIs used on the wire.
pub mod ns {
    /// Client connection namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Server-to-server connection namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// Streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Server dialback namespace
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// In-band login namespace
    pub const IQ_AUTH: &str = "jabber:iq:auth";
}

/// One event surfaced by the stream parser.
#[derive(Debug)]
pub enum StreamEvent {
    /// `<stream:stream …>` opened. `ns` is the declared default namespace,
    /// which decides whether the peer is a client or another server.
    StreamOpen {
        ns: Option<String>,
        to: Option<String>,
        from: Option<String>,
        id: Option<String>,
    },
    /// `</stream:stream>`; the peer is closing down.
    StreamClose,
    /// Start tag of an element below the stream root. `name` is the
    /// prefix-qualified form as written (`iq`, `db:result`, …).
    ElementStart {
        name: String,
        attrs: HashMap<String, String>,
    },
    /// Matching end tag.
    ElementEnd { name: String },
    /// Character data. One logical text run may arrive as several of these.
    Text(String),
    /// A complete top-level stanza subtree.
    Stanza(Element),
}

/// Extract an attribute value from a raw XML tag string.
///
/// Used on the stream header, which is intentionally unclosed XML that has to
/// be inspected before the parser consumes it.
pub fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    // Try both single and double quotes
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Incremental push parser for one connection's stream.
pub struct StreamParser {
    parser: Parser,
    builder: ElementBuilder,
    /// Bytes carried over when a chunk ends inside a UTF-8 sequence.
    carry: Vec<u8>,
    /// Raw header text, kept until the opening tag completes.
    header: String,
    header_seen: bool,
    /// Default namespace declared on the stream header.
    stream_ns: Option<String>,
    failed: bool,
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            builder: ElementBuilder::new(),
            carry: Vec::new(),
            header: String::new(),
            header_seen: false,
            stream_ns: None,
            failed: false,
        }
    }

    /// Whether a previous chunk left the parser in a failed state.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Feed one chunk of bytes, returning the events it completed.
    ///
    /// The error state is sticky: after a malformed chunk every further call
    /// fails, matching the contract that the connection is torn down.
    pub fn push_chunk(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, ChatError> {
        if self.failed {
            return Err(ChatError::xml_parse("stream already failed"));
        }

        let text = match self.take_valid_utf8(data) {
            Ok(text) => text,
            Err(err) => {
                self.failed = true;
                return Err(err);
            }
        };
        if text.is_empty() {
            return Ok(Vec::new());
        }

        // The header's default xmlns must be known before the parser emits
        // the stream start tag; both consume the same bytes, so sniffing
        // first keeps them in step.
        if !self.header_seen {
            self.sniff_header(&text);
        }

        self.parser.feed_str(&text);
        self.drain_events()
    }

    /// Append `data` to any carried-over bytes and split off the longest
    /// valid UTF-8 prefix. A sequence truncated by the chunk boundary waits
    /// for the next chunk; invalid bytes fail the stream.
    fn take_valid_utf8(&mut self, data: &[u8]) -> Result<String, ChatError> {
        self.carry.extend_from_slice(data);

        let valid_len = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => return Err(ChatError::xml_parse("invalid utf-8 in stream")),
        };

        let text = String::from_utf8_lossy(&self.carry[..valid_len]).into_owned();
        self.carry.drain(..valid_len);
        Ok(text)
    }

    fn sniff_header(&mut self, text: &str) {
        self.header.push_str(text);
        if let Some(start) = self.header.find("<stream") {
            if let Some(end) = self.header[start..].find('>') {
                let tag = &self.header[start..start + end + 1];
                self.stream_ns = extract_attribute(tag, "xmlns");
                trace!("stream header declares xmlns {:?}", self.stream_ns);
                self.header_seen = true;
                self.header.clear();
            }
        }
    }

    fn drain_events(&mut self) -> Result<Vec<StreamEvent>, ChatError> {
        let mut events = Vec::new();

        for item in &mut self.parser {
            match item {
                Ok(Event::ElementStart(ref tag)) if is_stream_tag(&tag.prefix, &tag.name) => {
                    events.push(StreamEvent::StreamOpen {
                        ns: self.stream_ns.clone(),
                        to: plain_attr(&tag.attributes, "to"),
                        from: plain_attr(&tag.attributes, "from"),
                        id: plain_attr(&tag.attributes, "id"),
                    });
                }
                Ok(Event::ElementEnd(ref tag)) if is_stream_tag(&tag.prefix, &tag.name) => {
                    events.push(StreamEvent::StreamClose);
                }
                Ok(event) => {
                    match &event {
                        Event::ElementStart(tag) => events.push(StreamEvent::ElementStart {
                            name: qualified(&tag.prefix, &tag.name),
                            attrs: tag
                                .attributes
                                .iter()
                                .map(|((name, _ns), value)| (name.clone(), value.clone()))
                                .collect(),
                        }),
                        Event::ElementEnd(tag) => events.push(StreamEvent::ElementEnd {
                            name: qualified(&tag.prefix, &tag.name),
                        }),
                        Event::Characters(text) => events.push(StreamEvent::Text(text.clone())),
                        Event::CDATA(text) => events.push(StreamEvent::Text(text.clone())),
                        _ => {}
                    }

                    // The builder accumulates the in-flight stanza subtree;
                    // the stream root never reaches it, so each top-level
                    // child completes as its own element.
                    if let Some(built) = self.builder.handle_event(Ok(event)) {
                        match built {
                            Ok(element) => events.push(StreamEvent::Stanza(element)),
                            Err(err) => {
                                self.failed = true;
                                return Err(ChatError::xml_parse(err.to_string()));
                            }
                        }
                    }
                }
                Err(err) => {
                    self.failed = true;
                    return Err(ChatError::xml_parse(err.to_string()));
                }
            }
        }

        Ok(events)
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stream_tag(prefix: &Option<String>, name: &str) -> bool {
    name == "stream" && prefix.as_deref() == Some("stream")
}

fn qualified(prefix: &Option<String>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}:{}", prefix, name),
        None => name.to_string(),
    }
}

fn plain_attr(attrs: &HashMap<(String, Option<String>), String>, name: &str) -> Option<String> {
    attrs.get(&(name.to_string(), None)).cloned()
}
