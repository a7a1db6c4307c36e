//! Outbound client transport session.
//!
//! Connects to a chat server, performs the login handshake, and exposes
//! inbound `<message>` stanzas as structured [`TransportMessage`]s. The
//! session drives its single socket synchronously through the same
//! multiplexer the server uses, one readiness wait at a time.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustyxml::{Element, Xml};
use tracing::{debug, info, warn};

use crate::dialback;
use crate::error::ChatError;
use crate::mux::{Multiplexer, SockId, SocketHandler, WaitTimeout};
use crate::parser::{StreamEvent, StreamParser};
use crate::stanza;

/// Login forms accepted by the server's in-band auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Password sent as element text.
    Plain,
    /// `hex(SHA1(stream_id ‖ password))` sent instead of the password.
    Digest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    /// Stream header sent, awaiting the server's.
    AwaitStream,
    /// Login iq sent, awaiting the result.
    LoggingIn,
    Connected,
}

/// A structured message received from or destined for the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub thread: String,
    /// Router extension attributes, relayed opaquely by servers.
    pub router_from: String,
    pub router_to: String,
    pub router_class: String,
    pub router_command: String,
    pub broadcast: bool,
    /// Error info when this is a bounced message.
    pub error_type: String,
    pub error_code: u16,
}

impl TransportMessage {
    pub fn new(to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    /// Whether the message carries a delivery error.
    pub fn is_error(&self) -> bool {
        !self.error_type.is_empty() || self.error_code != 0
    }

    /// Serialize as a `<message>` element; text content is escaped by the
    /// element writer.
    pub fn to_xml(&self) -> String {
        let mut attrs: Vec<(String, Option<String>, String)> =
            vec![("to".to_string(), None, self.to.clone())];
        if !self.from.is_empty() {
            attrs.push(("from".to_string(), None, self.from.clone()));
        }
        for (name, value) in [
            ("router_from", &self.router_from),
            ("router_to", &self.router_to),
            ("router_class", &self.router_class),
            ("router_command", &self.router_command),
        ] {
            if !value.is_empty() {
                attrs.push((name.to_string(), None, value.clone()));
            }
        }
        if self.broadcast {
            attrs.push(("broadcast".to_string(), None, "1".to_string()));
        }

        let mut message = Element::new("message".to_string(), None, attrs);
        for (name, value) in [
            ("thread", &self.thread),
            ("subject", &self.subject),
            ("body", &self.body),
        ] {
            if !value.is_empty() {
                message
                    .tag(Element::new(name.to_string(), None, Vec::new()))
                    .text(value.clone());
            }
        }
        message.to_string()
    }

    /// Decode a completed `<message>` element.
    pub fn from_element(element: &Element) -> Self {
        let attr =
            |name: &str| element.get_attribute(name, None).unwrap_or("").to_string();

        let mut message = Self {
            to: attr("to"),
            from: attr("from"),
            subject: child_text(element, "subject"),
            body: child_text(element, "body"),
            thread: child_text(element, "thread"),
            router_from: attr("router_from"),
            router_to: attr("router_to"),
            router_class: attr("router_class"),
            router_command: attr("router_command"),
            broadcast: attr("broadcast") == "1",
            ..Self::default()
        };

        if let Some(error) = find_child(element, "error") {
            message.error_type = error.get_attribute("type", None).unwrap_or("").to_string();
            message.error_code = error
                .get_attribute("code", None)
                .and_then(|code| code.parse().ok())
                .unwrap_or(0);
        }
        message
    }
}

/// First child element with the given local name, any namespace. Inbound
/// stanzas inherit whatever default namespace the stream declared, so
/// namespace-exact lookups would miss.
fn find_child<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    element.children.iter().find_map(|child| match child {
        Xml::ElementNode(el) if el.name == name => Some(el),
        _ => None,
    })
}

fn child_text(element: &Element, name: &str) -> String {
    find_child(element, name)
        .map(|el| el.content_str())
        .unwrap_or_default()
}

/// The session's protocol side: parser, state, and inbox.
struct SessionCore {
    parser: StreamParser,
    state: SessionState,
    stream_id: Option<String>,
    inbox: VecDeque<TransportMessage>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            parser: StreamParser::new(),
            state: SessionState::Disconnected,
            stream_id: None,
            inbox: VecDeque::new(),
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::StreamOpen { id, .. } => {
                if self.state == SessionState::AwaitStream {
                    debug!("server stream opened with id {:?}", id);
                    self.stream_id = id;
                    self.state = SessionState::LoggingIn;
                }
            }
            StreamEvent::ElementStart { name, attrs } if name == "iq" => {
                if self.state == SessionState::LoggingIn {
                    match attrs.get("type").map(String::as_str) {
                        Some("result") => {
                            info!("login accepted");
                            self.state = SessionState::Connected;
                        }
                        Some("error") => warn!("login rejected by server"),
                        _ => {}
                    }
                }
            }
            StreamEvent::ElementStart { name, .. } if name == "stream:error" => {
                warn!("received stream error from server");
                self.state = SessionState::Disconnected;
            }
            StreamEvent::StreamClose => {
                self.state = SessionState::Disconnected;
            }
            StreamEvent::Stanza(element) if element.name == "message" => {
                self.inbox.push_back(TransportMessage::from_element(&element));
            }
            _ => {}
        }
    }
}

impl SocketHandler for SessionCore {
    fn on_data(&mut self, _mux: &mut Multiplexer, _id: SockId, data: &[u8], _parent: Option<SockId>) {
        match self.parser.push_chunk(data) {
            Ok(events) => {
                for event in events {
                    self.apply(event);
                }
            }
            Err(err) => {
                warn!("session stream failed: {}", err);
                self.state = SessionState::Disconnected;
            }
        }
    }

    fn on_close(&mut self, _mux: &mut Multiplexer, _id: SockId) {
        debug!("server closed the session stream");
        self.state = SessionState::Disconnected;
    }
}

/// An outbound connection to a chat server.
pub struct Session {
    mux: Multiplexer,
    core: SessionCore,
    server: String,
    port: u16,
    sock: Option<SockId>,
}

impl Session {
    /// `server` doubles as the TCP host and as the domain in the stream
    /// header.
    pub fn new(server: impl Into<String>, port: u16) -> Self {
        Self {
            mux: Multiplexer::new(),
            core: SessionCore::new(),
            server: server.into(),
            port,
            sock: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.state == SessionState::Connected
    }

    /// Stream id assigned by the server, once the handshake has one.
    pub fn stream_id(&self) -> Option<&str> {
        self.core.stream_id.as_deref()
    }

    /// Connect and log in, waiting up to `timeout_secs` for each round trip.
    pub fn connect(
        &mut self,
        username: &str,
        password: &str,
        resource: &str,
        timeout_secs: u64,
        auth: AuthType,
    ) -> Result<(), ChatError> {
        let sock = match self.sock {
            Some(sock) => sock,
            None => {
                let sock = self.mux.open_tcp_client(self.port, &self.server)?;
                self.sock = Some(sock);
                sock
            }
        };

        self.core.state = SessionState::AwaitStream;
        self.mux
            .send(sock, stanza::stream_open_client(&self.server).as_bytes())?;
        self.drive_until(sock, timeout_secs, |core| core.stream_id.is_some())?;

        let Some(stream_id) = self.core.stream_id.clone() else {
            return Err(ChatError::stream("no stream header from server"));
        };

        let login = match auth {
            AuthType::Plain => stanza::login_request(username, password, resource),
            AuthType::Digest => {
                let digest =
                    dialback::sha1_hex(format!("{}{}", stream_id, password).as_bytes());
                stanza::login_request_digest(username, &digest, resource)
            }
        };
        self.mux.send(sock, login.as_bytes())?;
        self.drive_until(sock, timeout_secs, |core| {
            core.state == SessionState::Connected
        })?;

        info!("connected to {} as {}/{}", self.server, username, resource);
        Ok(())
    }

    /// Drive the socket until `done` or the deadline passes.
    fn drive_until(
        &mut self,
        sock: SockId,
        timeout_secs: u64,
        done: impl Fn(&SessionCore) -> bool,
    ) -> Result<(), ChatError> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            if done(&self.core) {
                return Ok(());
            }
            if self.core.state == SessionState::Disconnected {
                return Err(ChatError::NotConnected);
            }
            if Instant::now() >= deadline {
                return Err(ChatError::stream("timed out waiting for server"));
            }
            self.mux.wait_one(sock, WaitTimeout::Secs(1), &mut self.core)?;
        }
    }

    /// Drive the session once, delivering anything the server sent.
    pub fn wait(&mut self, timeout_secs: i64) -> Result<usize, ChatError> {
        let sock = self.sock.ok_or(ChatError::NotConnected)?;
        Ok(self
            .mux
            .wait_one(sock, WaitTimeout::from_secs(timeout_secs), &mut self.core)?)
    }

    /// Pop the next inbound message, waiting up to `timeout_secs` for one.
    pub fn recv(&mut self, timeout_secs: u64) -> Result<Option<TransportMessage>, ChatError> {
        if self.core.inbox.is_empty() {
            let sock = self.sock.ok_or(ChatError::NotConnected)?;
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);
            while self.core.inbox.is_empty()
                && self.core.state != SessionState::Disconnected
                && Instant::now() < deadline
            {
                self.mux.wait_one(sock, WaitTimeout::Secs(1), &mut self.core)?;
            }
        }
        Ok(self.core.inbox.pop_front())
    }

    /// Send a message. Fails when the session is not logged in.
    pub fn send(&mut self, message: &TransportMessage) -> Result<(), ChatError> {
        if !self.is_connected() {
            warn!("session is not connected");
            return Err(ChatError::NotConnected);
        }
        let sock = self.sock.ok_or(ChatError::NotConnected)?;
        self.mux.send(sock, message.to_xml().as_bytes())
    }

    /// Close the stream and the socket.
    pub fn disconnect(&mut self) {
        if let Some(sock) = self.sock.take() {
            self.mux.send(sock, stanza::stream_close().as_bytes()).ok();
            self.mux.disconnect(sock);
        }
        self.core.state = SessionState::Disconnected;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_xml() {
        let mut message = TransportMessage::new("b@ex.org/r2", "hello there");
        message.from = "a@ex.org/r1".to_string();
        message.subject = "greetings".to_string();
        message.thread = "t1".to_string();
        message.router_from = "router@ex.org".to_string();
        message.broadcast = true;

        let xml = message.to_xml();
        let element: Element = xml.parse().expect("serialized message must parse");
        let decoded = TransportMessage::from_element(&element);

        assert_eq!(decoded, message);
    }

    #[test]
    fn body_text_is_escaped() {
        let message = TransportMessage::new("b@ex.org", "a < b & c");
        let xml = message.to_xml();
        assert!(xml.contains("a &lt; b &amp; c"));

        let element: Element = xml.parse().expect("escaped message must parse");
        assert_eq!(TransportMessage::from_element(&element).body, "a < b & c");
    }

    #[test]
    fn empty_parts_are_omitted() {
        let xml = TransportMessage::new("b@ex.org", "hi").to_xml();
        assert!(!xml.contains("<subject"));
        assert!(!xml.contains("<thread"));
        assert!(!xml.contains("router_from"));
        assert!(!xml.contains("broadcast"));
    }

    #[test]
    fn bounce_stanzas_decode_as_errors() {
        let xml = crate::stanza::no_recipient("b@ex.org/r2", "a@ex.org/r1");
        let element: Element = xml.parse().expect("bounce template must parse");
        let message = TransportMessage::from_element(&element);

        assert!(message.is_error());
        assert_eq!(message.error_type, "cancel");
        assert_eq!(message.error_code, 404);
        assert_eq!(message.from, "b@ex.org/r2");
        assert_eq!(message.to, "a@ex.org/r1");
    }
}
