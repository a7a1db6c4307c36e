//! Per-connection state.

use std::collections::VecDeque;
use std::fmt;

use crate::mux::SockId;
use crate::parser::StreamParser;

/// What sits on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A user client.
    Client,
    /// A peer chat server.
    S2s,
}

/// Connection state in the stream lifecycle.
///
/// Client connections move `None` → `Connecting` → `Connected`. Peer links
/// walk the dialback states, outbound starting at `S2sChallenge` and inbound
/// entering `S2sResponse` from `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Waiting for the peer's stream header.
    None,
    /// Client stream open answered, awaiting the login iq.
    Connecting,
    /// Handshake complete; stanzas route.
    Connected,
    /// Outbound link: stream open sent, awaiting the responder's challenge.
    S2sChallenge,
    /// Inbound link: challenge sent, awaiting the keyed `db:result`.
    S2sResponse,
    /// Outbound link: keyed result sent, awaiting `db:verify`.
    S2sVerify,
    /// Inbound link: verify sent, awaiting the echo.
    S2sVerifyResponse,
    /// Outbound link: echo sent, awaiting the final result.
    S2sVerifyFinal,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::S2sChallenge => "s2s-challenge",
            Self::S2sResponse => "s2s-response",
            Self::S2sVerify => "s2s-verify",
            Self::S2sVerifyResponse => "s2s-verify-response",
            Self::S2sVerifyFinal => "s2s-verify-final",
        };
        write!(f, "{}", name)
    }
}

/// Sub-element cursor while a handshake stanza is mid-parse.
#[derive(Debug, Default)]
pub struct XmlFlags {
    pub in_iq: bool,
    pub in_username: bool,
    pub in_resource: bool,
    pub in_s2s_result: bool,
}

impl XmlFlags {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One connected peer: its socket, stream parser, handshake scratch, and —
/// for peer links still negotiating — the queue of stanzas awaiting flush.
pub struct Node {
    pub sockid: SockId,
    pub kind: NodeKind,
    pub state: NodeState,
    pub flags: XmlFlags,
    /// Full routable identifier (`user@domain/resource` for clients, bare
    /// `domain` for peer servers). Set exactly once on the way to `Connected`.
    pub remote: Option<String>,
    pub username: Option<String>,
    pub resource: Option<String>,
    /// Stream id minted for the peer; nonce of the key derivation.
    pub authkey: Option<String>,
    /// Accumulates `db:result` character data, which may arrive split.
    pub key_buf: String,
    pub parser: StreamParser,
    /// Serialized stanzas waiting for the link to authenticate. Flushed in
    /// insertion order the moment the node reaches `Connected`.
    pub pending: VecDeque<String>,
    /// Set while this node's parse events are being applied; removal during
    /// that window must defer the actual release.
    pub in_parse: bool,
}

impl Node {
    /// A freshly accepted connection; kind is unknown until the stream opens.
    pub fn new(sockid: SockId) -> Self {
        Self {
            sockid,
            kind: NodeKind::Client,
            state: NodeState::None,
            flags: XmlFlags::default(),
            remote: None,
            username: None,
            resource: None,
            authkey: None,
            key_buf: String::new(),
            parser: StreamParser::new(),
            pending: VecDeque::new(),
            in_parse: false,
        }
    }

    /// An outbound peer link, dialed to deliver to `remote_domain`.
    pub fn new_outbound_s2s(sockid: SockId, remote_domain: &str) -> Self {
        let mut node = Self::new(sockid);
        node.kind = NodeKind::S2s;
        node.state = NodeState::S2sChallenge;
        node.remote = Some(remote_domain.to_string());
        node
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match &self.remote {
            Some(remote) => format!("{} (socket {})", remote, self.sockid),
            None => format!("socket {}", self.sockid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_nodes_await_a_stream_header() {
        let node = Node::new(7);
        assert_eq!(node.state, NodeState::None);
        assert_eq!(node.kind, NodeKind::Client);
        assert!(node.remote.is_none());
        assert!(node.pending.is_empty());
    }

    #[test]
    fn outbound_links_start_in_challenge_state() {
        let node = Node::new_outbound_s2s(8, "peer.org");
        assert_eq!(node.kind, NodeKind::S2s);
        assert_eq!(node.state, NodeState::S2sChallenge);
        assert_eq!(node.remote.as_deref(), Some("peer.org"));
    }

    #[test]
    fn flags_clear_resets_every_cursor() {
        let mut flags = XmlFlags {
            in_iq: true,
            in_username: true,
            in_resource: true,
            in_s2s_result: true,
        };
        flags.clear();
        assert!(!flags.in_iq && !flags.in_username && !flags.in_resource && !flags.in_s2s_result);
    }
}
