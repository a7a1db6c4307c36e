//! # jabberwock
//!
//! A single-threaded XMPP-dialect message router.
//!
//! The server multiplexes every client and peer-server connection on one
//! readiness loop, parses each connection's XML stream incrementally, and
//! routes `<message/>` stanzas to local users or across authenticated peer
//! links. Peer links are verified with a dialback-style challenge-response
//! derived from a shared secret; stanzas bound for a link still negotiating
//! queue up and flush, in order, the moment it authenticates.
//!
//! ## Architecture
//!
//! - **Multiplexer** ([`mux`]): one `poll` loop over every socket; accepts,
//!   reads, and hands byte chunks to the protocol layer
//! - **Stream parsing** ([`parser`]): per-connection push parser yielding
//!   header, element, text, and completed-stanza events
//! - **Server** ([`server`]): connection state machines, the dual
//!   fd/address index, and the router
//! - **Peer links** ([`dialback`]): challenge-response key derivation and
//!   the `db:*` stanza forms
//! - **Transport session** ([`session`]): the outbound client side,
//!   exposing inbound stanzas as structured messages

pub mod dialback;
pub mod mux;
pub mod node;
pub mod parser;
pub mod server;
pub mod session;
pub mod stanza;

mod error;

pub use error::ChatError;
pub use mux::{Multiplexer, SockId, SocketHandler, WaitTimeout};
pub use node::{Node, NodeKind, NodeState};
pub use parser::{StreamEvent, StreamParser};
pub use server::{ChatServer, ServerConfig};
pub use session::{AuthType, Session, TransportMessage};
