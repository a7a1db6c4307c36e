//! Dialback-style authentication for peer server links.
//!
//! Peer links are verified through a challenge-response exchange: the
//! responder mints a stream id, the initiator answers with a key derived
//! from the shared secret, and the responder checks it against its own
//! derivation before echoing verification both ways.
//!
//! # Key Derivation
//!
//! ```text
//! key = hex(SHA1( hex(SHA1( hex(SHA1(secret)) ‖ responder_domain )) ‖ stream_id ))
//! ```
//!
//! Every layer hashes the lowercase hex digest of the previous one; both
//! sides must agree on that representation for the keys to converge.

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::parser::ns;

/// Derive the link key for a handshake.
///
/// # Arguments
///
/// * `secret` - The shared secret configured on both servers
/// * `responder_domain` - The domain of the server that minted the stream id
/// * `stream_id` - The id attribute of the responder's stream header
pub fn derive_key(secret: &str, responder_domain: &str, stream_id: &str) -> String {
    let secret_hash = sha1_hex(secret.as_bytes());
    let domain_hash = sha1_hex(format!("{}{}", secret_hash, responder_domain).as_bytes());
    sha1_hex(format!("{}{}", domain_hash, stream_id).as_bytes())
}

/// Verify a key received in a `db:result` against our own derivation.
pub fn verify_key(candidate: &str, secret: &str, responder_domain: &str, stream_id: &str) -> bool {
    let expected = derive_key(secret, responder_domain, stream_id);
    constant_time_eq(candidate.as_bytes(), expected.as_bytes())
}

/// Mint a stream id, which doubles as the nonce in the key derivation.
///
/// Must be fresh per handshake: a reused id would let a peer replay a
/// previously observed key.
pub fn mint_authkey() -> String {
    let mut nonce = [0u8; 20];
    rand::rng().fill_bytes(&mut nonce);
    sha1_hex(&nonce)
}

/// SHA-1 message digest used for the handshake chain and digest logins.
pub(crate) fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Build the stream open an initiator sends when dialing a peer.
pub fn s2s_open(to: &str, from: &str) -> String {
    format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}' xmlns:db='{}' to='{}' from='{}' version='1.0'>",
        ns::JABBER_SERVER,
        ns::STREAM,
        ns::DIALBACK,
        to,
        from
    )
}

/// Build the challenge stream open a responder answers with. The `id` is the
/// freshly minted authkey.
pub fn s2s_challenge(from: &str, id: &str) -> String {
    format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}' xmlns:db='{}' from='{}' id='{}' version='1.0'>",
        ns::JABBER_SERVER,
        ns::STREAM,
        ns::DIALBACK,
        from,
        id
    )
}

/// Build the keyed `db:result` the initiator answers a challenge with.
pub fn db_result(from: &str, to: &str, key: &str) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}'>{}</db:result>",
        ns::DIALBACK,
        from,
        to,
        key
    )
}

/// Build the `db:verify` the responder sends after checking the key.
pub fn db_verify(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}'>{}</db:verify>",
        ns::DIALBACK,
        from,
        to,
        id,
        key
    )
}

/// Build the verification echo the initiator returns.
pub fn db_verify_response(from: &str, to: &str, id: &str) -> String {
    format!(
        "<db:verify-response xmlns:db='{}' from='{}' to='{}' id='{}'/>",
        ns::DIALBACK,
        from,
        to,
        id
    )
}

/// Build the final acceptance that completes the handshake.
pub fn db_result_valid(from: &str, to: &str) -> String {
    format!(
        "<db:result xmlns:db='{}' type='valid' from='{}' to='{}'/>",
        ns::DIALBACK,
        from,
        to
    )
}

/// Helper module for hex encoding.
mod hex {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut result = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            result.push(HEX_CHARS[(byte >> 4) as usize] as char);
            result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
        result
    }
}
