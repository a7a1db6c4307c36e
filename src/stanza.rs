//! Canned wire-format stanzas.
//!
//! Everything here is a single template with substituted addressing; stanzas
//! with real structure are built as element trees elsewhere.

use crate::parser::ns;

/// Fixed id echoed between the login request and its result.
const LOGIN_ID: &str = "0001";

/// Stream open sent by an outbound client session.
pub fn stream_open_client(domain: &str) -> String {
    format!(
        "<stream:stream to='{}' xmlns='{}' xmlns:stream='{}' version='1.0'>",
        domain,
        ns::JABBER_CLIENT,
        ns::STREAM
    )
}

/// Server's answer to a client stream open. The `id` is the freshly minted
/// authkey for this connection.
pub fn stream_response(domain: &str, id: &str) -> String {
    format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}' from='{}' id='{}' version='1.0'>\
         <stream:features><auth xmlns='http://jabber.org/features/iq-auth'/></stream:features>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        domain,
        id
    )
}

/// Plain-text login request.
pub fn login_request(username: &str, password: &str, resource: &str) -> String {
    format!(
        "<iq id='{}' type='set'><query xmlns='{}'>\
         <username>{}</username><password>{}</password><resource>{}</resource>\
         </query></iq>",
        LOGIN_ID,
        ns::IQ_AUTH,
        username,
        password,
        resource
    )
}

/// Digest login request; `digest` is `hex(SHA1(stream_id ‖ password))`.
pub fn login_request_digest(username: &str, digest: &str, resource: &str) -> String {
    format!(
        "<iq id='{}' type='set'><query xmlns='{}'>\
         <username>{}</username><digest>{}</digest><resource>{}</resource>\
         </query></iq>",
        LOGIN_ID,
        ns::IQ_AUTH,
        username,
        digest,
        resource
    )
}

/// Canned success reply to a login request.
pub fn login_ok() -> String {
    format!("<iq id='{}' type='result'/>", LOGIN_ID)
}

/// Stream error emitted before disconnecting a peer that sent bad XML.
pub fn parse_error() -> String {
    format!(
        "<stream:error xmlns:stream='{}'>\
         <not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
         </stream:error>",
        ns::STREAM
    )
}

/// Error bounced to a sender whose recipient is unreachable. Addressed back
/// to the original sender, claiming to come from the missing address.
pub fn no_recipient(missing: &str, sender: &str) -> String {
    format!(
        "<message type='error' to='{}' from='{}'>\
         <error type='cancel' code='404'>Recipient not found</error>\
         <body>Could not deliver message to {}</body>\
         </message>",
        sender, missing, missing
    )
}

/// Stream close tag, sent by either side when shutting a connection down.
pub fn stream_close() -> &'static str {
    "</stream:stream>"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_response_carries_the_authkey() {
        let xml = stream_response("ex.org", "key123");
        assert!(xml.contains("id='key123'"));
        assert!(xml.contains("from='ex.org'"));
        assert!(xml.contains("<stream:features>"));
    }

    #[test]
    fn login_request_and_result_share_an_id() {
        let request = login_request("alice", "hunter2", "home");
        assert!(request.contains("<username>alice</username>"));
        assert!(request.contains("<password>hunter2</password>"));
        assert!(request.contains("<resource>home</resource>"));

        let reply = login_ok();
        assert!(reply.contains("id='0001'"));
        assert!(request.contains("id='0001'"));
    }

    #[test]
    fn digest_login_has_no_password_element() {
        let request = login_request_digest("alice", "abc123", "home");
        assert!(request.contains("<digest>abc123</digest>"));
        assert!(!request.contains("<password>"));
    }

    #[test]
    fn no_recipient_is_addressed_back_to_the_sender() {
        let xml = no_recipient("b@ex.org/r2", "a@ex.org/r1");
        assert!(xml.contains("to='a@ex.org/r1'"));
        assert!(xml.contains("from='b@ex.org/r2'"));
        assert!(xml.contains("type='error'"));
    }
}
