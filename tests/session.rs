//! The outbound transport session against a live server.

mod common;

use common::{has_attr, spawn_server, TestClient};

use jabberwock::{AuthType, Session, TransportMessage};

#[test]
fn session_logs_in_sends_and_receives() {
    let server = spawn_server("127.0.0.1", "hush", 1);
    let mut session = Session::new("127.0.0.1", server.client_addr.port());
    session
        .connect("svc", "pw", "worker", 5, AuthType::Plain)
        .expect("login failed");
    assert!(session.is_connected());
    assert!(session.stream_id().is_some());

    let mut b = TestClient::login(server.client_addr, "127.0.0.1", "b", "r2");

    session
        .send(&TransportMessage::new("b@127.0.0.1/r2", "ping"))
        .expect("send failed");
    let got = b.read_until("</message>");
    assert!(got.contains("ping"));
    assert!(has_attr(&got, "from", "svc@127.0.0.1/worker"), "{}", got);

    b.send(
        "<message to='svc@127.0.0.1/worker'>\
         <subject>state</subject><body>pong</body></message>",
    );
    let message = session
        .recv(5)
        .expect("recv failed")
        .expect("no message arrived");
    assert_eq!(message.body, "pong");
    assert_eq!(message.subject, "state");
    assert_eq!(message.from, "b@127.0.0.1/r2");
    assert!(!message.is_error());
}

#[test]
fn digest_login_is_accepted() {
    let server = spawn_server("127.0.0.1", "hush", 1);
    let mut session = Session::new("127.0.0.1", server.client_addr.port());
    session
        .connect("svc", "pw", "digest", 5, AuthType::Digest)
        .expect("digest login failed");
    assert!(session.is_connected());
}

#[test]
fn sending_before_login_is_rejected() {
    let server = spawn_server("127.0.0.1", "hush", 1);
    let mut session = Session::new("127.0.0.1", server.client_addr.port());
    let result = session.send(&TransportMessage::new("b@127.0.0.1/r2", "too soon"));
    assert!(result.is_err());
    drop(server);
}

#[test]
fn bounced_messages_surface_as_errors() {
    let server = spawn_server("127.0.0.1", "hush", 1);
    let mut session = Session::new("127.0.0.1", server.client_addr.port());
    session
        .connect("svc", "pw", "worker", 5, AuthType::Plain)
        .expect("login failed");

    session
        .send(&TransportMessage::new("ghost@127.0.0.1/r9", "hello?"))
        .expect("send failed");

    let message = session
        .recv(5)
        .expect("recv failed")
        .expect("no bounce arrived");
    assert!(message.is_error());
    assert_eq!(message.error_code, 404);
    assert_eq!(message.from, "ghost@127.0.0.1/r9");
}
