//! Local routing: delivery between hosted users, misses, and login
//! collisions.

mod common;

use std::time::Duration;

use common::{has_attr, spawn_server, TestClient};

#[test]
fn delivers_between_local_clients_and_stamps_the_sender() {
    let server = spawn_server("ex.org", "hush", 1);
    let mut a = TestClient::login(server.client_addr, "ex.org", "a", "r1");
    let mut b = TestClient::login(server.client_addr, "ex.org", "b", "r2");

    a.message("b@ex.org/r2", "hi");

    let got = b.read_until("</message>");
    assert!(has_attr(&got, "to", "b@ex.org/r2"), "{}", got);
    assert!(has_attr(&got, "from", "a@ex.org/r1"), "{}", got);
    assert!(got.contains("hi"));
}

#[test]
fn sender_cannot_forge_its_origin() {
    let server = spawn_server("ex.org", "hush", 1);
    let mut a = TestClient::login(server.client_addr, "ex.org", "a", "r1");
    let mut b = TestClient::login(server.client_addr, "ex.org", "b", "r2");

    a.send("<message to='b@ex.org/r2' from='admin@ex.org/root'><body>psst</body></message>");

    let got = b.read_until("</message>");
    assert!(has_attr(&got, "from", "a@ex.org/r1"), "{}", got);
    assert!(!got.contains("admin@ex.org/root"), "{}", got);
}

#[test]
fn missing_recipient_bounces_exactly_one_error() {
    let server = spawn_server("ex.org", "hush", 1);
    let mut a = TestClient::login(server.client_addr, "ex.org", "a", "r1");

    a.message("b@ex.org/r2", "anyone home");

    let got = a.read_until("type='error'");
    assert!(has_attr(&got, "from", "b@ex.org/r2"), "{}", got);
    assert!(has_attr(&got, "to", "a@ex.org/r1"), "{}", got);
    assert_eq!(got.matches("type='error'").count(), 1, "{}", got);
}

#[test]
fn second_login_with_the_same_identifier_wins() {
    let server = spawn_server("ex.org", "hush", 1);
    let mut first = TestClient::login(server.client_addr, "ex.org", "a", "r1");
    let mut second = TestClient::login(server.client_addr, "ex.org", "a", "r1");
    let mut b = TestClient::login(server.client_addr, "ex.org", "b", "r2");

    b.message("a@ex.org/r1", "which one");

    let got = second.read_until("</message>");
    assert!(got.contains("which one"));
    first.assert_no("which one", Duration::from_millis(700));
}

#[test]
fn wrong_domain_in_the_stream_header_is_rejected() {
    let server = spawn_server("ex.org", "hush", 1);
    let stream = std::net::TcpStream::connect(server.client_addr).expect("connect");
    use std::io::{Read, Write};
    let mut stream = stream;
    stream
        .write_all(
            b"<stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' to='other.org' version='1.0'>",
        )
        .expect("send");

    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set timeout");
    let mut response = String::new();
    let mut chunk = [0u8; 1024];
    // Read until the server closes the connection.
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => response.push_str(&String::from_utf8_lossy(&chunk[..n])),
            Err(_) => break,
        }
    }
    assert!(response.contains("<stream:error"), "{}", response);
}

#[test]
fn bad_xml_gets_a_stream_error_before_disconnect() {
    let server = spawn_server("ex.org", "hush", 1);
    let mut a = TestClient::login(server.client_addr, "ex.org", "a", "r1");

    a.send("<message to='b@ex.org'><body></message>");

    let got = a.read_until("<stream:error");
    assert!(got.contains("not-well-formed"), "{}", got);
}
