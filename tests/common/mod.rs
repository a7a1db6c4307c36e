//! Test utilities for end-to-end routing tests.
//!
//! Provides helpers for starting servers on ephemeral loopback ports and
//! driving raw socket clients through the wire protocol.

#![allow(dead_code)]

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use jabberwock::{ChatServer, ServerConfig, WaitTimeout};

pub struct TestServer {
    pub client_addr: SocketAddr,
    pub s2s_addr: SocketAddr,
}

/// Start a server on ephemeral loopback ports, serving from its own thread
/// for the rest of the test process. `s2s_dial_port` is the port it uses
/// when dialing peer servers.
pub fn spawn_server(domain: &str, secret: &str, s2s_dial_port: u16) -> TestServer {
    let domain = domain.to_string();
    let secret = secret.to_string();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let config = ServerConfig::new(domain, secret).with_s2s_port(s2s_dial_port);
        let mut server = ChatServer::new(config);
        server.listen(0, 0, "127.0.0.1").expect("listen failed");
        tx.send((
            server.client_addr().expect("client addr"),
            server.s2s_addr().expect("s2s addr"),
        ))
        .expect("server thread could not report its addresses");

        loop {
            // Wait errors are interruptions; keep serving.
            let _ = server.step(WaitTimeout::Secs(1));
        }
    });

    let (client_addr, s2s_addr) = rx.recv().expect("server failed to start");
    TestServer {
        client_addr,
        s2s_addr,
    }
}

/// Attribute check that tolerates either quoting style in serialized XML.
pub fn has_attr(xml: &str, name: &str, value: &str) -> bool {
    xml.contains(&format!("{}='{}'", name, value))
        || xml.contains(&format!("{}=\"{}\"", name, value))
}

/// A raw socket client speaking the wire protocol directly.
pub struct TestClient {
    stream: TcpStream,
    buf: String,
}

impl TestClient {
    /// Open a stream to the server without logging in.
    pub fn connect(addr: SocketAddr, domain: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .expect("set_read_timeout");
        let mut client = Self {
            stream,
            buf: String::new(),
        };
        client.send(&format!(
            "<stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' to='{}' version='1.0'>",
            domain
        ));
        client.read_until("<stream:features>");
        client
    }

    /// Open a stream and complete the login handshake.
    pub fn login(addr: SocketAddr, domain: &str, user: &str, resource: &str) -> Self {
        let mut client = Self::connect(addr, domain);
        client.send(&format!(
            "<iq type='set'><query xmlns='jabber:iq:auth'>\
             <username>{}</username><password>pw</password><resource>{}</resource>\
             </query></iq>",
            user, resource
        ));
        client.read_until("type='result'");
        client.clear();
        client
    }

    pub fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).expect("send failed");
    }

    pub fn message(&mut self, to: &str, body: &str) {
        self.send(&format!(
            "<message to='{}'><body>{}</body></message>",
            to, body
        ));
    }

    /// Read until the buffer contains `needle`; panics after five seconds.
    pub fn read_until(&mut self, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut chunk = [0u8; 1024];
        while !self.buf.contains(needle) {
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {:?}; buffer so far: {:?}",
                needle,
                self.buf
            );
            match self.stream.read(&mut chunk) {
                Ok(0) => panic!(
                    "server closed the connection; buffer so far: {:?}",
                    self.buf
                ),
                Ok(n) => self.buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut => {}
                Err(err) => panic!("read error: {}", err),
            }
        }
        self.buf.clone()
    }

    /// Assert nothing containing `needle` arrives within `quiet`.
    pub fn assert_no(&mut self, needle: &str, quiet: Duration) {
        let deadline = Instant::now() + quiet;
        let mut chunk = [0u8; 1024];
        while Instant::now() < deadline {
            match self.stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(_) => {}
            }
        }
        assert!(
            !self.buf.contains(needle),
            "unexpectedly received {:?}: {:?}",
            needle,
            self.buf
        );
    }

    pub fn buffer(&self) -> &str {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
