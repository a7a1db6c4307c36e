//! Poll-based socket multiplexer. Single-threaded, using a `poll` loop.
//!
//! Owns every listening and connected socket, blocks in one readiness wait,
//! and hands accepted connections and received bytes to a [`SocketHandler`].
//! Callbacks are free to send, dial, or disconnect through the multiplexer
//! they are handed, including dropping the socket currently being read.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::ChatError;

/// Socket identity. Unique per live socket; the OS may reuse it after close.
pub type SockId = i32;

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024;

/// Upper bound for one blocking wait; an "infinite" wait loops over this.
const WAIT_CHUNK: Duration = Duration::from_secs(3600);

/// How long a readiness wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Block until something is ready.
    Forever,
    /// Return immediately.
    Poll,
    /// Block for at most this many seconds.
    Secs(u64),
}

impl WaitTimeout {
    /// Interpret a signed second count: negative blocks, zero polls.
    pub fn from_secs(secs: i64) -> Self {
        if secs < 0 {
            Self::Forever
        } else if secs == 0 {
            Self::Poll
        } else {
            Self::Secs(secs as u64)
        }
    }

    fn duration(self) -> Duration {
        match self {
            Self::Forever => WAIT_CHUNK,
            Self::Poll => Duration::ZERO,
            Self::Secs(secs) => Duration::from_secs(secs),
        }
    }
}

/// Callbacks invoked by the multiplexer as sockets become ready.
pub trait SocketHandler {
    /// Bytes arrived on `id`. `parent` is the listener that accepted it, if any.
    fn on_data(&mut self, mux: &mut Multiplexer, id: SockId, data: &[u8], parent: Option<SockId>);

    /// The peer on `id` performed an orderly shutdown or the read failed.
    /// The socket is deregistered after this returns.
    fn on_close(&mut self, mux: &mut Multiplexer, id: SockId);
}

enum Endpoint {
    Listener(TcpListener),
    Peer {
        stream: TcpStream,
        parent: Option<SockId>,
    },
}

/// A single-threaded non-blocking socket multiplexer.
pub struct Multiplexer {
    sources: popol::Sources<SockId>,
    records: HashMap<SockId, Endpoint>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            sources: popol::Sources::new(),
            records: HashMap::new(),
        }
    }

    /// Number of registered sockets, listeners included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether `id` is still registered.
    pub fn is_open(&self, id: SockId) -> bool {
        self.records.contains_key(&id)
    }

    /// Local address of a registered socket.
    pub fn local_addr(&self, id: SockId) -> Result<SocketAddr, ChatError> {
        match self.records.get(&id) {
            Some(Endpoint::Listener(listener)) => Ok(listener.local_addr()?),
            Some(Endpoint::Peer { stream, .. }) => Ok(stream.local_addr()?),
            None => Err(ChatError::NotConnected),
        }
    }

    /// Bind and register a listening socket. The listener is non-blocking so
    /// the dispatcher can drain its accept backlog without stalling.
    pub fn open_tcp_listener(&mut self, port: u16, bind_ip: &str) -> Result<SockId, ChatError> {
        let listener = TcpListener::bind((bind_ip, port))?;
        listener.set_nonblocking(true)?;

        let id = listener.as_raw_fd();
        self.sources.register(id, &listener, popol::interest::READ);
        self.records.insert(id, Endpoint::Listener(listener));

        debug!("listening on {} (socket {})", self.local_addr(id)?, id);
        Ok(id)
    }

    /// Dial an outbound connection and register it. TCP_NODELAY is set.
    pub fn open_tcp_client(&mut self, port: u16, host: &str) -> Result<SockId, ChatError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;

        let id = stream.as_raw_fd();
        self.sources.register(id, &stream, popol::interest::READ);
        self.records.insert(id, Endpoint::Peer { stream, parent: None });

        debug!("connected to {}:{} (socket {})", host, port, id);
        Ok(id)
    }

    /// One readiness wait over every registered socket, dispatching ready
    /// listeners to `accept` and ready peers to the read loop. Returns the
    /// number of ready sockets consumed; an expired timeout returns zero.
    ///
    /// An interrupted wait surfaces as an error; callers retry.
    pub fn wait_all(
        &mut self,
        timeout: WaitTimeout,
        handler: &mut dyn SocketHandler,
    ) -> io::Result<usize> {
        let mut events = popol::Events::new();

        match self.sources.wait_timeout(&mut events, timeout.duration()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        }

        // Snapshot the ready set: callbacks may deregister any of these,
        // including the one being read. Each id is re-checked at dispatch.
        let ready: Vec<SockId> = events.iter().map(|(id, _)| *id).collect();
        let num_active = ready.len();
        trace!("{} socket(s) ready", num_active);

        for id in ready {
            self.dispatch(id, handler);
        }

        Ok(num_active)
    }

    /// Readiness wait restricted to a single socket. Used by outbound
    /// sessions that drive one connection synchronously.
    pub fn wait_one(
        &mut self,
        id: SockId,
        timeout: WaitTimeout,
        handler: &mut dyn SocketHandler,
    ) -> io::Result<usize> {
        let stream = match self.records.get(&id) {
            Some(Endpoint::Peer { stream, .. }) => match stream.try_clone() {
                Ok(stream) => stream,
                Err(err) => return Err(err),
            },
            _ => return Ok(0),
        };

        let mut sources = popol::Sources::new();
        sources.register(id, &stream, popol::interest::READ);

        let mut events = popol::Events::new();
        match sources.wait_timeout(&mut events, timeout.duration()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(err) => return Err(err),
        }

        if events.iter().next().is_none() {
            return Ok(0);
        }
        self.dispatch(id, handler);
        Ok(1)
    }

    fn dispatch(&mut self, id: SockId, handler: &mut dyn SocketHandler) {
        let is_listener = match self.records.get(&id) {
            Some(Endpoint::Listener(_)) => true,
            Some(Endpoint::Peer { .. }) => false,
            // Yanked by an earlier callback this round.
            None => return,
        };

        if is_listener {
            self.accept_pending(id);
        } else {
            self.read_peer(id, handler);
        }
    }

    /// Drain the accept backlog of a ready listener, registering each new
    /// peer with the listener as its parent.
    fn accept_pending(&mut self, id: SockId) {
        loop {
            let accepted = match self.records.get(&id) {
                Some(Endpoint::Listener(listener)) => listener.accept(),
                _ => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    trace!("socket {}: accepted connection from {}", id, addr);
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("could not set nodelay on connection from {}: {}", addr, err);
                    }
                    let peer_id = stream.as_raw_fd();
                    self.sources.register(peer_id, &stream, popol::interest::READ);
                    self.records.insert(
                        peer_id,
                        Endpoint::Peer {
                            stream,
                            parent: Some(id),
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    error!("accept error on socket {}: {}", id, err);
                    return;
                }
            }
        }
    }

    /// Read everything currently available on a peer socket, handing the
    /// handler one chunk at a time. The socket is switched to non-blocking
    /// for the duration and restored afterwards if it survived.
    fn read_peer(&mut self, id: SockId, handler: &mut dyn SocketHandler) {
        let (mut stream, parent) = match self.records.get(&id) {
            Some(Endpoint::Peer { stream, parent }) => match stream.try_clone() {
                Ok(clone) => (clone, *parent),
                Err(err) => {
                    warn!("socket {}: {}", id, err);
                    self.disconnect(id);
                    return;
                }
            },
            _ => return,
        };

        if let Err(err) = stream.set_nonblocking(true) {
            warn!("socket {}: {}", id, err);
            self.disconnect(id);
            return;
        }

        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut dead = false;

        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    trace!("socket {}: peer closed", id);
                    dead = true;
                    break;
                }
                Ok(n) => {
                    trace!("socket {}: read {} bytes", id, n);
                    handler.on_data(self, id, &buf[..n], parent);
                    if !self.records.contains_key(&id) {
                        // The callback dropped this socket; stop reading.
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("read error on socket {}: {}", id, err);
                    dead = true;
                    break;
                }
            }
        }

        if dead {
            handler.on_close(self, id);
            if self.records.contains_key(&id) {
                self.disconnect(id);
            }
            return;
        }

        if self.records.contains_key(&id) {
            if let Err(err) = stream.set_nonblocking(false) {
                warn!("socket {}: {}", id, err);
                self.disconnect(id);
            }
        }
    }

    /// Send `data` on a connected socket, blocking until written.
    pub fn send(&self, id: SockId, data: &[u8]) -> Result<(), ChatError> {
        let mut writer = self.peer_stream(id)?;
        writer.write_all(data)?;
        Ok(())
    }

    /// Wait at most `timeout` for the send buffer to accept new data, then
    /// send. Does not guarantee the peer consumes it.
    pub fn send_with_timeout(
        &self,
        id: SockId,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ChatError> {
        let stream = self.peer_stream(id)?;

        let mut sources = popol::Sources::new();
        sources.register(id, stream, popol::interest::WRITE);

        let mut events = popol::Events::new();
        match sources.wait_timeout(&mut events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                error!("timed out waiting to send on socket {}", id);
                return Err(ChatError::Io(err));
            }
            Err(err) => return Err(ChatError::Io(err)),
        }

        let mut writer = stream;
        writer.write_all(data)?;
        Ok(())
    }

    fn peer_stream(&self, id: SockId) -> Result<&TcpStream, ChatError> {
        match self.records.get(&id) {
            Some(Endpoint::Peer { stream, .. }) => Ok(stream),
            _ => Err(ChatError::NotConnected),
        }
    }

    /// Close and deregister a socket. Unknown ids are ignored, so callbacks
    /// may disconnect sockets that were already torn down.
    pub fn disconnect(&mut self, id: SockId) {
        if let Some(endpoint) = self.records.remove(&id) {
            self.sources.unregister(&id);
            if let Endpoint::Peer { stream, .. } = endpoint {
                stream.shutdown(Shutdown::Both).ok();
            }
            debug!("closed socket {}", id);
        }
    }

    /// Close every registered socket.
    pub fn shutdown(&mut self) {
        let ids: Vec<SockId> = self.records.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}
