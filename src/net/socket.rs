//! Broker-facing socket with bounded polling.
//!
//! Wraps a non-blocking [`mio::net::UdpSocket`] aimed at a single broker
//! endpoint: one datagram carries one encoded [`Message`]. The socket is
//! exclusively owned by its peer engine (tracker or worker) and is replaced
//! wholesale on a detected outage rather than rebound.

use std::io::{self, ErrorKind};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::message::{self, Message, MAX_MESSAGE_SIZE};
use crate::trace::warn;

use super::Endpoint;

const RECV_TOKEN: Token = Token(0);

/// Errors sending or receiving on a [`BrokerSocket`].
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying socket I/O failed.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// Outbound message could not be encoded.
    #[error("wire error: {0}")]
    Wire(#[from] message::WireError),
}

/// A non-blocking datagram socket connected to one broker endpoint.
///
/// All receive paths are poll-then-drain with a caller-supplied bound;
/// nothing here blocks indefinitely.
pub struct BrokerSocket {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    broker: Endpoint,
    send_buf: Vec<u8>,
    recv_buf: Box<[u8; MAX_MESSAGE_SIZE]>,
}

impl BrokerSocket {
    /// Creates a socket bound to an ephemeral local port, aimed at `broker`.
    ///
    /// Socket creation is eager: the port is bound and registered for
    /// readiness before this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or poll registration fails.
    pub fn connect(broker: Endpoint) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(Endpoint::any(0).into())?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, RECV_TOKEN, Interest::READABLE)?;

        Ok(Self {
            socket,
            poll,
            events: Events::with_capacity(4),
            broker,
            send_buf: Vec::new(),
            recv_buf: Box::new([0u8; MAX_MESSAGE_SIZE]),
        })
    }

    /// Returns the broker endpoint this socket is aimed at.
    #[must_use]
    pub const fn broker(&self) -> Endpoint {
        self.broker
    }

    /// Re-aims this socket at a different broker endpoint. Subsequent
    /// sends go to the new endpoint; the local binding is unchanged.
    pub fn retarget(&mut self, broker: Endpoint) {
        self.broker = broker;
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.socket.local_addr().map(Endpoint::from)
    }

    /// Encodes `msg` and transmits it to the broker as one datagram.
    ///
    /// A transient `WouldBlock` drops the datagram with a warning; the
    /// retry and heartbeat machinery above this layer absorbs the loss.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the send fails outright.
    pub fn send(&mut self, msg: &Message) -> Result<(), SocketError> {
        message::encode(msg, &mut self.send_buf)?;
        match self.socket.send_to(&self.send_buf, self.broker.into()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!(broker = %self.broker, "send buffer full, dropping datagram");
                Ok(())
            }
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Receives and decodes at most one inbound message, waiting up to
    /// `timeout` for readiness. `Duration::ZERO` is a pure non-blocking
    /// check.
    ///
    /// Malformed datagrams are logged and dropped (`Ok(None)`), never an
    /// error: a structurally invalid message must have no further effect.
    ///
    /// # Errors
    ///
    /// Returns an error only on genuine socket I/O failure.
    pub fn poll_recv(&mut self, timeout: Duration) -> io::Result<Option<Message>> {
        if let Some(msg) = self.try_recv()? {
            return Ok(Some(msg));
        }
        if timeout.is_zero() {
            return Ok(None);
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // Interrupted polls behave like an empty wakeup.
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(e),
        }
        self.try_recv()
    }

    /// Non-blocking receive of one datagram, decoded.
    fn try_recv(&mut self) -> io::Result<Option<Message>> {
        let len = match self.socket.recv_from(self.recv_buf.as_mut_slice()) {
            Ok((len, _from)) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        match message::decode(&self.recv_buf[..len]) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                warn!(error = %e, len, "dropping malformed datagram");
                Ok(None)
            }
        }
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        use std::os::fd::AsFd;
        rustix::net::sockopt::set_socket_recv_buffer_size(self.socket.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        use std::os::fd::AsFd;
        Ok(rustix::net::sockopt::get_socket_recv_buffer_size(
            self.socket.as_fd(),
        )?)
    }
}
