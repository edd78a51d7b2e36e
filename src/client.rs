//! The client side of the discovery protocol.
//!
//! [`Client::discover`] drives the whole exchange: pick an interface and a
//! destination (loopback unicast, directed broadcast, or the multicast
//! group), sign and transmit a request, and wait for a response signed by
//! the pinned server key.  Two clocks govern the wait:
//!
//! - **deadline** – how long one attempt listens before the request is
//!   retransmitted with the next sequence number;
//! - **timeout**  – the wall-clock budget for the whole call, after which
//!   it fails with [`ClientError::NotFound`].
//!
//! The first successful discovery caches a session: the responder's
//! address and the session id.  Later calls unicast straight to that
//! address with the same id, skipping interface selection entirely; the
//! sequence number starts from zero again each call and only increments on
//! retransmits within the call.
//!
//! A `Client` is not reentrant — callers serialize `discover` invocations.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::netif::{self, AddrFamily};
use crate::protocol::{
    decode_response, decode_with_key, encode_envelope, encode_request, CodecError, Envelope,
    Request, Response, MAX_DATAGRAM_SIZE,
};

/// Overall budget for one `discover` call when the configuration leaves
/// `timeout` at zero.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-attempt listen window when the configuration leaves `deadline` at
/// zero.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(1);

/// Error type for client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Interface resolution failed (unknown name or no capable interface).
    #[error(transparent)]
    Interface(#[from] netif::NetifError),

    /// The UDP socket could not be bound or configured.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Sending or receiving on the socket failed with something other than
    /// a timeout.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Building or signing the request envelope failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The application's request callback failed.
    #[error("request callback failed: {0}")]
    Request(String),

    /// The overall timeout elapsed without a valid response.
    #[error("can't find the server")]
    NotFound,

    /// The server's protocol callback rejected the request; the text is
    /// the server-sent `"protocol fail: ..."` message.
    #[error("{0}")]
    Protocol(String),
}

/// Application callback producing the request body for one attempt.  Called
/// with the destination address every time a datagram is about to be sent.
pub type RequestBuilder =
    Box<dyn Fn(SocketAddr) -> Result<Request, Box<dyn std::error::Error + Send + Sync>>>;

/// Configuration for a discovery client.
#[derive(Clone)]
pub struct ClientConfig {
    /// Identity the server answers to; responses from any other name are
    /// dropped.
    pub server_name: String,
    /// The server's public key, pinned out-of-band.  Responses are verified
    /// against this key directly, never through a directory.
    pub server_key: RsaPublicKey,
    /// This client's identity name.
    pub name: String,
    /// Key used to sign every request envelope.
    pub private_key: RsaPrivateKey,
    /// Interface to discover through, by OS name.  `None` leaves routing to
    /// the OS.
    pub interface: Option<String>,
    /// Address family restriction; [`AddrFamily::Any`] picks per interface.
    pub family: AddrFamily,
    /// UDP port the server listens on.
    pub port: u16,
    /// Use directed broadcast instead of the multicast group.
    pub not_multicast: bool,
    /// Wall-clock budget for a whole `discover` call.  Zero means
    /// [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Listen window per attempt before retransmitting.  Zero means
    /// [`DEFAULT_DEADLINE`].
    pub deadline: Duration,
}

/// Cached result of a successful discovery.  The sequence number is not
/// cached: it starts from zero again on every call.
struct Session {
    peer: SocketAddr,
    id: Uuid,
}

/// A discovery client.  Holds the configuration, the request callback, and
/// the session cache.
pub struct Client {
    config: ClientConfig,
    request: RequestBuilder,
    session: Option<Session>,
}

impl Client {
    /// Creates a client that builds request bodies with `request`.
    pub fn new<F>(config: ClientConfig, request: F) -> Self
    where
        F: Fn(SocketAddr) -> Result<Request, Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        Self {
            config,
            request: Box::new(request),
            session: None,
        }
    }

    /// Locates the server and runs one request/response exchange.
    ///
    /// On the first call this resolves the interface, derives the
    /// destination, and transmits until a verified response arrives or the
    /// timeout elapses.  Subsequent calls on the same client unicast to the
    /// cached peer with the cached session id.
    pub fn discover(&mut self) -> Result<Response, ClientError> {
        let timeout = if self.config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.config.timeout
        };
        let deadline = if self.config.deadline.is_zero() {
            DEFAULT_DEADLINE
        } else {
            self.config.deadline
        };

        // Init: reuse the cached session or resolve a fresh destination.
        let (dest, id, netif) = match &self.session {
            Some(session) => (session.peer, session.id, None),
            None => {
                let netif = match &self.config.interface {
                    Some(name) => Some(netif::lookup(name)?),
                    None => None,
                };
                let dest = netif::destination_for(
                    netif.as_ref(),
                    self.config.family,
                    self.config.port,
                    self.config.not_multicast,
                )?;
                (dest, Uuid::new_v4(), netif)
            }
        };
        let socket = open_socket(dest, netif.as_ref(), self.config.not_multicast)?;

        let started = Instant::now();
        let mut seq: u64 = 0;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            if started.elapsed() >= timeout {
                return Err(ClientError::NotFound);
            }

            // Requesting: a fresh body from the callback, signed and sent.
            let request = (self.request)(dest).map_err(|e| ClientError::Request(e.to_string()))?;
            let envelope = Envelope {
                from: self.config.name.clone(),
                to: self.config.server_name.clone(),
                id,
                seq,
                payload: encode_request(&request),
            };
            let bytes = encode_envelope(&envelope, &self.config.private_key)?;
            socket.send_to(&bytes, dest)?;
            debug!("sent discovery request to {dest}: id={id} seq={seq}");

            // Awaiting: keep reading until this attempt's window closes,
            // so a bogus datagram does not consume the whole deadline.
            let attempt_budget = deadline.min(timeout.saturating_sub(started.elapsed()));
            let attempt_started = Instant::now();
            loop {
                let Some(remaining) = attempt_budget
                    .checked_sub(attempt_started.elapsed())
                    .filter(|d| !d.is_zero())
                else {
                    break;
                };
                socket.set_read_timeout(Some(remaining))?;

                let (len, src) = match socket.recv_from(&mut buf) {
                    Ok(pair) => pair,
                    Err(e) if is_timeout_error(&e) => break,
                    Err(e) => return Err(e.into()),
                };
                let Some(mut response) = self.accept(&buf[..len], src, id, seq) else {
                    continue;
                };

                // Done: surface an application failure, otherwise cache the
                // session and hand the response back.
                if let Some(text) = response.error.take() {
                    return Err(ClientError::Protocol(text));
                }
                self.session = Some(Session { peer: src, id });
                response.id = id;
                response.seq = seq;
                debug!("discovered server at {src}: id={id} seq={seq}");
                return Ok(response);
            }

            seq += 1;
        }
    }

    /// Validates one inbound datagram against the pinned key and the
    /// current attempt.  Anything that does not match is dropped so the
    /// read loop keeps waiting.
    fn accept(&self, bytes: &[u8], src: SocketAddr, id: Uuid, seq: u64) -> Option<Response> {
        let envelope = match decode_with_key(bytes, &self.config.server_key) {
            Ok(env) => env,
            Err(e) => {
                debug!("dropping unverifiable datagram from {src}: {e}");
                return None;
            }
        };
        if envelope.from != self.config.server_name || envelope.to != self.config.name {
            debug!(
                "dropping response from {:?} to {:?} (expected {:?} to {:?})",
                envelope.from, envelope.to, self.config.server_name, self.config.name
            );
            return None;
        }
        if envelope.id != id || envelope.seq != seq {
            debug!(
                "dropping response with stale session tags from {src}: id={} seq={}",
                envelope.id, envelope.seq
            );
            return None;
        }
        match decode_response(&envelope.payload) {
            Ok(resp) => Some(resp),
            Err(e) => {
                debug!("dropping response with malformed body from {src}: {e}");
                None
            }
        }
    }
}

/// Binds an ephemeral socket matching the destination's family and applies
/// the send-mode options: multicast scoping (with local loopback, so
/// same-host discovery works) or `SO_BROADCAST`.
fn open_socket(
    dest: SocketAddr,
    netif: Option<&pnet_datalink::NetworkInterface>,
    not_multicast: bool,
) -> Result<UdpSocket, ClientError> {
    let bind_addr: SocketAddr = match dest {
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
    };
    let bind_err = |source| ClientError::Bind {
        addr: bind_addr,
        source,
    };

    // socket2: std's UdpSocket cannot scope multicast sends to an
    // interface (IP_MULTICAST_IF).
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(bind_addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_err)?;
    socket.bind(&bind_addr.into()).map_err(bind_err)?;

    if dest.ip().is_multicast() {
        match dest {
            SocketAddr::V6(_) => {
                let index = netif.map(|i| i.index).unwrap_or(0);
                socket.set_multicast_if_v6(index).map_err(bind_err)?;
                socket.set_multicast_loop_v6(true).map_err(bind_err)?;
            }
            SocketAddr::V4(_) => {
                if let Some(addr) = netif.and_then(netif::first_ipv4_addr) {
                    socket.set_multicast_if_v4(&addr).map_err(bind_err)?;
                }
                socket.set_multicast_loop_v4(true).map_err(bind_err)?;
            }
        }
    } else if not_multicast {
        socket.set_broadcast(true).map_err(bind_err)?;
    }

    Ok(socket.into())
}

/// Returns `true` for OS timeout / would-block errors that end an attempt
/// rather than the whole call.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netif::Capability;
    use crate::test_keys;

    fn test_config() -> ClientConfig {
        ClientConfig {
            server_name: "master".to_string(),
            server_key: test_keys::server_key().to_public_key(),
            name: "slave".to_string(),
            private_key: test_keys::client_key().clone(),
            interface: None,
            family: AddrFamily::Any,
            port: 0,
            not_multicast: false,
            timeout: Duration::ZERO,
            deadline: Duration::ZERO,
        }
    }

    fn plain_request(_dst: SocketAddr) -> Result<Request, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Request::new(*b"request"))
    }

    #[test]
    fn test_unknown_interface_name_fails_before_any_send() {
        // Arrange
        let mut config = test_config();
        config.interface = Some(":)".to_string());
        let mut client = Client::new(config, plain_request);

        // Act
        let err = client.discover().expect_err("interface :) cannot exist");

        // Assert – the stable error string callers match on.
        assert_eq!(err.to_string(), "none interface with this name");
    }

    /// With nobody listening, `discover` must give up between `timeout`
    /// and `timeout + deadline`.
    #[test]
    fn test_timeout_yields_not_found_within_the_budget() {
        // Arrange – loopback keeps the retransmissions off the real LAN.
        let mut config = test_config();
        config.interface = netif::discover(Capability::Loopback).ok();
        config.family = AddrFamily::V4;
        config.port = 6465;
        config.timeout = Duration::from_millis(300);
        config.deadline = Duration::from_millis(50);
        let mut client = Client::new(config, plain_request);

        // Act
        let started = Instant::now();
        let err = client.discover().expect_err("nobody is listening");
        let elapsed = started.elapsed();

        // Assert
        assert!(matches!(err, ClientError::NotFound));
        assert_eq!(err.to_string(), "can't find the server");
        assert!(
            elapsed >= Duration::from_millis(300),
            "must not give up before the timeout, took {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_millis(1000),
            "must give up soon after timeout + deadline, took {elapsed:?}"
        );
    }

    /// A failing request callback is fatal for the call, not retried until
    /// the timeout.
    #[test]
    fn test_request_callback_failure_is_fatal() {
        let mut config = test_config();
        config.interface = netif::discover(Capability::Loopback).ok();
        config.family = AddrFamily::V4;
        config.port = 6465;
        config.timeout = Duration::from_secs(5);
        let mut client = Client::new(config, |_dst| Err("no payload today".into()));

        let started = Instant::now();
        let err = client.discover().expect_err("callback always fails");

        assert!(matches!(err, ClientError::Request(_)));
        assert!(err.to_string().contains("no payload today"));
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "callback failure must not wait for the timeout"
        );
    }

    #[test]
    fn test_zero_durations_fall_back_to_defaults() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(10));
        assert_eq!(DEFAULT_DEADLINE, Duration::from_secs(1));
    }
}
