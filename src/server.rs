//! The server side of the discovery protocol.
//!
//! A [`Server`] binds one UDP socket, optionally joins the well-known
//! multicast group, and then answers signed discovery requests until it is
//! closed.  For every inbound datagram it:
//!
//! 1. Decodes and verifies the envelope against the key directory; anything
//!    unverifiable is dropped silently.
//! 2. Ignores envelopes addressed to a different name.
//! 3. Hands the decoded [`Request`] to the application's protocol callback.
//! 4. Signs a [`Response`] envelope echoing the request's `(id, seq)` and
//!    unicasts it back to the datagram's source address.
//!
//! The receive loop runs on a dedicated thread that blocks on the socket
//! with a short read timeout, so [`Server::close`] only has to flip a flag
//! and join.  The server keeps no per-client state between datagrams; the
//! session id and sequence number are opaque tags it echoes.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::keys::KeyDirectory;
use crate::netif::{self, AddrFamily, MULTICAST_V4_GROUP, MULTICAST_V6_GROUP};
use crate::protocol::{
    decode_request, decode_with_directory, encode_envelope, encode_response, Envelope, Request,
    Response, MAX_DATAGRAM_SIZE,
};

/// How long a blocking receive waits before re-checking the shutdown flag.
/// Bounds how long [`Server::close`] can take.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Error type for server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Interface resolution failed (unknown name or no capable interface).
    #[error(transparent)]
    Interface(#[from] netif::NetifError),

    /// The UDP socket could not be bound or the multicast group could not
    /// be joined.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called on a server whose receive loop is already up.
    #[error("server already running")]
    AlreadyRunning,
}

/// Application callback deciding how to answer a decoded request.
///
/// Invoked on the receive thread with the sender's address and the request.
/// Returning an error turns into a response whose `error` field carries
/// `"protocol fail: <message>"` and empty data.
pub type ProtocolHandler = Arc<
    dyn Fn(SocketAddr, &Request) -> Result<Response, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Configuration for a discovery server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Identity this server answers to.  Envelopes addressed to any other
    /// name are dropped.
    pub name: String,
    /// Key used to sign every response envelope.
    pub private_key: RsaPrivateKey,
    /// Directory of client public keys trusted to send requests.
    pub pub_keys: Arc<KeyDirectory>,
    /// Interface to serve on, by OS name.  `None` binds the unspecified
    /// address and joins the multicast group on the OS default interface.
    pub interface: Option<String>,
    /// Address family restriction; [`AddrFamily::Any`] picks per interface.
    pub family: AddrFamily,
    /// UDP port to bind; 0 requests an ephemeral port, readable back
    /// through [`Server::port`] once started.
    pub port: u16,
    /// Skip the multicast group join; clients are expected to reach the
    /// server by broadcast or loopback unicast instead.
    pub not_multicast: bool,
}

/// A discovery server: one bound socket plus a background receive loop.
pub struct Server {
    config: ServerConfig,
    protocol: ProtocolHandler,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    port: u16,
}

impl Server {
    /// Creates a server that will answer requests with `protocol`.  No
    /// socket is opened until [`Server::start`].
    pub fn new<F>(config: ServerConfig, protocol: F) -> Self
    where
        F: Fn(SocketAddr, &Request) -> Result<Response, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            config,
            protocol: Arc::new(protocol),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            port: 0,
        }
    }

    /// Resolves the interface, binds the socket, joins the multicast group
    /// when applicable, and spawns the receive loop.
    ///
    /// Returns promptly; the loop runs in the background until
    /// [`Server::close`].
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.worker.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        let netif = match &self.config.interface {
            Some(name) => Some(netif::lookup(name)?),
            None => None,
        };
        let socket = bind_socket(netif.as_ref(), &self.config)?;
        self.port = socket
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: (Ipv4Addr::UNSPECIFIED, self.config.port).into(),
                source,
            })?
            .port();

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let protocol = Arc::clone(&self.protocol);
        let name = self.config.name.clone();
        let private_key = self.config.private_key.clone();
        let pub_keys = Arc::clone(&self.config.pub_keys);

        let worker = std::thread::Builder::new()
            .name("lan-discover-server".to_string())
            .spawn(move || {
                serve_loop(socket, name, private_key, pub_keys, protocol, running);
            })
            .expect("failed to spawn discovery server thread");
        self.worker = Some(worker);

        info!("discovery server listening on UDP port {}", self.port);
        Ok(())
    }

    /// The port the socket is actually bound to.  Meaningful after
    /// [`Server::start`]; this is how callers learn an ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stops the receive loop and waits for it to exit.  Idempotent; the
    /// wait is bounded by the loop's read timeout.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// Binds the unspecified address of the resolved family and joins the
/// discovery multicast group when the configuration asks for one.
fn bind_socket(
    netif: Option<&pnet_datalink::NetworkInterface>,
    config: &ServerConfig,
) -> Result<UdpSocket, ServerError> {
    let family = netif::resolve_family(netif, config.family);
    let bind_addr: SocketAddr = match family {
        AddrFamily::V6 => (Ipv6Addr::UNSPECIFIED, config.port).into(),
        _ => (Ipv4Addr::UNSPECIFIED, config.port).into(),
    };
    let bind_err = |source| ServerError::Bind {
        addr: bind_addr,
        source,
    };

    // socket2 for SO_REUSEADDR: several multicast listeners may share a
    // well-known port on one host.
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(bind_addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&bind_addr.into()).map_err(bind_err)?;
    let socket: UdpSocket = socket.into();

    // Join the all-nodes group unless multicast was disabled or the
    // interface cannot carry it.  Loopback discovery is plain unicast.
    let join_group = !config.not_multicast
        && netif.map_or(true, |i| i.is_multicast() && !i.is_loopback());
    if join_group {
        match family {
            AddrFamily::V6 => {
                let index = netif.map(|i| i.index).unwrap_or(0);
                socket
                    .join_multicast_v6(&MULTICAST_V6_GROUP, index)
                    .map_err(bind_err)?;
            }
            _ => {
                let iface = netif
                    .and_then(netif::first_ipv4_addr)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                socket
                    .join_multicast_v4(&MULTICAST_V4_GROUP, &iface)
                    .map_err(bind_err)?;
            }
        }
    }

    socket.set_read_timeout(Some(SHUTDOWN_POLL)).map_err(bind_err)?;
    Ok(socket)
}

/// The receive loop executed on the server thread.  Per-datagram problems
/// are logged and skipped; only the shutdown flag ends the loop.
fn serve_loop(
    socket: UdpSocket,
    name: String,
    private_key: RsaPrivateKey,
    pub_keys: Arc<KeyDirectory>,
    protocol: ProtocolHandler,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    while running.load(Ordering::Relaxed) {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("discovery recv error: {e}");
                continue;
            }
        };

        let envelope = match decode_with_directory(&buf[..len], &pub_keys) {
            Ok(env) => env,
            Err(e) => {
                debug!("dropping unverifiable datagram from {src}: {e}");
                continue;
            }
        };
        if envelope.to != name {
            debug!(
                "ignoring datagram for {:?} (we are {:?})",
                envelope.to, name
            );
            continue;
        }
        let request = match decode_request(&envelope.payload) {
            Ok(req) => req,
            Err(e) => {
                debug!("dropping request with malformed body from {src}: {e}");
                continue;
            }
        };
        debug!(
            "request from {:?} at {src}: id={} seq={}",
            envelope.from, envelope.id, envelope.seq
        );

        let response = match protocol(src, &request) {
            Ok(resp) => resp,
            Err(e) => Response {
                data: Vec::new(),
                error: Some(format!("protocol fail: {e}")),
                ..Response::default()
            },
        };

        let reply = Envelope {
            from: name.clone(),
            to: envelope.from,
            id: envelope.id,
            seq: envelope.seq,
            payload: encode_response(&response),
        };
        match encode_envelope(&reply, &private_key) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, src) {
                    warn!("failed to send response to {src}: {e}");
                }
            }
            Err(e) => error!("failed to encode response envelope: {e}"),
        }
    }

    info!("discovery server stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be
/// retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
