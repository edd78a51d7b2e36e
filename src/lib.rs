//! # lan-discover
//!
//! LAN peer discovery over UDP with mutually authenticated, signed
//! request/response envelopes.
//!
//! A client that knows a server only by *name* — not by address — can
//! locate it on the local network, verify that the answer really came from
//! the holder of the server's pinned RSA key, and run one
//! application-defined request/response exchange, all over plain UDP.
//!
//! # How discovery works (for beginners)
//!
//! The client does not know where the server lives, so it cannot unicast a
//! question to it.  Instead it sends the signed request somewhere every
//! local machine can hear:
//!
//! 1. the **multicast** all-nodes group (`224.0.0.1` / `ff02::1`) on a
//!    multicast-capable interface — the default;
//! 2. the interface's IPv4 **directed broadcast** address when multicast is
//!    disabled;
//! 3. plain **loopback** unicast when discovering a server on the same
//!    machine.
//!
//! Every machine on the segment receives the datagram, but only the server
//! whose *name* matches the envelope's receiver field — and whose key
//! directory contains the client's public key — answers, with a unicast
//! response signed by its own private key.  The client verifies that
//! signature against the server key it was given out-of-band, remembers the
//! responder's address, and talks to it directly from then on.
//!
//! Both directions are authenticated but not encrypted: envelopes are
//! signed, payloads travel in the clear.
//!
//! # Modules
//!
//! - **`protocol`** – The signed envelope wire format and its codec.
//! - **`keys`**     – The directory of trusted public keys.
//! - **`netif`**    – Interface selection and destination derivation.
//! - **`server`**   – Binds a socket and answers requests in the background.
//! - **`client`**   – Drives the discovery state machine.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lan_discover::{
//!     AddrFamily, Client, ClientConfig, KeyDirectory, Request, Response, Server, ServerConfig,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut rng = rand::thread_rng();
//!     let master_key = rsa::RsaPrivateKey::new(&mut rng, 2048)?;
//!     let slave_key = rsa::RsaPrivateKey::new(&mut rng, 2048)?;
//!
//!     let keys = Arc::new(KeyDirectory::new());
//!     keys.put("slave", slave_key.to_public_key())?;
//!
//!     let mut server = Server::new(
//!         ServerConfig {
//!             name: "master".into(),
//!             private_key: master_key.clone(),
//!             pub_keys: keys,
//!             interface: None,
//!             family: AddrFamily::Any,
//!             port: 0,
//!             not_multicast: false,
//!         },
//!         |_addr, req| {
//!             if req.data != b"request" {
//!                 return Err("protocol error".into());
//!             }
//!             Ok(Response::new(*b"msg"))
//!         },
//!     );
//!     server.start()?;
//!
//!     let mut client = Client::new(
//!         ClientConfig {
//!             server_name: "master".into(),
//!             server_key: master_key.to_public_key(),
//!             name: "slave".into(),
//!             private_key: slave_key,
//!             interface: None,
//!             family: AddrFamily::Any,
//!             port: server.port(),
//!             not_multicast: false,
//!             timeout: Default::default(),
//!             deadline: Default::default(),
//!         },
//!         |_dst| Ok(Request::new(*b"request")),
//!     );
//!     let response = client.discover()?;
//!     println!("{}", String::from_utf8_lossy(&response.data));
//!
//!     server.close();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod keys;
pub mod netif;
pub mod protocol;
pub mod server;

#[cfg(test)]
mod test_keys;

// Re-export the types almost every caller needs at the crate root, so
// application code can write `lan_discover::Client` instead of
// `lan_discover::client::Client`.
pub use client::{Client, ClientConfig, ClientError, DEFAULT_DEADLINE, DEFAULT_TIMEOUT};
pub use keys::{KeyDirectory, KeyDirectoryError};
pub use netif::{AddrFamily, Capability, NetifError};
pub use protocol::{Envelope, Request, Response};
pub use server::{Server, ServerConfig, ServerError};
