//! Shared RSA keys for unit tests.
//!
//! 2048-bit key generation is slow in debug builds, so the suite generates
//! one server key and one client key per test binary and hands out
//! references, the same way the original test suite provisioned its
//! identities once up front.

use std::sync::OnceLock;

use rsa::RsaPrivateKey;

static SERVER_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
static CLIENT_KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

/// The "master" identity's private key.
pub(crate) fn server_key() -> &'static RsaPrivateKey {
    SERVER_KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate test server key")
    })
}

/// The "slave" identity's private key.
pub(crate) fn client_key() -> &'static RsaPrivateKey {
    CLIENT_KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate test client key")
    })
}
