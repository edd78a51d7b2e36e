//! Protocol module containing the envelope types and the binary codec.
//!
//! Every discovery exchange is one signed UDP datagram in each direction.
//! A datagram consists of two layers:
//!
//! 1. **Envelope** – sender and receiver identity names, a 128-bit session
//!    id, a 64-bit sequence number, the opaque body bytes, and an RSA
//!    signature over all of it.
//! 2. **Body** – the application-level `Request` or `Response`: a byte
//!    string plus an optional error text.
//!
//! The `codec` sub-module does all byte work: `encode_envelope` signs and
//! serializes, and the `decode_with_*` functions parse *and verify* in one
//! step, so unauthenticated data never reaches engine code.
//!
//! # Sub-modules
//!
//! - **`envelope`** – Type definitions and wire constants.
//! - **`codec`**    – Binary encoding, decoding, signing, verification.

pub mod codec;
pub mod envelope;

// Re-export the commonly needed items at the protocol module level, so
// callers can write `protocol::Envelope` instead of
// `protocol::envelope::Envelope`.
pub use codec::{
    decode_request, decode_response, decode_with_directory, decode_with_key, encode_envelope,
    encode_request, encode_response, CodecError,
};
pub use envelope::{
    Envelope, Request, Response, MAX_DATAGRAM_SIZE, MAX_NAME_LEN, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
