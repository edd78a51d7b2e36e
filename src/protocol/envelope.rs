//! Datagram and body types exchanged between the discovery client and server.
//!
//! An [`Envelope`] is what actually crosses the network: one UDP datagram
//! carrying sender/receiver names, a session tag, a sequence number, an
//! opaque body, and (on the wire only) an RSA signature over everything
//! else.  The body inside the payload is either a [`Request`] on the way to
//! the server or a [`Response`] on the way back; both are an opaque byte
//! string plus an optional application error text.

use uuid::Uuid;

/// Wire format version.  Encoded as the first two bytes of every datagram;
/// receivers reject anything else.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on the serialized body carried inside an envelope, in bytes.
///
/// An RSA-2048 signature adds 256 bytes and the two identity names up to
/// 255 bytes each, so capping the payload at 1 KiB keeps the whole datagram
/// comfortably inside a 1500-byte Ethernet MTU.  The codec enforces this cap
/// on both encode and decode.  Note the cap applies to the *serialized*
/// body, so the application `data` plus error text must fit in
/// `MAX_PAYLOAD_SIZE − 8` bytes of length framing.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Receive buffer size.  Larger than any valid datagram so an oversized
/// packet is read whole and then rejected by the codec, never truncated
/// into something that might accidentally parse.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Upper bound on an identity name, dictated by the one-byte length prefix.
pub const MAX_NAME_LEN: usize = 255;

/// A signed discovery datagram, minus the signature.
///
/// The signature is not stored here: it exists only in the encoded bytes and
/// is produced by [`crate::protocol::codec::encode_envelope`] and checked by
/// the `decode_*` functions, which only ever hand out envelopes that
/// verified against the expected key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender identity name.
    pub from: String,
    /// Intended receiver identity name.  A receiver with a different local
    /// name ignores the datagram silently.
    pub to: String,
    /// 128-bit session tag, fixed for the life of a client session.
    pub id: Uuid,
    /// Sequence number within the session.  Strictly increases across
    /// retransmits of one request; a response echoes its request's value.
    pub seq: u64,
    /// Serialized [`Request`] or [`Response`] body.
    pub payload: Vec<u8>,
}

/// The client-built body of a discovery exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Application-defined bytes, opaque to the discovery core.
    pub data: Vec<u8>,
    /// Optional application error text.  Rarely used on requests; carried
    /// for symmetry with [`Response`] since both share one body encoding.
    pub error: Option<String>,
}

/// The server-built body of a discovery exchange.
///
/// `id` and `seq` are not part of the body encoding — the client engine
/// copies them out of the verified envelope so callers can observe which
/// session a response belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Application-defined bytes produced by the server's protocol callback.
    pub data: Vec<u8>,
    /// Non-empty when the server's protocol callback failed; the text is
    /// surfaced to the client caller verbatim.
    pub error: Option<String>,
    /// Session tag echoed from the envelope.
    pub id: Uuid,
    /// Sequence number echoed from the envelope.
    pub seq: u64,
}

impl Request {
    /// Convenience constructor for the common data-only case.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            error: None,
        }
    }
}

impl Response {
    /// Convenience constructor for the common data-only case.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }
}
