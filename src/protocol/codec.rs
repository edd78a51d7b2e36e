//! Binary codec for discovery envelopes and their bodies.
//!
//! Wire format of one datagram (all multi-byte integers big-endian):
//! ```text
//! [version:2][from_len:1][from:N][to_len:1][to:N]
//! [id:16][seq:8][payload_len:4][payload:N][sig_len:2][sig:N]
//! ```
//! The signature is RSA PKCS#1 v1.5 over the SHA-256 digest of every byte
//! that precedes it, computed with the sender's private key.  Decoding and
//! verification are one operation here: the `decode_*` functions never
//! return an envelope whose signature did not check out, so engine code
//! cannot forget the verification step.
//!
//! The body inside `payload` is a second, smaller frame shared by
//! [`Request`] and [`Response`]:
//! ```text
//! [data_len:4][data:N][err_len:4][err utf8:N]
//! ```

use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::keys::KeyDirectory;
use crate::protocol::envelope::{
    Envelope, Request, Response, MAX_NAME_LEN, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};

/// Errors that can occur while encoding or decoding a datagram.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The byte slice is shorter than the field being read requires.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The version field does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    /// A field value violates an envelope invariant (empty name, matching
    /// sender and receiver, oversized name, invalid UTF-8, ...).
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The declared payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes exceeds the {max} byte cap")]
    PayloadTooLarge { size: usize, max: usize },

    /// Bytes remained after the signature field was consumed.
    #[error("trailing data after envelope: {remaining} bytes")]
    TrailingData { remaining: usize },

    /// The sender name is not present in the key directory.
    #[error("no trusted key for sender {0:?}")]
    UnknownSender(String),

    /// The signature did not verify against the expected public key.
    #[error("signature verification failed")]
    BadSignature,

    /// Computing the signature failed (e.g. an undersized key).
    #[error("signature computation failed: {0}")]
    Sign(#[source] rsa::Error),
}

// ── Envelope encoding ─────────────────────────────────────────────────────────

/// Serializes and signs an envelope into the bytes of one UDP datagram.
///
/// Validates the envelope invariants first: `from` and `to` must be
/// non-empty, distinct, and at most [`MAX_NAME_LEN`] bytes; the payload must
/// fit [`MAX_PAYLOAD_SIZE`].
pub fn encode_envelope(env: &Envelope, key: &RsaPrivateKey) -> Result<Vec<u8>, CodecError> {
    validate_names(&env.from, &env.to)?;
    if env.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: env.payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    // Header + payload; the signature is appended after digesting this.
    let mut buf = Vec::with_capacity(32 + env.from.len() + env.to.len() + env.payload.len() + 256);
    buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    buf.push(env.from.len() as u8);
    buf.extend_from_slice(env.from.as_bytes());
    buf.push(env.to.len() as u8);
    buf.extend_from_slice(env.to.as_bytes());
    buf.extend_from_slice(env.id.as_bytes());
    buf.extend_from_slice(&env.seq.to_be_bytes());
    buf.extend_from_slice(&(env.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&env.payload);

    let digest = Sha256::digest(&buf);
    let signature = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(CodecError::Sign)?;

    buf.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    buf.extend_from_slice(&signature);
    Ok(buf)
}

// ── Envelope decoding ─────────────────────────────────────────────────────────

/// Decodes a datagram and verifies its signature against the key the
/// directory binds to the sender name.  This is the server's receive path.
pub fn decode_with_directory(bytes: &[u8], keys: &KeyDirectory) -> Result<Envelope, CodecError> {
    let (env, signed_len, signature) = split_signed(bytes)?;
    let key = keys
        .get(&env.from)
        .ok_or_else(|| CodecError::UnknownSender(env.from.clone()))?;
    verify_signature(&key, &bytes[..signed_len], signature)?;
    Ok(env)
}

/// Decodes a datagram and verifies its signature against a single pinned
/// key.  This is the client's receive path: responses must come from the
/// one server key the client was configured with, never a directory lookup.
pub fn decode_with_key(bytes: &[u8], key: &RsaPublicKey) -> Result<Envelope, CodecError> {
    let (env, signed_len, signature) = split_signed(bytes)?;
    verify_signature(key, &bytes[..signed_len], signature)?;
    Ok(env)
}

/// Parses the envelope fields and locates the signed region and signature.
///
/// Signature verification is left to the caller, which knows where the
/// expected key comes from.
fn split_signed(bytes: &[u8]) -> Result<(Envelope, usize, &[u8]), CodecError> {
    let mut off = 0usize;

    let version = read_u16(bytes, off)?;
    off += 2;
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let (from, next) = read_name(bytes, off, "from")?;
    off = next;
    let (to, next) = read_name(bytes, off, "to")?;
    off = next;
    validate_names(&from, &to)?;

    require_len(bytes, off + 16, "id")?;
    let id = Uuid::from_bytes(bytes[off..off + 16].try_into().unwrap());
    off += 16;

    let seq = read_u64(bytes, off)?;
    off += 8;

    let payload_len = read_u32(bytes, off)? as usize;
    off += 4;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    require_len(bytes, off + payload_len, "payload")?;
    let payload = bytes[off..off + payload_len].to_vec();
    off += payload_len;

    // Everything up to here is covered by the signature.
    let signed_len = off;

    let sig_len = read_u16(bytes, off)? as usize;
    off += 2;
    require_len(bytes, off + sig_len, "signature")?;
    let signature = &bytes[off..off + sig_len];
    off += sig_len;

    if off < bytes.len() {
        return Err(CodecError::TrailingData {
            remaining: bytes.len() - off,
        });
    }

    Ok((
        Envelope {
            from,
            to,
            id,
            seq,
            payload,
        },
        signed_len,
        signature,
    ))
}

fn verify_signature(
    key: &RsaPublicKey,
    signed: &[u8],
    signature: &[u8],
) -> Result<(), CodecError> {
    let digest = Sha256::digest(signed);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| CodecError::BadSignature)
}

fn validate_names(from: &str, to: &str) -> Result<(), CodecError> {
    if from.is_empty() || to.is_empty() {
        return Err(CodecError::MalformedEnvelope(
            "sender and receiver names must be non-empty".into(),
        ));
    }
    if from == to {
        return Err(CodecError::MalformedEnvelope(format!(
            "sender and receiver must differ, both are {from:?}"
        )));
    }
    if from.len() > MAX_NAME_LEN || to.len() > MAX_NAME_LEN {
        return Err(CodecError::MalformedEnvelope(format!(
            "identity names are limited to {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

// ── Body encoding ─────────────────────────────────────────────────────────────

/// Serializes a request body for use as an envelope payload.
pub fn encode_request(req: &Request) -> Vec<u8> {
    encode_body(&req.data, req.error.as_deref())
}

/// Parses a request body out of an envelope payload.
pub fn decode_request(payload: &[u8]) -> Result<Request, CodecError> {
    let (data, error) = decode_body(payload)?;
    Ok(Request { data, error })
}

/// Serializes a response body for use as an envelope payload.  `id` and
/// `seq` travel in the envelope, not the body.
pub fn encode_response(resp: &Response) -> Vec<u8> {
    encode_body(&resp.data, resp.error.as_deref())
}

/// Parses a response body out of an envelope payload.  The caller fills in
/// `id` and `seq` from the envelope it arrived in.
pub fn decode_response(payload: &[u8]) -> Result<Response, CodecError> {
    let (data, error) = decode_body(payload)?;
    Ok(Response {
        data,
        error,
        ..Response::default()
    })
}

fn encode_body(data: &[u8], error: Option<&str>) -> Vec<u8> {
    let err = error.unwrap_or("");
    let mut buf = Vec::with_capacity(8 + data.len() + err.len());
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(&(err.len() as u32).to_be_bytes());
    buf.extend_from_slice(err.as_bytes());
    buf
}

/// Splits a body frame into its data bytes and optional error text.  An
/// empty error field decodes as `None`.
fn decode_body(payload: &[u8]) -> Result<(Vec<u8>, Option<String>), CodecError> {
    let mut off = 0usize;

    let data_len = read_u32(payload, off)? as usize;
    off += 4;
    require_len(payload, off + data_len, "body data")?;
    let data = payload[off..off + data_len].to_vec();
    off += data_len;

    let err_len = read_u32(payload, off)? as usize;
    off += 4;
    require_len(payload, off + err_len, "body error")?;
    let error = if err_len == 0 {
        None
    } else {
        let text = std::str::from_utf8(&payload[off..off + err_len])
            .map_err(|e| CodecError::MalformedEnvelope(format!("error text is not UTF-8: {e}")))?;
        Some(text.to_string())
    };
    off += err_len;

    if off < payload.len() {
        return Err(CodecError::TrailingData {
            remaining: payload.len() - off,
        });
    }
    Ok((data, error))
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::MalformedEnvelope(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    if buf.len() < offset + 2 {
        return Err(CodecError::InsufficientData {
            needed: offset + 2,
            available: buf.len(),
        });
    }
    Ok(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    if buf.len() < offset + 4 {
        return Err(CodecError::InsufficientData {
            needed: offset + 4,
            available: buf.len(),
        });
    }
    Ok(u32::from_be_bytes(
        buf[offset..offset + 4].try_into().unwrap(),
    ))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, CodecError> {
    if buf.len() < offset + 8 {
        return Err(CodecError::InsufficientData {
            needed: offset + 8,
            available: buf.len(),
        });
    }
    Ok(u64::from_be_bytes(
        buf[offset..offset + 8].try_into().unwrap(),
    ))
}

/// Reads a one-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after it.
fn read_name(buf: &[u8], offset: usize, context: &str) -> Result<(String, usize), CodecError> {
    if buf.len() < offset + 1 {
        return Err(CodecError::InsufficientData {
            needed: offset + 1,
            available: buf.len(),
        });
    }
    let len = buf[offset] as usize;
    let start = offset + 1;
    require_len(buf, start + len, context)?;
    let name = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| CodecError::MalformedEnvelope(format!("{context} is not UTF-8: {e}")))?
        .to_string();
    Ok((name, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_keys;

    fn sample_envelope() -> Envelope {
        Envelope {
            from: "slave".to_string(),
            to: "master".to_string(),
            id: Uuid::new_v4(),
            seq: 7,
            payload: encode_request(&Request::new(*b"request")),
        }
    }

    /// Signing with a key and verifying with its public half must round-trip
    /// every field intact.
    #[test]
    fn test_encode_then_decode_with_pinned_key_round_trips() {
        // Arrange
        let key = test_keys::client_key();
        let env = sample_envelope();

        // Act
        let bytes = encode_envelope(&env, key).expect("encode");
        let decoded = decode_with_key(&bytes, &key.to_public_key()).expect("decode");

        // Assert
        assert_eq!(decoded, env);
    }

    /// The server path looks the sender up in the directory before
    /// verifying.
    #[test]
    fn test_decode_with_directory_uses_the_sender_entry() {
        let key = test_keys::client_key();
        let dir = KeyDirectory::new();
        dir.put("slave", key.to_public_key()).unwrap();

        let bytes = encode_envelope(&sample_envelope(), key).unwrap();
        let decoded = decode_with_directory(&bytes, &dir).expect("decode");
        assert_eq!(decoded.from, "slave");
        assert_eq!(decoded.seq, 7);
    }

    /// A sender the directory has never heard of is an authentication
    /// error, not a parse error.
    #[test]
    fn test_decode_with_directory_rejects_unknown_sender() {
        let bytes = encode_envelope(&sample_envelope(), test_keys::client_key()).unwrap();
        let empty = KeyDirectory::new();
        let result = decode_with_directory(&bytes, &empty);
        assert!(matches!(result, Err(CodecError::UnknownSender(ref n)) if n == "slave"));
    }

    /// Verifying with any key other than the signer's must fail.
    #[test]
    fn test_decode_with_wrong_key_fails() {
        let bytes = encode_envelope(&sample_envelope(), test_keys::client_key()).unwrap();
        let other = test_keys::server_key().to_public_key();
        assert!(matches!(
            decode_with_key(&bytes, &other),
            Err(CodecError::BadSignature)
        ));
    }

    /// Flipping any single byte of the signed region must break
    /// verification.  A handful of offsets covering every field stands in
    /// for "any tampered byte".
    #[test]
    fn test_tampered_bytes_fail_verification() {
        let key = test_keys::client_key();
        let bytes = encode_envelope(&sample_envelope(), key).unwrap();
        let public = key.to_public_key();

        // version, from, id, seq and payload regions respectively
        for &offset in &[1usize, 4, 20, 35, 45] {
            let mut tampered = bytes.clone();
            tampered[offset] ^= 0xFF;
            assert!(
                decode_with_key(&tampered, &public).is_err(),
                "flip at offset {offset} must not verify"
            );
        }
    }

    #[test]
    fn test_truncated_datagram_is_rejected() {
        let bytes = encode_envelope(&sample_envelope(), test_keys::client_key()).unwrap();
        let public = test_keys::client_key().to_public_key();
        let result = decode_with_key(&bytes[..bytes.len() - 10], &public);
        assert!(result.is_err(), "truncated datagram must not decode");
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = encode_envelope(&sample_envelope(), test_keys::client_key()).unwrap();
        bytes.push(0x00);
        let result = decode_with_key(&bytes, &test_keys::client_key().to_public_key());
        assert!(matches!(
            result,
            Err(CodecError::TrailingData { remaining: 1 })
        ));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = encode_envelope(&sample_envelope(), test_keys::client_key()).unwrap();
        bytes[0..2].copy_from_slice(&99u16.to_be_bytes());
        let result = decode_with_key(&bytes, &test_keys::client_key().to_public_key());
        assert!(matches!(result, Err(CodecError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_oversized_payload_is_rejected_on_encode() {
        let mut env = sample_envelope();
        env.payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let result = encode_envelope(&env, test_keys::client_key());
        assert!(matches!(result, Err(CodecError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_empty_sender_name_is_rejected() {
        let mut env = sample_envelope();
        env.from = String::new();
        let result = encode_envelope(&env, test_keys::client_key());
        assert!(matches!(result, Err(CodecError::MalformedEnvelope(_))));
    }

    #[test]
    fn test_identical_sender_and_receiver_are_rejected() {
        let mut env = sample_envelope();
        env.to = env.from.clone();
        let result = encode_envelope(&env, test_keys::client_key());
        assert!(matches!(result, Err(CodecError::MalformedEnvelope(_))));
    }

    // ── Body frame ────────────────────────────────────────────────────────────

    #[test]
    fn test_request_body_round_trip() {
        let req = Request::new(*b"request");
        let decoded = decode_request(&encode_request(&req)).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_response_body_round_trip_with_error_text() {
        let resp = Response {
            data: Vec::new(),
            error: Some("protocol fail: bad request".to_string()),
            ..Response::default()
        };
        let decoded = decode_response(&encode_response(&resp)).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("protocol fail: bad request"));
        assert!(decoded.data.is_empty());
    }

    /// An empty error field and an absent one are the same thing on the
    /// wire.
    #[test]
    fn test_empty_error_decodes_as_none() {
        let resp = Response {
            data: b"msg".to_vec(),
            error: Some(String::new()),
            ..Response::default()
        };
        let decoded = decode_response(&encode_response(&resp)).unwrap();
        assert_eq!(decoded.error, None);
        assert_eq!(decoded.data, b"msg");
    }

    #[test]
    fn test_truncated_body_is_rejected() {
        let buf = encode_request(&Request::new(*b"request"));
        assert!(decode_request(&buf[..buf.len() - 3]).is_err());
    }
}
