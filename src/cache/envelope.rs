//! Content envelope codec.
//!
//! Each cache entry stores a single blob framed as
//! `[1 byte: content-type length N][N bytes: content-type][body]`.
//! One byte of overhead beyond the string keeps per-object storage
//! cost minimal.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Content type used when the upstream response carries none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upper bound on the stored content-type string, fixed by the
/// single-byte length prefix.
pub const MAX_CONTENT_TYPE_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("content-type length {0} does not fit the one-byte prefix")]
    ContentTypeTooLong(usize),
    #[error("blob of {len} bytes is shorter than the declared prefix ({declared} content-type bytes)")]
    Truncated { len: usize, declared: usize },
}

/// Encode a content-type and body into a single envelope blob.
///
/// An empty content-type falls back to [`DEFAULT_CONTENT_TYPE`] so the
/// stored string is never empty. Fails without producing any output
/// when the content-type exceeds [`MAX_CONTENT_TYPE_LEN`].
pub fn encode(content_type: &str, body: &[u8]) -> Result<Bytes, EnvelopeError> {
    let content_type = effective_content_type(content_type);
    if content_type.len() > MAX_CONTENT_TYPE_LEN {
        return Err(EnvelopeError::ContentTypeTooLong(content_type.len()));
    }

    let mut blob = BytesMut::with_capacity(1 + content_type.len() + body.len());
    blob.put_u8(content_type.len() as u8);
    blob.put_slice(content_type.as_bytes());
    blob.put_slice(body);
    Ok(blob.freeze())
}

/// Exact blob size [`encode`] will produce for the given pair.
///
/// The engine preallocates transaction storage by this value.
pub fn encoded_len(content_type: &str, body_len: usize) -> Result<usize, EnvelopeError> {
    let content_type = effective_content_type(content_type);
    if content_type.len() > MAX_CONTENT_TYPE_LEN {
        return Err(EnvelopeError::ContentTypeTooLong(content_type.len()));
    }
    Ok(1 + content_type.len() + body_len)
}

/// Decode an envelope blob into its content-type and body.
///
/// The body is a zero-copy slice of the input blob.
pub fn decode(blob: &Bytes) -> Result<(String, Bytes), EnvelopeError> {
    let Some(&declared) = blob.first() else {
        return Err(EnvelopeError::Truncated {
            len: 0,
            declared: 0,
        });
    };
    let declared = declared as usize;
    if blob.len() < 1 + declared {
        return Err(EnvelopeError::Truncated {
            len: blob.len(),
            declared,
        });
    }

    let content_type = String::from_utf8_lossy(&blob[1..1 + declared]).into_owned();
    let body = blob.slice(1 + declared..);
    Ok((content_type, body))
}

fn effective_content_type(content_type: &str) -> &str {
    if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE
    } else {
        content_type
    }
}
