//! Fixed-size record encoding
//!
//! All structured records on the wire are fixed width and little-endian.
//! [`WireSegment`] is implemented by every header and payload; higher layers
//! only ever compose segments.

use bytes::{Buf, BufMut, BytesMut};

use super::{ProtocolError, ProtocolResult};

/// A record with a fixed encoded size
pub trait WireSegment: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Append exactly `SIZE` bytes to `buf`
    fn put(&self, buf: &mut BytesMut);

    /// Read the record from `buf`, which holds at least `SIZE` bytes
    fn get(buf: &mut &[u8]) -> ProtocolResult<Self>;

    /// Encode into a fresh buffer
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        self.put(&mut buf);
        buf
    }

    /// Decode from `bytes` starting at `offset`, returning the record and the
    /// number of bytes consumed.
    fn decode(bytes: &[u8], offset: usize) -> ProtocolResult<(Self, usize)> {
        let available = bytes.len().saturating_sub(offset);
        if available < Self::SIZE {
            return Err(ProtocolError::TruncatedInput {
                needed: Self::SIZE,
                available,
            });
        }

        let mut cursor = &bytes[offset..offset + Self::SIZE];
        let value = Self::get(&mut cursor)?;
        Ok((value, Self::SIZE))
    }
}

/// Write `name` into a zero padded field of `field_len` bytes.
///
/// The name is cut to `max_chars` characters first. Should the UTF-8 form
/// still not fit, it is cut further at the last character boundary that does.
/// Truncation is silent.
pub fn put_name(buf: &mut BytesMut, name: &str, max_chars: usize, field_len: usize) {
    let truncated: String = name.chars().take(max_chars).collect();
    let mut end = truncated.len().min(field_len);
    while !truncated.is_char_boundary(end) {
        end -= 1;
    }

    buf.put_slice(&truncated.as_bytes()[..end]);
    buf.put_bytes(0, field_len - end);
}

/// Read a name field of `field_len` bytes, dropping trailing NUL bytes.
///
/// A name that really ends in NUL cannot be represented.
pub fn get_name(buf: &mut &[u8], field_len: usize) -> ProtocolResult<String> {
    if buf.len() < field_len {
        return Err(ProtocolError::TruncatedInput {
            needed: field_len,
            available: buf.len(),
        });
    }

    let text = std::str::from_utf8(&buf[..field_len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("name is not valid UTF-8: {}", e)))?
        .trim_end_matches('\0')
        .to_string();
    buf.advance(field_len);
    Ok(text)
}
