//! Protocol module - Defines the binary wire protocol spoken with the grid server
//!
//! Every frame starts with the same 8-byte little-endian header:
//! - 1 byte packet type
//! - 1 byte device type
//! - 2 bytes device id
//! - 2 bytes frame length (including the header)
//! - 2 bytes connection id (assigned by the server)
//!
//! The header is followed by a type specific extension and payload. Frames
//! are zero padded to a multiple of 16 bytes and never exceed 1024 bytes.

mod codec;
pub mod commands;
mod elements;
mod header;
mod message;
mod payload;
mod segment;
mod transfer;

pub use codec::*;
pub use elements::*;
pub use header::*;
pub use message::*;
pub use payload::*;
pub use segment::*;
pub use transfer::*;

use bytes::{BufMut, BytesMut};

/// Default TCP port of the grid server
pub const DEFAULT_PORT: u16 = 50000;

/// Largest frame either side may send, header included
pub const MAX_FRAME_SIZE: usize = 1024;

/// Every frame length is a multiple of this
pub const FRAME_ALIGNMENT: usize = 16;

/// Length of `len` bytes once padded to the frame alignment
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(FRAME_ALIGNMENT) * FRAME_ALIGNMENT
}

/// Zero pad `buf` up to the next multiple of 16 bytes
pub fn add_padding(buf: &mut BytesMut) {
    let missing = padded_len(buf.len()) - buf.len();
    buf.put_bytes(0, missing);
}
