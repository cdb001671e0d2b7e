//! gridlink - Client protocol for a power-grid topology control server
//!
//! The crate speaks the binary protocol of the grid server: framed,
//! little-endian messages over one TCP connection, with commands matched to
//! their replies by a 32-bit command id.

pub mod config;
pub mod network;
pub mod protocol;
