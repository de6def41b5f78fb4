//! # Wire Codec
//!
//! Sequential, forward-only encoding over a byte stream: primitive
//! reads/writes plus a recursive tagged-value encoding for generic message
//! payloads.
//!
//! ## Components
//! - **wire**: primitive writer (in-memory buffer) and async reader
//! - **value**: the tagged union carried by generic payloads (tags 0-12)
//!
//! ## Wire Rules
//! - Little-endian fixed-width integers and floats
//! - Strings and byte arrays carry an i32 byte-length prefix
//! - Bool is a single byte, zero = false
//! - Declared lengths are validated against `MAX_WIRE_LEN` before any
//!   allocation happens

pub mod value;
pub mod wire;

pub use value::{Array, Value};
pub use wire::{WireReader, WireWriter};
