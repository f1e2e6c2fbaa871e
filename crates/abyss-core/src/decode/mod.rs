//! Link/network/transport-layer packet decoding.
//!
//! The decoder follows the layered structure used across the codebase:
//! - `layout`: byte offsets, ethertypes and protocol numbers (source of truth)
//! - `reader`: bounds-checked byte access over the captured slice
//! - `parser`: domain-level decoding (no direct byte indexing)
//! - `error`: the truncation type the reader reports
//!
//! Decoding is total: a frame that stops parsing at any layer yields a
//! partially populated `PacketHeader` rather than an error. The parser is
//! pure and contains no I/O; the capture engine feeds it raw slices.

pub mod error;
pub mod layout;
pub mod parser;
pub mod reader;

pub use parser::decode;
