//! Result transport between a forked child and its parent.
//!
//! # Architecture
//!
//! - **protocol**: Outcome and ErrorValue wire types
//! - **codec**: length-prefixed JSON framing codec
//! - **transport**: pipe, fork and reap primitives

pub mod codec;
pub mod protocol;
pub mod transport;
