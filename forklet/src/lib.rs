//! forklet: process-isolated futures.
//!
//! A unit of work is a closure run in a forked child process. Its outcome comes
//! back over a pipe as one JSON frame and is exposed through a [`ProcFuture`].
//! A [`ProcessPool`] bounds how many children are alive at once.
//!
//! Units of work must not submit to the pool they were submitted from: the
//! child inherits that pool's registry lock in the held state.

pub mod bridge;
pub mod config;
pub mod error;
pub mod future;
pub mod logging;
pub mod pool;
mod worker;

pub use bridge::protocol::{ErrorValue, Outcome};
pub use config::PoolConfig;
pub use error::{FutureError, TransportError};
pub use future::ProcFuture;
pub use logging::init_tracing;
pub use pool::{ProcessPool, submit};
