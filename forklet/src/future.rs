//! Process-isolated future - one forked child per unit of work.
//!
//! Lifecycle: the child is forked inside `submit` and starts running at once.
//! The first blocking access (or a positive readiness probe) reads the pipe to
//! EOF, reaps the child, decodes the outcome and caches it. Every later access
//! returns the cached outcome without touching the pipe again.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use nix::unistd::Pid;
use serde::de::DeserializeOwned;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::Outcome;
use crate::bridge::transport::{self, ResultChannel, ResultWriter};
use crate::error::{FutureError, TransportError};
use crate::pool::ProcessPool;

/// Handle to a unit of work running in a child process.
///
/// Cheap to share by reference across threads; the read-then-cache step runs
/// at most once no matter how many callers race on it.
pub struct ProcFuture<T> {
    inner: Arc<FutureInner<T>>,
}

pub(crate) struct FutureInner<T> {
    pid: Pid,
    channel: Mutex<Option<ResultChannel>>,
    outcome: OnceLock<Result<T, FutureError>>,
}

/// Type-erased view of a future held by the pool's registry.
pub(crate) trait Tracked: Send + Sync {
    fn pid(&self) -> Pid;

    /// Non-blocking; true once the future is complete (successfully or not).
    fn probe(&self) -> bool;

    /// Block until complete.
    fn retire(&self) -> Result<(), FutureError>;
}

impl<T> ProcFuture<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    /// Submit `work` to `pool`. Equivalent to [`ProcessPool::submit`].
    pub fn spawn<F>(pool: &ProcessPool, work: F) -> Result<Self, FutureError>
    where
        T: serde::Serialize,
        F: FnOnce() -> T,
    {
        pool.submit(work)
    }

    /// Fork the child. Admission control has already happened.
    pub(crate) fn launch<R>(run: R) -> Result<Self, FutureError>
    where
        R: FnOnce(ResultWriter) -> i32,
    {
        let (pid, channel) = transport::spawn_child(run)?;
        Ok(Self {
            inner: Arc::new(FutureInner {
                pid,
                channel: Mutex::new(Some(channel)),
                outcome: OnceLock::new(),
            }),
        })
    }

    pub(crate) fn tracked(&self) -> Arc<dyn Tracked> {
        Arc::clone(&self.inner) as Arc<dyn Tracked>
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// True only once the pipe has been drained and the child reaped.
    pub fn is_complete(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// Non-blocking completion probe.
    ///
    /// Returns `Ok(false)` while the child has not written anything. Once the
    /// pipe looks readable this performs the full consume-and-reap step and
    /// reports its outcome, so `Ok(true)` implies [`is_complete`](Self::is_complete).
    /// Readability is a heuristic for "the child is done"; the consume step
    /// still does the authoritative reap and may block briefly for it.
    pub fn poll_ready(&self) -> Result<bool, FutureError> {
        if self.inner.probe_ready() {
            self.inner.consume().as_ref().map(|_| true).map_err(Clone::clone)
        } else {
            Ok(false)
        }
    }

    /// Block until complete and return the value, or the classified error.
    ///
    /// Idempotent: later calls return the cached outcome.
    pub fn result(&self) -> Result<&T, FutureError> {
        self.inner.consume().as_ref().map_err(Clone::clone)
    }

    /// Block until complete, discarding the value.
    pub fn wait(&self) -> Result<(), FutureError> {
        self.inner.consume().as_ref().map(|_| ()).map_err(Clone::clone)
    }

    /// Block until complete and take the value out of the handle.
    ///
    /// The value is moved when this is the last handle; while the pool's
    /// registry still tracks the future it is cloned instead.
    pub fn into_result(self) -> Result<T, FutureError>
    where
        T: Clone,
    {
        let _ = self.inner.consume();
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => inner.outcome.take().unwrap_or_else(|| {
                Err(TransportError::protocol("result missing after consume").into())
            }),
            Err(shared) => shared.consume().clone(),
        }
    }
}

impl<T> fmt::Debug for ProcFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcFuture")
            .field("pid", &self.inner.pid)
            .field("complete", &self.inner.outcome.get().is_some())
            .finish()
    }
}

impl<T: DeserializeOwned> FutureInner<T> {
    fn consume(&self) -> &Result<T, FutureError> {
        self.outcome.get_or_init(|| {
            let result = self.read_and_reap();
            match &result {
                Ok(_) => tracing::debug!(pid = %self.pid, "Child result consumed"),
                Err(e) => tracing::debug!(pid = %self.pid, error = %e, "Child result consumed with error"),
            }
            result
        })
    }

    /// True when already complete or when the pipe is readable.
    fn probe_ready(&self) -> bool {
        if self.outcome.get().is_some() {
            return true;
        }
        let channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        match channel.as_ref() {
            Some(channel) => match channel.is_ready() {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::warn!(pid = %self.pid, error = %e, "Readiness probe failed");
                    false
                }
            },
            // Another caller is mid-consume; don't block behind it.
            None => false,
        }
    }

    fn read_and_reap(&self) -> Result<T, FutureError> {
        let channel = self
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut channel) = channel else {
            return Err(TransportError::protocol("result channel already consumed").into());
        };

        let read = channel.read_all();
        drop(channel);
        let exit = transport::reap(self.pid)?;
        let bytes = read.map_err(|e| TransportError::io("reading result pipe", e))?;

        tracing::trace!(pid = %self.pid, exit = %exit, bytes = bytes.len(), "Child reaped");

        if !exit.is_success() {
            tracing::warn!(pid = %self.pid, exit = %exit, "Child terminated abnormally");
            return Err(TransportError::AbnormalExit {
                pid: self.pid.as_raw(),
                status: exit.to_string(),
            }
            .into());
        }
        if bytes.is_empty() {
            return Err(TransportError::EmptyResult {
                pid: self.pid.as_raw(),
            }
            .into());
        }

        let outcome = JsonCodec::<Outcome<T>>::new()
            .decode_exact(&bytes)
            .map_err(|e| TransportError::protocol(e.to_string()))?;
        outcome.into_result()
    }
}

impl<T> Tracked for FutureInner<T>
where
    T: DeserializeOwned + Send + Sync,
{
    fn pid(&self) -> Pid {
        self.pid
    }

    fn probe(&self) -> bool {
        if !self.probe_ready() {
            return false;
        }
        // The outcome stays cached for whoever holds the future.
        let _ = self.consume();
        true
    }

    fn retire(&self) -> Result<(), FutureError> {
        self.consume().as_ref().map(|_| ()).map_err(Clone::clone)
    }
}

impl<T> Drop for FutureInner<T> {
    fn drop(&mut self) {
        // The channel is taken as the first step of consuming, which reaps.
        let channel = self.channel.get_mut().unwrap_or_else(PoisonError::into_inner);
        if channel.is_none() {
            return;
        }
        // Never block in a destructor: reap only if the child already exited.
        if !transport::try_reap(self.pid) {
            tracing::warn!(pid = %self.pid, "Future dropped before completion - child left unreaped");
        }
    }
}
