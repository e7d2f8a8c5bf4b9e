//! Process pool coordinator - admission control over live child processes.
//!
//! The registry is a FIFO of every future that has not yet been observed as
//! complete. Submission first sweeps out finished futures, then retires the
//! oldest outstanding ones until there is room under the ceiling. Retirement
//! is oldest-first, not first-finished: a newer child that already exited does
//! not unblock submission while an older one is still running.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bridge::transport::ResultWriter;
use crate::config::PoolConfig;
use crate::error::FutureError;
use crate::future::{ProcFuture, Tracked};
use crate::worker;

/// Bounds the number of concurrently live child processes.
///
/// Registry mutation (`submit`, `all_done`, `wait_for_all`) is one critical
/// section, so a pool can be shared freely across threads.
pub struct ProcessPool {
    state: Mutex<PoolState>,
}

struct PoolState {
    ceiling: isize,
    live: VecDeque<Arc<dyn Tracked>>,
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessPool {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        tracing::debug!(ceiling = config.ceiling, "Creating process pool");
        Self {
            state: Mutex::new(PoolState {
                ceiling: config.ceiling,
                live: VecDeque::new(),
            }),
        }
    }

    /// Process-wide default pool, configured from the environment on first use.
    pub fn global() -> &'static ProcessPool {
        static GLOBAL: OnceLock<ProcessPool> = OnceLock::new();
        GLOBAL.get_or_init(ProcessPool::new)
    }

    /// Run `work` in a forked child. A panic in `work` is the raised error.
    ///
    /// Blocks while the pool is at its ceiling, retiring the oldest outstanding
    /// future first. Fails without spawning if that retirement fails.
    pub fn submit<T, F>(&self, work: F) -> Result<ProcFuture<T>, FutureError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        self.admit(|writer| worker::run_unit(work, writer))
    }

    /// Run a fallible `work` in a forked child; `Err(e)` is the raised error.
    pub fn submit_fallible<T, E, F>(&self, work: F) -> Result<ProcFuture<T>, FutureError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: std::error::Error + Serialize,
        F: FnOnce() -> Result<T, E>,
    {
        self.admit(|writer| worker::run_fallible(work, writer))
    }

    fn admit<T, R>(&self, run: R) -> Result<ProcFuture<T>, FutureError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        R: FnOnce(ResultWriter) -> i32,
    {
        let mut state = self.lock();
        state.make_room()?;
        let future = ProcFuture::launch(run)?;
        state.live.push_back(future.tracked());
        tracing::trace!(pid = %future.pid(), live = state.live.len(), "Admitted unit of work");
        Ok(future)
    }

    /// Sweep finished futures; true when none remain outstanding. Never blocks
    /// on a running child and never fails.
    pub fn all_done(&self) -> bool {
        let mut state = self.lock();
        state.sweep();
        state.live.is_empty()
    }

    /// Block until every outstanding future is complete, then clear the registry.
    ///
    /// Failures stay cached on the individual futures.
    pub fn wait_for_all(&self) {
        let mut state = self.lock();
        for future in state.live.drain(..) {
            if let Err(e) = future.retire() {
                tracing::debug!(pid = %future.pid(), error = %e, "Outstanding future failed");
            }
        }
    }

    pub fn ceiling(&self) -> isize {
        self.lock().ceiling
    }

    /// Change the ceiling for future submissions. Zero or negative is unbounded.
    pub fn set_ceiling(&self, ceiling: isize) {
        self.lock().ceiling = ceiling;
    }

    /// Number of futures still outstanding. Sweeps first, so futures that
    /// finished or were waited on directly are not counted. Never blocks.
    pub fn live_count(&self) -> usize {
        let mut state = self.lock();
        state.sweep();
        state.live.len()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Process pool mutex poisoned - recovering registry");
                poisoned.into_inner()
            }
        }
    }
}

impl PoolState {
    fn sweep(&mut self) {
        let before = self.live.len();
        self.live.retain(|future| !future.probe());
        let reclaimed = before - self.live.len();
        if reclaimed > 0 {
            tracing::trace!(reclaimed, live = self.live.len(), "Swept finished futures");
        }
    }

    fn is_full(&self) -> bool {
        self.ceiling > 0 && self.live.len() >= self.ceiling as usize
    }

    fn make_room(&mut self) -> Result<(), FutureError> {
        self.sweep();
        while self.is_full() {
            let Some(oldest) = self.live.pop_front() else {
                break;
            };
            tracing::debug!(
                pid = %oldest.pid(),
                ceiling = self.ceiling,
                "Pool at ceiling - retiring oldest future"
            );
            oldest.retire()?;
        }
        Ok(())
    }
}

/// Submit `work` to the process-wide default pool.
pub fn submit<T, F>(work: F) -> Result<ProcFuture<T>, FutureError>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    F: FnOnce() -> T,
{
    ProcessPool::global().submit(work)
}
