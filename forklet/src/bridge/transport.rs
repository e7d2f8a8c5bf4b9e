//! Pipe, fork and reap plumbing for one unit of work.
//!
//! Each child gets a fresh pipe. The parent keeps the read end
//! ([`ResultChannel`]); the child gets the write end ([`ResultWriter`]),
//! writes one frame and exits without unwinding back into the caller.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe2};

use crate::error::TransportError;

/// Serializes pipe creation and fork across the whole process.
///
/// A write end that is open in the parent while a sibling forks is inherited
/// by that sibling, and the reader would then wait for the sibling to exit too.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Exit code of a child whose `run` unwound instead of returning.
pub const EXIT_UNWOUND: i32 = 71;

/// Parent-side read end of a result pipe.
#[derive(Debug)]
pub struct ResultChannel {
    file: File,
}

impl ResultChannel {
    /// Non-blocking readiness probe: data is buffered or the writer hung up.
    pub fn is_ready(&self) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|revents| {
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Block until the writer closes, returning every byte written.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Child-side write end of a result pipe.
#[derive(Debug)]
pub struct ResultWriter {
    file: File,
}

impl ResultWriter {
    /// Write one complete frame and close the pipe.
    pub fn write_frame(mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()
    }
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(nix::sys::signal::Signal),
}

impl ExitState {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {}", code),
            Self::Signaled(signal) => write!(f, "killed by {}", signal),
        }
    }
}

/// Fork a child that runs `run` with the write end of a fresh pipe.
///
/// `run` runs only in the forked process and returns the exit code. Whether it
/// returns or unwinds, the child then calls `_exit`, so it never returns into
/// the caller's stack and never runs parent-installed destructors or atexit
/// hooks.
///
/// Both pipe ends are close-on-exec: a program spawned by another parent
/// thread must not hold a write end open and stall the reader.
pub fn spawn_child<F>(run: F) -> Result<(Pid, ResultChannel), TransportError>
where
    F: FnOnce(ResultWriter) -> i32,
{
    let guard = SPAWN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);

    let (read_fd, write_fd) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| TransportError::spawn(format!("pipe: {}", e)))?;

    // Safety: the child only runs `run` and then `_exit`s. It never returns
    // into code that assumes the parent's threads still exist.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(guard);
            drop(read_fd);
            let writer = ResultWriter {
                file: File::from(write_fd),
            };
            let code = match panic::catch_unwind(AssertUnwindSafe(move || run(writer))) {
                Ok(code) => code,
                Err(payload) => {
                    // Dropping the payload could unwind again.
                    std::mem::forget(payload);
                    EXIT_UNWOUND
                }
            };
            exit_child(code)
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_fd);
            drop(guard);
            tracing::debug!(pid = %child, "Forked child process");
            Ok((
                child,
                ResultChannel {
                    file: File::from(read_fd),
                },
            ))
        }
        Err(e) => Err(TransportError::spawn(format!("fork: {}", e))),
    }
}

/// Terminate a forked child immediately.
pub(crate) fn exit_child(code: i32) -> ! {
    // Safety: `_exit` skips atexit handlers and stdio flushing, both of which
    // belong to the parent. The result frame has already been written.
    unsafe { nix::libc::_exit(code) }
}

/// Block until `pid` terminates and collect its exit status.
pub fn reap(pid: Pid) -> Result<ExitState, TransportError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitState::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ExitState::Signaled(signal)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(TransportError::io("waitpid", e)),
        }
    }
}

/// Reap `pid` only if it has already terminated. Returns whether it was reaped.
pub fn try_reap(pid: Pid) -> bool {
    matches!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..))
    )
}
