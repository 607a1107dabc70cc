//! Worker process management.
//!
//! Workers are forked processes. A launcher starts a worker body in a child,
//! waits for the child's startup acknowledgment, and later terminates and
//! reaps it.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channel::AckChannel;
use crate::error::{Result, TransportError};

/// Which phase a worker owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Supervisor,
    Sender,
}

impl WorkerRole {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRole::Supervisor => "supervisor",
            WorkerRole::Sender => "sender",
        }
    }
}

/// A running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    pub role: WorkerRole,
    pub pid: i32,
}

/// Body of a worker. It must call [`AckChannel::acknowledge`] once it has
/// taken ownership of its phase.
pub type WorkerBody<'a> = dyn FnMut(&mut AckChannel) + 'a;

/// Starts and stops worker processes.
pub trait WorkerLauncher {
    /// Run `body` as a new worker and wait for its acknowledgment.
    fn launch(&mut self, role: WorkerRole, body: &mut WorkerBody<'_>) -> Result<WorkerHandle>;

    /// Ask the worker to stop, wait up to `grace`, then force it.
    fn terminate(&mut self, handle: WorkerHandle, grace: Duration);

    /// Whether the worker is still running. Reaps it if it has exited.
    fn is_alive(&mut self, handle: WorkerHandle) -> bool;

    /// Kill a worker that is not our child, such as the sender left behind
    /// by a dead supervisor.
    fn kill_orphan(&mut self, pid: i32);
}

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_signal: libc::c_int) {
    TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
}

/// Turn SIGTERM into a flag checked with [`termination_requested`].
///
/// Installed without `SA_RESTART`, so a blocking call in progress returns
/// `EINTR` and the worker gets to look at the flag.
pub fn install_termination_handler() -> io::Result<()> {
    TERMINATE_REQUESTED.store(false, Ordering::SeqCst);

    // SAFETY: the handler only touches an atomic, which is signal-safe.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_terminate as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGTERM, &action, std::ptr::null_mut()) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn termination_requested() -> bool {
    TERMINATE_REQUESTED.load(Ordering::SeqCst)
}

/// Get SIGTERM when the spawning thread goes away, so workers do not
/// outlive the process tree that created them.
#[cfg(target_os = "linux")]
fn die_with_parent(parent: libc::pid_t) {
    // SAFETY: plain syscalls without pointers.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if libc::getppid() != parent {
            libc::_exit(0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_parent: libc::pid_t) {}

const ORPHAN_KILL_WAIT: Duration = Duration::from_millis(100);

/// Launches workers with `fork`.
pub struct ForkLauncher {
    ack_timeout: Duration,
}

impl ForkLauncher {
    pub fn new(ack_timeout: Duration) -> Self {
        Self { ack_timeout }
    }

    fn reap_blocking(pid: libc::pid_t) {
        let mut status = 0;
        // SAFETY: pid is a child of this process.
        unsafe { libc::waitpid(pid, &mut status, 0) };
    }
}

impl WorkerLauncher for ForkLauncher {
    fn launch(&mut self, role: WorkerRole, body: &mut WorkerBody<'_>) -> Result<WorkerHandle> {
        let mut ack = AckChannel::new()?;
        // SAFETY: getpid has no preconditions.
        let parent = unsafe { libc::getpid() };

        // SAFETY: the child only runs `body` and leaves through `_exit`,
        // never returning into the caller's stack frames.
        match unsafe { libc::fork() } {
            -1 => Err(TransportError::Spawn {
                role: role.name(),
                source: io::Error::last_os_error(),
            }),
            0 => {
                die_with_parent(parent);
                // A panic must not unwind into the parent's stack frames
                let code = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut ack))) {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                // SAFETY: skip destructors and atexit handlers that belong
                // to the parent's copy of the process.
                unsafe { libc::_exit(code) }
            }
            pid => {
                if !ack.wait(self.ack_timeout)? {
                    warn!("{} worker (pid {}) did not acknowledge startup", role.name(), pid);
                    // SAFETY: pid is our child.
                    unsafe { libc::kill(pid, libc::SIGKILL) };
                    Self::reap_blocking(pid);
                    return Err(TransportError::NoAck { role: role.name() });
                }

                info!("Spawned {} worker (pid {})", role.name(), pid);
                Ok(WorkerHandle { role, pid })
            }
        }
    }

    fn terminate(&mut self, handle: WorkerHandle, grace: Duration) {
        debug!("Terminating {} worker (pid {})", handle.role.name(), handle.pid);

        // SAFETY: pid is our child.
        if unsafe { libc::kill(handle.pid, libc::SIGTERM) } == -1 {
            // Already gone; make sure it is reaped
            self.is_alive(handle);
            return;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_alive(handle) {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }

        warn!(
            "{} worker (pid {}) ignored SIGTERM, killing it",
            handle.role.name(),
            handle.pid
        );
        // SAFETY: pid is our child.
        unsafe { libc::kill(handle.pid, libc::SIGKILL) };
        Self::reap_blocking(handle.pid);
    }

    fn is_alive(&mut self, handle: WorkerHandle) -> bool {
        let mut status = 0;
        // SAFETY: non-blocking wait on our own child.
        match unsafe { libc::waitpid(handle.pid, &mut status, libc::WNOHANG) } {
            0 => true,
            -1 => false,
            _ => {
                debug!(
                    "{} worker (pid {}) exited with status {}",
                    handle.role.name(),
                    handle.pid,
                    status
                );
                false
            }
        }
    }

    fn kill_orphan(&mut self, pid: i32) {
        if pid <= 0 {
            return;
        }
        warn!("Killing orphaned worker (pid {})", pid);
        // SAFETY: plain signal delivery; pid was recorded by its spawner.
        if unsafe { libc::kill(pid, libc::SIGKILL) } == -1 {
            return;
        }

        // Someone else reaps it; just give the kill a moment to land
        let deadline = Instant::now() + ORPHAN_KILL_WAIT;
        // SAFETY: signal 0 only checks for existence.
        while unsafe { libc::kill(pid, 0) } == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }
}
