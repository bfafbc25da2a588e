//! Child process supervision.
//!
//! Helpers shared by the build supervisor and the dependency inspector:
//! bounded waits, graceful-then-forceful termination of a child and every
//! process it started, the sandbox step applied to a command before it is
//! spawned, and the interrupt flag checked by every blocking loop.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of [`wait_timeout`]
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Longest a blocking loop goes without looking at [`interrupted`]
pub const INTERRUPT_CHECK: Duration = Duration::from_millis(250);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Whether SIGINT or SIGTERM has been received
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turn SIGINT and SIGTERM into a flag instead of an immediate exit, so the
/// worker can remove its build and say goodbye first.
#[cfg(unix)]
pub fn install_interrupt_handler() -> io::Result<()> {
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe
        if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() -> io::Result<()> {
    tracing::debug!("Interrupt handling not supported on this platform");
    Ok(())
}

/// Sleep for `duration`, returning early (with `false`) on interrupt
pub fn sleep_interruptible(duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(INTERRUPT_CHECK));
    }
}

/// Wait up to `timeout` for `child` to exit.
///
/// Returns `Ok(None)` if it is still running at the deadline.
pub fn wait_timeout(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

/// Start the process spawned by `cmd` in a new process group led by itself,
/// so it can be stopped together with everything it starts.
#[cfg(unix)]
pub fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn isolate_process_group(_cmd: &mut Command) {}

/// Send `signal` to the process group led by `child`.
///
/// Falls back to the child alone when it does not lead a group. A group
/// that no longer exists is not an error.
#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: killpg() and kill() have no memory-safety preconditions
    if unsafe { libc::killpg(pid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        return Err(err);
    }
    // SAFETY: as above
    if unsafe { libc::kill(pid, signal) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// SIGKILL whatever is left in the group led by the already reaped `pid`.
///
/// The pid itself may have been reused, so there is no fallback to it.
#[cfg(unix)]
fn kill_stragglers(pid: u32) {
    // SAFETY: killpg() has no memory-safety preconditions
    if unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid, error = %err, "Unable to kill leftover processes");
        }
    }
}

/// Ask `child` and its group to exit (SIGTERM on unix; an immediate kill
/// elsewhere).
pub fn request_termination(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        signal_group(child, libc::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        child.kill()
    }
}

/// Kill `child` and every process left in its group, then reap the child.
pub fn kill_group(child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL)?;

    #[cfg(not(unix))]
    child.kill()?;

    child.wait()
}

/// Terminate `child`, escalating to a kill if it outlives `grace`.
///
/// Stragglers left in the child's process group are killed either way.
/// Returns the exit status and whether the kill was needed.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<(ExitStatus, bool)> {
    request_termination(child)?;
    if let Some(status) = wait_timeout(child, grace)? {
        #[cfg(unix)]
        kill_stragglers(child.id());
        return Ok((status, false));
    }
    tracing::warn!(pid = child.id(), "Child ignored termination request; killing");
    Ok((kill_group(child)?, true))
}

/// Limit the data segment of the process spawned by `cmd` to `bytes`.
///
/// This reduces (but cannot prevent) the chance of one build exhausting the
/// host's memory: several children may each stay under the limit while
/// together exceeding it. The limit is clamped to the current hard limit so
/// that an unprivileged worker never fails to spawn because of it.
#[cfg(unix)]
pub fn apply_memory_limit(cmd: &mut Command, bytes: u64) {
    use std::os::unix::process::CommandExt;

    let wanted = bytes as libc::rlim_t;
    // SAFETY: the closure runs between fork and exec and only calls
    // getrlimit/setrlimit, which are async-signal-safe
    unsafe {
        cmd.pre_exec(move || {
            let mut current = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::getrlimit(libc::RLIMIT_DATA, &mut current) != 0 {
                return Err(io::Error::last_os_error());
            }
            let limit = if current.rlim_max == libc::RLIM_INFINITY {
                wanted
            } else {
                wanted.min(current.rlim_max)
            };
            let rlim = libc::rlimit {
                rlim_cur: limit,
                rlim_max: limit,
            };
            if libc::setrlimit(libc::RLIMIT_DATA, &rlim) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// No data-segment limit primitive exists here; builds run unconstrained.
#[cfg(not(unix))]
pub fn apply_memory_limit(_cmd: &mut Command, bytes: u64) {
    tracing::debug!(bytes, "Memory ceiling not supported on this platform");
}

/// Whether the current process runs with root privileges
#[cfg(unix)]
pub fn is_privileged() -> bool {
    // SAFETY: geteuid() cannot fail and has no preconditions
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_privileged() -> bool {
    false
}
