//! Host supervisor notifications.
//!
//! The worker is expected to run under a service manager that restarts it
//! when it hangs. [`HostSupervisor`] is the narrow interface the rest of the
//! crate uses to report readiness and prove liveness; [`SystemdNotifier`]
//! speaks the systemd notify-socket protocol and [`NoopSupervisor`] discards
//! everything.

use std::path::PathBuf;

/// Liveness reporting to whatever supervises this process.
///
/// Implementations must never fail loudly: a supervisor that cannot be
/// reached is not a reason to stop building.
pub trait HostSupervisor: Send + Sync {
    /// Connected and about to handshake
    fn ready(&self);

    /// Re-establishing the coordinator connection
    fn reloading(&self);

    /// Shutting down
    fn stopping(&self);

    /// Still alive; called periodically during long child-process waits
    fn watchdog_ping(&self);
}

/// Supervisor that ignores all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSupervisor;

impl HostSupervisor for NoopSupervisor {
    fn ready(&self) {}
    fn reloading(&self) {}
    fn stopping(&self) {}
    fn watchdog_ping(&self) {}
}

/// Sends `sd_notify` datagrams to `$NOTIFY_SOCKET`.
///
/// Silent when the variable is unset, i.e. when not started by systemd.
#[derive(Debug, Clone, Default)]
pub struct SystemdNotifier {
    socket: Option<PathBuf>,
}

impl SystemdNotifier {
    /// Notifier for the socket named by `$NOTIFY_SOCKET`, if any
    pub fn from_env() -> Self {
        Self {
            socket: std::env::var_os("NOTIFY_SOCKET").map(PathBuf::from),
        }
    }

    /// Notifier for an explicit socket path
    pub fn with_socket(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.socket.is_some()
    }

    fn notify(&self, state: &str) {
        let Some(socket) = &self.socket else {
            return;
        };
        if let Err(e) = send_datagram(socket, state.as_bytes()) {
            tracing::debug!(socket = %socket.display(), state, error = %e, "Supervisor notification failed");
        }
    }
}

impl HostSupervisor for SystemdNotifier {
    fn ready(&self) {
        self.notify("READY=1");
    }

    fn reloading(&self) {
        self.notify("RELOADING=1");
    }

    fn stopping(&self) {
        self.notify("STOPPING=1");
    }

    fn watchdog_ping(&self) {
        self.notify("WATCHDOG=1");
    }
}

#[cfg(unix)]
fn send_datagram(socket: &std::path::Path, payload: &[u8]) -> std::io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let sock = UnixDatagram::unbound()?;

    // Abstract namespace sockets are spelled with a leading '@'
    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;
        use std::os::unix::ffi::OsStrExt;
        use std::os::unix::net::SocketAddr;

        let raw = socket.as_os_str().as_bytes();
        if let Some(name) = raw.strip_prefix(b"@") {
            let addr = SocketAddr::from_abstract_name(name)?;
            sock.send_to_addr(payload, &addr)?;
            return Ok(());
        }
    }

    sock.send_to(payload, socket)?;
    Ok(())
}

#[cfg(not(unix))]
fn send_datagram(_socket: &std::path::Path, _payload: &[u8]) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "notify sockets are not available on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_notifications_reach_socket() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let notifier = SystemdNotifier::with_socket(&path);
        assert!(notifier.is_enabled());

        let mut buf = [0u8; 64];
        notifier.ready();
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");

        notifier.watchdog_ping();
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");

        notifier.stopping();
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STOPPING=1");
    }

    #[test]
    fn test_missing_socket_is_harmless() {
        let dir = tempdir().unwrap();
        let notifier = SystemdNotifier::with_socket(dir.path().join("absent.sock"));
        notifier.ready();
        notifier.reloading();

        let disabled = SystemdNotifier::default();
        assert!(!disabled.is_enabled());
        disabled.watchdog_ping();
    }
}
