/*!
 * Error types for the build worker
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use wheelwright_proto::ProtoError;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PRIVILEGED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug)]
pub enum WorkerError {
    /// I/O error
    Io(io::Error),

    /// Peer closed the connection
    ConnectionClosed,

    /// Coordinator broke the protocol (unexpected message, unmet precondition)
    Protocol(String),

    /// Frame or message could not be encoded/decoded
    Wire(ProtoError),

    /// Build output filename does not follow the wheel naming scheme
    InvalidFilename(String),

    /// Internal consistency check failed
    Consistency(String),

    /// Wheel archive could not be read
    Archive { path: PathBuf, reason: String },

    /// Configuration error
    Config(String),

    /// Build-target tags could not be determined
    Target(String),

    /// SIGINT or SIGTERM received
    Interrupted,
}

impl WorkerError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Interrupted => EXIT_INTERRUPTED,
            _ => EXIT_FATAL,
        }
    }

    /// Check if this error means the session connection is gone.
    ///
    /// These are the only errors the session loop recovers from, by
    /// reconnecting; everything else ends the process.
    pub fn is_network_error(&self) -> bool {
        match self {
            WorkerError::Io(io_err) => {
                use io::ErrorKind::*;
                matches!(
                    io_err.kind(),
                    ConnectionRefused
                        | ConnectionReset
                        | ConnectionAborted
                        | NotConnected
                        | BrokenPipe
                        | TimedOut
                        | UnexpectedEof
                )
            }
            WorkerError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Check if this error is a violation of the coordinator protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, WorkerError::Protocol(_) | WorkerError::Wire(_))
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Io(err) => write!(f, "I/O error: {}", err),
            WorkerError::ConnectionClosed => write!(f, "Connection closed by peer"),
            WorkerError::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            WorkerError::Wire(err) => write!(f, "Wire error: {}", err),
            WorkerError::InvalidFilename(name) => {
                write!(f, "Invalid wheel filename: {}", name)
            }
            WorkerError::Consistency(msg) => write!(f, "Consistency check failed: {}", msg),
            WorkerError::Archive { path, reason } => {
                write!(f, "Unable to read archive {}: {}", path.display(), reason)
            }
            WorkerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            WorkerError::Target(msg) => write!(f, "Unable to determine build target: {}", msg),
            WorkerError::Interrupted => write!(f, "Interrupted"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Io(err) => Some(err),
            WorkerError::Wire(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        WorkerError::Io(err)
    }
}

impl From<ProtoError> for WorkerError {
    fn from(err: ProtoError) -> Self {
        WorkerError::Wire(err)
    }
}
