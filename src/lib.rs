/*!
 * Wheelwright - build-farm worker for Python wheels
 *
 * Connects to a build coordinator and, on request:
 * - builds a package version into wheels with a time limit and memory ceiling
 * - reports each wheel's tags, SHA-256 and native library dependencies
 * - serves wheel files over a coordinator-driven chunked transfer
 *
 * Version: 0.3.0
 */

pub mod artifact;
pub mod builder;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod process;
pub mod slave;
pub mod target;
pub mod transfer;
pub mod transport;

// Re-export commonly used types
pub use artifact::{Artifact, DependencyInspector, PackageDatabase, WheelName};
pub use builder::{BuildSettings, Builder};
pub use config::{LogLevel, Timings, WorkerConfig};
pub use error::{Result, WorkerError};
pub use host::{HostSupervisor, NoopSupervisor, SystemdNotifier};
pub use slave::{Phase, Slave};
pub use target::BuildTarget;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
