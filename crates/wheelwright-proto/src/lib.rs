//! Wheelwright wire protocol
//!
//! Message definitions and framing shared by build workers and the
//! coordinator that drives them. Two channels exist:
//!
//! - **Session channel**: strict request/reply. The worker always speaks
//!   first and never has more than one request outstanding. Messages are
//!   JSON so that a misbehaving peer shows up legibly in logs.
//! - **Transfer channel**: pull-based file transfer. The coordinator fetches
//!   chunks of an artifact by offset; the worker only answers. Messages are
//!   bincode because they carry raw file bytes.
//!
//! Both channels carry length-prefixed frames, see [`codec`].
//!
//! # Session exchange
//!
//! ```text
//!  worker                          coordinator
//!    │ HELLO(timeout, tags)  ───────────▶ │
//!    │ ◀─────────── ACK(worker_id, url)   │
//!    │ IDLE ────────────────────────────▶ │
//!    │ ◀──────────────── BUILD(pkg, ver)  │
//!    │ BUILT(report) ───────────────────▶ │
//!    │ ◀──────────────────── SEND(file)   │   (transfer channel runs here)
//!    │ SENT ────────────────────────────▶ │
//!    │ ◀──────────────────────────── DONE │
//!    │ IDLE ────────────────────────────▶ │
//! ```

pub mod codec;
pub mod session;
pub mod transfer;

pub use codec::{encode_frame, frame_body, FrameBuffer, MAX_FRAME_LEN};
pub use session::{ArtifactSummary, BuildReport, SessionMessage};
pub use transfer::TransferMessage;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("failed to encode {tag} message: {reason}")]
    Encode { tag: &'static str, reason: String },

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtoError>;

/// A message that can be carried in a frame body.
pub trait WireMessage: Sized {
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(body: &[u8]) -> Result<Self>;

    /// Protocol tag, for logging
    fn tag(&self) -> &'static str;
}

/// Default coordinator port for the session channel
pub const SESSION_PORT: u16 = 5555;

/// Default coordinator port for the transfer channel
pub const TRANSFER_PORT: u16 = 5556;
