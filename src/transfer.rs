//! Pull-based artifact transfer.
//!
//! The coordinator drives the transfer: the worker only announces itself and
//! then answers `FETCH` requests for byte ranges of the artifact until the
//! coordinator says `DONE`. Ranges may repeat or arrive out of order.

use std::io::{Read, Seek, SeekFrom};
use std::time::{Duration, Instant};

use wheelwright_proto::{TransferMessage, WireMessage, MAX_FRAME_LEN};

use crate::error::{Result, WorkerError};
use crate::host::HostSupervisor;
use crate::transport::Connection;

/// Headroom left in a frame for the chunk envelope
const CHUNK_OVERHEAD: usize = 64;

/// Largest chunk that still fits in one frame
pub const MAX_CHUNK_LEN: u32 = (MAX_FRAME_LEN - CHUNK_OVERHEAD) as u32;

/// Totals for one completed transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Chunks sent
    pub chunks: u64,
    /// Payload bytes sent (re-sent ranges counted again)
    pub bytes: u64,
    /// Greetings sent, including the first
    pub greetings: u64,
    pub elapsed: Duration,
}

/// Answer fetch requests for `source` until the coordinator is done.
///
/// The greeting is repeated after every `retry` of silence; there is no
/// overall limit.
pub fn serve<S: Read + Seek>(
    conn: &mut Connection<TransferMessage>,
    source: &mut S,
    worker_id: u32,
    retry: Duration,
    host: &dyn HostSupervisor,
) -> Result<TransferStats> {
    let start = Instant::now();
    let mut stats = TransferStats::default();
    let mut timeout = Duration::ZERO;

    loop {
        let msg = match conn.recv_timeout(timeout)? {
            Some(msg) => msg,
            None => {
                conn.send(&TransferMessage::Hello { worker_id })?;
                stats.greetings += 1;
                timeout = retry;
                host.watchdog_ping();
                continue;
            }
        };

        match msg {
            TransferMessage::Fetch { offset, size } => {
                let data = read_range(source, offset, size)?;
                tracing::trace!(offset, size, len = data.len(), "Sending chunk");
                stats.chunks += 1;
                stats.bytes += data.len() as u64;
                conn.send(&TransferMessage::Chunk { offset, data })?;
            }
            TransferMessage::Done => {
                stats.elapsed = start.elapsed();
                return Ok(stats);
            }
            other @ (TransferMessage::Hello { .. } | TransferMessage::Chunk { .. }) => {
                return Err(WorkerError::Protocol(format!(
                    "Unexpected {} on transfer channel",
                    other.tag()
                )));
            }
        }
    }
}

/// Up to `size` bytes at `offset`; short only at end of file.
fn read_range<S: Read + Seek>(source: &mut S, offset: u64, size: u32) -> Result<Vec<u8>> {
    let size = size.min(MAX_CHUNK_LEN);
    source.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    source.by_ref().take(u64::from(size)).read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_range() {
        let mut source = Cursor::new(b"0123456789".to_vec());
        assert_eq!(read_range(&mut source, 2, 3).unwrap(), b"234");
        assert_eq!(read_range(&mut source, 8, 100).unwrap(), b"89");
        assert_eq!(read_range(&mut source, 0, 1).unwrap(), b"0");
        assert!(read_range(&mut source, 20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_fits_frame() {
        assert!((MAX_CHUNK_LEN as usize) < MAX_FRAME_LEN);
    }
}
