//! Transfer channel messages

use serde::{Deserialize, Serialize};

use crate::{ProtoError, Result, WireMessage};

/// Messages of the pull-based file transfer.
///
/// The worker sends `Hello` (repeatedly, until the peer starts fetching) and
/// `Chunk`; the coordinator sends `Fetch` and `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMessage {
    Hello { worker_id: u32 },
    Fetch { offset: u64, size: u32 },
    Chunk { offset: u64, data: Vec<u8> },
    Done,
}

impl WireMessage for TransferMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProtoError::Encode {
            tag: self.tag(),
            reason: e.to_string(),
        })
    }

    fn decode(body: &[u8]) -> Result<Self> {
        bincode::deserialize(body).map_err(|e| ProtoError::Decode(e.to_string()))
    }

    fn tag(&self) -> &'static str {
        match self {
            TransferMessage::Hello { .. } => "HELLO",
            TransferMessage::Fetch { .. } => "FETCH",
            TransferMessage::Chunk { .. } => "CHUNK",
            TransferMessage::Done => "DONE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_payload_is_raw_bytes() {
        let data = vec![0x7f, b'E', b'L', b'F', 0, 255];
        let msg = TransferMessage::Chunk {
            offset: 4096,
            data: data.clone(),
        };
        let body = msg.encode().unwrap();
        // variant index + offset + length prefix + payload, no per-byte overhead
        assert_eq!(body.len(), 4 + 8 + 8 + data.len());
        assert_eq!(TransferMessage::decode(&body).unwrap(), msg);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            TransferMessage::decode(&[0xff, 0xff, 0xff, 0xff]),
            Err(ProtoError::Decode(_))
        ));
    }
}
