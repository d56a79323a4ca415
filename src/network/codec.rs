use serde::{Deserialize, Serialize};
use std::io::{Error, ErrorKind};

use crate::raft::rpc::RaftMessage;
use crate::raft::types::NodeId;

// Constants for message size management
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB - prevent DoS attacks

/// Length prefix plus crc32c of the payload
const HEADER_SIZE: usize = 8;

/// A Raft message addressed from one member to another, as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub from: NodeId,
    pub to: NodeId,
    pub message: RaftMessage,
}

/// Frames messages as `[len: u32 BE][crc32c: u32 BE][bincode payload]`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl MessageCodec {
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn encode(&self, message: &NetworkMessage) -> Result<Vec<u8>, Error> {
        let payload = bincode::serialize(message).map_err(|e| {
            Error::new(ErrorKind::InvalidData, format!("Serialization error: {}", e))
        })?;
        if payload.len() > self.max_message_size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Serialized message size {} exceeds maximum {}",
                    payload.len(),
                    self.max_message_size
                ),
            ));
        }

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc32c::crc32c(&payload).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decodes one complete frame.
    pub fn decode(&self, frame: &[u8]) -> Result<NetworkMessage, Error> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::UnexpectedEof, "Truncated frame header"));
        }
        let len = self.check_len(&frame[0..4])?;
        if frame.len() != HEADER_SIZE + len {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Frame holds {} bytes, header announces {}", frame.len() - HEADER_SIZE, len),
            ));
        }
        let crc = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        self.decode_payload(crc, &frame[HEADER_SIZE..])
    }

    fn check_len(&self, bytes: &[u8]) -> Result<usize, Error> {
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;

        // Validate message size to prevent DoS attacks
        if len > self.max_message_size {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("Message size {} exceeds maximum {}", len, self.max_message_size),
            ));
        }
        if len == 0 {
            return Err(Error::new(ErrorKind::InvalidData, "Message size cannot be zero"));
        }
        Ok(len)
    }

    fn decode_payload(&self, crc: u32, payload: &[u8]) -> Result<NetworkMessage, Error> {
        if crc32c::crc32c(payload) != crc {
            return Err(Error::new(ErrorKind::InvalidData, "Frame checksum mismatch"));
        }
        bincode::deserialize(payload).map_err(|e| {
            Error::new(
                ErrorKind::InvalidData,
                format!("Deserialization error: {}", e),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::rpc::RequestVoteRequest;

    fn vote_request() -> NetworkMessage {
        NetworkMessage {
            from: "node-1".to_string(),
            to: "node-2".to_string(),
            message: RaftMessage::RequestVote(RequestVoteRequest {
                term: 3,
                candidate_id: "node-1".to_string(),
                last_log_index: 10,
                last_log_term: 2,
            }),
        }
    }

    #[test]
    fn test_frame_must_match_announced_length() {
        let codec = MessageCodec::default();
        let frame = codec.encode(&vote_request()).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), vote_request());

        let err = codec.decode(&frame[..frame.len() - 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = codec.decode(&frame[..3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let codec = MessageCodec::default();
        let mut frame = codec.encode(&vote_request()).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let err = codec.decode(&frame).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_message_is_rejected() {
        let codec = MessageCodec::with_max_message_size(16);
        assert!(codec.encode(&vote_request()).is_err());

        let frame = MessageCodec::default().encode(&vote_request()).unwrap();
        assert!(codec.decode(&frame).is_err());
    }
}
