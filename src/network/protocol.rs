//! Framed peer wire messages
//!
//! Every frame is a 4-byte big-endian header length, a JSON header, and an
//! optional raw payload (only data responses carry one; the payload is never
//! JSON-encoded). Offsets and lengths are u64 end to end; they routinely
//! exceed 2³¹.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError, Result};
use crate::types::ObjectType;

/// One advertised byte range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    /// Range start
    pub offset: u64,
    /// Range length
    pub length: u64,
}

/// A peer-to-peer message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mtype", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Consumer asks a supplier what it has and to keep it informed
    AvailabilityInfoRequest {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Supplier reports sorted non-overlapping ranges it can serve
    AvailabilityInfoResponse {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Advertised ranges
        ranges: Vec<Range>,
    },
    /// Consumer cancels its subscription
    AvailabilityInfoAbort {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Supplier reports it cannot serve the subscription
    AvailabilityInfoFailure {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Failure code
        error: ProtocolError,
    },
    /// Consumer requests a byte range
    DataRequest {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Range start
        offset: u64,
        /// Range length
        length: u64,
    },
    /// Supplier delivers a byte range; the payload rides after the header
    DataResponse {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Range start
        offset: u64,
        /// Range length
        length: u64,
        /// The raw bytes (framed outside the JSON header)
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// Consumer aborts in-flight requests for an object
    DataAbort {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
    },
    /// Supplier reports a data request failure
    DataFailure {
        /// Object class
        obj_type: ObjectType,
        /// Object id
        obj_id: String,
        /// Offset of the failed request
        offset: u64,
        /// Failure code
        error: ProtocolError,
    },
}

impl PeerMessage {
    /// Object id the message concerns
    pub fn obj_id(&self) -> &str {
        match self {
            PeerMessage::AvailabilityInfoRequest { obj_id, .. }
            | PeerMessage::AvailabilityInfoResponse { obj_id, .. }
            | PeerMessage::AvailabilityInfoAbort { obj_id, .. }
            | PeerMessage::AvailabilityInfoFailure { obj_id, .. }
            | PeerMessage::DataRequest { obj_id, .. }
            | PeerMessage::DataResponse { obj_id, .. }
            | PeerMessage::DataAbort { obj_id, .. }
            | PeerMessage::DataFailure { obj_id, .. } => obj_id,
        }
    }

    /// Object class the message concerns
    pub fn obj_type(&self) -> ObjectType {
        match self {
            PeerMessage::AvailabilityInfoRequest { obj_type, .. }
            | PeerMessage::AvailabilityInfoResponse { obj_type, .. }
            | PeerMessage::AvailabilityInfoAbort { obj_type, .. }
            | PeerMessage::AvailabilityInfoFailure { obj_type, .. }
            | PeerMessage::DataRequest { obj_type, .. }
            | PeerMessage::DataResponse { obj_type, .. }
            | PeerMessage::DataAbort { obj_type, .. }
            | PeerMessage::DataFailure { obj_type, .. } => *obj_type,
        }
    }

    /// Encode into a frame: `u32 header_len | header JSON | payload`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(self)?;
        let payload: &[u8] = match self {
            PeerMessage::DataResponse { data, .. } => data,
            _ => &[],
        };

        let mut frame = Vec::with_capacity(4 + header.len() + payload.len());
        frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Decode a frame produced by [`Self::encode`]
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 4 {
            return Err(invalid("frame shorter than the length prefix"));
        }
        let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if frame.len() < 4 + header_len {
            return Err(invalid("frame shorter than its declared header"));
        }

        let mut message: PeerMessage = serde_json::from_slice(&frame[4..4 + header_len])?;
        if let PeerMessage::DataResponse { length, data, .. } = &mut message {
            let payload = &frame[4 + header_len..];
            if payload.len() as u64 != *length {
                return Err(invalid("data payload length mismatch"));
            }
            *data = payload.to_vec();
        }
        Ok(message)
    }
}

fn invalid(reason: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid peer frame: {reason}"),
    ))
}
