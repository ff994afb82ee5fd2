//! Wire protocol for the Coffer control channel.
//!
//! One agent keeps one duplex TCP session to the server. Every message on
//! the session is a frame: a fixed binary header followed by a JSON payload.
//!
//! # Frame format
//!
//! Header: 24 bytes, network byte order (big endian):
//! ```text
//! [VER:1][OP:1][RES:2][JOB_ID:16][LEN:4]
//! ```
//!
//! - VER (u8): protocol version (0x01)
//! - OP (u8): opcode
//! - RES (u16): reserved, must be zero
//! - JOB_ID (16 bytes): raw UUID of the subject job, nil when not job-scoped
//! - LEN (u32): payload length in bytes

pub mod defaults;
pub mod error;
pub mod ids;
pub mod types;
pub mod wire;

pub use error::ProtocolError;
pub use ids::{AgentId, DestinationId, JobId, PolicyId, SnapshotId};
pub use types::{
    AgentMetrics,
    AgentStatus,
    BackupPayload,
    Capabilities,
    DestinationConfig,
    DestinationCredentials,
    DestinationKind,
    DestinationOutcome,
    DispatchDestination,
    ErrorCode,
    ErrorPayload,
    HeartbeatAck,
    HeartbeatRequest,
    HelloPayload,
    JobAssignment,
    JobStatus,
    JobType,
    LogClose,
    LogCloseAck,
    LogEntry,
    LogLevel,
    OpenStreamRequest,
    RegisterAck,
    RegisterRequest,
    ReportedStatus,
    RetentionPolicy,
    SourceRef,
    StatusReport,
    parse_source_ref,
    DOCKER_VOLUME_PREFIX,
};
pub use wire::{read_frame, write_frame};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, Read, Write};
use uuid::Uuid;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Maximum payload size (16 MiB). Anything larger is a protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Control-channel opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Agent -> Server (session auth preamble, first frame on a connection)
    Hello = 1,

    // Agent -> Server (upsert agent by hostname)
    Register = 2,

    // Server -> Agent (registration result: stable agent id)
    RegisterAck = 3,

    // Agent -> Server (open the job stream for this session)
    OpenStream = 4,

    // Server -> Agent (job delivery)
    Assign = 5,

    // Agent -> Server (keep-alive + lightweight metrics)
    Heartbeat = 6,

    // Server -> Agent
    HeartbeatAck = 7,

    // Agent -> Server (job state machine transition)
    StatusReport = 8,

    // Agent -> Server (one element of a per-job log stream)
    LogEntry = 9,

    // Agent -> Server (end of a per-job log stream)
    LogClose = 10,

    // Server -> Agent (log stream accepted, entries counted)
    LogCloseAck = 11,

    // Bidirectional
    Error = 12,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(OpCode::Hello),
            2 => Ok(OpCode::Register),
            3 => Ok(OpCode::RegisterAck),
            4 => Ok(OpCode::OpenStream),
            5 => Ok(OpCode::Assign),
            6 => Ok(OpCode::Heartbeat),
            7 => Ok(OpCode::HeartbeatAck),
            8 => Ok(OpCode::StatusReport),
            9 => Ok(OpCode::LogEntry),
            10 => Ok(OpCode::LogClose),
            11 => Ok(OpCode::LogCloseAck),
            12 => Ok(OpCode::Error),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub job_id: JobId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(opcode: OpCode, job_id: JobId, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            job_id,
            payload_len,
        }
    }

    /// Pack header into a 24-byte buffer.
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE], ProtocolError> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_all(self.job_id.as_uuid().as_bytes())?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from a 24-byte buffer.
    pub fn unpack(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let mut id_bytes = [0u8; 16];
        cursor.read_exact(&mut id_bytes)?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            job_id: JobId::from_uuid(Uuid::from_bytes(id_bytes)),
            payload_len,
        })
    }
}

/// A complete protocol frame (header + JSON payload).
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from raw payload bytes.
    ///
    /// Returns an error if the payload exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn new(opcode: OpCode, job_id: JobId, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, job_id, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Create a frame whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        opcode: OpCode,
        job_id: JobId,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Frame::new(opcode, job_id, serde_json::to_vec(value)?)
    }

    /// Decode the JSON payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize into one contiguous byte buffer (header + payload).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.pack()?);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pack_unpack() {
        let job_id = JobId::generate();
        let header = Header::new(OpCode::Assign, job_id, 1024);
        let packed = header.pack().unwrap();

        assert_eq!(packed.len(), HEADER_SIZE);

        let unpacked = Header::unpack(&packed).unwrap();
        assert_eq!(unpacked.version, PROTOCOL_VERSION);
        assert_eq!(unpacked.opcode, OpCode::Assign);
        assert_eq!(unpacked.job_id, job_id);
        assert_eq!(unpacked.payload_len, 1024);
    }

    #[test]
    fn header_roundtrip_all_opcodes() {
        for raw in 1u8..=12 {
            let opcode = OpCode::from_u8(raw).unwrap();
            let header = Header::new(opcode, JobId::nil(), 512);
            let unpacked = Header::unpack(&header.pack().unwrap()).unwrap();
            assert_eq!(header, unpacked);
        }
    }

    #[test]
    fn invalid_opcode_rejected() {
        assert!(matches!(
            OpCode::from_u8(0),
            Err(ProtocolError::InvalidOpCode(0))
        ));
        assert!(matches!(
            OpCode::from_u8(99),
            Err(ProtocolError::InvalidOpCode(99))
        ));
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = 0x7f;
        assert!(matches!(
            Header::unpack(&buf),
            Err(ProtocolError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn header_too_short_rejected() {
        let buf = [0u8; 8];
        assert!(matches!(
            Header::unpack(&buf),
            Err(ProtocolError::HeaderTooShort { .. })
        ));
    }

    #[test]
    fn frame_json_roundtrip() {
        let ack = types::HeartbeatAck {
            has_pending_jobs: false,
        };
        let frame = Frame::json(OpCode::HeartbeatAck, JobId::nil(), &ack).unwrap();
        assert_eq!(frame.header.payload_len as usize, frame.payload.len());

        let parsed: types::HeartbeatAck = frame.parse().unwrap();
        assert!(!parsed.has_pending_jobs);
    }

    #[test]
    fn oversized_payload_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            Frame::new(OpCode::LogEntry, JobId::nil(), payload),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
