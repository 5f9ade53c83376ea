use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tensor::{OutputSpec, Params, TensorHandle};

/// Version carried in every handshake; both ends must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single framed message, prefix excluded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Every message exchanged between a worker and its host.
///
/// Each frame on the wire is one `ControlMessage` behind a 4-byte big-endian
/// u32 length prefix (see [`crate::codec::BinCodec`]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Heartbeat(Heartbeat),
    JobSubmit(JobSubmit),
    JobResult(JobResult),
    JobCancel(JobCancel),
}

/// First message on a fresh connection, worker to host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Handshake {
    pub worker_id: Uuid,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// Host's reply to a [`Handshake`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HandshakeAck {
    pub slot_index: u32,
    pub arena_name: String,
}

/// Bidirectional keepalive; the receiver echoes the same sequence number.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobSubmit {
    pub job_id: String,
    pub op_type: String,
    pub params: Params,
    pub inputs: HashMap<String, TensorHandle>,
    pub outputs: Vec<OutputSpec>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub outputs: HashMap<String, TensorHandle>,
    pub error: Option<JobError>,
    pub metrics: JobMetrics,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub trace: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    pub duration_us: u64,
    pub peak_memory_bytes: u64,
    pub items_processed: Option<u64>,
}

/// Best-effort cancellation request; fire-and-forget, no reply.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobCancel {
    pub job_id: String,
}
