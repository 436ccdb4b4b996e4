use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

pub mod discovery;
pub mod record;

pub use discovery::{AdvertisementHandle, Advertiser, Browser, DiscoveryError, DiscoveryEvent};
pub use record::{RecordError, ReceiverMode, SERVICE_TYPE, ServiceRecord};

/// Incremented on every breaking change to the frame layout or control messages.
pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;
pub const MAX_CONTROL_BYTES: usize = 8 * 1024;
pub const MAX_FRAME_BYTES: usize = 4 + 1 + MAX_CHUNK_BYTES;
pub const MAX_SENDER_NAME_CHARS: usize = 128;
pub const MAX_FILE_NAME_BYTES: usize = 255;
pub const DEFAULT_MAX_SUBMISSION_BYTES: u64 = 512 * 1024 * 1024;
pub const NONCE_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
const PROOF_INFO: &[u8] = b"manuscripts v1 submission proof";

pub type SessionId = String;

/// Opening header of every transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub protocol_version: u32,
    pub sender_name: String,
    pub file_name: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_proof: Option<Vec<u8>>,
}

impl SubmissionRequest {
    pub fn new(sender_name: &str, file_name: &str, size_bytes: u64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            sender_name: sender_name.to_owned(),
            file_name: file_name.to_owned(),
            size_bytes,
            passphrase_proof: None,
        }
    }

    pub fn validate(&self, max_size_bytes: u64) -> Result<(), CoreError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(CoreError::UnsupportedVersion(self.protocol_version));
        }

        let sender = self.sender_name.trim();
        if sender.is_empty() || sender.chars().count() > MAX_SENDER_NAME_CHARS {
            return Err(CoreError::InvalidSenderName);
        }
        if sender.chars().any(char::is_control) {
            return Err(CoreError::InvalidSenderName);
        }

        let file_name = self.file_name.trim();
        if file_name.is_empty()
            || file_name.len() > MAX_FILE_NAME_BYTES
            || file_name.chars().any(char::is_control)
        {
            return Err(CoreError::InvalidFileName);
        }

        if self.size_bytes > max_size_bytes {
            return Err(CoreError::DeclaredSizeTooLarge {
                size: self.size_bytes,
                max: max_size_bytes,
            });
        }
        Ok(())
    }
}

/// Argon2id cost parameters, sent with every challenge so both ends derive the same key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    fn hasher(&self) -> Result<Argon2<'static>, CoreError> {
        let params = Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|err| CoreError::KeyDerivation(err.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Challenge {
    pub nonce: Vec<u8>,
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
}

/// Session-scoped failure classes. Carried in `Rejected` and in status events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ProtocolMismatch,
    AuthenticationFailed,
    SizeExceeded,
    TransportInterrupted,
    Timeout,
    PersistenceFailure,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::ProtocolMismatch => "protocol mismatch",
            FailureReason::AuthenticationFailed => "authentication failed",
            FailureReason::SizeExceeded => "size exceeded",
            FailureReason::TransportInterrupted => "transport interrupted",
            FailureReason::Timeout => "timed out",
            FailureReason::PersistenceFailure => "persistence failure",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Submit(SubmissionRequest),
    AuthenticationRequired(Challenge),
    Proof { proof: Vec<u8> },
    Accepted { session_id: SessionId },
    Complete,
    Stored { file_name: String, size_bytes: u64 },
    Rejected { reason: FailureReason, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Control(ControlMessage),
    Chunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control = 0,
    Chunk = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("sender name must be non-empty, printable and <= 128 chars")]
    InvalidSenderName,
    #[error("file name must be non-empty, printable and <= 255 bytes")]
    InvalidFileName,
    #[error("declared size {size} exceeds the {max} byte limit")]
    DeclaredSizeTooLarge { size: u64, max: u64 },
    #[error("body chunk exceeds 64 KiB")]
    ChunkTooLarge,
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

impl CoreError {
    /// Codec and validation failures surface as protocol mismatches, except an oversized declaration.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            CoreError::DeclaredSizeTooLarge { .. } => FailureReason::SizeExceeded,
            _ => FailureReason::ProtocolMismatch,
        }
    }
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Control(control) => {
            let payload = serde_json::to_vec(control)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            if payload.len() > MAX_CONTROL_BYTES {
                return Err(CoreError::InvalidFrameLength);
            }
            (MessageType::Control as u8, payload)
        }
        WireMessage::Chunk(chunk) => {
            if chunk.len() > MAX_CHUNK_BYTES {
                return Err(CoreError::ChunkTooLarge);
            }
            (MessageType::Chunk as u8, chunk.to_vec())
        }
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 || frame.len() > MAX_FRAME_BYTES {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Control as u8 => {
            if payload.len() > MAX_CONTROL_BYTES {
                return Err(CoreError::InvalidFrameLength);
            }
            let control: ControlMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Control(control))
        }
        x if x == MessageType::Chunk as u8 => Ok(WireMessage::Chunk(Bytes::copy_from_slice(payload))),
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

/// Slow, salted hash of the passphrase. Both the receiver (at configuration)
/// and the sender (when challenged) run this with the same salt and params.
pub fn derive_passphrase_key(
    passphrase: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<[u8; KEY_LEN], CoreError> {
    let mut output = [0_u8; KEY_LEN];
    kdf.hasher()?
        .hash_password_into(passphrase.as_bytes(), salt, &mut output)
        .map_err(|err| CoreError::KeyDerivation(err.to_string()))?;
    Ok(output)
}

pub fn compute_proof(key: &[u8; KEY_LEN], nonce: &[u8]) -> Result<[u8; 32], CoreError> {
    let hk = Hkdf::<Sha256>::new(Some(nonce), key);
    let mut output = [0_u8; 32];
    hk.expand(PROOF_INFO, &mut output)
        .map_err(|_| CoreError::KeyDerivation("hkdf expand failed".to_owned()))?;
    Ok(output)
}

/// Constant-time comparison for proofs.
pub fn proofs_match(expected: &[u8], presented: &[u8]) -> bool {
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented)
        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Answer a challenge from the passphrase the operator shared with the sender.
///
/// Surrounding whitespace is ignored, matching how receivers store it.
pub fn answer_challenge(passphrase: &str, challenge: &Challenge) -> Result<Vec<u8>, CoreError> {
    let key = derive_passphrase_key(passphrase.trim(), &challenge.salt, &challenge.kdf)?;
    Ok(compute_proof(&key, &challenge.nonce)?.to_vec())
}
