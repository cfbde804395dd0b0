//! # vwd-ipc
//!
//! The logical request/response contract between an external command
//! process (a git invocation wanting uninterrupted access to the working
//! directory) and the virtualization provider.
//!
//! Only the message types and their binary framing live here; the transport
//! (named pipe, unix socket) is an opaque channel owned by the host.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vwd_lock::{ExternalAcquireOutcome, HolderInfo};

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),

    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Requests an external process may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockRequest {
    /// Ask for exclusive access to the working directory.
    AcquireExclusive {
        pid: i32,
        is_elevated: bool,
        /// The requester's full original command line, recorded for
        /// PID-reuse detection.
        command_line: String,
    },
}

/// Identity of a holder, as reported in a denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: i32,
    pub is_elevated: bool,
    pub command_line: String,
}

/// Responses the provider may return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockResponse {
    Accepted,
    /// The provider itself holds exclusive access.
    DeniedByProvider,
    /// Another live external process holds exclusive access.
    DeniedByHolder { holder: LockHolder },
    /// The provider is still mounting and cannot arbitrate yet.
    NotReady,
}

impl LockRequest {
    pub fn holder_info(&self) -> HolderInfo {
        match self {
            Self::AcquireExclusive {
                pid,
                is_elevated,
                command_line,
            } => HolderInfo {
                pid: *pid,
                is_elevated: *is_elevated,
                command_line: command_line.clone(),
            },
        }
    }
}

impl From<HolderInfo> for LockHolder {
    fn from(info: HolderInfo) -> Self {
        Self {
            pid: info.pid,
            is_elevated: info.is_elevated,
            command_line: info.command_line,
        }
    }
}

impl From<ExternalAcquireOutcome> for LockResponse {
    fn from(outcome: ExternalAcquireOutcome) -> Self {
        match outcome {
            ExternalAcquireOutcome::Granted => Self::Accepted,
            ExternalAcquireOutcome::DeniedByProvider => Self::DeniedByProvider,
            ExternalAcquireOutcome::DeniedByHolder(holder) => Self::DeniedByHolder {
                holder: holder.into(),
            },
        }
    }
}

/// Encode a message as a length-prefixed frame (u32 little-endian length +
/// bincode payload).
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message).map_err(IpcError::Encode)?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode one length-prefixed frame, returning the message and the number
/// of bytes consumed.
pub fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<(T, usize)> {
    if bytes.len() < 4 {
        return Err(IpcError::Truncated {
            needed: 4,
            available: bytes.len(),
        });
    }
    let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let total = 4 + length;
    if bytes.len() < total {
        return Err(IpcError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let message = bincode::deserialize(&bytes[4..total]).map_err(IpcError::Decode)?;
    Ok((message, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> LockRequest {
        LockRequest::AcquireExclusive {
            pid: 4242,
            is_elevated: false,
            command_line: "git checkout feature/topic".to_string(),
        }
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = encode_frame(&request()).unwrap();
        let (decoded, consumed) = decode_frame::<LockRequest>(&frame).unwrap();
        assert_eq!(decoded, request());
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_response_frame_roundtrip() {
        let response = LockResponse::DeniedByHolder {
            holder: LockHolder {
                pid: 77,
                is_elevated: true,
                command_line: "git gc --aggressive".to_string(),
            },
        };
        let frame = encode_frame(&response).unwrap();
        let (decoded, _) = decode_frame::<LockResponse>(&frame).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = encode_frame(&LockResponse::Accepted).unwrap();
        match decode_frame::<LockResponse>(&frame[..frame.len() - 1]) {
            Err(IpcError::Truncated { needed, available }) => {
                assert_eq!(needed, frame.len());
                assert_eq!(available, frame.len() - 1);
            }
            other => panic!("expected truncation error, got {other:?}"),
        }
    }

    #[test]
    fn test_outcome_conversion() {
        let holder = HolderInfo {
            pid: 9,
            is_elevated: false,
            command_line: "git status".to_string(),
        };
        assert_eq!(
            LockResponse::from(ExternalAcquireOutcome::Granted),
            LockResponse::Accepted
        );
        assert_eq!(
            LockResponse::from(ExternalAcquireOutcome::DeniedByProvider),
            LockResponse::DeniedByProvider
        );
        match LockResponse::from(ExternalAcquireOutcome::DeniedByHolder(holder)) {
            LockResponse::DeniedByHolder { holder } => assert_eq!(holder.pid, 9),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_request_carries_holder_identity() {
        let info = request().holder_info();
        assert_eq!(info.pid, 4242);
        assert_eq!(info.command_line, "git checkout feature/topic");
    }
}
