//! Handshake codec, ack frames and destination containment
//!
//! Pure functions shared by the sending and receiving halves of
//! `net_async`; nothing in here touches a socket.

use crate::error::{Result, TransferError};
use crate::protocol::{frame, status, DELIMITER, MAX_ACK_BYTES, MAX_HANDSHAKE_BYTES};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Metadata sent once per connection, before any payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Name of the file at the source. Only its final component is used.
    pub path: String,
    /// Declared payload length in bytes
    pub size: u64,
    /// Lowercase hex digest of the first `size` bytes
    pub digest: String,
}

impl TransferRequest {
    pub fn new(path: impl Into<String>, size: u64, digest: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            digest: digest.into(),
        }
    }

    /// Encode as `<path>|<size>|<digest>`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.path.contains(DELIMITER) {
            return Err(TransferError::MalformedHandshake(format!(
                "path {:?} contains the field delimiter {:?}",
                self.path, DELIMITER
            )));
        }
        if self.path.is_empty() {
            return Err(TransferError::MalformedHandshake("empty path".into()));
        }
        let msg = format!(
            "{}{d}{}{d}{}",
            self.path,
            self.size,
            self.digest,
            d = DELIMITER
        );
        if msg.len() > MAX_HANDSHAKE_BYTES {
            return Err(TransferError::MalformedHandshake(format!(
                "handshake is {} bytes (max: {})",
                msg.len(),
                MAX_HANDSHAKE_BYTES
            )));
        }
        Ok(msg.into_bytes())
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() > MAX_HANDSHAKE_BYTES {
            return Err(TransferError::MalformedHandshake(format!(
                "handshake is {} bytes (max: {})",
                raw.len(),
                MAX_HANDSHAKE_BYTES
            )));
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| TransferError::MalformedHandshake("handshake is not UTF-8".into()))?;
        let parts: Vec<&str> = text.split(DELIMITER).collect();
        if parts.len() != 3 {
            return Err(TransferError::MalformedHandshake(format!(
                "expected 3 fields, got {}",
                parts.len()
            )));
        }
        let (path, size, digest) = (parts[0], parts[1], parts[2]);
        if path.is_empty() {
            return Err(TransferError::MalformedHandshake("empty path".into()));
        }
        // u64::from_str accepts a leading '+', the wire format does not
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TransferError::MalformedHandshake(format!(
                "size {:?} is not a non-negative integer",
                size
            )));
        }
        let size = size
            .parse::<u64>()
            .map_err(|e| TransferError::MalformedHandshake(format!("size {:?}: {}", size, e)))?;
        if digest.is_empty()
            || !digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(TransferError::MalformedHandshake(format!(
                "digest {:?} is not lowercase hex",
                digest
            )));
        }
        Ok(Self::new(path, size, digest))
    }
}

/// How a transfer ended, as decided by the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// Destination already held identical content; no payload was sent
    Skipped,
    /// Received byte count equals the declared size
    Completed,
    /// Stream closed before the declared size arrived
    Truncated,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::Truncated => "truncated",
        };
        f.write_str(s)
    }
}

/// Summary of one transfer from either side of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub request: TransferRequest,
    /// Local file: the source for the sender, the destination for the receiver
    pub path: PathBuf,
    /// Payload bytes sent (sender) or received (receiver)
    pub bytes: u64,
    pub outcome: TransferOutcome,
}

/// Receiver verdicts carried by ACK frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Proceed,
    Skip,
    Completed,
    Truncated,
    Rejected,
    Failed,
}

impl AckStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Proceed => status::PROCEED,
            Self::Skip => status::SKIP,
            Self::Completed => status::COMPLETED,
            Self::Truncated => status::TRUNCATED,
            Self::Rejected => status::REJECTED,
            Self::Failed => status::FAILED,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            status::PROCEED => Some(Self::Proceed),
            status::SKIP => Some(Self::Skip),
            status::COMPLETED => Some(Self::Completed),
            status::TRUNCATED => Some(Self::Truncated),
            status::REJECTED => Some(Self::Rejected),
            status::FAILED => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Proceed => "PROCEED",
            Self::Skip => "SKIP",
            Self::Completed => "COMPLETED",
            Self::Truncated => "TRUNCATED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Status code plus a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
    pub reason: String,
}

impl Ack {
    pub fn new(status: AckStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    /// Payload: status u8 | reason bytes (truncated to fit the frame limit)
    pub fn encode(&self) -> Vec<u8> {
        let mut reason = self.reason.as_str();
        while reason.len() > MAX_ACK_BYTES - 1 {
            let mut cut = MAX_ACK_BYTES - 1;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason = &reason[..cut];
        }
        let mut out = Vec::with_capacity(1 + reason.len());
        out.push(self.status.code());
        out.extend_from_slice(reason.as_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (&code, rest) = raw
            .split_first()
            .ok_or_else(|| TransferError::MalformedHandshake("empty ack".into()))?;
        let status = AckStatus::from_code(code)
            .ok_or_else(|| TransferError::MalformedHandshake(format!("unknown ack status {}", code)))?;
        Ok(Self {
            status,
            reason: String::from_utf8_lossy(rest).into_owned(),
        })
    }
}

/// Validate a frame payload size against the limit for its type
pub fn validate_frame_size(frame_type: u8, size: usize) -> Result<()> {
    let max = match frame_type {
        frame::HANDSHAKE => MAX_HANDSHAKE_BYTES,
        frame::ACK => MAX_ACK_BYTES,
        other => {
            return Err(TransferError::MalformedHandshake(format!(
                "unknown frame type {}",
                other
            )))
        }
    };
    if size > max {
        return Err(TransferError::MalformedHandshake(format!(
            "frame payload too large: {} bytes (max: {})",
            size, max
        )));
    }
    Ok(())
}

/// Build frame header (11 bytes)
/// Format: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; 11] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; 11];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; 11]) -> Result<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    if &header[0..4] != MAGIC {
        return Err(TransferError::MalformedHandshake(
            "invalid magic in frame header".into(),
        ));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(TransferError::MalformedHandshake(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

/// Place a declared path under the storage root.
///
/// Only the final file-name component is kept; the directory part of the
/// declared path is never honored. Both `/` and `\` count as separators so
/// a Windows sender cannot smuggle components past a Unix receiver.
pub fn destination_path(root: &Path, declared: &str) -> Result<PathBuf> {
    let unsafe_path = |reason| TransferError::UnsafePath {
        path: declared.to_string(),
        reason,
    };

    if declared.contains('\0') {
        return Err(unsafe_path("contains NUL byte"));
    }
    let segments: Vec<&str> = declared.split(['/', '\\']).collect();
    if segments.iter().any(|s| *s == "..") {
        return Err(unsafe_path("contains parent directory component"));
    }
    let name = segments.last().copied().unwrap_or("");
    if name.is_empty() || name == "." {
        return Err(unsafe_path("empty file name"));
    }
    // Windows ADS defense
    #[cfg(windows)]
    if name.contains(':') {
        return Err(unsafe_path("file name contains colon"));
    }

    Ok(root.join(name))
}

/// Create directory with parent creation. Returns true if it was created.
pub fn ensure_dir_exists(path: &Path) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    std::fs::create_dir_all(path)?;
    Ok(true)
}
