//! Shared protocol constants for the ferry wire format

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"FRRY";
pub const VERSION: u16 = 1;

/// Default TCP port for both sides
pub const DEFAULT_PORT: u16 = 3254;

/// Default streaming chunk size
pub const CHUNK_BYTES: usize = 1024;

// Upper bound for an encoded handshake. Enforced on encode and on decode so
// an overlong path is rejected instead of silently corrupting the message.
pub const MAX_HANDSHAKE_BYTES: usize = 1024;

// Ack frames carry a status byte and a short reason string
pub const MAX_ACK_BYTES: usize = 512;

/// Field separator inside the handshake payload
pub const DELIMITER: char = '|';

pub const DEFAULT_ALGORITHM: &str = "sha256";

/// Storage roots, relative to the working directory
pub const SERVER_DIR: &str = "server";
pub const CLIENT_DIR: &str = "client";

// Frame type IDs (keep numeric stable)
pub mod frame {
    pub const HANDSHAKE: u8 = 1;
    pub const ACK: u8 = 2;
}

// Receiver replies. PROCEED/SKIP answer the handshake; the rest close a
// transfer.
pub mod status {
    pub const PROCEED: u8 = 0;
    pub const SKIP: u8 = 1;
    pub const COMPLETED: u8 = 2;
    pub const TRUNCATED: u8 = 3;
    pub const REJECTED: u8 = 4;
    pub const FAILED: u8 = 5;
}

// Centralized timeout constants
pub mod timeouts {
    // Per-chunk read/write bound (ms)
    pub const IO_MS: u64 = 30_000;

    // Fixed backoff between connection attempts (ms)
    pub const CONNECT_RETRY_MS: u64 = 2_000;

    // How long the client waits after creating its storage root (ms)
    pub const BOOTSTRAP_WAIT_MS: u64 = 10_000;

    // Progress tick interval for UI updates (ms)
    pub const PROGRESS_TICK_MS: u64 = 250;
}
