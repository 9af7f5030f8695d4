//! Error types for the Stroop link protocol
//!
//! Each layer has its own enum; `StroopError` collects them for callers
//! that cross layers. Task outcomes (timeout, forced stop) are data and
//! never appear here.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::TaskId;

/// Byte framing failures
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid frame length: {0}")]
    InvalidLength(i64),

    #[error("Frame too large: max {max}, got {actual}")]
    TooLarge { max: usize, actual: usize },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Peer went away (as opposed to sending a bad frame)
    pub fn is_connection_loss(&self) -> bool {
        match self {
            FrameError::ConnectionClosed => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Message encoding/decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Handshake failures; the attempt is retried per backoff
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected message during handshake: {0}")]
    UnexpectedMessage(String),

    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("Peer not ready")]
    NotReady,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Configuration failures; fatal at startup, never retried
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Palette needs at least 2 distinct colors, got {0}")]
    TooFewColors(usize),

    #[error("Word {word:?} has no non-matching color in the palette")]
    NoAlternativeColor { word: String },

    #[error("Duplicate color word: {0:?}")]
    DuplicateWord(String),

    #[error("Minimum interval {min:?} exceeds maximum interval {max:?}")]
    IntervalRange { min: Duration, max: Duration },

    #[error("Duration {0} must be greater than zero")]
    NonPositiveDuration(&'static str),

    #[error("Congruent stimulus: word {word:?} drawn in {color:?}")]
    CongruentStimulus { word: String, color: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Session sequencing failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No next task in the session")]
    NoNextTask,

    #[error("Session has no tasks")]
    EmptySequence,

    #[error("Task {0} appears more than once in the sequence")]
    DuplicateTask(TaskId),

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Session is complete")]
    SessionComplete,

    #[error("Task {0} is already running")]
    TaskRunning(TaskId),

    #[error("No task is running")]
    NoRunningTask,
}

/// Connection establishment and link failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("Connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Connection handle closed")]
    Closed,
}

/// Umbrella error for cross-layer callers
#[derive(Error, Debug)]
pub enum StroopError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result type for Stroop operations
pub type StroopResult<T> = Result<T, StroopError>;
