//! Error types shared across the multiplexer.

use std::io;

use thiserror::Error;

use crate::proxy::ProxyKind;
use crate::sb::msg::MsgKind;

/// Proxy registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("xid {0} is already registered")]
    DuplicateXid(u32),

    #[error("xid {0} not found")]
    NotFound(u32),

    #[error("no free {kind} xid in {first}..={last}")]
    ExhaustedRange {
        kind: ProxyKind,
        first: u32,
        last: u32,
    },
}

/// Side-band decode and dispatch errors.
///
/// None of these close the connection; the offending buffer is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("short header: {0} bytes")]
    ShortHeader(usize),

    #[error("buffer does not start with the message guard")]
    NotAMessage,

    #[error("version mismatch: got {got}, want {want}")]
    VersionMismatch { got: u8, want: u8 },

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("truncated {kind} message: {len} bytes, need {need}")]
    Truncated { kind: MsgKind, len: usize, need: usize },

    #[error("message of {0} bytes exceeds the side-band limit")]
    TooLarge(usize),

    #[error("bad {field} value {value} in {kind} message")]
    BadValue {
        kind: MsgKind,
        field: &'static str,
        value: u64,
    },

    #[error("{kind} index {index} out of range")]
    BadIndex { kind: MsgKind, index: u32 },

    #[error("unexpected {0} message from daemon")]
    Unexpected(MsgKind),
}

/// Link creation, deletion and membership errors.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid interface name: {0:?}")]
    InvalidName(String),

    #[error("invalid VLAN id {0}")]
    InvalidVid(u16),

    #[error("xid {xid} is a {kind}, expected {expected}")]
    WrongKind {
        xid: u32,
        kind: ProxyKind,
        expected: &'static str,
    },

    #[error("lag {0} is full")]
    LagFull(u32),

    #[error("xid {lower} already belongs to {upper}")]
    AlreadyMember { upper: u32, lower: u32 },

    #[error("xid {lower} is not a member of {upper}")]
    NotMember { upper: u32, lower: u32 },

    #[error("a {lower} cannot join a {upper}")]
    BadMember { upper: ProxyKind, lower: ProxyKind },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("device error: {0}")]
    Device(#[from] io::Error),
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level multiplexer errors.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("mux {0} is already running")]
    AlreadyRunning(String),

    #[error("lower table is full")]
    TooManyLowers,
}

pub type Result<T> = std::result::Result<T, MuxError>;
