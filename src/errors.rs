//! Error types, one variant family per subsystem.
//!
//! Generalizes the teacher's single-code `EspIOError(pub EspError)` newtype
//! into a `thiserror`-derived enum with a nested enum per subsystem. Fallible
//! synchronous APIs return `Result<T, Error>`; faults detected outside of a
//! direct call (a dropped RFCOMM link, a watchdog firing) are carried as an
//! `Option<Error>` on the relevant notification instead of returned.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("syscall failed: {0}")]
    SyscallError(#[from] io::Error),
    #[error("disconnected by user request")]
    UserDisconnect,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bad SCO configuration: {0}")]
    BadScoConfig(String),
    #[error("SCO listening socket already held by another process")]
    ServiceConflict,
    #[error("kernel lacks required support: {0}")]
    NoKernelSupport(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("AG rejected command: {0}")]
    CommandRejected(String),
    #[error("command aborted (queue flushed)")]
    CommandAborted,
    #[error("bad parameter: {0}")]
    BadParameter(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("endpoint duplex capability mismatch")]
    DuplexMismatch,
    #[error("PCM format mismatch between endpoints")]
    FormatMismatch,
    #[error("async start requested on an unclocked endpoint")]
    NoClock,
    #[error("invalid pump configuration: {0}")]
    BadPumpConfig(String),
    #[error("one-shot endpoint data exhausted")]
    DataExhausted,
    #[error("sound card failed: {0}")]
    SoundcardFailed(String),
    #[error("pump watchdog timed out")]
    WatchdogTimeout,
    #[error("endpoint already open")]
    AlreadyOpen,
    #[error("out of memory")]
    NoMem,
}
