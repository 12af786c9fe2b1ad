//! Error types of the engine.
//!
//! Two disjoint families exist. [`Error`] is for infrastructure failures:
//! transport faults, process spawn failures, I/O errors on orchestrator-side
//! state. [`CmdError`] means the operation reached the host and failed
//! there; it travels inside otherwise successful responses and is never
//! propagated with `?`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure error. Propagated as an RPC error with no response body.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("invalid session: {0}")]
    InvalidSession(String),

    #[error("invalid host: {0}")]
    InvalidHost(String),

    #[error("inventory not found: {0}")]
    InventoryNotFound(String),

    #[error("cannot find module: {0}")]
    ModuleNotFound(String),

    #[error("duplicate module {0}")]
    DuplicateModule(String),

    #[error("invalid state: {0}")]
    Protocol(String),

    #[error("cyclic hosts")]
    CyclicHosts,

    #[error("timeout while waiting for {0} to become available")]
    WaitTimeout(String),

    /// An error relayed from the peer over the wire.
    #[error("{0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "ssh")]
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
}

/// A structured command failure, attributable to a host. Distinct from the
/// transport errors carried by [`Error`]: a non-zero exit status or a failed
/// remote tool invocation ends up here, a broken connection does not.
///
/// When a code path produces both a `CmdError` and an infrastructure error,
/// the `CmdError` is discarded and the infrastructure error wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{host}: {msg}")]
pub struct CmdError {
    pub host: String,
    pub msg: String,
}

impl CmdError {
    pub fn new(host: impl Into<String>, msg: impl Into<String>) -> CmdError {
        CmdError {
            host: host.into(),
            msg: msg.into(),
        }
    }

    /// Wraps a plain error as a command error on the given host. Returns
    /// `None` when there is nothing to wrap.
    pub fn from_err<E: std::fmt::Display>(host: &str, err: Option<E>) -> Option<CmdError> {
        err.map(|e| CmdError::new(host, e.to_string()))
    }
}

/// Shorthand used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
