//! Wire messages exchanged between the orchestrator and module processes.
//!
//! The orchestrator exposes four services on a single listener: lifecycle,
//! inventory, remote and, on the module side, the request processor. All of
//! them share the [`Request`]/[`Reply`] envelopes; a connection whose first
//! message is [`Request::Connect`] turns into a lifecycle stream carrying
//! [`LifecycleMsg`] frames instead.

use serde::{Deserialize, Serialize};

use crate::error::CmdError;
use crate::host::{FileDesc, FileInfo, FileOwner, HostInfo};
use crate::inventory::Selector;
use crate::response::Response;

/// Control messages on the lifecycle stream.
///
/// The only valid sequences are: client sends `Connect` first; server sends
/// `Ping`, client answers `Pong`; server sends `Term`. Anything else
/// terminates the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleMsg {
    Connect { port: u16 },
    Ping,
    Pong,
    Term,
}

/// A function invocation envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRequest {
    pub session: String,
    pub func_name: String,
    pub data: Vec<u8>,
}

/// Content source for a remote write: literal bytes, or a template rendered
/// against a JSON data tree on the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WriteSource {
    Data(Vec<u8>),
    Template { template: String, data: Vec<u8> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// First message of a lifecycle stream; never answered with a [`Reply`].
    Connect { port: u16 },

    // lifecycle service
    LoadModule { module: String },
    ModuleCall { module: String, req: CallRequest },
    Log { session: String, host: String, msg: String },
    Print { session: String, msg: String },
    GetArgs { session: String },
    GetCfg { session: String, host: String, path: String },

    // inventory service
    InvSelect { session: String, from: String, selectors: Vec<Selector> },
    InvUnion { session: String, sources: Vec<String> },
    InvMake { session: String, hosts: Vec<String> },
    InvAdd { session: String, inv: String, hosts: Vec<String> },
    InvGetHostIds { session: String, inv: String },
    InvGetHostInfo { session: String, hosts: Vec<String> },
    InvGetHosts { session: String, inv: String },
    InvRelease { session: String, inv: String },

    // remote service
    Command { session: String, host: String, command: String },
    ReadFile { session: String, host: String, file: String },
    WriteFile {
        session: String,
        host: String,
        name: String,
        perms: u32,
        source: WriteSource,
        only_if_different: bool,
    },
    CopyFile {
        session: String,
        from_host: String,
        from_path: String,
        to_host: String,
        to_path: String,
        only_if_different: bool,
    },
    WaitHost { session: String, host: String, timeout_ms: u64 },
    GetFileInfo { session: String, host: String, path: String },
    Mkdir { session: String, host: String, path: String },
    Chmod { session: String, host: String, path: String, mode: u32 },
    Chown { session: String, host: String, path: String, user: String, group: String },
    Ensure { session: String, host: String, path: String, desc: FileDesc },

    // request processor, served by the module side
    Process(CallRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// Infrastructure error; the wire shape of an `Err` return.
    Error { msg: String },

    Empty,
    Loaded { address: String },
    Call(Response),
    Args(Vec<String>),
    Cfg { data: Option<Vec<u8>> },

    InvId(String),
    HostIds(Vec<String>),
    HostInfos(Vec<HostInfo>),

    CommandOut {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: i32,
    },
    ReadOut {
        info: Option<FileInfo>,
        data: Vec<u8>,
        error: Option<CmdError>,
    },
    WriteOut {
        modified: bool,
        error: Option<CmdError>,
    },
    CopyOut {
        changed: bool,
        error: Option<CmdError>,
    },
    FileInfoOut {
        owner: FileOwner,
        info: Option<FileInfo>,
        error: Option<CmdError>,
    },
    OsOut { error: Option<CmdError> },
    EnsureOut {
        changed: bool,
        error: Option<CmdError>,
    },
}
