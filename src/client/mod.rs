//! The runtime embedded in every module.
//!
//! A module executable builds its [`Functions`]/[`Services`] tables and
//! hands control to [`run`]. The runtime listens on a loopback port for
//! function-call requests from the orchestrator, dials the orchestrator
//! back for everything the module needs (inventory, remote operations,
//! cross-module calls), and keeps the lifecycle stream alive until the
//! orchestrator terminates it.

pub mod functions;
pub mod session;
pub mod worker;

pub use functions::{export, FuncError, Functions, Service, Services};
pub use session::{Host, Session};
pub use worker::WorkServer;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use clap::Parser;

use crate::error::{CmdError, Error, Result};
use crate::host::{FileDesc, FileInfo, FileOwner, HostInfo};
use crate::inventory::Selector;
use crate::net::{self, ConnPool};
use crate::proto::{CallRequest, LifecycleMsg, Reply, Request, WriteSource};
use crate::response::Response;

/// Output of a command run on a host.
#[derive(Debug, Clone, Default)]
pub struct CmdResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CmdResponse {
    /// The stdout as text.
    pub fn out(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// The stderr as text.
    pub fn err(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout followed by stderr.
    pub fn all_out(&self) -> String {
        let mut out = self.out();
        out.push_str(&self.err());
        out
    }
}

fn unexpected(reply: Reply) -> Error {
    Error::Protocol(format!("unexpected reply: {:?}", reply))
}

/// The client runtime: the module's connection to the orchestrator.
pub struct Runtime {
    /// The loopback port this module's request processor listens on.
    pub port: u16,
    server_addr: String,
    pool: ConnPool,
}

impl Runtime {
    pub fn new(server: impl Into<String>, port: u16) -> Runtime {
        let server_addr = server.into();
        Runtime {
            port,
            pool: ConnPool::new(server_addr.clone()),
            server_addr,
        }
    }

    /// Returns a session handle bound to this runtime.
    pub fn session(self: &Arc<Self>, id: impl Into<String>) -> Session {
        Session::new(self.clone(), id)
    }

    /// Writes a log message for the host.
    pub fn log(&self, session: &str, host_id: &str, msg: &str) {
        let _ = self.pool.call(&Request::Log {
            session: session.to_string(),
            host: host_id.to_string(),
            msg: msg.to_string(),
        });
    }

    /// Prints a message on the orchestrator's stdout.
    pub fn print(&self, session: &str, msg: &str) {
        let _ = self.pool.call(&Request::Print {
            session: session.to_string(),
            msg: msg.to_string(),
        });
    }

    /// The arguments passed to the top-level run.
    pub fn get_args(&self, session: &str) -> Vec<String> {
        match self.pool.call(&Request::GetArgs {
            session: session.to_string(),
        }) {
            Ok(Reply::Args(args)) => args,
            _ => Vec::new(),
        }
    }

    /// Calls a function in another module through the orchestrator.
    pub fn call(&self, session: &str, module: &str, func: &str, data: Vec<u8>) -> Result<Response> {
        match self.pool.call(&Request::ModuleCall {
            module: module.to_string(),
            req: CallRequest {
                session: session.to_string(),
                func_name: func.to_string(),
                data,
            },
        })? {
            Reply::Call(rsp) => Ok(rsp),
            other => Err(unexpected(other)),
        }
    }

    /// Retrieves a configuration item as JSON; host config first when a
    /// host is given.
    pub fn get_cfg_json(&self, session: &str, host_id: &str, path: &str) -> Result<Option<Vec<u8>>> {
        match self.pool.call(&Request::GetCfg {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
        })? {
            Reply::Cfg { data } => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    /// Loads a module and returns its request-processor address.
    pub fn load_module(&self, name: &str) -> Result<String> {
        match self.pool.call(&Request::LoadModule {
            module: name.to_string(),
        })? {
            Reply::Loaded { address } => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    /// Loads a module and returns a connection pool to it for direct
    /// calls. Session IDs ride inside every request envelope.
    pub fn connect_module(&self, name: &str) -> Result<ConnPool> {
        Ok(ConnPool::new(self.load_module(name)?))
    }

    // ---- inventory ----

    pub fn inv_select(&self, session: &str, from: &str, selectors: Vec<Selector>) -> Result<String> {
        match self.pool.call(&Request::InvSelect {
            session: session.to_string(),
            from: from.to_string(),
            selectors,
        })? {
            Reply::InvId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_union(&self, session: &str, sources: Vec<String>) -> Result<String> {
        match self.pool.call(&Request::InvUnion {
            session: session.to_string(),
            sources,
        })? {
            Reply::InvId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_make(&self, session: &str, hosts: Vec<String>) -> Result<String> {
        match self.pool.call(&Request::InvMake {
            session: session.to_string(),
            hosts,
        })? {
            Reply::InvId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_add(&self, session: &str, inv: &str, hosts: Vec<String>) -> Result<String> {
        match self.pool.call(&Request::InvAdd {
            session: session.to_string(),
            inv: inv.to_string(),
            hosts,
        })? {
            Reply::InvId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_get_host_ids(&self, session: &str, inv: &str) -> Result<Vec<String>> {
        match self.pool.call(&Request::InvGetHostIds {
            session: session.to_string(),
            inv: inv.to_string(),
        })? {
            Reply::HostIds(ids) => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_get_host_info(&self, session: &str, hosts: Vec<String>) -> Result<Vec<HostInfo>> {
        match self.pool.call(&Request::InvGetHostInfo {
            session: session.to_string(),
            hosts,
        })? {
            Reply::HostInfos(infos) => Ok(infos),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_get_hosts(&self, session: &str, inv: &str) -> Result<Vec<HostInfo>> {
        match self.pool.call(&Request::InvGetHosts {
            session: session.to_string(),
            inv: inv.to_string(),
        })? {
            Reply::HostInfos(infos) => Ok(infos),
            other => Err(unexpected(other)),
        }
    }

    pub fn inv_release(&self, session: &str, inv: &str) {
        let _ = self.pool.call(&Request::InvRelease {
            session: session.to_string(),
            inv: inv.to_string(),
        });
    }

    // ---- remote ----

    pub fn command(&self, session: &str, host_id: &str, cmd: &str) -> Result<CmdResponse> {
        match self.pool.call(&Request::Command {
            session: session.to_string(),
            host: host_id.to_string(),
            command: cmd.to_string(),
        })? {
            Reply::CommandOut {
                stdout,
                stderr,
                exit_code,
            } => Ok(CmdResponse {
                stdout,
                stderr,
                exit_code,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn read_file(
        &self,
        session: &str,
        host_id: &str,
        file: &str,
    ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)> {
        match self.pool.call(&Request::ReadFile {
            session: session.to_string(),
            host: host_id.to_string(),
            file: file.to_string(),
        })? {
            Reply::ReadOut { info, data, error } => {
                let data = info.as_ref().map(|_| data);
                Ok((info, data, error))
            }
            other => Err(unexpected(other)),
        }
    }

    pub fn write_file(
        &self,
        session: &str,
        host_id: &str,
        file: &str,
        perms: u32,
        source: WriteSource,
        only_if_different: bool,
    ) -> Result<(bool, Option<CmdError>)> {
        match self.pool.call(&Request::WriteFile {
            session: session.to_string(),
            host: host_id.to_string(),
            name: file.to_string(),
            perms,
            source,
            only_if_different,
        })? {
            Reply::WriteOut { modified, error } => Ok((modified, error)),
            other => Err(unexpected(other)),
        }
    }

    pub fn copy_file(
        &self,
        session: &str,
        from_host: &str,
        from_path: &str,
        to_host: &str,
        to_path: &str,
        only_if_different: bool,
    ) -> Result<(bool, Option<CmdError>)> {
        match self.pool.call(&Request::CopyFile {
            session: session.to_string(),
            from_host: from_host.to_string(),
            from_path: from_path.to_string(),
            to_host: to_host.to_string(),
            to_path: to_path.to_string(),
            only_if_different,
        })? {
            Reply::CopyOut { changed, error } => Ok((changed, error)),
            other => Err(unexpected(other)),
        }
    }

    pub fn wait_host(&self, session: &str, host_id: &str, timeout_ms: u64) -> Result<()> {
        match self.pool.call(&Request::WaitHost {
            session: session.to_string(),
            host: host_id.to_string(),
            timeout_ms,
        })? {
            Reply::Empty => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_file_info(
        &self,
        session: &str,
        host_id: &str,
        path: &str,
    ) -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)> {
        match self.pool.call(&Request::GetFileInfo {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
        })? {
            Reply::FileInfoOut { owner, info, error } => Ok((owner, info, error)),
            other => Err(unexpected(other)),
        }
    }

    pub fn mkdir(&self, session: &str, host_id: &str, path: &str) -> Result<Option<CmdError>> {
        match self.pool.call(&Request::Mkdir {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
        })? {
            Reply::OsOut { error } => Ok(error),
            other => Err(unexpected(other)),
        }
    }

    pub fn chmod(
        &self,
        session: &str,
        host_id: &str,
        path: &str,
        mode: u32,
    ) -> Result<Option<CmdError>> {
        match self.pool.call(&Request::Chmod {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
            mode,
        })? {
            Reply::OsOut { error } => Ok(error),
            other => Err(unexpected(other)),
        }
    }

    pub fn chown(
        &self,
        session: &str,
        host_id: &str,
        path: &str,
        user: &str,
        group: &str,
    ) -> Result<Option<CmdError>> {
        match self.pool.call(&Request::Chown {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
            user: user.to_string(),
            group: group.to_string(),
        })? {
            Reply::OsOut { error } => Ok(error),
            other => Err(unexpected(other)),
        }
    }

    pub fn ensure(
        &self,
        session: &str,
        host_id: &str,
        path: &str,
        desc: FileDesc,
    ) -> Result<(bool, Option<CmdError>)> {
        match self.pool.call(&Request::Ensure {
            session: session.to_string(),
            host: host_id.to_string(),
            path: path.to_string(),
            desc,
        })? {
            Reply::EnsureOut { changed, error } => Ok((changed, error)),
            other => Err(unexpected(other)),
        }
    }

    /// Connects the lifecycle stream, answers pings, and returns when the
    /// orchestrator sends the terminate message. Any stream error returns
    /// immediately.
    pub fn run_lifecycle(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.server_addr)?;
        net::send_msg(&mut stream, &Request::Connect { port: self.port })?;
        loop {
            let msg: LifecycleMsg = net::recv_msg(&mut stream)?;
            match msg {
                LifecycleMsg::Ping => {
                    net::send_msg(&mut stream, &LifecycleMsg::Pong)?;
                }
                LifecycleMsg::Term => return Ok(()),
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected lifecycle message: {:?}",
                        other
                    )))
                }
            }
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "module")]
struct ModuleArgs {
    /// Log level, `info` or `debug`.
    #[clap(long, default_value = "info")]
    log: String,

    /// The orchestrator address to dial back.
    server: String,
}

/// Creates the runtime and runs the module until the orchestrator
/// terminates it. `args` is the argv after the program name.
pub fn run(args: &[String], functions: Functions, services: Services) -> Result<()> {
    let opts = ModuleArgs::parse_from(
        std::iter::once("module".to_string()).chain(args.iter().cloned()),
    );
    let _ = env_logger::Builder::new()
        .parse_filters(&opts.log)
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();

    let rt = Arc::new(Runtime::new(opts.server, port));
    let mut all = functions::take_registered();
    all.merge(functions);

    let server = Arc::new(worker::WorkServer::new(rt.clone(), all, services));
    std::thread::Builder::new()
        .name("wm-worker".to_string())
        .spawn({
            let server = server.clone();
            move || server.serve(listener)
        })?;

    rt.run_lifecycle()
}
