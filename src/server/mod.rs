//! The orchestrator's RPC server.
//!
//! One TCP listener carries all services. Each connection is served by its
//! own thread: either it is a lifecycle stream (first frame `Connect`),
//! which is handed over to the module manager for its lifetime, or it is a
//! request/reply connection whose frames are dispatched to the lifecycle,
//! inventory and remote services.

pub mod remote;

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::module::{LifecycleManager, LifecycleStream};
use crate::net;
use crate::proto::{LifecycleMsg, Reply, Request};
use crate::session::{self, get_host_and_session, get_session};

/// Serves connections on the listener until the listener is closed.
/// Spawns one thread per connection.
pub fn serve(listener: TcpListener, manager: Arc<LifecycleManager>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let manager = manager.clone();
                if let Err(e) = std::thread::Builder::new()
                    .name("wm-conn".to_string())
                    .spawn(move || handle_conn(manager, stream))
                {
                    error!("cannot spawn connection handler: {}", e);
                }
            }
            Err(e) => {
                debug!("listener closed: {}", e);
                return;
            }
        }
    }
}

/// Spawns the accept loop in the background.
pub fn spawn(listener: TcpListener, manager: Arc<LifecycleManager>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("wm-accept".to_string())
        .spawn(move || serve(listener, manager))
        .expect("cannot spawn accept loop")
}

/// A lifecycle stream whose first message was already consumed while
/// deciding the connection kind.
struct HandedOverStream {
    first: Option<LifecycleMsg>,
    stream: TcpStream,
}

impl LifecycleStream for HandedOverStream {
    fn send(&mut self, msg: &LifecycleMsg) -> Result<()> {
        net::send_msg(&mut self.stream, msg)
    }

    fn recv(&mut self) -> Result<LifecycleMsg> {
        if let Some(msg) = self.first.take() {
            return Ok(msg);
        }
        net::recv_msg(&mut self.stream)
    }
}

fn handle_conn(manager: Arc<LifecycleManager>, mut stream: TcpStream) {
    loop {
        let req: Request = match net::recv_msg(&mut stream) {
            Ok(req) => req,
            // EOF: the peer is done with this connection
            Err(_) => return,
        };
        if let Request::Connect { port } = req {
            let handed = HandedOverStream {
                first: Some(LifecycleMsg::Connect { port }),
                stream,
            };
            if let Err(e) = manager.connect(handed) {
                debug!("lifecycle stream ended: {}", e);
            }
            return;
        }
        let reply = match dispatch(&manager, req) {
            Ok(reply) => reply,
            Err(e) => Reply::Error { msg: e.to_string() },
        };
        if net::send_msg(&mut stream, &reply).is_err() {
            return;
        }
    }
}

fn dispatch(manager: &Arc<LifecycleManager>, req: Request) -> Result<Reply> {
    match req {
        Request::Connect { .. } => unreachable!("handled by the connection loop"),

        Request::LoadModule { module } => {
            let mi = manager.load(&module)?;
            Ok(Reply::Loaded {
                address: mi.server.clone(),
            })
        }
        Request::ModuleCall { module, req } => {
            let rsp = manager.send_request(&req.session, &module, &req.func_name, &req.data)?;
            Ok(Reply::Call(rsp))
        }
        Request::Log { session, host, msg } => {
            let (session, host) = get_host_and_session(&session, &host)?;
            session.get_logger(&host).print(&msg);
            Ok(Reply::Empty)
        }
        Request::Print { session: _, msg } => {
            print!("{}", msg);
            Ok(Reply::Empty)
        }
        Request::GetArgs { session } => {
            let session =
                get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::Args(session.args()))
        }
        Request::GetCfg {
            session,
            host,
            path,
        } => {
            debug!("get cfg {}", path);
            let session =
                get_session(&session).ok_or(Error::InvalidSession(session))?;
            let data = match session.get_cfg(&host, &path) {
                Some(value) => Some(serde_json::to_vec(&value)?),
                None => None,
            };
            Ok(Reply::Cfg { data })
        }

        Request::InvSelect {
            session,
            from,
            selectors,
        } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::InvId(session.inv().select(&from, &selectors)?))
        }
        Request::InvUnion { session, sources } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::InvId(session.inv().union(&sources)?))
        }
        Request::InvMake { session, hosts } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::InvId(session.inv().make(&hosts)?))
        }
        Request::InvAdd {
            session,
            inv,
            hosts,
        } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::InvId(session.inv().add(&inv, &hosts)?))
        }
        Request::InvGetHostIds { session, inv } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::HostIds(session.inv().get_host_ids(&inv)?))
        }
        Request::InvGetHostInfo { session, hosts } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            Ok(Reply::HostInfos(session.inv().get_host_info(&hosts)?))
        }
        Request::InvGetHosts { session, inv } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            let ids = session.inv().get_host_ids(&inv)?;
            Ok(Reply::HostInfos(session.inv().get_host_info(&ids)?))
        }
        Request::InvRelease { session, inv } => {
            let session = session::get_session(&session).ok_or(Error::InvalidSession(session))?;
            session.inv().release(&inv);
            Ok(Reply::Empty)
        }

        Request::Command {
            session,
            host,
            command,
        } => remote::command(&session, &host, &command),
        Request::ReadFile {
            session,
            host,
            file,
        } => remote::read_file(&session, &host, &file),
        Request::WriteFile {
            session,
            host,
            name,
            perms,
            source,
            only_if_different,
        } => remote::write_file(&session, &host, &name, perms, source, only_if_different),
        Request::CopyFile {
            session,
            from_host,
            from_path,
            to_host,
            to_path,
            only_if_different,
        } => remote::copy_file(
            &session,
            &from_host,
            &from_path,
            &to_host,
            &to_path,
            only_if_different,
        ),
        Request::WaitHost {
            session,
            host,
            timeout_ms,
        } => remote::wait_host(&session, &host, timeout_ms),
        Request::GetFileInfo {
            session,
            host,
            path,
        } => remote::get_file_info(&session, &host, &path),
        Request::Mkdir {
            session,
            host,
            path,
        } => remote::mkdir(&session, &host, &path),
        Request::Chmod {
            session,
            host,
            path,
            mode,
        } => remote::chmod(&session, &host, &path, mode),
        Request::Chown {
            session,
            host,
            path,
            user,
            group,
        } => remote::chown(&session, &host, &path, &user, &group),
        Request::Ensure {
            session,
            host,
            path,
            desc,
        } => remote::ensure(&session, &host, &path, &desc),

        Request::Process(_) => Err(Error::Protocol(
            "process requests are served by modules".into(),
        )),
    }
}
