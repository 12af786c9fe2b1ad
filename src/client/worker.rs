//! The request processor serving function calls inside a module.

use std::net::{TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::net;
use crate::proto::{CallRequest, Reply, Request};
use crate::response::Response;

use super::functions::{Functions, Services};
use super::session::Session;
use super::Runtime;

/// Serves `Process` requests on the module's loopback listener.
pub struct WorkServer {
    rt: Arc<Runtime>,
    functions: Functions,
    services: Services,
}

impl WorkServer {
    pub fn new(rt: Arc<Runtime>, functions: Functions, services: Services) -> WorkServer {
        WorkServer {
            rt,
            functions,
            services,
        }
    }

    /// Accept loop; one thread per connection. Returns when the listener
    /// closes.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = self.clone();
                    let _ = std::thread::Builder::new()
                        .name("wm-process".to_string())
                        .spawn(move || server.handle_conn(stream));
                }
                Err(e) => {
                    debug!("worker listener closed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_conn(&self, mut stream: TcpStream) {
        loop {
            let req: Request = match net::recv_msg(&mut stream) {
                Ok(req) => req,
                Err(_) => return,
            };
            let reply = match req {
                Request::Process(call) => Reply::Call(self.process(call)),
                other => Reply::Error {
                    msg: format!("not a process request: {:?}", other),
                },
            };
            if net::send_msg(&mut stream, &reply).is_err() {
                return;
            }
        }
    }

    /// Runs one function call. A panic in user code is caught here and
    /// reported as a failed response; the module process survives.
    pub fn process(&self, req: CallRequest) -> Response {
        debug!("running process for {}", req.func_name);
        let session = Session::new(self.rt.clone(), req.session.clone());

        let func = self
            .functions
            .map
            .get(&req.func_name)
            .or_else(|| self.services.lookup(&req.func_name));
        let Some(func) = func else {
            return Response::fail(&req.func_name, format!("Not found: {}", req.func_name));
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| func(&session, &req.data)));
        let mut rsp = match outcome {
            Ok(Ok(data)) => {
                let mut r = Response::ok(&req.func_name);
                r.data = data;
                r
            }
            Ok(Err(e)) => Response::fail(&req.func_name, e.to_string()),
            Err(panic) => {
                let msg = panic_message(panic);
                self.rt
                    .log(&req.session, "unknown", &format!("Panic: {}", msg));
                Response::fail(&req.func_name, format!("Panic: {}", msg))
            }
        };
        rsp.modified = session.modified();
        rsp
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    }
}
