//! Module lifecycle management.
//!
//! Modules are separately built executables discovered as directories
//! containing a `module.w` script. The manager spawns them on demand, waits
//! for them to dial back over the lifecycle stream, keeps per-module
//! liveness with lockstep pings, dispatches cross-module calls and tears
//! everything down at session end.
//!
//! At most one module is in the spawning state at a time: a dedicated spawn
//! mutex plus the scratch slot (`next_module_name` and the completion
//! channel) serialise loads.

pub mod local;

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::net::{self, ConnPool};
use crate::proto::{CallRequest, LifecycleMsg, Reply, Request};
use crate::response::Response;

/// The manager's view of a lifecycle stream.
pub trait LifecycleStream: Send {
    fn send(&mut self, msg: &LifecycleMsg) -> Result<()>;
    fn recv(&mut self) -> Result<LifecycleMsg>;
}

impl LifecycleStream for TcpStream {
    fn send(&mut self, msg: &LifecycleMsg) -> Result<()> {
        net::send_msg(self, msg)
    }

    fn recv(&mut self) -> Result<LifecycleMsg> {
        net::recv_msg(self)
    }
}

/// Runs `module.w` in the module directory. `first` is true the first time
/// the module is run in this process, selecting the compile-then-run mode.
pub type RunModuleScript = Arc<dyn Fn(bool, &Path) -> Result<()> + Send + Sync>;

/// Short-circuit for local modules: `Some(result)` when the module is local
/// and the call was handled, `None` otherwise.
pub type LocalModuleFn =
    Arc<dyn Fn(&str, &str, &str, &[u8]) -> Option<Result<Response>> + Send + Sync>;

/// A connected module.
pub struct ModuleInfo {
    pub name: String,
    /// Loopback address of the module's request processor.
    pub server: String,

    // Control requests run in lockstep, one outstanding at a time.
    ctl: Mutex<()>,
    req_tx: flume::Sender<LifecycleMsg>,
    resp_rx: flume::Receiver<Result<()>>,

    conn: Mutex<Option<Arc<ConnPool>>>,
    last_ping: Mutex<Option<Instant>>,
}

impl ModuleInfo {
    /// Pings the module to see if it is still alive.
    pub fn ping(&self) -> Result<()> {
        let _guard = self.ctl.lock();
        self.req_tx
            .send(LifecycleMsg::Ping)
            .map_err(|_| Error::Protocol(format!("module {} is gone", self.name)))?;
        match self.resp_rx.recv() {
            Ok(Ok(())) => {
                *self.last_ping.lock() = Some(Instant::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Protocol(format!("module {} is gone", self.name))),
        }
    }

    pub fn last_ping(&self) -> Option<Instant> {
        *self.last_ping.lock()
    }
}

struct MgrState {
    modules: HashMap<String, Arc<ModuleInfo>>,
    built: HashSet<String>,
    // scratch slot for the one load in flight
    next_module_name: Option<String>,
    conn_tx: Option<flume::Sender<Result<()>>>,
}

/// Deals with the external module lifecycle: create one per process, point
/// it at the lookup directories, and let [`LifecycleManager::send_request`]
/// load modules as they are called.
pub struct LifecycleManager {
    /// Modules are looked up under these directories. Module names use the
    /// `/` separator regardless of platform.
    pub module_lookup_dirs: Vec<PathBuf>,
    pub run_module_script: RunModuleScript,
    pub local_module_fn: LocalModuleFn,

    state: RwLock<MgrState>,
    spawn_lock: Mutex<()>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> LifecycleManager {
        LifecycleManager {
            module_lookup_dirs: Vec::new(),
            run_module_script: Arc::new(|_, _| {
                Err(Error::Config("no module runner configured".into()))
            }),
            local_module_fn: Arc::new(local::call_local_module),
            state: RwLock::new(MgrState {
                modules: HashMap::new(),
                built: HashSet::new(),
                next_module_name: None,
                conn_tx: None,
            }),
            spawn_lock: Mutex::new(()),
        }
    }

    /// Finds the module directory under the lookup dirs. The first
    /// directory containing `module.w` wins.
    pub fn search_module_dir(&self, module: &str) -> Option<PathBuf> {
        for dir in &self.module_lookup_dirs {
            let mut path = dir.clone();
            for part in module.split('/') {
                path.push(part);
            }
            if path.join("module.w").is_file() {
                return Some(path);
            }
        }
        None
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<ModuleInfo>> {
        self.state.read().modules.get(name).cloned()
    }

    /// Handles one lifecycle stream. Called with the connection of a module
    /// that was just spawned; the first message must be `Connect` with the
    /// module's request-processor port. Registers the module, signals the
    /// pending load, then serves ping/term requests until the module goes
    /// away.
    pub fn connect<S: LifecycleStream>(&self, mut stream: S) -> Result<()> {
        let (name, conn_tx) = {
            let st = self.state.read();
            match (&st.next_module_name, &st.conn_tx) {
                (Some(name), Some(tx)) => (name.clone(), tx.clone()),
                _ => return Err(Error::Protocol("unexpected connection".into())),
            }
        };
        debug!("connect is called, waiting for {}", name);

        let msg = match stream.recv() {
            Ok(msg) => msg,
            Err(e) => {
                let _ = conn_tx.send(Err(Error::Protocol(e.to_string())));
                return Err(e);
            }
        };
        let port = match msg {
            LifecycleMsg::Connect { port } => port,
            other => {
                let e = Error::Protocol(format!("expecting connect, got {:?}", other));
                let _ = conn_tx.send(Err(Error::Protocol("expecting connect".into())));
                return Err(e);
            }
        };

        let (req_tx, req_rx) = flume::bounded(0);
        let (resp_tx, resp_rx) = flume::bounded(0);
        let info = Arc::new(ModuleInfo {
            name: name.clone(),
            server: format!("localhost:{}", port),
            ctl: Mutex::new(()),
            req_tx,
            resp_rx,
            conn: Mutex::new(None),
            last_ping: Mutex::new(None),
        });

        {
            let mut st = self.state.write();
            // the module is built now, remember that for the next spawn
            st.built.insert(name.clone());
            if st.modules.contains_key(&name) {
                drop(st);
                let _ = conn_tx.send(Err(Error::DuplicateModule(name.clone())));
                return Err(Error::DuplicateModule(name));
            }
            st.modules.insert(name.clone(), info);
        }
        debug!("connect ok");
        let _ = conn_tx.send(Ok(()));
        debug!("connect complete");

        loop {
            match req_rx.recv() {
                Ok(LifecycleMsg::Ping) => {
                    if let Err(e) = stream.send(&LifecycleMsg::Ping) {
                        let _ = resp_tx.send(Err(Error::Protocol(e.to_string())));
                        self.remove(&name);
                        return Err(e);
                    }
                    match stream.recv() {
                        Ok(LifecycleMsg::Pong) => {
                            let _ = resp_tx.send(Ok(()));
                        }
                        Ok(other) => {
                            let _ = resp_tx.send(Err(Error::Protocol(format!(
                                "expecting pong, got {:?}",
                                other
                            ))));
                            self.remove(&name);
                            return Err(Error::Protocol("expecting pong".into()));
                        }
                        Err(e) => {
                            let _ = resp_tx.send(Err(Error::Protocol(e.to_string())));
                            self.remove(&name);
                            return Err(e);
                        }
                    }
                }
                Ok(LifecycleMsg::Term) => {
                    let _ = stream.send(&LifecycleMsg::Term);
                    return Ok(());
                }
                // only ping and term originate from the manager
                Ok(_) => {}
                Err(_) => return Ok(()),
            }
        }
    }

    fn remove(&self, name: &str) -> Option<Arc<ModuleInfo>> {
        self.state.write().modules.remove(name)
    }

    /// Loads a module if it is not loaded, spawning it and waiting for the
    /// dial-back.
    pub fn load(&self, module: &str) -> Result<Arc<ModuleInfo>> {
        if let Some(mi) = self.get_module(module) {
            return Ok(mi);
        }
        let _spawning = self.spawn_lock.lock();
        if let Some(mi) = self.get_module(module) {
            return Ok(mi);
        }
        debug!("loading {}", module);
        let dir = self
            .search_module_dir(module)
            .ok_or_else(|| Error::ModuleNotFound(module.to_string()))?;
        debug!("module found under {}", dir.display());

        let (conn_tx, conn_rx) = flume::bounded(1);
        let first = {
            let mut st = self.state.write();
            st.next_module_name = Some(module.to_string());
            st.conn_tx = Some(conn_tx.clone());
            !st.built.contains(module)
        };

        let script = self.run_module_script.clone();
        std::thread::spawn(move || {
            if let Err(e) = script(first, &dir) {
                let _ = conn_tx.try_send(Err(e));
            }
        });

        debug!("waiting connect");
        let result = conn_rx.recv();
        {
            let mut st = self.state.write();
            st.next_module_name = None;
            st.conn_tx = None;
        }
        debug!("connection done");
        match result {
            Ok(Ok(())) => self
                .get_module(module)
                .ok_or_else(|| Error::ModuleNotFound(module.to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Protocol("module connect channel closed".into())),
        }
    }

    /// Calls a function in a module and returns the response. Local modules
    /// are tried first; external ones are loaded on demand and reached over
    /// their cached dial-back connection.
    pub fn send_request(
        &self,
        session: &str,
        module: &str,
        func_name: &str,
        data: &[u8],
    ) -> Result<Response> {
        debug!("calling {}.{}", module, func_name);
        if let Some(result) = (self.local_module_fn)(session, module, func_name, data) {
            return result;
        }

        let mi = self.load(module)?;
        let pool = {
            let mut conn = mi.conn.lock();
            match &*conn {
                Some(pool) => pool.clone(),
                None => {
                    debug!("dialing {}", mi.server);
                    let pool = Arc::new(ConnPool::new(mi.server.clone()));
                    *conn = Some(pool.clone());
                    pool
                }
            }
        };
        *mi.last_ping.lock() = Some(Instant::now());

        let reply = pool.call(&Request::Process(CallRequest {
            session: session.to_string(),
            func_name: func_name.to_string(),
            data: data.to_vec(),
        }))?;
        debug!("module {}.{} returned", module, func_name);
        match reply {
            Reply::Call(rsp) => Ok(rsp),
            other => Err(Error::Protocol(format!("unexpected reply: {:?}", other))),
        }
    }

    /// Shuts down all modules. TERM is best-effort; no confirmation is
    /// awaited.
    pub fn close(&self) {
        loop {
            let name = {
                let st = self.state.read();
                st.modules.keys().next().cloned()
            };
            let Some(name) = name else { break };
            debug!("shutting down {}", name);
            if let Some(info) = self.remove(&name) {
                let _ = info.req_tx.send(LifecycleMsg::Term);
            }
        }
    }
}

/// Executes the module script and relays its output to the process log.
pub fn exec_module(name: &str, args: &[&str]) -> Result<()> {
    debug!("exec {} {:?}", name, args);
    let mut child = Command::new(name)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let relay = |reader: Box<dyn std::io::Read + Send>, name: String, error: bool| {
        std::thread::spawn(move || {
            for line in BufReader::new(reader).lines() {
                match line {
                    Ok(line) if error => error!("from {}: {}", name, line),
                    Ok(line) => info!("from {}: {}", name, line),
                    Err(_) => break,
                }
            }
        })
    };
    if let Some(out) = child.stdout.take() {
        relay(Box::new(out), name.to_string(), false);
    }
    if let Some(err) = child.stderr.take() {
        relay(Box::new(err), name.to_string(), true);
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(Error::Protocol(format!("{} exited with {}", name, status)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn search_finds_first_match() {
        let dir = tempdir().unwrap();
        let m = dir.path().join("foo/bar");
        std::fs::create_dir_all(&m).unwrap();
        std::fs::write(m.join("module.w"), "#!/bin/sh\n").unwrap();

        let mut mgr = LifecycleManager::new();
        mgr.module_lookup_dirs = vec![dir.path().to_path_buf()];
        assert_eq!(mgr.search_module_dir("foo/bar"), Some(m));
        assert_eq!(mgr.search_module_dir("foo/quux"), None);
    }

    #[test]
    fn connect_without_pending_load_is_rejected() {
        struct NoStream;
        impl LifecycleStream for NoStream {
            fn send(&mut self, _: &LifecycleMsg) -> Result<()> {
                unreachable!()
            }
            fn recv(&mut self) -> Result<LifecycleMsg> {
                unreachable!()
            }
        }
        let mgr = LifecycleManager::new();
        assert!(mgr.connect(NoStream).is_err());
    }
}
