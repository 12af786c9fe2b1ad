//! Sessions.
//!
//! A session is the process-local context for one top-level run: it owns
//! the inventory, the module manager, the logger factory, the configuration
//! tree and the command-line arguments. Sessions live in a process-wide
//! registry keyed by their short IDs so RPC handlers can find them.

pub mod ext;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::host::{Host, LOCALHOST, LOCALHOST_ID};
use crate::inventory::InvServer;
use crate::logging::{Logger, Logging};
use crate::module::LifecycleManager;

use ext::ConfigExpander;

static SESSIONS: Lazy<RwLock<HashMap<String, Arc<Session>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static SESSION_CTR: AtomicU64 = AtomicU64::new(0);

/// Everything related to one running session.
pub struct Session {
    id: String,
    inv: RwLock<Option<Arc<InvServer>>>,
    modules: RwLock<Option<Arc<LifecycleManager>>>,
    log: RwLock<Logging>,
    log_stdout: AtomicBool,
    config: RwLock<Option<Value>>,
    args: RwLock<Vec<String>>,
    expanders: RwLock<Vec<Arc<dyn ConfigExpander>>>,
    extensions: RwLock<HashMap<String, Arc<dyn std::any::Any + Send + Sync>>>,
}

/// Creates a new session and registers it.
pub fn new_session() -> Arc<Session> {
    let id = format!("s-{}", SESSION_CTR.fetch_add(1, Ordering::SeqCst) + 1);
    let session = Arc::new(Session {
        id: id.clone(),
        inv: RwLock::new(None),
        modules: RwLock::new(None),
        log: RwLock::new(Logging::default()),
        log_stdout: AtomicBool::new(false),
        config: RwLock::new(None),
        args: RwLock::new(Vec::new()),
        expanders: RwLock::new(Vec::new()),
        extensions: RwLock::new(HashMap::new()),
    });
    SESSIONS.write().insert(id, session.clone());
    session
}

/// Returns a session by ID.
pub fn get_session(id: &str) -> Option<Arc<Session>> {
    SESSIONS.read().get(id).cloned()
}

/// Resolves the session and the host in one step. The reserved host ID
/// `localhost` resolves without an inventory lookup.
pub fn get_host_and_session(session_id: &str, host_id: &str) -> Result<(Arc<Session>, Arc<Host>)> {
    let session =
        get_session(session_id).ok_or_else(|| Error::InvalidSession(session_id.to_string()))?;
    if host_id == LOCALHOST_ID {
        return Ok((session, LOCALHOST.clone()));
    }
    let host = session.get_host(host_id)?;
    Ok((session, host))
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_inv(&self, inv: Arc<InvServer>) {
        *self.inv.write() = Some(inv);
    }

    /// The inventory. Set once at session startup.
    pub fn inv(&self) -> Arc<InvServer> {
        self.inv.read().clone().expect("inventory is set at startup")
    }

    pub fn set_modules(&self, modules: Arc<LifecycleManager>) {
        *self.modules.write() = Some(modules);
    }

    pub fn modules(&self) -> Arc<LifecycleManager> {
        self.modules
            .read()
            .clone()
            .expect("module manager is set at startup")
    }

    pub fn set_log(&self, log: Logging) {
        *self.log.write() = log;
    }

    pub fn set_log_stdout(&self, stdout: bool) {
        self.log_stdout.store(stdout, Ordering::Relaxed);
    }

    pub fn set_config(&self, config: Option<Value>) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> Option<Value> {
        self.config.read().clone()
    }

    pub fn set_args(&self, args: Vec<String>) {
        *self.args.write() = args;
    }

    pub fn args(&self) -> Vec<String> {
        self.args.read().clone()
    }

    /// Returns a logger for the host.
    pub fn get_logger(&self, host: &Host) -> Logger {
        self.log
            .read()
            .new_logger(host.id(), self.log_stdout.load(Ordering::Relaxed))
    }

    /// Returns a host from the session.
    pub fn get_host(&self, host_id: &str) -> Result<Arc<Host>> {
        if host_id == LOCALHOST_ID {
            return Ok(LOCALHOST.clone());
        }
        let mut hosts = self.inv().get_host(&[host_id.to_string()])?;
        hosts
            .pop()
            .ok_or_else(|| Error::InvalidHost(host_id.to_string()))
    }

    /// Looks up a configuration item by JSON pointer: the host-scoped tree
    /// first when a host is given, then the session-global tree. A missing
    /// path is `None`, never an error. The result is passed through the
    /// registered config expanders.
    pub fn get_cfg(&self, host_id: &str, path: &str) -> Option<Value> {
        let mut found: Option<Value> = None;
        if !host_id.is_empty() {
            if let Ok(host) = self.get_host(host_id) {
                if let Some(cfg) = &host.configuration {
                    found = cfg.pointer(path).cloned();
                }
            }
        }
        if found.is_none() {
            found = self
                .config
                .read()
                .as_ref()
                .and_then(|cfg| cfg.pointer(path))
                .cloned();
        }
        let value = found?;
        Some(self.expand(value))
    }

    fn expand(&self, mut value: Value) -> Value {
        for expander in self.expanders.read().iter() {
            value = expander.expand_config(self, value);
        }
        value
    }

    /// Registers a config expander applied to every `get_cfg` result.
    pub fn register_expander(&self, expander: Arc<dyn ConfigExpander>) {
        self.expanders.write().push(expander);
    }

    /// Stores an extension under a name.
    pub fn register_extension(
        &self,
        name: impl Into<String>,
        ext: Arc<dyn std::any::Any + Send + Sync>,
    ) {
        self.extensions.write().insert(name.into(), ext);
    }

    pub fn extension(&self, name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.extensions.read().get(name).cloned()
    }

    /// Unregisters the session and tears down the modules it loaded.
    pub fn close(&self) {
        if let Some(modules) = self.modules.read().clone() {
            modules.close();
        }
        SESSIONS.write().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_process_unique() {
        let a = new_session();
        let b = new_session();
        assert_ne!(a.id(), b.id());
        a.close();
        b.close();
    }

    #[test]
    fn registry_lookup_and_close() {
        let s = new_session();
        let id = s.id().to_string();
        assert!(get_session(&id).is_some());
        s.close();
        assert!(get_session(&id).is_none());
    }

    #[test]
    fn cfg_pointer_lookup() {
        let s = new_session();
        s.set_config(Some(json!({"db": {"port": 5432}})));
        assert_eq!(s.get_cfg("", "/db/port"), Some(json!(5432)));
        assert_eq!(s.get_cfg("", "/db/missing"), None);
        s.close();
    }

    #[test]
    fn value_from_expansion() {
        let s = new_session();
        s.set_config(Some(json!({
            "common": {"user": "svc"},
            "db": {"owner": {"valueFrom": "/common/user"}}
        })));
        s.register_expander(Arc::new(ext::ValueFromExpander));
        assert_eq!(s.get_cfg("", "/db/owner"), Some(json!("svc")));
        s.close();
    }
}
