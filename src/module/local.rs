//! Statically linked modules.
//!
//! A local module lives inside the orchestrator binary and is consulted
//! before any external module with the same name would be spawned.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::response::Response;
use crate::session::{self, Session};

/// Interface implemented by all local modules.
pub trait Module: Send + Sync {
    /// Calls a module function.
    fn call(&self, session: &Arc<Session>, func_name: &str, data: &[u8]) -> Result<Response>;
    /// Short help about the module.
    fn describe(&self) -> String;
    /// Long help about the module.
    fn help(&self) -> String;
}

static LOCAL_MODULES: Lazy<RwLock<HashMap<String, Arc<dyn Module>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a local module.
pub fn register_module(name: impl Into<String>, module: Arc<dyn Module>) {
    LOCAL_MODULES.write().insert(name.into(), module);
}

/// Returns the registered module names with their short descriptions.
pub fn describe_modules() -> Vec<(String, String)> {
    LOCAL_MODULES
        .read()
        .iter()
        .map(|(name, m)| (name.clone(), m.describe()))
        .collect()
}

pub fn get_module(name: &str) -> Option<Arc<dyn Module>> {
    LOCAL_MODULES.read().get(name).cloned()
}

/// Calls a local module if one is registered under the name. `None` means
/// the module is not local and should be dispatched externally.
pub fn call_local_module(
    session: &str,
    module: &str,
    func_name: &str,
    data: &[u8],
) -> Option<Result<Response>> {
    let m = get_module(module)?;
    debug!("call local module: {}.{}", module, func_name);
    let s = match session::get_session(session) {
        Some(s) => s,
        None => return Some(Err(Error::InvalidSession(session.to_string()))),
    };
    Some(m.call(&s, func_name, data))
}

type LocalFunc = Box<dyn Fn(&Arc<Session>, &[u8]) -> Result<Response> + Send + Sync>;

/// Function-map module: an explicit dispatch table from function name to a
/// typed handler. Parameters arrive as JSON and are decoded into the
/// handler's parameter type.
pub struct Dispatcher {
    pub name: String,
    describe: String,
    help: String,
    funcs: HashMap<String, LocalFunc>,
}

impl Dispatcher {
    pub fn new(name: impl Into<String>) -> Dispatcher {
        Dispatcher {
            name: name.into(),
            describe: String::new(),
            help: String::new(),
            funcs: HashMap::new(),
        }
    }

    pub fn describe_with(mut self, short: impl Into<String>, long: impl Into<String>) -> Self {
        self.describe = short.into();
        self.help = long.into();
        self
    }

    /// Adds a function. An empty payload decodes to the parameter type's
    /// default.
    pub fn add<In, F>(mut self, name: &str, f: F) -> Self
    where
        In: DeserializeOwned + Default,
        F: Fn(&Arc<Session>, In) -> Result<Response> + Send + Sync + 'static,
    {
        let func_name = name.to_string();
        self.funcs.insert(
            name.to_string(),
            Box::new(move |session, data| {
                let params: In = if data.is_empty() {
                    In::default()
                } else {
                    serde_json::from_slice(data)?
                };
                let mut rsp = f(session, params)?;
                rsp.func_name = func_name.clone();
                Ok(rsp)
            }),
        );
        self
    }
}

impl Module for Dispatcher {
    fn call(&self, session: &Arc<Session>, func_name: &str, data: &[u8]) -> Result<Response> {
        debug!("local dispatcher for {}", func_name);
        let f = self.funcs.get(func_name).ok_or_else(|| {
            Error::Protocol(format!("{}: not found: {}", self.name, func_name))
        })?;
        f(session, data)
    }

    fn describe(&self) -> String {
        self.describe.clone()
    }

    fn help(&self) -> String {
        self.help.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default, Deserialize)]
    struct Greet {
        name: String,
    }

    #[test]
    fn dispatch_by_name() {
        let d = Dispatcher::new("test").add("greet", |_s, g: Greet| {
            let mut r = Response::ok("");
            r.data = format!("hello {}", g.name).into_bytes();
            Ok(r)
        });
        let s = session::new_session();
        let rsp = d.call(&s, "greet", br#"{"name":"world"}"#).unwrap();
        assert!(rsp.success);
        assert_eq!(rsp.func_name, "greet");
        assert_eq!(rsp.data, b"hello world");

        assert!(d.call(&s, "nope", b"").is_err());
        s.close();
    }
}
