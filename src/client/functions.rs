//! Published functions and service dispatch tables.
//!
//! A module publishes plain functions by name and, optionally, whole
//! services whose methods are addressed as `prefix.Method`. Both end up as
//! monomorphised closures that decode the JSON payload into the declared
//! parameter type and encode the declared result back to JSON; raw-bytes
//! functions bypass the JSON step.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::session::Session;

/// Errors returned by user functions.
pub type FuncError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type RawFunc =
    Box<dyn Fn(&Session, &[u8]) -> Result<Vec<u8>, FuncError> + Send + Sync>;

fn wrap_json<In, Out, F>(f: F) -> RawFunc
where
    In: DeserializeOwned + Default,
    Out: Serialize,
    F: Fn(&Session, In) -> Result<Out, FuncError> + Send + Sync + 'static,
{
    Box::new(move |session, data| {
        let input: In = if data.is_empty() {
            In::default()
        } else {
            serde_json::from_slice(data)?
        };
        let out = f(session, input)?;
        Ok(serde_json::to_vec(&out)?)
    })
}

/// The functions defined in a module, keyed by exact name.
#[derive(Default)]
pub struct Functions {
    pub(crate) map: HashMap<String, RawFunc>,
}

impl Functions {
    pub fn new() -> Functions {
        Functions::default()
    }

    /// Publishes a function taking and returning JSON-mapped types.
    pub fn add<In, Out, F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        In: DeserializeOwned + Default,
        Out: Serialize,
        F: Fn(&Session, In) -> Result<Out, FuncError> + Send + Sync + 'static,
    {
        self.map.insert(name.into(), wrap_json(f));
        self
    }

    /// Publishes a function with no payload and no result.
    pub fn add_nullary<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Session) -> Result<(), FuncError> + Send + Sync + 'static,
    {
        self.map
            .insert(name.into(), Box::new(move |s, _| f(s).map(|_| Vec::new())));
        self
    }

    /// Publishes a function working on raw bytes, bypassing JSON.
    pub fn add_raw<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&Session, &[u8]) -> Result<Vec<u8>, FuncError> + Send + Sync + 'static,
    {
        self.map.insert(name.into(), Box::new(f));
        self
    }

    pub(crate) fn merge(&mut self, other: Functions) {
        self.map.extend(other.map);
    }
}

/// A service: a named method table published under one prefix.
#[derive(Default)]
pub struct Service {
    pub(crate) methods: HashMap<String, RawFunc>,
}

impl Service {
    pub fn new() -> Service {
        Service::default()
    }

    pub fn method<In, Out, F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Default,
        Out: Serialize,
        F: Fn(&Session, In) -> Result<Out, FuncError> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), wrap_json(f));
        self
    }
}

/// The service registry: `prefix.Method` dispatch table.
#[derive(Default)]
pub struct Services {
    pub(crate) map: HashMap<String, Service>,
}

impl Services {
    pub fn new() -> Services {
        Services::default()
    }

    pub fn register(&mut self, prefix: impl Into<String>, service: Service) -> &mut Self {
        self.map.insert(prefix.into(), service);
        self
    }

    /// Looks up `prefix.Method`; the name is split at the first dot.
    pub(crate) fn lookup(&self, func_name: &str) -> Option<&RawFunc> {
        let (prefix, method) = func_name.split_once('.')?;
        self.map.get(prefix)?.methods.get(method)
    }
}

static REGISTERED_FUNCTIONS: Lazy<Mutex<Functions>> = Lazy::new(|| Mutex::new(Functions::new()));

/// Registers a function ahead of [`super::run`]; useful from module init
/// code that runs before the runtime is created.
pub fn export<In, Out, F>(name: impl Into<String>, f: F)
where
    In: DeserializeOwned + Default,
    Out: Serialize,
    F: Fn(&Session, In) -> Result<Out, FuncError> + Send + Sync + 'static,
{
    REGISTERED_FUNCTIONS.lock().add(name, f);
}

pub(crate) fn take_registered() -> Functions {
    std::mem::take(&mut *REGISTERED_FUNCTIONS.lock())
}
