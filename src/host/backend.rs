//! The host capability set and the backend registry.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{CmdError, Result};
use crate::session::Session;

use super::{FileInfo, FileOwner, Host};

/// Output of one shell command. A non-zero exit status is not an
/// infrastructure error; it lands in `exit_code` with the output captured.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// The operations that can run on a host through a live session.
pub trait HostSession: Send {
    fn write_file(&mut self, name: &str, perms: u32, content: &[u8]) -> Result<Option<CmdError>>;
    fn read_file(
        &mut self,
        name: &str,
    ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)>;
    fn run(&mut self, cmd: &str, env: &HashMap<String, String>) -> Result<CommandOutput>;
    fn file_info(&mut self, path: &str)
        -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)>;
    fn mkdir(&mut self, path: &str) -> Result<Option<CmdError>>;
    fn chmod(&mut self, path: &str, mode: u32) -> Result<Option<CmdError>>;
    fn chown(&mut self, path: &str, user: &str, group: &str) -> Result<Option<CmdError>>;
    fn close(&mut self);
}

/// Opens new sessions on hosts of one backend class.
pub trait HostBackend: Send + Sync {
    fn new_session(&self, session: &Arc<Session>, host: &Arc<Host>)
        -> Result<Box<dyn HostSession>>;
}

static BACKENDS: Lazy<RwLock<HashMap<String, Arc<dyn HostBackend>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Registers a backend under a class name.
pub fn register_backend(name: &str, backend: Arc<dyn HostBackend>) {
    BACKENDS.write().insert(name.to_string(), backend);
}

/// Returns the backend registered under the class name.
pub fn get_backend(name: &str) -> Option<Arc<dyn HostBackend>> {
    BACKENDS.read().get(name).cloned()
}

/// Registers the built-in backends. Called once at startup; calling it
/// again is harmless.
pub fn init_backends() {
    register_backend("localhost", Arc::new(super::localhost::LocalBackend));
    #[cfg(feature = "ssh")]
    register_backend("linux", Arc::new(super::linux::LinuxBackend));
}
