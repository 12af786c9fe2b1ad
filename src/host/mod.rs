//! Hosts and host contexts.
//!
//! A [`Host`] is an inventory entry with connection attributes and a backend
//! class. All remote work goes through a [`HostCtx`], a reference-counted
//! handle that amortises one backend connection across the operations that
//! share it.

pub mod backend;
pub mod localhost;
#[cfg(feature = "ssh")]
pub mod linux;

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CmdError, Error, Result};
use crate::session::Session;

use backend::{get_backend, CommandOutput, HostSession};

/// Primary interface name.
pub const PRIMARY: &str = "primary";
/// Primary IP4 interface name.
pub const PRIMARY4: &str = "primary4";
/// Primary IP6 interface name.
pub const PRIMARY6: &str = "primary6";
/// Reserved ID of the process-local host.
pub const LOCALHOST_ID: &str = "localhost";

/// A named address of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: String,
    pub address: String,
}

/// The inventory-visible part of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: String,
    pub addresses: Vec<Address>,
    pub labels: Vec<String>,
    pub properties: HashMap<String, String>,
}

impl HostInfo {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A host in the inventory, with its connection attributes.
#[derive(Debug, Default)]
pub struct Host {
    pub info: HostInfo,

    /// Host-scoped configuration tree, consulted by `GetCfg` before the
    /// session-global one.
    pub configuration: Option<serde_json::Value>,

    /// The bastion host to use to connect to this host.
    pub bastion: Option<Arc<Host>>,
    /// SSH hostname.
    pub hostname: String,
    pub network: String,
    pub port: u16,

    /// If nonempty, this user is used to login.
    pub login_user: String,
    pub login_password: String,
    /// If set, the key is used for public-key authentication.
    #[cfg(feature = "ssh")]
    pub key_auth: Option<Arc<crate::ssh::RawPrivateKey>>,

    /// Privilege escalation method, currently only `sudo`.
    pub become_method: String,

    /// Backend class name, `linux` or `localhost`.
    pub backend: String,
}

impl Host {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// The network to connect to this host.
    pub fn network(&self) -> &str {
        if self.network.is_empty() {
            "tcp"
        } else {
            &self.network
        }
    }

    /// The `host:port` pair to connect to.
    pub fn host_and_port(&self) -> String {
        let port = if self.port == 0 { 22 } else { self.port };
        format!("{}:{}", self.hostname, port)
    }

    /// Initializes uninitialized fields with defaults.
    pub fn defaults(&mut self) {
        if self.network.is_empty() {
            self.network = "tcp".into();
        }
        if self.port == 0 {
            self.port = 22;
        }
        if self.info.id.is_empty() {
            self.info.id = self.hostname.clone();
        }
    }

    /// Resolves the host addresses from DNS. Exactly one IP4 and/or one IP6
    /// address is allowed; more than one of either kind must be named
    /// explicitly in the inventory.
    pub fn discover_ips(&mut self) -> Result<()> {
        let addrs = (self.hostname.as_str(), 0)
            .to_socket_addrs()
            .map_err(Error::Io)?;
        let mut ip4 = None;
        let mut ip6 = None;
        for addr in addrs {
            let ip = addr.ip();
            if ip.is_ipv4() {
                if ip4.replace(ip).is_some() {
                    return Err(Error::Config(format!(
                        "host {} has more than one IP4 address, you have to name them",
                        self.info.id
                    )));
                }
            } else if ip6.replace(ip).is_some() {
                return Err(Error::Config(format!(
                    "host {} has more than one IP6 address, you have to name them",
                    self.info.id
                )));
            }
        }
        if let Some(ip) = ip4 {
            self.info.addresses.push(Address {
                name: PRIMARY4.into(),
                address: ip.to_string(),
            });
            self.info.addresses.push(Address {
                name: PRIMARY.into(),
                address: ip.to_string(),
            });
        }
        if let Some(ip) = ip6 {
            self.info.addresses.push(Address {
                name: PRIMARY6.into(),
                address: ip.to_string(),
            });
            if ip4.is_none() {
                self.info.addresses.push(Address {
                    name: PRIMARY.into(),
                    address: ip.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns a fresh host context for this host.
    pub fn new_ctx(self: &Arc<Host>) -> HostCtx {
        HostCtx {
            host: self.clone(),
            session: None,
            refs: 0,
        }
    }
}

/// The process-local host. Always present; never part of inventory files.
pub static LOCALHOST: once_cell::sync::Lazy<Arc<Host>> = once_cell::sync::Lazy::new(|| {
    Arc::new(Host {
        info: HostInfo {
            id: LOCALHOST_ID.into(),
            ..HostInfo::default()
        },
        backend: "localhost".into(),
        ..Host::default()
    })
});

/// A live, shareable backend session. The mutex linearises all operations
/// issued through one context.
pub type SharedSession = Arc<Mutex<Box<dyn HostSession>>>;

/// Reference-counted handle to a backend connection.
///
/// `new` and `close` must be serialised by the caller on one context;
/// distinct contexts for the same host may be used in parallel and may open
/// parallel connections.
pub struct HostCtx {
    host: Arc<Host>,
    session: Option<SharedSession>,
    refs: usize,
}

impl HostCtx {
    /// Returns the backend session, opening the connection on first use.
    /// Every successful call must be paired with a [`HostCtx::close`]. If
    /// opening fails the reference count is unchanged.
    pub fn new(&mut self, session: &Arc<Session>) -> Result<SharedSession> {
        if let Some(s) = &self.session {
            self.refs += 1;
            return Ok(s.clone());
        }
        let be = get_backend(&self.host.backend)
            .ok_or_else(|| Error::Config(format!("no backend: {}", self.host.backend)))?;
        let s = Arc::new(Mutex::new(be.new_session(session, &self.host)?));
        self.session = Some(s.clone());
        self.refs += 1;
        Ok(s)
    }

    /// Drops one reference; tears the connection down when the count reaches
    /// zero.
    pub fn close(&mut self) {
        if self.refs > 0 {
            self.refs -= 1;
        }
        if self.refs == 0 {
            if let Some(s) = self.session.take() {
                s.lock().close();
            }
        }
    }
}

/// File owner information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOwner {
    pub owner_name: String,
    pub owner_id: String,
    pub group_name: String,
    pub group_id: String,
}

/// File metadata, backend-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub dir: bool,
}

/// Desired attributes of a file or directory, for [`Host::ensure`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDesc {
    pub mode: Option<u32>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub dir: Option<bool>,
}

impl FileDesc {
    pub fn new() -> FileDesc {
        FileDesc::default()
    }

    pub fn ensure_dir(mut self) -> FileDesc {
        self.dir = Some(true);
        self
    }

    pub fn ensure_mode(mut self, mode: u32) -> FileDesc {
        self.mode = Some(mode);
        self
    }

    pub fn ensure_owner(mut self, user: impl Into<String>) -> FileDesc {
        self.user = Some(user.into());
        self
    }

    pub fn ensure_group(mut self, group: impl Into<String>) -> FileDesc {
        self.group = Some(group.into());
        self
    }
}

impl Host {
    /// Writes a file on the host.
    pub fn write_file(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        name: &str,
        perms: u32,
        content: &[u8],
    ) -> Result<Option<CmdError>> {
        let session = ctx.new(s)?;
        let ret = session.lock().write_file(name, perms, content);
        ctx.close();
        ret
    }

    /// Reads a file from the host. A missing file is not an error: all
    /// three results are `None`.
    pub fn read_file(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        name: &str,
    ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)> {
        let session = ctx.new(s)?;
        let ret = session.lock().read_file(name);
        ctx.close();
        ret
    }

    /// Runs one shell command line on the host.
    pub fn run_cmd(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        cmd: &str,
        env: &HashMap<String, String>,
    ) -> Result<CommandOutput> {
        let session = ctx.new(s)?;
        let ret = session.lock().run(cmd, env);
        ctx.close();
        ret
    }

    /// Retrieves file info from the host. A missing file returns default
    /// owner and `None` info.
    pub fn get_file_info(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        file: &str,
    ) -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)> {
        let session = ctx.new(s)?;
        let ret = session.lock().file_info(file);
        ctx.close();
        ret
    }

    pub fn mkdir(&self, ctx: &mut HostCtx, s: &Arc<Session>, path: &str) -> Result<Option<CmdError>> {
        let session = ctx.new(s)?;
        let ret = session.lock().mkdir(path);
        ctx.close();
        ret
    }

    pub fn chmod(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        path: &str,
        mode: u32,
    ) -> Result<Option<CmdError>> {
        let session = ctx.new(s)?;
        let ret = session.lock().chmod(path, mode);
        ctx.close();
        ret
    }

    /// Changes user and/or group, whichever is nonempty.
    pub fn chown(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        path: &str,
        user: &str,
        group: &str,
    ) -> Result<Option<CmdError>> {
        let session = ctx.new(s)?;
        let ret = session.lock().chown(path, user, group);
        ctx.close();
        ret
    }

    /// Brings a path to the desired attributes, step by step: directory,
    /// mode, owner, group. Returns whether anything changed. The first
    /// command error aborts the remaining steps.
    pub fn ensure(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        path: &str,
        desc: &FileDesc,
    ) -> Result<(bool, Option<CmdError>)> {
        // Hold one reference across the whole sequence so the nested
        // operations share the connection.
        ctx.new(s)?;
        let ret = self.ensure_steps(ctx, s, path, desc);
        ctx.close();
        ret
    }

    fn ensure_steps(
        &self,
        ctx: &mut HostCtx,
        s: &Arc<Session>,
        path: &str,
        desc: &FileDesc,
    ) -> Result<(bool, Option<CmdError>)> {
        debug!("ensure {} on {}: {:?}", path, self.id(), desc);
        let (mut owner, mut fi, _) = self.get_file_info(ctx, s, path)?;
        let mut changed = false;

        if desc.dir.is_some() {
            let is_dir = fi.as_ref().map(|f| f.dir).unwrap_or(false);
            if !is_dir {
                if let Some(cerr) = self.mkdir(ctx, s, path)? {
                    return Ok((false, Some(cerr)));
                }
                changed = true;
                let (o, f, _) = self.get_file_info(ctx, s, path)?;
                owner = o;
                fi = f;
            }
        }

        if let Some(mode) = desc.mode {
            if let Some(f) = &fi {
                if f.mode & 0o777 != mode & 0o777 {
                    if let Some(cerr) = self.chmod(ctx, s, path, mode)? {
                        return Ok((false, Some(cerr)));
                    }
                    changed = true;
                    let (o, _, _) = self.get_file_info(ctx, s, path)?;
                    owner = o;
                }
            }
        }

        if desc.uid.is_some() || desc.user.is_some() {
            let ok = desc.uid.as_deref() == Some(owner.owner_id.as_str())
                || desc.user.as_deref() == Some(owner.owner_name.as_str());
            if !ok {
                let user = desc.uid.as_deref().or(desc.user.as_deref()).unwrap();
                if let Some(cerr) = self.chown(ctx, s, path, user, "")? {
                    return Ok((false, Some(cerr)));
                }
                changed = true;
                let (o, _, _) = self.get_file_info(ctx, s, path)?;
                owner = o;
            }
        }

        if desc.gid.is_some() || desc.group.is_some() {
            let ok = desc.gid.as_deref() == Some(owner.group_id.as_str())
                || desc.group.as_deref() == Some(owner.group_name.as_str());
            if !ok {
                let group = desc.gid.as_deref().or(desc.group.as_deref()).unwrap();
                if let Some(cerr) = self.chown(ctx, s, path, "", group)? {
                    return Ok((false, Some(cerr)));
                }
                changed = true;
            }
        }

        Ok((changed, None))
    }
}

#[cfg(test)]
mod tests {
    use super::backend::{register_backend, CommandOutput, HostBackend, HostSession};
    use super::*;
    use crate::session;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static OPENED: AtomicUsize = AtomicUsize::new(0);
    static CLOSED: AtomicUsize = AtomicUsize::new(0);

    struct CountingBackend;
    struct CountingSession;

    impl HostBackend for CountingBackend {
        fn new_session(
            &self,
            _session: &Arc<Session>,
            _host: &Arc<Host>,
        ) -> Result<Box<dyn HostSession>> {
            OPENED.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession))
        }
    }

    impl HostSession for CountingSession {
        fn write_file(&mut self, _: &str, _: u32, _: &[u8]) -> Result<Option<CmdError>> {
            Ok(None)
        }
        fn read_file(
            &mut self,
            _: &str,
        ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)> {
            Ok((None, None, None))
        }
        fn run(&mut self, _: &str, _: &HashMap<String, String>) -> Result<CommandOutput> {
            Ok(CommandOutput::default())
        }
        fn file_info(&mut self, _: &str) -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)> {
            Ok((FileOwner::default(), None, None))
        }
        fn mkdir(&mut self, _: &str) -> Result<Option<CmdError>> {
            Ok(None)
        }
        fn chmod(&mut self, _: &str, _: u32) -> Result<Option<CmdError>> {
            Ok(None)
        }
        fn chown(&mut self, _: &str, _: &str, _: &str) -> Result<Option<CmdError>> {
            Ok(None)
        }
        fn close(&mut self) {
            CLOSED.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn context_shares_one_connection() {
        register_backend("counting", Arc::new(CountingBackend));
        let host = Arc::new(Host {
            info: HostInfo {
                id: "c1".into(),
                ..HostInfo::default()
            },
            backend: "counting".into(),
            ..Host::default()
        });
        let s = session::new_session();

        // pin the connection across the two commands, the way ensure does
        let mut ctx = host.new_ctx();
        ctx.new(&s).unwrap();
        host.run_cmd(&mut ctx, &s, "one", &HashMap::new()).unwrap();
        host.run_cmd(&mut ctx, &s, "two", &HashMap::new()).unwrap();
        assert_eq!(OPENED.load(Ordering::SeqCst), 1);
        assert_eq!(CLOSED.load(Ordering::SeqCst), 0);
        ctx.close();
        assert_eq!(CLOSED.load(Ordering::SeqCst), 1);

        // a second context opens its own connection
        let mut other = host.new_ctx();
        other.new(&s).unwrap();
        assert_eq!(OPENED.load(Ordering::SeqCst), 2);
        other.close();
        assert_eq!(CLOSED.load(Ordering::SeqCst), 2);
        s.close();
    }
}
