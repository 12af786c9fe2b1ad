//! Session and host handles for module code.
//!
//! These wrappers panic on infrastructure errors: a broken orchestrator
//! connection is not something module code can meaningfully handle, and
//! the worker runtime turns the panic into a failed response. Command
//! errors, which module code often wants to inspect, come back as values.
//! `*_may_fail` variants return the infrastructure error instead of
//! panicking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CmdError, Error, Result};
use crate::host::{FileDesc, FileInfo, FileOwner, HostInfo, LOCALHOST_ID};
use crate::inventory::{Selector, ALL_HOSTS};
use crate::proto::WriteSource;
use crate::response::Response;

use super::{CmdResponse, FuncError, Runtime};

fn must<T>(r: Result<T>) -> T {
    match r {
        Ok(v) => v,
        Err(e) => panic!("{}", e),
    }
}

fn cmd_result<T>(value: T, error: Option<CmdError>) -> Result<T, CmdError> {
    match error {
        Some(e) => Err(e),
        None => Ok(value),
    }
}

/// A client session. Cloning shares the modified flag.
#[derive(Clone)]
pub struct Session {
    rt: Arc<Runtime>,
    pub id: String,
    modified: Arc<AtomicBool>,
}

impl Session {
    pub fn new(rt: Arc<Runtime>, id: impl Into<String>) -> Session {
        Session {
            rt,
            id: id.into(),
            modified: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    /// Whether any host-mutating operation took effect in this session.
    pub fn modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    pub fn set_modified(&self) {
        self.modified.store(true, Ordering::SeqCst);
    }

    /// Logs a message against a host.
    pub fn log(&self, host_id: &str, msg: &str) {
        self.rt.log(&self.id, host_id, msg);
    }

    /// Prints a message on the orchestrator's stdout.
    pub fn print(&self, msg: &str) {
        self.rt.print(&self.id, msg);
    }

    /// The trailing command-line arguments of the run.
    pub fn args(&self) -> Vec<String> {
        self.rt.get_args(&self.id)
    }

    /// Calls a function in another module; the payload is JSON-encoded.
    pub fn call<T: Serialize>(&self, module: &str, function: &str, data: &T) -> Response {
        self.log(LOCALHOST_ID, &format!("Call {}.{}", module, function));
        let data = must(serde_json::to_vec(data).map_err(Error::Json));
        let rsp = must(self.rt.call(&self.id, module, function, data));
        if rsp.modified {
            self.set_modified();
        }
        rsp
    }

    /// Calls a function in another module with a raw payload.
    pub fn call_raw(&self, module: &str, function: &str, data: Vec<u8>) -> Response {
        let rsp = must(self.rt.call(&self.id, module, function, data));
        if rsp.modified {
            self.set_modified();
        }
        rsp
    }

    pub fn get_cfg_json(&self, path: &str) -> Option<Vec<u8>> {
        must(self.rt.get_cfg_json(&self.id, "", path))
    }

    /// Retrieves a configuration item and decodes it into `out`'s type.
    /// `None` when the path does not exist.
    pub fn get_cfg<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        let data = self.get_cfg_json(path)?;
        Some(must(serde_json::from_slice(&data).map_err(Error::Json)))
    }

    pub fn get_host_cfg_json(&self, host_id: &str, path: &str) -> Option<Vec<u8>> {
        must(self.rt.get_cfg_json(&self.id, host_id, path))
    }

    /// Host configuration first, global configuration as the fallback.
    pub fn get_host_cfg<T: DeserializeOwned>(&self, host_id: &str, path: &str) -> Option<T> {
        let data = self.get_host_cfg_json(host_id, path)?;
        Some(must(serde_json::from_slice(&data).map_err(Error::Json)))
    }

    // ---- inventory ----

    pub fn select(&self, from: &str, selectors: Vec<Selector>) -> String {
        must(self.rt.inv_select(&self.id, from, selectors))
    }

    pub fn union(&self, sources: Vec<String>) -> String {
        must(self.rt.inv_union(&self.id, sources))
    }

    pub fn make(&self, hosts: Vec<String>) -> String {
        must(self.rt.inv_make(&self.id, hosts))
    }

    pub fn add(&self, inv: &str, hosts: Vec<String>) -> String {
        must(self.rt.inv_add(&self.id, inv, hosts))
    }

    pub fn get_host_ids(&self, inv: &str) -> Vec<String> {
        must(self.rt.inv_get_host_ids(&self.id, inv))
    }

    pub fn get_host_info(&self, ids: Vec<String>) -> Vec<HostInfo> {
        must(self.rt.inv_get_host_info(&self.id, ids))
    }

    pub fn get_hosts(&self, inv: &str) -> Vec<HostInfo> {
        must(self.rt.inv_get_hosts(&self.id, inv))
    }

    pub fn release(&self, inv: &str) {
        self.rt.inv_release(&self.id, inv);
    }

    // ---- remote operations ----

    pub fn command(&self, host_id: &str, cmd: &str) -> CmdResponse {
        self.log(host_id, &format!("Command {}", cmd));
        must(self.rt.command(&self.id, host_id, cmd))
    }

    /// Returns the error instead of panicking when the command cannot be
    /// delivered.
    pub fn command_may_fail(&self, host_id: &str, cmd: &str) -> Result<CmdResponse> {
        self.rt.command(&self.id, host_id, cmd)
    }

    /// Reads a remote file. A missing file is `(None, None)`.
    pub fn read_file(&self, host_id: &str, file: &str) -> (Option<FileInfo>, Option<Vec<u8>>) {
        self.log(host_id, &format!("readFile {}", file));
        let (info, data, _) = must(self.rt.read_file(&self.id, host_id, file));
        (info, data)
    }

    pub fn write_file(
        &self,
        host_id: &str,
        file: &str,
        perms: u32,
        data: Vec<u8>,
    ) -> Result<(), CmdError> {
        self.log(host_id, &format!("writeFile {}", file));
        let (_, error) = must(self.rt.write_file(
            &self.id,
            host_id,
            file,
            perms,
            WriteSource::Data(data),
            false,
        ));
        cmd_result((), error)?;
        self.set_modified();
        Ok(())
    }

    /// Writes only when the content differs; reports whether it did.
    pub fn write_file_if_different(
        &self,
        host_id: &str,
        file: &str,
        perms: u32,
        data: Vec<u8>,
    ) -> Result<bool, CmdError> {
        self.log(host_id, &format!("writeFileIfDifferent {}", file));
        let (modified, error) = must(self.rt.write_file(
            &self.id,
            host_id,
            file,
            perms,
            WriteSource::Data(data),
            true,
        ));
        cmd_result((), error)?;
        if modified {
            self.set_modified();
        }
        Ok(modified)
    }

    /// Renders the template on the orchestrator and writes the output if it
    /// differs from the current content.
    pub fn write_file_from_template<T: Serialize>(
        &self,
        host_id: &str,
        file: &str,
        perms: u32,
        template: &str,
        template_data: &T,
    ) -> Result<bool, CmdError> {
        self.log(host_id, &format!("writeFileFromTemplate {}", file));
        let data = must(serde_json::to_vec(template_data).map_err(Error::Json));
        let (modified, error) = must(self.rt.write_file(
            &self.id,
            host_id,
            file,
            perms,
            WriteSource::Template {
                template: template.to_string(),
                data,
            },
            true,
        ));
        cmd_result((), error)?;
        if modified {
            self.set_modified();
        }
        Ok(modified)
    }

    /// Like [`Session::write_file_from_template`], with the template read
    /// from a local file.
    pub fn write_file_from_template_file<T: Serialize>(
        &self,
        host_id: &str,
        file: &str,
        perms: u32,
        template_file: &str,
        template_data: &T,
    ) -> Result<bool, CmdError> {
        self.log(host_id, &format!("writeFileFromTemplateFile {}", file));
        let template = must(std::fs::read_to_string(template_file).map_err(Error::Io));
        self.write_file_from_template(host_id, file, perms, &template, template_data)
    }

    pub fn copy_file(
        &self,
        from: &str,
        from_path: &str,
        to: &str,
        to_path: &str,
    ) -> Result<(), CmdError> {
        self.log(
            from,
            &format!("copyFile {}:{} {}:{}", from, from_path, to, to_path),
        );
        let (_, error) = must(
            self.rt
                .copy_file(&self.id, from, from_path, to, to_path, false),
        );
        cmd_result((), error)?;
        self.set_modified();
        Ok(())
    }

    /// Copies only when the destination differs; reports whether it did.
    pub fn copy_if_different(
        &self,
        from: &str,
        from_path: &str,
        to: &str,
        to_path: &str,
    ) -> Result<bool, CmdError> {
        self.log(
            from,
            &format!("copyIfDifferent {}:{} {}:{}", from, from_path, to, to_path),
        );
        let (changed, error) = must(
            self.rt
                .copy_file(&self.id, from, from_path, to, to_path, true),
        );
        cmd_result((), error)?;
        if changed {
            self.set_modified();
        }
        Ok(changed)
    }

    /// Copies a file from the local filesystem to a host.
    pub fn copy_from_local(&self, from_path: &str, to: &str, to_path: &str) -> Result<(), CmdError> {
        self.log(
            LOCALHOST_ID,
            &format!("copyFromLocal {} {}:{}", from_path, to, to_path),
        );
        let md = must(std::fs::metadata(from_path).map_err(Error::Io));
        let data = must(std::fs::read(from_path).map_err(Error::Io));
        let perms = {
            use std::os::unix::fs::PermissionsExt;
            md.permissions().mode()
        };
        self.write_file(to, to_path, perms, data)
    }

    pub fn copy_from_local_if_different(
        &self,
        from_path: &str,
        to: &str,
        to_path: &str,
    ) -> Result<bool, CmdError> {
        self.log(
            LOCALHOST_ID,
            &format!("copyFromLocalIfDifferent {} {}:{}", from_path, to, to_path),
        );
        let md = must(std::fs::metadata(from_path).map_err(Error::Io));
        let data = must(std::fs::read(from_path).map_err(Error::Io));
        let perms = {
            use std::os::unix::fs::PermissionsExt;
            md.permissions().mode()
        };
        self.write_file_if_different(to, to_path, perms, data)
    }

    /// Waits until the host accepts connections or the timeout elapses.
    pub fn wait_host(&self, host_id: &str, timeout: Duration) -> Result<()> {
        self.log(host_id, "wait");
        self.rt
            .wait_host(&self.id, host_id, timeout.as_millis() as u64)
    }

    pub fn get_file_info(&self, host_id: &str, path: &str) -> (Option<FileInfo>, FileOwner) {
        self.log(host_id, &format!("getFileInfo {}", path));
        let (owner, info, _) = must(self.rt.get_file_info(&self.id, host_id, path));
        (info, owner)
    }

    /// Whether the path exists as a file or directory.
    pub fn exists(&self, host_id: &str, path: &str) -> bool {
        self.get_file_info(host_id, path).0.is_some()
    }

    pub fn mkdir(&self, host_id: &str, path: &str) -> Result<(), CmdError> {
        self.log(host_id, &format!("mkdir {}", path));
        cmd_result((), must(self.rt.mkdir(&self.id, host_id, path)))
    }

    pub fn chmod(&self, host_id: &str, path: &str, mode: u32) -> Result<(), CmdError> {
        self.log(host_id, &format!("chmod {}", path));
        cmd_result((), must(self.rt.chmod(&self.id, host_id, path, mode)))
    }

    pub fn chown(
        &self,
        host_id: &str,
        path: &str,
        user: &str,
        group: &str,
    ) -> Result<(), CmdError> {
        self.log(host_id, &format!("chown {}", path));
        cmd_result((), must(self.rt.chown(&self.id, host_id, path, user, group)))
    }

    /// Brings a path to the desired attributes; reports whether anything
    /// changed.
    pub fn ensure(&self, host_id: &str, path: &str, desc: FileDesc) -> Result<bool, CmdError> {
        self.log(host_id, &format!("ensure {}", path));
        let (changed, error) = must(self.rt.ensure(&self.id, host_id, path, desc));
        cmd_result((), error)?;
        if changed {
            self.set_modified();
        }
        Ok(changed)
    }

    /// Returns a host handle tied to this session.
    pub fn host(&self, id: impl Into<String>) -> Host {
        Host {
            session: self.clone(),
            id: id.into(),
        }
    }

    /// Runs `f` concurrently for every host in the inventory, one task per
    /// host. Returns true iff every call succeeded; errors are logged on
    /// the failing host and do not stop the other tasks.
    pub fn for_all<F>(&self, inv: &str, f: F) -> bool
    where
        F: Fn(Host) -> Result<(), FuncError> + Send + Sync,
    {
        let ids = self.get_host_ids(inv);
        let ok = Mutex::new(true);
        std::thread::scope(|scope| {
            for id in ids {
                let host = self.host(id);
                let f = &f;
                let ok = &ok;
                scope.spawn(move || {
                    if let Err(e) = f(host.clone()) {
                        host.log(&format!("Error: {}", e));
                        *ok.lock() = false;
                    }
                });
            }
        });
        ok.into_inner()
    }

    /// Sequential, short-circuiting variant of [`Session::for_all`].
    pub fn for_all_serial<F>(&self, inv: &str, f: F) -> bool
    where
        F: Fn(Host) -> Result<(), FuncError>,
    {
        for id in self.get_host_ids(inv) {
            let host = self.host(id);
            if let Err(e) = f(host.clone()) {
                host.log(&format!("Error: {}", e));
                return false;
            }
        }
        true
    }

    /// Selects hosts matching the selector from all hosts and runs `f` for
    /// each.
    pub fn for_all_selected<F>(&self, selector: Selector, f: F) -> bool
    where
        F: Fn(Host) -> Result<(), FuncError> + Send + Sync,
    {
        let inv = self.select(ALL_HOSTS, vec![selector]);
        let result = self.for_all(&inv, f);
        self.release(&inv);
        result
    }
}

/// A single host bound to a session.
#[derive(Clone)]
pub struct Host {
    session: Session,
    pub id: String,
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

impl Host {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Host info from the inventory. Panics on an unknown host.
    pub fn info(&self) -> HostInfo {
        let mut infos = self.session.get_host_info(vec![self.id.clone()]);
        match infos.pop() {
            Some(info) => info,
            None => panic!("invalid host: {}", self.id),
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.info().has_label(label)
    }

    pub fn log(&self, msg: &str) {
        self.session.log(&self.id, msg);
    }

    pub fn get_cfg_json(&self, path: &str) -> Option<Vec<u8>> {
        self.session.get_host_cfg_json(&self.id, path)
    }

    pub fn get_cfg<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.session.get_host_cfg(&self.id, path)
    }

    pub fn command(&self, cmd: &str) -> CmdResponse {
        self.session.command(&self.id, cmd)
    }

    pub fn command_may_fail(&self, cmd: &str) -> Result<CmdResponse> {
        self.session.command_may_fail(&self.id, cmd)
    }

    pub fn read_file(&self, file: &str) -> (Option<FileInfo>, Option<Vec<u8>>) {
        self.session.read_file(&self.id, file)
    }

    pub fn write_file(&self, file: &str, perms: u32, data: Vec<u8>) -> Result<(), CmdError> {
        self.session.write_file(&self.id, file, perms, data)
    }

    pub fn write_file_if_different(
        &self,
        file: &str,
        perms: u32,
        data: Vec<u8>,
    ) -> Result<bool, CmdError> {
        self.session
            .write_file_if_different(&self.id, file, perms, data)
    }

    pub fn write_file_from_template<T: Serialize>(
        &self,
        file: &str,
        perms: u32,
        template: &str,
        data: &T,
    ) -> Result<bool, CmdError> {
        self.session
            .write_file_from_template(&self.id, file, perms, template, data)
    }

    pub fn write_file_from_template_file<T: Serialize>(
        &self,
        file: &str,
        perms: u32,
        template_file: &str,
        data: &T,
    ) -> Result<bool, CmdError> {
        self.session
            .write_file_from_template_file(&self.id, file, perms, template_file, data)
    }

    pub fn copy_from_local(&self, from_path: &str, to_path: &str) -> Result<(), CmdError> {
        self.session.copy_from_local(from_path, &self.id, to_path)
    }

    pub fn copy_from_local_if_different(
        &self,
        from_path: &str,
        to_path: &str,
    ) -> Result<bool, CmdError> {
        self.session
            .copy_from_local_if_different(from_path, &self.id, to_path)
    }

    pub fn wait(&self, timeout: Duration) -> Result<()> {
        self.session.wait_host(&self.id, timeout)
    }

    pub fn get_file_info(&self, path: &str) -> (Option<FileInfo>, FileOwner) {
        self.session.get_file_info(&self.id, path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.session.exists(&self.id, path)
    }

    pub fn mkdir(&self, path: &str) -> Result<(), CmdError> {
        self.session.mkdir(&self.id, path)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), CmdError> {
        self.session.chmod(&self.id, path, mode)
    }

    pub fn chown(&self, path: &str, user: &str, group: &str) -> Result<(), CmdError> {
        self.session.chown(&self.id, path, user, group)
    }

    pub fn ensure(&self, path: &str, desc: FileDesc) -> Result<bool, CmdError> {
        self.session.ensure(&self.id, path, desc)
    }
}
