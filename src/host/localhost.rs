//! Backend for the process-local host.
//!
//! Sessions are stateless: every operation goes straight to the local
//! filesystem or a local shell. Operation failures become command errors;
//! infrastructure errors are reserved for failures to start the shell at
//! all.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use nix::unistd::{Gid, Group, Uid, User};

use crate::error::{CmdError, Result};
use crate::session::Session;

use super::backend::{CommandOutput, HostBackend, HostSession};
use super::{FileInfo, FileOwner, Host, LOCALHOST_ID};

pub struct LocalBackend;

impl HostBackend for LocalBackend {
    fn new_session(
        &self,
        session: &Arc<Session>,
        host: &Arc<Host>,
    ) -> Result<Box<dyn HostSession>> {
        Ok(Box::new(LocalSession {
            host: host.clone(),
            session: session.clone(),
        }))
    }
}

pub struct LocalSession {
    host: Arc<Host>,
    session: Arc<Session>,
}

fn cmd_err<E: std::fmt::Display>(err: E) -> Option<CmdError> {
    Some(CmdError::new(LOCALHOST_ID, err.to_string()))
}

fn file_info_from(path: &str, md: &fs::Metadata) -> FileInfo {
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let mtime = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    FileInfo {
        name,
        size: md.len(),
        mode: md.permissions().mode(),
        mtime,
        dir: md.is_dir(),
    }
}

impl HostSession for LocalSession {
    fn write_file(&mut self, name: &str, perms: u32, content: &[u8]) -> Result<Option<CmdError>> {
        let mut f = match fs::File::create(name) {
            Ok(f) => f,
            Err(e) => return Ok(cmd_err(e)),
        };
        if let Err(e) = f.set_permissions(fs::Permissions::from_mode(perms & 0o777)) {
            return Ok(cmd_err(e));
        }
        if let Err(e) = f.write_all(content) {
            return Ok(cmd_err(e));
        }
        Ok(None)
    }

    fn read_file(
        &mut self,
        name: &str,
    ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)> {
        let md = match fs::metadata(name) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((None, None, None)),
            Err(e) => return Ok((None, None, cmd_err(e))),
        };
        match fs::read(name) {
            Ok(data) => Ok((Some(file_info_from(name, &md)), Some(data), None)),
            Err(e) => Ok((Some(file_info_from(name, &md)), None, cmd_err(e))),
        }
    }

    fn run(&mut self, cmd: &str, env: &HashMap<String, String>) -> Result<CommandOutput> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        self.session.get_logger(&self.host).print(cmd);

        let mut command = Command::new(shell);
        command
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in env {
            command.env(k, v);
        }
        let mut child = command.spawn()?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(cmd.as_bytes())?;
        let out = child.wait_with_output()?;

        if !out.stdout.is_empty() || !out.stderr.is_empty() {
            self.session.get_logger(&self.host).print(&format!(
                "out: {} err: {}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            ));
        }
        Ok(CommandOutput {
            stdout: out.stdout,
            stderr: out.stderr,
            exit_code: out.status.code().unwrap_or(-1),
        })
    }

    fn file_info(
        &mut self,
        path: &str,
    ) -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)> {
        let md = match fs::metadata(path) {
            Ok(md) => md,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((FileOwner::default(), None, None))
            }
            Err(e) => return Ok((FileOwner::default(), None, cmd_err(e))),
        };
        let mut owner = FileOwner {
            owner_id: md.uid().to_string(),
            group_id: md.gid().to_string(),
            ..FileOwner::default()
        };
        if let Ok(Some(user)) = User::from_uid(Uid::from_raw(md.uid())) {
            owner.owner_name = user.name;
        }
        if let Ok(Some(group)) = Group::from_gid(Gid::from_raw(md.gid())) {
            owner.group_name = group.name;
        }
        Ok((owner, Some(file_info_from(path, &md)), None))
    }

    fn mkdir(&mut self, path: &str) -> Result<Option<CmdError>> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(0o775);
        match builder.create(path) {
            Ok(()) => Ok(None),
            Err(e) => Ok(cmd_err(e)),
        }
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<Option<CmdError>> {
        match fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
            Ok(()) => Ok(None),
            Err(e) => Ok(cmd_err(e)),
        }
    }

    fn chown(&mut self, path: &str, user: &str, group: &str) -> Result<Option<CmdError>> {
        let mut uid = None;
        let mut gid = None;
        if !user.is_empty() {
            let found = match User::from_uid(Uid::from_raw(user.parse().unwrap_or(u32::MAX))) {
                Ok(Some(u)) => Some(u),
                _ => User::from_name(user).ok().flatten(),
            };
            match found {
                Some(u) => uid = Some(u.uid),
                None => return Ok(Some(CmdError::new(LOCALHOST_ID, format!("User not found: {}", user)))),
            }
        }
        if !group.is_empty() {
            let found = match Group::from_gid(Gid::from_raw(group.parse().unwrap_or(u32::MAX))) {
                Ok(Some(g)) => Some(g),
                _ => Group::from_name(group).ok().flatten(),
            };
            match found {
                Some(g) => gid = Some(g.gid),
                None => {
                    return Ok(Some(CmdError::new(
                        LOCALHOST_ID,
                        format!("Group not found: {}", group),
                    )))
                }
            }
        }
        match nix::unistd::chown(Path::new(path), uid, gid) {
            Ok(()) => Ok(None),
            Err(e) => Ok(cmd_err(e)),
        }
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session;

    fn local_session() -> LocalSession {
        let s = session::new_session();
        LocalSession {
            host: super::super::LOCALHOST.clone(),
            session: s,
        }
    }

    #[test]
    fn read_missing_file_is_not_an_error() {
        let mut s = local_session();
        let (fi, data, cerr) = s.read_file("/definitely/not/there").unwrap();
        assert!(fi.is_none());
        assert!(data.is_none());
        assert!(cerr.is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f").to_string_lossy().into_owned();
        let mut s = local_session();
        assert!(s.write_file(&path, 0o640, b"content").unwrap().is_none());
        let (fi, data, cerr) = s.read_file(&path).unwrap();
        assert!(cerr.is_none());
        assert_eq!(data.unwrap(), b"content");
        let fi = fi.unwrap();
        assert_eq!(fi.mode & 0o777, 0o640);
        assert!(!fi.dir);
    }

    #[test]
    fn run_captures_exit_code() {
        let mut s = local_session();
        let out = s.run("echo ok; exit 3", &HashMap::new()).unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "ok");
    }

    #[test]
    fn mkdir_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b").to_string_lossy().into_owned();
        let mut s = local_session();
        assert!(s.mkdir(&path).unwrap().is_none());
        let (owner, fi, cerr) = s.file_info(&path).unwrap();
        assert!(cerr.is_none());
        assert!(fi.unwrap().dir);
        assert!(!owner.owner_id.is_empty());
    }
}
