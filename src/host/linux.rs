//! Backend for remote linux hosts over SSH.
//!
//! The SSH client is established once per host context and reused; every
//! shell command opens a fresh channel on it. File transfer goes over SCP.
//! When the host's privilege escalation is `sudo`, shell commands are
//! rewritten into a sudo here-doc and file transfers are staged through a
//! temporary path moved into place under sudo.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{CmdError, Result};
use crate::session::Session;
use crate::ssh;

use super::backend::{CommandOutput, HostBackend, HostSession};
use super::{FileInfo, FileOwner, Host};

pub struct LinuxBackend;

impl HostBackend for LinuxBackend {
    fn new_session(
        &self,
        session: &Arc<Session>,
        host: &Arc<Host>,
    ) -> Result<Box<dyn HostSession>> {
        let client = ssh::dial(host).map_err(|e| {
            warn!("cannot dial host {}: {}", host.id(), e);
            e
        })?;
        debug!("open session to {}", host.id());
        Ok(Box::new(RemoteSession {
            client,
            host: host.clone(),
            session: session.clone(),
        }))
    }
}

/// Rewrites the command to run under the host's become method.
fn become_cmd(host: &Host, cmd: &str) -> String {
    if host.become_method == "sudo" {
        let delim = Uuid::new_v4().to_string();
        format!("sudo -s --<<{delim}\n{cmd}\n{delim}\n")
    } else {
        cmd.to_string()
    }
}

fn quoted(path: &str) -> String {
    shell_escape::unix::escape(path.into()).into_owned()
}

fn not_found(text: &[u8]) -> bool {
    let text = String::from_utf8_lossy(text).to_lowercase();
    text.contains("no such file or directory")
}

pub struct RemoteSession {
    client: ssh::Client,
    host: Arc<Host>,
    session: Arc<Session>,
}

impl RemoteSession {
    /// Runs a command line through a login shell on the host. Output and
    /// exit status come back; only transport faults are errors.
    fn run_shell(
        &mut self,
        cmd: &str,
        env: &HashMap<String, String>,
    ) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        debug!("run shell command {} on {}", cmd, self.host.id());
        let mut channel = self.client.sess.channel_session()?;
        for (k, v) in env {
            // sshd only accepts names listed in AcceptEnv; a refusal is not fatal
            let _ = channel.setenv(k, v);
        }
        self.session.get_logger(&self.host).print(cmd);

        let cmd = become_cmd(&self.host, cmd);
        debug!("after become: {}", cmd);
        channel.exec(&cmd)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;
        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        let logger = self.session.get_logger(&self.host);
        if !stdout.is_empty() {
            logger.print(&format!("stdout: {}", String::from_utf8_lossy(&stdout)));
        }
        if !stderr.is_empty() {
            logger.print(&format!("stderr: {}", String::from_utf8_lossy(&stderr)));
        }
        Ok((stdout, stderr, exit_code))
    }

    fn scp_send(
        &mut self,
        path: &str,
        perms: u32,
        content: &[u8],
    ) -> std::result::Result<(), String> {
        let err = |e: ssh2::Error| e.to_string();
        let mut remote = self
            .client
            .sess
            .scp_send(
                Path::new(path),
                (perms & 0o777) as i32,
                content.len() as u64,
                None,
            )
            .map_err(err)?;
        use std::io::Write;
        remote.write_all(content).map_err(|e| e.to_string())?;
        remote.send_eof().map_err(err)?;
        remote.wait_eof().map_err(err)?;
        remote.close().map_err(err)?;
        remote.wait_close().map_err(err)?;
        Ok(())
    }

    fn scp_recv(&mut self, path: &str) -> std::result::Result<(FileInfo, Vec<u8>), String> {
        let err = |e: ssh2::Error| e.to_string();
        let (mut remote, stat) = self.client.sess.scp_recv(Path::new(path)).map_err(err)?;
        let mut data = Vec::new();
        remote.read_to_end(&mut data).map_err(|e| e.to_string())?;
        data.truncate(stat.size() as usize);
        remote.send_eof().map_err(err)?;
        remote.wait_eof().map_err(err)?;
        remote.close().map_err(err)?;
        remote.wait_close().map_err(err)?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        let mode = stat.mode() as u32;
        Ok((
            FileInfo {
                name,
                size: stat.size(),
                mode,
                mtime: 0,
                dir: mode & 0o170000 == 0o040000,
            },
            data,
        ))
    }
}

impl HostSession for RemoteSession {
    fn write_file(&mut self, name: &str, perms: u32, content: &[u8]) -> Result<Option<CmdError>> {
        debug!("writing remote file {} on {}", name, self.host.id());
        if self.host.become_method == "sudo" {
            // scp runs as the login user; stage and move into place as root
            let tmp = format!("/tmp/wm_{}", Uuid::new_v4());
            if let Err(e) = self.scp_send(&tmp, 0o600, content) {
                return Ok(Some(CmdError::new(self.host.id(), e)));
            }
            let cmd = format!(
                "\\mv {} {} && \\chmod 0{:o} {}",
                quoted(&tmp),
                quoted(name),
                perms & 0o777,
                quoted(name)
            );
            let (_, stderr, _) = self.run_shell(&cmd, &HashMap::new())?;
            if !stderr.is_empty() {
                return Ok(Some(CmdError::new(
                    self.host.id(),
                    String::from_utf8_lossy(&stderr).into_owned(),
                )));
            }
            return Ok(None);
        }
        if let Err(e) = self.scp_send(name, perms, content) {
            let cerr = CmdError::new(self.host.id(), e);
            error!("write file error for {} on {}: {}", name, self.host.id(), cerr);
            return Ok(Some(cerr));
        }
        Ok(None)
    }

    fn read_file(
        &mut self,
        name: &str,
    ) -> Result<(Option<FileInfo>, Option<Vec<u8>>, Option<CmdError>)> {
        debug!("read file {} on {}", name, self.host.id());
        if self.host.become_method == "sudo" {
            let tmp = format!("/tmp/wm_{}", Uuid::new_v4());
            let cmd = format!("\\cp {} {} && \\chmod a+r {}", quoted(name), quoted(&tmp), quoted(&tmp));
            let (_, stderr, _) = self.run_shell(&cmd, &HashMap::new())?;
            if not_found(&stderr) {
                return Ok((None, None, None));
            }
            if !stderr.is_empty() {
                return Ok((
                    None,
                    None,
                    Some(CmdError::new(
                        self.host.id(),
                        String::from_utf8_lossy(&stderr).into_owned(),
                    )),
                ));
            }
            let ret = match self.scp_recv(&tmp) {
                Ok((mut fi, data)) => {
                    fi.name = Path::new(name)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| name.to_string());
                    (Some(fi), Some(data), None)
                }
                Err(e) => (None, None, Some(CmdError::new(self.host.id(), e))),
            };
            let _ = self.run_shell(&format!("\\rm -f {}", quoted(&tmp)), &HashMap::new());
            return Ok(ret);
        }
        match self.scp_recv(name) {
            Ok((fi, data)) => {
                debug!("received {} bytes", data.len());
                Ok((Some(fi), Some(data), None))
            }
            Err(e) => {
                debug!("read error: {}", e);
                if not_found(e.as_bytes()) {
                    return Ok((None, None, None));
                }
                Ok((None, None, Some(CmdError::new(self.host.id(), e))))
            }
        }
    }

    fn run(&mut self, cmd: &str, env: &HashMap<String, String>) -> Result<CommandOutput> {
        let (stdout, stderr, exit_code) = self.run_shell(cmd, env)?;
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn file_info(
        &mut self,
        path: &str,
    ) -> Result<(FileOwner, Option<FileInfo>, Option<CmdError>)> {
        let cmd = format!(
            "\\stat -c \"%s %f %u %U %g %G %X %Y %Z %n\" {}",
            quoted(path)
        );
        let (stdout, stderr, _) = self.run_shell(&cmd, &HashMap::new())?;
        if !stderr.is_empty() {
            debug!("stat err: {}", String::from_utf8_lossy(&stderr));
            if not_found(&stderr) {
                return Ok((FileOwner::default(), None, None));
            }
        }
        let text = String::from_utf8_lossy(&stdout).into_owned();
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() < 10 {
            return Ok((
                FileOwner::default(),
                None,
                Some(CmdError::new(self.host.id(), "Cannot get file info")),
            ));
        }
        let size = words[0].parse().unwrap_or(0);
        let mode = u32::from_str_radix(words[1], 16).unwrap_or(0);
        let owner = FileOwner {
            owner_id: words[2].to_string(),
            owner_name: words[3].to_string(),
            group_id: words[4].to_string(),
            group_name: words[5].to_string(),
        };
        let mtime = words[7].parse().unwrap_or(0);
        let info = FileInfo {
            name: words[9..].join(" "),
            size,
            mode,
            mtime,
            dir: mode & 0o170000 == 0o040000,
        };
        Ok((owner, Some(info), None))
    }

    fn mkdir(&mut self, path: &str) -> Result<Option<CmdError>> {
        let (_, stderr, _) = self.run_shell(&format!("\\mkdir -p {}", quoted(path)), &HashMap::new())?;
        if !stderr.is_empty() {
            return Ok(Some(CmdError::new(
                self.host.id(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )));
        }
        Ok(None)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> Result<Option<CmdError>> {
        let (_, stderr, _) = self.run_shell(
            &format!("\\chmod 0{:o} {}", mode & 0o7777, quoted(path)),
            &HashMap::new(),
        )?;
        if !stderr.is_empty() {
            return Ok(Some(CmdError::new(
                self.host.id(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )));
        }
        Ok(None)
    }

    fn chown(&mut self, path: &str, user: &str, group: &str) -> Result<Option<CmdError>> {
        let spec = if !user.is_empty() && !group.is_empty() {
            format!("{}:{}", user, group)
        } else if !user.is_empty() {
            user.to_string()
        } else if !group.is_empty() {
            format!(":{}", group)
        } else {
            return Ok(None);
        };
        let (_, stderr, _) =
            self.run_shell(&format!("\\chown {} {}", spec, quoted(path)), &HashMap::new())?;
        if !stderr.is_empty() {
            return Ok(Some(CmdError::new(
                self.host.id(),
                String::from_utf8_lossy(&stderr).into_owned(),
            )));
        }
        Ok(None)
    }

    fn close(&mut self) {
        debug!("close session to {}", self.host.id());
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sudo_here_doc() {
        let host = Host {
            become_method: "sudo".into(),
            ..Host::default()
        };
        let cmd = become_cmd(&host, "systemctl restart nginx");
        assert!(cmd.starts_with("sudo -s --<<"));
        assert!(cmd.contains("\nsystemctl restart nginx\n"));
        let delim = cmd
            .lines()
            .next()
            .unwrap()
            .trim_start_matches("sudo -s --<<")
            .to_string();
        assert_eq!(cmd.lines().last().unwrap(), delim);
    }

    #[test]
    fn no_become_leaves_command_alone() {
        let host = Host::default();
        assert_eq!(become_cmd(&host, "uptime"), "uptime");
    }

    #[test]
    fn stat_line_parses() {
        let line = "1024 41ed 0 root 0 root 1700000000 1700000100 1700000200 /etc/some dir";
        let words: Vec<&str> = line.split_whitespace().collect();
        assert!(words.len() > 9);
        let mode = u32::from_str_radix(words[1], 16).unwrap();
        assert_eq!(mode & 0o170000, 0o040000);
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(words[9..].join(" "), "/etc/some dir");
    }
}
