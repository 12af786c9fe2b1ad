//! The remote service: wire requests mapped onto host operations.
//!
//! Errors partition strictly: transport faults propagate as RPC errors,
//! command failures travel in the reply's error field. Never both.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{CmdError, Error, Result};
use crate::host::FileDesc;
use crate::proto::{Reply, WriteSource};
use crate::session::get_host_and_session;

/// How often `wait_host` retries the dial.
const WAIT_HOST_POLL: Duration = Duration::from_secs(10);

pub fn command(session_id: &str, host_id: &str, command: &str) -> Result<Reply> {
    debug!("received cmd request for {}", host_id);
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let out = host.run_cmd(&mut host.new_ctx(), &session, command, &HashMap::new())?;
    Ok(Reply::CommandOut {
        stdout: out.stdout,
        stderr: out.stderr,
        exit_code: out.exit_code,
    })
}

pub fn read_file(session_id: &str, host_id: &str, file: &str) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let (info, data, error) = host.read_file(&mut host.new_ctx(), &session, file)?;
    Ok(Reply::ReadOut {
        info,
        data: data.unwrap_or_default(),
        error,
    })
}

/// Renders a template against a JSON data tree. Render problems are command
/// errors, not infrastructure errors.
pub fn render_template(template: &str, data: &[u8]) -> Result<std::result::Result<String, CmdError>> {
    let tree: serde_json::Value = if data.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(data)?
    };
    let env = minijinja::Environment::new();
    match env.render_str(template, minijinja::Value::from_serialize(&tree)) {
        Ok(out) => Ok(Ok(out)),
        Err(e) => Ok(Err(CmdError::new(
            String::new(),
            format!("error running template: {}", e),
        ))),
    }
}

pub fn write_file(
    session_id: &str,
    host_id: &str,
    name: &str,
    perms: u32,
    source: WriteSource,
    only_if_different: bool,
) -> Result<Reply> {
    debug!("write file {} on {}", name, host_id);
    let (session, host) = get_host_and_session(session_id, host_id)?;

    let data = match source {
        WriteSource::Data(data) => data,
        WriteSource::Template { template, data } => match render_template(&template, &data)? {
            Ok(out) => out.into_bytes(),
            Err(error) => {
                return Ok(Reply::WriteOut {
                    modified: false,
                    error: Some(error),
                })
            }
        },
    };

    if only_if_different {
        debug!("checking if the file changed");
        let (_, old, _) = host.read_file(&mut host.new_ctx(), &session, name)?;
        if old.as_deref() == Some(data.as_slice()) {
            debug!("file did not change");
            return Ok(Reply::WriteOut {
                modified: false,
                error: None,
            });
        }
    }

    debug!("writing {} bytes", data.len());
    if let Some(error) = host.write_file(&mut host.new_ctx(), &session, name, perms, &data)? {
        info!("command error: {}", error);
        return Ok(Reply::WriteOut {
            modified: false,
            error: Some(error),
        });
    }
    Ok(Reply::WriteOut {
        modified: true,
        error: None,
    })
}

pub fn copy_file(
    session_id: &str,
    from_host: &str,
    from_path: &str,
    to_host: &str,
    to_path: &str,
    only_if_different: bool,
) -> Result<Reply> {
    debug!("copy {}:{} to {}:{}", from_host, from_path, to_host, to_path);
    let (session, src) = get_host_and_session(session_id, from_host)?;
    let (_, dst) = get_host_and_session(session_id, to_host)?;

    let (info, data, error) = src.read_file(&mut src.new_ctx(), &session, from_path)?;
    if let Some(error) = error {
        return Ok(Reply::CopyOut {
            changed: false,
            error: Some(error),
        });
    }
    let (info, data) = match (info, data) {
        (Some(info), Some(data)) => (info, data),
        _ => {
            let msg = format!("File does not exist: {}:{}", from_host, from_path);
            error!("{}", msg);
            return Ok(Reply::CopyOut {
                changed: false,
                error: Some(CmdError::new(src.id(), msg)),
            });
        }
    };

    if only_if_different {
        let (_, old, cerr) = dst.read_file(&mut dst.new_ctx(), &session, to_path)?;
        if let Some(cerr) = cerr {
            debug!("error reading dest file: {}", cerr);
        } else if old.as_deref() == Some(data.as_slice()) {
            debug!("file will not change");
            return Ok(Reply::CopyOut {
                changed: false,
                error: None,
            });
        }
    }

    if let Some(error) = dst.write_file(&mut dst.new_ctx(), &session, to_path, info.mode, &data)? {
        return Ok(Reply::CopyOut {
            changed: false,
            error: Some(error),
        });
    }
    Ok(Reply::CopyOut {
        changed: true,
        error: None,
    })
}

/// Polls the host until a connection succeeds or the timeout elapses.
pub fn wait_host(session_id: &str, host_id: &str, timeout_ms: u64) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut ctx = host.new_ctx();
    loop {
        debug!("waiting for host {}", host.id());
        if Instant::now() > deadline {
            return Err(Error::WaitTimeout(host.id().to_string()));
        }
        match ctx.new(&session) {
            Ok(_) => {
                ctx.close();
                return Ok(Reply::Empty);
            }
            Err(e) => debug!("err: {}", e),
        }
        std::thread::sleep(WAIT_HOST_POLL);
    }
}

pub fn get_file_info(session_id: &str, host_id: &str, path: &str) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let (owner, info, error) = host.get_file_info(&mut host.new_ctx(), &session, path)?;
    Ok(Reply::FileInfoOut {
        owner,
        info,
        error,
    })
}

pub fn mkdir(session_id: &str, host_id: &str, path: &str) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let error = host.mkdir(&mut host.new_ctx(), &session, path)?;
    Ok(Reply::OsOut { error })
}

pub fn chmod(session_id: &str, host_id: &str, path: &str, mode: u32) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let error = host.chmod(&mut host.new_ctx(), &session, path, mode)?;
    Ok(Reply::OsOut { error })
}

pub fn chown(
    session_id: &str,
    host_id: &str,
    path: &str,
    user: &str,
    group: &str,
) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let error = host.chown(&mut host.new_ctx(), &session, path, user, group)?;
    Ok(Reply::OsOut { error })
}

pub fn ensure(session_id: &str, host_id: &str, path: &str, desc: &FileDesc) -> Result<Reply> {
    let (session, host) = get_host_and_session(session_id, host_id)?;
    let (changed, error) = host.ensure(&mut host.new_ctx(), &session, path, desc)?;
    Ok(Reply::EnsureOut { changed, error })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_renders_against_json() {
        let out = render_template("hello {{ name }}", br#"{"name":"world"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn template_parse_error_is_a_command_error() {
        let err = render_template("{% bogus", b"")
            .unwrap()
            .unwrap_err();
        assert!(err.msg.contains("template"));
    }
}
