//! SSH dialing.
//!
//! A process-wide mutex serialises handshakes: concurrent dials through
//! libssh2 have proven unsafe. Once a client is established, distinct
//! clients can be used concurrently.
//!
//! Bastion hosts are traversed recursively. The hop is carried over a
//! `direct-tcpip` channel bridged to a loopback listener by a pump thread,
//! because a channel cannot be handed to libssh2 as a session transport
//! directly. A visited set of `host:port` keys rejects cyclic bastion
//! graphs.

mod keys;

pub use keys::RawPrivateKey;

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::host::Host;

static DIAL_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// An established SSH client.
pub struct Client {
    pub sess: ssh2::Session,
}

impl Client {
    pub fn close(&mut self) {
        let _ = self.sess.disconnect(None, "closing", None);
    }
}

/// Dials the host, traversing bastions as needed.
pub fn dial(dest: &Arc<Host>) -> Result<Client> {
    let _guard = DIAL_LOCK.lock();
    dial_inner(dest, &mut HashSet::new())
}

fn dial_inner(dest: &Arc<Host>, cycle: &mut HashSet<String>) -> Result<Client> {
    debug!("dial {}", dest.host_and_port());
    if !cycle.insert(dest.host_and_port()) {
        return Err(Error::CyclicHosts);
    }

    let tcp = match &dest.bastion {
        Some(bastion) => {
            debug!("dest {} via {}", dest.host_and_port(), bastion.host_and_port());
            let via = dial_inner(bastion, cycle)?;
            let port = if dest.port == 0 { 22 } else { dest.port };
            let channel = via.sess.channel_direct_tcpip(&dest.hostname, port, None)?;
            let addr = forward_through(via, channel)?;
            TcpStream::connect(addr)?
        }
        None => {
            let addr = dest
                .host_and_port()
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| Error::InvalidHost(dest.id().to_string()))?;
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?
        }
    };

    let mut sess = ssh2::Session::new()?;
    sess.set_tcp_stream(tcp);
    sess.handshake()?;
    authenticate(&sess, dest)?;
    Ok(Client { sess })
}

fn login_user(host: &Host) -> String {
    if host.login_user.is_empty() {
        whoami::username()
    } else {
        host.login_user.clone()
    }
}

/// Key auth first, then password, then the agent.
fn authenticate(sess: &ssh2::Session, host: &Arc<Host>) -> Result<()> {
    let user = login_user(host);
    if let Some(key) = &host.key_auth {
        let (pem, passphrase) = key.material()?;
        match sess.userauth_pubkey_memory(&user, None, &pem, passphrase.as_deref()) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if passphrase.is_none() && pem.contains("ENCRYPTED") {
                    let passphrase = key.ask_passphrase();
                    sess.userauth_pubkey_memory(&user, None, &pem, Some(&passphrase))?;
                    return Ok(());
                }
                if host.login_password.is_empty() {
                    return Err(e.into());
                }
            }
        }
    }
    if !host.login_password.is_empty() {
        sess.userauth_password(&user, &host.login_password)?;
        return Ok(());
    }
    if !sess.authenticated() {
        sess.userauth_agent(&user)?;
    }
    Ok(())
}

/// Binds a loopback listener and pumps bytes between the single accepted
/// connection and the bastion channel. The pump thread owns the bastion
/// client so it stays alive as long as the hop is in use.
fn forward_through(via: Client, channel: ssh2::Channel) -> Result<std::net::SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let addr = listener.local_addr()?;
    via.sess.set_blocking(false);
    std::thread::Builder::new()
        .name("ssh-forward".to_string())
        .spawn(move || {
            let _via = via;
            if let Ok((stream, _)) = listener.accept() {
                pump(stream, channel);
            }
        })?;
    Ok(addr)
}

/// Single-threaded bidirectional copy; both ends are non-blocking and are
/// polled in turn.
fn pump(tcp: TcpStream, mut channel: ssh2::Channel) {
    if tcp.set_nonblocking(true).is_err() {
        return;
    }
    let mut tcp = tcp;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let mut idle = true;
        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                idle = false;
                if write_all_retrying(&mut tcp, &buf[..n]).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        match tcp.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                idle = false;
                if write_all_retrying(&mut channel, &buf[..n]).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }
        if idle {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    let _ = channel.close();
}

fn write_all_retrying<W: Write>(w: &mut W, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match w.write(data) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostInfo;

    #[test]
    fn cyclic_bastions_are_rejected_before_dialing() {
        // a -> b -> a; the visited set trips before any socket is opened
        let a_again = Arc::new(Host {
            info: HostInfo {
                id: "a".into(),
                ..HostInfo::default()
            },
            hostname: "a.example".into(),
            ..Host::default()
        });
        let b = Arc::new(Host {
            info: HostInfo {
                id: "b".into(),
                ..HostInfo::default()
            },
            hostname: "b.example".into(),
            bastion: Some(a_again),
            ..Host::default()
        });
        let a = Arc::new(Host {
            info: HostInfo {
                id: "a".into(),
                ..HostInfo::default()
            },
            hostname: "a.example".into(),
            bastion: Some(b),
            ..Host::default()
        });
        assert!(matches!(dial(&a), Err(Error::CyclicHosts)));
    }
}
