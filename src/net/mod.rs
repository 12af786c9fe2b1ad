//! Framed message transport.
//!
//! The network protocol works as follows:
//! - send a [`FrameHeader`] serialized with bincode with fixed-int encoding
//! - send the bincode-serialized message
//!
//! Connections are plain TCP; every frame is self-contained, so a single
//! stream can carry an arbitrary request/reply conversation.

use std::io::{Read, Write};
use std::net::TcpStream;

use bincode::config::{Configuration, Fixint, LittleEndian};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proto::{Reply, Request};

/// Configuration of the header serializer: the integers must have a fixed
/// length encoding.
static HEADER_CONFIG: Lazy<Configuration<LittleEndian, Fixint>> =
    Lazy::new(|| bincode::config::standard().with_fixed_int_encoding());

static MSG_CONFIG: Lazy<Configuration> = Lazy::new(bincode::config::standard);

pub(crate) const HEADER_SIZE: usize = 4;

/// Header sent before the actual message.
#[derive(Serialize, Deserialize, Default)]
struct FrameHeader {
    /// The size of the actual message.
    size: u32,
}

/// Serialize and send one message on the stream.
pub fn send_msg<T: Serialize, W: Write>(writer: &mut W, msg: &T) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(msg, *MSG_CONFIG)?;
    let header = bincode::serde::encode_to_vec(
        &FrameHeader {
            size: payload.len() as u32,
        },
        *HEADER_CONFIG,
    )?;
    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Receive one message from the stream. An EOF before the header is an
/// ordinary `Io` error; callers treat it as the peer going away.
pub fn recv_msg<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let (header, _): (FrameHeader, usize) =
        bincode::serde::decode_from_slice(&header, *HEADER_CONFIG)?;
    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload)?;
    let (msg, _) = bincode::serde::decode_from_slice(&payload, *MSG_CONFIG)?;
    Ok(msg)
}

/// A small pool of request/reply connections to one address.
///
/// Every call takes an idle connection (or dials a new one), runs one
/// request/reply exchange on it, and returns it to the pool. Concurrent
/// callers therefore get concurrent connections instead of queueing behind
/// each other. A connection that fails mid-exchange is dropped, not
/// returned.
pub struct ConnPool {
    addr: String,
    idle: Mutex<Vec<TcpStream>>,
}

impl ConnPool {
    pub fn new(addr: impl Into<String>) -> ConnPool {
        ConnPool {
            addr: addr.into(),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn take(&self) -> Result<TcpStream> {
        if let Some(stream) = self.idle.lock().pop() {
            return Ok(stream);
        }
        Ok(TcpStream::connect(&self.addr)?)
    }

    /// One request/reply exchange. A [`Reply::Error`] frame is surfaced as
    /// [`Error::Remote`].
    pub fn call(&self, req: &Request) -> Result<Reply> {
        let mut stream = self.take()?;
        send_msg(&mut stream, req)?;
        let reply: Reply = recv_msg(&mut stream)?;
        self.idle.lock().push(stream);
        match reply {
            Reply::Error { msg } => Err(Error::Remote(msg)),
            reply => Ok(reply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size() {
        let encoded =
            bincode::serde::encode_to_vec(FrameHeader::default(), *HEADER_CONFIG).unwrap();
        assert_eq!(HEADER_SIZE, encoded.len());
    }

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        let req = Request::Print {
            session: "s-1".into(),
            msg: "hello".into(),
        };
        send_msg(&mut buf, &req).unwrap();
        let got: Request = recv_msg(&mut buf.as_slice()).unwrap();
        match got {
            Request::Print { session, msg } => {
                assert_eq!(session, "s-1");
                assert_eq!(msg, "hello");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
