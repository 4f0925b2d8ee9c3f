//! Device protocol framing (u16 length prefix + JSON).

mod messages;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use messages::{ClientMessage, ConnParams, Notification, ServerMessage};

/// Length prefix: big-endian u16, so a frame body is at most 64 KiB - 1.
pub const FRAME_HEADER_LEN: usize = 2;
pub const MAX_FRAME_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame too large: max {MAX_FRAME_BYTES} got {got_bytes}")]
    FrameTooLarge { got_bytes: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the failure is a missed socket deadline rather than a broken
    /// connection or a bad frame.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

/// A device connection the session loop can drive with per-operation
/// deadlines. Implemented for plain TCP and for TLS-wrapped streams.
pub trait DeviceConn: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
    fn peer_addr(&self) -> std::io::Result<SocketAddr>;
}

impl DeviceConn for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<T: DeviceConn + ?Sized> DeviceConn for Box<T> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        (**self).set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        (**self).set_write_timeout(timeout)
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

impl DeviceConn for rustls::StreamOwned<rustls::ServerConnection, TcpStream> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_read_timeout(timeout)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.sock.set_write_timeout(timeout)
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.sock.peer_addr()
    }
}

/// Framed JSON conversation over one device connection.
///
/// Every read and write arms the socket deadline first; the session loop
/// never waits on the wire longer than the exchange timeout.
pub struct ProtoConn<C> {
    conn: C,
    timeout: Duration,
}

impl<C: DeviceConn> ProtoConn<C> {
    pub fn new(conn: C, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T, FrameError> {
        self.conn.set_read_timeout(Some(self.timeout))?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        self.conn.read_exact(&mut header)?;
        let length = u16::from_be_bytes(header) as usize;

        let mut body = vec![0u8; length];
        self.conn.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn write_message<T: Serialize>(&mut self, msg: &T) -> Result<(), FrameError> {
        let body = serde_json::to_vec(msg)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(FrameError::FrameTooLarge {
                got_bytes: body.len(),
            });
        }

        self.conn.set_write_timeout(Some(self.timeout))?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
        frame.extend_from_slice(&body);
        self.conn.write_all(&frame)?;
        self.conn.flush()?;
        Ok(())
    }
}
