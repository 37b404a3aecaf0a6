//! Length-framed JSON transport over TCP, optionally TLS-wrapped.
//!
//! A frame is a 4-byte big-endian payload length followed by that many bytes
//! of UTF-8 JSON. Raw file bytes on transfer channels bypass the framing and
//! go through the bulk copy helpers below.

use crate::protocol::{ErrorCode, MAX_FRAME_SIZE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::trace;

const BULK_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StreamError::Closed | StreamError::Transport(_) => ErrorCode::TransportError,
            StreamError::Protocol(_) => ErrorCode::ProtocolError,
        }
    }

    /// True when a socket read deadline expired rather than the peer failing.
    pub fn is_timeout(&self) -> bool {
        match self {
            StreamError::Transport(e) => {
                matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
            }
            _ => false,
        }
    }
}

/// A control or transfer channel: plain TCP or one side of a TLS stream.
pub enum Chan {
    Plain(TcpStream),
    TlsServer(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
    TlsClient(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Chan {
    fn tcp(&self) -> &TcpStream {
        match self {
            Chan::Plain(s) => s,
            Chan::TlsServer(s) => &s.sock,
            Chan::TlsClient(s) => &s.sock,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }

    pub fn shutdown(&self) {
        let _ = self.tcp().shutdown(std::net::Shutdown::Both);
    }
}

impl Read for Chan {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Chan::Plain(s) => s.read(buf),
            Chan::TlsServer(s) => s.read(buf),
            Chan::TlsClient(s) => s.read(buf),
        }
    }
}

impl Write for Chan {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Chan::Plain(s) => s.write(buf),
            Chan::TlsServer(s) => s.write(buf),
            Chan::TlsClient(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Chan::Plain(s) => s.flush(),
            Chan::TlsServer(s) => s.flush(),
            Chan::TlsClient(s) => s.flush(),
        }
    }
}

/// Frame reader/writer over a [`Chan`].
pub struct FrameStream {
    chan: Chan,
}

impl FrameStream {
    pub fn new(chan: Chan) -> FrameStream {
        FrameStream { chan }
    }

    pub fn chan(&self) -> &Chan {
        &self.chan
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.chan.peer_addr()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.chan.set_read_timeout(timeout)
    }

    pub fn shutdown(&self) {
        self.chan.shutdown()
    }

    /// Serialize `msg` and write it as one frame.
    pub fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), StreamError> {
        let payload =
            serde_json::to_vec(msg).map_err(|e| StreamError::Protocol(e.to_string()))?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(StreamError::Protocol(format!(
                "frame payload too large: {} bytes (max: {})",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        trace!(target: "wire", len = payload.len(), json = %String::from_utf8_lossy(&payload), ">>");
        let header = (payload.len() as u32).to_be_bytes();
        self.chan.write_all(&header)?;
        self.chan.write_all(&payload)?;
        self.chan.flush()?;
        Ok(())
    }

    /// Read one frame and deserialize it.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T, StreamError> {
        let mut header = [0u8; 4];
        read_exact_or_closed(&mut self.chan, &mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(StreamError::Protocol(format!(
                "frame payload too large: {len} bytes (max: {MAX_FRAME_SIZE})"
            )));
        }
        let mut payload = vec![0u8; len];
        if len > 0 {
            read_exact_or_closed(&mut self.chan, &mut payload)?;
        }
        trace!(target: "wire", len, json = %String::from_utf8_lossy(&payload), "<<");
        serde_json::from_slice(&payload).map_err(|e| StreamError::Protocol(e.to_string()))
    }

    /// Stream exactly `len` raw bytes from `src` onto the wire.
    pub fn copy_from_reader<R: Read>(&mut self, src: &mut R, len: u64) -> Result<u64, StreamError> {
        let mut buf = vec![0u8; BULK_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = src.read(&mut buf[..want])?;
            if n == 0 {
                return Err(StreamError::Protocol(format!(
                    "source ended {remaining} bytes early"
                )));
            }
            self.chan.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        self.chan.flush()?;
        Ok(len)
    }

    /// Read exactly `len` raw bytes off the wire into `dst`.
    pub fn copy_to_writer<W: Write>(&mut self, dst: &mut W, len: u64) -> Result<u64, StreamError> {
        let mut buf = vec![0u8; BULK_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.chan.read(&mut buf[..want])?;
            if n == 0 {
                return Err(StreamError::Closed);
            }
            dst.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        Ok(len)
    }

    /// Read and drop `len` raw bytes (receiver-side skip).
    pub fn discard(&mut self, len: u64) -> Result<(), StreamError> {
        let mut sink = io::sink();
        self.copy_to_writer(&mut sink, len)?;
        Ok(())
    }
}

fn read_exact_or_closed(chan: &mut Chan, buf: &mut [u8]) -> Result<(), StreamError> {
    match chan.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(StreamError::Closed),
        Err(e) => Err(StreamError::Transport(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PingReply, Request};
    use std::net::TcpListener;
    use std::thread;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn frame_roundtrip() {
        let (a, b) = tcp_pair();
        let mut tx = FrameStream::new(Chan::Plain(a));
        let mut rx = FrameStream::new(Chan::Plain(b));

        tx.send(&Request::new("ping")).unwrap();
        let req: Request = rx.recv().unwrap();
        assert_eq!(req.api, "ping");

        rx.send(&PingReply { echo: "ping".into(), time_ms: 1 }).unwrap();
        let reply: PingReply = tx.recv().unwrap();
        assert_eq!(reply.echo, "ping");
    }

    #[test]
    fn oversized_frame_rejected() {
        let (a, b) = tcp_pair();
        let mut tx = Chan::Plain(a);
        let mut rx = FrameStream::new(Chan::Plain(b));

        // Hand-write a header promising more than MAX_FRAME_SIZE
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        tx.write_all(&header).unwrap();
        let res: Result<Request, _> = rx.recv();
        assert!(matches!(res, Err(StreamError::Protocol(_))));
    }

    #[test]
    fn closed_peer_reports_closed() {
        let (a, b) = tcp_pair();
        drop(a);
        let mut rx = FrameStream::new(Chan::Plain(b));
        let res: Result<Request, _> = rx.recv();
        assert!(matches!(res, Err(StreamError::Closed)));
    }

    #[test]
    fn bulk_copy_roundtrip() {
        let (a, b) = tcp_pair();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let sender = thread::spawn(move || {
            let mut tx = FrameStream::new(Chan::Plain(a));
            let mut src = io::Cursor::new(payload);
            tx.copy_from_reader(&mut src, 200_000).unwrap();
        });

        let mut rx = FrameStream::new(Chan::Plain(b));
        let mut out = Vec::new();
        rx.copy_to_writer(&mut out, 200_000).unwrap();
        sender.join().unwrap();
        assert_eq!(out, expected);
    }
}
