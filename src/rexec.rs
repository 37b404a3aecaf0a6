//! Remote execution: a subprocess whose stdio is bridged over one dedicated
//! TCP connection. Outbound traffic is tagged frames (stdout/stderr/exit);
//! inbound bytes are fed to the subprocess's stdin as-is. When the client
//! goes away the subprocess is killed.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TAG_STDOUT: u8 = 1;
pub const TAG_STDERR: u8 = 2;
pub const TAG_EXIT: u8 = 3;

const ACCEPT_WINDOW: Duration = Duration::from_secs(30);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const WAIT_POLL: Duration = Duration::from_millis(100);
const PUMP_BUF_SIZE: usize = 8 * 1024;

/// Write one tagged frame: tag byte, 4-byte big-endian length, payload.
pub fn write_frame<W: Write>(w: &mut W, tag: u8, payload: &[u8]) -> std::io::Result<()> {
    w.write_all(&[tag])?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    w.flush()
}

/// Read one tagged frame. Returns `None` on a clean EOF at a frame boundary.
pub fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Option<(u8, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    match r.read_exact(&mut tag) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(Some((tag[0], payload)))
}

/// The shell used by `rshell` when the server has nothing configured.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Allocate a rexec endpoint running `cmd` under the shell. Returns the port.
pub fn spawn_endpoint(bind_ip: IpAddr, peer_ip: IpAddr, cmd: String) -> Result<u16> {
    let listener = TcpListener::bind((bind_ip, 0)).context("bind rexec endpoint")?;
    listener.set_nonblocking(true).context("rexec nonblocking")?;
    let port = listener.local_addr()?.port();

    thread::Builder::new().name("rexec".into()).spawn(move || {
        let Some(stream) = accept_one(&listener, peer_ip) else {
            return;
        };
        if let Err(e) = serve(stream, &cmd) {
            warn!(error = %e, "rexec endpoint failed");
        }
    })?;
    Ok(port)
}

fn accept_one(listener: &TcpListener, peer_ip: IpAddr) -> Option<TcpStream> {
    let deadline = Instant::now() + ACCEPT_WINDOW;
    loop {
        if Instant::now() >= deadline {
            return None;
        }
        match listener.accept() {
            Ok((sock, peer)) => {
                if peer.ip() != peer_ip {
                    warn!(%peer, expected = %peer_ip, "dropping rexec peer mismatch");
                    continue;
                }
                let _ = sock.set_nonblocking(false);
                return Some(sock);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "rexec accept failed");
                return None;
            }
        }
    }
}

fn serve(stream: TcpStream, cmd: &str) -> Result<()> {
    info!(cmd, "starting rexec subprocess");
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            // Command not spawnable: report the classic shell exit code
            let mut w = stream;
            write_frame(&mut w, TAG_EXIT, &127i32.to_be_bytes())?;
            return Err(e).context("spawn subprocess");
        }
    };

    let stdout = child.stdout.take().context("child stdout")?;
    let stderr = child.stderr.take().context("child stderr")?;
    let mut stdin = child.stdin.take().context("child stdin")?;

    let writer = Arc::new(Mutex::new(stream.try_clone().context("clone rexec socket")?));
    let client_gone = Arc::new(AtomicBool::new(false));

    let out_pump = spawn_pump("rexec-stdout", stdout, TAG_STDOUT, Arc::clone(&writer))?;
    let err_pump = spawn_pump("rexec-stderr", stderr, TAG_STDERR, Arc::clone(&writer))?;

    // Inbound bytes go to the subprocess's stdin
    let gone = Arc::clone(&client_gone);
    let mut inbound = stream.try_clone().context("clone rexec socket")?;
    let stdin_pump = thread::Builder::new().name("rexec-stdin".into()).spawn(move || {
        let mut buf = [0u8; PUMP_BUF_SIZE];
        loop {
            match inbound.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = stdin.flush();
                }
            }
        }
        gone.store(true, Ordering::Relaxed);
        // Dropping stdin closes the pipe; an interactive shell sees EOF
    })?;

    let status = wait_child(&mut child, &client_gone);
    // Flush remaining output before announcing the exit
    let _ = out_pump.join();
    let _ = err_pump.join();

    let code = status.unwrap_or(-1);
    debug!(code, "rexec subprocess finished");
    {
        let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = write_frame(&mut *w, TAG_EXIT, &code.to_be_bytes());
    }
    let _ = stream.shutdown(std::net::Shutdown::Both);
    let _ = stdin_pump.join();
    Ok(())
}

fn spawn_pump<R: Read + Send + 'static>(
    name: &str,
    mut src: R,
    tag: u8,
    writer: Arc<Mutex<TcpStream>>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name.into()).spawn(move || {
        let mut buf = [0u8; PUMP_BUF_SIZE];
        loop {
            match src.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut w = writer.lock().unwrap_or_else(|e| e.into_inner());
                    if write_frame(&mut *w, tag, &buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Poll the child until it exits. Once the client is gone the child gets a
/// short grace to finish reacting to its closed stdin, then is killed.
fn wait_child(child: &mut Child, client_gone: &AtomicBool) -> Option<i32> {
    let mut gone_since: Option<Instant> = None;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) => {
                if client_gone.load(Ordering::Relaxed) {
                    let since = *gone_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= Duration::from_secs(2) {
                        let _ = child.kill();
                        return child.wait().ok().and_then(|s| s.code());
                    }
                }
            }
            Err(_) => return None,
        }
        thread::sleep(WAIT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, TAG_STDOUT, b"hello").unwrap();
        write_frame(&mut buf, TAG_EXIT, &0i32.to_be_bytes()).unwrap();

        let mut r = Cursor::new(buf);
        let (tag, payload) = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(tag, TAG_STDOUT);
        assert_eq!(payload, b"hello");
        let (tag, payload) = read_frame(&mut r).unwrap().unwrap();
        assert_eq!(tag, TAG_EXIT);
        assert_eq!(i32::from_be_bytes(payload.try_into().unwrap()), 0);
        assert!(read_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, TAG_STDOUT, b"hello").unwrap();
        buf.truncate(3);
        let mut r = Cursor::new(buf);
        assert!(read_frame(&mut r).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn endpoint_runs_a_command() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let port = spawn_endpoint(ip, ip, "printf out; printf err >&2; exit 3".into()).unwrap();
        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code = None;
        while let Some((tag, payload)) = read_frame(&mut sock).unwrap() {
            match tag {
                TAG_STDOUT => out.extend_from_slice(&payload),
                TAG_STDERR => err.extend_from_slice(&payload),
                TAG_EXIT => {
                    code = Some(i32::from_be_bytes(payload.try_into().unwrap()));
                    break;
                }
                _ => panic!("unexpected tag {tag}"),
            }
        }
        assert_eq!(out, b"out");
        assert_eq!(err, b"err");
        assert_eq!(code, Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn stdin_reaches_the_subprocess() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let port = spawn_endpoint(ip, ip, "cat".into()).unwrap();
        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        sock.write_all(b"echoed\n").unwrap();
        sock.shutdown(std::net::Shutdown::Write).unwrap();

        let mut out = Vec::new();
        let mut code = None;
        while let Some((tag, payload)) = read_frame(&mut sock).unwrap() {
            match tag {
                TAG_STDOUT => out.extend_from_slice(&payload),
                TAG_EXIT => {
                    code = Some(i32::from_be_bytes(payload.try_into().unwrap()));
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(out, b"echoed\n");
        assert_eq!(code, Some(0));
    }
}
