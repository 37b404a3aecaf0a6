//! Client core: the control connection, typed RPC helpers, discovery
//! shortcuts and the GET/PUT transfer drivers with progress reporting.

use crate::discover::Scanner;
use crate::protocol::{
    api, AuthParams, DecisionFrame, EntryKind, EntryOutcome, ErrorCode, FileEntry, FindParams,
    GetParams, LsParams, Manifest, OpenParams, OverwritePolicy, PathParams, PathsParams,
    PingReply, PutDecision, PutDecisionParams, PutParams, Request, Response, RexecParams,
    RexecTicket, SenderFrame, ServerDescriptor, SharingDescriptor, SrcDestParams, FileHeader,
    TransferOutcome, TransferTicket, TreeEntry, TreeParams,
};
use crate::rexec;
use crate::sharing;
use crate::stream::{Chan, FrameStream, StreamError};
use crate::tls;
use crate::transfer;
use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Remote(ErrorCode),
    #[error("connection lost: {0}")]
    Stream(#[from] StreamError),
    #[error("{0}")]
    Local(#[from] anyhow::Error),
}

impl ClientError {
    /// Connection-level failures end the interactive session; everything
    /// else is printed and the session continues.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, ClientError::Stream(_))
    }
}

type CResult<T> = Result<T, ClientError>;

/// Decides whether an existing file gets overwritten when the policy is
/// `prompt`.
pub type PromptFn<'a> = &'a mut dyn FnMut(&FileEntry) -> bool;

/// Client-side view of a finished transfer.
#[derive(Debug, Default, Clone)]
pub struct TransferStats {
    pub files_ok: u64,
    pub files_skipped: u64,
    pub files_err: u64,
    pub bytes_ok: u64,
    /// The sender/receiver outcome frame from the other side
    pub remote: Option<TransferOutcome>,
}

/// A control-channel connection to one server.
pub struct Connection {
    stream: FrameStream,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    seen_fingerprint: Arc<Mutex<Option<String>>>,
    pub show_progress: bool,
}

impl Connection {
    pub fn connect(host: &str, port: u16, ssl: bool) -> anyhow::Result<Connection> {
        let seen = Arc::new(Mutex::new(None));
        let tls_config =
            if ssl { Some(Arc::new(tls::client_config(Arc::clone(&seen)))) } else { None };
        let chan = open_chan(host, port, tls_config.as_ref())?;
        Ok(Connection {
            stream: FrameStream::new(chan),
            host: host.to_string(),
            port,
            ssl,
            tls_config,
            seen_fingerprint: seen,
            show_progress: true,
        })
    }

    /// Fingerprint of the certificate the server presented, once a TLS
    /// handshake has happened.
    pub fn fingerprint(&self) -> Option<String> {
        self.seen_fingerprint.lock().ok().and_then(|g| g.clone())
    }

    /// One strict request/response round-trip.
    pub fn call(&mut self, request: &Request) -> CResult<Response> {
        self.stream.send(request)?;
        let response: Response = self.stream.recv()?;
        if response.is_ok() {
            Ok(response)
        } else {
            Err(ClientError::Remote(response.error.unwrap_or(ErrorCode::ProtocolError)))
        }
    }

    fn call_data<D: serde::de::DeserializeOwned>(&mut self, request: &Request) -> CResult<D> {
        self.call(request)?.take_data().map_err(ClientError::Remote)
    }

    pub fn ping(&mut self, echo: &str) -> CResult<PingReply> {
        self.call_data(&Request::with_params(api::PING, serde_json::json!({ "echo": echo })))
    }

    pub fn info(&mut self) -> CResult<ServerDescriptor> {
        self.call_data(&Request::new(api::INFO))
    }

    pub fn list(&mut self) -> CResult<Vec<SharingDescriptor>> {
        self.call_data(&Request::new(api::LIST))
    }

    pub fn auth(&mut self, password: &str) -> CResult<()> {
        self.call(&Request::with_params(api::AUTH, AuthParams { password: password.into() }))?;
        Ok(())
    }

    pub fn open(&mut self, name: &str) -> CResult<()> {
        self.call(&Request::with_params(api::OPEN, OpenParams { name: name.into() }))?;
        Ok(())
    }

    pub fn close(&mut self) -> CResult<()> {
        self.call(&Request::new(api::CLOSE))?;
        Ok(())
    }

    pub fn rpwd(&mut self) -> CResult<String> {
        self.call_data(&Request::new(api::RPWD))
    }

    pub fn rcd(&mut self, path: Option<&str>) -> CResult<String> {
        self.call_data(&Request::with_params(
            api::RCD,
            PathParams { path: path.map(str::to_string) },
        ))
    }

    pub fn rls(&mut self, params: &LsParams) -> CResult<Vec<FileEntry>> {
        self.call_data(&Request::with_params(api::RLS, params))
    }

    pub fn rtree(&mut self, params: &TreeParams) -> CResult<Vec<TreeEntry>> {
        self.call_data(&Request::with_params(api::RTREE, params))
    }

    pub fn rmkdir(&mut self, path: &str) -> CResult<()> {
        self.call(&Request::with_params(api::RMKDIR, PathParams { path: Some(path.into()) }))?;
        Ok(())
    }

    pub fn rmv(&mut self, sources: Vec<String>, dest: &str) -> CResult<Vec<EntryOutcome>> {
        self.call_data(&Request::with_params(
            api::RMV,
            SrcDestParams { sources, dest: dest.into() },
        ))
    }

    pub fn rcp(&mut self, sources: Vec<String>, dest: &str) -> CResult<Vec<EntryOutcome>> {
        self.call_data(&Request::with_params(
            api::RCP,
            SrcDestParams { sources, dest: dest.into() },
        ))
    }

    pub fn rrm(&mut self, paths: Vec<String>) -> CResult<Vec<EntryOutcome>> {
        self.call_data(&Request::with_params(api::RRM, PathsParams { paths }))
    }

    pub fn rfind(&mut self, pattern: &str) -> CResult<Vec<FileEntry>> {
        self.call_data(&Request::with_params(
            api::RFIND,
            FindParams { pattern: pattern.into() },
        ))
    }

    /// Open the dedicated channel a transfer or rexec ticket points at.
    fn open_aux(&self, port: u16) -> CResult<FrameStream> {
        let chan = open_chan(&self.host, port, self.tls_config.as_ref())
            .map_err(ClientError::Local)?;
        Ok(FrameStream::new(chan))
    }

    /// Download `paths` into `dest_dir`, arbitrating local overwrites.
    pub fn get(
        &mut self,
        paths: Vec<String>,
        policy: OverwritePolicy,
        dest_dir: &Path,
        prompt: PromptFn,
    ) -> CResult<TransferStats> {
        let ticket: TransferTicket =
            self.call_data(&Request::with_params(api::GET, GetParams { paths, policy }))?;
        let mut chan = self.open_aux(ticket.port)?;

        let manifest: Manifest = chan.recv()?;
        let bar = self.progress_bar(manifest.total_bytes);
        let mut stats = TransferStats::default();

        // Directories and symlinks come straight from the manifest
        for entry in &manifest.files {
            let Some(target) = local_target(dest_dir, &entry.path) else {
                stats.files_err += 1;
                continue;
            };
            match entry.kind {
                EntryKind::Directory => {
                    let _ = fs::create_dir_all(&target);
                }
                EntryKind::Symlink => {
                    if let Some(link_target) = &entry.target {
                        #[cfg(unix)]
                        if fs::symlink_metadata(&target).is_err() {
                            if let Some(parent) = target.parent() {
                                let _ = fs::create_dir_all(parent);
                            }
                            let _ = std::os::unix::fs::symlink(link_target, &target);
                        }
                        #[cfg(not(unix))]
                        let _ = link_target;
                    }
                }
                EntryKind::File => {}
            }
        }

        loop {
            let frame: SenderFrame = chan.recv()?;
            let header = match frame {
                SenderFrame::Header(h) => h,
                SenderFrame::Outcome(outcome) => {
                    stats.remote = Some(outcome);
                    break;
                }
            };
            let Some(entry) = manifest.files.get(header.idx) else {
                return Err(ClientError::Stream(StreamError::Protocol(format!(
                    "file header for unknown index {}",
                    header.idx
                ))));
            };
            self.receive_entry(&mut chan, dest_dir, entry, &header, policy, prompt, &mut stats)?;
            if let Some(bar) = &bar {
                bar.inc(header.len);
            }
        }
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn receive_entry(
        &mut self,
        chan: &mut FrameStream,
        dest_dir: &Path,
        entry: &FileEntry,
        header: &FileHeader,
        policy: OverwritePolicy,
        prompt: PromptFn,
        stats: &mut TransferStats,
    ) -> CResult<()> {
        let Some(target) = local_target(dest_dir, &entry.path) else {
            chan.discard(header.len)?;
            stats.files_err += 1;
            return Ok(());
        };
        if !overwrite_locally(&target, entry, policy, prompt) {
            chan.discard(header.len)?;
            stats.files_skipped += 1;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let mut file = match File::create(&target) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %target.display(), error = %e, "cannot write, skipping");
                chan.discard(header.len)?;
                stats.files_err += 1;
                return Ok(());
            }
        };
        chan.copy_to_writer(&mut file, header.len)?;
        drop(file);
        let _ = sharing::apply_meta(&target, entry.mode, entry.mtime);
        stats.files_ok += 1;
        stats.bytes_ok += header.len;
        Ok(())
    }

    /// Upload local `paths` into the server's working directory.
    pub fn put(
        &mut self,
        paths: &[PathBuf],
        policy: OverwritePolicy,
        prompt: PromptFn,
    ) -> CResult<TransferStats> {
        let ticket: TransferTicket =
            self.call_data(&Request::with_params(api::PUT, PutParams { policy }))?;
        let mut chan = self.open_aux(ticket.port)?;

        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let (items, walk_errors) = transfer::build_manifest(&base, paths);
        let manifest = Manifest {
            files: items.iter().map(|(e, _)| e.clone()).collect(),
            total_bytes: items
                .iter()
                .filter(|(e, _)| e.kind == EntryKind::File)
                .map(|(e, _)| e.size)
                .sum(),
        };
        chan.send(&manifest)?;

        let bar = self.progress_bar(manifest.total_bytes);
        let mut stats = TransferStats::default();
        stats.files_err = walk_errors.len() as u64;

        for (idx, (entry, src)) in items.iter().enumerate() {
            if entry.kind != EntryKind::File {
                continue;
            }
            let mut file = match File::open(src) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %src.display(), error = %e, "cannot read, skipping");
                    stats.files_err += 1;
                    continue;
                }
            };
            let len = file.metadata().map(|m| m.len()).unwrap_or(entry.size);
            chan.send(&FileHeader { idx, len })?;

            let mut decision: DecisionFrame = chan.recv()?;
            if decision.decision == PutDecision::Undecided {
                // The server is waiting for our user's verdict via the
                // control channel
                let overwrite = prompt(entry);
                self.call(&Request::with_params(
                    api::PUT_DECISION,
                    PutDecisionParams {
                        transfer: ticket.transfer,
                        idx,
                        decision: if overwrite { PutDecision::Accept } else { PutDecision::Skip },
                    },
                ))?;
                decision = chan.recv()?;
            }

            match decision.decision {
                PutDecision::Accept => {
                    chan.copy_from_reader(&mut file, len)?;
                    stats.files_ok += 1;
                    stats.bytes_ok += len;
                    if let Some(bar) = &bar {
                        bar.inc(len);
                    }
                }
                PutDecision::Skip | PutDecision::Undecided => {
                    stats.files_skipped += 1;
                }
            }
        }

        // Our trailing outcome, then the receiver's authoritative one
        chan.send(&SenderFrame::Outcome(TransferOutcome {
            outcome: crate::protocol::OutcomeKind::Ok,
            files_ok: stats.files_ok,
            files_skipped: stats.files_skipped,
            files_err: stats.files_err,
            bytes_ok: stats.bytes_ok,
            errors: Vec::new(),
        }))?;
        let remote: TransferOutcome = chan.recv()?;
        stats.remote = Some(remote);
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        Ok(stats)
    }

    /// Run a remote command (or shell), bridging this process's stdio.
    /// Returns the remote exit code.
    pub fn rexec(&mut self, cmd: Option<&str>) -> CResult<i32> {
        let ticket: RexecTicket = match cmd {
            Some(cmd) => self.call_data(&Request::with_params(
                api::REXEC,
                RexecParams { cmd: cmd.into() },
            ))?,
            None => self.call_data(&Request::new(api::RSHELL))?,
        };
        let sock = TcpStream::connect((self.host.as_str(), ticket.port))
            .context("connect rexec endpoint")
            .map_err(ClientError::Local)?;
        drive_rexec(sock, std::io::stdin(), &mut std::io::stdout(), &mut std::io::stderr())
            .map_err(|e| ClientError::Local(anyhow!(e)))
    }

    fn progress_bar(&self, total_bytes: u64) -> Option<ProgressBar> {
        if !self.show_progress || total_bytes == 0 {
            return None;
        }
        let bar = ProgressBar::new(total_bytes);
        if let Ok(style) = ProgressStyle::with_template(
            "{bar:30.green} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style);
        }
        Some(bar)
    }
}

/// Bridge a rexec socket to the given stdio handles; returns the exit code.
pub fn drive_rexec<I, O, E>(
    sock: TcpStream,
    input: I,
    out: &mut O,
    err: &mut E,
) -> std::io::Result<i32>
where
    I: Read + Send + 'static,
    O: Write,
    E: Write,
{
    let mut writer = sock.try_clone()?;
    let pump = thread::spawn(move || {
        let mut input = input;
        let mut buf = [0u8; 8 * 1024];
        loop {
            match input.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if writer.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown(std::net::Shutdown::Write);
    });

    let mut reader = sock;
    let mut code = -1;
    while let Some((tag, payload)) = rexec::read_frame(&mut reader)? {
        match tag {
            rexec::TAG_STDOUT => {
                out.write_all(&payload)?;
                out.flush()?;
            }
            rexec::TAG_STDERR => {
                err.write_all(&payload)?;
                err.flush()?;
            }
            rexec::TAG_EXIT => {
                if payload.len() == 4 {
                    code = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                }
                break;
            }
            other => {
                debug!(tag = other, "unknown rexec tag ignored");
            }
        }
    }
    let _ = reader.shutdown(std::net::Shutdown::Both);
    let _ = pump.join();
    Ok(code)
}

fn open_chan(
    host: &str,
    port: u16,
    tls_config: Option<&Arc<rustls::ClientConfig>>,
) -> anyhow::Result<Chan> {
    let sock = TcpStream::connect((host, port))
        .with_context(|| format!("connect {host}:{port}"))?;
    let _ = sock.set_nodelay(true);
    match tls_config {
        Some(cfg) => {
            let conn = rustls::ClientConnection::new(Arc::clone(cfg), tls::server_name_for(host))
                .context("tls client setup")?;
            Ok(Chan::TlsClient(Box::new(rustls::StreamOwned::new(conn, sock))))
        }
        None => Ok(Chan::Plain(sock)),
    }
}

/// Keep received paths under the destination; a malicious manifest must not
/// climb out of it.
fn local_target(dest_dir: &Path, wire_path: &str) -> Option<PathBuf> {
    if wire_path.is_empty() || wire_path.contains('\0') {
        return None;
    }
    let mut target = dest_dir.to_path_buf();
    for comp in Path::new(wire_path).components() {
        match comp {
            Component::Normal(n) => target.push(n),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(target)
}

fn overwrite_locally(
    target: &Path,
    entry: &FileEntry,
    policy: OverwritePolicy,
    prompt: PromptFn,
) -> bool {
    let Ok(existing) = fs::symlink_metadata(target) else {
        return true;
    };
    match policy {
        OverwritePolicy::Yes => true,
        OverwritePolicy::No => false,
        OverwritePolicy::Newer => entry.mtime > sharing::mtime_ns(&existing),
        OverwritePolicy::DifferentSize => entry.size != existing.len(),
        OverwritePolicy::Prompt => prompt(entry),
    }
}

/// Broadcast a probe and collect every server that answers in the window.
pub fn scan(discover_port: u16, wait: Duration) -> Vec<ServerDescriptor> {
    match Scanner::broadcast(discover_port, wait) {
        Ok(scanner) => scanner.collect(),
        Err(e) => {
            warn!(error = %e, "discovery scan failed");
            Vec::new()
        }
    }
}

/// Find the server exposing a sharing with this name.
pub fn locate_sharing(
    name: &str,
    discover_port: u16,
    wait: Duration,
) -> Option<ServerDescriptor> {
    let scanner = Scanner::broadcast(discover_port, wait).ok()?;
    for descriptor in scanner {
        if descriptor.sharings.iter().any(|s| s.name == name) {
            return Some(descriptor);
        }
    }
    None
}

/// Ask one specific host for its descriptor (unicast probe).
pub fn probe_host(host: &str, discover_port: u16, wait: Duration) -> Option<ServerDescriptor> {
    use std::net::ToSocketAddrs;
    let addrs: Vec<SocketAddr> = (host, discover_port).to_socket_addrs().ok()?.collect();
    Scanner::unicast(&addrs, wait).ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_target_stays_under_dest() {
        let dest = Path::new("/tmp/dl");
        assert_eq!(local_target(dest, "a/b.txt"), Some(dest.join("a/b.txt")));
        assert_eq!(local_target(dest, "./a"), Some(dest.join("a")));
        assert!(local_target(dest, "../evil").is_none());
        assert!(local_target(dest, "/abs").is_none());
        assert!(local_target(dest, "a/../../evil").is_none());
        assert!(local_target(dest, "").is_none());
    }

    #[test]
    fn local_overwrite_policies() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = tmp.path().join("f");
        std::fs::write(&target, b"abc").unwrap();
        let existing_mtime = sharing::mtime_ns(&fs::metadata(&target).unwrap());

        let entry = FileEntry {
            path: "f".into(),
            kind: EntryKind::File,
            size: 3,
            mtime: existing_mtime - 1,
            mode: 0,
            target: None,
        };
        let mut never = |_: &FileEntry| panic!("prompt must not fire");

        assert!(overwrite_locally(&target, &entry, OverwritePolicy::Yes, &mut never));
        assert!(!overwrite_locally(&target, &entry, OverwritePolicy::No, &mut never));
        assert!(!overwrite_locally(&target, &entry, OverwritePolicy::Newer, &mut never));
        assert!(!overwrite_locally(&target, &entry, OverwritePolicy::DifferentSize, &mut never));

        let mut asked = false;
        let mut yes = |_: &FileEntry| {
            asked = true;
            true
        };
        assert!(overwrite_locally(&target, &entry, OverwritePolicy::Prompt, &mut yes));
        assert!(asked);

        // Missing target never prompts
        assert!(overwrite_locally(
            &tmp.path().join("absent"),
            &entry,
            OverwritePolicy::Prompt,
            &mut never
        ));
    }
}
