//! Server-side transfer engine: one TCP endpoint per GET/PUT, streaming
//! manifest-ordered file frames with overwrite arbitration on PUT.
//!
//! An endpoint accepts exactly one connection and requires its peer IP to
//! match the control channel's. The client half of the protocol lives in
//! [`crate::client`].

use crate::pathres;
use crate::protocol::{
    DecisionFrame, EntryKind, ErrorCode, FileEntry, FileHeader, Manifest, OutcomeKind,
    OverwritePolicy, PutDecision, SenderFrame, TransferError, TransferOutcome,
};
use crate::sharing;
use crate::stream::{Chan, FrameStream, StreamError};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Get,
    Put,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Streaming,
    Finalised,
    Aborted,
}

// How long an endpoint waits for its single client connection
const ACCEPT_WINDOW: Duration = Duration::from_secs(30);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
// Upper bound on waiting for a put_decision RPC
const PROMPT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Shared view of one transfer, owned by a session, updated by the endpoint
/// worker.
pub struct TransferHandle {
    pub direction: Direction,
    pub port: u16,
    state: Mutex<TransferState>,
    conn: Mutex<Option<TcpStream>>,
    aborted: AtomicBool,
    /// Pending prompt arbitration: file idx -> decision channel
    pending: Mutex<Option<(usize, SyncSender<PutDecision>)>>,
}

impl TransferHandle {
    fn new(direction: Direction, port: u16) -> Arc<TransferHandle> {
        Arc::new(TransferHandle {
            direction,
            port,
            state: Mutex::new(TransferState::Created),
            conn: Mutex::new(None),
            aborted: AtomicBool::new(false),
            pending: Mutex::new(None),
        })
    }

    /// Handle with no endpoint behind it (unit tests).
    pub fn detached() -> Arc<TransferHandle> {
        TransferHandle::new(Direction::Get, 0)
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Abort from outside the worker: close the socket so blocked I/O fails
    /// within the teardown grace.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
        if let Ok(guard) = self.conn.lock() {
            if let Some(sock) = guard.as_ref() {
                let _ = sock.shutdown(std::net::Shutdown::Both);
            }
        }
        if self.state() != TransferState::Finalised {
            self.set_state(TransferState::Aborted);
        }
    }

    /// Route a `put_decision` RPC to the waiting endpoint worker.
    pub fn deliver_decision(&self, idx: usize, decision: PutDecision) -> Result<(), ErrorCode> {
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match guard.take() {
            Some((pending_idx, tx)) if pending_idx == idx => {
                tx.send(decision).map_err(|_| ErrorCode::Aborted)
            }
            Some(other) => {
                *guard = Some(other);
                Err(ErrorCode::InvalidArgument)
            }
            None => Err(ErrorCode::InvalidArgument),
        }
    }

    /// Arm the prompt channel for `idx`. Must happen before the undecided
    /// frame goes out, or the follow-up RPC could race past us.
    fn register_pending(&self, idx: usize) -> Receiver<PutDecision> {
        let (tx, rx) = sync_channel(1);
        let mut guard = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some((idx, tx));
        rx
    }

    fn await_decision(&self, rx: &Receiver<PutDecision>) -> PutDecision {
        let deadline = Instant::now() + PROMPT_WINDOW;
        loop {
            if self.is_aborted() {
                return PutDecision::Skip;
            }
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(decision) => return decision,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return PutDecision::Skip;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    return PutDecision::Skip;
                }
            }
        }
    }
}

/// Walk the requested paths into an ordered manifest. Directories recurse;
/// symlinks are described rather than followed, except links that resolve to
/// a regular file inside the root, which are sent as files.
pub fn build_manifest(
    root: &Path,
    requested: &[PathBuf],
) -> (Vec<(FileEntry, PathBuf)>, Vec<TransferError>) {
    let mut items = Vec::new();
    let mut errors = Vec::new();

    for abs in requested {
        let base_name = match abs.file_name() {
            Some(n) => PathBuf::from(n),
            None => PathBuf::from(abs.as_os_str()),
        };
        let top_md = match fs::symlink_metadata(abs) {
            Ok(md) => md,
            Err(e) => {
                errors.push(TransferError {
                    path: base_name.to_string_lossy().to_string(),
                    error: ErrorCode::from_io(&e),
                });
                continue;
            }
        };

        if top_md.is_dir() && !top_md.file_type().is_symlink() {
            for item in walkdir::WalkDir::new(abs)
                .follow_links(false)
                .sort_by(|a, b| a.file_name().cmp(b.file_name()))
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let rel = item.path().strip_prefix(abs).unwrap_or(item.path());
                let wire = if rel.as_os_str().is_empty() {
                    base_name.clone()
                } else {
                    base_name.join(rel)
                };
                match manifest_entry(root, item.path(), &wire) {
                    Ok(entry) => items.push((entry, item.path().to_path_buf())),
                    Err(code) => errors.push(TransferError {
                        path: wire.to_string_lossy().to_string(),
                        error: code,
                    }),
                }
            }
        } else {
            match manifest_entry(root, abs, &base_name) {
                Ok(entry) => items.push((entry, abs.clone())),
                Err(code) => errors.push(TransferError {
                    path: base_name.to_string_lossy().to_string(),
                    error: code,
                }),
            }
        }
    }
    (items, errors)
}

fn manifest_entry(root: &Path, abs: &Path, wire: &Path) -> Result<FileEntry, ErrorCode> {
    let mut entry = sharing::file_entry(abs.parent().unwrap_or(abs), abs)?;
    entry.path = wire.to_string_lossy().to_string();

    // A symlink to a regular file inside the sharing travels as that file
    if entry.kind == EntryKind::Symlink {
        if let Ok(resolved) = abs.canonicalize() {
            if resolved.starts_with(root) {
                if let Ok(md) = fs::metadata(&resolved) {
                    if md.is_file() {
                        entry.kind = EntryKind::File;
                        entry.size = md.len();
                        entry.mtime = sharing::mtime_ns(&md);
                        entry.mode = sharing::mode_bits(&md);
                        entry.target = None;
                    }
                }
            }
        }
    }
    Ok(entry)
}

fn manifest_total(items: &[(FileEntry, PathBuf)]) -> u64 {
    items
        .iter()
        .filter(|(e, _)| e.kind == EntryKind::File)
        .map(|(e, _)| e.size)
        .sum()
}

struct Endpoint {
    listener: TcpListener,
    tls: Option<Arc<rustls::ServerConfig>>,
    peer_ip: IpAddr,
    handle: Arc<TransferHandle>,
}

impl Endpoint {
    fn bind(
        direction: Direction,
        bind_ip: IpAddr,
        peer_ip: IpAddr,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<(Endpoint, Arc<TransferHandle>)> {
        let listener = TcpListener::bind((bind_ip, 0)).context("bind transfer endpoint")?;
        listener.set_nonblocking(true).context("endpoint nonblocking")?;
        let port = listener.local_addr()?.port();
        let handle = TransferHandle::new(direction, port);
        Ok((
            Endpoint { listener, tls, peer_ip, handle: Arc::clone(&handle) },
            handle,
        ))
    }

    /// Wait for the single expected connection, dropping peers whose address
    /// does not match the control channel.
    fn accept_one(&self) -> Option<FrameStream> {
        let deadline = Instant::now() + ACCEPT_WINDOW;
        loop {
            if self.handle.is_aborted() || Instant::now() >= deadline {
                return None;
            }
            match self.listener.accept() {
                Ok((sock, peer)) => {
                    if peer.ip() != self.peer_ip {
                        warn!(%peer, expected = %self.peer_ip, "dropping transfer peer mismatch");
                        drop(sock);
                        continue;
                    }
                    let _ = sock.set_nonblocking(false);
                    if let Ok(mut guard) = self.handle.conn.lock() {
                        *guard = sock.try_clone().ok();
                    }
                    let chan = match &self.tls {
                        Some(cfg) => {
                            let conn = match rustls::ServerConnection::new(Arc::clone(cfg)) {
                                Ok(c) => c,
                                Err(e) => {
                                    warn!(error = %e, "transfer tls setup failed");
                                    return None;
                                }
                            };
                            Chan::TlsServer(Box::new(rustls::StreamOwned::new(conn, sock)))
                        }
                        None => Chan::Plain(sock),
                    };
                    return Some(FrameStream::new(chan));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "transfer accept failed");
                    return None;
                }
            }
        }
    }
}

/// Allocate a GET endpoint and stream `items` to the first valid peer.
pub fn spawn_get(
    bind_ip: IpAddr,
    peer_ip: IpAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    items: Vec<(FileEntry, PathBuf)>,
    walk_errors: Vec<TransferError>,
) -> Result<Arc<TransferHandle>> {
    let (endpoint, handle) = Endpoint::bind(Direction::Get, bind_ip, peer_ip, tls)?;
    thread::Builder::new()
        .name("transfer-get".into())
        .spawn(move || {
            let handle = Arc::clone(&endpoint.handle);
            let Some(mut stream) = endpoint.accept_one() else {
                handle.set_state(TransferState::Aborted);
                return;
            };
            handle.set_state(TransferState::Streaming);
            match run_get(&handle, &mut stream, &items, walk_errors) {
                Ok(()) => handle.set_state(TransferState::Finalised),
                Err(e) => {
                    debug!(error = %e, "get transfer failed");
                    handle.set_state(TransferState::Aborted);
                }
            }
        })
        .context("spawn get endpoint")?;
    Ok(handle)
}

fn run_get(
    handle: &TransferHandle,
    stream: &mut FrameStream,
    items: &[(FileEntry, PathBuf)],
    walk_errors: Vec<TransferError>,
) -> Result<(), StreamError> {
    let manifest = Manifest {
        files: items.iter().map(|(e, _)| e.clone()).collect(),
        total_bytes: manifest_total(items),
    };
    stream.send(&manifest)?;

    let mut outcome = TransferOutcome::empty(OutcomeKind::Ok);
    outcome.files_err = walk_errors.len() as u64;
    outcome.errors = walk_errors;

    for (idx, (entry, src)) in items.iter().enumerate() {
        if handle.is_aborted() {
            return Err(StreamError::Closed);
        }
        if entry.kind != EntryKind::File {
            continue;
        }
        let mut file = match File::open(src) {
            Ok(f) => f,
            Err(e) => {
                outcome.files_err += 1;
                outcome.errors.push(TransferError {
                    path: entry.path.clone(),
                    error: ErrorCode::from_io(&e),
                });
                continue;
            }
        };
        // Re-stat at send time: the header length is authoritative
        let len = file.metadata().map(|m| m.len()).unwrap_or(entry.size);
        stream.send(&FileHeader { idx, len })?;
        stream.copy_from_reader(&mut file, len)?;
        outcome.files_ok += 1;
        outcome.bytes_ok += len;
    }

    stream.send(&SenderFrame::Outcome(outcome))?;
    Ok(())
}

/// Allocate a PUT endpoint receiving files into `dest` (the session cwd at
/// creation), arbitrating each existing target by `policy`.
pub fn spawn_put(
    bind_ip: IpAddr,
    peer_ip: IpAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    root: PathBuf,
    dest: PathBuf,
    policy: OverwritePolicy,
) -> Result<Arc<TransferHandle>> {
    let (endpoint, handle) = Endpoint::bind(Direction::Put, bind_ip, peer_ip, tls)?;
    thread::Builder::new()
        .name("transfer-put".into())
        .spawn(move || {
            let handle = Arc::clone(&endpoint.handle);
            let Some(mut stream) = endpoint.accept_one() else {
                handle.set_state(TransferState::Aborted);
                return;
            };
            handle.set_state(TransferState::Streaming);
            match run_put(&handle, &mut stream, &root, &dest, policy) {
                Ok(()) => handle.set_state(TransferState::Finalised),
                Err(e) => {
                    debug!(error = %e, "put transfer failed");
                    handle.set_state(TransferState::Aborted);
                }
            }
        })
        .context("spawn put endpoint")?;
    Ok(handle)
}

fn run_put(
    handle: &TransferHandle,
    stream: &mut FrameStream,
    root: &Path,
    dest: &Path,
    policy: OverwritePolicy,
) -> Result<(), StreamError> {
    let manifest: Manifest = stream.recv()?;
    let mut outcome = TransferOutcome::empty(OutcomeKind::Ok);

    // Resolve every wire path up front; escapes become per-file errors
    let mut targets: Vec<Option<PathBuf>> = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        match pathres::resolve(root, dest, &entry.path) {
            Ok(p) => targets.push(Some(p)),
            Err(code) => {
                outcome.files_err += 1;
                outcome.errors.push(TransferError { path: entry.path.clone(), error: code });
                targets.push(None);
            }
        }
    }

    // Directories and symlinks come from the manifest alone
    for (entry, target) in manifest.files.iter().zip(&targets) {
        let Some(target) = target else { continue };
        match entry.kind {
            EntryKind::Directory => {
                if let Err(code) = sharing::mkdir(target) {
                    outcome.files_err += 1;
                    outcome
                        .errors
                        .push(TransferError { path: entry.path.clone(), error: code });
                }
            }
            EntryKind::Symlink => {
                if let Some(link_target) = &entry.target {
                    #[cfg(unix)]
                    if fs::symlink_metadata(target).is_err() {
                        let _ = std::os::unix::fs::symlink(link_target, target);
                    }
                    #[cfg(not(unix))]
                    let _ = link_target;
                }
            }
            EntryKind::File => {}
        }
    }

    info!(files = manifest.files.len(), bytes = manifest.total_bytes, "receiving put");

    loop {
        if handle.is_aborted() {
            return Err(StreamError::Closed);
        }
        let frame: SenderFrame = match stream.recv() {
            Ok(f) => f,
            Err(StreamError::Closed) => {
                // Connection dropped mid-transfer
                return Err(StreamError::Closed);
            }
            Err(e) => return Err(e),
        };
        let header = match frame {
            SenderFrame::Header(h) => h,
            SenderFrame::Outcome(_) => break,
        };

        let Some(entry) = manifest.files.get(header.idx) else {
            return Err(StreamError::Protocol(format!(
                "file header for unknown index {}",
                header.idx
            )));
        };
        let target = targets.get(header.idx).cloned().flatten();
        let Some(path) = &target else {
            // Already recorded as an error during resolution; the sender
            // just must not stream the bytes
            stream.send(&DecisionFrame { idx: header.idx, decision: PutDecision::Skip })?;
            continue;
        };

        let mut decision = arbitrate(entry, path, policy);
        if decision == PutDecision::Undecided {
            // The control channel surfaces the prompt; arm the follow-up
            // put_decision RPC channel before announcing it.
            let rx = handle.register_pending(header.idx);
            stream.send(&DecisionFrame { idx: header.idx, decision })?;
            decision = handle.await_decision(&rx);
            stream.send(&DecisionFrame { idx: header.idx, decision })?;
        } else {
            stream.send(&DecisionFrame { idx: header.idx, decision })?;
        }

        match decision {
            PutDecision::Accept => {
                match receive_file(stream, path, entry, header.len) {
                    Ok(written) => {
                        outcome.files_ok += 1;
                        outcome.bytes_ok += written;
                    }
                    Err(ReceiveError::Stream(e)) => {
                        outcome.files_err += 1;
                        outcome.errors.push(TransferError {
                            path: entry.path.clone(),
                            error: ErrorCode::Truncated,
                        });
                        return Err(e);
                    }
                    Err(ReceiveError::Io(code)) => {
                        outcome.files_err += 1;
                        outcome
                            .errors
                            .push(TransferError { path: entry.path.clone(), error: code });
                    }
                }
            }
            PutDecision::Skip | PutDecision::Undecided => {
                outcome.files_skipped += 1;
            }
        }
    }

    stream.send(&SenderFrame::Outcome(outcome))?;
    Ok(())
}

/// Receiver-side verdict for one incoming file against the negotiated policy.
fn arbitrate(entry: &FileEntry, target: &Path, policy: OverwritePolicy) -> PutDecision {
    let existing = match fs::symlink_metadata(target) {
        Ok(md) => md,
        Err(_) => return PutDecision::Accept,
    };
    match policy {
        OverwritePolicy::Yes => PutDecision::Accept,
        OverwritePolicy::No => PutDecision::Skip,
        OverwritePolicy::Newer => {
            if entry.mtime > sharing::mtime_ns(&existing) {
                PutDecision::Accept
            } else {
                PutDecision::Skip
            }
        }
        OverwritePolicy::DifferentSize => {
            if entry.size != existing.len() {
                PutDecision::Accept
            } else {
                PutDecision::Skip
            }
        }
        OverwritePolicy::Prompt => PutDecision::Undecided,
    }
}

enum ReceiveError {
    Stream(StreamError),
    Io(ErrorCode),
}

fn receive_file(
    stream: &mut FrameStream,
    target: &Path,
    entry: &FileEntry,
    len: u64,
) -> std::result::Result<u64, ReceiveError> {
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            stream.discard(len).map_err(ReceiveError::Stream)?;
            return Err(ReceiveError::Io(ErrorCode::from_io(&e)));
        }
    }
    let mut file = match File::create(target) {
        Ok(f) => f,
        Err(e) => {
            // Keep the wire in sync even when the local write cannot happen
            stream.discard(len).map_err(ReceiveError::Stream)?;
            return Err(ReceiveError::Io(ErrorCode::from_io(&e)));
        }
    };
    stream.copy_to_writer(&mut file, len).map_err(ReceiveError::Stream)?;
    drop(file);
    let _ = sharing::apply_meta(target, entry.mode, entry.mtime);
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn manifest_walk_orders_and_counts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir(root.join("a")).unwrap();
        fs::write(root.join("a/f1"), b"hello\n").unwrap();
        fs::write(root.join("a/f2"), b"").unwrap();

        let (items, errors) = build_manifest(&root, &[root.join("a")]);
        assert!(errors.is_empty());
        let paths: Vec<_> = items.iter().map(|(e, _)| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "a/f1", "a/f2"]);
        assert_eq!(items[0].0.kind, EntryKind::Directory);
        assert_eq!(manifest_total(&items), 6);
    }

    #[test]
    fn manifest_missing_path_is_an_error_entry() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let (items, errors) = build_manifest(&root, &[root.join("ghost")]);
        assert!(items.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, ErrorCode::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_file_in_root_travels_as_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link")).unwrap();

        let (items, _) = build_manifest(&root, &[root.join("link")]);
        assert_eq!(items[0].0.kind, EntryKind::File);
        assert_eq!(items[0].0.size, 4);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_travels_as_symlink() {
        let tmp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(outside.path().join("secret"), b"data").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.join("link")).unwrap();

        let (items, _) = build_manifest(&root, &[root.join("link")]);
        assert_eq!(items[0].0.kind, EntryKind::Symlink);
        assert!(items[0].0.target.is_some());
    }

    #[test]
    fn arbitration_policies() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("f1");
        fs::write(&target, b"abc").unwrap();
        let existing_mtime = sharing::mtime_ns(&fs::metadata(&target).unwrap());

        let mut entry = FileEntry {
            path: "f1".into(),
            kind: EntryKind::File,
            size: 9,
            mtime: existing_mtime + 1,
            mode: 0o644,
            target: None,
        };

        assert_eq!(arbitrate(&entry, &target, OverwritePolicy::Yes), PutDecision::Accept);
        assert_eq!(arbitrate(&entry, &target, OverwritePolicy::No), PutDecision::Skip);
        assert_eq!(arbitrate(&entry, &target, OverwritePolicy::Prompt), PutDecision::Undecided);

        // newer: incoming mtime beyond vs behind the existing file
        assert_eq!(arbitrate(&entry, &target, OverwritePolicy::Newer), PutDecision::Accept);
        entry.mtime = existing_mtime - 1;
        assert_eq!(arbitrate(&entry, &target, OverwritePolicy::Newer), PutDecision::Skip);

        // different-size: 9 != 3, then equal sizes
        assert_eq!(
            arbitrate(&entry, &target, OverwritePolicy::DifferentSize),
            PutDecision::Accept
        );
        entry.size = 3;
        assert_eq!(
            arbitrate(&entry, &target, OverwritePolicy::DifferentSize),
            PutDecision::Skip
        );

        // Absent target: always accept
        entry.size = 9;
        assert_eq!(
            arbitrate(&entry, tmp.path().join("new").as_path(), OverwritePolicy::No),
            PutDecision::Accept
        );
    }

    #[test]
    fn decision_routing() {
        let handle = TransferHandle::detached();
        // Nothing pending yet
        assert_eq!(
            handle.deliver_decision(0, PutDecision::Accept).unwrap_err(),
            ErrorCode::InvalidArgument
        );

        let rx = handle.register_pending(3);
        // Wrong index is rejected, right index is delivered
        assert!(handle.deliver_decision(9, PutDecision::Accept).is_err());
        handle.deliver_decision(3, PutDecision::Accept).unwrap();
        assert_eq!(handle.await_decision(&rx), PutDecision::Accept);
    }

    #[test]
    fn abort_marks_state() {
        let handle = TransferHandle::detached();
        assert_eq!(handle.state(), TransferState::Created);
        handle.abort();
        assert_eq!(handle.state(), TransferState::Aborted);
        assert!(handle.is_aborted());
    }
}
