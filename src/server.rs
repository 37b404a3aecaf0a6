//! Control-channel daemon: accept connections, authenticate sessions and
//! dispatch the RPC surface. One worker thread per connection; responses go
//! back in request order.

use crate::auth::Auth;
use crate::discover;
use crate::pathres;
use crate::protocol::{
    api, ErrorCode, GetParams, LsParams, OpenParams, PathParams, PathsParams, PingReply,
    PutDecisionParams, PutParams, Request, Response, RexecParams, RexecTicket, ServerDescriptor,
    SrcDestParams, TransferError, TransferTicket, TreeParams, FindParams,
    DEFAULT_IDLE_TIMEOUT_SECS,
};
use crate::rexec;
use crate::session::Session;
use crate::sharing::{self, Sharing};
use crate::stream::{Chan, FrameStream, StreamError};
use crate::tls::ServerTls;
use crate::transfer;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct ServerOptions {
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    /// 0 disables the discovery daemon
    pub discover_port: u16,
    pub auth: Auth,
    pub rexec: bool,
    pub tls: Option<ServerTls>,
    pub sharings: Vec<Sharing>,
    pub idle_timeout: Duration,
}

impl ServerOptions {
    pub fn new(name: &str, sharings: Vec<Sharing>) -> ServerOptions {
        ServerOptions {
            name: name.to_string(),
            address: IpAddr::from([0, 0, 0, 0]),
            port: crate::protocol::DEFAULT_CONTROL_PORT,
            discover_port: crate::protocol::DEFAULT_DISCOVER_PORT,
            auth: Auth::Open,
            rexec: false,
            tls: None,
            sharings,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

pub struct ServerContext {
    name: String,
    address: IpAddr,
    port: u16,
    discover_port: u16,
    auth: Auth,
    rexec_enabled: bool,
    tls: Option<Arc<rustls::ServerConfig>>,
    fingerprint: Option<String>,
    version: String,
    sharings: Vec<Arc<Sharing>>,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<u64, SocketAddr>>,
    next_session: AtomicU64,
}

impl ServerContext {
    pub fn descriptor(&self) -> ServerDescriptor {
        let address = if self.address.is_unspecified() {
            // The discovery reply's source address is more useful
            String::new()
        } else {
            self.address.to_string()
        };
        ServerDescriptor {
            name: self.name.clone(),
            address,
            port: self.port,
            discover_port: self.discover_port,
            ssl: self.tls.is_some(),
            auth: self.auth.required(),
            rexec: self.rexec_enabled,
            version: self.version.clone(),
            sharings: self.sharings.iter().map(|s| s.descriptor()).collect(),
            fingerprint: self.fingerprint.clone(),
        }
    }

    fn find_sharing(&self, name: &str) -> Option<Arc<Sharing>> {
        self.sharings.iter().find(|s| s.name == name).cloned()
    }
}

pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl Server {
    /// Bind the control port and, unless disabled, start the discovery
    /// daemon. Does not accept yet; call [`Server::run`].
    pub fn bind(opts: ServerOptions) -> Result<Server> {
        let listener = TcpListener::bind((opts.address, opts.port))
            .with_context(|| format!("bind control {}:{}", opts.address, opts.port))?;
        let port = listener.local_addr()?.port();

        let (tls, fingerprint) = match opts.tls {
            Some(t) => (Some(t.config), Some(t.fingerprint)),
            None => (None, None),
        };
        let ctx = Arc::new(ServerContext {
            name: opts.name,
            address: opts.address,
            port,
            discover_port: opts.discover_port,
            auth: opts.auth,
            rexec_enabled: opts.rexec,
            tls,
            fingerprint,
            version: env!("CARGO_PKG_VERSION").to_string(),
            sharings: opts.sharings.into_iter().map(Arc::new).collect(),
            idle_timeout: opts.idle_timeout,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        });

        if ctx.discover_port != 0 {
            let snapshot = Arc::clone(&ctx);
            discover::spawn_daemon(ctx.address, ctx.discover_port, move || {
                snapshot.descriptor()
            })
            .context("start discovery daemon")?;
        }

        info!(port, sharings = ctx.sharings.len(), ssl = ctx.tls.is_some(), "server bound");
        Ok(Server { ctx, listener })
    }

    pub fn local_port(&self) -> u16 {
        self.ctx.port
    }

    pub fn descriptor(&self) -> ServerDescriptor {
        self.ctx.descriptor()
    }

    /// Accept control connections until the process ends.
    pub fn run(self) -> Result<()> {
        loop {
            let (sock, peer) = match self.listener.accept() {
                Ok(x) => x,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            thread::Builder::new()
                .name(format!("session-{peer}"))
                .spawn(move || handle_connection(ctx, sock, peer))
                .context("spawn session thread")?;
        }
    }
}

fn handle_connection(ctx: Arc<ServerContext>, sock: TcpStream, peer: SocketAddr) {
    let id = ctx.next_session.fetch_add(1, Ordering::Relaxed);
    info!(session = id, %peer, "connection");
    if let Ok(mut sessions) = ctx.sessions.lock() {
        sessions.insert(id, peer);
    }

    let _ = sock.set_nodelay(true);
    let chan = match &ctx.tls {
        Some(cfg) => match rustls::ServerConnection::new(Arc::clone(cfg)) {
            Ok(conn) => Chan::TlsServer(Box::new(rustls::StreamOwned::new(conn, sock))),
            Err(e) => {
                warn!(session = id, error = %e, "tls setup failed");
                if let Ok(mut sessions) = ctx.sessions.lock() {
                    sessions.remove(&id);
                }
                return;
            }
        },
        None => Chan::Plain(sock),
    };
    let mut stream = FrameStream::new(chan);
    let _ = stream.set_read_timeout(Some(ctx.idle_timeout));

    let mut session = Session::new(id, peer, !ctx.auth.required());
    loop {
        let request: Request = match stream.recv() {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                info!(session = id, "idle timeout, closing session");
                break;
            }
            Err(StreamError::Closed) => {
                debug!(session = id, "peer closed");
                break;
            }
            Err(StreamError::Protocol(msg)) => {
                // Malformed frames drop the connection without a reply
                warn!(session = id, %msg, "protocol error, dropping connection");
                break;
            }
            Err(StreamError::Transport(e)) => {
                debug!(session = id, error = %e, "transport error");
                break;
            }
        };
        debug!(session = id, api = %request.api, "rpc");
        let response = dispatch(&ctx, &mut session, &request);
        if let Err(e) = stream.send(&response) {
            debug!(session = id, error = %e, "response write failed");
            break;
        }
    }

    stream.shutdown();
    if let Ok(mut sessions) = ctx.sessions.lock() {
        sessions.remove(&id);
    }
    // Dropping the session aborts its transfers
    info!(session = id, "session closed");
}

fn params<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, ErrorCode> {
    let value = if request.params.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        request.params.clone()
    };
    serde_json::from_value(value).map_err(|_| ErrorCode::InvalidArgument)
}

fn dispatch(ctx: &ServerContext, session: &mut Session, request: &Request) -> Response {
    match try_dispatch(ctx, session, request) {
        Ok(resp) => resp,
        Err(code) => Response::err(code),
    }
}

fn try_dispatch(
    ctx: &ServerContext,
    session: &mut Session,
    request: &Request,
) -> Result<Response, ErrorCode> {
    match request.api.as_str() {
        api::PING => {
            let echo = request
                .params
                .get("echo")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(Response::with_data(PingReply {
                echo,
                time_ms: chrono::Utc::now().timestamp_millis(),
            }))
        }
        api::INFO => Ok(Response::with_data(ctx.descriptor())),
        api::LIST => {
            let sharings: Vec<_> = ctx.sharings.iter().map(|s| s.descriptor()).collect();
            Ok(Response::with_data(sharings))
        }
        api::AUTH => {
            let p: crate::protocol::AuthParams = params(request)?;
            if !ctx.auth.verify(&p.password) {
                return Err(ErrorCode::AuthFailed);
            }
            session.authenticated = true;
            Ok(Response::ok())
        }
        api::OPEN => {
            require_auth(ctx, session)?;
            let p: OpenParams = params(request)?;
            let sharing = ctx.find_sharing(&p.name).ok_or(ErrorCode::NoSuchSharing)?;
            session.bind(sharing)?;
            Ok(Response::ok())
        }
        api::CLOSE => {
            session.unbind()?;
            Ok(Response::ok())
        }
        api::RPWD => {
            let sharing = session.sharing()?;
            Ok(Response::with_data(pathres::display_relative(&sharing.root, &session.cwd)))
        }
        api::RCD => {
            let p: PathParams = params(request)?;
            let sharing = Arc::clone(session.sharing()?);
            let target = pathres::resolve(
                &sharing.root,
                &session.cwd,
                p.path.as_deref().unwrap_or(""),
            )?;
            let md = std::fs::metadata(&target).map_err(|e| ErrorCode::from_io(&e))?;
            if !md.is_dir() {
                return Err(ErrorCode::NotADirectory);
            }
            session.cwd = target;
            Ok(Response::with_data(pathres::display_relative(&sharing.root, &session.cwd)))
        }
        api::RLS => {
            let p: LsParams = params(request)?;
            let sharing = session.sharing()?;
            let dir = pathres::resolve(
                &sharing.root,
                &session.cwd,
                p.path.as_deref().unwrap_or(""),
            )?;
            Ok(Response::with_data(sharing::ls(&dir, &p)?))
        }
        api::RTREE => {
            let p: TreeParams = params(request)?;
            let sharing = session.sharing()?;
            let dir = pathres::resolve(
                &sharing.root,
                &session.cwd,
                p.path.as_deref().unwrap_or(""),
            )?;
            Ok(Response::with_data(sharing::tree(&dir, p.max_depth, p.all)?))
        }
        api::RMKDIR => {
            let sharing = require_writable(session)?;
            let p: PathParams = params(request)?;
            let path = p.path.ok_or(ErrorCode::InvalidArgument)?;
            let target = pathres::resolve(&sharing.root, &session.cwd, &path)?;
            sharing::mkdir(&target)?;
            Ok(Response::ok())
        }
        api::RMV => {
            let sharing = require_writable(session)?;
            let p: SrcDestParams = params(request)?;
            let (sources, mut outcomes) = resolve_sources(&sharing.root, &session.cwd, &p.sources);
            let dest = pathres::resolve(&sharing.root, &session.cwd, &p.dest)?;
            outcomes.extend(sharing::mv(&sources, &dest)?);
            Ok(Response::with_data(outcomes))
        }
        api::RCP => {
            let sharing = require_writable(session)?;
            let p: SrcDestParams = params(request)?;
            let (sources, mut outcomes) = resolve_sources(&sharing.root, &session.cwd, &p.sources);
            let dest = pathres::resolve(&sharing.root, &session.cwd, &p.dest)?;
            outcomes.extend(sharing::cp(&sources, &dest)?);
            Ok(Response::with_data(outcomes))
        }
        api::RRM => {
            let sharing = require_writable(session)?;
            let p: PathsParams = params(request)?;
            let (paths, mut outcomes) = resolve_sources(&sharing.root, &session.cwd, &p.paths);
            outcomes.extend(sharing::rm(&paths));
            Ok(Response::with_data(outcomes))
        }
        api::RFIND => {
            let p: FindParams = params(request)?;
            let _ = session.sharing()?;
            Ok(Response::with_data(sharing::find(&session.cwd, &p.pattern)?))
        }
        api::GET => {
            let p: GetParams = params(request)?;
            let sharing = Arc::clone(session.sharing()?);
            let mut resolved = Vec::new();
            let mut walk_errors: Vec<TransferError> = Vec::new();
            for path in &p.paths {
                match pathres::resolve(&sharing.root, &session.cwd, path) {
                    Ok(abs) => resolved.push(abs),
                    Err(code) => {
                        walk_errors.push(TransferError { path: path.clone(), error: code })
                    }
                }
            }
            let (items, mut errors) = transfer::build_manifest(&sharing.root, &resolved);
            walk_errors.append(&mut errors);
            let handle = transfer::spawn_get(
                ctx.address,
                session.peer.ip(),
                ctx.tls.clone(),
                items,
                walk_errors,
            )
            .map_err(|_| ErrorCode::IoError)?;
            let port = handle.port;
            let transfer = session.register_transfer(handle);
            Ok(Response::with_data(TransferTicket { transfer, port }))
        }
        api::PUT => {
            let sharing = require_writable(session)?;
            let p: PutParams = params(request)?;
            let handle = transfer::spawn_put(
                ctx.address,
                session.peer.ip(),
                ctx.tls.clone(),
                sharing.root.clone(),
                session.cwd.clone(),
                p.policy,
            )
            .map_err(|_| ErrorCode::IoError)?;
            let port = handle.port;
            let transfer = session.register_transfer(handle);
            Ok(Response::with_data(TransferTicket { transfer, port }))
        }
        api::PUT_DECISION => {
            let p: PutDecisionParams = params(request)?;
            let handle = session.transfer(p.transfer).ok_or(ErrorCode::InvalidArgument)?;
            handle.deliver_decision(p.idx, p.decision)?;
            Ok(Response::ok())
        }
        api::REXEC => {
            require_rexec(ctx, session)?;
            let p: RexecParams = params(request)?;
            let port = rexec::spawn_endpoint(ctx.address, session.peer.ip(), p.cmd)
                .map_err(|_| ErrorCode::IoError)?;
            Ok(Response::with_data(RexecTicket { port }))
        }
        api::RSHELL => {
            require_rexec(ctx, session)?;
            let port =
                rexec::spawn_endpoint(ctx.address, session.peer.ip(), rexec::default_shell())
                    .map_err(|_| ErrorCode::IoError)?;
            Ok(Response::with_data(RexecTicket { port }))
        }
        _ => Err(ErrorCode::InvalidArgument),
    }
}

fn require_auth(ctx: &ServerContext, session: &Session) -> Result<(), ErrorCode> {
    if ctx.auth.required() && !session.authenticated {
        return Err(ErrorCode::AuthRequired);
    }
    Ok(())
}

fn require_rexec(ctx: &ServerContext, session: &Session) -> Result<(), ErrorCode> {
    if !ctx.rexec_enabled {
        return Err(ErrorCode::RexecDisabled);
    }
    require_auth(ctx, session)
}

/// Bound sharing that also admits writes.
fn require_writable(session: &Session) -> Result<Arc<Sharing>, ErrorCode> {
    let sharing = session.sharing()?;
    if sharing.read_only {
        return Err(ErrorCode::ReadOnly);
    }
    Ok(Arc::clone(sharing))
}

/// Resolve client paths; failures become per-entry outcomes instead of
/// failing the batch.
fn resolve_sources(
    root: &std::path::Path,
    cwd: &std::path::Path,
    inputs: &[String],
) -> (Vec<(String, PathBuf)>, Vec<crate::protocol::EntryOutcome>) {
    let mut resolved = Vec::with_capacity(inputs.len());
    let mut failures = Vec::new();
    for input in inputs {
        match pathres::resolve(root, cwd, input) {
            Ok(abs) => resolved.push((input.clone(), abs)),
            Err(code) => failures.push(crate::protocol::EntryOutcome {
                path: input.clone(),
                ok: false,
                error: Some(code),
            }),
        }
    }
    (resolved, failures)
}
