//! Shared wire types and constants for the easyshare framed transport

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Default ports: control channel (TCP) and discovery (UDP)
pub const DEFAULT_CONTROL_PORT: u16 = 12020;
pub const DEFAULT_DISCOVER_PORT: u16 = 12021;

// How long the scanner collects discovery replies by default (ms)
pub const DEFAULT_DISCOVER_WAIT_MS: u64 = 2000;

// Maximum JSON frame payload size - prevents DoS via memory exhaustion.
// Raw file bytes on the transfer wire are not framed, so this only bounds
// manifests, requests and responses.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// Sessions with no frames for this long are torn down (seconds)
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 5 * 60;

// Sharing names must match [A-Za-z0-9._-]+ and stay within this length
pub const MAX_SHARING_NAME_LEN: usize = 64;

/// RPC method names (the dispatch table keys)
pub mod api {
    pub const PING: &str = "ping";
    pub const INFO: &str = "info";
    pub const LIST: &str = "list";
    pub const AUTH: &str = "auth";
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const RPWD: &str = "rpwd";
    pub const RCD: &str = "rcd";
    pub const RLS: &str = "rls";
    pub const RTREE: &str = "rtree";
    pub const RMKDIR: &str = "rmkdir";
    pub const RMV: &str = "rmv";
    pub const RCP: &str = "rcp";
    pub const RRM: &str = "rrm";
    pub const RFIND: &str = "rfind";
    pub const GET: &str = "get";
    pub const PUT: &str = "put";
    pub const PUT_DECISION: &str = "put_decision";
    pub const REXEC: &str = "rexec";
    pub const RSHELL: &str = "rshell";
}

/// Machine-readable error codes carried in the `error` field of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorCode {
    #[error("transport failure")]
    TransportError,
    #[error("malformed frame or payload")]
    ProtocolError,
    #[error("authentication required")]
    AuthRequired,
    #[error("authentication failed")]
    AuthFailed,
    #[error("no sharing is bound")]
    NotBound,
    #[error("a sharing is already bound")]
    AlreadyBound,
    #[error("no such sharing")]
    NoSuchSharing,
    #[error("sharing is read-only")]
    ReadOnly,
    #[error("path escapes the sharing")]
    PathEscapesSharing,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("already exists")]
    Exists,
    #[error("permission denied")]
    PermissionDenied,
    #[error("remote execution is disabled")]
    RexecDisabled,
    #[error("stream truncated")]
    Truncated,
    #[error("transfer aborted")]
    Aborted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation failed")]
    IoError,
}

impl ErrorCode {
    /// Map an OS error onto the taxonomy.
    pub fn from_io(err: &std::io::Error) -> ErrorCode {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            ErrorKind::AlreadyExists => ErrorCode::Exists,
            ErrorKind::NotADirectory => ErrorCode::NotADirectory,
            ErrorKind::IsADirectory => ErrorCode::IsADirectory,
            ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
            _ => ErrorCode::IoError,
        }
    }
}

/// A control-channel request: `{"api": <name>, "params": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub api: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(api: &str) -> Request {
        Request { api: api.to_string(), params: serde_json::Value::Null }
    }

    pub fn with_params<P: Serialize>(api: &str, params: P) -> Request {
        Request {
            api: api.to_string(),
            params: serde_json::to_value(params).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// A control-channel response. Exactly one of `success`/`error` is meaningful.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

impl Response {
    pub fn ok() -> Response {
        Response { success: Some(true), data: None, error: None }
    }

    pub fn with_data<D: Serialize>(data: D) -> Response {
        Response {
            success: Some(true),
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn err(code: ErrorCode) -> Response {
        Response { success: Some(false), data: None, error: Some(code) }
    }

    pub fn is_ok(&self) -> bool {
        self.success == Some(true) && self.error.is_none()
    }

    /// Deserialize the `data` payload, or fail with `ProtocolError`.
    pub fn take_data<D: serde::de::DeserializeOwned>(self) -> Result<D, ErrorCode> {
        let data = self.data.ok_or(ErrorCode::ProtocolError)?;
        serde_json::from_value(data).map_err(|_| ErrorCode::ProtocolError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingKind {
    File,
    Directory,
}

/// One named sharing as advertised to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharingDescriptor {
    pub name: String,
    pub kind: SharingKind,
    pub read_only: bool,
}

/// Server self-description, sent in discovery replies and by `info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// 0 when the discovery daemon is disabled
    pub discover_port: u16,
    pub ssl: bool,
    pub auth: bool,
    pub rexec: bool,
    pub version: String,
    pub sharings: Vec<SharingDescriptor>,
    /// SHA-256 of the certificate the server presents, when ssl is on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One filesystem entry, as listed by `rls`/`rtree` and inside manifests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the listing root / transfer target
    pub path: String,
    pub kind: EntryKind,
    /// 0 for directories
    pub size: u64,
    /// Nanoseconds since the epoch
    pub mtime: i64,
    /// Unix permission bits
    pub mode: u32,
    /// Link target, for symlink entries only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// `rtree` entries carry their DFS depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeEntry {
    #[serde(flatten)]
    pub entry: FileEntry,
    pub depth: usize,
}

/// Per-entry result for batch operations (rmv/rcp/rrm).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryOutcome {
    pub path: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

/// How the receiving side arbitrates an existing target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    #[default]
    Prompt,
    Yes,
    No,
    Newer,
    DifferentSize,
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(OverwritePolicy::Prompt),
            "yes" => Ok(OverwritePolicy::Yes),
            "no" => Ok(OverwritePolicy::No),
            "newer" => Ok(OverwritePolicy::Newer),
            "different-size" => Ok(OverwritePolicy::DifferentSize),
            other => Err(format!("unknown overwrite policy: {other}")),
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverwritePolicy::Prompt => "prompt",
            OverwritePolicy::Yes => "yes",
            OverwritePolicy::No => "no",
            OverwritePolicy::Newer => "newer",
            OverwritePolicy::DifferentSize => "different-size",
        };
        f.write_str(s)
    }
}

/// First frame on a transfer channel, sent by whichever side sends files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
    pub total_bytes: u64,
}

/// Precedes the raw bytes of one manifest entry. `len` is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub idx: usize,
    pub len: u64,
}

/// Receiver's verdict on one incoming file (PUT arbitration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PutDecision {
    Accept,
    Skip,
    /// Policy is `prompt`: the decision arrives later via `put_decision`
    Undecided,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionFrame {
    pub idx: usize,
    pub decision: PutDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Ok,
    Aborted,
}

/// Trailing frame of a transfer: aggregate counters plus per-file errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub outcome: OutcomeKind,
    pub files_ok: u64,
    pub files_skipped: u64,
    pub files_err: u64,
    pub bytes_ok: u64,
    pub errors: Vec<TransferError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferError {
    pub path: String,
    pub error: ErrorCode,
}

impl TransferOutcome {
    pub fn empty(outcome: OutcomeKind) -> TransferOutcome {
        TransferOutcome {
            outcome,
            files_ok: 0,
            files_skipped: 0,
            files_err: 0,
            bytes_ok: 0,
            errors: Vec::new(),
        }
    }
}

/// Frames a file receiver can see after the manifest: either the header of
/// the next file or the sender's trailing outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SenderFrame {
    Header(FileHeader),
    Outcome(TransferOutcome),
}

// Typed parameter records for the RPC surface

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenParams {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathParams {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LsParams {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub dirs_first: bool,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub by_size: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeParams {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrcDestParams {
    pub sources: Vec<String>,
    pub dest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsParams {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindParams {
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParams {
    pub paths: Vec<String>,
    #[serde(default)]
    pub policy: OverwritePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutParams {
    #[serde(default)]
    pub policy: OverwritePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutDecisionParams {
    pub transfer: u64,
    pub idx: usize,
    pub decision: PutDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RexecParams {
    pub cmd: String,
}

/// Returned by `get`/`put`: where to connect for the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTicket {
    pub transfer: u64,
    pub port: u16,
}

/// Returned by `rexec`/`rshell`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RexecTicket {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReply {
    pub echo: String,
    pub time_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape_success() {
        let resp = Response::with_data(PingReply { echo: "hi".into(), time_ms: 7 });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["echo"], "hi");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn response_shape_error() {
        let resp = Response::err(ErrorCode::PathEscapesSharing);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "PathEscapesSharing");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn overwrite_policy_strings() {
        assert_eq!(
            "different-size".parse::<OverwritePolicy>().unwrap(),
            OverwritePolicy::DifferentSize
        );
        assert_eq!(OverwritePolicy::Newer.to_string(), "newer");
        let json = serde_json::to_string(&OverwritePolicy::DifferentSize).unwrap();
        assert_eq!(json, "\"different-size\"");
        assert!("sometimes".parse::<OverwritePolicy>().is_err());
    }

    #[test]
    fn sender_frame_untagged() {
        let header: SenderFrame = serde_json::from_str(r#"{"idx": 3, "len": 42}"#).unwrap();
        assert!(matches!(header, SenderFrame::Header(FileHeader { idx: 3, len: 42 })));

        let outcome: SenderFrame = serde_json::from_str(
            r#"{"outcome":"ok","files_ok":1,"files_skipped":0,"files_err":0,"bytes_ok":7,"errors":[]}"#,
        )
        .unwrap();
        assert!(matches!(outcome, SenderFrame::Outcome(_)));
    }

    #[test]
    fn request_roundtrip() {
        let req = Request::with_params(api::OPEN, OpenParams { name: "music".into() });
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.api, "open");
        let params: OpenParams = serde_json::from_value(back.params).unwrap();
        assert_eq!(params.name, "music");
    }
}
