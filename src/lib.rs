//! easyshare library
//!
//! LAN file sharing: named sharings served over a length-framed JSON
//! protocol, with UDP discovery, GET/PUT streaming transfers and optional
//! remote execution. The `es` (client) and `esd` (server) binaries are thin
//! shells over these modules.

pub mod auth;
pub mod client;
pub mod config;
pub mod discover;
pub mod pathres;
pub mod protocol;
pub mod rexec;
pub mod server;
pub mod session;
pub mod sharing;
pub mod stream;
pub mod tls;
pub mod transfer;
