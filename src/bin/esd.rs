//! esd - the easyshare server daemon. Serves named sharings over the framed
//! control protocol, with LAN discovery, optional TLS and optional remote
//! execution.

use anyhow::{bail, Context, Result};
use clap::Parser;
use easyshare::auth::Auth;
use easyshare::config::{self, ServerSettings};
use easyshare::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DISCOVER_PORT, DEFAULT_IDLE_TIMEOUT_SECS};
use easyshare::server::{Server, ServerOptions};
use easyshare::sharing::Sharing;
use easyshare::tls;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "esd", version, about = "easyshare server daemon")]
struct Cli {
    /// Address to bind
    #[arg(short = 'a', long)]
    address: Option<IpAddr>,

    /// Configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// UDP discovery port; 0 disables discovery
    #[arg(short = 'd', long)]
    discover_port: Option<u16>,

    /// Allow remote command execution (rexec/rshell)
    #[arg(short = 'e', long)]
    rexec: bool,

    /// Server name shown to clients
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Server password, plaintext or an es1$ hash string
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// Control port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// TLS certificate (PEM); enables TLS together with --ssl-privkey
    #[arg(long)]
    ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    ssl_privkey: Option<PathBuf>,

    /// Log wire traffic
    #[arg(short = 't', long)]
    trace: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Share PATH under NAME (NAME defaults to the basename)
    #[arg(value_names = ["SHARING_PATH", "SHARING_NAME"])]
    sharing: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.sharing.len() > 2 {
        bail!("at most one positional sharing: PATH [NAME]");
    }

    let settings = match &cli.config {
        Some(path) => config::parse_file(path)?,
        None => ServerSettings::default(),
    };

    // CLI flag > config value > built-in default
    let trace = cli.trace || settings.trace.unwrap_or(false);
    let verbose = cli.verbose || settings.verbose.unwrap_or(false);
    let no_color = cli.no_color || settings.no_color.unwrap_or(false);
    init_logging(verbose, trace, no_color);

    let address = match cli.address {
        Some(a) => a,
        None => match &settings.address {
            Some(text) => text
                .parse::<IpAddr>()
                .with_context(|| format!("config address {text:?}"))?,
            None => IpAddr::from([0, 0, 0, 0]),
        },
    };
    let port = cli.port.or(settings.port).unwrap_or(DEFAULT_CONTROL_PORT);
    let discover_port = cli
        .discover_port
        .or(settings.discover_port)
        .unwrap_or(DEFAULT_DISCOVER_PORT);
    let name = cli
        .name
        .or(settings.name.clone())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "easyshare".to_string());
    let password = cli.password.or(settings.password.clone());
    let rexec = cli.rexec || settings.rexec.unwrap_or(false);

    let sharings = collect_sharings(&cli.sharing, &settings)?;
    if sharings.is_empty() {
        bail!("no sharings configured; give a PATH or a config file with sections");
    }

    let ssl_cert = cli.ssl_cert.or(settings.ssl_cert.clone());
    let ssl_privkey = cli.ssl_privkey.or(settings.ssl_privkey.clone());
    let ssl_enabled =
        settings.ssl.unwrap_or(false) || ssl_cert.is_some() || ssl_privkey.is_some();
    let tls = if ssl_enabled {
        Some(tls::server_tls(ssl_cert.as_deref(), ssl_privkey.as_deref(), &name)?)
    } else {
        None
    };

    let mut opts = ServerOptions::new(&name, sharings);
    opts.address = address;
    opts.port = port;
    opts.discover_port = discover_port;
    opts.auth = Auth::from_secret(password.as_deref());
    opts.rexec = rexec;
    opts.tls = tls;
    opts.idle_timeout = Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS);

    let server = Server::bind(opts)?;
    let descriptor = server.descriptor();
    println!("esd {} - {}", env!("CARGO_PKG_VERSION"), descriptor.name);
    println!("  control:  {}:{}", address, server.local_port());
    println!(
        "  discover: {}",
        if descriptor.discover_port == 0 {
            "disabled".to_string()
        } else {
            descriptor.discover_port.to_string()
        }
    );
    println!("  ssl:      {}", descriptor.ssl);
    println!("  auth:     {}", descriptor.auth);
    println!("  rexec:    {}", descriptor.rexec);
    for sharing in &descriptor.sharings {
        println!(
            "  sharing:  {}{}",
            sharing.name,
            if sharing.read_only { " (read-only)" } else { "" }
        );
    }

    server.run()
}

fn init_logging(verbose: bool, trace: bool, no_color: bool) {
    let filter = if trace {
        EnvFilter::new("debug,wire=trace")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_ansi(!no_color).init();
}

fn collect_sharings(positional: &[String], settings: &ServerSettings) -> Result<Vec<Sharing>> {
    let mut sharings = Vec::new();
    for entry in &settings.sharings {
        let path = entry
            .path
            .as_ref()
            .with_context(|| format!("sharing {:?} has no path", entry.name))?;
        sharings.push(Sharing::register(entry.name.as_deref(), path, entry.readonly)?);
    }
    if let Some(path) = positional.first() {
        let name = positional.get(1).map(String::as_str);
        sharings.push(Sharing::register(name, Path::new(path), false)?);
    }

    for (i, a) in sharings.iter().enumerate() {
        if sharings.iter().skip(i + 1).any(|b| b.name == a.name) {
            bail!("duplicate sharing name {:?}", a.name);
        }
    }
    Ok(sharings)
}
