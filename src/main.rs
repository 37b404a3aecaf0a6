//! es - the easyshare client. One-shot commands or an interactive session
//! against a server found by LAN discovery or direct address.

use anyhow::anyhow;
use clap::Parser;
use easyshare::client::{self, ClientError, Connection};
use easyshare::protocol::{
    EntryKind, FileEntry, LsParams, OverwritePolicy, TreeParams, DEFAULT_DISCOVER_PORT,
    DEFAULT_DISCOVER_WAIT_MS,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "es", version, about = "easyshare client")]
struct Cli {
    /// UDP port servers listen on for discovery probes
    #[arg(short = 'd', long, default_value_t = DEFAULT_DISCOVER_PORT)]
    discover_port: u16,

    /// Seconds to wait for discovery replies
    #[arg(short = 'w', long, default_value_t = DEFAULT_DISCOVER_WAIT_MS as f64 / 1000.0)]
    discover_wait: f64,

    /// Log wire traffic
    #[arg(short = 't', long)]
    trace: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Command with its arguments; interactive mode when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// The explicit client context: current connection plus discovery settings.
/// Every command receives this instead of reaching for globals.
struct Context {
    connection: Option<Connection>,
    discover_port: u16,
    discover_wait: Duration,
    interactive: bool,
}

impl Context {
    fn connection(&mut self) -> Result<&mut Connection, ClientError> {
        self.connection
            .as_mut()
            .ok_or_else(|| ClientError::Local(anyhow!("not connected; use open or connect")))
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.trace, cli.no_color);

    let mut ctx = Context {
        connection: None,
        discover_port: cli.discover_port,
        discover_wait: Duration::from_secs_f64(cli.discover_wait),
        interactive: cli.command.is_empty(),
    };

    let code = if cli.command.is_empty() {
        interactive(&mut ctx)
    } else {
        let (cmd, args) = cli.command.split_first().expect("nonempty");
        match run_command(&mut ctx, cmd, args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("es: {e}");
                1
            }
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool, trace: bool, no_color: bool) {
    let filter = if trace {
        EnvFilter::new("debug,wire=trace")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_writer(std::io::stderr)
        .init();
}

fn interactive(ctx: &mut Context) -> i32 {
    let stdin = std::io::stdin();
    loop {
        print!("es> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return 0,
            Ok(_) => {}
            Err(_) => return 1,
        }
        let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let Some((cmd, args)) = tokens.split_first() else { continue };
        if cmd == "exit" || cmd == "quit" {
            return 0;
        }
        match run_command(ctx, cmd, args) {
            Ok(_) => {}
            Err(e) => {
                eprintln!("es: {e}");
                if e.is_connection_loss() {
                    ctx.connection = None;
                }
            }
        }
    }
}

fn run_command(ctx: &mut Context, cmd: &str, args: &[String]) -> Result<i32, ClientError> {
    match cmd {
        "scan" => {
            for descriptor in client::scan(ctx.discover_port, ctx.discover_wait) {
                let sharings: Vec<&str> =
                    descriptor.sharings.iter().map(|s| s.name.as_str()).collect();
                println!(
                    "{} {}:{}{}  [{}]",
                    descriptor.name,
                    descriptor.address,
                    descriptor.port,
                    if descriptor.ssl { " (ssl)" } else { "" },
                    sharings.join(", ")
                );
            }
            Ok(0)
        }
        "connect" => {
            let target = args.first().ok_or_else(|| usage("connect <host[:port]>"))?;
            connect_to(ctx, target)?;
            Ok(0)
        }
        "open" => {
            let name = args.first().ok_or_else(|| usage("open <sharing>"))?;
            if ctx.connection.is_none() {
                let descriptor =
                    client::locate_sharing(name, ctx.discover_port, ctx.discover_wait)
                        .ok_or_else(|| {
                            ClientError::Local(anyhow!("no server exposes sharing {name:?}"))
                        })?;
                establish(ctx, &descriptor.address, descriptor.port, descriptor.ssl, descriptor.auth)?;
            }
            ctx.connection()?.open(name)?;
            Ok(0)
        }
        "close" => {
            ctx.connection()?.close()?;
            Ok(0)
        }
        "ping" => {
            let reply = ctx.connection()?.ping("ping")?;
            println!("{} (server time {})", reply.echo, reply.time_ms);
            Ok(0)
        }
        "info" => {
            let conn = ctx.connection()?;
            let descriptor = conn.info()?;
            let handshake_fp = conn.fingerprint();
            println!("name:     {}", descriptor.name);
            println!("address:  {}:{}", descriptor.address, descriptor.port);
            println!("discover: {}", descriptor.discover_port);
            println!("version:  {}", descriptor.version);
            println!("ssl:      {}", descriptor.ssl);
            println!("auth:     {}", descriptor.auth);
            println!("rexec:    {}", descriptor.rexec);
            if let Some(fp) = descriptor.fingerprint.or(handshake_fp) {
                println!("cert:     sha256:{fp}");
            }
            for s in &descriptor.sharings {
                println!(
                    "sharing:  {}{}",
                    s.name,
                    if s.read_only { " (read-only)" } else { "" }
                );
            }
            Ok(0)
        }
        "list" => {
            for s in ctx.connection()?.list()? {
                println!("{}{}", s.name, if s.read_only { " (read-only)" } else { "" });
            }
            Ok(0)
        }
        "rpwd" => {
            println!("{}", ctx.connection()?.rpwd()?);
            Ok(0)
        }
        "rcd" => {
            let cwd = ctx.connection()?.rcd(args.first().map(String::as_str))?;
            println!("{cwd}");
            Ok(0)
        }
        "rls" => {
            let (flags, paths) = split_flags(args);
            let params = LsParams {
                path: paths.first().cloned(),
                all: flags.contains(&'a'),
                dirs_first: flags.contains(&'g'),
                reverse: flags.contains(&'r'),
                by_size: flags.contains(&'S'),
            };
            let long = flags.contains(&'l');
            for entry in ctx.connection()?.rls(&params)? {
                if long {
                    print_entry_long(&entry);
                } else {
                    print_entry(&entry, 0);
                }
            }
            Ok(0)
        }
        "rtree" => {
            let (flags, mut paths) = split_flags(args);
            let mut max_depth = None;
            paths.retain(|p| match p.strip_prefix("--depth=") {
                Some(value) => {
                    max_depth = value.parse::<usize>().ok();
                    false
                }
                None => true,
            });
            let params = TreeParams {
                path: paths.first().cloned(),
                max_depth,
                all: flags.contains(&'a'),
            };
            for item in ctx.connection()?.rtree(&params)? {
                print_entry(&item.entry, item.depth);
            }
            Ok(0)
        }
        "rmkdir" => {
            let path = args.first().ok_or_else(|| usage("rmkdir <dir>"))?;
            ctx.connection()?.rmkdir(path)?;
            Ok(0)
        }
        "rmv" | "rcp" => {
            if args.len() < 2 {
                return Err(usage(if cmd == "rmv" { "rmv <src>... <dest>" } else { "rcp <src>... <dest>" }));
            }
            let (dest, sources) = args.split_last().expect("checked len");
            let conn = ctx.connection()?;
            let outcomes = if cmd == "rmv" {
                conn.rmv(sources.to_vec(), dest)?
            } else {
                conn.rcp(sources.to_vec(), dest)?
            };
            report_outcomes(&outcomes);
            Ok(0)
        }
        "rrm" => {
            if args.is_empty() {
                return Err(usage("rrm <path>..."));
            }
            let outcomes = ctx.connection()?.rrm(args.to_vec())?;
            report_outcomes(&outcomes);
            Ok(0)
        }
        "rfind" => {
            let pattern = args.first().ok_or_else(|| usage("rfind <pattern>"))?;
            for entry in ctx.connection()?.rfind(pattern)? {
                print_entry(&entry, 0);
            }
            Ok(0)
        }
        "get" => {
            let (policy, paths) = split_policy(args)?;
            if paths.is_empty() {
                return Err(usage("get [--overwrite=POLICY] <path>..."));
            }
            let interactive = ctx.interactive;
            let conn = ctx.connection()?;
            let stats = conn.get(
                paths,
                policy,
                &std::env::current_dir().map_err(|e| ClientError::Local(e.into()))?,
                &mut ask_overwrite(interactive),
            )?;
            println!(
                "files: {} ok, {} skipped, {} failed; bytes: {}",
                stats.files_ok, stats.files_skipped, stats.files_err, stats.bytes_ok
            );
            Ok(0)
        }
        "put" => {
            let (policy, paths) = split_policy(args)?;
            if paths.is_empty() {
                return Err(usage("put [--overwrite=POLICY] <path>..."));
            }
            let local: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
            let interactive = ctx.interactive;
            let conn = ctx.connection()?;
            let stats = conn.put(&local, policy, &mut ask_overwrite(interactive))?;
            let remote = stats.remote.as_ref();
            println!(
                "files: {} ok, {} skipped, {} failed; bytes: {}",
                remote.map_or(stats.files_ok, |o| o.files_ok),
                remote.map_or(stats.files_skipped, |o| o.files_skipped),
                remote.map_or(stats.files_err, |o| o.files_err),
                remote.map_or(stats.bytes_ok, |o| o.bytes_ok),
            );
            Ok(0)
        }
        "rexec" => {
            if args.is_empty() {
                return Err(usage("rexec <command>"));
            }
            let cmd_line = args.join(" ");
            let code = ctx.connection()?.rexec(Some(&cmd_line))?;
            Ok(code)
        }
        "rshell" => {
            let code = ctx.connection()?.rexec(None)?;
            Ok(code)
        }
        "help" => {
            print_help();
            Ok(0)
        }
        other => Err(ClientError::Local(anyhow!("unknown command: {other}; try help"))),
    }
}

/// Connect to `host[:port]`, learning ssl/auth from a unicast discovery
/// probe when the server answers one.
fn connect_to(ctx: &mut Context, target: &str) -> Result<(), ClientError> {
    let (host, port) = match target.rsplit_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse::<u16>()
                .map_err(|_| ClientError::Local(anyhow!("bad port in {target:?}")))?,
        ),
        None => (target.to_string(), easyshare::protocol::DEFAULT_CONTROL_PORT),
    };
    let probed = client::probe_host(&host, ctx.discover_port, Duration::from_millis(500));
    let (ssl, auth) = probed.map(|d| (d.ssl, d.auth)).unwrap_or((false, false));
    establish(ctx, &host, port, ssl, auth)
}

fn establish(
    ctx: &mut Context,
    host: &str,
    port: u16,
    ssl: bool,
    auth: bool,
) -> Result<(), ClientError> {
    let mut connection = Connection::connect(host, port, ssl).map_err(ClientError::Local)?;
    connection.show_progress = ctx.interactive;
    if auth {
        let password = read_password()?;
        connection.auth(&password)?;
    }
    ctx.connection = Some(connection);
    Ok(())
}

fn read_password() -> Result<String, ClientError> {
    print!("password: ");
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|e| ClientError::Local(e.into()))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// `-abc` style flags in front of positional arguments.
fn split_flags(args: &[String]) -> (Vec<char>, Vec<String>) {
    let mut flags = Vec::new();
    let mut rest = Vec::new();
    for arg in args {
        if let Some(stripped) = arg.strip_prefix('-') {
            if !stripped.is_empty() && !stripped.starts_with('-') {
                flags.extend(stripped.chars());
                continue;
            }
        }
        rest.push(arg.clone());
    }
    (flags, rest)
}

fn split_policy(args: &[String]) -> Result<(OverwritePolicy, Vec<String>), ClientError> {
    let mut policy = OverwritePolicy::Prompt;
    let mut rest = Vec::new();
    for arg in args {
        if let Some(value) = arg.strip_prefix("--overwrite=") {
            policy = value
                .parse()
                .map_err(|e: String| ClientError::Local(anyhow!(e)))?;
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((policy, rest))
}

fn ask_overwrite(interactive: bool) -> impl FnMut(&FileEntry) -> bool {
    move |entry: &FileEntry| {
        if !interactive {
            // One-shot runs cannot ask; leave existing files alone
            return false;
        }
        print!("overwrite {}? [y/N] ", entry.path);
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

fn print_entry(entry: &FileEntry, depth: usize) {
    let indent = "  ".repeat(depth.saturating_sub(1));
    match entry.kind {
        EntryKind::Directory => println!("{indent}{}/", entry.path),
        EntryKind::Symlink => println!(
            "{indent}{} -> {}",
            entry.path,
            entry.target.as_deref().unwrap_or("?")
        ),
        EntryKind::File => println!("{indent}{:>10}  {}", entry.size, entry.path),
    }
}

fn print_entry_long(entry: &FileEntry) {
    let kind = match entry.kind {
        EntryKind::Directory => 'd',
        EntryKind::Symlink => 'l',
        EntryKind::File => '-',
    };
    let mtime_secs = entry.mtime / 1_000_000_000;
    println!("{kind}{:04o} {:>12} {:>12} {}", entry.mode & 0o7777, entry.size, mtime_secs, entry.path);
}

fn report_outcomes(outcomes: &[easyshare::protocol::EntryOutcome]) {
    for outcome in outcomes {
        if !outcome.ok {
            let code = outcome.error.map(|c| c.to_string()).unwrap_or_default();
            eprintln!("es: {}: {}", outcome.path, code);
        }
    }
}

fn usage(text: &str) -> ClientError {
    ClientError::Local(anyhow!("usage: {text}"))
}

fn print_help() {
    println!(
        "\
commands:
  scan                          find servers on the LAN
  connect <host[:port]>         connect to a server directly
  open <sharing>                discover and bind a sharing
  close                         unbind the current sharing
  info | list | ping            server information
  rpwd | rcd [dir]              remote working directory
  rls [-agrS] [dir]             list remote directory
  rtree [-a] [--depth=N] [dir]  recursive remote listing
  rmkdir <dir>                  create remote directory
  rmv <src>... <dest>           move remote entries
  rcp <src>... <dest>           copy remote entries
  rrm <path>...                 remove remote entries
  rfind <pattern>               glob search under the remote cwd
  get [--overwrite=P] <path>... download (P: prompt|yes|no|newer|different-size)
  put [--overwrite=P] <path>... upload
  rexec <command>               run a command on the server
  rshell                        remote shell
  exit | quit                   leave"
    );
}

// Dead simple sanity checks for the arg helpers; the interesting paths are
// covered by the integration tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_split_from_paths() {
        let args = vec!["-aS".to_string(), "docs".to_string()];
        let (flags, rest) = split_flags(&args);
        assert_eq!(flags, vec!['a', 'S']);
        assert_eq!(rest, vec!["docs"]);
    }

    #[test]
    fn policy_split() {
        let args = vec!["--overwrite=newer".to_string(), "f1".to_string()];
        let (policy, rest) = split_policy(&args).unwrap();
        assert_eq!(policy, OverwritePolicy::Newer);
        assert_eq!(rest, vec!["f1"]);
        assert!(split_policy(&["--overwrite=nope".to_string()]).is_err());
    }
}
