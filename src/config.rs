//! Server configuration file: line-based `key=value` with `[Sharing]`
//! sections. `[]` names the sharing after the on-disk basename. Values may be
//! quoted; booleans accept true/false/1/0/yes/no. CLI flags override file
//! values, which override built-in defaults.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Default, Clone)]
pub struct ServerSettings {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub discover_port: Option<u16>,
    pub name: Option<String>,
    pub password: Option<String>,
    pub rexec: Option<bool>,
    pub ssl: Option<bool>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_privkey: Option<PathBuf>,
    pub trace: Option<bool>,
    pub verbose: Option<bool>,
    pub no_color: Option<bool>,
    pub sharings: Vec<SharingEntry>,
}

/// One `[Name]` section. `name: None` means "use the path's basename".
#[derive(Debug, Clone)]
pub struct SharingEntry {
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    pub readonly: bool,
}

pub fn parse_file(path: &Path) -> Result<ServerSettings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_str(&text).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse_str(text: &str) -> Result<ServerSettings> {
    let mut settings = ServerSettings::default();
    let mut current: Option<SharingEntry> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            let Some(section) = section.strip_suffix(']') else {
                bail!("line {}: unterminated section header", lineno + 1);
            };
            if let Some(entry) = current.take() {
                settings.sharings.push(entry);
            }
            let name = section.trim();
            current = Some(SharingEntry {
                name: if name.is_empty() { None } else { Some(name.to_string()) },
                path: None,
                readonly: false,
            });
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            bail!("line {}: expected key=value, got {:?}", lineno + 1, line);
        };
        let key = key.trim();
        let value = unquote(value.trim());

        match current.as_mut() {
            Some(sharing) => match key {
                "path" => sharing.path = Some(PathBuf::from(value)),
                "readonly" => sharing.readonly = parse_bool(value, lineno)?,
                other => warn!(line = lineno + 1, key = other, "unknown sharing key, ignored"),
            },
            None => match key {
                "address" => settings.address = Some(value.to_string()),
                "port" => settings.port = Some(parse_port(value, lineno)?),
                "discover_port" => settings.discover_port = Some(parse_port(value, lineno)?),
                "name" => settings.name = Some(value.to_string()),
                "password" => settings.password = Some(value.to_string()),
                "rexec" => settings.rexec = Some(parse_bool(value, lineno)?),
                "ssl" => settings.ssl = Some(parse_bool(value, lineno)?),
                "ssl_cert" => settings.ssl_cert = Some(PathBuf::from(value)),
                "ssl_privkey" => settings.ssl_privkey = Some(PathBuf::from(value)),
                "trace" => settings.trace = Some(parse_bool(value, lineno)?),
                "verbose" => settings.verbose = Some(parse_bool(value, lineno)?),
                "no_color" => settings.no_color = Some(parse_bool(value, lineno)?),
                other => warn!(line = lineno + 1, key = other, "unknown config key, ignored"),
            },
        }
    }

    if let Some(entry) = current.take() {
        settings.sharings.push(entry);
    }
    Ok(settings)
}

fn unquote(value: &str) -> &str {
    let v = value.strip_prefix('"').and_then(|v| v.strip_suffix('"'));
    v.unwrap_or(value)
}

fn parse_bool(value: &str, lineno: usize) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("line {}: not a boolean: {:?}", lineno + 1, other),
    }
}

fn parse_port(value: &str, lineno: usize) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("line {}: not a port: {:?}", lineno + 1, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_and_sharing_sections() {
        let cfg = parse_str(
            r#"
# server side
name = "my server"
port = 12345
rexec = yes
ssl = 0

[music]
path = "/srv/music"
readonly = true

[]
path = /srv/stuff
"#,
        )
        .unwrap();

        assert_eq!(cfg.name.as_deref(), Some("my server"));
        assert_eq!(cfg.port, Some(12345));
        assert_eq!(cfg.rexec, Some(true));
        assert_eq!(cfg.ssl, Some(false));
        assert_eq!(cfg.sharings.len(), 2);
        assert_eq!(cfg.sharings[0].name.as_deref(), Some("music"));
        assert_eq!(cfg.sharings[0].path.as_deref(), Some(Path::new("/srv/music")));
        assert!(cfg.sharings[0].readonly);
        assert_eq!(cfg.sharings[1].name, None);
        assert!(!cfg.sharings[1].readonly);
    }

    #[test]
    fn bool_variants() {
        for (text, expected) in [("1", true), ("yes", true), ("TRUE", true), ("no", false), ("0", false), ("false", false)] {
            let cfg = parse_str(&format!("rexec={text}")).unwrap();
            assert_eq!(cfg.rexec, Some(expected), "value {text:?}");
        }
        assert!(parse_str("rexec=maybe").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = parse_str("colour=blue\nport=1\n").unwrap();
        assert_eq!(cfg.port, Some(1));
    }

    #[test]
    fn malformed_lines_fail() {
        assert!(parse_str("[unterminated\n").is_err());
        assert!(parse_str("no equals sign\n").is_err());
        assert!(parse_str("port=high\n").is_err());
    }
}
