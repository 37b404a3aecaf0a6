//! Named sharings and the filesystem service scoped to one sharing.
//!
//! Every path reaching these functions has already been through
//! [`crate::pathres::resolve`], so they operate on absolute paths inside a
//! sharing root. Batch operations report per-entry outcomes instead of one
//! aggregate status.

use crate::protocol::{
    EntryKind, EntryOutcome, ErrorCode, FileEntry, LsParams, SharingDescriptor, SharingKind,
    TreeEntry, MAX_SHARING_NAME_LEN,
};
use anyhow::{bail, Context};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const COPY_BUF_SIZE: usize = 256 * 1024;

/// A registered sharing. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct Sharing {
    pub name: String,
    /// Canonical absolute root
    pub root: PathBuf,
    pub kind: SharingKind,
    pub read_only: bool,
}

impl Sharing {
    /// Register a sharing; the name defaults to the path's basename.
    pub fn register(name: Option<&str>, path: &Path, read_only: bool) -> anyhow::Result<Sharing> {
        let root = path
            .canonicalize()
            .with_context(|| format!("sharing path {}", path.display()))?;
        let kind = if root.is_dir() { SharingKind::Directory } else { SharingKind::File };
        let name = match name {
            Some(n) => n.to_string(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("sharing path has no basename; give it a name")?,
        };
        validate_name(&name)?;
        Ok(Sharing { name, root, kind, read_only })
    }

    pub fn descriptor(&self) -> SharingDescriptor {
        SharingDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            read_only: self.read_only,
        }
    }
}

/// Sharing names are `[A-Za-z0-9._-]+`, at most 64 chars, and distinct from
/// the on-disk path.
pub fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() || name.len() > MAX_SHARING_NAME_LEN {
        bail!("sharing name must be 1..={} chars: {:?}", MAX_SHARING_NAME_LEN, name);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        bail!("sharing name may only contain [A-Za-z0-9._-]: {:?}", name);
    }
    Ok(())
}

/// Build a wire entry for `path`, relative to `base`. Symlinks are described,
/// not followed.
pub fn file_entry(base: &Path, path: &Path) -> Result<FileEntry, ErrorCode> {
    let md = fs::symlink_metadata(path).map_err(|e| ErrorCode::from_io(&e))?;
    let rel = path.strip_prefix(base).unwrap_or(path);
    let rel = if rel.as_os_str().is_empty() {
        // The base itself (file sharings)
        path.file_name().map(PathBuf::from).unwrap_or_default()
    } else {
        rel.to_path_buf()
    };

    let (kind, size, target) = if md.file_type().is_symlink() {
        let target = fs::read_link(path).ok().map(|t| t.to_string_lossy().to_string());
        (EntryKind::Symlink, 0, target)
    } else if md.is_dir() {
        (EntryKind::Directory, 0, None)
    } else {
        (EntryKind::File, md.len(), None)
    };

    Ok(FileEntry {
        path: rel.to_string_lossy().to_string(),
        kind,
        size,
        mtime: mtime_ns(&md),
        mode: mode_bits(&md),
        target,
    })
}

pub fn mtime_ns(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
pub fn mode_bits(md: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode()
}

#[cfg(not(unix))]
pub fn mode_bits(_md: &fs::Metadata) -> u32 {
    0
}

fn hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// List one directory. Order: lexical, with directories-first, reverse and
/// size-sort options. Listing a file yields that single entry.
pub fn ls(dir: &Path, params: &LsParams) -> Result<Vec<FileEntry>, ErrorCode> {
    let md = fs::symlink_metadata(dir).map_err(|e| ErrorCode::from_io(&e))?;
    if !md.is_dir() {
        return Ok(vec![file_entry(dir.parent().unwrap_or(dir), dir)?]);
    }

    let mut entries = Vec::new();
    let rd = fs::read_dir(dir).map_err(|e| ErrorCode::from_io(&e))?;
    for item in rd {
        let item = item.map_err(|e| ErrorCode::from_io(&e))?;
        let name = item.file_name().to_string_lossy().to_string();
        if !params.all && hidden(&name) {
            continue;
        }
        entries.push(file_entry(dir, &item.path())?);
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    if params.by_size {
        entries.sort_by(|a, b| b.size.cmp(&a.size));
    }
    if params.dirs_first {
        entries.sort_by_key(|e| e.kind != EntryKind::Directory);
    }
    if params.reverse {
        entries.reverse();
    }
    Ok(entries)
}

/// Pre-order DFS over `dir`, entries tagged with depth. Symlinks are listed
/// but never followed.
pub fn tree(
    dir: &Path,
    max_depth: Option<usize>,
    all: bool,
) -> Result<Vec<TreeEntry>, ErrorCode> {
    let md = fs::symlink_metadata(dir).map_err(|e| ErrorCode::from_io(&e))?;
    if !md.is_dir() {
        return Err(ErrorCode::NotADirectory);
    }

    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(false);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let mut out = Vec::new();
    for item in walker
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|e| all || !hidden(&e.file_name().to_string_lossy()))
    {
        let item = match item {
            Ok(i) => i,
            // Unreadable subtrees are skipped, not fatal
            Err(_) => continue,
        };
        out.push(TreeEntry {
            entry: file_entry(dir, item.path())?,
            depth: item.depth(),
        });
    }
    Ok(out)
}

/// Create `path` and any missing parents; fine if it is already a directory.
pub fn mkdir(path: &Path) -> Result<(), ErrorCode> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path).map_err(|e| ErrorCode::from_io(&e))
}

/// Move sources onto/into `dest`. A single source follows rename-or-into-dir
/// semantics; multiple sources require an existing directory target.
/// Cross-device renames fall back to copy+unlink.
pub fn mv(sources: &[(String, PathBuf)], dest: &Path) -> Result<Vec<EntryOutcome>, ErrorCode> {
    if sources.len() > 1 && !dest.is_dir() {
        return Err(ErrorCode::NotADirectory);
    }

    let mut outcomes = Vec::with_capacity(sources.len());
    for (display, src) in sources {
        let target = if dest.is_dir() {
            match src.file_name() {
                Some(name) => dest.join(name),
                None => {
                    outcomes.push(failure(display, ErrorCode::InvalidArgument));
                    continue;
                }
            }
        } else {
            dest.to_path_buf()
        };

        let result = match fs::rename(src, &target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
                copy_recursive(src, &target)
                    .and_then(|_| remove_any(src))
                    .map_err(|e| ErrorCode::from_io(&e))
            }
            Err(e) => Err(ErrorCode::from_io(&e)),
        };
        outcomes.push(match result {
            Ok(()) => success(display),
            Err(code) => failure(display, code),
        });
    }
    Ok(outcomes)
}

/// Copy sources onto/into `dest`; recursive for directories, preserving
/// mtime and mode.
pub fn cp(sources: &[(String, PathBuf)], dest: &Path) -> Result<Vec<EntryOutcome>, ErrorCode> {
    if sources.len() > 1 && !dest.is_dir() {
        return Err(ErrorCode::NotADirectory);
    }

    let mut outcomes = Vec::with_capacity(sources.len());
    for (display, src) in sources {
        let target = if dest.is_dir() {
            match src.file_name() {
                Some(name) => dest.join(name),
                None => {
                    outcomes.push(failure(display, ErrorCode::InvalidArgument));
                    continue;
                }
            }
        } else {
            dest.to_path_buf()
        };
        outcomes.push(match copy_recursive(src, &target) {
            Ok(()) => success(display),
            Err(e) => failure(display, ErrorCode::from_io(&e)),
        });
    }
    Ok(outcomes)
}

/// Remove entries, recursively for directories; never prompts. Missing
/// entries are silently skipped.
pub fn rm(paths: &[(String, PathBuf)]) -> Vec<EntryOutcome> {
    let mut outcomes = Vec::with_capacity(paths.len());
    for (display, path) in paths {
        match fs::symlink_metadata(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                outcomes.push(success(display));
            }
            Err(e) => outcomes.push(failure(display, ErrorCode::from_io(&e))),
            Ok(_) => outcomes.push(match remove_any(path) {
                Ok(()) => success(display),
                Err(e) => failure(display, ErrorCode::from_io(&e)),
            }),
        }
    }
    outcomes
}

/// Glob search under `base`. The pattern matches against relative paths with
/// `*`, `?` and character classes.
pub fn find(base: &Path, pattern: &str) -> Result<Vec<FileEntry>, ErrorCode> {
    let matcher = globset::GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
        .map_err(|_| ErrorCode::InvalidArgument)?
        .compile_matcher();

    let mut out = Vec::new();
    for item in WalkDir::new(base)
        .min_depth(1)
        .follow_links(false)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let rel = item.path().strip_prefix(base).unwrap_or(item.path());
        if matcher.is_match(rel) {
            out.push(file_entry(base, item.path())?);
        }
    }
    Ok(out)
}

fn success(display: &str) -> EntryOutcome {
    EntryOutcome { path: display.to_string(), ok: true, error: None }
}

fn failure(display: &str, code: ErrorCode) -> EntryOutcome {
    EntryOutcome { path: display.to_string(), ok: false, error: Some(code) }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let md = fs::symlink_metadata(path)?;
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file or a whole tree, carrying over mtime and permission bits.
pub fn copy_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    let md = fs::symlink_metadata(src)?;
    if md.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, dst)?;
        #[cfg(not(unix))]
        let _ = target;
        return Ok(());
    }
    if md.is_dir() {
        fs::create_dir_all(dst)?;
        for item in fs::read_dir(src)? {
            let item = item?;
            copy_recursive(&item.path(), &dst.join(item.file_name()))?;
        }
        preserve_meta(&md, dst)?;
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;
    drop(writer);
    preserve_meta(&md, dst)?;
    Ok(())
}

/// Apply a source's mode and mtime onto `dst`.
pub fn preserve_meta(src_md: &fs::Metadata, dst: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dst, fs::Permissions::from_mode(mode_bits(src_md)))?;
    }
    if let Ok(modified) = src_md.modified() {
        let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(modified));
    }
    Ok(())
}

/// Apply explicit wire-carried mode and mtime (ns) onto `dst`.
pub fn apply_meta(dst: &Path, mode: u32, mtime_ns: i64) -> std::io::Result<()> {
    #[cfg(unix)]
    if mode != 0 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    let secs = mtime_ns.div_euclid(1_000_000_000);
    let nanos = mtime_ns.rem_euclid(1_000_000_000) as u32;
    let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_unix_time(secs, nanos));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree_fixture() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::create_dir(root.join("docs")).unwrap();
        fs::write(root.join("docs/a.txt"), b"aaa").unwrap();
        fs::write(root.join("docs/b.txt"), b"bb").unwrap();
        fs::write(root.join("zz.bin"), b"z").unwrap();
        fs::write(root.join(".hidden"), b"h").unwrap();
        (tmp, root)
    }

    #[test]
    fn register_validates_name_and_kind() {
        let (_tmp, root) = tree_fixture();
        let s = Sharing::register(None, &root.join("docs"), false).unwrap();
        assert_eq!(s.name, "docs");
        assert_eq!(s.kind, SharingKind::Directory);

        let f = Sharing::register(Some("one"), &root.join("zz.bin"), true).unwrap();
        assert_eq!(f.kind, SharingKind::File);
        assert!(f.read_only);

        assert!(Sharing::register(Some("bad name"), &root, false).is_err());
        assert!(Sharing::register(Some(&"x".repeat(65)), &root, false).is_err());
        assert!(Sharing::register(Some("ok-name_1.2"), &root, false).is_ok());
    }

    #[test]
    fn ls_order_and_flags() {
        let (_tmp, root) = tree_fixture();
        let names: Vec<_> = ls(&root, &LsParams::default())
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["docs", "zz.bin"]);

        let all: Vec<_> = ls(&root, &LsParams { all: true, ..Default::default() })
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(all, vec![".hidden", "docs", "zz.bin"]);

        let reversed: Vec<_> = ls(&root, &LsParams { reverse: true, ..Default::default() })
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(reversed, vec!["zz.bin", "docs"]);

        let sizes: Vec<_> = ls(&root.join("docs"), &LsParams { by_size: true, ..Default::default() })
            .unwrap()
            .into_iter()
            .map(|e| (e.path, e.size))
            .collect();
        assert_eq!(sizes, vec![("a.txt".to_string(), 3), ("b.txt".to_string(), 2)]);
    }

    #[test]
    fn ls_missing_dir_maps_not_found() {
        let (_tmp, root) = tree_fixture();
        assert_eq!(
            ls(&root.join("nope"), &LsParams::default()).unwrap_err(),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn tree_depths() {
        let (_tmp, root) = tree_fixture();
        let entries = tree(&root, None, false).unwrap();
        let docs = entries.iter().find(|e| e.entry.path == "docs").unwrap();
        assert_eq!(docs.depth, 1);
        let nested = entries.iter().find(|e| e.entry.path == "docs/a.txt").unwrap();
        assert_eq!(nested.depth, 2);

        let shallow = tree(&root, Some(1), false).unwrap();
        assert!(shallow.iter().all(|e| e.depth == 1));
    }

    #[test]
    fn mkdir_is_idempotent() {
        let (_tmp, root) = tree_fixture();
        let target = root.join("x/y/z");
        mkdir(&target).unwrap();
        assert!(target.is_dir());
        mkdir(&target).unwrap();

        // An existing file is not a directory
        assert!(mkdir(&root.join("zz.bin")).is_err());
    }

    #[test]
    fn mv_multiple_requires_dir_dest() {
        let (_tmp, root) = tree_fixture();
        let sources = vec![
            ("a.txt".to_string(), root.join("docs/a.txt")),
            ("b.txt".to_string(), root.join("docs/b.txt")),
        ];
        assert_eq!(
            mv(&sources, &root.join("zz.bin")).unwrap_err(),
            ErrorCode::NotADirectory
        );

        mkdir(&root.join("moved")).unwrap();
        let outcomes = mv(&sources, &root.join("moved")).unwrap();
        assert!(outcomes.iter().all(|o| o.ok));
        assert!(root.join("moved/a.txt").exists());
        assert!(!root.join("docs/a.txt").exists());
    }

    #[test]
    fn cp_preserves_contents_and_meta() {
        let (_tmp, root) = tree_fixture();
        let sources = vec![("docs".to_string(), root.join("docs"))];
        let outcomes = cp(&sources, &root.join("copy")).unwrap();
        assert!(outcomes[0].ok);
        assert_eq!(fs::read(root.join("copy/a.txt")).unwrap(), b"aaa");

        let src_md = fs::metadata(root.join("docs/a.txt")).unwrap();
        let dst_md = fs::metadata(root.join("copy/a.txt")).unwrap();
        assert_eq!(mode_bits(&src_md), mode_bits(&dst_md));
    }

    #[test]
    fn rm_skips_missing_and_recurses() {
        let (_tmp, root) = tree_fixture();
        let outcomes = rm(&[
            ("docs".to_string(), root.join("docs")),
            ("ghost".to_string(), root.join("ghost")),
        ]);
        assert!(outcomes.iter().all(|o| o.ok));
        assert!(!root.join("docs").exists());
    }

    #[test]
    fn find_globs() {
        let (_tmp, root) = tree_fixture();
        let txt: Vec<_> = find(&root, "*.txt").unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(txt, vec!["docs/a.txt", "docs/b.txt"]);

        let q: Vec<_> = find(&root, "docs/?.txt").unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(q.len(), 2);

        let class: Vec<_> = find(&root, "docs/[ab].txt").unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(class.len(), 2);

        assert_eq!(find(&root, "[bad").unwrap_err(), ErrorCode::InvalidArgument);
    }
}
