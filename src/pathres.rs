//! Path safety layer: every client-supplied path must resolve inside the
//! bound sharing's root, through symlinks included.

use crate::protocol::ErrorCode;
use std::path::{Component, Path, PathBuf};

// Longest single component name we accept (bytes)
const NAME_MAX: usize = 255;

/// Resolve `input` against a sharing rooted at `root` with working directory
/// `cwd` (an absolute path inside `root`; `root` itself must be canonical).
///
/// A leading `/` means sharing-root-relative; anything else is cwd-relative.
/// `.` and `..` collapse lexically, then symlinks are resolved and ancestry
/// is re-checked, so a link may not redirect outside the sharing.
pub fn resolve(root: &Path, cwd: &Path, input: &str) -> Result<PathBuf, ErrorCode> {
    if input.is_empty() {
        return Ok(cwd.to_path_buf());
    }
    if input.contains('\0') {
        return Err(ErrorCode::InvalidArgument);
    }

    let rooted = input.starts_with('/');
    let base = if rooted { root } else { cwd };

    // Stack of components below root, seeded from the base
    let mut stack: Vec<std::ffi::OsString> = base
        .strip_prefix(root)
        .map_err(|_| ErrorCode::PathEscapesSharing)?
        .components()
        .map(|c| c.as_os_str().to_os_string())
        .collect();

    for comp in Path::new(input).components() {
        match comp {
            Component::CurDir | Component::RootDir => {}
            Component::Prefix(_) => return Err(ErrorCode::InvalidArgument),
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(ErrorCode::PathEscapesSharing);
                }
            }
            Component::Normal(name) => {
                if name.len() > NAME_MAX {
                    return Err(ErrorCode::InvalidArgument);
                }
                stack.push(name.to_os_string());
            }
        }
    }

    let mut candidate = root.to_path_buf();
    for part in &stack {
        candidate.push(part);
    }

    // Resolve symlinks on the existing prefix, keep the non-existing tail
    let mut existing = candidate.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() && existing != *root {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Err(ErrorCode::PathEscapesSharing),
        }
    }

    let mut resolved = existing.canonicalize().map_err(|e| ErrorCode::from_io(&e))?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }

    if resolved == *root || resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(ErrorCode::PathEscapesSharing)
    }
}

/// Render an absolute path inside the sharing as the client-visible
/// root-relative form (`/`, `/a/b`, ...).
pub fn display_relative(root: &Path, abs: &Path) -> String {
    match abs.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
        Ok(rel) => format!("/{}", rel.display()),
        Err(_) => abs.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn root() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        (tmp, root)
    }

    #[test]
    fn empty_input_is_cwd() {
        let (_tmp, root) = root();
        let cwd = root.join("sub");
        fs::create_dir(&cwd).unwrap();
        assert_eq!(resolve(&root, &cwd, "").unwrap(), cwd);
    }

    #[test]
    fn relative_joins_cwd_and_rooted_joins_root() {
        let (_tmp, root) = root();
        let cwd = root.join("a");
        fs::create_dir(&cwd).unwrap();
        assert_eq!(resolve(&root, &cwd, "b.txt").unwrap(), cwd.join("b.txt"));
        assert_eq!(resolve(&root, &cwd, "/c.txt").unwrap(), root.join("c.txt"));
    }

    #[test]
    fn dotdot_collapses_but_cannot_escape() {
        let (_tmp, root) = root();
        fs::create_dir(root.join("a")).unwrap();
        let cwd = root.join("a");
        assert_eq!(resolve(&root, &cwd, "..").unwrap(), root);
        assert_eq!(
            resolve(&root, &cwd, "../..").unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(
            resolve(&root, &root, "../../etc").unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(resolve(&root, &cwd, "x/../y").unwrap(), cwd.join("y"));
    }

    #[test]
    fn nul_and_oversized_names_rejected() {
        let (_tmp, root) = root();
        assert_eq!(
            resolve(&root, &root, "fi\0le").unwrap_err(),
            ErrorCode::InvalidArgument
        );
        let long = "x".repeat(300);
        assert_eq!(resolve(&root, &root, &long).unwrap_err(), ErrorCode::InvalidArgument);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_rejected() {
        let (_tmp, root) = root();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("leak")).unwrap();

        assert_eq!(
            resolve(&root, &root, "leak").unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
        assert_eq!(
            resolve(&root, &root, "leak/secret").unwrap_err(),
            ErrorCode::PathEscapesSharing
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_inside_root_resolves() {
        let (_tmp, root) = root();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/f"), b"x").unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        assert_eq!(resolve(&root, &root, "alias/f").unwrap(), root.join("real/f"));
    }

    #[test]
    fn nonexistent_tail_is_kept() {
        let (_tmp, root) = root();
        fs::create_dir(root.join("d")).unwrap();
        assert_eq!(
            resolve(&root, &root, "d/new/file.bin").unwrap(),
            root.join("d/new/file.bin")
        );
    }

    #[test]
    fn display_relative_forms() {
        let (_tmp, root) = root();
        assert_eq!(display_relative(&root, &root), "/");
        assert_eq!(display_relative(&root, &root.join("a/b")), "/a/b");
    }
}
