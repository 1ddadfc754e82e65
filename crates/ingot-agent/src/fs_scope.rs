//! Confinement of user-supplied paths to a tenant's sandbox root.
//!
//! Every filesystem-touching engine operation routes its inputs through
//! [`resolve`] (or [`resolve_encoded`] for raw, percent-encoded request
//! segments) before any I/O happens.

use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::EngineError;

fn normalize_rel_path(rel: &str) -> Result<PathBuf, EngineError> {
    if rel.contains('\0') {
        return Err(EngineError::invalid_path("path contains a NUL byte"));
    }
    if rel.trim().is_empty() {
        return Ok(PathBuf::new());
    }

    let p = Path::new(rel);
    if p.is_absolute() || rel.starts_with('/') || rel.starts_with('\\') {
        return Err(EngineError::invalid_path("path must be relative"));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(EngineError::invalid_path("path traversal is not allowed"));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(EngineError::invalid_path("path must be relative"));
            }
        }
    }

    Ok(out)
}

/// Relative path from `root` to `target`, computed lexically.
///
/// Returns `None` when `target` is not below `root`, which is the same as the
/// relative path starting with a parent-traversal token.
fn relative_from(root: &Path, target: &Path) -> Option<PathBuf> {
    let rel = target.strip_prefix(root).ok()?;
    if rel.is_absolute()
        || rel
            .components()
            .next()
            .is_some_and(|c| matches!(c, Component::ParentDir))
    {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Resolve `rel` below `sandbox_root`. Pure: no filesystem access.
pub fn resolve(sandbox_root: &Path, rel: &str) -> Result<PathBuf, EngineError> {
    let rel = normalize_rel_path(rel)?;
    let target = sandbox_root.join(&rel);
    if relative_from(sandbox_root, &target).is_none() {
        return Err(EngineError::invalid_path("path escapes sandbox root"));
    }
    Ok(target)
}

/// Decode a percent-encoded, `/`-separated path one segment at a time.
///
/// A segment that fails to decode, or that decodes into a separator, is rejected.
pub fn decode_segments(raw: &str) -> Result<String, EngineError> {
    let mut out = Vec::<String>::new();
    for seg in raw.split('/') {
        if seg.is_empty() {
            continue;
        }
        let decoded = percent_decode_str(seg)
            .decode_utf8()
            .map_err(|_| EngineError::invalid_path("path segment is not valid UTF-8"))?;
        if decoded.contains('/') || decoded.contains('\\') {
            return Err(EngineError::invalid_path("encoded separator in path segment"));
        }
        out.push(decoded.into_owned());
    }
    Ok(out.join("/"))
}

pub fn resolve_encoded(sandbox_root: &Path, raw: &str) -> Result<PathBuf, EngineError> {
    let decoded = decode_segments(raw)?;
    resolve(sandbox_root, &decoded)
}

/// Re-check an existing path after symlink resolution.
pub fn confine_existing(sandbox_root: &Path, path: &Path) -> Result<PathBuf, EngineError> {
    // canonicalize() resolves symlinks. This prevents escaping the sandbox via symlink chains.
    let root = std::fs::canonicalize(sandbox_root)
        .map_err(|_| EngineError::invalid_path("sandbox root does not exist"))?;
    let canon = std::fs::canonicalize(path)
        .map_err(|_| EngineError::invalid_path(format!("path not found: {}", path.display())))?;
    if relative_from(&root, &canon).is_none() {
        return Err(EngineError::invalid_path("path escapes sandbox root"));
    }
    Ok(canon)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/tenants/abc/root")
    }

    #[test]
    fn rejects_parent_traversal() {
        for rel in ["..", "../x", "a/../../x", "a/..", "./../etc/passwd", "world/../../.."] {
            let err = resolve(&root(), rel).unwrap_err();
            assert!(matches!(err, EngineError::InvalidPath(_)), "{rel}");
        }
    }

    #[test]
    fn rejects_absolute_overrides() {
        for rel in ["/etc/passwd", "/", "\\windows"] {
            assert!(matches!(
                resolve(&root(), rel),
                Err(EngineError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn inside_paths_stay_under_root() {
        for rel in ["world", "world/region/r.0.0.mca", "./logs/latest.log", "a//b", ""] {
            let p = resolve(&root(), rel).unwrap();
            assert!(p.starts_with(root()), "{rel} -> {}", p.display());
        }
        assert_eq!(
            resolve(&root(), "world/./level.dat").unwrap(),
            root().join("world").join("level.dat")
        );
    }

    #[test]
    fn decodes_segments_individually() {
        assert_eq!(decode_segments("my%20world/level.dat").unwrap(), "my world/level.dat");
        assert!(matches!(
            decode_segments("a%2Fb"),
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            decode_segments("bad%FF"),
            Err(EngineError::InvalidPath(_))
        ));
    }

    #[test]
    fn encoded_traversal_is_still_rejected() {
        assert!(matches!(
            resolve_encoded(&root(), "%2e%2e/secret"),
            Err(EngineError::InvalidPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn confine_existing_rejects_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&sandbox).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, sandbox.join("link")).unwrap();
        std::fs::write(sandbox.join("ok.txt"), b"ok").unwrap();

        let link = resolve(&sandbox, "link").unwrap();
        assert!(matches!(
            confine_existing(&sandbox, &link),
            Err(EngineError::InvalidPath(_))
        ));
        let ok = resolve(&sandbox, "ok.txt").unwrap();
        assert!(confine_existing(&sandbox, &ok).is_ok());
    }
}
