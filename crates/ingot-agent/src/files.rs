//! File manager over a tenant's server root.
//!
//! Every operation takes user-relative paths, resolves them lexically with
//! [`fs_scope::resolve`] and re-checks whatever already exists on disk with
//! [`fs_scope::confine_existing`] before touching it.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::{error::EngineError, fs_scope};

pub const MAX_READ_BYTES: u64 = 1024 * 1024;
pub const MAX_WRITE_BYTES: usize = 1024 * 1024;
pub const MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Relative to the server root, `/`-separated.
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

fn io_err(what: &str, path: &Path, e: std::io::Error) -> EngineError {
    EngineError::Internal(anyhow::anyhow!("{what} {}: {e}", path.display()))
}

/// A single plain name: no separators, no `.`/`..`.
fn single_segment(name: &str) -> Result<&str, EngineError> {
    let name = name.trim();
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\', '\0']) => Ok(name),
        _ => Err(EngineError::InvalidArgument(format!("invalid file name: {name:?}"))),
    }
}

/// Resolve `rel` to an entry whose parent directory is confined, without
/// following the entry itself if it is a symlink.
fn confined_entry(root: &Path, rel: &str) -> Result<PathBuf, EngineError> {
    let lexical = fs_scope::resolve(root, rel)?;
    if lexical == root {
        return Err(EngineError::invalid_path("the server root itself cannot be changed"));
    }
    let (Some(parent), Some(name)) = (lexical.parent(), lexical.file_name()) else {
        return Err(EngineError::invalid_path("path must name an entry"));
    };
    Ok(fs_scope::confine_existing(root, parent)?.join(name))
}

async fn confined_dir(root: &Path, rel: &str) -> Result<PathBuf, EngineError> {
    let lexical = fs_scope::resolve(root, rel)?;
    let dir = fs_scope::confine_existing(root, &lexical)?;
    let meta = tokio::fs::metadata(&dir)
        .await
        .map_err(|e| io_err("stat", &dir, e))?;
    if !meta.is_dir() {
        return Err(EngineError::InvalidArgument("path is not a directory".to_string()));
    }
    Ok(dir)
}

fn join_rel(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Directory listing, directories first, then by name.
pub async fn list_dir(root: &Path, rel: &str) -> Result<Vec<FileEntry>, EngineError> {
    let dir = confined_dir(root, rel).await?;
    let mut rd = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| io_err("read dir", &dir, e))?;

    let mut entries = Vec::new();
    while let Some(de) = rd
        .next_entry()
        .await
        .map_err(|e| io_err("read dir entry in", &dir, e))?
    {
        let name = de.file_name().to_string_lossy().into_owned();
        let meta = de
            .metadata()
            .await
            .map_err(|e| io_err("stat", &de.path(), e))?;
        entries.push(FileEntry {
            path: join_rel(rel, &name),
            name,
            is_dir: meta.is_dir(),
            size_bytes: if meta.is_file() { meta.len() } else { 0 },
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// Create `name` below `parent`, creating missing intermediate directories.
/// Existing symlinks on the way are refused.
pub async fn mkdir(root: &Path, parent: &str, name: &str) -> Result<(), EngineError> {
    let name = single_segment(name)?;
    let rel = fs_scope::resolve(Path::new(""), &join_rel(parent, name))?;
    mkdir_rel(root, &rel).await
}

async fn mkdir_rel(root: &Path, rel: &Path) -> Result<(), EngineError> {
    let mut cur = root.to_path_buf();
    for c in rel.components() {
        let Component::Normal(seg) = c else {
            return Err(EngineError::invalid_path("path traversal is not allowed"));
        };
        let next = cur.join(seg);
        match tokio::fs::symlink_metadata(&next).await {
            Ok(m) if m.file_type().is_symlink() => {
                return Err(EngineError::InvalidArgument(
                    "symlinks are not allowed in a directory path".to_string(),
                ));
            }
            Ok(m) if !m.is_dir() => {
                return Err(EngineError::InvalidArgument(
                    "path component is not a directory".to_string(),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir(&next)
                    .await
                    .map_err(|e| io_err("create dir", &next, e))?;
            }
            Err(e) => return Err(io_err("stat", &next, e)),
        }
        cur = next;
    }
    fs_scope::confine_existing(root, &cur)?;
    Ok(())
}

/// Delete every listed entry. Directories go recursively; symlinks are
/// unlinked, never followed.
pub async fn remove(root: &Path, rels: &[String]) -> Result<usize, EngineError> {
    // Validate the whole batch before deleting anything.
    let targets = rels
        .iter()
        .map(|rel| confined_entry(root, rel))
        .collect::<Result<Vec<_>, _>>()?;

    let mut removed = 0;
    for path in targets {
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(io_err("stat", &path, e)),
        };
        let res = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        res.map_err(|e| io_err("remove", &path, e))?;
        removed += 1;
    }
    Ok(removed)
}

/// Read a text file for the editor. Invalid UTF-8 is replaced.
pub async fn read_file(root: &Path, rel: &str) -> Result<String, EngineError> {
    let lexical = fs_scope::resolve(root, rel)?;
    let path = fs_scope::confine_existing(root, &lexical)?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| io_err("stat", &path, e))?;
    if !meta.is_file() {
        return Err(EngineError::InvalidArgument("path is not a file".to_string()));
    }
    if meta.len() > MAX_READ_BYTES {
        return Err(EngineError::InvalidArgument(format!(
            "file is too large to edit ({} > {MAX_READ_BYTES} bytes)",
            meta.len()
        )));
    }
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| io_err("read", &path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Replace (or create) a file inside an existing directory, via a temp file
/// and rename.
pub async fn save_file(root: &Path, rel: &str, content: &str) -> Result<(), EngineError> {
    if content.len() > MAX_WRITE_BYTES {
        return Err(EngineError::InvalidArgument("file too large".to_string()));
    }
    let path = confined_entry(root, rel)?;
    refuse_special_target(&path).await?;

    let tmp = with_suffix(&path, ".tmp");
    let res = async {
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(content.as_bytes())
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        f.flush().await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("persist {}", path.display()))?;
        anyhow::Ok(())
    }
    .await;
    if res.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    res?;
    tracing::debug!(path = %path.display(), bytes = content.len(), "file saved");
    Ok(())
}

/// Move entries into `destination`, keeping their names. Nothing is
/// overwritten.
pub async fn move_entries(root: &Path, rels: &[String], destination: &str) -> Result<usize, EngineError> {
    let dest = confined_dir(root, destination).await?;

    let mut plan = Vec::with_capacity(rels.len());
    for rel in rels {
        let from = confined_entry(root, rel)?;
        let Some(name) = from.file_name() else {
            return Err(EngineError::invalid_path("path must name an entry"));
        };
        if tokio::fs::symlink_metadata(&from).await.is_err() {
            return Err(EngineError::invalid_path(format!("path not found: {rel}")));
        }
        if dest.starts_with(&from) {
            return Err(EngineError::InvalidArgument(format!(
                "cannot move {rel} into itself"
            )));
        }
        let to = dest.join(name);
        if tokio::fs::symlink_metadata(&to).await.is_ok() {
            return Err(EngineError::InvalidArgument(format!(
                "target already exists: {}",
                join_rel(destination, &name.to_string_lossy())
            )));
        }
        plan.push((from, to));
    }

    for (from, to) in &plan {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| io_err("move", from, e))?;
    }
    Ok(plan.len())
}

/// Stream an uploaded file into `dir` (created when missing). Bytes land in
/// a `.part` file that is only renamed into place once complete.
pub async fn upload<S, B, E>(root: &Path, dir: &str, file_name: &str, body: S) -> Result<u64, EngineError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let name = single_segment(file_name)?;
    let rel_dir = fs_scope::resolve(Path::new(""), dir)?;
    mkdir_rel(root, &rel_dir).await?;
    let path = fs_scope::confine_existing(root, &root.join(&rel_dir))?.join(name);
    refuse_special_target(&path).await?;

    let part = with_suffix(&path, ".part");
    let res = write_stream(&part, body).await;
    let written = match res {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&part, &path)
        .await
        .map_err(|e| io_err("persist", &path, e))?;
    tracing::info!(path = %path.display(), bytes = written, "upload stored");
    Ok(written)
}

async fn write_stream<S, B, E>(part: &Path, body: S) -> Result<u64, EngineError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut f = tokio::fs::File::create(part)
        .await
        .map_err(|e| io_err("create", part, e))?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| EngineError::InvalidArgument(format!("upload interrupted: {e}")))?;
        let chunk = chunk.as_ref();
        written += chunk.len() as u64;
        if written > MAX_UPLOAD_BYTES {
            return Err(EngineError::InvalidArgument(format!(
                "upload exceeds {MAX_UPLOAD_BYTES} bytes"
            )));
        }
        f.write_all(chunk).await.map_err(|e| io_err("write", part, e))?;
    }
    f.flush().await.map_err(|e| io_err("flush", part, e))?;
    Ok(written)
}

async fn refuse_special_target(path: &Path) -> Result<(), EngineError> {
    if let Ok(m) = tokio::fs::symlink_metadata(path).await {
        if m.file_type().is_symlink() {
            return Err(EngineError::InvalidArgument("refusing to write to symlink".to_string()));
        }
        if m.is_dir() {
            return Err(EngineError::InvalidArgument("path is a directory".to_string()));
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(root.join("world/region")).unwrap();
        std::fs::write(root.join("server.properties"), "motd=hi\n").unwrap();
        std::fs::write(root.join("world/level.dat"), [7u8; 32]).unwrap();
        std::fs::write(tmp.path().join("secret.txt"), "outside").unwrap();
        (tmp, root)
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn lists_directories_first() {
        let (_tmp, root) = sandbox();
        let entries = list_dir(&root, "").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["world", "server.properties"]);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].size_bytes, 8);

        let inner = list_dir(&root, "world").await.unwrap();
        assert_eq!(inner[1].path, "world/level.dat");
    }

    #[tokio::test]
    async fn traversal_is_rejected_everywhere() {
        let (_tmp, root) = sandbox();
        assert!(matches!(list_dir(&root, "..").await, Err(EngineError::InvalidPath(_))));
        assert!(matches!(
            read_file(&root, "../secret.txt").await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            save_file(&root, "../secret.txt", "pwned").await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            remove(&root, &strs(&["world", "../secret.txt"])).await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            move_entries(&root, &strs(&["server.properties"]), "..").await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(mkdir(&root, "", "../escape").await.is_err());
        assert!(mkdir(&root, "..", "escape").await.is_err());
        assert!(
            upload(&root, "", "../x.jar", futures_util::stream::iter([Ok::<_, String>(b"x")]))
                .await
                .is_err()
        );

        // Nothing moved or got deleted by the rejected batch.
        assert!(root.join("world/level.dat").exists());
        assert_eq!(
            std::fs::read_to_string(root.parent().unwrap().join("secret.txt")).unwrap(),
            "outside"
        );
        assert!(matches!(remove(&root, &strs(&[""])).await, Err(EngineError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_do_not_lead_outside() {
        let (tmp, root) = sandbox();
        std::os::unix::fs::symlink(tmp.path(), root.join("escape")).unwrap();

        assert!(matches!(
            read_file(&root, "escape/secret.txt").await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(
            save_file(&root, "escape/secret.txt", "pwned").await,
            Err(EngineError::InvalidPath(_))
        ));
        assert!(matches!(list_dir(&root, "escape").await, Err(EngineError::InvalidPath(_))));
        assert!(mkdir(&root, "escape", "x").await.is_err());

        // The link itself is removed, its target is untouched.
        assert_eq!(remove(&root, &strs(&["escape"])).await.unwrap(), 1);
        assert!(!root.join("escape").exists());
        assert!(tmp.path().join("secret.txt").exists());
    }

    #[tokio::test]
    async fn edit_round_trip() {
        let (_tmp, root) = sandbox();
        assert_eq!(read_file(&root, "server.properties").await.unwrap(), "motd=hi\n");
        save_file(&root, "server.properties", "motd=bye\n").await.unwrap();
        assert_eq!(read_file(&root, "server.properties").await.unwrap(), "motd=bye\n");
        save_file(&root, "ops.json", "[]").await.unwrap();
        assert!(root.join("ops.json").is_file());
        assert!(!root.join("ops.json.tmp").exists());

        assert!(matches!(
            read_file(&root, "world").await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            save_file(&root, "world", "x").await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            save_file(&root, "missing/dir.txt", "x").await,
            Err(EngineError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn mkdir_and_remove() {
        let (_tmp, root) = sandbox();
        mkdir(&root, "plugins", "Essentials").await.unwrap();
        assert!(root.join("plugins/Essentials").is_dir());
        mkdir(&root, "plugins", "Essentials").await.unwrap();
        assert!(mkdir(&root, "", "a/b").await.is_err());
        assert!(mkdir(&root, "server.properties", "x").await.is_err());

        let n = remove(&root, &strs(&["plugins", "server.properties", "gone.txt"]))
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(!root.join("plugins").exists());
        assert!(!root.join("server.properties").exists());
    }

    #[tokio::test]
    async fn move_keeps_names_and_never_overwrites() {
        let (_tmp, root) = sandbox();
        mkdir(&root, "", "old").await.unwrap();
        assert_eq!(
            move_entries(&root, &strs(&["server.properties"]), "old").await.unwrap(),
            1
        );
        assert!(root.join("old/server.properties").is_file());

        std::fs::write(root.join("server.properties"), "new").unwrap();
        assert!(matches!(
            move_entries(&root, &strs(&["server.properties"]), "old").await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            move_entries(&root, &strs(&["world"]), "world/region").await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(std::fs::read_to_string(root.join("server.properties")).unwrap(), "new");
    }

    #[tokio::test]
    async fn upload_streams_into_place() {
        let (_tmp, root) = sandbox();
        let chunks = futures_util::stream::iter(vec![
            Ok::<_, String>(b"PK".to_vec()),
            Ok(vec![0u8; 100]),
        ]);
        let n = upload(&root, "plugins", "a.jar", chunks).await.unwrap();
        assert_eq!(n, 102);
        assert_eq!(std::fs::read(root.join("plugins/a.jar")).unwrap().len(), 102);

        let broken = futures_util::stream::iter(vec![Ok(b"PK".to_vec()), Err("reset".to_string())]);
        assert!(upload(&root, "plugins", "b.jar", broken).await.is_err());
        assert!(!root.join("plugins/b.jar").exists());
        assert!(!root.join("plugins/b.jar.part").exists());
    }
}
