use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Append-only on-disk copy of a session's console output, kept to a bounded
/// number of trailing lines.
pub struct Transcript {
    path: PathBuf,
    max_lines: usize,
    max_bytes: u64,
    bytes: u64,
    lines: usize,
    file: tokio::fs::File,
}

fn count_lines(buf: &[u8]) -> usize {
    buf.iter().filter(|b| **b == b'\n').count()
}

/// Offset at which the last `max_lines` lines of `buf` start.
fn tail_offset(buf: &[u8], max_lines: usize) -> usize {
    if max_lines == 0 {
        return buf.len();
    }
    // A trailing newline terminates the last line rather than starting a new one.
    let end = if buf.last() == Some(&b'\n') {
        buf.len() - 1
    } else {
        buf.len()
    };
    let mut seen = 0;
    for (i, b) in buf[..end].iter().enumerate().rev() {
        if *b == b'\n' {
            seen += 1;
            if seen == max_lines {
                return i + 1;
            }
        }
    }
    0
}

impl Transcript {
    /// Open (or create) the transcript, trimming whatever a previous run left
    /// behind to the configured tail.
    pub async fn open(path: PathBuf, max_lines: usize, max_bytes: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing = match tokio::fs::read(&path).await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let keep = &existing[tail_offset(&existing, max_lines)..];
        if keep.len() != existing.len() {
            write_replace(&path, keep).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            bytes: keep.len() as u64,
            lines: count_lines(keep),
            path,
            max_lines,
            max_bytes,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.file.write_all(chunk).await?;
        // tokio buffers file writes; history readers open the path separately.
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(chunk.len() as u64);
        self.lines += count_lines(chunk);

        // Some slack over max_lines so a chatty server doesn't rewrite the file on every line.
        let line_limit = self.max_lines + self.max_lines / 4;
        if self.lines > line_limit || (self.max_bytes > 0 && self.bytes > self.max_bytes) {
            self.truncate().await?;
        }
        Ok(())
    }

    async fn truncate(&mut self) -> std::io::Result<()> {
        let buf = tokio::fs::read(&self.path).await?;
        let mut keep = &buf[tail_offset(&buf, self.max_lines)..];
        if self.max_bytes > 0 && keep.len() as u64 > self.max_bytes {
            // A few enormous lines: fall back to a byte cut.
            keep = &keep[keep.len() - self.max_bytes as usize / 2..];
        }
        write_replace(&self.path, keep).await?;

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = keep.len() as u64;
        self.lines = count_lines(keep);
        tracing::debug!(path = %self.path.display(), lines = self.lines, "transcript truncated");
        Ok(())
    }
}

async fn write_replace(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("log.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Up to `max_lines` trailing lines of a transcript, reading at most `limit_bytes`
/// from the end. A missing file is empty history.
pub async fn read_tail(path: &Path, max_lines: usize, limit_bytes: u64) -> std::io::Result<Vec<u8>> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let size = f.metadata().await?.len();
    let start = size.saturating_sub(limit_bytes);
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf).await?;
    let from = tail_offset(&buf, max_lines);
    Ok(buf.split_off(from))
}
