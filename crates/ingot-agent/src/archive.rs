//! Background zip creation and extraction.
//!
//! Callers get a task id back immediately; the work itself waits for a permit
//! from a bounded pool and then runs on the blocking thread pool, reporting
//! byte-accurate progress through the [`TaskRegistry`].

use std::{
    fs,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use ingot_process::{TaskId, TaskKind, TaskStatus, TenantId};
use tokio::sync::Semaphore;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

use crate::{
    error::EngineError,
    error_payload::format_error_chain,
    fs_scope,
    task_registry::{TaskInit, TaskRegistry, TaskScope, TaskUpdate, compute_progress},
};

const CHUNK_BYTES: usize = 64 * 1024;

/// One selection to put into an archive.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// Already confined to the tenant sandbox.
    pub source: PathBuf,
    /// Name inside the archive. `None` uses the source's file name; an empty
    /// string places a directory's children at the archive root.
    pub name_in_archive: Option<String>,
}

impl ZipEntry {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            name_in_archive: None,
        }
    }

    pub fn named(source: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name_in_archive: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZipOptions {
    pub file_name: String,
    /// Delete the artifact (and forget the task) once it has been streamed.
    pub cleanup: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UnzipOptions {
    pub overwrite: bool,
}

impl Default for UnzipOptions {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Dir,
    File,
}

#[derive(Debug, Clone)]
struct PlanItem {
    source: PathBuf,
    name: String,
    kind: ItemKind,
    size: u64,
}

#[derive(Debug, Default)]
struct ZipPlan {
    items: Vec<PlanItem>,
    total_bytes: u64,
}

impl ZipPlan {
    fn push(&mut self, item: PlanItem) {
        self.total_bytes += item.size;
        self.items.push(item);
    }
}

fn join_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn walk_dir(dir: &Path, prefix: &str, plan: &mut ZipPlan) -> anyhow::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .collect::<Result<_, _>>()
        .with_context(|| format!("read dir {}", dir.display()))?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let path = child.path();
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?;
        let name = join_name(prefix, &child.file_name().to_string_lossy());
        if meta.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "skipping symlink");
        } else if meta.is_dir() {
            plan.push(PlanItem {
                source: path.clone(),
                name: name.clone(),
                kind: ItemKind::Dir,
                size: 0,
            });
            walk_dir(&path, &name, plan)?;
        } else if meta.is_file() {
            plan.push(PlanItem {
                source: path,
                name,
                kind: ItemKind::File,
                size: meta.len(),
            });
        }
    }
    Ok(())
}

/// Stat everything up front so progress is a byte fraction from the first update.
fn build_plan(entries: &[ZipEntry]) -> anyhow::Result<ZipPlan> {
    let mut plan = ZipPlan::default();
    for entry in entries {
        let meta = fs::symlink_metadata(&entry.source)
            .with_context(|| format!("stat {}", entry.source.display()))?;
        if meta.file_type().is_symlink() {
            tracing::debug!(path = %entry.source.display(), "skipping symlink");
            continue;
        }

        let base_name = entry
            .source
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match &entry.name_in_archive {
            Some(n) => n.replace('\\', "/").trim_matches('/').to_string(),
            None => base_name.clone(),
        };

        if meta.is_dir() {
            if !name.is_empty() {
                plan.push(PlanItem {
                    source: entry.source.clone(),
                    name: name.clone(),
                    kind: ItemKind::Dir,
                    size: 0,
                });
            }
            walk_dir(&entry.source, &name, &mut plan)?;
        } else {
            plan.push(PlanItem {
                source: entry.source.clone(),
                name: if name.is_empty() { base_name } else { name },
                kind: ItemKind::File,
                size: meta.len(),
            });
        }
    }
    Ok(plan)
}

fn write_zip(
    plan: &ZipPlan,
    dest: &Path,
    mut on_progress: impl FnMut(u64, u64),
) -> anyhow::Result<()> {
    let file = fs::File::create(dest).with_context(|| format!("create {}", dest.display()))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut buf = vec![0u8; CHUNK_BYTES];
    let mut processed = 0u64;
    let mut done = 0u64;
    for item in &plan.items {
        match item.kind {
            ItemKind::Dir => {
                zip.add_directory(item.name.clone(), base)
                    .with_context(|| format!("add directory {}", item.name))?;
            }
            ItemKind::File => {
                let mut src = fs::File::open(&item.source)
                    .with_context(|| format!("open {}", item.source.display()))?;
                let opts = base.large_file(item.size >= u32::MAX as u64);
                zip.start_file(item.name.clone(), opts)
                    .with_context(|| format!("add file {}", item.name))?;
                loop {
                    let n = src
                        .read(&mut buf)
                        .with_context(|| format!("read {}", item.source.display()))?;
                    if n == 0 {
                        break;
                    }
                    zip.write_all(&buf[..n])?;
                    processed += n as u64;
                    on_progress(processed, done);
                }
            }
        }
        done += 1;
        on_progress(processed, done);
    }

    let mut w = zip.finish().context("finalize archive")?;
    w.flush()?;
    let f = w.into_inner().map_err(|e| e.into_error())?;
    f.sync_all().ok();
    Ok(())
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|s| s.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

fn progress_update(processed: u64, total: u64, done: u64, entries: u64) -> TaskUpdate {
    TaskUpdate {
        processed_bytes: Some(processed),
        entries_processed: Some(done),
        progress: Some(compute_progress(processed, total, done, entries)),
        ..Default::default()
    }
}

fn fail(tasks: &TaskRegistry, id: &TaskId, err: &anyhow::Error) {
    let message = format_error_chain(err);
    tracing::warn!(task_id = %id, error = %message, "archive task failed");
    tasks.update(id, TaskUpdate::failed(message));
}

fn run_zip(tasks: &TaskRegistry, id: &TaskId, entries: &[ZipEntry], output: &Path) {
    tasks.update(id, TaskUpdate::status(TaskStatus::InProgress));
    match build_plan(entries) {
        Ok(plan) => run_zip_plan(tasks, id, &plan, output),
        Err(e) => fail(tasks, id, &e),
    }
}

fn run_zip_plan(tasks: &TaskRegistry, id: &TaskId, plan: &ZipPlan, output: &Path) {
    let total = plan.total_bytes;
    let entries = plan.items.len() as u64;
    tasks.update(
        id,
        TaskUpdate {
            status: Some(TaskStatus::InProgress),
            total_bytes: Some(total),
            entries_total: Some(entries),
            ..Default::default()
        },
    );

    let part = part_path(output);
    let written = (|| -> anyhow::Result<u64> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        write_zip(plan, &part, |processed, done| {
            tasks.update(id, progress_update(processed, total, done, entries));
        })?;
        fs::rename(&part, output)
            .with_context(|| format!("move archive into {}", output.display()))?;
        Ok(fs::metadata(output)?.len())
    })();

    match written {
        Ok(size) => {
            tasks.update(
                id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    progress: Some(1.0),
                    processed_bytes: Some(total),
                    entries_processed: Some(entries),
                    archive_size: Some(size),
                    ..Default::default()
                },
            );
            tracing::info!(task_id = %id, bytes = total, archive_size = size, "zip completed");
        }
        Err(e) => {
            // Never leave a half-written archive behind.
            let _ = fs::remove_file(&part);
            fail(tasks, id, &e);
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct UnzipSummary {
    extracted: u64,
    skipped: u64,
}

fn extract_entries(
    tasks: &TaskRegistry,
    id: &TaskId,
    archive_path: &Path,
    destination: &Path,
    opts: UnzipOptions,
) -> anyhow::Result<UnzipSummary> {
    fs::create_dir_all(destination)
        .with_context(|| format!("create {}", destination.display()))?;
    let f = fs::File::open(archive_path)
        .with_context(|| format!("open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(BufReader::new(f)).context("read zip directory")?;

    let entries = archive.len() as u64;
    let mut total = 0u64;
    for i in 0..archive.len() {
        let e = archive.by_index_raw(i)?;
        if !e.is_dir() {
            total += e.size();
        }
    }
    tasks.update(
        id,
        TaskUpdate {
            total_bytes: Some(total),
            entries_total: Some(entries),
            ..Default::default()
        },
    );

    let mut summary = UnzipSummary::default();
    let mut processed = 0u64;
    let mut done = 0u64;
    let mut buf = vec![0u8; CHUNK_BYTES];

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw = entry.name().replace('\\', "/");
        let size = if entry.is_dir() { 0 } else { entry.size() };
        let rel = raw.trim_end_matches('/');

        let target = if rel.is_empty() {
            None
        } else {
            match fs_scope::resolve(destination, rel) {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::warn!(task_id = %id, entry = %raw, error = %e, "skipping zip entry outside destination");
                    None
                }
            }
        };
        // The lexical check cannot see symlinked directories already on disk.
        let target = target.filter(|p| {
            let Some(existing) = p
                .parent()
                .and_then(|parent| parent.ancestors().find(|a| fs::symlink_metadata(a).is_ok()))
            else {
                return false;
            };
            if fs_scope::confine_existing(destination, existing).is_err() {
                tracing::warn!(task_id = %id, entry = %raw, "skipping zip entry behind a symlink");
                return false;
            }
            true
        });
        if let Some(parent) = target.as_ref().and_then(|p| p.parent()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }

        match target {
            None => {
                if !rel.is_empty() {
                    summary.skipped += 1;
                }
                processed += size;
            }
            Some(path) if entry.is_dir() => {
                fs::create_dir_all(&path)
                    .with_context(|| format!("create {}", path.display()))?;
                summary.extracted += 1;
            }
            Some(path) => {
                let existing = fs::symlink_metadata(&path).ok();
                if existing.is_some() && !opts.overwrite {
                    summary.skipped += 1;
                    processed += size;
                } else {
                    if let Some(m) = existing
                        && (m.file_type().is_symlink() || m.is_dir())
                    {
                        if m.is_dir() {
                            anyhow::bail!("cannot overwrite directory {}", path.display());
                        }
                        fs::remove_file(&path)?;
                    }
                    let mut out = fs::File::create(&path)
                        .with_context(|| format!("create {}", path.display()))?;
                    loop {
                        let n = entry
                            .read(&mut buf)
                            .with_context(|| format!("inflate {raw}"))?;
                        if n == 0 {
                            break;
                        }
                        out.write_all(&buf[..n])
                            .with_context(|| format!("write {}", path.display()))?;
                        processed += n as u64;
                        tasks.update(id, progress_update(processed, total, done, entries));
                    }
                    summary.extracted += 1;
                }
            }
        }

        done += 1;
        tasks.update(id, progress_update(processed, total, done, entries));
    }

    Ok(summary)
}

fn run_unzip(
    tasks: &TaskRegistry,
    id: &TaskId,
    archive_path: &Path,
    destination: &Path,
    opts: UnzipOptions,
) {
    tasks.update(id, TaskUpdate::status(TaskStatus::InProgress));
    match extract_entries(tasks, id, archive_path, destination, opts) {
        Ok(summary) => {
            tasks.update(
                id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    progress: Some(1.0),
                    message: (summary.skipped > 0)
                        .then(|| format!("{} entries skipped", summary.skipped)),
                    ..Default::default()
                },
            );
            tracing::info!(
                task_id = %id,
                extracted = summary.extracted,
                skipped = summary.skipped,
                "unzip completed"
            );
        }
        // Files already written stay where they are.
        Err(e) => fail(tasks, id, &e),
    }
}

/// A completed artifact checked out for streaming. Dropping the lease deletes
/// transient artifacts and forgets their task.
#[derive(Debug)]
pub struct ArtifactLease {
    path: PathBuf,
    file_name: String,
    size: u64,
    cleanup: bool,
    task_id: TaskId,
    tasks: TaskRegistry,
}

impl ArtifactLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        if !self.cleanup {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove streamed artifact");
        }
        self.tasks.remove(&self.task_id);
    }
}

#[derive(Clone)]
pub struct ArchiveEngine {
    tasks: TaskRegistry,
    permits: Arc<Semaphore>,
}

impl ArchiveEngine {
    pub fn new(tasks: TaskRegistry, workers: usize) -> Self {
        Self {
            tasks,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Queue a zip of `entries` into `output_dir/<file_name>`. Must be called
    /// from within a tokio runtime.
    pub fn start_zip(
        &self,
        scope: TaskScope,
        entries: Vec<ZipEntry>,
        output_dir: &Path,
        opts: ZipOptions,
    ) -> Result<TaskId, EngineError> {
        if entries.is_empty() {
            return Err(EngineError::InvalidArgument(
                "nothing selected to archive".to_string(),
            ));
        }
        let output = fs_scope::resolve(output_dir, &opts.file_name)?;
        if output.parent() != Some(output_dir) {
            return Err(EngineError::invalid_path(
                "archive name must be a single path segment",
            ));
        }

        let task = self.tasks.create(
            TaskKind::Zip,
            scope,
            TaskInit {
                file_name: Some(opts.file_name.clone()),
                result_path: Some(output.clone()),
                cleanup: opts.cleanup,
            },
        );
        let id = task.id.clone();
        tracing::info!(task_id = %id, output = %output.display(), entries = entries.len(), "zip queued");

        self.dispatch(id.clone(), move |tasks, id| {
            run_zip(tasks, id, &entries, &output)
        });
        Ok(id)
    }

    /// Queue extraction of `archive_path` into `destination`. Must be called
    /// from within a tokio runtime.
    pub fn start_unzip(
        &self,
        scope: TaskScope,
        archive_path: PathBuf,
        destination: PathBuf,
        opts: UnzipOptions,
    ) -> Result<TaskId, EngineError> {
        if !archive_path.is_file() {
            return Err(EngineError::InvalidArgument(format!(
                "archive not found: {}",
                archive_path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            )));
        }

        let task = self.tasks.create(
            TaskKind::Unzip,
            scope,
            TaskInit {
                file_name: archive_path
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned()),
                ..Default::default()
            },
        );
        let id = task.id.clone();
        tracing::info!(task_id = %id, archive = %archive_path.display(), "unzip queued");

        self.dispatch(id.clone(), move |tasks, id| {
            run_unzip(tasks, id, &archive_path, &destination, opts)
        });
        Ok(id)
    }

    fn dispatch<F>(&self, id: TaskId, work: F)
    where
        F: FnOnce(&TaskRegistry, &TaskId) + Send + 'static,
    {
        let tasks = self.tasks.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // Stays queued until a worker slot frees up.
            let Ok(_permit) = permits.acquire_owned().await else {
                tasks.update(&id, TaskUpdate::failed("archive workers shut down"));
                return;
            };
            let t = tasks.clone();
            let task_id = id.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || work(&t, &task_id)).await {
                tracing::error!(task_id = %id, error = %e, "archive worker panicked");
                tasks.update(&id, TaskUpdate::failed("archive worker crashed"));
            }
        });
    }

    /// Check out a completed zip artifact for streaming.
    pub fn take_artifact(&self, id: &TaskId, tenant: &TenantId) -> Result<ArtifactLease, EngineError> {
        let task = self.tasks.get_scoped(id, tenant)?;
        if task.kind != TaskKind::Zip || task.status != TaskStatus::Completed {
            return Err(EngineError::NotReady);
        }
        let Some(path) = task.result_path else {
            return Err(EngineError::NotReady);
        };
        let size = fs::metadata(&path)
            .map_err(|_| EngineError::TaskNotFound(id.to_string()))?
            .len();
        Ok(ArtifactLease {
            file_name: task.file_name.unwrap_or_else(|| "archive.zip".to_string()),
            path,
            size,
            cleanup: task.cleanup,
            task_id: id.clone(),
            tasks: self.tasks.clone(),
        })
    }
}
