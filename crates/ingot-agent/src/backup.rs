use std::{fs, sync::Arc};

use anyhow::Context;
use ingot_process::{TaskId, TenantId};
use serde::Serialize;

use crate::{
    archive::{ArchiveEngine, UnzipOptions, ZipEntry, ZipOptions},
    error::EngineError,
    fs_scope,
    task_registry::{TaskScope, now_unix_ms},
    tenant_store::{TenantDirectory, TenantLayout},
};

const PREFIX: &str = "backup-";
const SUFFIX: &str = ".zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub name: String,
    pub size_bytes: u64,
    pub created_at_unix_ms: u64,
}

/// `backup-<unix_ms>.zip` carries its own timestamp.
fn parse_backup_name(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse::<u64>()
        .ok()
}

/// Durable snapshots of a tenant's sandbox root, kept next to it in `backup/`.
#[derive(Clone)]
pub struct BackupService {
    archive: ArchiveEngine,
    dir: Arc<dyn TenantDirectory>,
}

impl BackupService {
    pub fn new(archive: ArchiveEngine, dir: Arc<dyn TenantDirectory>) -> Self {
        Self { archive, dir }
    }

    fn layout(&self, tenant: &TenantId) -> Result<TenantLayout, EngineError> {
        let layout = self.dir.layout(tenant)?;
        if self.dir.load(tenant)?.is_none() {
            return Err(EngineError::UnknownSession(tenant.to_string()));
        }
        Ok(layout)
    }

    /// Queue a zip of the whole sandbox root. The archive is never auto-deleted.
    pub fn create(&self, tenant: &TenantId) -> Result<TaskId, EngineError> {
        let layout = self.layout(tenant)?;
        let backup_dir = layout.backup_dir();
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("create {}", backup_dir.display()))?;

        let file_name = format!("{PREFIX}{}{SUFFIX}", now_unix_ms());
        self.archive.start_zip(
            TaskScope::new(tenant.clone(), "backup"),
            vec![ZipEntry::named(layout.root(), "")],
            &backup_dir,
            ZipOptions {
                file_name,
                cleanup: false,
            },
        )
    }

    /// Newest first. In-progress `.part` files and foreign files are ignored.
    pub fn list(&self, tenant: &TenantId) -> Result<Vec<BackupInfo>, EngineError> {
        let backup_dir = self.layout(tenant)?.backup_dir();
        let rd = match fs::read_dir(&backup_dir) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read dir {}", backup_dir.display()))
                    .into());
            }
        };

        let mut out = Vec::new();
        for ent in rd.flatten() {
            let name = ent.file_name().to_string_lossy().into_owned();
            let Some(created) = parse_backup_name(&name) else {
                continue;
            };
            let Ok(meta) = ent.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            out.push(BackupInfo {
                name,
                size_bytes: meta.len(),
                created_at_unix_ms: created,
            });
        }
        out.sort_by(|a, b| b.created_at_unix_ms.cmp(&a.created_at_unix_ms));
        Ok(out)
    }

    /// Queue extraction of a named backup over the sandbox root.
    pub fn restore(&self, tenant: &TenantId, name: &str) -> Result<TaskId, EngineError> {
        let layout = self.layout(tenant)?;
        let backup_dir = layout.backup_dir();
        let path = fs_scope::resolve(&backup_dir, name)?;
        if path.parent() != Some(backup_dir.as_path()) || parse_backup_name(name).is_none() {
            return Err(EngineError::invalid_path(format!("not a backup name: {name:?}")));
        }

        self.archive.start_unzip(
            TaskScope::new(tenant.clone(), "restore"),
            path,
            layout.root(),
            UnzipOptions { overwrite: true },
        )
    }
}
