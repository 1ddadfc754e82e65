//! Per-tenant directory layout and the stored tenant record.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use ingot_process::TenantId;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

const RECORD_FILE: &str = "tenant.json";
const SENTINEL_FILE: &str = "minecraft_pid.txt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub version: String,
    pub port: u16,
    pub memory_gb: u32,
    pub render_distance: u8,
    pub startup_command: String,
    #[serde(default)]
    pub startup_flags: String,
    pub created_at_unix_ms: u64,
}

/// Where a tenant's files live under the data root.
///
/// ```text
/// <data_root>/<tenant>/
///   root/               sandbox root, console cwd
///   backup/
///   archives/           transient download-selection zips
///   logs/server.log
///   minecraft_pid.txt   sentinel, logs/../minecraft_pid.txt
///   tenant.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantLayout {
    base: PathBuf,
}

impl TenantLayout {
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self) -> PathBuf {
        self.base.join("root")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.base.join("backup")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.base.join("archives")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs_dir().join("server.log")
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.base.join(SENTINEL_FILE)
    }

    pub fn record_path(&self) -> PathBuf {
        self.base.join(RECORD_FILE)
    }

    pub fn create_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.root(),
            self.backup_dir(),
            self.archives_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Tenant ids appear in paths and URLs; keep them to one safe segment.
pub fn validate_tenant_id(id: &TenantId) -> Result<(), EngineError> {
    let s = id.as_str();
    let ok = !s.is_empty()
        && s.len() <= 64
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(EngineError::invalid_path(format!("invalid tenant id {s:?}")))
    }
}

/// Read/write key-value state per tenant, plus where its files live.
pub trait TenantDirectory: Send + Sync {
    fn layout(&self, tenant: &TenantId) -> Result<TenantLayout, EngineError>;
    fn load(&self, tenant: &TenantId) -> Result<Option<TenantRecord>, EngineError>;
    fn save(&self, record: &TenantRecord) -> Result<(), EngineError>;
    /// Forget the record. Files under the layout are the caller's business.
    fn delete(&self, tenant: &TenantId) -> Result<(), EngineError>;
    fn list(&self) -> Result<Vec<TenantRecord>, EngineError>;
}

/// JSON record next to each tenant's files.
#[derive(Debug, Clone)]
pub struct FsTenantDirectory {
    data_root: PathBuf,
}

impl FsTenantDirectory {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}

fn write_json_atomic(path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&bytes)?;
    f.sync_all().ok();
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

impl TenantDirectory for FsTenantDirectory {
    fn layout(&self, tenant: &TenantId) -> Result<TenantLayout, EngineError> {
        validate_tenant_id(tenant)?;
        Ok(TenantLayout {
            base: self.data_root.join(tenant.as_str()),
        })
    }

    fn load(&self, tenant: &TenantId) -> Result<Option<TenantRecord>, EngineError> {
        let path = self.layout(tenant)?.record_path();
        let raw = match fs::read(&path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read {}", path.display()))
                    .into());
            }
        };
        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(record))
    }

    fn save(&self, record: &TenantRecord) -> Result<(), EngineError> {
        let layout = self.layout(&record.id)?;
        fs::create_dir_all(layout.base())
            .with_context(|| format!("create {}", layout.base().display()))?;
        write_json_atomic(&layout.record_path(), record)?;
        Ok(())
    }

    fn delete(&self, tenant: &TenantId) -> Result<(), EngineError> {
        let path = self.layout(tenant)?.record_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("remove {}", path.display()))
                .into()),
        }
    }

    fn list(&self) -> Result<Vec<TenantRecord>, EngineError> {
        let rd = match fs::read_dir(&self.data_root) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context("list data root").into()),
        };

        let mut out = Vec::new();
        for ent in rd.flatten() {
            let Some(name) = ent.file_name().to_str().map(TenantId::from) else {
                continue;
            };
            if validate_tenant_id(&name).is_err() {
                continue;
            }
            match self.load(&name) {
                Ok(Some(r)) => out.push(r),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(tenant_id = %name, error = %e, "skipping unreadable tenant record");
                }
            }
        }
        out.sort_by(|a, b| a.created_at_unix_ms.cmp(&b.created_at_unix_ms));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, created: u64) -> TenantRecord {
        TenantRecord {
            id: TenantId::from(id),
            name: "survival".into(),
            version: "1.20.1".into(),
            port: 25565,
            memory_gb: 2,
            render_distance: 10,
            startup_command: "java -Xmx2G -Xms2G -jar server.jar nogui".into(),
            startup_flags: String::new(),
            created_at_unix_ms: created,
        }
    }

    #[test]
    fn layout_puts_sentinel_next_to_logs() {
        let dir = FsTenantDirectory::new("/data");
        let l = dir.layout(&TenantId::from("abc")).unwrap();
        assert_eq!(l.root(), PathBuf::from("/data/abc/root"));
        assert_eq!(l.log_path(), PathBuf::from("/data/abc/logs/server.log"));
        assert_eq!(
            l.sentinel_path(),
            l.logs_dir().parent().unwrap().join("minecraft_pid.txt")
        );
    }

    #[test]
    fn tenant_ids_must_be_one_safe_segment() {
        let dir = FsTenantDirectory::new("/data");
        let long = "x".repeat(65);
        for bad in ["", "..", "a/b", "a b", "../etc", long.as_str()] {
            assert!(dir.layout(&TenantId::from(bad)).is_err(), "{bad:?}");
        }
        assert!(dir.layout(&TenantId::new()).is_ok());
    }

    #[test]
    fn records_round_trip_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = FsTenantDirectory::new(tmp.path());
        assert!(dir.load(&TenantId::from("b")).unwrap().is_none());

        dir.save(&record("b", 2)).unwrap();
        dir.save(&record("a", 1)).unwrap();
        std::fs::create_dir_all(tmp.path().join("stray")).unwrap();

        let all = dir.list().unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(dir.load(&TenantId::from("b")).unwrap(), Some(record("b", 2)));

        dir.delete(&TenantId::from("b")).unwrap();
        dir.delete(&TenantId::from("b")).unwrap();
        assert_eq!(dir.list().unwrap().len(), 1);
    }

    #[test]
    fn corrupt_record_is_skipped_by_list() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = FsTenantDirectory::new(tmp.path());
        dir.save(&record("good", 1)).unwrap();
        std::fs::create_dir_all(tmp.path().join("bad")).unwrap();
        std::fs::write(tmp.path().join("bad").join("tenant.json"), b"{").unwrap();

        assert_eq!(dir.list().unwrap().len(), 1);
        assert!(dir.load(&TenantId::from("bad")).is_err());
    }
}
