//! Tenant lifecycle: provisioning as a reversible step list, teardown, and
//! re-attaching sessions after an agent restart.

use std::{path::Path, sync::Arc, sync::OnceLock};

use anyhow::Context;
use ingot_process::{RunState, TenantId};
use regex::Regex;
use serde::Deserialize;

use crate::{
    artifact_fetch::ArtifactFetcher,
    error::EngineError,
    liveness::SentinelFileOracle,
    process_manager::{ProcessSupervisor, SessionConfig},
    startup::{StartupCommand, StartupView, default_base_command, validate_flags},
    task_registry::now_unix_ms,
    tenant_store::{TenantDirectory, TenantLayout, TenantRecord},
};

const DEFAULT_RENDER_DISTANCE: u8 = 10;

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+\.\d+(?:\.\d+)?$").expect("valid version pattern"))
}

/// `latest` maps onto the loader's own `stable` channel.
fn normalize_version(raw: &str) -> Result<String, EngineError> {
    let v = raw.trim();
    match v {
        "latest" | "stable" => Ok("stable".to_string()),
        _ if version_re().is_match(v) => Ok(v.to_string()),
        _ => Err(EngineError::InvalidArgument(format!(
            "version must look like 1.x or 1.x.y, got {v:?}"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub memory_gb: u32,
    #[serde(default)]
    pub render_distance: Option<u8>,
    #[serde(default)]
    pub startup_flags: String,
}

fn server_properties(port: u16, render_distance: u8) -> String {
    format!(
        "#Minecraft server properties\n\
         allow-flight=false\n\
         allow-nether=true\n\
         difficulty=easy\n\
         enable-command-block=false\n\
         enable-query=false\n\
         enable-rcon=false\n\
         enable-status=true\n\
         gamemode=survival\n\
         level-name=world\n\
         max-players=20\n\
         motd=A Minecraft Server\n\
         online-mode=true\n\
         pvp=true\n\
         query.port={port}\n\
         server-port={port}\n\
         simulation-distance=10\n\
         spawn-protection=16\n\
         view-distance={render_distance}\n\
         white-list=false\n"
    )
}

const EULA: &str = "#By changing the setting below to TRUE you are indicating your agreement to the Minecraft EULA (https://aka.ms/MinecraftEULA).\neula=true\n";

/// Provisioning steps, in execution order. Each one has an undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Reserve,
    Download,
    Configure,
    Activate,
}

impl Step {
    const ALL: [Step; 4] = [Step::Reserve, Step::Download, Step::Configure, Step::Activate];
}

pub fn session_config(record: &TenantRecord, layout: &TenantLayout) -> Result<SessionConfig, EngineError> {
    let startup = StartupCommand::new(&record.startup_command, &record.startup_flags)?;
    Ok(SessionConfig {
        tenant_id: record.id.clone(),
        cwd: layout.root(),
        log_path: layout.log_path(),
        sentinel_path: layout.sentinel_path(),
        startup,
        oracle: Arc::new(SentinelFileOracle::new(layout.sentinel_path())),
    })
}

pub struct Provisioner<F> {
    dir: Arc<dyn TenantDirectory>,
    supervisor: ProcessSupervisor,
    fetcher: F,
    jar_url_template: String,
}

impl<F: ArtifactFetcher> Provisioner<F> {
    pub fn new(
        dir: Arc<dyn TenantDirectory>,
        supervisor: ProcessSupervisor,
        fetcher: F,
        jar_url_template: impl Into<String>,
    ) -> Self {
        Self {
            dir,
            supervisor,
            fetcher,
            jar_url_template: jar_url_template.into(),
        }
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.dir
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    fn jar_url(&self, version: &str) -> String {
        self.jar_url_template.replace("{version}", version)
    }

    /// Create a tenant end to end. On failure every completed step is undone
    /// in reverse, so nothing half-built stays registered or on disk.
    pub async fn provision(&self, req: CreateServerRequest) -> Result<TenantRecord, EngineError> {
        let name = req.name.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(EngineError::InvalidArgument(
                "name must be 1 to 64 characters".to_string(),
            ));
        }
        if req.port == 0 {
            return Err(EngineError::InvalidArgument("port must be non-zero".to_string()));
        }
        if req.memory_gb == 0 || req.memory_gb > 1024 {
            return Err(EngineError::InvalidArgument(
                "memory must be between 1 and 1024 GiB".to_string(),
            ));
        }
        let render_distance = req.render_distance.unwrap_or(DEFAULT_RENDER_DISTANCE);
        if !(2..=32).contains(&render_distance) {
            return Err(EngineError::InvalidArgument(
                "render distance must be between 2 and 32".to_string(),
            ));
        }
        let version = normalize_version(&req.version)?;
        let startup = StartupCommand::new(&default_base_command(req.memory_gb), &req.startup_flags)?;

        let record = TenantRecord {
            id: TenantId::new(),
            name: name.to_string(),
            version,
            port: req.port,
            memory_gb: req.memory_gb,
            render_distance,
            startup_command: startup.base_command().to_string(),
            startup_flags: startup.flags().to_string(),
            created_at_unix_ms: now_unix_ms(),
        };
        let layout = self.dir.layout(&record.id)?;

        let mut completed: Vec<Step> = Vec::with_capacity(Step::ALL.len());
        for step in Step::ALL {
            tracing::debug!(tenant_id = %record.id, ?step, "provisioning step");
            if let Err(e) = self.run_step(step, &record, &layout).await {
                tracing::warn!(tenant_id = %record.id, ?step, error = %e, "provisioning failed; rolling back");
                for done in completed.iter().rev() {
                    if let Err(undo_err) = self.undo_step(*done, &record, &layout).await {
                        tracing::warn!(tenant_id = %record.id, step = ?done, error = %undo_err, "undo failed");
                    }
                }
                return Err(e);
            }
            completed.push(step);
        }

        tracing::info!(tenant_id = %record.id, name = %record.name, version = %record.version, "tenant provisioned");
        Ok(record)
    }

    async fn run_step(&self, step: Step, record: &TenantRecord, layout: &TenantLayout) -> Result<(), EngineError> {
        match step {
            Step::Reserve => {
                if layout.base().exists() {
                    return Err(EngineError::Internal(anyhow::anyhow!(
                        "tenant directory already exists: {}",
                        layout.base().display()
                    )));
                }
                layout
                    .create_dirs()
                    .with_context(|| format!("create {}", layout.base().display()))?;
            }
            Step::Download => {
                self.fetcher
                    .fetch(&self.jar_url(&record.version), &layout.root().join("server.jar"))
                    .await?;
            }
            Step::Configure => {
                let root = layout.root();
                write_file(
                    &root.join("server.properties"),
                    &server_properties(record.port, record.render_distance),
                )?;
                write_file(&root.join("eula.txt"), EULA)?;
                self.dir.save(record)?;
            }
            Step::Activate => {
                self.supervisor
                    .create_session(session_config(record, layout)?)
                    .await?;
            }
        }
        Ok(())
    }

    async fn undo_step(&self, step: Step, record: &TenantRecord, layout: &TenantLayout) -> Result<(), EngineError> {
        match step {
            Step::Reserve => {
                tokio::fs::remove_dir_all(layout.base())
                    .await
                    .with_context(|| format!("remove {}", layout.base().display()))?;
            }
            Step::Download => {
                remove_if_exists(&layout.root().join("server.jar"))?;
            }
            Step::Configure => {
                self.dir.delete(&record.id)?;
                remove_if_exists(&layout.root().join("server.properties"))?;
                remove_if_exists(&layout.root().join("eula.txt"))?;
            }
            Step::Activate => {
                self.supervisor.remove_session(&record.id).await?;
            }
        }
        Ok(())
    }

    /// Kill anything running, drop the session and delete every file of the tenant.
    pub async fn deprovision(&self, tenant: &TenantId) -> Result<(), EngineError> {
        let layout = self.dir.layout(tenant)?;
        if self.dir.load(tenant)?.is_none() {
            return Err(EngineError::UnknownSession(tenant.to_string()));
        }

        match self.supervisor.remove_session(tenant).await {
            Ok(()) | Err(EngineError::UnknownSession(_)) => {}
            Err(e) => return Err(e),
        }
        self.dir.delete(tenant)?;
        match tokio::fs::remove_dir_all(layout.base()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("remove {}", layout.base().display()))
                    .into());
            }
        }

        tracing::info!(tenant_id = %tenant, "tenant deprovisioned");
        Ok(())
    }

    /// Recreate a session for every stored tenant. Returns how many came back.
    pub async fn restore_sessions(&self) -> Result<usize, EngineError> {
        let mut restored = 0;
        for mut record in self.dir.list()? {
            if self.supervisor.contains(&record.id).await {
                continue;
            }
            if validate_flags(&record.startup_flags).is_err() {
                tracing::warn!(tenant_id = %record.id, "stored startup flags rejected; starting without them");
                record.startup_flags.clear();
            }
            let layout = self.dir.layout(&record.id)?;
            let outcome = match session_config(&record, &layout) {
                Ok(cfg) => self.supervisor.create_session(cfg).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(tenant_id = %record.id, error = %e, "failed to restore session");
                }
            }
        }
        tracing::info!(restored, "sessions restored");
        Ok(restored)
    }

    /// Swap `server.jar` for another version. Only while the server is stopped.
    pub async fn change_version(&self, tenant: &TenantId, version: &str) -> Result<TenantRecord, EngineError> {
        let version = normalize_version(version)?;
        let mut record = self
            .dir
            .load(tenant)?
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;

        let status = self.supervisor.refresh(tenant).await?;
        if status.state != RunState::Stopped {
            return Err(EngineError::AlreadyRunning);
        }

        let layout = self.dir.layout(tenant)?;
        self.fetcher
            .fetch(&self.jar_url(&version), &layout.root().join("server.jar"))
            .await?;
        record.version = version;
        self.dir.save(&record)?;

        tracing::info!(tenant_id = %tenant, version = %record.version, "server version changed");
        Ok(record)
    }

    /// Apply and persist new extra flags for the next start. The base command
    /// stays the one written at provisioning time.
    pub async fn update_startup(
        &self,
        tenant: &TenantId,
        flags: &str,
    ) -> Result<StartupView, EngineError> {
        let mut record = self
            .dir
            .load(tenant)?
            .ok_or_else(|| EngineError::UnknownSession(tenant.to_string()))?;
        let view = self
            .supervisor
            .update_startup_config(tenant, &record.startup_command, flags)
            .await?;
        record.startup_command = view.base_command.clone();
        record.startup_flags = view.flags.clone();
        self.dir.save(&record)?;
        Ok(view)
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), EngineError> {
    std::fs::write(path, content).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<(), EngineError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("remove {}", path.display()))
            .into()),
    }
}
