use std::{
    net::SocketAddr,
    path::PathBuf,
    time::Duration,
};

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_MAX_BYTES: u64 = 4 * 1024 * 1024; // 4 MiB
const DEFAULT_ARCHIVE_WORKERS: usize = 4;
const DEFAULT_START_GRACE_MS: u64 = 120_000;
const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 5000;
const DEFAULT_TASK_RETENTION_SEC: u64 = 60 * 60;
const DEFAULT_SERVER_JAR_URL: &str =
    "https://meta.fabricmc.net/v2/versions/loader/{version}/stable/stable/server/jar";

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_bool(raw: Option<&str>, default_value: bool) -> bool {
    match raw
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .as_deref()
    {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default_value,
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub listen_addr: SocketAddr,
    pub log_max_lines: usize,
    pub log_max_bytes: u64,
    pub archive_workers: usize,
    pub start_grace: Duration,
    /// Supplementary timer probe; `None` leaves liveness purely output-driven.
    pub liveness_interval: Option<Duration>,
    pub task_retention: Duration,
    pub shell: String,
    pub stop_command: String,
    /// Must contain `{version}`.
    pub server_jar_url: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            listen_addr: ([0, 0, 0, 0], 3001).into(),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_max_bytes: DEFAULT_LOG_MAX_BYTES,
            archive_workers: DEFAULT_ARCHIVE_WORKERS,
            start_grace: Duration::from_millis(DEFAULT_START_GRACE_MS),
            liveness_interval: Some(Duration::from_millis(DEFAULT_LIVENESS_INTERVAL_MS)),
            task_retention: Duration::from_secs(DEFAULT_TASK_RETENTION_SEC),
            shell: "bash".to_string(),
            stop_command: "stop".to_string(),
            server_jar_url: DEFAULT_SERVER_JAR_URL.to_string(),
            log_dir: None,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match env_string("INGOT_LISTEN_ADDR") {
            Some(raw) => raw
                .parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid INGOT_LISTEN_ADDR {raw:?}: {e}"))?,
            None => defaults.listen_addr,
        };

        let server_jar_url = env_string("INGOT_SERVER_JAR_URL").unwrap_or(defaults.server_jar_url);
        if !server_jar_url.contains("{version}") {
            anyhow::bail!("INGOT_SERVER_JAR_URL must contain a {{version}} placeholder");
        }

        let liveness_interval = match env_u64("INGOT_LIVENESS_INTERVAL_MS") {
            Some(0) => None,
            Some(v) => Some(Duration::from_millis(v.clamp(250, 10 * 60 * 1000))),
            None => defaults.liveness_interval,
        };

        Ok(Self {
            data_root: data_root(env_string("INGOT_DATA_ROOT")),
            listen_addr,
            log_max_lines: env_usize("INGOT_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(defaults.log_max_lines),
            log_max_bytes: env_u64("INGOT_LOG_MAX_BYTES")
                .map(|v| v.clamp(64 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(defaults.log_max_bytes),
            archive_workers: env_usize("INGOT_ARCHIVE_WORKERS")
                .map(|v| v.clamp(1, 64))
                .unwrap_or(defaults.archive_workers),
            start_grace: env_u64("INGOT_START_GRACE_MS")
                .map(|v| Duration::from_millis(v.clamp(1000, 30 * 60 * 1000)))
                .unwrap_or(defaults.start_grace),
            liveness_interval,
            task_retention: env_u64("INGOT_TASK_RETENTION_SEC")
                .map(|v| Duration::from_secs(v.clamp(60, 7 * 24 * 60 * 60)))
                .unwrap_or(defaults.task_retention),
            shell: env_string("INGOT_SHELL").unwrap_or(defaults.shell),
            stop_command: env_string("INGOT_STOP_COMMAND").unwrap_or(defaults.stop_command),
            server_jar_url,
            log_dir: env_string("INGOT_LOG_DIR").map(PathBuf::from),
        })
    }

    pub fn server_jar_url_for(&self, version: &str) -> String {
        self.server_jar_url.replace("{version}", version)
    }
}

fn data_root(raw: Option<String>) -> PathBuf {
    let p = PathBuf::from(raw.unwrap_or_else(|| "./data".to_string()));
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}
