use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ingot_process::{TaskId, TaskKind, TaskStatus, TenantId};

use crate::error::EngineError;

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Byte-accurate progress, falling back to entry counts when there are no bytes.
pub fn compute_progress(
    processed_bytes: u64,
    total_bytes: u64,
    entries_processed: u64,
    entries_total: u64,
) -> f64 {
    if total_bytes > 0 {
        (processed_bytes as f64 / total_bytes as f64).clamp(0.0, 1.0)
    } else if entries_total > 0 {
        (entries_processed as f64 / entries_total as f64).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Who a task belongs to. Status queries from another tenant see "not found".
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TaskScope {
    pub tenant_id: TenantId,
    pub operation: String,
}

impl TaskScope {
    pub fn new(tenant_id: TenantId, operation: impl Into<String>) -> Self {
        Self {
            tenant_id,
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: f64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub entries_total: u64,
    pub entries_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_size: Option<u64>,
    pub scope: TaskScope,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at_unix_ms: Option<u64>,

    // Engine-internal; never serialized to clients.
    #[serde(skip)]
    pub result_path: Option<PathBuf>,
    #[serde(skip)]
    pub cleanup: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskInit {
    pub file_name: Option<String>,
    pub result_path: Option<PathBuf>,
    pub cleanup: bool,
}

/// Partial update merged into a task record. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<f64>,
    pub total_bytes: Option<u64>,
    pub processed_bytes: Option<u64>,
    pub entries_total: Option<u64>,
    pub entries_processed: Option<u64>,
    pub message: Option<String>,
    pub archive_size: Option<u64>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Error),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<String, Task>>>,
    retention: Duration,
}

impl TaskRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            retention,
        }
    }

    fn cleanup_locked(&self, map: &mut HashMap<String, Task>) {
        let now = now_unix_ms();
        let retention_ms = self.retention.as_millis() as u64;

        map.retain(|id, task| {
            let Some(finished) = task.finished_at_unix_ms else {
                return true;
            };
            if now.saturating_sub(finished) <= retention_ms {
                return true;
            }
            // Transient artifacts that nobody came to fetch are owned by the task; drop them with it.
            if task.cleanup
                && let Some(path) = &task.result_path
            {
                let _ = std::fs::remove_file(path);
            }
            tracing::debug!(task_id = %id, "expired task garbage-collected");
            false
        });
    }

    pub fn create(&self, kind: TaskKind, scope: TaskScope, init: TaskInit) -> Task {
        let now = now_unix_ms();
        let task = Task {
            id: TaskId::new(),
            kind,
            status: TaskStatus::Queued,
            progress: 0.0,
            total_bytes: 0,
            processed_bytes: 0,
            entries_total: 0,
            entries_processed: 0,
            message: None,
            file_name: init.file_name,
            archive_size: None,
            scope,
            created_at_unix_ms: now,
            updated_at_unix_ms: now,
            finished_at_unix_ms: None,
            result_path: init.result_path,
            cleanup: init.cleanup,
        };

        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.cleanup_locked(&mut map);
        map.insert(task.id.0.clone(), task.clone());
        task
    }

    /// Merge `update` into the task. Unknown ids are a no-op (returns false).
    ///
    /// Status never moves backwards and nothing leaves a terminal state; while a
    /// task is in progress its byte counter and progress never decrease.
    pub fn update(&self, id: &TaskId, update: TaskUpdate) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = map.get_mut(id.as_str()) else {
            return false;
        };

        if task.status.is_terminal() {
            tracing::debug!(task_id = %id, status = ?task.status, "ignoring update to finished task");
            return true;
        }

        if let Some(next) = update.status {
            if task.status.can_transition_to(next) {
                task.status = next;
                if next.is_terminal() {
                    task.finished_at_unix_ms = Some(now_unix_ms());
                }
            } else {
                tracing::warn!(task_id = %id, from = ?task.status, to = ?next, "illegal task transition ignored");
            }
        }
        if let Some(v) = update.total_bytes {
            task.total_bytes = v;
        }
        if let Some(v) = update.entries_total {
            task.entries_total = v;
        }
        if let Some(v) = update.processed_bytes {
            task.processed_bytes = task.processed_bytes.max(v);
        }
        if let Some(v) = update.entries_processed {
            task.entries_processed = task.entries_processed.max(v);
        }
        if let Some(p) = update.progress {
            let p = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
            task.progress = task.progress.max(p);
        }
        if let Some(m) = update.message {
            task.message = Some(m);
        }
        if let Some(v) = update.archive_size {
            task.archive_size = Some(v);
        }
        task.updated_at_unix_ms = now_unix_ms();
        true
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.cleanup_locked(&mut map);
        map.get(id.as_str()).cloned()
    }

    /// Status query on behalf of a tenant. Tasks of other tenants are invisible.
    pub fn get_scoped(&self, id: &TaskId, tenant: &TenantId) -> Result<Task, EngineError> {
        match self.get(id) {
            Some(t) if &t.scope.tenant_id == tenant => Ok(t),
            _ => Err(EngineError::TaskNotFound(id.to_string())),
        }
    }

    pub fn remove(&self, id: &TaskId) -> Option<Task> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(id.as_str())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
