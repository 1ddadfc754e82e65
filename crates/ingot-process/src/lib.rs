use std::fmt;

/// Opaque tenant identifier. One tenant owns one game server and one sandbox directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derived state of a managed game server.
///
/// NOTE: This is never authoritative. The supervisor re-derives it from the
/// sentinel PID file and a liveness probe on every output tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    /// True while the game server process is believed to exist.
    pub fn is_live(self) -> bool {
        matches!(self, RunState::Running | RunState::Stopping)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionStatus {
    pub tenant_id: TenantId,
    pub state: RunState,
    pub pid: Option<u32>,
    pub effective_command: String,
    pub message: Option<String>,
}

/// Event fanned out to every viewer subscribed to a tenant's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Raw bytes read from the pseudo-terminal.
    Output(Vec<u8>),
    /// Game server liveness; `true` once running, `false` once stopped.
    Status(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Zip,
    Unzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    fn rank(self) -> u8 {
        match self {
            TaskStatus::Queued => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Completed | TaskStatus::Error => 2,
        }
    }

    /// Status only moves forward: Queued -> InProgress -> {Completed | Error}.
    /// A queued task may fail before it starts; nothing leaves a terminal state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self == next {
            return true;
        }
        next.rank() > self.rank()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_non_empty_and_unique() {
        let a = TenantId::new();
        let b = TenantId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
        assert!(!TaskId::new().0.is_empty());
    }

    #[test]
    fn task_status_moves_forward_only() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(InProgress));
        assert!(Queued.can_transition_to(Error));
        assert!(InProgress.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Error));
        assert!(!InProgress.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn task_status_serializes_like_the_web_client_expects() {
        let s = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(s, "\"in-progress\"");
        let s = serde_json::to_string(&RunState::Stopping).unwrap();
        assert_eq!(s, "\"stopping\"");
    }

    #[test]
    fn live_states() {
        assert!(RunState::Running.is_live());
        assert!(RunState::Stopping.is_live());
        assert!(!RunState::Starting.is_live());
        assert!(!RunState::Stopped.is_live());
    }
}
