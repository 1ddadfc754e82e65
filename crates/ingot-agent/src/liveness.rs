use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
};

/// Decides whether the game server launched inside a session still exists.
///
/// The supervisor's state machine only talks to this trait, so the PID-file
/// protocol can be swapped for a process-group handle without touching it.
pub trait LivenessOracle: Send + Sync {
    /// PID the launch shell recorded for the game server, if any.
    fn sentinel_pid(&self) -> Option<u32>;
    fn is_alive(&self, pid: u32) -> bool;
    fn clear_sentinel(&self);
    /// SIGKILL `pid` and all of its descendants. Already-dead processes are not an error.
    fn kill_tree(&self, pid: u32) -> io::Result<()>;
}

/// Production oracle: a sentinel file written by the launch shell plus a signal-0 probe.
#[derive(Debug, Clone)]
pub struct SentinelFileOracle {
    path: PathBuf,
}

impl SentinelFileOracle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_pid(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|pid| *pid > 0 && *pid <= i32::MAX as u32)
}

impl LivenessOracle for SentinelFileOracle {
    fn sentinel_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| parse_pid(&s))
    }

    fn is_alive(&self, pid: u32) -> bool {
        probe_pid(pid)
    }

    fn clear_sentinel(&self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pid sentinel");
        }
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        kill_process_tree(pid)
    }
}

#[cfg(unix)]
pub fn probe_pid(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn probe_pid(_pid: u32) -> bool {
    false
}

/// Parent PID out of a `/proc/<pid>/stat` line. The command name may contain
/// spaces and parentheses, so parsing starts after the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

fn children_by_parent() -> HashMap<u32, Vec<u32>> {
    let mut out: HashMap<u32, Vec<u32>> = HashMap::new();
    let Ok(rd) = std::fs::read_dir("/proc") else {
        return out;
    };
    for ent in rd.flatten() {
        let Some(pid) = ent.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(ent.path().join("stat")) else {
            continue;
        };
        if let Some(ppid) = parse_stat_ppid(&stat) {
            out.entry(ppid).or_default().push(pid);
        }
    }
    out
}

/// `pid` followed by its descendants in breadth-first order.
pub fn process_tree(pid: u32) -> Vec<u32> {
    let children = children_by_parent();
    let mut order = vec![pid];
    let mut i = 0;
    while i < order.len() {
        if let Some(kids) = children.get(&order[i]) {
            for k in kids {
                if !order.contains(k) {
                    order.push(*k);
                }
            }
        }
        i += 1;
    }
    order
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) -> io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    }

    // Leaves first so nothing gets a chance to respawn under a dying parent.
    for p in process_tree(pid).into_iter().rev() {
        let rc = unsafe { libc::kill(p as i32, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = p, error = %err, "kill failed");
                if p == pid {
                    return Err(err);
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_tree(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process tree kill is only supported on unix",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_parsing_survives_odd_command_names() {
        assert_eq!(parse_stat_ppid("42 (java) S 7 42 42 0 -1"), Some(7));
        assert_eq!(parse_stat_ppid("42 (a) b (c)) R 99 1 1"), Some(99));
        assert_eq!(parse_stat_ppid("garbage"), None);
    }

    #[test]
    fn sentinel_reads_trimmed_pid_and_ignores_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let oracle = SentinelFileOracle::new(tmp.path().join("minecraft_pid.txt"));
        assert_eq!(oracle.sentinel_pid(), None);

        std::fs::write(oracle.path(), "4321\n").unwrap();
        assert_eq!(oracle.sentinel_pid(), Some(4321));

        std::fs::write(oracle.path(), "not a pid").unwrap();
        assert_eq!(oracle.sentinel_pid(), None);

        std::fs::write(oracle.path(), "0").unwrap();
        assert_eq!(oracle.sentinel_pid(), None);

        oracle.clear_sentinel();
        assert!(!oracle.path().exists());
        // Clearing twice is fine.
        oracle.clear_sentinel();
    }

    #[cfg(unix)]
    #[test]
    fn probe_sees_own_process() {
        assert!(probe_pid(std::process::id()));
        assert!(!probe_pid(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kill_tree_takes_down_children() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();
        std::thread::sleep(std::time::Duration::from_millis(200));
        assert!(process_tree(pid).len() >= 2);

        kill_process_tree(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());

        // Already gone: still not an error.
        kill_process_tree(pid).unwrap();
    }
}
