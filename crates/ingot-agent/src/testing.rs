//! In-memory stand-ins for the shell and liveness seams.

use std::{
    collections::HashSet,
    io,
    path::Path,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;

use crate::{
    artifact_fetch::ArtifactFetcher,
    error::EngineError,
    liveness::LivenessOracle,
    pty_shell::{ShellHandle, ShellLauncher},
};

#[derive(Default)]
pub(crate) struct FakeOracle {
    pub sentinel: Mutex<Option<u32>>,
    pub alive: Mutex<HashSet<u32>>,
    pub killed: Mutex<Vec<u32>>,
}

impl FakeOracle {
    pub fn server_started(&self, pid: u32) {
        *self.sentinel.lock().unwrap() = Some(pid);
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn server_died(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn sentinel_deleted(&self) {
        *self.sentinel.lock().unwrap() = None;
    }
}

impl LivenessOracle for FakeOracle {
    fn sentinel_pid(&self) -> Option<u32> {
        *self.sentinel.lock().unwrap()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn clear_sentinel(&self) {
        *self.sentinel.lock().unwrap() = None;
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        self.killed.lock().unwrap().push(pid);
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }
}

struct FakeShell {
    written: Arc<Mutex<String>>,
}

impl ShellHandle for FakeShell {
    fn write(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.written
            .lock()
            .unwrap()
            .push_str(&String::from_utf8_lossy(data));
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        Some(1)
    }

    fn terminate(&mut self) {}
}

/// Records everything written to the shell and lets a test inject output.
#[derive(Default)]
pub(crate) struct FakeLauncher {
    pub written: Arc<Mutex<String>>,
    pub output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl FakeLauncher {
    pub async fn emit(&self, text: &str) {
        let tx = self.output.lock().unwrap().clone().unwrap();
        tx.send(text.as_bytes().to_vec()).await.unwrap();
    }

    pub fn written(&self) -> String {
        self.written.lock().unwrap().clone()
    }

    /// Close the output stream, as if the shell exited.
    pub fn hang_up(&self) {
        self.output.lock().unwrap().take();
    }
}

impl ShellLauncher for FakeLauncher {
    fn spawn(
        &self,
        _cwd: &Path,
    ) -> Result<(Box<dyn ShellHandle>, mpsc::Receiver<Vec<u8>>), EngineError> {
        let (tx, rx) = mpsc::channel(64);
        *self.output.lock().unwrap() = Some(tx);
        Ok((
            Box::new(FakeShell {
                written: self.written.clone(),
            }),
            rx,
        ))
    }
}

pub(crate) struct FailingLauncher;

impl ShellLauncher for FailingLauncher {
    fn spawn(
        &self,
        _cwd: &Path,
    ) -> Result<(Box<dyn ShellHandle>, mpsc::Receiver<Vec<u8>>), EngineError> {
        Err(EngineError::SpawnFailure("no such shell".into()))
    }
}

/// Writes the requested URL into `dest` instead of downloading anything.
#[derive(Default)]
pub(crate) struct FakeFetcher {
    pub fail: bool,
    pub urls: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, EngineError> {
        self.urls.lock().unwrap().push(url.to_string());
        if self.fail {
            return Err(EngineError::DownloadFailure("503 Service Unavailable".into()));
        }
        std::fs::write(dest, url.as_bytes()).unwrap();
        Ok(url.len() as u64)
    }
}
