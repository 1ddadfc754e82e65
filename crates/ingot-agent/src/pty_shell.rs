use std::{
    io::{Read, Write},
    path::Path,
};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::mpsc;

use crate::error::EngineError;

const OUTPUT_QUEUE: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

/// Writable end of a session's carrier shell.
pub trait ShellHandle: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), EngineError>;
    fn pid(&self) -> Option<u32>;
    /// Kill the shell itself. The game server is handled separately.
    fn terminate(&mut self);
}

/// Spawns carrier shells. Output chunks arrive on the returned channel, which
/// closes when the shell exits.
pub trait ShellLauncher: Send + Sync {
    fn spawn(
        &self,
        cwd: &Path,
    ) -> Result<(Box<dyn ShellHandle>, mpsc::Receiver<Vec<u8>>), EngineError>;
}

pub struct PtyShell {
    // Dropping the master closes the terminal, so it has to live as long as the session.
    _master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

impl ShellHandle for PtyShell {
    fn write(&mut self, data: &[u8]) -> Result<(), EngineError> {
        self.writer
            .write_all(data)
            .and_then(|()| self.writer.flush())
            .map_err(|e| EngineError::SessionIo(e.to_string()))
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "shell already gone");
        }
        let _ = self.child.try_wait();
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.terminate();
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtyLauncher {
    shell: String,
}

impl PtyLauncher {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ShellLauncher for PtyLauncher {
    fn spawn(
        &self,
        cwd: &Path,
    ) -> Result<(Box<dyn ShellHandle>, mpsc::Receiver<Vec<u8>>), EngineError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::SpawnFailure(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(cwd);
        cmd.env("TERM", "xterm-color");
        cmd.env("BASH_SILENCE_DEPRECATION_WARNING", "1");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| EngineError::SpawnFailure(format!("{}: {e}", self.shell)))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::SpawnFailure(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::SpawnFailure(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE);
        spawn_reader(reader, tx);

        tracing::debug!(shell = %self.shell, cwd = %cwd.display(), pid = ?child.process_id(), "pty shell spawned");
        Ok((
            Box::new(PtyShell {
                _master: pair.master,
                child,
                writer,
            }),
            rx,
        ))
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // EIO once the shell exits on Linux.
                Err(_) => break,
            }
        }
    });
}

/// Quote a path for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Line that launches the game server in the background, records its PID in
/// the sentinel file and brings it back to the foreground so the console
/// stays attached to it.
pub fn launch_line(effective_command: &str, sentinel: &Path) -> String {
    format!(
        "{effective_command} & echo $! > {}; fg\n",
        shell_quote(&sentinel.to_string_lossy())
    )
}
