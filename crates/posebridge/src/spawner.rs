//! Worker process spawning.
//!
//! The worker's stdout and stderr share one pipe so the relay sees a single
//! interleaved stream, in the order the worker wrote it.

use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

use crate::config::WorkerConfig;

/// Read end of the worker's merged output.
pub type WorkerOutput = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create output pipe: {0}")]
    Pipe(std::io::Error),
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A freshly started worker and the stream to relay.
pub struct SpawnedWorker {
    pub child: Child,
    pub output: WorkerOutput,
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError>;
}

/// Runs a program with fixed arguments.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.program.clone(), config.args())
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

/// Close-on-exec so concurrently spawned processes never inherit a write end
/// and hold the stream open.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn output_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn output_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe()
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<SpawnedWorker, SpawnError> {
        let (read_end, write_end) =
            output_pipe().map_err(|e| SpawnError::Pipe(std::io::Error::from(e)))?;
        let stderr_end = write_end.try_clone().map_err(SpawnError::Pipe)?;

        tracing::debug!(program = %self.program.display(), args = ?self.args, "Spawning worker");

        // The command owns the parent's copies of the write end; it has to be
        // dropped right after spawn or the reader never sees EOF.
        let child = {
            let mut command = Command::new(&self.program);
            command
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(write_end))
                .stderr(Stdio::from(stderr_end))
                .kill_on_drop(true);
            command.spawn()?
        };

        let output = pipe::Receiver::from_owned_fd(read_end).map_err(SpawnError::Pipe)?;

        Ok(SpawnedWorker {
            child,
            output: Box::new(output),
        })
    }
}
