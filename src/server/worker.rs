//! Isolated worker process launched per accepted connection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::process::resolve_executable;
use crate::{AppError, Result};

/// Command line for the per-connection worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable path or bare name resolved on `PATH`.
    pub executable: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    /// Worker running `executable` with `args`.
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Locate the executable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExecutableNotFound` if it does not exist.
    pub fn resolve(&self) -> Result<PathBuf> {
        resolve_executable(&self.executable)
    }

    /// Spawn the resolved executable with all three stdio streams piped.
    ///
    /// The child is killed if its handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SpawnFailed` if the OS refuses to start it.
    pub fn spawn(&self, program: &Path) -> Result<Child> {
        Command::new(program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::SpawnFailed(format!("failed to spawn worker {}: {err}", program.display()))
            })
    }
}
