//! Idempotent stage execution.
//!
//! Each stage follows the same protocol: if its artifact already exists the
//! stage is a no-op; otherwise the external command runs and the artifact
//! must exist afterwards, or the stage fails with an error naming the
//! expected artifact and the log to inspect.

mod solver;
mod transition;

pub use transition::LagRange;

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::artifacts::{ArtifactResolver, StageKind};
use crate::config::{PipelineConfig, Replica};
use crate::error::{ConfigError, StageError};
use crate::process::{ExecutionResult, ProcessInvocation, ProcessRunner};

/// File stem of temporaries written into a scratch directory.
const SCRATCH_STEM: &str = "tmat";

/// Runs the pipeline's stages against a shared configuration and runner.
///
/// Cloning is cheap; every worker gets its own clone.
#[derive(Clone)]
pub struct StageExecutor {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn ProcessRunner>,
}

impl StageExecutor {
    pub fn new(config: Arc<PipelineConfig>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn resolver(&self) -> ArtifactResolver<'_> {
        ArtifactResolver::new(&self.config)
    }

    pub(crate) fn replica(&self, id: &str) -> Result<&Replica, StageError> {
        self.config.replica(id).ok_or_else(|| {
            StageError::Config(ConfigError::invalid(
                "general",
                format!("trajectories.{}", id),
                "no replica with this id",
            ))
        })
    }

    async fn invoke(
        &self,
        invocation: &ProcessInvocation,
        replica: &str,
        lags: &[u64],
        stage: StageKind,
        artifact: &Path,
    ) -> Result<ExecutionResult, StageError> {
        self.runner
            .run(invocation)
            .await
            .map_err(|source| StageError::Process {
                replica: replica.to_string(),
                lags: lags.to_vec(),
                stage,
                artifact: artifact.to_path_buf(),
                log: invocation.log_path.clone(),
                source,
            })
    }
}

/// Lowercase-only scratch directory owned by one invocation.
///
/// The transition-matrix executable cannot write mixed-case file names, so
/// its outputs land here first and are moved to their final paths afterwards.
/// The directory is removed on drop.
pub(crate) struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub(crate) fn create(root: &Path, replica: &str, lags: &[u64]) -> Result<Self, StageError> {
        let mut hasher = Sha256::new();
        hasher.update(replica.as_bytes());
        hasher.update([0u8]);
        for lag in lags {
            hasher.update(lag.to_le_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        let path = root.join(format!("mcdiff-{}-{}", &digest[..16], std::process::id()));

        let scratch_error = |source| StageError::Scratch {
            replica: replica.to_string(),
            lags: lags.to_vec(),
            path: path.clone(),
            source,
        };
        if path.exists() {
            fs::remove_dir_all(&path).map_err(scratch_error)?;
        }
        fs::create_dir_all(&path).map_err(scratch_error)?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Temporary written by a single-lag invocation.
    pub(crate) fn single(&self) -> PathBuf {
        self.path.join(SCRATCH_STEM)
    }

    /// Prefix handed to a batched invocation.
    pub(crate) fn batch_prefix(&self) -> PathBuf {
        self.path.join(SCRATCH_STEM)
    }

    /// Temporary written by a batched invocation for one lag time.
    pub(crate) fn batch_output(&self, lag: u64) -> PathBuf {
        let mut name: OsString = self.batch_prefix().into_os_string();
        name.push(format!(".{}", lag));
        PathBuf::from(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            debug!(path = %self.path.display(), error = %err, "could not remove scratch directory");
        }
    }
}

/// Move a produced transition matrix of `replica` at `lag` to its final
/// location, across filesystems if needed.
pub(crate) fn relocate(replica: &str, lag: u64, from: &Path, to: &Path) -> Result<(), StageError> {
    let relocate_error = |source| StageError::Relocate {
        replica: replica.to_string(),
        lags: vec![lag],
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(relocate_error)?;
    }
    if let Err(rename_err) = fs::rename(from, to) {
        debug!(from = %from.display(), to = %to.display(), error = %rename_err, "rename failed, copying");
        fs::copy(from, to).map_err(|_| relocate_error(rename_err))?;
        let _ = fs::remove_file(from);
    }
    Ok(())
}
