//! Transition-matrix extraction.
//!
//! Two strategies exist. `PerLagTime` runs the analysis executable once per
//! lag time. `BatchedLagRange` runs it once over a lag range and relocates
//! one temporary per lag time, all or nothing.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{relocate, ScratchDir, StageExecutor};
use crate::artifacts::{StageArtifact, StageKind, WorkUnit};
use crate::config::{ExitCodePolicy, Replica, TransitionMatrixStrategy};
use crate::error::{ConfigError, StageError};
use crate::process::{ExecutionResult, ProcessInvocation};

/// Lag range covered by one batched invocation (`FL:`, `LL:`, `IL:`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LagRange {
    pub first: u64,
    pub last: u64,
    pub step: u64,
}

impl LagRange {
    /// Smallest evenly spaced range containing every lag in `lags`.
    ///
    /// Returns `None` for an empty slice.
    pub fn covering(lags: &[u64]) -> Option<Self> {
        let mut sorted = lags.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let first = *sorted.first()?;
        let last = *sorted.last()?;
        let step = sorted
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .fold(0, gcd);
        Some(Self {
            first,
            last,
            step: step.max(1),
        })
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

impl StageExecutor {
    /// Make sure the transition matrices of `lags` exist for `replica`, using
    /// the configured strategy. Returns them in the order of `lags`.
    pub async fn ensure_transition_matrices(
        &self,
        replica: &Replica,
        lags: &[u64],
    ) -> Result<Vec<StageArtifact>, StageError> {
        match self.config.transition.strategy {
            TransitionMatrixStrategy::PerLagTime => {
                let mut artifacts = Vec::with_capacity(lags.len());
                for &lag in lags {
                    artifacts.push(self.transition_matrix(replica, lag).await?);
                }
                Ok(artifacts)
            }
            TransitionMatrixStrategy::BatchedLagRange => {
                self.transition_matrix_batch(replica, lags).await
            }
        }
    }

    /// Extract the transition matrix of one lag time.
    pub async fn transition_matrix(
        &self,
        replica: &Replica,
        lag: u64,
    ) -> Result<StageArtifact, StageError> {
        let unit = WorkUnit::new(replica.id.clone(), lag);
        let resolver = self.resolver();
        let artifact = resolver.transition_matrix(&unit)?;
        if artifact.exists() {
            info!(
                replica = %replica.id,
                lag,
                path = %artifact.path().display(),
                "transition matrix exists, not updating"
            );
            return Ok(artifact);
        }

        let log = resolver.transition_log(&unit);
        let scratch = ScratchDir::create(&self.config.transition.scratch_dir, &replica.id, &[lag])?;
        let temporary = scratch.single();

        let mut args = self.frame_args(replica);
        args.push(format!("LAG:{}", lag));
        args.push(format!("TRJ:{}", replica.trajectory.display()));
        args.push(format!("TMAT:{}", temporary.display()));
        let invocation = self
            .transition_invocation(replica, &log, args)
            .env("TMAT", artifact.path().display().to_string())
            .artifact(artifact.path());

        info!(replica = %replica.id, lag, command = %invocation, "extracting transition matrix");
        let result = self
            .invoke(
                &invocation,
                &replica.id,
                &[lag],
                StageKind::TransitionMatrix,
                artifact.path(),
            )
            .await?;
        self.check_exit(&result, &replica.id, &[lag], artifact.path())?;

        if !temporary.is_file() {
            return Err(StageError::ArtifactMissing {
                replica: replica.id.clone(),
                lags: vec![lag],
                stage: StageKind::TransitionMatrix,
                artifact: artifact.path().to_path_buf(),
                log,
            });
        }
        relocate(&replica.id, lag, &temporary, artifact.path())?;
        if !artifact.exists() {
            return Err(StageError::ArtifactMissing {
                replica: replica.id.clone(),
                lags: vec![lag],
                stage: StageKind::TransitionMatrix,
                artifact: artifact.path().to_path_buf(),
                log,
            });
        }

        info!(replica = %replica.id, lag, path = %artifact.path().display(), "transition matrix assembled");
        Ok(artifact)
    }

    /// Extract the transition matrices of several lag times in one invocation.
    ///
    /// Only lag times without a final matrix are requested. Every requested
    /// temporary must be present before any of them is relocated.
    pub async fn transition_matrix_batch(
        &self,
        replica: &Replica,
        lags: &[u64],
    ) -> Result<Vec<StageArtifact>, StageError> {
        let resolver = self.resolver();
        let artifacts = lags
            .iter()
            .map(|&lag| {
                resolver
                    .transition_matrix(&WorkUnit::new(replica.id.clone(), lag))
                    .map(|artifact| (lag, artifact))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let pending: Vec<(u64, &StageArtifact)> = artifacts
            .iter()
            .filter(|(_, artifact)| !artifact.exists())
            .map(|(lag, artifact)| (*lag, artifact))
            .collect();
        let pending_lags: Vec<u64> = pending.iter().map(|(lag, _)| *lag).collect();
        let range = match LagRange::covering(&pending_lags) {
            Some(range) => range,
            None => {
                info!(
                    replica = %replica.id,
                    count = artifacts.len(),
                    "all transition matrices exist, not updating"
                );
                return Ok(artifacts.into_iter().map(|(_, artifact)| artifact).collect());
            }
        };

        let log = resolver.batch_log(&replica.id, range.first, range.last, range.step);
        let scratch =
            ScratchDir::create(&self.config.transition.scratch_dir, &replica.id, &pending_lags)?;
        let prefix = scratch.batch_prefix();

        let mut args = self.frame_args(replica);
        args.push(format!("FL:{}", range.first));
        args.push(format!("LL:{}", range.last));
        args.push(format!("IL:{}", range.step));
        args.push(format!("TRJ:{}", replica.trajectory.display()));
        args.push(format!("TMAT:{}", prefix.display()));
        let invocation = self
            .transition_invocation(replica, &log, args)
            .env("TMAT", prefix.display().to_string());

        info!(
            replica = %replica.id,
            first = range.first,
            last = range.last,
            step = range.step,
            command = %invocation,
            "extracting transition matrices"
        );
        // `pending` is non-empty once a range exists.
        let first_pending = pending[0].1.path();
        let result = self
            .invoke(
                &invocation,
                &replica.id,
                &pending_lags,
                StageKind::TransitionMatrix,
                first_pending,
            )
            .await?;
        self.check_exit(&result, &replica.id, &pending_lags, first_pending)?;

        let (missing, expected): (Vec<u64>, Vec<PathBuf>) = pending
            .iter()
            .filter(|(lag, _)| !scratch.batch_output(*lag).is_file())
            .map(|(lag, artifact)| (*lag, artifact.path().to_path_buf()))
            .unzip();
        if !missing.is_empty() {
            return Err(StageError::BatchArtifactIncomplete {
                replica: replica.id.clone(),
                missing,
                artifacts: expected,
                log,
            });
        }

        for (lag, artifact) in &pending {
            relocate(&replica.id, *lag, &scratch.batch_output(*lag), artifact.path())?;
            if !artifact.exists() {
                return Err(StageError::ArtifactMissing {
                    replica: replica.id.clone(),
                    lags: vec![*lag],
                    stage: StageKind::TransitionMatrix,
                    artifact: artifact.path().to_path_buf(),
                    log: log.clone(),
                });
            }
        }

        info!(replica = %replica.id, count = pending.len(), "transition matrices assembled");
        Ok(artifacts.into_iter().map(|(_, artifact)| artifact).collect())
    }

    fn frame_args(&self, replica: &Replica) -> Vec<String> {
        vec![
            format!("FF:{}", replica.first_frame),
            format!("LF:{}", replica.last_frame),
        ]
    }

    fn transition_invocation(
        &self,
        replica: &Replica,
        log: &Path,
        mut args: Vec<String>,
    ) -> ProcessInvocation {
        let transition = &self.config.transition;
        args.extend(transition.extra_args.iter().cloned());
        ProcessInvocation::new(&transition.executable, log)
            .args(args)
            .stdin(&transition.script)
            .cwd(&replica.workdir)
            .timeout(self.config.timeouts.for_stage(StageKind::TransitionMatrix))
    }

    /// Apply the configured exit-code policy of the transition-matrix stage.
    fn check_exit(
        &self,
        result: &ExecutionResult,
        replica: &str,
        lags: &[u64],
        artifact: &Path,
    ) -> Result<(), StageError> {
        if result.succeeded() {
            return Ok(());
        }
        match self.config.transition.exit_policy {
            ExitCodePolicy::Fail => Err(StageError::ProcessExit {
                replica: replica.to_string(),
                lags: lags.to_vec(),
                stage: StageKind::TransitionMatrix,
                exit_code: result.exit_code,
                artifact: artifact.to_path_buf(),
                log: result.log_path.clone(),
            }),
            ExitCodePolicy::Warn => {
                warn!(
                    replica,
                    lags = ?lags,
                    exit_code = ?result.exit_code,
                    log = %result.log_path.display(),
                    "transition-matrix executable exited unsuccessfully, checking outputs anyway"
                );
                Ok(())
            }
        }
    }
}
