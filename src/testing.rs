//! Test fixtures shared by the unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::artifacts::StageKind;
use crate::config::PipelineConfig;
use crate::error::ProcessError;
use crate::process::{ExecutionResult, ProcessInvocation, ProcessRunner};

/// Configuration document with one replica `A` and the given lag times.
pub(crate) fn fixture_doc(
    lag_times: &str,
    general_extra: &str,
    trajectories: &str,
    charmm_extra: &str,
) -> String {
    format!(
        r#"
[general]
output_dir = "out"
lag_times = {lag_times}
{general_extra}

[general.trajectories]
{trajectories}

[charmm]
executable = "charmm"
script = "tmat.inp"
tmat = "tmat/tmat.{{}}.{{}}.dat"
scratch_dir = "scratch"
{charmm_extra}

[equilibration]
nmc = 100
T = 1.0

[production]
nmc = 500
seed = 7
"#
    )
}

pub(crate) fn fixture_config(base: &Path, lag_times: &str, charmm_extra: &str) -> PipelineConfig {
    let doc = fixture_doc(lag_times, "", "A = [\"traj_A.dcd\", 0, 1000]", charmm_extra);
    PipelineConfig::from_toml_str(&doc, base).unwrap()
}

/// Fake runner that imitates both external tools and records every call.
///
/// By default it writes every output the real tools would write and exits 0.
pub(crate) struct RecordingRunner {
    calls: Mutex<Vec<ProcessInvocation>>,
    exit_codes: HashMap<StageKind, i32>,
    silent: Vec<StageKind>,
    failing_replicas: Vec<(StageKind, String)>,
    batch_lags: Option<Vec<u64>>,
    timed_out: Vec<StageKind>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingRunner {
    pub(crate) fn well_behaved() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            exit_codes: HashMap::new(),
            silent: Vec::new(),
            failing_replicas: Vec::new(),
            batch_lags: None,
            timed_out: Vec::new(),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Exit with `code` for every invocation of `stage`.
    pub(crate) fn with_exit_code(mut self, stage: StageKind, code: i32) -> Self {
        self.exit_codes.insert(stage, code);
        self
    }

    /// Write nothing for invocations of `stage`.
    pub(crate) fn without_outputs(mut self, stage: StageKind) -> Self {
        self.silent.push(stage);
        self
    }

    /// Exit 1 without outputs for `stage` of one replica.
    pub(crate) fn failing(mut self, stage: StageKind, replica: &str) -> Self {
        self.failing_replicas.push((stage, replica.to_string()));
        self
    }

    /// Batched invocations only write temporaries for these lag times.
    pub(crate) fn with_batch_lags(mut self, lags: Vec<u64>) -> Self {
        self.batch_lags = Some(lags);
        self
    }

    /// Report every invocation of `stage` as killed at its time limit.
    pub(crate) fn timing_out(mut self, stage: StageKind) -> Self {
        self.timed_out.push(stage);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Vec<ProcessInvocation> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_for(&self, stage: StageKind) -> Vec<ProcessInvocation> {
        self.calls()
            .into_iter()
            .filter(|call| stage_of(call) == stage)
            .collect()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn write_outputs(&self, invocation: &ProcessInvocation, stage: StageKind) {
        match stage {
            StageKind::TransitionMatrix => {
                let Some(target) = invocation.keyed_arg("TMAT") else {
                    return;
                };
                if invocation.keyed_arg("LAG").is_some() {
                    write_file(Path::new(target));
                    return;
                }
                let lags = match &self.batch_lags {
                    Some(lags) => lags.clone(),
                    None => batch_range(invocation),
                };
                for lag in lags {
                    write_file(Path::new(&format!("{}.{}", target, lag)));
                }
            }
            StageKind::Equilibration | StageKind::Production => {
                if let Some(target) = invocation.arg_after("-o") {
                    write_file(Path::new(target));
                }
            }
        }
    }
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ExecutionResult, ProcessError> {
        self.calls.lock().unwrap().push(invocation.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        write_file(&invocation.log_path);
        let stage = stage_of(invocation);
        if self.timed_out.contains(&stage) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ProcessError::TimedOut {
                program: invocation.program.display().to_string(),
                limit: invocation.timeout.unwrap_or(Duration::from_secs(1)),
            });
        }
        let replica = replica_of(invocation);
        let failing = self
            .failing_replicas
            .iter()
            .any(|(s, r)| *s == stage && Some(r.as_str()) == replica.as_deref());
        if !failing && !self.silent.contains(&stage) {
            self.write_outputs(invocation, stage);
        }
        let exit_code = if failing {
            1
        } else {
            self.exit_codes.get(&stage).copied().unwrap_or(0)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutionResult {
            exit_code: Some(exit_code),
            log_path: invocation.log_path.clone(),
            artifact: invocation.artifact.clone(),
            duration: Duration::ZERO,
        })
    }
}

/// Stage an invocation belongs to, judged from its arguments.
pub(crate) fn stage_of(invocation: &ProcessInvocation) -> StageKind {
    if invocation.arg_after("-o").is_none() {
        StageKind::TransitionMatrix
    } else if invocation.arg_after("--initf").is_some() {
        StageKind::Production
    } else {
        StageKind::Equilibration
    }
}

/// Replica id embedded in the log file name (`chm_tmat.<id>.…` / `profiles.<id>.…`).
fn replica_of(invocation: &ProcessInvocation) -> Option<String> {
    invocation
        .log_path
        .file_name()?
        .to_str()?
        .split('.')
        .nth(1)
        .map(str::to_string)
}

fn batch_range(invocation: &ProcessInvocation) -> Vec<u64> {
    let parse = |key: &str| invocation.keyed_arg(key).and_then(|v| v.parse::<u64>().ok());
    match (parse("FL"), parse("LL"), parse("IL")) {
        (Some(first), Some(last), Some(step)) if step > 0 => {
            (first..=last).step_by(step as usize).collect()
        }
        _ => Vec::new(),
    }
}

fn write_file(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, path.display().to_string()).unwrap();
}
