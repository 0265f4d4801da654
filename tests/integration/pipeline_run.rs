//! Library-level runs against fake external tools.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mcdiff_chm::{
    ConfigError, ExecutionResult, Pipeline, PipelineConfig, PipelineError, ProcessError,
    ProcessInvocation, ProcessRunner, StageKind,
};
use tempfile::TempDir;

/// Writes whatever the real tools would write and remembers every command.
#[derive(Default)]
struct StubTools {
    calls: Mutex<Vec<ProcessInvocation>>,
}

impl StubTools {
    fn calls(&self) -> Vec<ProcessInvocation> {
        self.calls.lock().unwrap().clone()
    }

    fn solver_calls(&self) -> Vec<ProcessInvocation> {
        self.calls()
            .into_iter()
            .filter(|call| call.arg_after("-o").is_some())
            .collect()
    }
}

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "stub").unwrap();
}

#[async_trait]
impl ProcessRunner for StubTools {
    async fn run(&self, invocation: &ProcessInvocation) -> Result<ExecutionResult, ProcessError> {
        self.calls.lock().unwrap().push(invocation.clone());
        touch(&invocation.log_path);

        if let Some(out) = invocation.arg_after("-o") {
            touch(Path::new(out));
        } else if let Some(target) = invocation.keyed_arg("TMAT") {
            match (invocation.keyed_arg("FL"), invocation.keyed_arg("LL"), invocation.keyed_arg("IL")) {
                (Some(first), Some(last), Some(step)) => {
                    let (first, last, step): (u64, u64, usize) =
                        (first.parse().unwrap(), last.parse().unwrap(), step.parse().unwrap());
                    for lag in (first..=last).step_by(step) {
                        touch(Path::new(&format!("{}.{}", target, lag)));
                    }
                }
                _ => touch(Path::new(target)),
            }
        }

        Ok(ExecutionResult {
            exit_code: Some(0),
            log_path: invocation.log_path.clone(),
            artifact: invocation.artifact.clone(),
            duration: Duration::ZERO,
        })
    }
}

fn write_config(dir: &TempDir, general: &str, trajectories: &str, charmm: &str) -> PathBuf {
    let path = dir.path().join("mcdiff.toml");
    let doc = format!(
        r#"
[general]
output_dir = "results"
{general}

[general.trajectories]
{trajectories}

[charmm]
executable = "charmm"
script = "tmat.inp"
tmat = "matrices/{{replica}}/tmat.{{lag}}.dat"
scratch_dir = "scratch"
{charmm}

[equilibration]
nmc = 1000
T = 1.0

[production]
nmc = 5000
reduction = true
"#
    );
    fs::write(&path, doc).unwrap();
    path
}

fn load(path: &Path) -> PipelineConfig {
    PipelineConfig::load(path).unwrap()
}

#[tokio::test]
async fn test_single_replica_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "lag_times = [50, 100]\nparallel = false",
        "A = [\"traj_A.dcd\", 0, 1000]",
        "",
    );
    let tools = Arc::new(StubTools::default());
    let pipeline = Pipeline::new(load(&path), tools.clone());

    let report = pipeline.run().await.unwrap();

    assert!(report.is_success());
    for lag in [50, 100] {
        assert!(dir.path().join(format!("matrices/A/tmat.{lag}.dat")).is_file());
        assert!(dir.path().join(format!("results/profiles.A.{lag}.0.dat")).is_file());
        assert!(dir.path().join(format!("results/profiles.A.{lag}.1.dat")).is_file());
    }
    assert_eq!(tools.calls().len(), 6);
    assert!(dir.path().join("results/pipeline_report.json").is_file());
}

#[tokio::test]
async fn test_rerun_does_no_work() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "lag_times = { start = 10, end = 30, step = 10 }\nparallel = true",
        "A = [\"traj_A.dcd\", 0, 1000]\nB = { trajectory = \"traj_B.dcd\", first_frame = 5, last_frame = 500 }",
        "",
    );
    let tools = Arc::new(StubTools::default());

    let first = Pipeline::new(load(&path), tools.clone()).run().await.unwrap();
    let calls_after_first = tools.calls().len();
    let second = Pipeline::new(load(&path), tools.clone()).run().await.unwrap();

    assert_eq!(calls_after_first, 18);
    assert_eq!(tools.calls().len(), calls_after_first);
    assert_eq!(first.production_paths(), second.production_paths());
}

#[tokio::test]
async fn test_production_inherits_equilibration_options() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "lag_times = [50]",
        "A = [\"traj_A.dcd\", 0, 1000]",
        "",
    );
    let tools = Arc::new(StubTools::default());

    Pipeline::new(load(&path), tools.clone()).run().await.unwrap();

    let solver = tools.solver_calls();
    assert_eq!(solver.len(), 2);
    let equilibration = solver[0].args.join(" ");
    let production = solver[1].args.join(" ");
    assert!(equilibration.ends_with("--nmc 1000 -T 1.0"));
    assert!(production.contains("--initf"));
    assert!(production.ends_with("--nmc 5000 -T 1.0 --reduction"));
}

#[tokio::test]
async fn test_nested_batched_fanout() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "lag_times = \"20, 40, 60\"\nparallel = true\nfanout = \"nested\"\nmax_workers = 2",
        "A = [\"traj_A.dcd\", 0, 1000]\nB = [\"traj_B.dcd\", 0, 1000]",
        "strategy = \"batched_lag_range\"",
    );
    let tools = Arc::new(StubTools::default());

    let report = Pipeline::new(load(&path), tools.clone()).run().await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.completed.len(), 6);
    let extractions: Vec<ProcessInvocation> = tools
        .calls()
        .into_iter()
        .filter(|call| call.keyed_arg("FL").is_some())
        .collect();
    assert_eq!(extractions.len(), 2);
    for call in &extractions {
        assert_eq!(call.keyed_arg("IL"), Some("20"));
    }
    assert!(dir.path().join("matrices/B/tmat.60.dat").is_file());
}

#[tokio::test]
async fn test_unresolvable_artifacts_stop_before_any_work() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "lag_times = [50]", "A = [\"traj_A.dcd\", 0, 1000]", "");
    let mut config = load(&path);
    config.transition.template = None;
    let tools = Arc::new(StubTools::default());

    let err = Pipeline::new(config, tools.clone()).run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Config(ConfigError::Missing { key: "tmat", .. })
    ));
    assert!(tools.calls().is_empty());
    assert!(!dir.path().join("results").exists());
}

#[tokio::test]
async fn test_plan_tracks_progress() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "lag_times = [50, 100]", "A = [\"traj_A.dcd\", 0, 1000]", "");
    let pipeline = Pipeline::new(load(&path), Arc::new(StubTools::default())).without_report();

    let before = pipeline.plan().unwrap();
    assert!(before
        .iter()
        .all(|unit| unit.next_stage() == Some(StageKind::TransitionMatrix)));

    pipeline.run().await.unwrap();

    assert!(pipeline.plan().unwrap().iter().all(|unit| unit.is_complete()));
    assert!(!dir.path().join("results/pipeline_report.json").exists());
}
