//! Runs of the mcdiff-chm binary against shell-script stand-ins for the
//! external tools.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Writes the file named by its `TMAT:` argument.
const TMAT_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    TMAT:*) target="${arg#TMAT:}" ;;
  esac
done
echo "charmm $*"
echo tmat >> "$(dirname "$0")/../calls.log"
printf 'matrix\n' > "$target"
"#;

/// Writes the file following `-o`.
const SOLVER_STUB: &str = r#"#!/bin/sh
echo "mcdiff $*"
echo solver >> "$(dirname "$0")/../calls.log"
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; fi
  shift
done
printf 'profile\n' > "$out"
"#;

const FAILING_SOLVER_STUB: &str = r#"#!/bin/sh
echo "no convergence" >&2
exit 3
"#;

fn install(dir: &Path, name: &str, body: &str) {
    let path = dir.join("bin").join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn workspace(solver: &str, extra_general: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    install(dir.path(), "charmm", TMAT_STUB);
    install(dir.path(), "mcdiff", solver);
    fs::write(dir.path().join("tmat.inp"), "* transition matrix driver\n").unwrap();

    let config = dir.path().join("mcdiff.toml");
    fs::write(
        &config,
        format!(
            r#"
[general]
output_dir = "out"
lag_times = [50, 100]
{extra_general}

[general.trajectories]
A = ["traj_A.dcd", 0, 1000]

[charmm]
executable = "bin/charmm"
script = "tmat.inp"
tmat = "tmat/tmat.{{}}.{{}}.dat"
scratch_dir = "scratch"

[solver]
executable = "bin/mcdiff"

[equilibration]
nmc = 100

[production]
nmc = 200
"#
        ),
    )
    .unwrap();
    (dir, config)
}

fn call_count(dir: &TempDir) -> usize {
    fs::read_to_string(dir.path().join("calls.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

/// Get a Command instance for the mcdiff-chm binary
#[allow(deprecated)]
fn mcdiff_cmd() -> Command {
    Command::cargo_bin("mcdiff-chm").expect("Failed to find mcdiff-chm binary")
}

#[test]
fn test_run_produces_every_profile() {
    let (dir, config) = workspace(SOLVER_STUB, "parallel = true");

    mcdiff_cmd()
        .arg("run")
        .arg(&config)
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .stdout(predicate::str::contains("2 of 2 units completed, 0 failed"));

    for lag in [50, 100] {
        assert!(dir.path().join(format!("tmat/tmat.A.{lag}.dat")).is_file());
        assert!(dir.path().join(format!("out/profiles.A.{lag}.1.dat")).is_file());
        let log = fs::read_to_string(dir.path().join(format!("out/chm_tmat.A.{lag}.out"))).unwrap();
        assert!(log.contains(&format!("LAG:{lag}")));
    }
    assert_eq!(call_count(&dir), 6);
    assert!(dir.path().join("out/pipeline_report.json").is_file());
    assert!(fs::read_dir(dir.path().join("scratch")).unwrap().next().is_none());
}

#[test]
fn test_second_run_skips_finished_units() {
    let (dir, config) = workspace(SOLVER_STUB, "");

    mcdiff_cmd().arg("run").arg(&config).assert().success();
    mcdiff_cmd()
        .args(["-q", "run", "--serial", "--no-report"])
        .arg(&config)
        .assert()
        .success();

    assert_eq!(call_count(&dir), 6);
}

#[test]
fn test_solver_failure_exits_nonzero_and_names_the_log() {
    let (dir, config) = workspace(FAILING_SOLVER_STUB, "");

    mcdiff_cmd()
        .arg("run")
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("0 of 2 units completed, 2 failed"))
        .stdout(predicate::str::contains("equilibration"))
        .stdout(predicate::str::contains("profiles.A.50.0.log"));

    let log = fs::read_to_string(dir.path().join("out/profiles.A.50.0.log")).unwrap();
    assert!(log.contains("no convergence"));
    assert!(!dir.path().join("out/profiles.A.50.1.log").exists());
}

#[test]
fn test_config_error_exits_with_two() {
    let (dir, config) = workspace(SOLVER_STUB, "");
    let doc = fs::read_to_string(&config).unwrap().replace("script = \"tmat.inp\"\n", "");
    fs::write(&config, doc).unwrap();

    mcdiff_cmd()
        .arg("run")
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing configuration key [charmm] script"));

    assert_eq!(call_count(&dir), 0);
}

#[test]
fn test_zero_max_workers_is_rejected() {
    let (_dir, config) = workspace(SOLVER_STUB, "");

    mcdiff_cmd()
        .args(["run", "--parallel", "--max-workers", "0"])
        .arg(&config)
        .assert()
        .code(2);
}

#[test]
fn test_plan_lists_pending_units() {
    let (dir, config) = workspace(SOLVER_STUB, "");

    mcdiff_cmd()
        .arg("plan")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("A@50"))
        .stdout(predicate::str::contains("A@100"))
        .stdout(predicate::str::contains("2 of 2 units pending"));

    assert_eq!(call_count(&dir), 0);
}

#[test]
fn test_run_help_shows_fanout_options() {
    mcdiff_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--fanout"))
        .stdout(predicate::str::contains("--max-workers"))
        .stdout(predicate::str::contains("--serial"));
}
