//! Pipeline configuration.
//!
//! The configuration is a TOML document with `general`, `charmm`, `solver`,
//! `timeouts`, `equilibration` and `production` sections. It is loaded and
//! validated once; the resulting [`PipelineConfig`] is immutable and shared by
//! every worker.
//!
//! Relative paths are resolved against the directory holding the file.

mod template;

pub use template::PathTemplate;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::artifacts::{ArtifactResolver, WorkUnit};
use crate::error::ConfigError;
use crate::options::OptionSet;
use crate::timeout::TimeoutConfig;

/// Default solver executable.
pub const DEFAULT_SOLVER: &str = "mcdiff";

/// Shape of the parallel fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutShape {
    /// One pool over every (replica, lag time) pair.
    #[default]
    Flat,
    /// An outer pool over replicas, each with an inner pool over lag times.
    Nested,
}

impl FanOutShape {
    pub fn as_label(&self) -> &'static str {
        match self {
            FanOutShape::Flat => "flat",
            FanOutShape::Nested => "nested",
        }
    }
}

/// How transition matrices are extracted from a trajectory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionMatrixStrategy {
    /// One invocation per lag time (`LAG:`).
    #[default]
    PerLagTime,
    /// One invocation per lag range (`FL:`/`LL:`/`IL:`) writing one file per lag.
    #[serde(alias = "batched")]
    BatchedLagRange,
}

/// What a non-zero exit from the transition-matrix executable means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCodePolicy {
    /// The stage fails.
    #[default]
    Fail,
    /// Log a warning and judge the stage by its artifacts alone.
    Warn,
}

/// Most lag times a range may expand to.
pub const MAX_LAG_TIMES: u64 = 100_000;

/// Lag times to analyse, either listed or as an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LagTimes {
    List(Vec<u64>),
    Range { start: u64, end: u64, step: u64 },
}

impl LagTimes {
    /// Lag times in evaluation order.
    pub fn values(&self) -> Vec<u64> {
        match self {
            LagTimes::List(values) => values.clone(),
            LagTimes::Range { start, end, step } => {
                let mut values = Vec::new();
                let mut lag = *start;
                while lag <= *end {
                    values.push(lag);
                    match lag.checked_add(*step) {
                        Some(next) => lag = next,
                        None => break,
                    }
                }
                values
            }
        }
    }

    fn validate(&self, section: &'static str, key: &str) -> Result<(), ConfigError> {
        match self {
            LagTimes::List(values) => {
                if values.is_empty() {
                    return Err(ConfigError::invalid(section, key, "no lag times given"));
                }
                let mut seen = std::collections::HashSet::new();
                for lag in values {
                    if *lag == 0 {
                        return Err(ConfigError::invalid(section, key, "lag times must be positive"));
                    }
                    if !seen.insert(*lag) {
                        return Err(ConfigError::invalid(
                            section,
                            key,
                            format!("lag time {} listed twice", lag),
                        ));
                    }
                }
            }
            LagTimes::Range { start, end, step } => {
                if *step == 0 {
                    return Err(ConfigError::invalid(section, key, "step must be positive"));
                }
                if *start == 0 {
                    return Err(ConfigError::invalid(section, key, "lag times must be positive"));
                }
                if end < start {
                    return Err(ConfigError::invalid(
                        section,
                        key,
                        format!("end {} is before start {}", end, start),
                    ));
                }
                let count = (end - start) / step + 1;
                if count > MAX_LAG_TIMES {
                    return Err(ConfigError::invalid(
                        section,
                        key,
                        format!(
                            "range expands to {} lag times, more than {}",
                            count, MAX_LAG_TIMES
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// One simulation replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: String,
    pub trajectory: PathBuf,
    pub first_frame: u64,
    pub last_frame: u64,
    /// Replica-specific lag times overriding the global list.
    pub lag_times: Option<LagTimes>,
    /// Working directory of the transition-matrix executable.
    pub workdir: PathBuf,
}

/// Settings of the transition-matrix extraction stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionConfig {
    pub executable: PathBuf,
    /// Driver script piped to the executable's standard input.
    pub script: PathBuf,
    pub template: Option<PathTemplate>,
    pub strategy: TransitionMatrixStrategy,
    pub exit_policy: ExitCodePolicy,
    /// Root for per-invocation scratch directories.
    pub scratch_dir: PathBuf,
    pub extra_args: Vec<String>,
}

/// Settings of the Monte-Carlo solver stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolverConfig {
    pub executable: PathBuf,
    /// Fixed leading arguments, `["run"]` by default.
    pub args: Vec<String>,
}

/// Immutable configuration of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Directory that relative paths were resolved against.
    pub base_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Replicas in document order.
    pub replicas: Vec<Replica>,
    pub lag_times: LagTimes,
    pub parallel: bool,
    pub fanout: FanOutShape,
    /// Upper bound on each worker pool; `None` sizes pools to their unit count.
    pub max_workers: Option<usize>,
    pub transition: TransitionConfig,
    pub solver: SolverConfig,
    pub timeouts: TimeoutConfig,
    pub equilibration: OptionSet,
    pub production: OptionSet,
}

impl PipelineConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let read_error = |source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        };
        let doc = fs::read_to_string(path).map_err(read_error)?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let base_dir = if parent.is_absolute() {
            parent.to_path_buf()
        } else {
            std::env::current_dir().map_err(read_error)?.join(parent)
        };
        Self::from_toml_str(&doc, &base_dir)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(doc: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(doc)?;
        raw.into_config(base_dir)
    }

    /// Effective lag times of one replica.
    pub fn lag_times_for(&self, replica: &Replica) -> Vec<u64> {
        replica
            .lag_times
            .as_ref()
            .unwrap_or(&self.lag_times)
            .values()
    }

    pub fn replica(&self, id: &str) -> Option<&Replica> {
        self.replicas.iter().find(|replica| replica.id == id)
    }

    /// Every work unit, replica-major, in configuration order.
    pub fn units(&self) -> Vec<WorkUnit> {
        self.replicas
            .iter()
            .flat_map(|replica| {
                self.lag_times_for(replica)
                    .into_iter()
                    .map(move |lag| WorkUnit::new(replica.id.clone(), lag))
            })
            .collect()
    }

    /// Override the parallel flag.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Override the fan-out shape.
    pub fn with_fanout(mut self, fanout: FanOutShape) -> Self {
        self.fanout = fanout;
        self
    }

    /// Bound every worker pool.
    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self, ConfigError> {
        if max_workers == 0 {
            return Err(ConfigError::invalid("general", "max_workers", "must be at least 1"));
        }
        self.max_workers = Some(max_workers);
        Ok(self)
    }

    /// Check that no two units share a transition-matrix path.
    fn check_distinct_transition_paths(&self) -> Result<(), ConfigError> {
        let resolver = ArtifactResolver::new(self);
        let mut owners: HashMap<PathBuf, WorkUnit> = HashMap::new();
        for unit in self.units() {
            let path = resolver.transition_matrix(&unit)?.into_path();
            if let Some(previous) = owners.insert(path.clone(), unit.clone()) {
                return Err(ConfigError::Template {
                    template: self
                        .transition
                        .template
                        .as_ref()
                        .map(|t| t.as_str().to_string())
                        .unwrap_or_default(),
                    reason: format!(
                        "units {} and {} both map to {}",
                        previous,
                        unit,
                        path.display()
                    ),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    general: Option<RawGeneral>,
    charmm: Option<RawCharmm>,
    #[serde(default)]
    solver: RawSolver,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    equilibration: toml::Table,
    #[serde(default)]
    production: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGeneral {
    output_dir: Option<PathBuf>,
    trajectories: Option<toml::Table>,
    lag_times: Option<RawLagTimes>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    fanout: FanOutShape,
    max_workers: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLagTimes {
    List(Vec<u64>),
    Text(String),
    Range { start: u64, end: u64, step: u64 },
}

impl RawLagTimes {
    fn into_lag_times(self, section: &'static str, key: &str) -> Result<LagTimes, ConfigError> {
        let lag_times = match self {
            RawLagTimes::List(values) => LagTimes::List(values),
            RawLagTimes::Text(text) => {
                let values = text
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(|item| {
                        item.parse::<u64>().map_err(|_| {
                            ConfigError::invalid(section, key, format!("{:?} is not a lag time", item))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                LagTimes::List(values)
            }
            RawLagTimes::Range { start, end, step } => LagTimes::Range { start, end, step },
        };
        lag_times.validate(section, key)?;
        Ok(lag_times)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawReplica {
    Tuple(PathBuf, u64, u64),
    Table {
        trajectory: PathBuf,
        first_frame: u64,
        last_frame: u64,
        lag_times: Option<RawLagTimes>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCharmm {
    executable: Option<String>,
    script: Option<PathBuf>,
    tmat: Option<String>,
    #[serde(default)]
    strategy: TransitionMatrixStrategy,
    #[serde(default)]
    on_nonzero_exit: ExitCodePolicy,
    scratch_dir: Option<PathBuf>,
    #[serde(default)]
    extra_args: Vec<String>,
    #[serde(default)]
    exe_dirs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSolver {
    executable: Option<String>,
    args: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeouts {
    transition_matrix_secs: Option<u64>,
    solver_secs: Option<u64>,
}

impl RawConfig {
    fn into_config(self, base_dir: &Path) -> Result<PipelineConfig, ConfigError> {
        let general = self.general.ok_or(ConfigError::Missing {
            section: "general",
            key: "(section)",
        })?;
        let charmm = self.charmm.ok_or(ConfigError::Missing {
            section: "charmm",
            key: "(section)",
        })?;

        let output_dir = general.output_dir.ok_or(ConfigError::Missing {
            section: "general",
            key: "output_dir",
        })?;
        let lag_times = general
            .lag_times
            .ok_or(ConfigError::Missing {
                section: "general",
                key: "lag_times",
            })?
            .into_lag_times("general", "lag_times")?;
        let trajectories = general.trajectories.ok_or(ConfigError::Missing {
            section: "general",
            key: "trajectories",
        })?;
        if trajectories.is_empty() {
            return Err(ConfigError::invalid("general", "trajectories", "no replicas given"));
        }
        if general.max_workers == Some(0) {
            return Err(ConfigError::invalid("general", "max_workers", "must be at least 1"));
        }

        for id in charmm.exe_dirs.keys() {
            if !trajectories.contains_key(id) {
                return Err(ConfigError::invalid(
                    "charmm",
                    format!("exe_dirs.{}", id),
                    "no replica with this id",
                ));
            }
        }

        let mut replicas = Vec::with_capacity(trajectories.len());
        for (id, value) in trajectories {
            validate_replica_id(&id)?;
            let key = format!("trajectories.{}", id);
            let raw: RawReplica = value.try_into().map_err(|e: toml::de::Error| {
                ConfigError::invalid(
                    "general",
                    key.clone(),
                    format!(
                        "expected [trajectory, first_frame, last_frame] or a table ({})",
                        e.message()
                    ),
                )
            })?;
            let (trajectory, first_frame, last_frame, lag_override) = match raw {
                RawReplica::Tuple(trajectory, first, last) => (trajectory, first, last, None),
                RawReplica::Table {
                    trajectory,
                    first_frame,
                    last_frame,
                    lag_times,
                } => (trajectory, first_frame, last_frame, lag_times),
            };
            if first_frame > last_frame {
                return Err(ConfigError::invalid(
                    "general",
                    key,
                    format!("first frame {} is after last frame {}", first_frame, last_frame),
                ));
            }
            let lag_times = lag_override
                .map(|raw| raw.into_lag_times("general", &format!("{}.lag_times", key)))
                .transpose()?;
            let workdir = charmm
                .exe_dirs
                .get(&id)
                .map(|dir| base_dir.join(dir))
                .unwrap_or_else(|| base_dir.to_path_buf());
            replicas.push(Replica {
                trajectory: base_dir.join(trajectory),
                first_frame,
                last_frame,
                lag_times,
                workdir,
                id,
            });
        }

        let executable = charmm.executable.ok_or(ConfigError::Missing {
            section: "charmm",
            key: "executable",
        })?;
        let script = charmm.script.ok_or(ConfigError::Missing {
            section: "charmm",
            key: "script",
        })?;
        let template = charmm.tmat.ok_or(ConfigError::Missing {
            section: "charmm",
            key: "tmat",
        })?;

        let transition = TransitionConfig {
            executable: resolve_program(&executable, base_dir),
            script: base_dir.join(script),
            template: Some(PathTemplate::parse(&template)?),
            strategy: charmm.strategy,
            exit_policy: charmm.on_nonzero_exit,
            scratch_dir: charmm
                .scratch_dir
                .map(|dir| base_dir.join(dir))
                .unwrap_or_else(std::env::temp_dir),
            extra_args: charmm.extra_args,
        };

        let solver = SolverConfig {
            executable: resolve_program(
                self.solver.executable.as_deref().unwrap_or(DEFAULT_SOLVER),
                base_dir,
            ),
            args: self.solver.args.unwrap_or_else(|| vec!["run".to_string()]),
        };

        let mut timeouts = TimeoutConfig::new();
        if let Some(secs) = self.timeouts.transition_matrix_secs {
            timeouts = timeouts.with_transition_matrix_timeout(positive_secs(
                "transition_matrix_secs",
                secs,
            )?);
        }
        if let Some(secs) = self.timeouts.solver_secs {
            timeouts = timeouts.with_solver_timeout(positive_secs("solver_secs", secs)?);
        }

        let config = PipelineConfig {
            base_dir: base_dir.to_path_buf(),
            output_dir: base_dir.join(output_dir),
            replicas,
            lag_times,
            parallel: general.parallel,
            fanout: general.fanout,
            max_workers: general.max_workers,
            transition,
            solver,
            timeouts,
            equilibration: OptionSet::from_table("equilibration", &self.equilibration)?,
            production: OptionSet::from_table("production", &self.production)?,
        };
        config.check_distinct_transition_paths()?;
        Ok(config)
    }
}

fn validate_replica_id(id: &str) -> Result<(), ConfigError> {
    let key = format!("trajectories.{}", id);
    if id.trim().is_empty() {
        return Err(ConfigError::invalid("general", key, "replica id is empty"));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(ConfigError::invalid(
            "general",
            key,
            "replica id must not contain path separators",
        ));
    }
    Ok(())
}

/// Bare program names are looked up on `PATH`; anything with a separator is a path.
fn resolve_program(program: &str, base_dir: &Path) -> PathBuf {
    if program.contains('/') || program.contains('\\') {
        base_dir.join(program)
    } else {
        PathBuf::from(program)
    }
}

fn positive_secs(key: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::invalid("timeouts", key, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}
