//! The sweep state machine.
//!
//! For each outer point: inject the truncation variant, materialize the point directory, then
//! for each inner set render the configuration, skip if the result already exists, build, and
//! run under supervision. Per-point failures go to the ledger and never abort the sweep. A
//! terminal stop-code ends the outer dimension once the current point's inner sets are done.

use crate::build::{BuildCoordinator, BuildRequest, Builder};
use crate::console::{Console, Tone};
use crate::error::PointFailure;
use crate::features::{enumerate_combinations, enumerate_fixed, FeatureSet};
use crate::inject::{SourceInjector, Truncation, TruncationTemplate, DEFAULT_MATCHER};
use crate::ledger::{ErrorLedger, LedgerEntry};
use crate::plan::{allocation_values, InnerMode, OuterDimension, OverloadPolicy, SweepPlan};
use crate::sampler::SamplerConfig;
use crate::supervise::{RunInvocation, RunOutcome, RunSupervisor, Runner, StopCode, SupervisorConfig};
use crate::template::{apply_mutation, core_count, render_entrypoint, render_placeholder, ConfigMutation};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, promote_file};
use tracing::{info, warn};

pub const MANIFEST_FILE: &str = "sweep_manifest.json";
pub const LOCK_FILE: &str = "sweep.lock";
pub const STAGING_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DimensionValue {
    Allocation(u32),
    Depth(Truncation),
}

/// One outer iteration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    pub value: DimensionValue,
    pub label: String,
    pub dir: PathBuf,
}

/// One inner iteration: the key names its artifacts, the feature set (if any) drives the build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InnerPoint {
    pub key: String,
    pub features: Option<FeatureSet>,
}

impl InnerPoint {
    fn ledger_key(&self) -> Option<&str> {
        self.features.as_ref().map(|_| self.key.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    Running,
    Completed,
    Skipped,
    Failed,
}

impl PointStatus {
    fn as_str(&self) -> &'static str {
        match self {
            PointStatus::Running => "running",
            PointStatus::Completed => "completed",
            PointStatus::Skipped => "skipped",
            PointStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointReport {
    pub label: String,
    pub key: String,
    pub status: PointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_code: Option<StopCode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SweepHalt {
    /// A point found an acceptable operating point; smaller points were not visited.
    DimensionStop { label: String, stop_code: StopCode },
    /// A point overloaded under the halt-sweep policy.
    Overload { label: String, key: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub output_dir: PathBuf,
    pub plan_digest: String,
    pub points: Vec<PointReport>,
    pub halted: Option<SweepHalt>,
    pub failures: Vec<LedgerEntry>,
    pub ledger_path: PathBuf,
}

impl SweepReport {
    pub fn count(&self, status: PointStatus) -> usize {
        self.points.iter().filter(|p| p.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepDescription {
    pub plan_digest: String,
    pub output_dir: PathBuf,
    pub outer_kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_step: Option<u32>,
    pub points: Vec<SweepPoint>,
    pub inner: Vec<InnerPoint>,
    pub total_runs: usize,
}

pub fn point_label(value: DimensionValue) -> String {
    match value {
        DimensionValue::Allocation(n) => format!("alloc_{}", n),
        DimensionValue::Depth(t) => format!("pkts_{}", t),
    }
}

/// Outer points of the plan, in visiting order. Allocation sweeps step by the number of cores
/// assigned in the active config template.
pub fn plan_points(plan: &SweepPlan) -> Result<(Vec<SweepPoint>, Option<u32>)> {
    let (values, step) = match &plan.outer {
        OuterDimension::Allocation { start, .. } => {
            let template = plan.config.active_template()?;
            let text = fs::read_to_string(template)
                .with_context(|| format!("failed to read config template {}", template.display()))?;
            let cores = core_count(&text, &plan.config.keys)?;
            let step = u32::try_from(cores).map_err(|_| anyhow!("core list too long: {}", cores))?;
            let values = allocation_values(*start, step)?
                .into_iter()
                .map(DimensionValue::Allocation)
                .collect::<Vec<_>>();
            (values, Some(step))
        }
        OuterDimension::Depth { depths } => (
            depths.iter().copied().map(DimensionValue::Depth).collect(),
            None,
        ),
    };
    let points = values
        .into_iter()
        .map(|value| {
            let label = point_label(value);
            SweepPoint {
                value,
                dir: plan.output_dir.join(&label),
                label,
            }
        })
        .collect();
    Ok((points, step))
}

/// Inner sets of the plan. Without an inner dimension each point has one run keyed by its label.
pub fn inner_points(plan: &SweepPlan, point_label: &str) -> Result<Vec<InnerPoint>> {
    let sets = match plan.inner.mode {
        InnerMode::None => {
            return Ok(vec![InnerPoint {
                key: point_label.to_string(),
                features: None,
            }])
        }
        InnerMode::Combinations => enumerate_combinations(&plan.inner.identifiers)?
            .into_iter()
            .map(|set| InnerPoint {
                key: set.hash().to_string(),
                features: Some(set),
            })
            .collect(),
        InnerMode::Fixed => enumerate_fixed(&plan.inner.identifiers)
            .into_iter()
            .map(|set| InnerPoint {
                key: set.dashed(),
                features: Some(set),
            })
            .collect(),
    };
    Ok(sets)
}

pub fn describe_plan(plan: &SweepPlan) -> Result<SweepDescription> {
    let (points, allocation_step) = plan_points(plan)?;
    let inner = match points.first() {
        Some(first) => inner_points(plan, &first.label)?,
        None => Vec::new(),
    };
    let outer_kind = match plan.outer {
        OuterDimension::Allocation { .. } => "allocation",
        OuterDimension::Depth { .. } => "depth",
    };
    Ok(SweepDescription {
        plan_digest: plan.digest.clone(),
        output_dir: plan.output_dir.clone(),
        outer_kind,
        allocation_step,
        total_runs: points.len() * inner.len().max(1),
        points,
        inner,
    })
}

pub fn staging_path(result: &Path) -> PathBuf {
    let mut name = result
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(STAGING_SUFFIX);
    result.with_file_name(name)
}

/// Exclusive claim on an output directory for the lifetime of one sweep.
#[derive(Debug)]
pub struct SweepLock {
    path: PathBuf,
}

impl SweepLock {
    /// Claims `output_dir`. A lock left by a sweep whose process no longer exists (an
    /// interrupted controller never runs `Drop`) is reclaimed.
    pub fn acquire(output_dir: &Path) -> Result<Self> {
        ensure_dir(output_dir)?;
        let path = output_dir.join(LOCK_FILE);
        match Self::create(output_dir, &path) {
            Err(e) if Self::holder_is_gone(&path) => {
                warn!(lock = %path.display(), error = %e, "reclaiming lock of a dead sweep");
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale lock {}", path.display()))?;
                Self::create(output_dir, &path)
            }
            other => other,
        }
    }

    fn create(output_dir: &Path, path: &Path) -> Result<Self> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let payload = json!({
                    "pid": std::process::id(),
                    "acquired_at": Utc::now().to_rfc3339(),
                });
                let _ = writeln!(file, "{}", payload);
                let _ = file.sync_all();
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
                "sweep_in_progress: {} is locked by another sweep (remove {} if it is stale)",
                output_dir.display(),
                path.display()
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn holder_is_gone(path: &Path) -> bool {
        let holder = fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .and_then(|v| v.get("pid").and_then(serde_json::Value::as_u64))
            .and_then(|pid| libc::pid_t::try_from(pid).ok());
        match holder {
            Some(pid) if pid > 0 => !process_alive(pid),
            _ => false,
        }
    }
}

fn process_alive(pid: libc::pid_t) -> bool {
    // Signal 0 only checks existence; EPERM still means the pid is taken.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

impl Drop for SweepLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn write_point_state(
    dir: &Path,
    label: &str,
    key: &str,
    status: PointStatus,
    detail: Option<&str>,
    stop_code: Option<StopCode>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "point_state_v1",
        "point": label,
        "key": key,
        "status": status.as_str(),
        "detail": detail,
        "stop_code": stop_code,
        "updated_at": Utc::now().to_rfc3339(),
    });
    atomic_write_json_pretty(&point_state_path(dir, key), &payload)
}

fn point_state_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("point_state_{}.json", key))
}

/// Stop-code an earlier sweep recorded for this point / key, if its state file has one.
fn recorded_stop_code(dir: &Path, key: &str) -> Option<StopCode> {
    let bytes = fs::read(point_state_path(dir, key)).ok()?;
    let state: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    serde_json::from_value(state.get("stop_code")?.clone()).ok()
}

/// Marks a point/key `running` on creation and `failed` if dropped before `complete`.
struct PointStateGuard {
    dir: PathBuf,
    label: String,
    key: String,
    done: bool,
}

impl PointStateGuard {
    fn begin(dir: &Path, label: &str, key: &str) -> Result<Self> {
        write_point_state(dir, label, key, PointStatus::Running, None, None)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            label: label.to_string(),
            key: key.to_string(),
            done: false,
        })
    }

    fn complete(&mut self, status: PointStatus, detail: Option<&str>, stop_code: Option<StopCode>) {
        if let Err(e) =
            write_point_state(&self.dir, &self.label, &self.key, status, detail, stop_code)
        {
            warn!(point = %self.label, key = %self.key, error = %e, "failed to write point state");
        }
        self.done = true;
    }
}

impl Drop for PointStateGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_point_state(
                &self.dir,
                &self.label,
                &self.key,
                PointStatus::Failed,
                Some("aborted"),
                None,
            );
        }
    }
}

/// Locations of one inner run's artifacts.
struct PointPaths {
    config: PathBuf,
    result: PathBuf,
    staging: PathBuf,
    record: PathBuf,
    samples: PathBuf,
}

enum Execution {
    Skipped,
    Ran(RunOutcome),
}

pub struct SweepController {
    plan: SweepPlan,
    builder: Box<dyn Builder>,
    runner: Box<dyn Runner>,
    console: Arc<dyn Console>,
    injector: Option<SourceInjector>,
}

impl SweepController {
    pub fn new(
        plan: SweepPlan,
        builder: Box<dyn Builder>,
        runner: Box<dyn Runner>,
        console: Arc<dyn Console>,
    ) -> Result<Self> {
        let injector = match &plan.source {
            Some(source) => {
                let defaults = TruncationTemplate::default();
                let template = TruncationTemplate {
                    unbounded: source.unbounded_template.clone().unwrap_or(defaults.unbounded),
                    bounded: source.bounded_template.clone().unwrap_or(defaults.bounded),
                };
                let matcher = source.matcher.as_deref().unwrap_or(DEFAULT_MATCHER);
                Some(SourceInjector::new(matcher, template, &source.extension)?)
            }
            None => None,
        };
        Ok(Self {
            plan,
            builder,
            runner,
            console,
            injector,
        })
    }

    /// Controller wired to the real build tool and process supervisor.
    pub fn from_plan(plan: SweepPlan, console: Arc<dyn Console>) -> Result<Self> {
        let engine = &plan.engine;
        let mut builder = BuildCoordinator::new(&engine.root, &engine.binary, console.clone())
            .with_base_features(engine.base_features.clone());
        if let Some(program) = &engine.build_program {
            builder = builder.with_program(program, engine.build_args.clone());
        }
        if let Some(target_dir) = &engine.target_dir {
            builder = builder.with_target_dir(target_dir.clone());
        }
        if let Some(marker) = &engine.error_marker {
            builder = builder.with_error_marker(marker);
        }

        let section = &plan.supervisor;
        let mut config = SupervisorConfig::new(section.epsilon);
        config.interrupt_grace = Duration::from_secs(section.interrupt_grace_secs);
        config.elevate = engine.elevate.clone();
        config.log_level = engine.log_level.clone();
        if let Some(lib) = &engine.library_path {
            config.library_path = Some(lib.clone());
        }
        config.echo = section.echo;
        if section.sampler.enabled {
            let sampler = &section.sampler;
            config.sampler = Some(match &sampler.args {
                Some(args) => SamplerConfig {
                    program: sampler.program.clone(),
                    args: args.clone(),
                },
                None => SamplerConfig {
                    program: sampler.program.clone(),
                    ..SamplerConfig::top(sampler.interval_secs)
                },
            });
        }
        let runner = RunSupervisor::new(config, console.clone());
        Self::new(plan, Box::new(builder), Box::new(runner), console)
    }

    pub fn run(&self) -> Result<SweepReport> {
        let output_dir = self.plan.output_dir.clone();
        let _lock = SweepLock::acquire(&output_dir)?;
        let (points, _) = plan_points(&self.plan)?;
        let template_path = self.plan.config.active_template()?;
        let config_text = fs::read_to_string(template_path).with_context(|| {
            format!("failed to read config template {}", template_path.display())
        })?;
        let started_at = Utc::now().to_rfc3339();
        self.write_manifest(&points, &started_at, "running", &[], None)?;
        info!(
            output_dir = %output_dir.display(),
            points = points.len(),
            digest = %self.plan.digest,
            "sweep started"
        );

        let mut ledger = ErrorLedger::new();
        let mut reports: Vec<PointReport> = Vec::new();
        let mut halted: Option<SweepHalt> = None;

        'outer: for point in &points {
            self.console
                .emit(Tone::Heading, &format!("Sweep point {}", point.label));
            let inner = inner_points(&self.plan, &point.label)?;
            if let Err(failure) = self.prepare_point(point) {
                self.record(&mut ledger, point, None, &failure);
                for set in &inner {
                    reports.push(PointReport {
                        label: point.label.clone(),
                        key: set.key.clone(),
                        status: PointStatus::Failed,
                        stop_code: None,
                    });
                }
                continue;
            }

            let mut dimension_stop: Option<StopCode> = None;
            for set in &inner {
                let mut report = PointReport {
                    label: point.label.clone(),
                    key: set.key.clone(),
                    status: PointStatus::Failed,
                    stop_code: None,
                };
                // Read before the guard overwrites the state with `running`.
                let recorded = recorded_stop_code(&point.dir, &set.key);
                let mut guard = match PointStateGuard::begin(&point.dir, &point.label, &set.key) {
                    Ok(guard) => guard,
                    Err(e) => {
                        let failure = PointFailure::PointSetup(e.to_string());
                        self.record(&mut ledger, point, set.ledger_key(), &failure);
                        reports.push(report);
                        continue;
                    }
                };
                let paths = self.paths_for(point, set);
                let result = self
                    .execute(point, set, &paths, &config_text)
                    .and_then(|execution| match execution {
                        Execution::Skipped => {
                            // A finished point replays its halt so a resumed sweep stops where
                            // the interrupted one did.
                            report.stop_code = recorded;
                            if let Some(code) = recorded.filter(|c| c.halts_dimension()) {
                                dimension_stop = Some(code);
                            }
                            Ok(None)
                        }
                        Execution::Ran(outcome) => {
                            report.stop_code = Some(outcome.stop_code);
                            if outcome.stop_code.halts_dimension() {
                                dimension_stop = Some(outcome.stop_code);
                            }
                            self.conclude(&paths, &outcome).map(|_| Some(outcome))
                        }
                    });
                match result {
                    Ok(None) => {
                        report.status = PointStatus::Skipped;
                        guard.complete(PointStatus::Skipped, Some("result exists"), recorded);
                    }
                    Ok(Some(outcome)) => {
                        report.status = PointStatus::Completed;
                        guard.complete(PointStatus::Completed, None, Some(outcome.stop_code));
                    }
                    Err(failure) => {
                        self.record(&mut ledger, point, set.ledger_key(), &failure);
                        guard.complete(
                            PointStatus::Failed,
                            Some(failure.stage().as_str()),
                            report.stop_code,
                        );
                        let overload = matches!(failure, PointFailure::RuntimeOverload(_));
                        reports.push(report);
                        if overload && self.plan.supervisor.on_overload == OverloadPolicy::HaltSweep {
                            halted = Some(SweepHalt::Overload {
                                label: point.label.clone(),
                                key: set.key.clone(),
                            });
                            break 'outer;
                        }
                        continue;
                    }
                }
                reports.push(report);
            }
            if let Some(stop_code) = dimension_stop {
                info!(point = %point.label, ?stop_code, "terminal stop-code; sweep dimension ends");
                halted = Some(SweepHalt::DimensionStop {
                    label: point.label.clone(),
                    stop_code,
                });
                break;
            }
        }

        let ledger_path = ledger.write(&output_dir)?;
        self.report_ledger(&ledger);
        let status = if halted.is_some() { "halted" } else { "completed" };
        self.write_manifest(&points, &started_at, status, &reports, halted.as_ref())?;
        info!(
            failures = ledger.len(),
            runs = reports.len(),
            status,
            "sweep finished"
        );
        Ok(SweepReport {
            output_dir,
            plan_digest: self.plan.digest.clone(),
            points: reports,
            halted,
            failures: ledger.entries().to_vec(),
            ledger_path,
        })
    }

    fn record(
        &self,
        ledger: &mut ErrorLedger,
        point: &SweepPoint,
        key: Option<&str>,
        failure: &PointFailure,
    ) {
        warn!(point = %point.label, key = ?key, stage = %failure.stage(), detail = %failure.detail(), "point failed");
        self.console.emit(Tone::Failure, &format!("> {}", failure));
        ledger.record(&point.label, key, failure.stage(), failure.detail());
    }

    fn truncation_for(&self, point: &SweepPoint) -> Truncation {
        match (point.value, &self.plan.outer) {
            (DimensionValue::Depth(t), _) => t,
            (_, OuterDimension::Allocation { truncation, .. }) => {
                truncation.unwrap_or(Truncation::Unbounded)
            }
            _ => Truncation::Unbounded,
        }
    }

    /// Steps shared by every inner set of a point: source injection and the point directory.
    fn prepare_point(&self, point: &SweepPoint) -> std::result::Result<(), PointFailure> {
        if let (Some(injector), Some(source)) = (&self.injector, &self.plan.source) {
            let truncation = self.truncation_for(point);
            let changed = injector
                .apply(&source.tree, truncation)
                .map_err(|e| PointFailure::SourceInjection(e.to_string()))?;
            self.console.emit(
                Tone::Progress,
                &format!(
                    "> Truncation {}: {} file(s) rewritten",
                    truncation,
                    changed.len()
                ),
            );
        }
        ensure_dir(&point.dir).map_err(|e| {
            PointFailure::PointSetup(format!("cannot create {}: {}", point.dir.display(), e))
        })
    }

    fn paths_for(&self, point: &SweepPoint, set: &InnerPoint) -> PointPaths {
        let names = &self.plan.artifacts;
        let result = point.dir.join(names.result_for(&set.key));
        PointPaths {
            config: point.dir.join(format!("config_{}.toml", set.key)),
            staging: staging_path(&result),
            result,
            record: point.dir.join(names.record_for(&set.key)),
            samples: point.dir.join(names.samples_for(&set.key)),
        }
    }

    fn render_config(
        &self,
        point: &SweepPoint,
        set: &InnerPoint,
        paths: &PointPaths,
        template: &str,
    ) -> std::result::Result<(), PointFailure> {
        let config = &self.plan.config;
        let replacement = config
            .replacement
            .replace("{result}", &paths.staging.to_string_lossy());
        let rendered = render_placeholder(template, &config.placeholder, &replacement)?;
        let mutation = ConfigMutation {
            duration: config.duration,
            allocation: match point.value {
                DimensionValue::Allocation(n) => Some(n),
                DimensionValue::Depth(_) => None,
            },
            disable_monitor_log: true,
        };
        let rendered = apply_mutation(&rendered, &config.keys, &mutation)?;
        atomic_write_bytes(&paths.config, rendered.as_bytes())
            .map_err(|e| PointFailure::PointSetup(format!("cannot write config: {}", e)))?;
        if let Some(entry) = &self.plan.entrypoint {
            render_entrypoint(
                &entry.template,
                &entry.target,
                &entry.placeholder,
                &entry.replacement.replace("{key}", &set.key),
            )?;
        }
        Ok(())
    }

    fn execute(
        &self,
        point: &SweepPoint,
        set: &InnerPoint,
        paths: &PointPaths,
        template: &str,
    ) -> std::result::Result<Execution, PointFailure> {
        match &set.features {
            Some(features) => self.console.emit(
                Tone::Subheading,
                &format!("{} [{}]", set.key, features.comma_joined()),
            ),
            None => self.console.emit(Tone::Subheading, &set.key),
        }
        self.render_config(point, set, paths, template)?;

        if paths.result.exists() {
            info!(point = %point.label, key = %set.key, "result exists; skipping");
            self.console.emit(
                Tone::Skipped,
                &format!("> Result {} exists, skipping...", paths.result.display()),
            );
            return Ok(Execution::Skipped);
        }

        let release = self.plan.engine.release;
        let request = BuildRequest {
            features: match &set.features {
                Some(features) if self.plan.inner.as_build_features => {
                    features.identifiers().to_vec()
                }
                _ => Vec::new(),
            },
            release,
        };
        self.console.emit(Tone::Progress, "> Building...");
        match self.builder.build(&request) {
            Ok(true) => {}
            Ok(false) => {
                return Err(PointFailure::BuildFailure(
                    "build tool reported errors".to_string(),
                ))
            }
            Err(e) => return Err(PointFailure::BuildFailure(e.to_string())),
        }

        discard(&paths.staging);
        let invocation = RunInvocation {
            executable: self.builder.executable(release),
            config_path: paths.config.clone(),
            record_path: paths.record.clone(),
            sample_path: self
                .plan
                .supervisor
                .sampler
                .enabled
                .then(|| paths.samples.clone()),
        };
        let outcome = self
            .runner
            .run(&invocation)
            .map_err(|e| PointFailure::RuntimeFailure(e.to_string()))?;
        Ok(Execution::Ran(outcome))
    }

    /// Promotes the staged result of a clean run; anything else leaves no result behind.
    fn conclude(
        &self,
        paths: &PointPaths,
        outcome: &RunOutcome,
    ) -> std::result::Result<(), PointFailure> {
        if outcome.overloaded() {
            discard(&paths.staging);
            return Err(PointFailure::RuntimeOverload(format!(
                "software drops exceeded epsilon {}",
                self.plan.supervisor.epsilon
            )));
        }
        if !outcome.exited_cleanly() {
            discard(&paths.staging);
            let status = outcome
                .exit_status
                .map(|c| format!("exit status {}", c))
                .unwrap_or_else(|| "terminated by signal".to_string());
            return Err(PointFailure::RuntimeFailure(status));
        }
        if !paths.staging.exists() {
            return Err(PointFailure::RuntimeFailure(format!(
                "target produced no result at {}",
                paths.staging.display()
            )));
        }
        promote_file(&paths.staging, &paths.result)
            .map_err(|e| PointFailure::RuntimeFailure(format!("cannot promote result: {}", e)))
    }

    fn report_ledger(&self, ledger: &ErrorLedger) {
        if ledger.is_empty() {
            self.console.emit(Tone::Heading, "No failures recorded");
            return;
        }
        self.console
            .emit(Tone::Heading, &format!("{} failure(s) recorded:", ledger.len()));
        for entry in ledger.entries() {
            self.console.emit(Tone::Failure, &format!("  {}", entry));
        }
    }

    fn write_manifest(
        &self,
        points: &[SweepPoint],
        started_at: &str,
        status: &str,
        reports: &[PointReport],
        halted: Option<&SweepHalt>,
    ) -> Result<()> {
        let finished_at = (status != "running").then(|| Utc::now().to_rfc3339());
        let payload = json!({
            "schema_version": "sweep_manifest_v1",
            "plan_digest": self.plan.digest,
            "started_at": started_at,
            "finished_at": finished_at,
            "status": status,
            "points": points.iter().map(|p| &p.label).collect::<Vec<_>>(),
            "runs": reports,
            "halted": halted,
        });
        atomic_write_json_pretty(&self.plan.output_dir.join(MANIFEST_FILE), &payload)
    }
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove stale staging file");
        }
    }
}
