use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sweep_runner::console::RecordingConsole;
use sweep_runner::ledger::FailureStage;
use sweep_runner::plan::PlanOverrides;
use sweep_runner::sweep::{SweepHalt, MANIFEST_FILE};
use sweep_runner::{
    BuildRequest, Builder, FeatureSet, PointStatus, RunInvocation, RunOutcome, Runner, StopCode,
    SweepController, SweepPlan, Tone,
};

const ONLINE_TEMPLATE: &str = r#"[online]
duration = 30

[online.monitor]
log = { directory = "./log", interval = 1000 }

[[online.ports]]
cores = [1, 2, 3, 4]

[online.ports.sink]
nb_buckets = 64

[conn]
outfile = "./compute_features.csv"
"#;

const OFFLINE_TEMPLATE: &str = r#"[offline]
pcap = "traffic.pcap"

[conn]
outfile = "./compute_features.csv"
"#;

const TRACKER: &str = r#"impl Trackable for Features {
    fn early_terminate(&self) -> bool {
        false
    }
}
"#;

fn scratch(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "sweep_flow_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&dir).expect("scratch");
    dir
}

#[derive(Clone, Default)]
struct StubBuilder {
    requests: Arc<Mutex<Vec<BuildRequest>>>,
    fail_with: Option<String>,
}

impl StubBuilder {
    fn failing_on(feature: &str) -> Self {
        Self {
            fail_with: Some(feature.to_string()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().expect("requests").clone()
    }
}

impl Builder for StubBuilder {
    fn build(&self, request: &BuildRequest) -> Result<bool> {
        self.requests.lock().expect("requests").push(request.clone());
        Ok(match &self.fail_with {
            Some(feature) => !request.features.contains(feature),
            None => true,
        })
    }

    fn executable(&self, release: bool) -> PathBuf {
        let profile = if release { "release" } else { "debug" };
        PathBuf::from("/stub").join(profile).join("extract_features")
    }
}

/// Plays the target: writes the staged result named in the rendered config and returns the
/// scripted outcome for the point, clean `Continue` otherwise.
#[derive(Clone, Default)]
struct ScriptedRunner {
    outcomes: HashMap<String, RunOutcome>,
    visits: Arc<Mutex<Vec<String>>>,
}

impl ScriptedRunner {
    fn with(mut self, label: &str, outcome: RunOutcome) -> Self {
        self.outcomes.insert(label.to_string(), outcome);
        self
    }

    fn visits(&self) -> Vec<String> {
        self.visits.lock().expect("visits").clone()
    }
}

impl Runner for ScriptedRunner {
    fn run(&self, invocation: &RunInvocation) -> Result<RunOutcome> {
        let label = invocation
            .config_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.visits.lock().expect("visits").push(label.clone());
        let config: toml::Value = toml::from_str(&fs::read_to_string(&invocation.config_path)?)?;
        let staging = config["conn"]["outfile"]
            .as_str()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow::anyhow!("config has no outfile"))?;
        fs::write(&staging, "conn,dur\n1,0.5\n")?;
        Ok(self.outcomes.get(&label).cloned().unwrap_or(clean(StopCode::Continue)))
    }
}

fn clean(stop_code: StopCode) -> RunOutcome {
    RunOutcome {
        stop_code,
        exit_status: Some(0),
        terminated_early: false,
    }
}

fn overloaded() -> RunOutcome {
    RunOutcome {
        stop_code: StopCode::Continue,
        exit_status: None,
        terminated_early: true,
    }
}

fn allocation_plan(dir: &Path, extra: &str) -> SweepPlan {
    fs::write(dir.join("online.toml"), ONLINE_TEMPLATE).expect("template");
    let raw = format!(
        "engine:\n  root: engine\n  binary: extract_features\nconfig:\n  template: online.toml\n  duration: 5\nouter:\n  kind: allocation\n  start: 16\n{}output_dir: out\n",
        extra
    );
    SweepPlan::from_yaml_str(&raw, dir, &PlanOverrides::default()).expect("plan")
}

fn depth_plan(dir: &Path, template: &str, identifiers: &str) -> SweepPlan {
    fs::create_dir_all(dir.join("engine/src")).expect("tree");
    fs::write(dir.join("engine/src/features.rs"), TRACKER).expect("tracker");
    fs::write(dir.join("offline.toml"), template).expect("template");
    let raw = format!(
        "engine:\n  root: engine\n  binary: extract_features\nsource:\n  tree: engine/src\nconfig:\n  template: offline.toml\nouter:\n  kind: depth\n  depths: [2, all]\ninner:\n  mode: combinations\n  identifiers: {}\noutput_dir: out\n",
        identifiers
    );
    SweepPlan::from_yaml_str(&raw, dir, &PlanOverrides::default()).expect("plan")
}

fn controller(
    plan: SweepPlan,
    builder: &StubBuilder,
    runner: &ScriptedRunner,
    console: Arc<RecordingConsole>,
) -> SweepController {
    SweepController::new(plan, Box::new(builder.clone()), Box::new(runner.clone()), console)
        .expect("controller")
}

#[test]
fn allocation_sweep_visits_every_step_and_promotes_results() {
    let dir = scratch("alloc");
    let builder = StubBuilder::default();
    let runner = ScriptedRunner::default();
    let console = Arc::new(RecordingConsole::new());
    let report = controller(allocation_plan(&dir, ""), &builder, &runner, console.clone())
        .run()
        .expect("sweep");

    assert_eq!(runner.visits(), vec!["alloc_16", "alloc_12", "alloc_8", "alloc_4"]);
    assert_eq!(report.count(PointStatus::Completed), 4);
    assert!(report.halted.is_none());
    assert!(report.failures.is_empty());

    let point = dir.join("out").join("alloc_8");
    assert!(point.join("compute_features_alloc_8.csv").exists());
    assert!(!point.join("compute_features_alloc_8.csv.partial").exists());
    let config: toml::Value =
        toml::from_str(&fs::read_to_string(point.join("config_alloc_8.toml")).expect("config"))
            .expect("toml");
    assert_eq!(config["online"]["ports"][0]["sink"]["nb_buckets"].as_integer(), Some(8));
    assert_eq!(config["online"]["duration"].as_integer(), Some(5));
    assert!(config["online"]["monitor"].get("log").is_none());

    let manifest: serde_json::Value =
        serde_json::from_slice(&fs::read(dir.join("out").join(MANIFEST_FILE)).expect("manifest"))
            .expect("json");
    assert_eq!(manifest["status"], "completed");
    assert!(dir.join("out").join("error_ledger.json").exists());
    assert!(!dir.join("out").join("sweep.lock").exists());
    assert!(console.contains(Tone::Heading, "No failures recorded"));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn terminal_stop_code_halts_the_outer_dimension() {
    let dir = scratch("halt");
    let builder = StubBuilder::default();
    let runner = ScriptedRunner::default().with("alloc_12", clean(StopCode::ZeroDropStop));
    let report = controller(
        allocation_plan(&dir, ""),
        &builder,
        &runner,
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("sweep");

    assert_eq!(runner.visits(), vec!["alloc_16", "alloc_12"]);
    assert_eq!(
        report.halted,
        Some(SweepHalt::DimensionStop {
            label: "alloc_12".to_string(),
            stop_code: StopCode::ZeroDropStop,
        })
    );
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn resumed_sweep_stops_where_the_halted_sweep_stopped() {
    let dir = scratch("halt_resume");
    let runner = ScriptedRunner::default().with("alloc_12", clean(StopCode::ZeroDropStop));
    controller(
        allocation_plan(&dir, ""),
        &StubBuilder::default(),
        &runner,
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("first sweep");
    assert_eq!(runner.visits(), vec!["alloc_16", "alloc_12"]);

    let builder = StubBuilder::default();
    let resumed = ScriptedRunner::default();
    let report = controller(
        allocation_plan(&dir, ""),
        &builder,
        &resumed,
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("resumed sweep");
    assert!(resumed.visits().is_empty());
    assert!(builder.requests().is_empty());
    assert_eq!(report.count(PointStatus::Skipped), 2);
    assert_eq!(
        report.halted,
        Some(SweepHalt::DimensionStop {
            label: "alloc_12".to_string(),
            stop_code: StopCode::ZeroDropStop,
        })
    );
    assert!(!dir.join("out").join("alloc_8").exists());
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn overload_moves_on_by_default_and_halts_when_asked() {
    let dir = scratch("overload");
    let runner = ScriptedRunner::default().with("alloc_16", overloaded());
    let report = controller(
        allocation_plan(&dir, ""),
        &StubBuilder::default(),
        &runner,
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("sweep");
    assert_eq!(runner.visits().len(), 4);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, FailureStage::RuntimeOverload);
    assert!(!dir
        .join("out/alloc_16/compute_features_alloc_16.csv")
        .exists());
    let _ = fs::remove_dir_all(dir);

    let dir = scratch("overload_halt");
    let runner = ScriptedRunner::default().with("alloc_16", overloaded());
    let plan = allocation_plan(&dir, "supervisor:\n  on_overload: halt_sweep\n");
    let report = controller(plan, &StubBuilder::default(), &runner, Arc::new(RecordingConsole::new()))
        .run()
        .expect("sweep");
    assert_eq!(runner.visits(), vec!["alloc_16"]);
    assert!(matches!(report.halted, Some(SweepHalt::Overload { .. })));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn resumed_sweep_skips_points_with_results() {
    let dir = scratch("resume");
    let plan = depth_plan(&dir, OFFLINE_TEMPLATE, "[dur, proto]");
    let done = FeatureSet::new(["dur"]);
    let point = dir.join("out").join("pkts_2");
    fs::create_dir_all(&point).expect("point");
    fs::write(
        point.join(format!("compute_features_{}.csv", done.hash())),
        "conn,dur\n",
    )
    .expect("existing result");

    let builder = StubBuilder::default();
    let runner = ScriptedRunner::default();
    let console = Arc::new(RecordingConsole::new());
    let report = controller(plan, &builder, &runner, console.clone())
        .run()
        .expect("sweep");

    // 4 sets per depth, 2 depths, one already done
    assert_eq!(builder.requests().len(), 7);
    let dur_builds = builder
        .requests()
        .iter()
        .filter(|r| r.features == vec!["dur".to_string()])
        .count();
    assert_eq!(dur_builds, 1, "only pkts_all builds the finished set");
    assert_eq!(report.count(PointStatus::Skipped), 1);
    assert_eq!(report.count(PointStatus::Completed), 7);
    assert!(console.contains(Tone::Skipped, done.hash()));
    let source = fs::read_to_string(dir.join("engine/src/features.rs")).expect("source");
    assert!(source.contains("false"), "last depth visited is unbounded");

    let second = controller(
        depth_plan(&dir, OFFLINE_TEMPLATE, "[dur, proto]"),
        &StubBuilder::default(),
        &ScriptedRunner::default(),
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("second sweep");
    assert_eq!(second.count(PointStatus::Skipped), 8);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn template_mismatch_is_recorded_and_the_sweep_continues() {
    let dir = scratch("mismatch");
    let plan = depth_plan(&dir, "[conn]\noutfile = \"elsewhere.csv\"\n", "[dur]");
    let builder = StubBuilder::default();
    let runner = ScriptedRunner::default();
    let report = controller(plan, &builder, &runner, Arc::new(RecordingConsole::new()))
        .run()
        .expect("sweep");

    assert!(builder.requests().is_empty());
    assert!(runner.visits().is_empty());
    assert_eq!(report.failures.len(), 4);
    assert!(report
        .failures
        .iter()
        .all(|f| f.stage == FailureStage::ConfigTemplateMismatch));
    let ledger = sweep_runner::load_ledger(&dir.join("out")).expect("ledger");
    assert_eq!(ledger.len(), 4);
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn build_failure_skips_the_run() {
    let dir = scratch("build");
    let plan = depth_plan(&dir, OFFLINE_TEMPLATE, "[dur, proto]");
    let builder = StubBuilder::failing_on("proto");
    let runner = ScriptedRunner::default();
    let report = controller(plan, &builder, &runner, Arc::new(RecordingConsole::new()))
        .run()
        .expect("sweep");

    assert_eq!(builder.requests().len(), 8);
    assert_eq!(runner.visits().len(), 4);
    let build_failures: Vec<_> = report
        .failures
        .iter()
        .filter(|f| f.stage == FailureStage::BuildFailure)
        .collect();
    assert_eq!(build_failures.len(), 4);
    let proto = FeatureSet::new(["proto"]);
    assert!(build_failures
        .iter()
        .any(|f| f.point == "pkts_2" && f.feature_set.as_deref() == Some(proto.hash())));
    let _ = fs::remove_dir_all(dir);
}

#[test]
fn nonzero_exit_leaves_no_result() {
    let dir = scratch("exit");
    let failing = RunOutcome {
        stop_code: StopCode::Continue,
        exit_status: Some(101),
        terminated_early: false,
    };
    let runner = ScriptedRunner::default().with("alloc_12", failing);
    let report = controller(
        allocation_plan(&dir, ""),
        &StubBuilder::default(),
        &runner,
        Arc::new(RecordingConsole::new()),
    )
    .run()
    .expect("sweep");

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, FailureStage::RuntimeFailure);
    assert!(report.failures[0].detail.contains("101"));
    let point = dir.join("out").join("alloc_12");
    assert!(!point.join("compute_features_alloc_12.csv").exists());
    assert!(!point.join("compute_features_alloc_12.csv.partial").exists());
    let _ = fs::remove_dir_all(dir);
}
