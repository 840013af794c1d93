pub mod build;
pub mod console;
pub mod error;
pub mod features;
pub mod inject;
pub mod ledger;
pub mod plan;
pub mod sampler;
pub mod signal;
pub mod supervise;
pub mod sweep;
pub mod template;

pub use build::{BuildCoordinator, BuildRequest, Builder};
pub use console::{AnsiConsole, Console, PlainConsole, RecordingConsole, SilentConsole, Tone};
pub use error::{PlanError, PointFailure};
pub use features::{content_hash, enumerate_combinations, enumerate_fixed, FeatureSet};
pub use inject::{SourceInjector, Truncation, TruncationTemplate};
pub use ledger::{ErrorLedger, FailureStage, LedgerEntry};
pub use plan::{OverloadPolicy, PlanOverrides, SweepPlan};
pub use supervise::{RunInvocation, RunOutcome, RunSupervisor, Runner, StopCode, SupervisorConfig};
pub use sweep::{
    describe_plan, PointReport, PointStatus, SweepController, SweepDescription, SweepHalt,
    SweepReport,
};

use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loads the plan and runs the whole sweep against the real build tool and target.
pub fn run_sweep(
    plan_path: &Path,
    overrides: &PlanOverrides,
    console: Arc<dyn Console>,
) -> Result<SweepReport> {
    let plan = SweepPlan::load(plan_path, overrides)?;
    SweepController::from_plan(plan, console)?.run()
}

pub fn describe_sweep(plan_path: &Path, overrides: &PlanOverrides) -> Result<SweepDescription> {
    let plan = SweepPlan::load(plan_path, overrides)?;
    describe_plan(&plan)
}

/// Applies the default truncation rewrite to a source tree outside of a sweep.
pub fn inject_source(
    tree: &Path,
    truncation: Truncation,
    extension: &str,
) -> Result<BTreeSet<PathBuf>> {
    let injector = SourceInjector::new(
        inject::DEFAULT_MATCHER,
        TruncationTemplate::default(),
        extension,
    )?;
    injector.apply(tree, truncation)
}

pub fn load_ledger(output_dir: &Path) -> Result<ErrorLedger> {
    ErrorLedger::load(output_dir)
}
