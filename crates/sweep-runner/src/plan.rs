use crate::error::PlanError;
use crate::inject::Truncation;
use crate::template::{ConfigKeys, DEFAULT_PLACEHOLDER, DEFAULT_REPLACEMENT};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::canonical_json_digest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPlan {
    pub engine: EngineSection,
    #[serde(default)]
    pub source: Option<SourceSection>,
    pub config: ConfigSection,
    #[serde(default)]
    pub entrypoint: Option<EntrypointSection>,
    pub outer: OuterDimension,
    #[serde(default)]
    pub inner: InnerSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub artifacts: ArtifactNames,
    pub output_dir: PathBuf,
    /// Digest of the validated plan document, overrides included.
    #[serde(skip)]
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    pub root: PathBuf,
    pub binary: String,
    #[serde(default)]
    pub base_features: Vec<String>,
    #[serde(default)]
    pub release: bool,
    #[serde(default)]
    pub build_program: Option<String>,
    /// Arguments placed before `build` when `build_program` is set.
    #[serde(default)]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
    /// Substring marking a failed build in the tool's diagnostics.
    #[serde(default)]
    pub error_marker: Option<String>,
    #[serde(default)]
    pub elevate: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub library_path: Option<String>,
}

fn default_log_level() -> String {
    "error".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    pub tree: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub matcher: Option<String>,
    #[serde(default)]
    pub unbounded_template: Option<String>,
    #[serde(default)]
    pub bounded_template: Option<String>,
}

fn default_extension() -> String {
    "rs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSection {
    pub template: PathBuf,
    #[serde(default)]
    pub online_template: Option<PathBuf>,
    /// Use `online_template` instead of `template`.
    #[serde(default)]
    pub online: bool,
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    /// `{result}` expands to the path the target should write its result to.
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default)]
    pub keys: ConfigKeys,
    #[serde(default)]
    pub duration: Option<u64>,
}

fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}

fn default_replacement() -> String {
    DEFAULT_REPLACEMENT.to_string()
}

impl ConfigSection {
    pub fn active_template(&self) -> Result<&Path> {
        if self.online {
            self.online_template
                .as_deref()
                .ok_or_else(|| anyhow!("online mode requested but config.online_template is unset"))
        } else {
            Ok(&self.template)
        }
    }
}

/// Binary entrypoint re-rendered per inner key; `{key}` expands in `replacement`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrypointSection {
    pub template: PathBuf,
    pub target: PathBuf,
    pub placeholder: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OuterDimension {
    /// Allocation values from `start` down to (excluding) zero, stepping by the core count.
    Allocation {
        start: u32,
        #[serde(default)]
        truncation: Option<Truncation>,
    },
    /// Explicit ordered truncation depths.
    Depth { depths: Vec<Truncation> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnerMode {
    #[default]
    None,
    Combinations,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerSection {
    #[serde(default)]
    pub mode: InnerMode,
    #[serde(default)]
    pub identifiers: Vec<String>,
    /// Pass each set's identifiers to the build tool as feature flags.
    #[serde(default = "default_true")]
    pub as_build_features: bool,
}

impl Default for InnerSection {
    fn default() -> Self {
        Self {
            mode: InnerMode::None,
            identifiers: Vec::new(),
            as_build_features: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverloadPolicy {
    /// Record the overload and move on to the next point.
    #[default]
    NextPoint,
    /// Record the overload and end the sweep.
    HaltSweep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_grace")]
    pub interrupt_grace_secs: u64,
    #[serde(default)]
    pub on_overload: OverloadPolicy,
    #[serde(default)]
    pub sampler: SamplerSection,
    #[serde(default = "default_true")]
    pub echo: bool,
}

fn default_epsilon() -> f64 {
    crate::supervise::DEFAULT_EPSILON
}

fn default_grace() -> u64 {
    crate::supervise::DEFAULT_INTERRUPT_GRACE.as_secs()
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            interrupt_grace_secs: default_grace(),
            on_overload: OverloadPolicy::default(),
            sampler: SamplerSection::default(),
            echo: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sampler_program")]
    pub program: String,
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Replaces the default `-b -d <interval>` arguments.
    #[serde(default)]
    pub args: Option<Vec<String>>,
}

fn default_sampler_program() -> String {
    "top".to_string()
}

fn default_interval() -> u64 {
    1
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_sampler_program(),
            interval_secs: default_interval(),
            args: None,
        }
    }
}

/// Per-point artifact file names; `{key}` expands to the inner key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactNames {
    pub result: String,
    pub record: String,
    pub samples: String,
}

impl Default for ArtifactNames {
    fn default() -> Self {
        Self {
            result: "compute_features_{key}.csv".to_string(),
            record: "out_features_{key}.json".to_string(),
            samples: "mem_features_{key}.txt".to_string(),
        }
    }
}

impl ArtifactNames {
    pub fn result_for(&self, key: &str) -> String {
        self.result.replace("{key}", key)
    }

    pub fn record_for(&self, key: &str) -> String {
        self.record.replace("{key}", key)
    }

    pub fn samples_for(&self, key: &str) -> String {
        self.samples.replace("{key}", key)
    }
}

/// Command-line values that take precedence over the plan file.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub output_dir: Option<PathBuf>,
    pub release: Option<bool>,
    pub online: Option<bool>,
    pub epsilon: Option<f64>,
    pub start: Option<u32>,
    pub duration: Option<u64>,
}

impl PlanOverrides {
    fn apply(&self, doc: &mut Value) -> Result<()> {
        if let Some(dir) = &self.output_dir {
            set_pointer(doc, "/output_dir", json!(dir.to_string_lossy()))?;
        }
        if let Some(release) = self.release {
            set_pointer(doc, "/engine/release", json!(release))?;
        }
        if let Some(online) = self.online {
            set_pointer(doc, "/config/online", json!(online))?;
        }
        if let Some(epsilon) = self.epsilon {
            if !epsilon.is_finite() || epsilon < 0.0 {
                return Err(PlanError::Invalid(format!("epsilon must be >= 0, got {}", epsilon)).into());
            }
            set_pointer(doc, "/supervisor/epsilon", json!(epsilon))?;
        }
        if let Some(start) = self.start {
            set_pointer(doc, "/outer/start", json!(start))?;
        }
        if let Some(duration) = self.duration {
            set_pointer(doc, "/config/duration", json!(duration))?;
        }
        Ok(())
    }
}

fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> Result<()> {
    let mut cur = root;
    let segments: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| anyhow!("empty json pointer"))?;
    for seg in parents {
        if !cur.is_object() {
            *cur = json!({});
        }
        let map = cur
            .as_object_mut()
            .ok_or_else(|| anyhow!("cannot descend into {}", pointer))?;
        cur = map.entry(seg.to_string()).or_insert_with(|| json!({}));
    }
    if !cur.is_object() {
        *cur = json!({});
    }
    cur.as_object_mut()
        .ok_or_else(|| anyhow!("cannot set {}", pointer))?
        .insert(last.to_string(), value);
    Ok(())
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        _ => false,
    }
}

/// Checks every field the sweep cannot run without, including those required by the chosen
/// dimensions, and reports them together.
pub fn validate_required_fields(doc: &Value) -> std::result::Result<(), PlanError> {
    let mut required: Vec<&str> = vec![
        "/engine/root",
        "/engine/binary",
        "/config/template",
        "/outer/kind",
        "/output_dir",
    ];
    match doc.pointer("/outer/kind").and_then(Value::as_str) {
        Some("allocation") => {
            required.push("/outer/start");
            if !is_blank(doc.pointer("/outer/truncation")) {
                required.push("/source/tree");
            }
        }
        Some("depth") => {
            required.push("/outer/depths");
            required.push("/source/tree");
        }
        Some(other) => {
            return Err(PlanError::Invalid(format!(
                "unknown outer dimension kind '{}' (expected allocation or depth)",
                other
            )))
        }
        None => {}
    }
    match doc.pointer("/inner/mode").and_then(Value::as_str) {
        Some("combinations") | Some("fixed") => required.push("/inner/identifiers"),
        Some("none") | None => {}
        Some(other) => {
            return Err(PlanError::Invalid(format!(
                "unknown inner mode '{}' (expected none, combinations or fixed)",
                other
            )))
        }
    }
    if doc.pointer("/config/online").and_then(Value::as_bool) == Some(true) {
        required.push("/config/online_template");
    }

    let mut missing: Vec<String> = Vec::new();
    for pointer in required {
        let blank = is_blank(doc.pointer(pointer))
            || (pointer == "/outer/start" && doc.pointer(pointer).and_then(Value::as_u64) == Some(0));
        if blank {
            missing.push(pointer.to_string());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PlanError::MissingFields(missing))
    }
}

impl SweepPlan {
    /// Reads a YAML plan, applies overrides, validates it and resolves relative paths against
    /// the plan's directory.
    pub fn load(path: &Path, overrides: &PlanOverrides) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read sweep plan {}: {}", path.display(), e))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Self::from_yaml_str(&raw, &base_dir, overrides)
    }

    pub fn from_yaml_str(raw: &str, base_dir: &Path, overrides: &PlanOverrides) -> Result<Self> {
        let yaml: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let mut doc: Value = serde_json::to_value(yaml)?;
        overrides.apply(&mut doc)?;
        validate_required_fields(&doc)?;
        let digest = canonical_json_digest(&doc);
        let mut plan: SweepPlan = serde_json::from_value(doc)
            .map_err(|e| PlanError::Invalid(e.to_string()))?;
        plan.digest = digest;
        plan.check_values()?;
        plan.resolve_paths(base_dir);
        Ok(plan)
    }

    fn check_values(&self) -> std::result::Result<(), PlanError> {
        let eps = self.supervisor.epsilon;
        if !eps.is_finite() || eps < 0.0 {
            return Err(PlanError::Invalid(format!("epsilon must be >= 0, got {}", eps)));
        }
        if let OuterDimension::Depth { depths } = &self.outer {
            if depths.is_empty() {
                return Err(PlanError::MissingFields(vec!["/outer/depths".to_string()]));
            }
        }
        if !self.artifacts.result.contains("{key}") && self.inner.mode != InnerMode::None {
            return Err(PlanError::Invalid(
                "artifacts.result must contain {key} when an inner dimension is swept".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        resolve(&mut self.engine.root);
        if let Some(target_dir) = self.engine.target_dir.as_mut() {
            resolve(target_dir);
        }
        if let Some(source) = self.source.as_mut() {
            resolve(&mut source.tree);
        }
        resolve(&mut self.config.template);
        if let Some(online) = self.config.online_template.as_mut() {
            resolve(online);
        }
        if let Some(entry) = self.entrypoint.as_mut() {
            resolve(&mut entry.template);
            resolve(&mut entry.target);
        }
        resolve(&mut self.output_dir);
    }
}

/// Allocation values visited by a sweep starting at `start` with the given step: `start`,
/// `start - step`, ... while the value stays above zero.
pub fn allocation_values(start: u32, step: u32) -> Result<Vec<u32>> {
    if step == 0 {
        return Err(anyhow!(
            "allocation step is zero; the config's core list must not be empty"
        ));
    }
    Ok((1..=start).rev().step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
engine:
  root: engine
  binary: extract_features
  base_features: [timing]
source:
  tree: engine/core/src/subscription
config:
  template: scripts/base_offline_config.toml
outer:
  kind: depth
  depths: [3, 2, all]
inner:
  mode: combinations
  identifiers: [dur, proto]
output_dir: results/test
"#;

    fn base() -> PathBuf {
        PathBuf::from("/plans")
    }

    #[test]
    fn allocation_steps_down_to_but_excluding_zero() {
        assert_eq!(allocation_values(16, 4).expect("values"), vec![16, 12, 8, 4]);
        assert_eq!(allocation_values(10, 4).expect("values"), vec![10, 6, 2]);
        assert_eq!(allocation_values(3, 8).expect("values"), vec![3]);
        assert!(allocation_values(0, 4).expect("values").is_empty());
        assert!(allocation_values(16, 0).is_err());
    }

    #[test]
    fn plan_loads_with_defaults_and_resolved_paths() {
        let plan = SweepPlan::from_yaml_str(PLAN, &base(), &PlanOverrides::default())
            .expect("plan");
        assert_eq!(plan.engine.root, PathBuf::from("/plans/engine"));
        assert_eq!(plan.output_dir, PathBuf::from("/plans/results/test"));
        assert_eq!(plan.engine.log_level, "error");
        assert_eq!(plan.supervisor.epsilon, 0.00001);
        assert_eq!(plan.supervisor.interrupt_grace_secs, 30);
        assert_eq!(plan.supervisor.on_overload, OverloadPolicy::NextPoint);
        assert_eq!(plan.config.placeholder, DEFAULT_PLACEHOLDER);
        assert_eq!(plan.inner.mode, InnerMode::Combinations);
        assert!(plan.inner.as_build_features);
        match &plan.outer {
            OuterDimension::Depth { depths } => assert_eq!(
                depths,
                &vec![
                    Truncation::After(3),
                    Truncation::After(2),
                    Truncation::Unbounded
                ]
            ),
            other => panic!("unexpected outer dimension {:?}", other),
        }
        assert_eq!(plan.digest.len(), 64);
    }

    #[test]
    fn validation_reports_every_missing_field() {
        let raw = "engine:\n  binary: x\nouter:\n  kind: depth\ninner:\n  mode: fixed\n";
        let err = SweepPlan::from_yaml_str(raw, &base(), &PlanOverrides::default())
            .expect_err("invalid");
        let msg = err.to_string();
        for pointer in [
            "/engine/root",
            "/config/template",
            "/output_dir",
            "/outer/depths",
            "/source/tree",
            "/inner/identifiers",
        ] {
            assert!(msg.contains(pointer), "{} not reported in {}", pointer, msg);
        }
        assert!(!msg.contains("/engine/binary"));
    }

    #[test]
    fn allocation_start_of_zero_counts_as_missing() {
        let doc = json!({
            "engine": {"root": "e", "binary": "b"},
            "config": {"template": "c.toml"},
            "outer": {"kind": "allocation", "start": 0},
            "output_dir": "out"
        });
        match validate_required_fields(&doc) {
            Err(PlanError::MissingFields(fields)) => assert_eq!(fields, vec!["/outer/start"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let doc = json!({"outer": {"kind": "bandwidth"}});
        assert!(matches!(
            validate_required_fields(&doc),
            Err(PlanError::Invalid(_))
        ));
    }

    #[test]
    fn overrides_take_precedence_and_change_the_digest() {
        let plain = SweepPlan::from_yaml_str(PLAN, &base(), &PlanOverrides::default())
            .expect("plan");
        let overrides = PlanOverrides {
            output_dir: Some(PathBuf::from("/tmp/elsewhere")),
            release: Some(true),
            epsilon: Some(0.0),
            duration: Some(90),
            ..PlanOverrides::default()
        };
        let plan = SweepPlan::from_yaml_str(PLAN, &base(), &overrides).expect("plan");
        assert_eq!(plan.output_dir, PathBuf::from("/tmp/elsewhere"));
        assert!(plan.engine.release);
        assert_eq!(plan.supervisor.epsilon, 0.0);
        assert_eq!(plan.config.duration, Some(90));
        assert_ne!(plain.digest, plan.digest);
    }

    #[test]
    fn online_mode_requires_its_template() {
        let overrides = PlanOverrides {
            online: Some(true),
            ..PlanOverrides::default()
        };
        let err = SweepPlan::from_yaml_str(PLAN, &base(), &overrides).expect_err("invalid");
        assert!(err.to_string().contains("/config/online_template"));
    }

    #[test]
    fn negative_epsilon_is_invalid() {
        let raw = PLAN.replace("output_dir", "supervisor:\n  epsilon: -1.0\noutput_dir");
        let err = SweepPlan::from_yaml_str(&raw, &base(), &PlanOverrides::default())
            .expect_err("invalid");
        assert!(err.to_string().contains("epsilon"));
    }

    #[test]
    fn artifact_names_expand_the_key() {
        let names = ArtifactNames::default();
        assert_eq!(names.result_for("ab12"), "compute_features_ab12.csv");
        assert_eq!(names.record_for("ab12"), "out_features_ab12.json");
        assert_eq!(names.samples_for("ab12"), "mem_features_ab12.txt");
    }
}
