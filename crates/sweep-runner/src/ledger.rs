use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::atomic_write_json_pretty;

pub const LEDGER_FILE: &str = "error_ledger.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    SourceInjection,
    PointSetup,
    ConfigTemplateMismatch,
    EntrypointTemplateMismatch,
    BuildFailure,
    RuntimeOverload,
    RuntimeFailure,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::SourceInjection => "source_injection",
            FailureStage::PointSetup => "point_setup",
            FailureStage::ConfigTemplateMismatch => "config_template_mismatch",
            FailureStage::EntrypointTemplateMismatch => "entrypoint_template_mismatch",
            FailureStage::BuildFailure => "build_failure",
            FailureStage::RuntimeOverload => "runtime_overload",
            FailureStage::RuntimeFailure => "runtime_failure",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub point: String,
    #[serde(default)]
    pub feature_set: Option<String>,
    pub stage: FailureStage,
    pub detail: String,
    pub recorded_at: String,
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.feature_set {
            Some(set) => write!(f, "({}, {}): {}", self.point, set, self.stage)?,
            None => write!(f, "({}): {}", self.point, self.stage)?,
        }
        if !self.detail.is_empty() {
            write!(f, " - {}", self.detail)?;
        }
        Ok(())
    }
}

/// Failures recorded during one sweep, in the order they happened.
#[derive(Debug, Clone, Default)]
pub struct ErrorLedger {
    entries: Vec<LedgerEntry>,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        point: &str,
        feature_set: Option<&str>,
        stage: FailureStage,
        detail: impl Into<String>,
    ) {
        self.entries.push(LedgerEntry {
            point: point.to_string(),
            feature_set: feature_set.map(|s| s.to_string()),
            stage,
            detail: detail.into(),
            recorded_at: Utc::now().to_rfc3339(),
        });
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn path_in(output_dir: &Path) -> PathBuf {
        output_dir.join(LEDGER_FILE)
    }

    pub fn write(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = Self::path_in(output_dir);
        let payload = json!({
            "schema_version": "error_ledger_v1",
            "written_at": Utc::now().to_rfc3339(),
            "failures": self.entries,
        });
        atomic_write_json_pretty(&path, &payload)?;
        Ok(path)
    }

    pub fn load(output_dir: &Path) -> Result<Self> {
        let path = Self::path_in(output_dir);
        if !path.exists() {
            return Err(anyhow!("no error ledger in {}", output_dir.display()));
        }
        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path)?)?;
        let failures = value
            .get("failures")
            .cloned()
            .ok_or_else(|| anyhow!("error ledger {} has no failures list", path.display()))?;
        let entries: Vec<LedgerEntry> = serde_json::from_value(failures)?;
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sweep_core::ensure_dir;

    #[test]
    fn entries_keep_insertion_order() {
        let mut ledger = ErrorLedger::new();
        ledger.record("pkts_4", Some("abc"), FailureStage::ConfigTemplateMismatch, "");
        ledger.record("pkts_4", Some("abc"), FailureStage::BuildFailure, "error: x");
        ledger.record("pkts_3", None, FailureStage::SourceInjection, "denied");
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.entries()[0].stage, FailureStage::ConfigTemplateMismatch);
        assert_eq!(ledger.entries()[1].stage, FailureStage::BuildFailure);
        assert_eq!(ledger.entries()[2].feature_set, None);
    }

    #[test]
    fn entries_render_with_their_tags() {
        let mut ledger = ErrorLedger::new();
        ledger.record("alloc_8", None, FailureStage::RuntimeOverload, "SW drops 0.3%");
        ledger.record("pkts_1", Some("dur-proto"), FailureStage::BuildFailure, "");
        assert_eq!(
            ledger.entries()[0].to_string(),
            "(alloc_8): runtime_overload - SW drops 0.3%"
        );
        assert_eq!(ledger.entries()[1].to_string(), "(pkts_1, dur-proto): build_failure");
    }

    #[test]
    fn ledger_survives_a_write_load_cycle() {
        let dir = std::env::temp_dir().join(format!(
            "sweep_ledger_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch");
        let mut ledger = ErrorLedger::new();
        ledger.record("pkts_2", Some("h"), FailureStage::RuntimeFailure, "exit 101");
        let path = ledger.write(&dir).expect("write");
        assert!(path.ends_with(LEDGER_FILE));
        let loaded = ErrorLedger::load(&dir).expect("load");
        assert_eq!(loaded.entries(), ledger.entries());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn loading_without_a_ledger_fails() {
        let err = ErrorLedger::load(Path::new("/nonexistent/sweep/out")).expect_err("missing");
        assert!(err.to_string().contains("no error ledger"));
    }
}
