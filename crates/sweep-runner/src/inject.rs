use anyhow::{anyhow, Context, Result};
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use sweep_core::atomic_write_bytes;
use tracing::{debug, info};

pub const DEFAULT_MATCHER: &str = r"(?s)fn early_terminate\(&self\) -> bool \{.*?\}";
pub const DEFAULT_UNBOUNDED_TEMPLATE: &str = "fn early_terminate(&self) -> bool {\n        false\n    }";
pub const DEFAULT_BOUNDED_TEMPLATE: &str =
    "fn early_terminate(&self) -> bool {\n        self.cnt >= {depth}\n    }";

/// Compile-time truncation variant of the benchmarked engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_yaml::Value", into = "String")]
pub enum Truncation {
    /// Never terminate a connection early ("all" packets).
    Unbounded,
    /// Terminate after this many units.
    After(u64),
}

impl fmt::Display for Truncation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Truncation::Unbounded => write!(f, "all"),
            Truncation::After(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Truncation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Truncation::Unbounded);
        }
        s.parse::<u64>()
            .map(Truncation::After)
            .map_err(|_| anyhow!("invalid truncation depth '{}': expected a count or 'all'", s))
    }
}

impl TryFrom<serde_yaml::Value> for Truncation {
    type Error = anyhow::Error;

    fn try_from(value: serde_yaml::Value) -> Result<Self> {
        match value {
            serde_yaml::Value::Number(n) => n
                .as_u64()
                .map(Truncation::After)
                .ok_or_else(|| anyhow!("truncation depth must be a non-negative integer")),
            serde_yaml::Value::String(s) => s.parse(),
            other => Err(anyhow!("invalid truncation depth: {:?}", other)),
        }
    }
}

impl From<Truncation> for String {
    fn from(value: Truncation) -> Self {
        value.to_string()
    }
}

/// Replacement text for the two truncation variants. `{depth}` in the bounded template is
/// substituted with the depth.
#[derive(Debug, Clone)]
pub struct TruncationTemplate {
    pub unbounded: String,
    pub bounded: String,
}

impl Default for TruncationTemplate {
    fn default() -> Self {
        Self {
            unbounded: DEFAULT_UNBOUNDED_TEMPLATE.to_string(),
            bounded: DEFAULT_BOUNDED_TEMPLATE.to_string(),
        }
    }
}

impl TruncationTemplate {
    pub fn render(&self, truncation: Truncation) -> String {
        match truncation {
            Truncation::Unbounded => self.unbounded.clone(),
            Truncation::After(n) => self.bounded.replace("{depth}", &n.to_string()),
        }
    }
}

/// Rewrites a function-shaped region in every matching file of a source tree.
#[derive(Debug, Clone)]
pub struct SourceInjector {
    matcher: Regex,
    template: TruncationTemplate,
    extension: String,
}

impl SourceInjector {
    pub fn new(matcher: &str, template: TruncationTemplate, extension: &str) -> Result<Self> {
        let matcher = Regex::new(matcher)
            .with_context(|| format!("invalid source matcher: {}", matcher))?;
        Ok(Self {
            matcher,
            template,
            extension: extension.trim_start_matches('.').to_string(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_MATCHER, TruncationTemplate::default(), "rs")
    }

    /// Applies the rendered variant to every file under `tree` and returns the files whose
    /// content changed. Files without a match are left untouched.
    pub fn apply(&self, tree: &Path, truncation: Truncation) -> Result<BTreeSet<PathBuf>> {
        if !tree.is_dir() {
            return Err(anyhow!("source tree not found: {}", tree.display()));
        }
        let rendered = self.template.render(truncation);
        let mut changed = BTreeSet::new();
        for entry in walkdir::WalkDir::new(tree).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            if self.apply_file(path, &rendered)? {
                info!(file = %path.display(), variant = %truncation, "source modified");
                changed.insert(path.to_path_buf());
            } else {
                debug!(file = %path.display(), "source unchanged");
            }
        }
        Ok(changed)
    }

    fn apply_file(&self, path: &Path, rendered: &str) -> Result<bool> {
        let original = fs::read_to_string(path)
            .with_context(|| format!("failed to read source file {}", path.display()))?;
        let updated = self.matcher.replace_all(&original, NoExpand(rendered));
        if updated == original {
            return Ok(false);
        }
        atomic_write_bytes(path, updated.as_bytes())?;
        Ok(true)
    }
}
