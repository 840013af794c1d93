use crate::error::PointFailure;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use sweep_core::atomic_write_bytes;

pub const DEFAULT_PLACEHOLDER: &str = r#"outfile = "./compute_features.csv""#;
pub const DEFAULT_REPLACEMENT: &str = r#"outfile = "{result}""#;

/// Dotted key paths into the engine's TOML configuration. Numeric segments index arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigKeys {
    pub cores: String,
    pub duration: String,
    pub monitor_log: String,
    pub allocation: String,
}

impl Default for ConfigKeys {
    fn default() -> Self {
        Self {
            cores: "online.ports.0.cores".to_string(),
            duration: "online.duration".to_string(),
            monitor_log: "online.monitor.log".to_string(),
            allocation: "online.ports.0.sink.nb_buckets".to_string(),
        }
    }
}

/// Edits applied to the rendered configuration before each run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigMutation {
    pub duration: Option<u64>,
    pub allocation: Option<u32>,
    pub disable_monitor_log: bool,
}

impl ConfigMutation {
    pub fn is_empty(&self) -> bool {
        self.duration.is_none() && self.allocation.is_none() && !self.disable_monitor_log
    }
}

/// Substitutes `replacement` for the placeholder. A template without the placeholder was
/// written for a different engine version.
pub fn render_placeholder(
    template: &str,
    placeholder: &str,
    replacement: &str,
) -> std::result::Result<String, PointFailure> {
    if !template.contains(placeholder) {
        return Err(PointFailure::ConfigTemplateMismatch(format!(
            "placeholder `{}` not found",
            placeholder
        )));
    }
    Ok(template.replace(placeholder, replacement))
}

/// Number of entries in the assigned-cores list; the allocation sweep steps by this amount.
pub fn core_count(config_text: &str, keys: &ConfigKeys) -> Result<usize> {
    let root: toml::Value = toml::from_str(config_text)?;
    let cores = lookup(&root, &keys.cores)
        .ok_or_else(|| anyhow!("config has no `{}` list", keys.cores))?;
    cores
        .as_array()
        .map(|a| a.len())
        .ok_or_else(|| anyhow!("config key `{}` is not a list", keys.cores))
}

/// Applies `mutation` to the TOML text and re-serializes it. Missing key paths are reported as
/// template mismatches.
pub fn apply_mutation(
    config_text: &str,
    keys: &ConfigKeys,
    mutation: &ConfigMutation,
) -> std::result::Result<String, PointFailure> {
    if mutation.is_empty() {
        return Ok(config_text.to_string());
    }
    let mut root: toml::Value = toml::from_str(config_text)
        .map_err(|e| PointFailure::ConfigTemplateMismatch(format!("config is not TOML: {}", e)))?;
    if let Some(duration) = mutation.duration {
        let duration = i64::try_from(duration)
            .map_err(|_| PointFailure::PointSetup(format!("duration {} too large", duration)))?;
        set_path(&mut root, &keys.duration, toml::Value::Integer(duration))?;
    }
    if let Some(allocation) = mutation.allocation {
        set_path(&mut root, &keys.allocation, toml::Value::Integer(i64::from(allocation)))?;
    }
    if mutation.disable_monitor_log {
        remove_path(&mut root, &keys.monitor_log);
    }
    toml::to_string(&root)
        .map_err(|e| PointFailure::PointSetup(format!("failed to serialize config: {}", e)))
}

/// Renders the binary entrypoint from its template into the engine tree.
pub fn render_entrypoint(
    template_path: &Path,
    target_path: &Path,
    placeholder: &str,
    replacement: &str,
) -> std::result::Result<(), PointFailure> {
    let text = fs::read_to_string(template_path).map_err(|e| {
        PointFailure::EntrypointTemplateMismatch(format!(
            "cannot read {}: {}",
            template_path.display(),
            e
        ))
    })?;
    if !text.contains(placeholder) {
        return Err(PointFailure::EntrypointTemplateMismatch(format!(
            "placeholder `{}` not found in {}",
            placeholder,
            template_path.display()
        )));
    }
    let rendered = text.replace(placeholder, replacement);
    atomic_write_bytes(target_path, rendered.as_bytes())
        .map_err(|e| PointFailure::PointSetup(format!("cannot write entrypoint: {}", e)))
}

fn lookup<'a>(root: &'a toml::Value, path: &str) -> Option<&'a toml::Value> {
    path.split('.').try_fold(root, |cur, seg| match cur {
        toml::Value::Table(t) => t.get(seg),
        toml::Value::Array(a) => seg.parse::<usize>().ok().and_then(|i| a.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut toml::Value, path: &[&str]) -> Option<&'a mut toml::Value> {
    path.iter().try_fold(root, |cur, seg| match cur {
        toml::Value::Table(t) => t.get_mut(*seg),
        toml::Value::Array(a) => seg.parse::<usize>().ok().and_then(move |i| a.get_mut(i)),
        _ => None,
    })
}

fn set_path(
    root: &mut toml::Value,
    path: &str,
    value: toml::Value,
) -> std::result::Result<(), PointFailure> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| PointFailure::ConfigTemplateMismatch("empty config key".to_string()))?;
    let missing = || PointFailure::ConfigTemplateMismatch(format!("config key `{}` not found", path));
    match lookup_mut(root, parents).ok_or_else(missing)? {
        toml::Value::Table(t) => {
            t.insert(last.to_string(), value);
            Ok(())
        }
        toml::Value::Array(a) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| a.get_mut(i))
                .ok_or_else(missing)?;
            *slot = value;
            Ok(())
        }
        _ => Err(missing()),
    }
}

fn remove_path(root: &mut toml::Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    if let Some((last, parents)) = segments.split_last() {
        if let Some(toml::Value::Table(t)) = lookup_mut(root, parents) {
            t.remove(*last);
        }
    }
}
