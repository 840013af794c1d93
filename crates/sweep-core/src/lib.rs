use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest of a JSON value with object keys in sorted order, so two plans that differ only in
/// key order share a digest.
pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = canonicalize(value);
    sha256_bytes(canonical.to_string().as_bytes())
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Writes `bytes` next to `path` under a hidden temporary name, syncs, then renames over
/// `path`. Readers either see the previous content or the complete new content.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    let written = fs::File::create(&tmp)
        .and_then(|mut file| file.write_all(bytes).and_then(|_| file.sync_all()))
        .and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to write {}", path.display()));
    }
    sync_parent(path);
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sweep".to_string());
    path.with_file_name(format!(
        ".{}.{}-{}.tmp",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Promotes a fully written staging file to its final name.
pub fn promote_file(staging: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        ensure_dir(parent)?;
    }
    if let Ok(file) = fs::File::open(staging) {
        let _ = file.sync_all();
    }
    fs::rename(staging, dest)?;
    sync_parent(dest);
    Ok(())
}

fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_core_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("scratch dir");
        dir
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": "z"}});
        let b = json!({"a": {"x": "z", "y": [1, 2]}, "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        let c = json!({"a": {"x": "z", "y": [2, 1]}, "b": 1});
        assert_ne!(canonical_json_digest(&a), canonical_json_digest(&c));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = scratch("atomic");
        let path = dir.join("nested").join("out.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_json_pretty(&path, &json!({"ok": true})).expect("second write");
        let value: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["ok"], true);
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn failed_atomic_write_removes_its_temp_file() {
        let dir = scratch("atomic_fail");
        let occupied = dir.join("taken");
        fs::create_dir_all(occupied.join("child")).expect("dir");
        let err = atomic_write_bytes(&occupied, b"data").expect_err("rename over a directory");
        assert!(err.to_string().contains("failed to write"));
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn promote_file_moves_staging_into_place() {
        let dir = scratch("promote");
        let staging = dir.join("result.csv.partial");
        let dest = dir.join("result.csv");
        fs::write(&staging, "a,b\n1,2\n").expect("staging");
        promote_file(&staging, &dest).expect("promote");
        assert!(!staging.exists());
        assert_eq!(fs::read_to_string(&dest).expect("dest"), "a,b\n1,2\n");
        let _ = fs::remove_dir_all(dir);
    }
}
