use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use sweep_core::sha256_bytes;

/// A subset of derived-feature identifiers, keyed by a digest of its sorted members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureSet {
    identifiers: Vec<String>,
    hash: String,
}

impl FeatureSet {
    pub fn new<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut identifiers: Vec<String> = identifiers.into_iter().map(Into::into).collect();
        identifiers.sort();
        identifiers.dedup();
        let hash = content_hash(&identifiers);
        Self { identifiers, hash }
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// `a-b-c`, the string the hash is computed over.
    pub fn dashed(&self) -> String {
        self.identifiers.join("-")
    }

    /// `a,b,c`, as handed to the build tool's feature flag.
    pub fn comma_joined(&self) -> String {
        self.identifiers.join(",")
    }
}

/// Digest of the sorted, dash-joined identifier list.
pub fn content_hash<S: AsRef<str>>(identifiers: &[S]) -> String {
    let mut sorted: Vec<&str> = identifiers.iter().map(|s| s.as_ref()).collect();
    sorted.sort_unstable();
    sha256_bytes(sorted.join("-").as_bytes())
}

/// Upper bound on combinatorial sweeps; 2^24 builds is already far beyond any real sweep.
pub const MAX_COMBINATION_IDENTIFIERS: usize = 24;

/// Every subset of `identifiers`, empty and full included, in truth-table order: subset `i`
/// contains identifier `j` when bit `j` of `i` is set. Duplicate identifiers count once.
pub fn enumerate_combinations<S: AsRef<str>>(identifiers: &[S]) -> Result<Vec<FeatureSet>> {
    let mut seen = BTreeSet::new();
    let unique: Vec<&str> = identifiers
        .iter()
        .map(|s| s.as_ref())
        .filter(|s| seen.insert(*s))
        .collect();
    let n = unique.len();
    if n > MAX_COMBINATION_IDENTIFIERS {
        return Err(anyhow!(
            "{} identifiers requested; combination sweeps support at most {}",
            n,
            MAX_COMBINATION_IDENTIFIERS
        ));
    }
    Ok((0..(1usize << n))
        .map(|mask| {
            FeatureSet::new(
                unique
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| mask & (1 << j) != 0)
                    .map(|(_, id)| *id),
            )
        })
        .collect())
}

/// One single-identifier set per listed identifier, in the given order.
pub fn enumerate_fixed<S: AsRef<str>>(identifiers: &[S]) -> Vec<FeatureSet> {
    let mut seen = BTreeSet::new();
    identifiers
        .iter()
        .map(|s| s.as_ref())
        .filter(|s| seen.insert(*s))
        .map(|id| FeatureSet::new([id]))
        .collect()
}
