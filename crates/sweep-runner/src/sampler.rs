//! Resource-sampling sidecar.
//!
//! The sampler program (by default `top -b -d <interval>`) is spawned directly, never through a
//! shell, so the handle we own is the sampling process itself and killing it leaves nothing
//! behind. A reader thread filters its snapshots down to lines naming the target and appends
//! them to the sample file.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use sweep_core::ensure_dir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl SamplerConfig {
    pub fn top(interval_secs: u64) -> Self {
        Self {
            program: "top".to_string(),
            args: vec![
                "-b".to_string(),
                "-d".to_string(),
                interval_secs.max(1).to_string(),
            ],
        }
    }
}

/// A running sampler and the thread copying its filtered output.
pub struct SamplerHandle {
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    out_path: PathBuf,
}

impl SamplerHandle {
    pub fn start(config: &SamplerConfig, filter: &str, out_path: &Path) -> Result<Self> {
        if let Some(parent) = out_path.parent() {
            ensure_dir(parent)?;
        }
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(out_path)
            .with_context(|| format!("failed to open sample file {}", out_path.display()))?;
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start sampler {}", config.program))?;
        let reader = child.stdout.take().map(|stdout| {
            let filter = filter.to_string();
            thread::spawn(move || copy_matching_lines(stdout, sink, &filter))
        });
        info!(program = %config.program, out = %out_path.display(), "resource sampler started");
        Ok(Self {
            child: Some(child),
            reader,
            out_path: out_path.to_path_buf(),
        })
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    /// Kills and reaps the sampler, then joins the reader. Problems are logged, never returned:
    /// a sampler that will not die must not fail the point it was observing.
    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => debug!(status = ?status.code(), "sampler already exited"),
                _ => {
                    if let Err(e) = child.kill() {
                        warn!(error = %e, "sidecar reap failure: kill");
                    }
                    if let Err(e) = child.wait() {
                        warn!(error = %e, "sidecar reap failure: wait");
                    }
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("sidecar reap failure: reader thread panicked");
            }
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn copy_matching_lines<R: std::io::Read>(source: R, mut sink: File, filter: &str) {
    for line in BufReader::new(source).lines().map_while(Result::ok) {
        if !line.contains(filter) {
            continue;
        }
        if writeln!(sink, "{}", line).and_then(|_| sink.flush()).is_err() {
            warn!("sample file write failed; sampler output dropped");
            break;
        }
    }
}
