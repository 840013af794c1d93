use crate::console::{Console, Tone};
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub const DEFAULT_ERROR_MARKER: &str = "error";
pub const DEFAULT_STAGE_MARKERS: [&str; 2] = ["Compiling", "Finished"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Feature flags in addition to the coordinator's base features.
    pub features: Vec<String>,
    pub release: bool,
}

/// Something that can produce the target binary for a feature-flag set.
pub trait Builder {
    fn build(&self, request: &BuildRequest) -> Result<bool>;

    /// Path of the executable a successful `build` produces.
    fn executable(&self, release: bool) -> PathBuf;
}

/// Diagnostic classification of a single build-tool line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLine {
    Error,
    Stage,
    Other,
}

pub fn classify_diagnostic(
    line: &str,
    error_marker: &str,
    stage_markers: &[String],
) -> DiagnosticLine {
    if line.contains(error_marker) {
        DiagnosticLine::Error
    } else if stage_markers.iter().any(|m| line.contains(m.as_str())) {
        DiagnosticLine::Stage
    } else {
        DiagnosticLine::Other
    }
}

/// Drives `cargo build` (or a stand-in) for the benchmarked engine.
pub struct BuildCoordinator {
    program: String,
    leading_args: Vec<String>,
    workdir: PathBuf,
    binary: String,
    base_features: Vec<String>,
    target_dir: PathBuf,
    error_marker: String,
    stage_markers: Vec<String>,
    console: Arc<dyn Console>,
}

impl BuildCoordinator {
    pub fn new(workdir: &Path, binary: &str, console: Arc<dyn Console>) -> Self {
        Self {
            program: "cargo".to_string(),
            leading_args: Vec::new(),
            workdir: workdir.to_path_buf(),
            binary: binary.to_string(),
            base_features: Vec::new(),
            target_dir: workdir.join("target"),
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
            stage_markers: DEFAULT_STAGE_MARKERS.iter().map(|s| s.to_string()).collect(),
            console,
        }
    }

    /// Replaces the build program. `leading_args` go before the generated `build ...`
    /// arguments.
    pub fn with_program(mut self, program: &str, leading_args: Vec<String>) -> Self {
        self.program = program.to_string();
        self.leading_args = leading_args;
        self
    }

    pub fn with_base_features(mut self, features: Vec<String>) -> Self {
        self.base_features = features;
        self
    }

    pub fn with_target_dir(mut self, target_dir: PathBuf) -> Self {
        self.target_dir = target_dir;
        self
    }

    pub fn with_error_marker(mut self, marker: &str) -> Self {
        self.error_marker = marker.to_string();
        self
    }

    fn feature_list(&self, request: &BuildRequest) -> String {
        let mut all: Vec<&str> = self.base_features.iter().map(|s| s.as_str()).collect();
        for f in &request.features {
            if !all.contains(&f.as_str()) {
                all.push(f.as_str());
            }
        }
        all.join(",")
    }

    pub fn build_args(&self, request: &BuildRequest) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push("build".to_string());
        if request.release {
            args.push("--release".to_string());
        }
        args.push("--bin".to_string());
        args.push(self.binary.clone());
        let features = self.feature_list(request);
        if !features.is_empty() {
            args.push("--features".to_string());
            args.push(features);
        }
        args
    }
}

impl Builder for BuildCoordinator {
    fn build(&self, request: &BuildRequest) -> Result<bool> {
        let args = self.build_args(request);
        info!(program = %self.program, args = ?args, "starting build");
        let mut child = match Command::new(&self.program)
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %self.program, error = %e, "build tool failed to start");
                self.console.emit(
                    Tone::Failure,
                    &format!("\t> failed to start {}: {}", self.program, e),
                );
                return Ok(false);
            }
        };

        // stdout is drained on its own thread so a chatty build cannot block on a full pipe
        let stdout_drain = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    debug!(line = %line, "build stdout");
                }
            })
        });

        let mut success = true;
        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines() {
                let line = line.context("failed to read build diagnostics")?;
                match classify_diagnostic(&line, &self.error_marker, &self.stage_markers) {
                    DiagnosticLine::Error => {
                        success = false;
                        self.console.emit(Tone::Failure, &format!("\t> {}", line));
                    }
                    DiagnosticLine::Stage => {
                        self.console.emit(Tone::Progress, &format!("\t> {}", line));
                    }
                    DiagnosticLine::Other => debug!(line = %line, "build diagnostic"),
                }
            }
        }
        let status = child.wait().context("failed to wait for build tool")?;
        if let Some(handle) = stdout_drain {
            let _ = handle.join();
        }
        if !status.success() {
            warn!(status = ?status.code(), "build tool exited unsuccessfully");
            success = false;
        }
        Ok(success)
    }

    fn executable(&self, release: bool) -> PathBuf {
        let profile = if release { "release" } else { "debug" };
        self.target_dir.join(profile).join(&self.binary)
    }
}
