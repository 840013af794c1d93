//! Supervision of one target run.
//!
//! `Starting -> Monitoring -> {Continue | ZeroDropStop | EpsilonStop} -> Terminated`.
//! Stdout is read by a single blocking consumer; the first stop-worthy line decides the
//! outcome and everything after it is only relayed.

use crate::console::{Console, Tone};
use crate::sampler::{SamplerConfig, SamplerHandle};
use crate::signal::{SignalRoute, StopSignal};
use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const SOFTWARE_DROP_MARKER: &str = "SW Dropped";
pub const TOTAL_DROP_MARKER: &str = "DROPPED";
pub const DEFAULT_EPSILON: f64 = 0.00001;
pub const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCode {
    /// Keep sweeping: this point was infeasible or inconclusive.
    Continue,
    /// A lossless operating point was found.
    ZeroDropStop,
    /// An operating point with loss at or below epsilon was found.
    EpsilonStop,
}

impl StopCode {
    pub fn halts_dimension(self) -> bool {
        !matches!(self, StopCode::Continue)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub stop_code: StopCode,
    /// Exit code of the target; `None` when it died from a signal.
    pub exit_status: Option<i32>,
    /// Set when the supervisor interrupted the target for overload.
    pub terminated_early: bool,
}

impl RunOutcome {
    pub fn overloaded(&self) -> bool {
        self.terminated_early
    }

    pub fn exited_cleanly(&self) -> bool {
        self.exit_status == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Monitoring,
    Concluded(StopCode),
    Terminated,
}

/// What a single stdout line established.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Software drops above epsilon.
    Overloaded(f64),
    ZeroDrop,
    WithinEpsilon(f64),
}

impl Verdict {
    pub fn stop_code(self) -> StopCode {
        match self {
            Verdict::Overloaded(_) => StopCode::Continue,
            Verdict::ZeroDrop => StopCode::ZeroDropStop,
            Verdict::WithinEpsilon(_) => StopCode::EpsilonStop,
        }
    }
}

fn percentage_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d*\.?\d+)%").ok())
        .as_ref()
}

/// First percentage token on the line, if any parses.
pub fn extract_percentage(line: &str) -> Option<f64> {
    percentage_pattern()?
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Classifies streamed output lines against epsilon. Holds the first verdict reached.
#[derive(Debug, Clone)]
pub struct DropMonitor {
    epsilon: f64,
    verdict: Option<Verdict>,
}

impl DropMonitor {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            verdict: None,
        }
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Returns the verdict this line produced, or `None` if the line was not stop-worthy or a
    /// verdict had already been reached.
    pub fn observe(&mut self, line: &str) -> Option<Verdict> {
        if self.verdict.is_some() {
            return None;
        }
        let verdict = self.classify(line)?;
        self.verdict = Some(verdict);
        Some(verdict)
    }

    fn classify(&self, line: &str) -> Option<Verdict> {
        if line.contains(SOFTWARE_DROP_MARKER) {
            let value = extract_percentage(line)?;
            (value > self.epsilon).then_some(Verdict::Overloaded(value))
        } else if line.contains(TOTAL_DROP_MARKER) {
            let value = extract_percentage(line)?;
            if value == 0.0 {
                Some(Verdict::ZeroDrop)
            } else if value <= self.epsilon {
                Some(Verdict::WithinEpsilon(value))
            } else {
                None
            }
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub epsilon: f64,
    /// How long an interrupted target gets before it is killed.
    pub interrupt_grace: Duration,
    /// Privilege launcher, e.g. `sudo`.
    pub elevate: Option<String>,
    pub log_level: String,
    pub library_path: Option<String>,
    pub sampler: Option<SamplerConfig>,
    /// Relay target stdout to the console.
    pub echo: bool,
}

impl SupervisorConfig {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            interrupt_grace: DEFAULT_INTERRUPT_GRACE,
            elevate: None,
            log_level: "error".to_string(),
            library_path: std::env::var("LD_LIBRARY_PATH").ok(),
            sampler: None,
            echo: true,
        }
    }
}

/// Locations for one run of the target.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    pub record_path: PathBuf,
    pub sample_path: Option<PathBuf>,
}

pub trait Runner {
    fn run(&self, invocation: &RunInvocation) -> Result<RunOutcome>;
}

/// Sole owner of the running target and its sampler. Whatever path leaves the supervisor,
/// dropping the handle kills and reaps both.
struct ProcessHandle {
    child: Option<Child>,
    sampler: Option<SamplerHandle>,
    route: SignalRoute,
}

impl ProcessHandle {
    /// Reaps the target. With an armed escalation the reap happens under its lock, so the
    /// watchdog never signals a pid that has already been released.
    fn wait(&mut self, escalation: Option<&Escalation>) -> Result<Option<i32>> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| anyhow!("target process already reaped"))?;
        let status = match escalation {
            None => child.wait().context("failed to wait for target")?,
            Some(escalation) => loop {
                let mut reaped = escalation.lock();
                if let Some(status) = child.try_wait().context("failed to wait for target")? {
                    *reaped = true;
                    break status;
                }
                drop(reaped);
                thread::sleep(ESCALATION_POLL);
            },
        };
        self.child = None;
        Ok(status.code())
    }

    fn stop_sampler(&mut self) {
        if let Some(mut sampler) = self.sampler.take() {
            sampler.stop();
            debug!(out = %sampler.out_path().display(), "resource sampler stopped");
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = self.route.send(StopSignal::Kill) {
                    warn!(error = %e, "failed to kill abandoned target");
                }
                if let Err(e) = child.kill() {
                    warn!(error = %e, "abandoned target reap failure: kill");
                }
            }
            if let Err(e) = child.wait() {
                warn!(error = %e, "abandoned target reap failure: wait");
            }
        }
        self.stop_sampler();
    }
}

const ESCALATION_POLL: Duration = Duration::from_millis(50);

/// Kills an interrupted target that outlives its grace period. `reaped` is set by the reaper
/// while holding the lock; the kill is only sent while holding it and seeing `false`.
struct Escalation {
    reaped: Arc<Mutex<bool>>,
    watchdog: JoinHandle<()>,
}

fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Escalation {
    fn arm(route: SignalRoute, grace: Duration) -> Self {
        let reaped = Arc::new(Mutex::new(false));
        let flag = reaped.clone();
        let watchdog = thread::spawn(move || {
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                if *lock_flag(&flag) {
                    return;
                }
                thread::sleep(ESCALATION_POLL);
            }
            let reaped = lock_flag(&flag);
            if !*reaped {
                warn!(grace_ms = grace.as_millis() as u64, "target ignored interrupt; killing");
                if let Err(e) = route.send(StopSignal::Kill) {
                    warn!(error = %e, "escalation kill failed");
                }
            }
        });
        Self { reaped, watchdog }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        lock_flag(&self.reaped)
    }

    fn disarm(self) {
        *self.lock() = true;
        if self.watchdog.join().is_err() {
            warn!("escalation watchdog panicked");
        }
    }
}

pub struct RunSupervisor {
    config: SupervisorConfig,
    console: Arc<dyn Console>,
}

impl RunSupervisor {
    pub fn new(config: SupervisorConfig, console: Arc<dyn Console>) -> Self {
        Self { config, console }
    }

    fn command(&self, invocation: &RunInvocation) -> Command {
        let exe = invocation.executable.as_os_str();
        let mut cmd = match &self.config.elevate {
            Some(launcher) => {
                let mut cmd = Command::new(launcher);
                cmd.arg("env");
                if let Some(lib) = &self.config.library_path {
                    cmd.arg(format!("LD_LIBRARY_PATH={}", lib));
                }
                cmd.arg(format!("RUST_LOG={}", self.config.log_level));
                cmd.arg(exe);
                cmd
            }
            None => {
                let mut cmd = Command::new(exe);
                if let Some(lib) = &self.config.library_path {
                    cmd.env("LD_LIBRARY_PATH", lib);
                }
                cmd.env("RUST_LOG", &self.config.log_level);
                cmd
            }
        };
        cmd.arg("-c")
            .arg(&invocation.config_path)
            .arg("-o")
            .arg(&invocation.record_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn route_for(&self, child: &Child, executable: &Path) -> SignalRoute {
        match &self.config.elevate {
            Some(launcher) => SignalRoute::Elevated {
                launcher: launcher.clone(),
                process_name: process_name(executable),
            },
            None => SignalRoute::Direct { pid: child.id() },
        }
    }

    fn start_sampler(&self, invocation: &RunInvocation) -> Option<SamplerHandle> {
        let (config, path) = match (&self.config.sampler, &invocation.sample_path) {
            (Some(config), Some(path)) => (config, path),
            _ => return None,
        };
        self.console.emit(
            Tone::Progress,
            &format!("> Starting resource sampler, writing to `{}`", path.display()),
        );
        match SamplerHandle::start(config, &process_name(&invocation.executable), path) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "resource sampler failed to start; continuing without it");
                None
            }
        }
    }

    fn announce(&self, verdict: Verdict) {
        let eps = self.config.epsilon;
        let message = match verdict {
            Verdict::Overloaded(v) => {
                format!("> TERMINATING, current SW drops {} greater than {}...", v, eps)
            }
            Verdict::ZeroDrop => "> Zero drops...".to_string(),
            Verdict::WithinEpsilon(v) => format!("> Epsilon {}% dropped...", v),
        };
        let tone = match verdict {
            Verdict::Overloaded(_) => Tone::Failure,
            _ => Tone::Progress,
        };
        self.console.emit(tone, &message);
    }
}

impl Runner for RunSupervisor {
    fn run(&self, invocation: &RunInvocation) -> Result<RunOutcome> {
        let mut state = SupervisorState::Starting;
        debug!(?state, exe = %invocation.executable.display(), "supervisor");

        let mut cmd = self.command(invocation);
        self.console.emit(Tone::Progress, &format!("> Running `{:?}`", cmd));
        let sampler = self.start_sampler(invocation);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", invocation.executable.display()))?;
        let stdout = child.stdout.take();
        let route = self.route_for(&child, &invocation.executable);
        let mut handle = ProcessHandle {
            child: Some(child),
            sampler,
            route: route.clone(),
        };

        state = SupervisorState::Monitoring;
        debug!(?state, "supervisor");
        let mut monitor = DropMonitor::new(self.config.epsilon);
        let mut escalation = None;
        let mut terminated_early = false;

        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "target stdout read failed");
                        break;
                    }
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if self.config.echo {
                    self.console.emit(Tone::Passthrough, line);
                }
                let Some(verdict) = monitor.observe(line) else {
                    continue;
                };
                self.announce(verdict);
                state = SupervisorState::Concluded(verdict.stop_code());
                info!(?state, ?verdict, "run concluded");
                if let Verdict::Overloaded(_) = verdict {
                    if let Err(e) = route.send(StopSignal::Interrupt) {
                        warn!(error = %e, "failed to interrupt overloaded target");
                    }
                    terminated_early = true;
                    escalation = Some(Escalation::arm(route.clone(), self.config.interrupt_grace));
                }
            }
        }

        let exit_status = handle.wait(escalation.as_ref());
        if let Some(escalation) = escalation {
            escalation.disarm();
        }
        handle.stop_sampler();
        let exit_status = exit_status?;
        state = SupervisorState::Terminated;
        let stop_code = monitor
            .verdict()
            .map(Verdict::stop_code)
            .unwrap_or(StopCode::Continue);
        info!(?state, ?stop_code, ?exit_status, terminated_early, "target finished");
        Ok(RunOutcome {
            stop_code,
            exit_status,
            terminated_early,
        })
    }
}

fn process_name(executable: &Path) -> String {
    executable
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| executable.to_string_lossy().to_string())
}
