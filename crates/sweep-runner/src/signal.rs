use anyhow::{anyhow, Result};
use std::process::{Command, Stdio};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful: lets the target flush its counters before exiting.
    Interrupt,
    Kill,
}

impl StopSignal {
    fn raw(self) -> libc::c_int {
        match self {
            StopSignal::Interrupt => libc::SIGINT,
            StopSignal::Kill => libc::SIGKILL,
        }
    }

    fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "INT",
            StopSignal::Kill => "KILL",
        }
    }
}

/// How signals reach the supervised target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRoute {
    /// The target is our direct child.
    Direct { pid: u32 },
    /// The target runs under a privilege launcher; signals go through the same launcher to
    /// every process carrying the executable's name.
    Elevated { launcher: String, process_name: String },
}

impl SignalRoute {
    pub fn send(&self, signal: StopSignal) -> Result<()> {
        match self {
            SignalRoute::Direct { pid } => send_direct(*pid, signal),
            SignalRoute::Elevated {
                launcher,
                process_name,
            } => send_elevated(launcher, process_name, signal),
        }
    }
}

fn send_direct(pid: u32, signal: StopSignal) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| anyhow!("pid out of range: {}", pid))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.raw()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "signal target already exited");
            return Ok(());
        }
        return Err(anyhow!("kill -{} {} failed: {}", signal.name(), pid, err));
    }
    Ok(())
}

fn send_elevated(launcher: &str, process_name: &str, signal: StopSignal) -> Result<()> {
    let pids = pids_of(process_name)?;
    if pids.is_empty() {
        debug!(process = %process_name, "no running process to signal");
        return Ok(());
    }
    let status = Command::new(launcher)
        .arg("kill")
        .arg(format!("-{}", signal.name()))
        .args(pids.iter().map(|p| p.to_string()))
        .stdin(Stdio::null())
        .status()
        .map_err(|e| anyhow!("failed to run {} kill: {}", launcher, e))?;
    if !status.success() {
        return Err(anyhow!(
            "{} kill -{} {:?} exited with {:?}",
            launcher,
            signal.name(),
            pids,
            status.code()
        ));
    }
    Ok(())
}

/// Process ids whose name matches `process_name`, as reported by `pidof`.
pub fn pids_of(process_name: &str) -> Result<Vec<u32>> {
    let output = Command::new("pidof")
        .arg(process_name)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| anyhow!("failed to run pidof: {}", e))?;
    Ok(parse_pid_list(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_pid_list(text: &str) -> Vec<u32> {
    text.split_whitespace()
        .filter_map(|p| p.parse::<u32>().ok())
        .collect()
}
