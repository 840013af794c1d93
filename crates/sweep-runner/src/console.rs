//! User-facing progress output.
//!
//! The controller and its components never write colour codes themselves; they hand a
//! [`Tone`] and a message to whatever [`Console`] they were constructed with.

use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Outer dimension headers.
    Heading,
    /// Inner dimension headers (feature set keys and hashes).
    Subheading,
    /// Stage announcements and successes.
    Progress,
    /// Points skipped because their result already exists.
    Skipped,
    Failure,
    /// Raw output relayed from a child process.
    Passthrough,
}

pub trait Console: Send + Sync {
    fn emit(&self, tone: Tone, message: &str);
}

/// ANSI-coloured stdout output.
#[derive(Debug, Default)]
pub struct AnsiConsole;

impl Console for AnsiConsole {
    fn emit(&self, tone: Tone, message: &str) {
        let (start, end) = match tone {
            Tone::Heading => ("\x1b[33m\x1b[1m", "\x1b[0m"),
            Tone::Subheading => ("\x1b[36m\x1b[1m", "\x1b[0m"),
            Tone::Progress => ("\x1b[32m", "\x1b[0m"),
            Tone::Skipped => ("\x1b[35m\x1b[1m", "\x1b[0m"),
            Tone::Failure => ("\x1b[31m", "\x1b[0m"),
            Tone::Passthrough => ("", ""),
        };
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}{}{}", start, message, end);
    }
}

#[derive(Debug, Default)]
pub struct PlainConsole;

impl Console for PlainConsole {
    fn emit(&self, _tone: Tone, message: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", message);
    }
}

/// Swallows everything. Used by `--json` mode where stdout carries the payload only.
#[derive(Debug, Default)]
pub struct SilentConsole;

impl Console for SilentConsole {
    fn emit(&self, _tone: Tone, _message: &str) {}
}

/// Keeps every emitted message in memory.
#[derive(Debug, Default)]
pub struct RecordingConsole {
    lines: Mutex<Vec<(Tone, String)>>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Tone, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, tone: Tone, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(t, line)| *t == tone && line.contains(needle))
    }
}

impl Console for RecordingConsole {
    fn emit(&self, tone: Tone, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((tone, message.to_string()));
        }
    }
}
