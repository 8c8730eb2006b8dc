//! Terminal output for multi-node runs
//!
//! Host tasks report events concurrently, so every write goes through one
//! mutex-guarded writer and whole lines are emitted under a single lock.

use clap::ValueEnum;
use nodectl_core::{
    Completion, EventKind, NodeEvent, NodeOutcome, OperationResult, Summary,
};
use serde::Serialize;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use crate::duration::{format_bytes, format_duration};

/// How results are presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputMode {
    /// One progress line per node, then each node's output in turn
    Grouped,
    /// Every event as it happens, prefixed with the node
    Stream,
}

/// Serializes output from concurrently running host tasks
pub struct OutputWriter<W: Write> {
    writer: Mutex<W>,
    mode: OutputMode,
    verbose: bool,
}

/// Machine-readable report printed with `--json`
#[derive(Serialize)]
pub struct JsonReport<'a> {
    pub summary: Summary,
    pub cancelled: bool,
    #[serde(flatten)]
    pub result: &'a OperationResult,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(writer: W, mode: OutputMode, verbose: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            mode,
            verbose,
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with the writer locked; a closed stdout is not an error worth reporting
    fn locked<F>(&self, f: F)
    where
        F: FnOnce(&mut W) -> io::Result<()>,
    {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = f(&mut writer).and_then(|_| writer.flush());
    }

    /// Task banner: `label: value` lines followed by a rule
    pub fn write_header(&self, title: &str, fields: &[(&str, String)]) {
        self.locked(|w| {
            writeln!(w, "========== {} ==========", title)?;
            for (label, value) in fields {
                writeln!(w, "{}: {}", label, value)?;
            }
            writeln!(w)
        });
    }

    /// Render one host event according to the mode
    pub fn write_event(&self, event: &NodeEvent) {
        let host = &event.host;
        match (&event.kind, self.mode) {
            (EventKind::Progress { written, total }, _) if self.verbose => {
                let percent = if *total == 0 {
                    100.0
                } else {
                    *written as f64 * 100.0 / *total as f64
                };
                self.locked(|w| {
                    writeln!(
                        w,
                        "[{}] progress: {:.1}% ({} / {})",
                        host,
                        percent,
                        format_bytes(*written),
                        format_bytes(*total)
                    )
                });
            }
            (EventKind::Completed, OutputMode::Grouped) => {
                self.locked(|w| writeln!(w, "[✓] {} {}", host, event.message));
            }
            (EventKind::Failed, OutputMode::Grouped) => {
                self.locked(|w| writeln!(w, "[✗] {} {}", host, event.message));
            }
            (_, OutputMode::Grouped) => {}
            (EventKind::Connecting, OutputMode::Stream) => {
                self.locked(|w| writeln!(w, "[{}] connecting...", host));
            }
            (EventKind::Connected, OutputMode::Stream) => {
                self.locked(|w| writeln!(w, "[{}] ✓ connected", host));
            }
            (EventKind::Executing, OutputMode::Stream) if self.verbose => {
                self.locked(|w| writeln!(w, "[{}] executing", host));
            }
            (EventKind::Verifying, OutputMode::Stream) => {
                self.locked(|w| writeln!(w, "[{}] verifying checksum", host));
            }
            (EventKind::Output, OutputMode::Stream) => {
                self.locked(|w| {
                    for line in event.message.lines().filter(|l| !l.is_empty()) {
                        writeln!(w, "[{}] {}", host, line)?;
                    }
                    Ok(())
                });
            }
            (EventKind::Completed, OutputMode::Stream) => {
                self.locked(|w| writeln!(w, "[{}] ✓ done ({})", host, event.message));
            }
            (EventKind::Failed, OutputMode::Stream) => {
                self.locked(|w| writeln!(w, "[{}] ✗ failed: {}", host, event.message));
            }
            (_, OutputMode::Stream) => {}
        }
    }

    /// Per-node output blocks in requested order
    pub fn write_grouped_results(&self, result: &OperationResult) {
        self.locked(|w| {
            writeln!(w)?;
            for (host, outcome) in result.ordered() {
                writeln!(w, "========== {} ==========", host)?;
                match outcome {
                    NodeOutcome::Success {
                        completion: Completion::Command { stdout, stderr, .. },
                        ..
                    } => {
                        write_block(w, "", stdout)?;
                        if self.verbose && !stderr.is_empty() && stderr != stdout {
                            write_block(w, "[stderr] ", stderr)?;
                        }
                    }
                    NodeOutcome::Success { .. } => writeln!(w, "{}", outcome)?,
                    NodeOutcome::Failure { .. } | NodeOutcome::Timeout { .. } => {
                        writeln!(w, "error: {}", outcome)?
                    }
                }
                writeln!(w)?;
            }
            Ok(())
        });
    }

    /// One status line per node for a file push
    pub fn write_transfer_results(&self, result: &OperationResult) {
        self.locked(|w| {
            writeln!(w)?;
            writeln!(w, "Node status:")?;
            for (host, outcome) in result.ordered() {
                match outcome {
                    NodeOutcome::Success {
                        completion: Completion::Transfer { bytes, checksum },
                        duration,
                    } => {
                        let check = match checksum {
                            Some(c) if c.verified => format!(", checksum {} verified", c.local_digest),
                            Some(c) if c.error.is_some() => format!(
                                ", checksum unavailable: {}",
                                c.error.as_deref().unwrap_or_default()
                            ),
                            Some(c) => format!(
                                ", checksum MISMATCH (local {} remote {})",
                                c.local_digest, c.remote_digest
                            ),
                            None => String::new(),
                        };
                        let mark = if checksum.as_ref().is_some_and(|c| !c.verified) {
                            "❌"
                        } else {
                            "✅"
                        };
                        writeln!(
                            w,
                            "  {} {}: {} in {}{}",
                            mark,
                            host,
                            format_bytes(*bytes),
                            format_duration(*duration),
                            check
                        )?;
                    }
                    other => writeln!(w, "  ❌ {}: {}", host, other)?,
                }
            }
            Ok(())
        });
    }

    /// Counts and total time
    pub fn write_summary(&self, result: &OperationResult, cancelled: bool) {
        let summary = result.summary();
        let total = result.hosts.len();
        let mismatches = result.checksum_mismatches();

        self.locked(|w| {
            writeln!(w)?;
            writeln!(w, "========== Summary ==========")?;
            if summary.succeeded == total && mismatches.is_empty() {
                writeln!(w, "✅ Successful: {}/{}", summary.succeeded, total)?;
            } else {
                if summary.succeeded > 0 {
                    writeln!(w, "✅ Successful: {}/{}", summary.succeeded, total)?;
                }
                if summary.failed > 0 {
                    writeln!(w, "❌ Failed: {}/{}", summary.failed, total)?;
                }
                if summary.timed_out > 0 {
                    writeln!(w, "⏱️  Timeout: {}/{}", summary.timed_out, total)?;
                }
                if !mismatches.is_empty() {
                    writeln!(w, "❌ Checksum mismatch: {}", mismatches.join(", "))?;
                }
                let skipped = total - summary.total();
                if cancelled && skipped > 0 {
                    writeln!(w, "⏹️  Not started (cancelled): {}/{}", skipped, total)?;
                }
            }
            writeln!(w, "⏱️  Total time: {}", format_duration(result.total_duration))
        });
    }

    pub fn write_json(&self, result: &OperationResult, cancelled: bool) -> anyhow::Result<()> {
        let report = JsonReport {
            summary: result.summary(),
            cancelled,
            result,
        };
        let json = serde_json::to_string_pretty(&report)?;
        self.locked(|w| writeln!(w, "{}", json));
        Ok(())
    }
}

fn write_block<W: Write>(w: &mut W, prefix: &str, text: &str) -> io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    write!(w, "{}{}", prefix, text)?;
    if !text.ends_with('\n') {
        writeln!(w)?;
    }
    Ok(())
}
