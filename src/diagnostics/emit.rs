//! Report emission backend.
//!
//! Handles outputting reports to custom sinks, stderr and the log.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::{Diagnostic, DiagnosticKind};
use super::report::BadAccessReport;
use super::strict::should_panic;
use crate::sync::mutex::Mutex;

/// Global flag to suppress stderr output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Suppress stderr output of reports and diagnostics.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// A report sink trait for custom output.
pub trait ReportSink: Send + Sync {
    /// Handle a report.
    fn report(&self, report: &BadAccessReport);
}

/// A simple sink that collects reports.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<BadAccessReport>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected reports.
    pub fn reports(&self) -> Vec<BadAccessReport> {
        self.reports.lock().clone()
    }

    /// Most recent report, if any.
    pub fn last(&self) -> Option<BadAccessReport> {
        self.reports.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear collected reports.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ReportSink for CollectingSink {
    fn report(&self, report: &BadAccessReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Emit a report.
///
/// Reports always go to the log. With sinks configured they go to every
/// sink; without, to stderr in debug builds or with the `diagnostics`
/// feature. In strict mode the call panics afterwards.
pub fn emit_report(report: &BadAccessReport, sinks: &[Arc<dyn ReportSink>]) {
    log::error!("{}", report.summary());

    if sinks.is_empty() {
        #[cfg(any(debug_assertions, feature = "diagnostics"))]
        {
            if !is_suppressed() {
                let _ = writeln!(std::io::stderr(), "{}", report);
            }
        }
    } else {
        for sink in sinks {
            sink.report(report);
        }
    }

    if should_panic() {
        panic!(
            "{}\nStrict mode enabled - errors are fatal.",
            report.summary()
        );
    }
}

/// Emit a diagnostic with additional runtime context.
///
/// Used for findings that are not about a particular access, such as
/// engine invariant violations.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    match diag.kind {
        DiagnosticKind::Error => log::error!("[{}] {}: {}", diag.code, diag.message, context),
        DiagnosticKind::Warning => log::warn!("[{}] {}: {}", diag.code, diag.message, context),
        DiagnosticKind::Note => log::info!("[{}] {}: {}", diag.code, diag.message, context),
    }

    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    {
        if !is_suppressed() {
            emit_to_stderr_with_context(diag, context);
        }
    }

    if diag.kind == DiagnosticKind::Error && should_panic() {
        panic!(
            "[shadowheap][{}] {}\nContext: {}\nStrict mode enabled - errors are fatal.",
            diag.code, diag.message, context
        );
    }
}

/// Internal: emit to stderr with context.
#[cfg(any(debug_assertions, feature = "diagnostics"))]
fn emit_to_stderr_with_context(diag: &Diagnostic, context: &str) {
    let mut stderr = std::io::stderr();

    let _ = writeln!(
        stderr,
        "[shadowheap][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );
    let _ = writeln!(stderr, "  context: {}", context);
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }
    let _ = writeln!(stderr);
}
