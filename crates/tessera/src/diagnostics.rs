//! Diagnostic callbacks invoked during compilation.
//!
//! The [`Diagnostics`] trait has default no-op methods, so implementations only
//! override the hooks they care about:
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`NoDiagnostics`] | Ignore everything (the default for [`crate::compile`]) |
//! | [`TracingDiagnostics`] | Forward events to `tracing` |
//! | [`CollectingDiagnostics`] | Record events, mainly for tests and tooling |
//!
//! Errors are reported through `on_error` right before compilation aborts with
//! the corresponding [`crate::CompileError`]; warnings never abort.

use crate::{
    error::{ErrorKind, WarningKind},
    location::CodeRange,
};

/// Receiver for compiler warnings and errors.
pub trait Diagnostics {
    /// Called for a non-fatal problem. Compilation continues.
    fn on_warning(&mut self, _kind: WarningKind, _range: CodeRange, _msg: &str) {}

    /// Called once with the error that aborts compilation.
    fn on_error(&mut self, _kind: ErrorKind, _range: CodeRange, _msg: &str) {}
}

/// Diagnostics sink that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

impl Diagnostics for NoDiagnostics {}

/// Diagnostics sink that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn on_warning(&mut self, kind: WarningKind, range: CodeRange, msg: &str) {
        tracing::warn!(%kind, %range, "{msg}");
    }

    fn on_error(&mut self, kind: ErrorKind, range: CodeRange, msg: &str) {
        tracing::error!(%kind, %range, "{msg}");
    }
}

/// A recorded diagnostic event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    Warning {
        kind: WarningKind,
        range: CodeRange,
        msg: String,
    },
    Error {
        kind: ErrorKind,
        range: CodeRange,
        msg: String,
    },
}

/// Diagnostics sink that records every event in order.
#[derive(Debug, Clone, Default)]
pub struct CollectingDiagnostics {
    events: Vec<DiagnosticEvent>,
}

impl CollectingDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[DiagnosticEvent] {
        &self.events
    }

    /// Messages of all recorded warnings.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.events.iter().filter_map(|event| match event {
            DiagnosticEvent::Warning { msg, .. } => Some(msg.as_str()),
            DiagnosticEvent::Error { .. } => None,
        })
    }
}

impl Diagnostics for CollectingDiagnostics {
    fn on_warning(&mut self, kind: WarningKind, range: CodeRange, msg: &str) {
        self.events.push(DiagnosticEvent::Warning {
            kind,
            range,
            msg: msg.to_owned(),
        });
    }

    fn on_error(&mut self, kind: ErrorKind, range: CodeRange, msg: &str) {
        self.events.push(DiagnosticEvent::Error {
            kind,
            range,
            msg: msg.to_owned(),
        });
    }
}
