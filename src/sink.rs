//! Error sinks: where validators and compilers send the problems they find.
//!
//! A sink decides what a diagnostic means for the call that produced it. Most sinks only record
//! or log; [`FailFastSink`] turns the first error into an aborting [`ValidationError::Aborted`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, warn};

use crate::error::{Result, ValidationError};
use crate::event::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>, location: Option<&Location>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: location.cloned(),
        }
    }

    pub fn warning(message: impl Into<String>, location: Option<&Location>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: location.cloned(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}: {}: {}", location, self.severity, self.message),
            None => write!(f, "{}: {}", self.severity, self.message),
        }
    }
}

/// Receives diagnostics in the order they are found.
///
/// Returning `Err` aborts the compile or validation call that reported the diagnostic.
pub trait ErrorSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic) -> Result<()>;
}

pub type SharedSink = Arc<dyn ErrorSink>;

/// Swallows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ErrorSink for NullSink {
    fn report(&self, _diagnostic: Diagnostic) -> Result<()> {
        Ok(())
    }
}

/// Keeps every diagnostic for later inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.diagnostics
            .lock()
            .iter()
            .map(|d| d.message.clone())
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.lock().iter().filter(|d| d.is_error()).count()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<()> {
        self.diagnostics.lock().push(diagnostic);
        Ok(())
    }
}

/// Logs diagnostics through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<()> {
        let location = diagnostic
            .location
            .as_ref()
            .map(Location::to_string)
            .unwrap_or_default();
        match diagnostic.severity {
            Severity::Warning => warn!(%location, "{}", diagnostic.message),
            Severity::Error | Severity::Fatal => error!(%location, "{}", diagnostic.message),
        }
        Ok(())
    }
}

/// Passes diagnostics to an inner sink, then aborts on the first error.
pub struct FailFastSink {
    inner: SharedSink,
}

impl FailFastSink {
    pub fn new(inner: SharedSink) -> Self {
        Self { inner }
    }
}

impl ErrorSink for FailFastSink {
    fn report(&self, diagnostic: Diagnostic) -> Result<()> {
        let abort = diagnostic.is_error();
        let message = diagnostic.to_string();
        self.inner.report(diagnostic)?;
        if abort {
            return Err(ValidationError::Aborted { message });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.report(Diagnostic::error("first", None)).unwrap();
        sink.report(Diagnostic::warning("second", None)).unwrap();
        sink.report(Diagnostic::error("third", None)).unwrap();

        assert_eq!(sink.messages(), vec!["first", "second", "third"]);
        assert_eq!(sink.error_count(), 2);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.diagnostics().is_empty());
    }

    #[test]
    fn test_fail_fast_sink_aborts_on_error_only() {
        let collected = Arc::new(CollectingSink::new());
        let sink = FailFastSink::new(collected.clone());

        assert!(sink.report(Diagnostic::warning("just a warning", None)).is_ok());
        let err = sink
            .report(Diagnostic::error("broken", Some(&Location::new(None, 3, 4))))
            .unwrap_err();
        match err {
            ValidationError::Aborted { message } => assert_eq!(message, "3:4: error: broken"),
            other => panic!("Expected Aborted, got {:?}", other),
        }
        // The inner sink still saw both.
        assert_eq!(collected.messages(), vec!["just a warning", "broken"]);
    }

    #[test]
    fn test_null_and_tracing_sinks_accept_everything() {
        assert!(NullSink.report(Diagnostic::error("x", None)).is_ok());
        assert!(TracingSink.report(Diagnostic::error("x", None)).is_ok());
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error("bad", None);
        assert_eq!(d.to_string(), "error: bad");
        assert!(d.is_error());
        assert!(!Diagnostic::warning("meh", None).is_error());
    }
}
