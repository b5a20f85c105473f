//! Diagnostic sink through which the core reports errors.
//!
//! The core never prints. Every [`CompilationError`] is handed to the sink
//! supplied by the embedder before it propagates to the caller.

use crate::error::CompilationError;
use crate::location::Location;

/// Receives `(location, message)` reports.
pub trait DiagnosticSink {
    fn report(&mut self, location: Option<&Location>, message: &str);
}

impl<F> DiagnosticSink for F
where
    F: FnMut(Option<&Location>, &str),
{
    fn report(&mut self, location: Option<&Location>, message: &str) {
        self(location, message)
    }
}

/// A sink that discards every report.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&mut self, _location: Option<&Location>, _message: &str) {}
}

/// A sink that stores reports in memory.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    pub reports: Vec<(Option<Location>, String)>,
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, location: Option<&Location>, message: &str) {
        self.reports.push((location.copied(), message.to_owned()));
    }
}

/// Hands `err` to `sink` and returns it for propagation.
pub fn report(sink: &mut dyn DiagnosticSink, err: CompilationError) -> CompilationError {
    sink.report(err.location.as_ref(), &err.to_string());
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;

    #[test]
    fn collecting_sink_records_location() {
        let mut sink = CollectingSink::default();
        let loc = Location::line(7, 3, 10);
        let err = report(
            &mut sink,
            CompilationError::new(Status::IrScalarMismatch).at(Some(loc)),
        );
        assert_eq!(err.status, Status::IrScalarMismatch);
        assert_eq!(sink.reports.len(), 1);
        assert_eq!(sink.reports[0].0, Some(loc));
        assert!(sink.reports[0].1.contains("scalar types"));
    }

    #[test]
    fn closure_sink() {
        let mut seen = Vec::new();
        let mut sink = |_: Option<&Location>, msg: &str| seen.push(msg.to_owned());
        report(&mut sink, CompilationError::new(Status::BadAlloc));
        assert_eq!(seen, vec!["bad allocation".to_owned()]);
    }
}
