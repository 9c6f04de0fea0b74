use std::fmt;

/// Which stage of the pipeline produced a `Report`. Lex errors are
/// surfaced through the compiler as synthetic `ERROR` tokens, so in
/// practice `Lexing` and `Compiling` reports look identical to callers;
/// the tag is kept distinct because the two are conceptually different
/// failure sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lexing,
    Compiling,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Lexing => write!(f, "lex"),
            Phase::Compiling => write!(f, "compile"),
            Phase::Runtime => write!(f, "runtime"),
        }
    }
}

/// A single diagnostic. `message` is fully formed prose (already
/// including things like "at 'x'" where relevant); `line` is the
/// 1-based source line it applies to.
#[derive(Debug, Clone)]
pub struct Report {
    pub phase: Phase,
    pub message: String,
    pub line: u32,
}

impl Report {
    pub fn new(phase: Phase, message: impl Into<String>, line: u32) -> Self {
        Report { phase, message: message.into(), line }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Phase::Runtime => write!(f, "{}", self.message),
            Phase::Lexing | Phase::Compiling => write!(f, "[line {}] {}", self.line, self.message),
        }
    }
}

/// Diagnostics sink. The scanner/compiler/VM never touch stdio
/// directly — they report through this trait, so the CLI's
/// stdout/stderr formatting is swappable and tests can substitute a
/// reporter that records rather than prints.
pub trait Reporter {
    fn warning(&mut self, report: Report);
    fn error(&mut self, report: Report);
}

/// A reporter that drops everything. Useful as a default when a caller
/// genuinely doesn't care about diagnostics (e.g. a throwaway `compile`
/// in a test that only inspects the resulting chunk).
pub struct NullReporter;

impl Reporter for NullReporter {
    fn warning(&mut self, _report: Report) {}
    fn error(&mut self, _report: Report) {}
}

/// Records every report instead of printing it. The VM/compiler test
/// suites use this to assert on diagnostics without capturing stdio.
#[derive(Default)]
pub struct CapturingReporter {
    pub warnings: Vec<Report>,
    pub errors: Vec<Report>,
}

impl Reporter for CapturingReporter {
    fn warning(&mut self, report: Report) {
        self.warnings.push(report);
    }

    fn error(&mut self, report: Report) {
        self.errors.push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_report_displays_with_line_prefix() {
        let report = Report::new(Phase::Compiling, "Error at ';': expected expression.", 3);
        assert_eq!(report.to_string(), "[line 3] Error at ';': expected expression.");
    }

    #[test]
    fn runtime_report_displays_raw_message() {
        let report = Report::new(Phase::Runtime, "RuntimeError: boom.\n[line 1] in script", 1);
        assert_eq!(report.to_string(), "RuntimeError: boom.\n[line 1] in script");
    }

    #[test]
    fn capturing_reporter_records_without_printing() {
        let mut reporter = CapturingReporter::default();
        reporter.error(Report::new(Phase::Compiling, "bad", 1));
        reporter.warning(Report::new(Phase::Runtime, "heads up", 2));
        assert_eq!(reporter.errors.len(), 1);
        assert_eq!(reporter.warnings.len(), 1);
    }
}
