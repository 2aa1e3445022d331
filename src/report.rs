//! Diagnostic sink for the whole pipeline.
//!
//! Every pass reports through a [`Reporter`] instead of printing directly or
//! flipping global flags. Recoverable problems mark the compilation as failed
//! and let the pass continue gathering diagnostics; unrecoverable ones return
//! the [`Fatal`] marker which callers propagate with `?`. The driver turns a
//! set failed flag or a `Fatal` into exit code 1.

use std::cell::{Cell, RefCell};

use colored::Colorize;

use crate::frontend::Location;

/// Marker for an error that has already been reported and aborts the
/// current pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fatal;

pub type CResult<T> = Result<T, Fatal>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Command,
    CompilerBug,
    Error,
    Info,
    Warning,
    Optimization,
}

impl ReportKind {
    fn name(self) -> &'static str {
        match self {
            ReportKind::Command => "cmd",
            ReportKind::CompilerBug => "compiler bug",
            ReportKind::Error => "error",
            ReportKind::Info => "info",
            ReportKind::Warning => "warning",
            ReportKind::Optimization => "optimized",
        }
    }

    fn colored_name(self) -> String {
        match self {
            ReportKind::Command | ReportKind::Info | ReportKind::Optimization => {
                self.name().blue().bold().to_string()
            }
            ReportKind::Error | ReportKind::CompilerBug => self.name().red().bold().to_string(),
            ReportKind::Warning => self.name().magenta().bold().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ReportKind,
    pub location: Option<Location>,
    pub message: String,
}

#[derive(Debug)]
pub struct Reporter {
    colors: bool,
    verbose: bool,
    print: bool,
    failed: Cell<bool>,
    entries: RefCell<Vec<Diagnostic>>,
}

impl Reporter {
    pub fn new(colors: bool, verbose: bool) -> Self {
        Self {
            colors,
            verbose,
            print: true,
            failed: Cell::new(false),
            entries: RefCell::new(Vec::new()),
        }
    }

    /// A reporter that records diagnostics without printing them. Used by
    /// tests to assert on emitted messages.
    pub fn silent() -> Self {
        Self {
            colors: false,
            verbose: false,
            print: false,
            failed: Cell::new(false),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn compilation_failed(&self) -> bool {
        self.failed.get()
    }

    /// Formatted copies of every diagnostic reported so far.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .borrow()
            .iter()
            .map(|d| self.format(d, false))
            .collect()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.entries.borrow().clone()
    }

    fn format(&self, diagnostic: &Diagnostic, colors: bool) -> String {
        let kind = if colors {
            diagnostic.kind.colored_name()
        } else {
            diagnostic.kind.name().to_string()
        };

        match diagnostic.location {
            Some(location) => format!("{}: {}: {}", location, kind, diagnostic.message),
            None => format!("stacky: {}: {}", kind, diagnostic.message),
        }
    }

    fn report(&self, kind: ReportKind, location: Option<Location>, message: String) {
        if matches!(kind, ReportKind::Error | ReportKind::CompilerBug) {
            self.failed.set(true);
        }

        let diagnostic = Diagnostic {
            kind,
            location,
            message,
        };

        if self.print {
            eprintln!("{}", self.format(&diagnostic, self.colors));
        }

        self.entries.borrow_mut().push(diagnostic);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.report(ReportKind::Error, None, message.into());
    }

    pub fn error_at(&self, location: Location, message: impl Into<String>) {
        self.report(ReportKind::Error, Some(location), message.into());
    }

    /// Reports an error and hands back the marker to return with `Err(..)`.
    pub fn fatal(&self, message: impl Into<String>) -> Fatal {
        self.error(message);
        Fatal
    }

    pub fn fatal_at(&self, location: Location, message: impl Into<String>) -> Fatal {
        self.error_at(location, message);
        Fatal
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.report(ReportKind::Warning, None, message.into());
    }

    pub fn warning_at(&self, location: Location, message: impl Into<String>) {
        self.report(ReportKind::Warning, Some(location), message.into());
    }

    pub fn info(&self, message: impl Into<String>) {
        self.report(ReportKind::Info, None, message.into());
    }

    pub fn info_at(&self, location: Location, message: impl Into<String>) {
        self.report(ReportKind::Info, Some(location), message.into());
    }

    pub fn command(&self, message: impl Into<String>) {
        self.report(ReportKind::Command, None, message.into());
    }

    /// Optimizer progress notes, only emitted in verbose mode.
    pub fn optimized(&self, message: impl Into<String>) {
        if self.verbose {
            self.report(ReportKind::Optimization, None, message.into());
        }
    }

    pub fn optimized_at(&self, location: Location, message: impl Into<String>) {
        if self.verbose {
            self.report(ReportKind::Optimization, Some(location), message.into());
        }
    }

    pub fn compiler_bug(&self, message: impl Into<String>) -> Fatal {
        self.report(ReportKind::CompilerBug, None, message.into());
        Fatal
    }

    pub fn compiler_bug_at(&self, location: Location, message: impl Into<String>) -> Fatal {
        self.report(ReportKind::CompilerBug, Some(location), message.into());
        Fatal
    }
}
