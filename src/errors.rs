// File: src/errors.rs
//
// Error handling and reporting for Smalt.
// Provides structured error types with source location information,
// attached VM call stacks, and pretty-printed error messages.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Types of errors that can occur in Smalt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParseError,
    CompileError,
    LoadError,
    RuntimeError,
    TypeError,
    UndefinedGlobal,
    DoesNotUnderstand,
    DivisionByZero,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ParseError => write!(f, "Parse Error"),
            ErrorKind::CompileError => write!(f, "Compile Error"),
            ErrorKind::LoadError => write!(f, "Load Error"),
            ErrorKind::RuntimeError => write!(f, "Runtime Error"),
            ErrorKind::TypeError => write!(f, "Type Error"),
            ErrorKind::UndefinedGlobal => write!(f, "Undefined Global"),
            ErrorKind::DoesNotUnderstand => write!(f, "Does Not Understand"),
            ErrorKind::DivisionByZero => write!(f, "Division By Zero"),
        }
    }
}

/// A structured error with location and call-stack information
#[derive(Debug, Clone)]
pub struct SmaltError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<SourceLocation>,
    pub source_line: Option<String>,
    /// Frames from the VM, innermost first: `name (selector) @ip`.
    pub call_stack: Vec<String>,
    pub suggestion: Option<String>,
    pub note: Option<String>,
}

impl SmaltError {
    pub fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            location: None,
            source_line: None,
            call_stack: Vec::new(),
            suggestion: None,
            note: None,
        }
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_call_stack(mut self, call_stack: Vec<String>) -> Self {
        self.call_stack = call_stack;
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }

    /// Create a parse error
    pub fn parse_error(message: String, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message).with_location(location)
    }

    /// Create a compile error
    pub fn compile_error(message: String) -> Self {
        Self::new(ErrorKind::CompileError, message)
    }

    /// Create a bytecode-load error
    pub fn load_error(message: String) -> Self {
        Self::new(ErrorKind::LoadError, message)
    }

    /// Create a runtime error
    pub fn runtime_error(message: String) -> Self {
        Self::new(ErrorKind::RuntimeError, message)
    }

    /// Create a type error
    pub fn type_error(message: String) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    /// Create an undefined-global error
    pub fn undefined_global(name: &str) -> Self {
        Self::new(ErrorKind::UndefinedGlobal, format!("Global '{}' is not defined", name))
    }

    /// Create a does-not-understand error
    pub fn does_not_understand(receiver_kind: &str, selector: &str) -> Self {
        Self::new(
            ErrorKind::DoesNotUnderstand,
            format!("{} does not understand #{}", receiver_kind, selector),
        )
    }

    /// Create a division-by-zero error
    pub fn division_by_zero() -> Self {
        Self::new(ErrorKind::DivisionByZero, "Division by zero".to_string())
    }
}

impl fmt::Display for SmaltError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} {}", format!("{}:", self.kind).red().bold(), self.message)?;

        if let Some(ref location) = self.location {
            writeln!(f, "    {} {}", "at".bright_blue(), location.to_string().bright_blue())?;
            if let Some(ref source) = self.source_line {
                let gutter = format!("{} |", location.line);
                writeln!(f, "    {} {}", gutter.bright_blue(), source)?;
                // Caret sits under the offending column of the source line.
                let lead = gutter.chars().count() + 1 + location.column.saturating_sub(1);
                writeln!(f, "    {}{}", " ".repeat(lead), "^".red().bold())?;
            }
        }

        if !self.call_stack.is_empty() {
            writeln!(f, "  {}", "stack (innermost first):".bright_blue())?;
            for frame in &self.call_stack {
                writeln!(f, "    {}", frame)?;
            }
        }

        if let Some(ref suggestion) = self.suggestion {
            writeln!(
                f,
                "  {}",
                format!("hint: did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        if let Some(ref note) = self.note {
            writeln!(f, "  {}", format!("note: {}", note).bright_cyan())?;
        }

        Ok(())
    }
}

impl std::error::Error for SmaltError {}

/// Edit distance between two identifier-ish strings, used to rank
/// misspelling candidates. Single-row dynamic program: `row[j]` holds the
/// distance between the processed prefix of `a` and `b[..j]`.
pub fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, &ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substituted = if ca == cb { diagonal } else { diagonal + 1 };
            diagonal = row[j + 1];
            row[j + 1] = substituted.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }
    row[b.len()]
}

/// Pick the candidate nearest to `target`, provided it is close enough to
/// read as a plausible typo. The allowed distance grows with the length of
/// the misspelled name, so short selectors only match near-exact slips.
pub fn closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    let cutoff = 1 + target.chars().count() / 4;
    candidates
        .iter()
        .map(|candidate| (levenshtein_distance(target, candidate), candidate))
        .filter(|(distance, _)| *distance <= cutoff)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_distance_basics() {
        assert_eq!(levenshtein_distance("", "abc"), 3);
        assert_eq!(levenshtein_distance("abc", ""), 3);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
        assert_eq!(levenshtein_distance("speak", "speak"), 0);
    }

    #[test]
    fn test_closest_match_prefers_nearest() {
        let candidates =
            vec!["speak".to_string(), "sleep".to_string(), "accelerate".to_string()];
        assert_eq!(closest_match("spaek", &candidates), Some("speak"));
        assert_eq!(closest_match("zzzzzzzz", &candidates), None);
        assert_eq!(closest_match("anything", &[]), None);
    }

    #[test]
    fn test_closest_match_cutoff_scales_with_length() {
        let candidates = vec!["at:put:".to_string()];
        // A one-character slip in a short selector still matches.
        assert_eq!(closest_match("at:putt:", &candidates), Some("at:put:"));
        // A short name never matches a far-away candidate.
        assert_eq!(closest_match("do:", &candidates), None);
    }

    #[test]
    fn test_error_builders_set_kind() {
        let err = SmaltError::does_not_understand("Integer", "frobnicate");
        assert_eq!(err.kind, ErrorKind::DoesNotUnderstand);
        assert!(err.message.contains("#frobnicate"));

        let err = SmaltError::division_by_zero();
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
    }
}
