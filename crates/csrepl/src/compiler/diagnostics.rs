//! Compiler diagnostics.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Code used for faults of the compiler machinery itself rather than the source.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";

/// Diagnostic severity as reported by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Compilation cannot succeed.
    Error,
    /// Suspicious but compilable.
    Warning,
    /// Informational; never surfaced to callers.
    Info,
}

/// One compiler-reported issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// Identifier such as `CS1002`, or [`VALIDATION_ERROR`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Severity.
    pub severity: Severity,
    /// 1-based line, if the compiler reported a location.
    pub line: Option<u32>,
    /// 1-based column, if the compiler reported a location.
    pub column: Option<u32>,
}

impl Diagnostic {
    /// A located or unlocated error diagnostic.
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            severity: Severity::Error,
            line: None,
            column: None,
        }
    }

    /// A synthetic diagnostic for a fault inside the compilation machinery.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::error(VALIDATION_ERROR, message)
    }

    /// Attach a 1-based location. Zero is clamped to 1.
    #[must_use]
    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line.max(1));
        self.column = Some(column.max(1));
        self
    }

    /// Whether this diagnostic fails the compilation.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// `line L, column C`, or `unknown location`.
    #[must_use]
    pub fn location(&self) -> String {
        match (self.line, self.column) {
            (Some(line), Some(column)) => format!("line {line}, column {column}"),
            (Some(line), None) => format!("line {line}"),
            _ => "unknown location".to_string(),
        }
    }

    /// One-line summary: `{code}: {message} at {location}`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{}: {} at {}", self.code, self.message, self.location())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

// `Program.cs(3,9): error CS1002: ; expected`
// `CSC : error CS5001: Program does not contain a static 'Main' method ...`
// `warning CS8981: ...`
static DIAGNOSTIC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(
        r"^(?:.+?\((?P<line>\d+),(?P<col>\d+)(?:,\d+,\d+)?\)\s*:|(?:[^:]*:)?)\s*(?P<sev>fatal error|error|warning|info)\s+(?P<code>[A-Z]+\d+)\s*:\s*(?P<msg>.*)$",
    )
    .expect("diagnostic pattern is valid")
});

/// Parse command-line compiler output into diagnostics, in emission order.
///
/// Lines that aren't diagnostics are ignored. Info entries are kept; callers
/// go through [`surfaced`] before handing diagnostics out.
#[must_use]
pub fn parse_compiler_output(text: &str) -> Vec<Diagnostic> {
    text.lines()
        .filter_map(|line| {
            let caps = DIAGNOSTIC_LINE.captures(line.trim_end())?;
            let severity = match &caps["sev"] {
                "warning" => Severity::Warning,
                "info" => Severity::Info,
                _ => Severity::Error,
            };
            let mut diagnostic = Diagnostic {
                code: caps["code"].to_string(),
                message: caps["msg"].trim().to_string(),
                severity,
                line: None,
                column: None,
            };
            if let (Some(line), Some(col)) = (caps.name("line"), caps.name("col")) {
                if let (Ok(line), Ok(col)) = (line.as_str().parse(), col.as_str().parse()) {
                    diagnostic = diagnostic.at(line, col);
                }
            }
            Some(diagnostic)
        })
        .collect()
}

/// Keep Error and Warning entries in their original order; drop Info.
#[must_use]
pub fn surfaced(diagnostics: Vec<Diagnostic>) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .filter(|d| d.severity != Severity::Info)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_located_error() {
        let diags = parse_compiler_output("/tmp/x/Program.cs(1,6): error CS1002: ; expected");
        assert_eq!(diags.len(), 1);
        let d = &diags[0];
        assert_eq!(d.code, "CS1002");
        assert_eq!(d.message, "; expected");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!((d.line, d.column), (Some(1), Some(6)));
    }

    #[test]
    fn parses_unlocated_and_tool_prefixed_lines() {
        let text = "\
error CS5001: Program does not contain a static 'Main' method suitable for an entry point
CSC : error CS2001: Source file 'x.cs' could not be found.
";
        let diags = parse_compiler_output(text);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].code, "CS5001");
        assert!(diags[0].line.is_none());
        assert_eq!(diags[1].code, "CS2001");
    }

    #[test]
    fn parses_end_locations_and_windows_paths() {
        let text = r"C:\work\Program.cs(12,3,12,9): warning CS0168: The variable 'e' is declared but never used";
        let diags = parse_compiler_output(text);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!((diags[0].line, diags[0].column), (Some(12), Some(3)));
    }

    #[test]
    fn ignores_noise() {
        let text = "Microsoft (R) Visual C# Compiler version 4.8.0\n\nsomething went sideways\n";
        assert!(parse_compiler_output(text).is_empty());
    }

    #[test]
    fn info_is_dropped_and_order_is_kept() {
        let text = "\
Program.cs(1,1): warning CS0001: first
Program.cs(2,1): info CS0002: hidden
Program.cs(3,1): error CS0003: second
Program.cs(4,1): warning CS0004: third
";
        let codes: Vec<_> = surfaced(parse_compiler_output(text))
            .into_iter()
            .map(|d| d.code)
            .collect();
        assert_eq!(codes, ["CS0001", "CS0003", "CS0004"]);
    }

    #[test]
    fn location_is_clamped_to_one() {
        let d = Diagnostic::error("CS0000", "x").at(0, 0);
        assert_eq!((d.line, d.column), (Some(1), Some(1)));
    }

    #[test]
    fn summary_shape() {
        let d = Diagnostic::error("CS1002", "; expected").at(3, 9);
        assert_eq!(d.summary(), "CS1002: ; expected at line 3, column 9");
        assert_eq!(
            Diagnostic::internal("boom").summary(),
            "VALIDATION_ERROR: boom at unknown location"
        );
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(Diagnostic::error("CS1", "m").at(1, 2)).unwrap_or_default();
        assert_eq!(json["severity"], "Error");
        assert_eq!(json["line"], 1);
        assert_eq!(json["column"], 2);
    }
}
