//! Optional diagnostics dump for hosts that want structured rather than
//! human-rendered compiler output: the warnings collected on
//! [`crate::PokeCompiler::warnings`], rendered either as a short
//! human-readable block (always available) or as JSON (behind the
//! `report-json` feature).

use poke_compiler::CompileError;

/// Severity of a single reported diagnostic. Only `Warning` is produced
/// today, since a hard error aborts the compile before `warnings()` is
/// populated and is surfaced to the host as an `Err` instead; the variant
/// exists so a future diagnostic source (e.g. a non-fatal IOS notice)
/// has somewhere to report through without a new enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
}

/// One diagnostic, detached from the `CompileError` it was built from so
/// it can be serialized without pulling in the compiler crate's error
/// machinery.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: Option<String>,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl From<&CompileError> for Diagnostic {
    fn from(err: &CompileError) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            file: err.loc.file.as_ref().map(|p| p.display().to_string()),
            line: err.loc.line,
            column: err.loc.column,
            message: err.message.clone(),
        }
    }
}

/// Renders a human-readable block, one line per diagnostic, e.g.
/// `warning: 3:1: useless endianness annotation on scalar field`.
pub fn dump_human(diagnostics: &[CompileError]) -> String {
    let mut out = String::new();
    for err in diagnostics {
        let d = Diagnostic::from(err);
        let severity = match d.severity {
            Severity::Warning => "warning",
        };
        match &d.file {
            Some(file) => {
                out.push_str(&format!("{severity}: {file}:{}:{}: {}\n", d.line, d.column, d.message));
            }
            None => {
                out.push_str(&format!("{severity}: {}:{}: {}\n", d.line, d.column, d.message));
            }
        }
    }
    out
}

#[cfg(feature = "report-json")]
pub fn dump_json(diagnostics: &[CompileError]) -> String {
    let items: Vec<serde_json::Value> = diagnostics
        .iter()
        .map(|err| {
            let d = Diagnostic::from(err);
            serde_json::json!({
                "severity": match d.severity { Severity::Warning => "warning" },
                "file": d.file,
                "line": d.line,
                "column": d.column,
                "message": d.message,
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use poke_compiler::ast::SourceLocation;

    #[test]
    fn human_dump_includes_location_and_message() {
        let err = CompileError::new(SourceLocation::new(3, 1), "useless endianness annotation");
        let out = dump_human(std::slice::from_ref(&err));
        assert!(out.contains("3:1"));
        assert!(out.contains("useless endianness annotation"));
    }

    #[cfg(feature = "report-json")]
    #[test]
    fn json_dump_round_trips_through_serde_json() {
        let err = CompileError::new(SourceLocation::new(1, 2), "unreachable union alternative");
        let out = dump_json(std::slice::from_ref(&err));
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed[0]["line"], 1);
        assert_eq!(parsed[0]["message"], "unreachable union alternative");
    }
}
