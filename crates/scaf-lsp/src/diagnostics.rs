//! Conversion of analysis diagnostics into LSP diagnostics.

use tower_lsp::lsp_types::*;

use crate::analysis::{self, Severity};
use crate::document::Document;
use crate::utils::span_to_range;

/// Value of the `source` field on every published diagnostic.
pub const DIAGNOSTIC_SOURCE: &str = "scaf";

fn severity(severity: Severity) -> DiagnosticSeverity {
    match severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warning => DiagnosticSeverity::WARNING,
        Severity::Hint => DiagnosticSeverity::HINT,
    }
}

pub(crate) fn to_lsp_diagnostic(source: &str, diag: &analysis::Diagnostic) -> Diagnostic {
    let tags = (diag.code == analysis::codes::UNUSED_IMPORT).then(|| vec![DiagnosticTag::UNNECESSARY]);
    Diagnostic {
        range: span_to_range(source, diag.span),
        severity: Some(severity(diag.severity)),
        code: Some(NumberOrString::String(diag.code.to_string())),
        source: Some(DIAGNOSTIC_SOURCE.into()),
        message: diag.message.clone(),
        tags,
        ..Default::default()
    }
}

/// Diagnostics of the document's current analysis, in source order.
pub fn document_diagnostics(doc: &Document) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = doc
        .analysis
        .diagnostics
        .iter()
        .map(|d| to_lsp_diagnostic(&doc.content, d))
        .collect();
    diagnostics.sort_by_key(|d| (d.range.start.line, d.range.start.character));
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::Workspace;

    #[test]
    fn codes_and_severities_are_carried() {
        let src = "import f \"./f\"\nMissing {\n  test \"t\" {}\n}\n";
        let doc = Workspace::default().update(Url::parse("untitled:main").unwrap(), 1, src.to_string());
        let diagnostics = document_diagnostics(&doc);

        let unused = diagnostics
            .iter()
            .find(|d| d.code == Some(NumberOrString::String("unused-import".into())))
            .unwrap();
        assert_eq!(unused.severity, Some(DiagnosticSeverity::WARNING));
        assert_eq!(unused.tags, Some(vec![DiagnosticTag::UNNECESSARY]));
        assert_eq!(unused.range.start, Position::new(0, 0));

        let undefined = diagnostics
            .iter()
            .find(|d| d.code == Some(NumberOrString::String("undefined-query".into())))
            .unwrap();
        assert_eq!(undefined.severity, Some(DiagnosticSeverity::ERROR));
        assert_eq!(undefined.message, "undefined query 'Missing'");
        assert!(diagnostics.iter().all(|d| d.source.as_deref() == Some("scaf")));
    }
}
