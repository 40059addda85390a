#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

use crate::ast::Span;

/// A recoverable syntax error.
///
/// Errors are recorded while the parser keeps going, so a file with errors
/// still yields a partial `Suite`.
#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("Syntax error: {message}")]
    #[diagnostic(code(scaf::parse::syntax))]
    Syntax {
        message: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
        location: Span,
    },

    #[error("Unexpected token: expected {expected}, found {found}")]
    #[diagnostic(code(scaf::parse::unexpected))]
    UnexpectedToken {
        expected: String,
        found: String,
        #[label("unexpected token")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
        location: Span,
    },

    #[error("Unterminated {what}")]
    #[diagnostic(
        code(scaf::parse::unterminated),
        help("add the missing closing delimiter")
    )]
    Unterminated {
        what: String,
        #[label("starts here")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
        location: Span,
    },

    #[error("Duplicate {clause} clause")]
    #[diagnostic(
        code(scaf::parse::duplicate_clause),
        help("merge both clauses into a single `{clause} {{ ... }}` block")
    )]
    DuplicateClause {
        clause: String,
        #[label("duplicate")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
        location: Span,
    },
}

fn source_span(span: Span) -> miette::SourceSpan {
    (span.start.offset, span.len()).into()
}

fn empty_source() -> miette::NamedSource<String> {
    miette::NamedSource::new("", String::new())
}

impl ParseError {
    pub fn syntax(message: impl Into<String>, location: Span) -> Self {
        ParseError::Syntax {
            message: message.into(),
            span: source_span(location),
            src: empty_source(),
            location,
        }
    }

    pub fn unexpected(expected: impl Into<String>, found: impl Into<String>, location: Span) -> Self {
        ParseError::UnexpectedToken {
            expected: expected.into(),
            found: found.into(),
            span: source_span(location),
            src: empty_source(),
            location,
        }
    }

    pub fn unterminated(what: impl Into<String>, location: Span) -> Self {
        ParseError::Unterminated {
            what: what.into(),
            span: source_span(location),
            src: empty_source(),
            location,
        }
    }

    pub fn duplicate_clause(clause: impl Into<String>, location: Span) -> Self {
        ParseError::DuplicateClause {
            clause: clause.into(),
            span: source_span(location),
            src: empty_source(),
            location,
        }
    }

    /// Where the error was detected, in parser coordinates.
    pub fn location(&self) -> Span {
        match self {
            ParseError::Syntax { location, .. }
            | ParseError::UnexpectedToken { location, .. }
            | ParseError::Unterminated { location, .. }
            | ParseError::DuplicateClause { location, .. } => *location,
        }
    }

    /// Stable code matching the miette diagnostic code.
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::Syntax { .. } => "scaf::parse::syntax",
            ParseError::UnexpectedToken { .. } => "scaf::parse::unexpected",
            ParseError::Unterminated { .. } => "scaf::parse::unterminated",
            ParseError::DuplicateClause { .. } => "scaf::parse::duplicate_clause",
        }
    }

    /// Attach source text and filename so miette can render a snippet.
    ///
    /// Errors are built without the source to keep recovery cheap.
    pub fn with_source_context(self, source: &str, filename: &str) -> Self {
        let src = miette::NamedSource::new(filename, source.to_owned());
        match self {
            ParseError::Syntax {
                message,
                span,
                location,
                ..
            } => ParseError::Syntax {
                message,
                span,
                src,
                location,
            },
            ParseError::UnexpectedToken {
                expected,
                found,
                span,
                location,
                ..
            } => ParseError::UnexpectedToken {
                expected,
                found,
                span,
                src,
                location,
            },
            ParseError::Unterminated {
                what,
                span,
                location,
                ..
            } => ParseError::Unterminated {
                what,
                span,
                src,
                location,
            },
            ParseError::DuplicateClause {
                clause,
                span,
                location,
                ..
            } => ParseError::DuplicateClause {
                clause,
                span,
                src,
                location,
            },
        }
    }
}
