//! Quick-fixes keyed by diagnostic code.
//!
//! Several fixes read their inputs back out of the diagnostic message, so the
//! message formats in `analysis` are part of the contract with this module.

use std::collections::HashMap;

use tower_lsp::lsp_types::*;

use crate::analysis::{codes, MISSING_PARAMS_PREFIX};
use crate::document::Document;
use crate::utils::{extract_quoted_name, find_closest, line_indent, offset_to_position, position_to_offset};

/// Body used for a query declaration created by a quick-fix.
const PLACEHOLDER_BODY: &str = "MATCH (n) RETURN n";

fn diagnostic_code(diag: &Diagnostic) -> Option<&str> {
    match diag.code.as_ref()? {
        NumberOrString::String(s) => Some(s.as_str()),
        NumberOrString::Number(_) => None,
    }
}

fn quick_fix(
    uri: &Url,
    title: String,
    diag: &Diagnostic,
    edits: Vec<TextEdit>,
    preferred: bool,
) -> CodeActionOrCommand {
    let mut changes = HashMap::new();
    changes.insert(uri.clone(), edits);
    CodeActionOrCommand::CodeAction(CodeAction {
        title,
        kind: Some(CodeActionKind::QUICKFIX),
        diagnostics: Some(vec![diag.clone()]),
        edit: Some(WorkspaceEdit {
            changes: Some(changes),
            ..Default::default()
        }),
        is_preferred: preferred.then_some(true),
        ..Default::default()
    })
}

pub fn code_actions(doc: &Document, diagnostics: &[Diagnostic]) -> Vec<CodeActionOrCommand> {
    diagnostics
        .iter()
        .flat_map(|diag| actions_for(doc, diag))
        .collect()
}

pub fn actions_for(doc: &Document, diag: &Diagnostic) -> Vec<CodeActionOrCommand> {
    match diagnostic_code(diag) {
        Some(codes::UNUSED_IMPORT) => remove_import(doc, diag).into_iter().collect(),
        Some(codes::UNDEFINED_QUERY) => undefined_query(doc, diag),
        Some(codes::MISSING_REQUIRED_PARAMS) => add_missing_params(doc, diag).into_iter().collect(),
        Some(codes::UNDEFINED_SETUP_QUERY) => undefined_setup_query(doc, diag).into_iter().collect(),
        Some(codes::UNDEFINED_IMPORT) => undefined_import(doc, diag).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Delete every line the import spans, newline included.
fn remove_import(doc: &Document, diag: &Diagnostic) -> Option<CodeActionOrCommand> {
    let text = &doc.content;
    let start = position_to_offset(text, Position::new(diag.range.start.line, 0));
    let end_line_start = position_to_offset(text, Position::new(diag.range.end.line, 0));
    let end = match text[end_line_start..].find('\n') {
        Some(i) => end_line_start + i + 1,
        None => text.len(),
    };
    let range = Range::new(offset_to_position(text, start), offset_to_position(text, end));
    let name = extract_quoted_name(&diag.message)?;
    Some(quick_fix(
        &doc.uri,
        format!("Remove unused import '{name}'"),
        diag,
        vec![TextEdit::new(range, String::new())],
        true,
    ))
}

fn replace_with(doc: &Document, diag: &Diagnostic, suggestion: &str) -> CodeActionOrCommand {
    quick_fix(
        &doc.uri,
        format!("Replace with '{suggestion}'"),
        diag,
        vec![TextEdit::new(diag.range, suggestion.to_string())],
        false,
    )
}

fn undefined_query(doc: &Document, diag: &Diagnostic) -> Vec<CodeActionOrCommand> {
    let Some(name) = extract_quoted_name(&diag.message) else {
        return Vec::new();
    };
    let mut actions = vec![create_query(doc, diag, name)];
    let known = doc.symbol_analysis().symbols.query_names();
    if let Some(suggestion) = find_closest(name, &known) {
        actions.push(replace_with(doc, diag, suggestion));
    }
    actions
}

/// Declare the query after the last query, else after the imports, else at
/// the top of the file.
fn create_query(doc: &Document, diag: &Diagnostic, name: &str) -> CodeActionOrCommand {
    let suite = &doc.analysis.suite;
    let declaration = format!("query {name} `{PLACEHOLDER_BODY}`");
    let anchor = suite
        .queries
        .iter()
        .map(|q| q.span.end.offset)
        .max()
        .or_else(|| suite.imports.iter().map(|i| i.span.end.offset).max());
    let edit = match anchor {
        Some(offset) => {
            let position = offset_to_position(&doc.content, offset);
            TextEdit::new(Range::new(position, position), format!("\n\n{declaration}"))
        }
        None => TextEdit::new(
            Range::new(Position::new(0, 0), Position::new(0, 0)),
            format!("{declaration}\n\n"),
        ),
    };
    quick_fix(&doc.uri, format!("Create query '{name}'"), diag, vec![edit], true)
}

/// One `$param: ` line per missing parameter, under the test's first line.
fn add_missing_params(doc: &Document, diag: &Diagnostic) -> Option<CodeActionOrCommand> {
    let list = diag.message.split_once(MISSING_PARAMS_PREFIX)?.1;
    let params: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|p| p.starts_with('$') && p.len() > 1)
        .collect();
    if params.is_empty() {
        return None;
    }

    let line = diag.range.start.line;
    let base = line_indent(&doc.content, line);
    let step = if base.contains('\t') { "\t" } else { "    " };
    let indent = format!("{base}{step}");
    let mut new_text: String = params.iter().map(|p| format!("{indent}{p}: \n")).collect();

    // The test opens on the last line and has no line after it.
    let insert_at = if line as usize + 1 >= doc.content.lines().count() && !doc.content.ends_with('\n') {
        new_text.insert(0, '\n');
        offset_to_position(&doc.content, doc.content.len())
    } else {
        Position::new(line + 1, 0)
    };

    let title = if params.len() == 1 {
        format!("Add missing parameter {}", params[0])
    } else {
        format!("Add missing parameters {}", params.join(", "))
    };
    Some(quick_fix(
        &doc.uri,
        title,
        diag,
        vec![TextEdit::new(Range::new(insert_at, insert_at), new_text)],
        true,
    ))
}

/// Names listed after `(available: ` in an undefined-setup-query message.
fn available_names(message: &str) -> Vec<String> {
    let Some((_, rest)) = message.split_once("(available: ") else {
        return Vec::new();
    };
    let list = rest.strip_suffix(')').unwrap_or(rest);
    if list == "none" {
        return Vec::new();
    }
    list.split(", ").map(str::to_string).collect()
}

fn undefined_setup_query(doc: &Document, diag: &Diagnostic) -> Option<CodeActionOrCommand> {
    let name = extract_quoted_name(&diag.message)?;
    let available = available_names(&diag.message);
    let suggestion = find_closest(name, &available)?;
    Some(replace_with(doc, diag, suggestion))
}

fn undefined_import(doc: &Document, diag: &Diagnostic) -> Option<CodeActionOrCommand> {
    let name = extract_quoted_name(&diag.message)?;
    let aliases: Vec<String> = doc.symbol_analysis().symbols.imports.keys().cloned().collect();
    let suggestion = find_closest(name, &aliases)?;
    Some(replace_with(doc, diag, suggestion))
}
