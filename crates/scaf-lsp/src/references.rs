//! Symbol classification and reference search.
//!
//! Every search runs over the current analysis of each file so ranges match
//! the live text. Setup-call queries are the only symbols whose references
//! cross files; everything else stays in the document it was found in.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use scaf_dsl::ast::*;
use thiserror::Error;
use tower_lsp::lsp_types::{Location, Position, Range, Url};

use crate::analysis::{default_alias, AnalyzedFile};
use crate::document::{uri_to_path, Document};
use crate::loader::{clean_path, FileLoader};
use crate::utils::{is_ident_char, offset_to_range, to_source_pos};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum ReferenceError {
    #[error("cannot build a file URI for {}", .0.display())]
    InvalidPath(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    Query,
    ImportAlias,
    /// Query name in `alias.Name(...)`.
    SetupQuery { alias: String },
    Parameter { query: String },
    ReturnField { query: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolAt {
    pub kind: SymbolKind,
    /// Parameters are named without their `$`.
    pub name: String,
    /// Span of the occurrence under the cursor.
    pub span: Span,
    /// The cursor is on the path of an import that has no explicit alias.
    pub derived_import: bool,
}

impl SymbolAt {
    fn new(kind: SymbolKind, name: &str, span: Span) -> Self {
        Self {
            kind,
            name: name.to_string(),
            span,
            derived_import: false,
        }
    }
}

/// One occurrence of a symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub uri: Url,
    pub range: Range,
    pub is_declaration: bool,
    /// Source text of the path literal when this occurrence is an import
    /// whose alias is derived from its path.
    pub derived_import: Option<String>,
}

pub fn symbol_at(file: &AnalyzedFile, position: Position) -> Option<SymbolAt> {
    symbol_at_pos(file, to_source_pos(&file.source, position))
}

pub fn symbol_at_pos(file: &AnalyzedFile, pos: SourcePos) -> Option<SymbolAt> {
    let suite = &file.suite;

    for import in &suite.imports {
        match (&import.alias, &import.path) {
            (Some(alias), _) if alias.span.touches(pos) => {
                return Some(SymbolAt::new(SymbolKind::ImportAlias, &alias.name, alias.span));
            }
            (None, Some(path)) if path.span.contains(pos) => {
                let alias = default_alias(&path.value)?;
                return Some(SymbolAt {
                    derived_import: true,
                    ..SymbolAt::new(SymbolKind::ImportAlias, &alias, path.span)
                });
            }
            _ => {}
        }
    }

    for query in &suite.queries {
        if query.name.span.touches(pos) {
            return Some(SymbolAt::new(SymbolKind::Query, &query.name.name, query.name.span));
        }
        if let Some(body) = &query.body {
            if body.span.contains(pos) {
                return in_query_body(file, query, body, pos);
            }
        }
    }

    for setup in suite.all_setups() {
        if !setup.span.touches(pos) {
            continue;
        }
        for item in &setup.items {
            match item {
                SetupItem::Module(ident) if ident.span.touches(pos) => {
                    return Some(SymbolAt::new(SymbolKind::ImportAlias, &ident.name, ident.span));
                }
                SetupItem::Call(call) => {
                    if call.module.span.touches(pos) {
                        return Some(SymbolAt::new(
                            SymbolKind::ImportAlias,
                            &call.module.name,
                            call.module.span,
                        ));
                    }
                    if let Some(query) = call.query.as_ref().filter(|q| q.span.touches(pos)) {
                        let kind = SymbolKind::SetupQuery {
                            alias: call.module.name.clone(),
                        };
                        return Some(SymbolAt::new(kind, &query.name, query.span));
                    }
                }
                _ => {}
            }
        }
    }

    for scope in &suite.scopes {
        if scope.query.span.touches(pos) {
            return Some(SymbolAt::new(SymbolKind::Query, &scope.query.name, scope.query.span));
        }
        if !scope.span.touches(pos) {
            continue;
        }
        for test in Suite::tests_in(scope) {
            if test.span.touches(pos) {
                if let Some(found) = in_test(file, &scope.query.name, test, pos) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn in_query_body(file: &AnalyzedFile, query: &Query, body: &QueryBody, pos: SourcePos) -> Option<SymbolAt> {
    let symbol = file.query(&query.name.name)?;
    // A shadowed duplicate has no symbol of its own.
    if symbol.body_offset != Some(body.text_offset()) {
        return None;
    }
    let meta = symbol.metadata.as_ref()?;
    let base = body.text_offset();
    let rel = pos.offset.checked_sub(base)?;
    let owner = query.name.name.clone();

    for param in &meta.parameters {
        let end = param.position + 1 + param.name.len();
        if (param.position..=end).contains(&rel) {
            let span = file.line_index.span(&file.source, base + param.position, base + end);
            let kind = SymbolKind::Parameter { query: owner };
            return Some(SymbolAt::new(kind, &param.name, span));
        }
    }
    for item in &meta.returns {
        let (start, end) = item.field_range();
        if (start..=end).contains(&rel) {
            let span = file.line_index.span(&file.source, base + start, base + end);
            let kind = SymbolKind::ReturnField { query: owner };
            return Some(SymbolAt::new(kind, item.field_name(), span));
        }
    }
    None
}

fn in_test(file: &AnalyzedFile, scope_query: &str, test: &Test, pos: SourcePos) -> Option<SymbolAt> {
    for statement in &test.statements {
        match &statement.key {
            StatementKey::Param(ident) if ident.span.touches(pos) => {
                let kind = SymbolKind::Parameter {
                    query: scope_query.to_string(),
                };
                return Some(SymbolAt::new(kind, ident.name.trim_start_matches('$'), ident.span));
            }
            StatementKey::Field(path) if path.span.touches(pos) => {
                let kind = SymbolKind::ReturnField {
                    query: scope_query.to_string(),
                };
                return Some(SymbolAt::new(kind, &path.text(), path.span));
            }
            _ => {}
        }
    }

    for assert in &test.asserts {
        match &assert.query {
            Some(AssertQuery::Named { name, args }) => {
                if name.span.touches(pos) {
                    return Some(SymbolAt::new(SymbolKind::Query, &name.name, name.span));
                }
                if let Some(arg) = args.iter().find(|a| a.name.span.touches(pos)) {
                    let kind = SymbolKind::Parameter {
                        query: name.name.clone(),
                    };
                    return Some(SymbolAt::new(kind, arg.name.name.trim_start_matches('$'), arg.name.span));
                }
            }
            Some(AssertQuery::Inline(_)) => {}
            None => {
                let Some(cond) = assert.conditions.iter().find(|c| c.span.contains(pos)) else {
                    continue;
                };
                let text = file.source.get(cond.span.start.offset..cond.span.end.offset)?;
                if string_mask(text.as_bytes())
                    .get(pos.offset - cond.span.start.offset)
                    .copied()
                    .unwrap_or(false)
                {
                    return None;
                }
                let (start, end) = dotted_word_at(&file.source, pos.offset, cond.span);
                let word = file.source.get(start..end)?;
                let query = file.query(scope_query)?;
                query.metadata.as_ref()?.return_item(word)?;
                let kind = SymbolKind::ReturnField {
                    query: scope_query.to_string(),
                };
                return Some(SymbolAt::new(kind, word, file.line_index.span(&file.source, start, end)));
            }
        }
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    is_ident_char(b) || b == b'.'
}

/// Dotted identifier around `offset`, kept inside `within`.
fn dotted_word_at(text: &str, offset: usize, within: Span) -> (usize, usize) {
    let bytes = text.as_bytes();
    let lo = within.start.offset;
    let hi = within.end.offset.min(bytes.len());
    let mut start = offset.min(hi);
    while start > lo && is_word_byte(bytes[start - 1]) {
        start -= 1;
    }
    let mut end = offset.min(hi);
    while end < hi && is_word_byte(bytes[end]) {
        end += 1;
    }
    while start < end && bytes[start] == b'.' {
        start += 1;
    }
    while end > start && bytes[end - 1] == b'.' {
        end -= 1;
    }
    (start, end)
}

/// Per byte: true inside a `"..."` or `'...'` literal, quotes included.
fn string_mask(bytes: &[u8]) -> Vec<bool> {
    let mut mask = vec![false; bytes.len()];
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                mask[i] = true;
                if b == b'\\' && i + 1 < bytes.len() {
                    mask[i + 1] = true;
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None if b == b'"' || b == b'\'' => {
                mask[i] = true;
                quote = Some(b);
            }
            None => {}
        }
        i += 1;
    }
    mask
}

/// Offsets of `word` in `text` not embedded in a longer identifier and not
/// inside a string literal.
fn word_matches(text: &str, word: &str) -> Vec<usize> {
    if word.is_empty() {
        return Vec::new();
    }
    let bytes = text.as_bytes();
    let in_string = string_mask(bytes);
    text.match_indices(word)
        .map(|(i, _)| i)
        .filter(|&i| !in_string[i])
        .filter(|&i| {
            let before_ok = i == 0 || !(is_word_byte(bytes[i - 1]) || bytes[i - 1] == b'$');
            let after = i + word.len();
            let after_ok = after >= bytes.len() || !is_ident_char(bytes[after]);
            before_ok && after_ok
        })
        .collect()
}

#[derive(Default)]
struct Collector {
    refs: Vec<Reference>,
    seen: HashSet<(String, u32, u32, u32, u32)>,
}

impl Collector {
    fn add(&mut self, uri: &Url, file: &AnalyzedFile, start: usize, end: usize, is_declaration: bool) {
        self.add_with(uri, file, start, end, is_declaration, None);
    }

    fn add_span(&mut self, uri: &Url, file: &AnalyzedFile, span: Span, is_declaration: bool) {
        self.add(uri, file, span.start.offset, span.end.offset, is_declaration);
    }

    fn add_with(
        &mut self,
        uri: &Url,
        file: &AnalyzedFile,
        start: usize,
        end: usize,
        is_declaration: bool,
        derived_import: Option<String>,
    ) {
        let range = offset_to_range(&file.source, start, end);
        // Two URI spellings of one file share a path.
        let identity = match uri_to_path(uri) {
            Some(path) => path.to_string_lossy().into_owned(),
            None => uri.to_string(),
        };
        let key = (
            identity,
            range.start.line,
            range.start.character,
            range.end.line,
            range.end.character,
        );
        if self.seen.insert(key) {
            self.refs.push(Reference {
                uri: uri.clone(),
                range,
                is_declaration,
                derived_import,
            });
        }
    }
}

/// Every occurrence of the symbol under the cursor, as editor locations.
pub fn find_references(
    workspace: &Workspace,
    doc: &Document,
    position: Position,
    include_declaration: bool,
) -> Vec<Location> {
    let Some(symbol) = symbol_at(&doc.analysis, position) else {
        return Vec::new();
    };
    match collect_references(workspace, doc, &symbol, include_declaration) {
        Ok(refs) => refs
            .into_iter()
            .map(|r| Location::new(r.uri, r.range))
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, symbol = %symbol.name, "reference search failed");
            Vec::new()
        }
    }
}

pub fn collect_references(
    workspace: &Workspace,
    doc: &Document,
    symbol: &SymbolAt,
    include_declaration: bool,
) -> Result<Vec<Reference>, ReferenceError> {
    let mut collector = Collector::default();
    let file = &doc.analysis;
    let uri = &doc.uri;

    match &symbol.kind {
        SymbolKind::Query => query_refs(&mut collector, uri, file, &symbol.name, include_declaration),
        SymbolKind::ImportAlias => alias_refs(&mut collector, uri, file, &symbol.name, include_declaration),
        SymbolKind::SetupQuery { alias } => {
            setup_query_refs(&mut collector, workspace, doc, alias, &symbol.name, include_declaration)?
        }
        SymbolKind::Parameter { query } => {
            parameter_refs(&mut collector, uri, file, query, &symbol.name, include_declaration)
        }
        SymbolKind::ReturnField { query } => {
            return_field_refs(&mut collector, uri, file, query, &symbol.name, include_declaration)
        }
    }

    tracing::debug!(
        symbol = %symbol.name,
        kind = ?symbol.kind,
        count = collector.refs.len(),
        "collected references"
    );
    Ok(collector.refs)
}

fn scopes_for<'a>(suite: &'a Suite, query: &'a str) -> impl Iterator<Item = &'a QueryScope> {
    suite.scopes.iter().filter(move |s| s.query.name == query)
}

fn all_tests(suite: &Suite) -> impl Iterator<Item = &Test> {
    suite.scopes.iter().flat_map(Suite::tests_in)
}

fn query_refs(c: &mut Collector, uri: &Url, file: &AnalyzedFile, name: &str, include_declaration: bool) {
    let suite = &file.suite;
    if include_declaration {
        for query in suite.queries.iter().filter(|q| q.name.name == name) {
            c.add_span(uri, file, query.name.span, true);
        }
    }
    for scope in scopes_for(suite, name) {
        c.add_span(uri, file, scope.query.span, false);
    }
    for test in all_tests(suite) {
        for assert in &test.asserts {
            if let Some(AssertQuery::Named { name: used, .. }) = &assert.query {
                if used.name == name {
                    c.add_span(uri, file, used.span, false);
                }
            }
        }
    }
}

fn alias_refs(c: &mut Collector, uri: &Url, file: &AnalyzedFile, alias: &str, include_declaration: bool) {
    if include_declaration {
        for import in &file.suite.imports {
            match (&import.alias, &import.path) {
                (Some(ident), _) if ident.name == alias => c.add_span(uri, file, ident.span, true),
                (None, Some(path)) if default_alias(&path.value).as_deref() == Some(alias) => {
                    let literal = file
                        .source
                        .get(path.span.start.offset..path.span.end.offset)
                        .map(str::to_string);
                    c.add_with(uri, file, path.span.start.offset, path.span.end.offset, true, literal);
                }
                _ => {}
            }
        }
    }
    for setup in file.suite.all_setups() {
        for module in setup.items.iter().filter_map(SetupItem::module) {
            if module.name == alias {
                c.add_span(uri, file, module.span, false);
            }
        }
    }
}

/// Calls of `name` through any alias in `aliases`.
fn setup_calls(c: &mut Collector, uri: &Url, file: &AnalyzedFile, aliases: &[String], name: &str) {
    for call in file.suite.all_setup_calls() {
        if !aliases.contains(&call.module.name) {
            continue;
        }
        if let Some(query) = call.query.as_ref().filter(|q| q.name == name) {
            c.add_span(uri, file, query.span, false);
        }
    }
}

/// Aliases under which `file` imports `target`.
fn aliases_targeting(loader: &FileLoader, base: Option<&Path>, file: &AnalyzedFile, target: &Path) -> Vec<String> {
    let Some(base) = base else {
        return Vec::new();
    };
    file.symbols
        .imports
        .values()
        .filter(|i| !i.path.is_empty())
        .filter(|i| clean_path(&loader.resolve_import_path(base, &i.path)) == target)
        .map(|i| i.alias.clone())
        .collect()
}

fn setup_query_refs(
    c: &mut Collector,
    workspace: &Workspace,
    doc: &Document,
    alias: &str,
    name: &str,
    include_declaration: bool,
) -> Result<(), ReferenceError> {
    setup_calls(c, &doc.uri, &doc.analysis, &[alias.to_string()], name);
    let Some(target) = workspace.resolve_alias(doc, alias).map(|p| clean_path(&p)) else {
        return Ok(());
    };

    if include_declaration {
        if let Some((uri, analysis)) = workspace.analysis_for_path(&target) {
            if let Some(query) = analysis.query(name) {
                c.add_span(&uri, &analysis, query.name_span, true);
            }
        }
    }

    for other in workspace.documents.all() {
        if other.uri == doc.uri {
            continue;
        }
        let aliases = aliases_targeting(&workspace.loader, other.path.as_deref(), &other.analysis, &target);
        setup_calls(c, &other.uri, &other.analysis, &aliases, name);
    }

    if !workspace.config().workspace_references {
        return Ok(());
    }
    for path in workspace.disk_files() {
        if doc.path.as_deref() == Some(path.as_path()) {
            continue;
        }
        let analysis = match workspace.loader.load_and_analyze(&path) {
            Ok(analysis) => analysis,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping unreadable file");
                continue;
            }
        };
        let aliases = aliases_targeting(&workspace.loader, Some(&path), &analysis, &target);
        if aliases.is_empty() {
            continue;
        }
        let uri = Url::from_file_path(&path).map_err(|_| ReferenceError::InvalidPath(path.clone()))?;
        setup_calls(c, &uri, &analysis, &aliases, name);
    }
    Ok(())
}

fn parameter_refs(
    c: &mut Collector,
    uri: &Url,
    file: &AnalyzedFile,
    query: &str,
    name: &str,
    include_declaration: bool,
) {
    if let Some(symbol) = file.query(query) {
        for (i, (start, end)) in symbol.parameter_ranges(name).into_iter().enumerate() {
            if i > 0 || include_declaration {
                c.add(uri, file, start, end, i == 0);
            }
        }
    }

    let param = format!("${name}");
    for scope in scopes_for(&file.suite, query) {
        for test in Suite::tests_in(scope) {
            for statement in &test.statements {
                if let StatementKey::Param(ident) = &statement.key {
                    if ident.name == param {
                        c.add_span(uri, file, ident.span, false);
                    }
                }
            }
        }
    }
    for test in all_tests(&file.suite) {
        for assert in &test.asserts {
            if let Some(AssertQuery::Named { name: used, args }) = &assert.query {
                if used.name != query {
                    continue;
                }
                for arg in args.iter().filter(|a| a.name.name == param) {
                    c.add_span(uri, file, arg.name.span, false);
                }
            }
        }
    }
}

fn return_field_refs(
    c: &mut Collector,
    uri: &Url,
    file: &AnalyzedFile,
    query: &str,
    name: &str,
    include_declaration: bool,
) {
    if include_declaration {
        if let Some((start, end)) = file.query(query).and_then(|q| q.return_field_range(name)) {
            c.add(uri, file, start, end, true);
        }
    }

    for scope in scopes_for(&file.suite, query) {
        for test in Suite::tests_in(scope) {
            for statement in &test.statements {
                if let StatementKey::Field(path) = &statement.key {
                    if path.text() == name {
                        c.add_span(uri, file, path.span, false);
                    }
                }
            }
            for assert in test.asserts.iter().filter(|a| a.query.is_none()) {
                for cond in &assert.conditions {
                    let base = cond.span.start.offset;
                    let Some(text) = file.source.get(base..cond.span.end.offset) else {
                        continue;
                    };
                    for offset in word_matches(text, name) {
                        c.add(uri, file, base + offset, base + offset + name.len(), false);
                    }
                }
            }
        }
    }
}
