//! Per-file semantic analysis: symbol table construction and diagnostics.
//!
//! `Analyzer::analyze` never fails. Syntax errors, query-body analysis
//! failures and unresolved imports all end up as `Diagnostic`s on the
//! returned `AnalyzedFile`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use scaf_dsl::ast::*;
use scaf_dsl::dialect::{analyzer_for, CypherAnalyzer, QueryAnalyzer, QueryMetadata, ReturnItem};
use scaf_dsl::{parse_with_recovery, ParseError, Token};

use crate::loader::FileLoader;

/// Stable diagnostic codes. Quick-fixes key on these strings.
pub mod codes {
    pub const PARSE_ERROR: &str = "parse-error";
    pub const UNDEFINED_QUERY: &str = "undefined-query";
    pub const DUPLICATE_QUERY: &str = "duplicate-query";
    pub const DUPLICATE_IMPORT: &str = "duplicate-import";
    pub const UNUSED_IMPORT: &str = "unused-import";
    pub const UNDEFINED_IMPORT: &str = "undefined-import";
    pub const UNRESOLVED_IMPORT: &str = "unresolved-import";
    pub const MISSING_REQUIRED_PARAMS: &str = "missing-required-params";
    pub const UNKNOWN_PARAMETER: &str = "unknown-parameter";
    pub const UNDEFINED_SETUP_QUERY: &str = "undefined-setup-query";
    pub const EMPTY_TEST: &str = "empty-test";
    pub const EMPTY_GROUP: &str = "empty-group";
}

/// Prefix of the missing-parameter message; the quick-fix parses what follows.
pub const MISSING_PARAMS_PREFIX: &str = "missing required parameters: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Hint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    fn error(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
        }
    }

    fn warning(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: Severity::Warning,
            message: message.into(),
            span,
        }
    }

    fn hint(code: &'static str, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: Severity::Hint,
            message: message.into(),
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySymbol {
    pub name: String,
    pub name_span: Span,
    pub span: Span,
    pub body: String,
    /// Byte offset of the first body character in the file.
    pub body_offset: Option<usize>,
    /// `None` when the body is missing or the dialect analyzer rejected it.
    pub metadata: Option<QueryMetadata>,
    /// Index of the defining node in `Suite::queries`.
    pub index: usize,
}

impl QuerySymbol {
    /// Declared parameter names, without the `$`.
    pub fn parameter_names(&self) -> Vec<&str> {
        self.metadata
            .as_ref()
            .map(|m| m.parameter_names())
            .unwrap_or_default()
    }

    pub fn returns(&self) -> &[ReturnItem] {
        self.metadata
            .as_ref()
            .map(|m| m.returns.as_slice())
            .unwrap_or_default()
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter_names().contains(&name)
    }

    /// File byte ranges of every `$name` occurrence in the body, in order.
    pub fn parameter_ranges(&self, name: &str) -> Vec<(usize, usize)> {
        let (Some(meta), Some(base)) = (&self.metadata, self.body_offset) else {
            return Vec::new();
        };
        meta.occurrences(name)
            .map(|p| (base + p.position, base + p.position + 1 + p.name.len()))
            .collect()
    }

    /// File byte range of the name a test uses for `field`.
    pub fn return_field_range(&self, field: &str) -> Option<(usize, usize)> {
        let meta = self.metadata.as_ref()?;
        let base = self.body_offset?;
        let item = meta.return_item(field)?;
        let (start, end) = item.field_range();
        Some((base + start, base + end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSymbol {
    pub alias: String,
    /// False when the alias was derived from the path.
    pub explicit: bool,
    pub path: String,
    /// Span of the alias token, or of the path string for a derived alias.
    pub alias_span: Span,
    pub path_span: Option<Span>,
    pub span: Span,
    pub index: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    pub queries: BTreeMap<String, QuerySymbol>,
    pub imports: BTreeMap<String, ImportSymbol>,
}

impl SymbolTable {
    pub fn query_names(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }
}

/// Immutable result of analysing one file.
#[derive(Debug)]
pub struct AnalyzedFile {
    pub path: Option<PathBuf>,
    pub source: String,
    pub suite: Suite,
    pub tokens: Vec<Token>,
    pub line_index: LineIndex,
    pub parse_errors: Vec<ParseError>,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<Diagnostic>,
}

impl AnalyzedFile {
    pub fn has_parse_errors(&self) -> bool {
        !self.parse_errors.is_empty()
    }

    pub fn query(&self, name: &str) -> Option<&QuerySymbol> {
        self.symbols.queries.get(name)
    }

    pub fn import(&self, alias: &str) -> Option<&ImportSymbol> {
        self.symbols.imports.get(alias)
    }

    pub fn diagnostics_with_code<'a>(&'a self, code: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.code == code)
    }
}

/// Alias implied by a bare import path: the last path segment up to its
/// first `.`, ignoring `.` and `..` segments.
pub fn default_alias(path: &str) -> Option<String> {
    let segment = path
        .split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .last()?;
    let stem = segment.split('.').next().unwrap_or(segment);
    (!stem.is_empty()).then(|| stem.to_string())
}

#[derive(Clone)]
pub struct Analyzer {
    dialect: Arc<dyn QueryAnalyzer>,
}

impl fmt::Debug for Analyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Analyzer")
            .field("dialect", &self.dialect.name())
            .finish()
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new(Arc::new(CypherAnalyzer))
    }
}

impl Analyzer {
    pub fn new(dialect: Arc<dyn QueryAnalyzer>) -> Self {
        Self { dialect }
    }

    /// Analyzer for a named dialect, falling back to Cypher.
    pub fn for_dialect(name: &str) -> Self {
        match analyzer_for(name) {
            Some(dialect) => Self::new(dialect),
            None => {
                tracing::warn!(dialect = name, "unknown query dialect, using cypher");
                Self::default()
            }
        }
    }

    pub fn dialect(&self) -> &dyn QueryAnalyzer {
        self.dialect.as_ref()
    }

    /// Analyse `source`.
    ///
    /// With both a `path` and a `loader`, imports are resolved and setup
    /// calls are checked against the imported files. Imported files are
    /// analysed without a loader, so resolution is one level deep.
    pub fn analyze(&self, path: Option<&Path>, source: &str, loader: Option<&FileLoader>) -> AnalyzedFile {
        let output = parse_with_recovery(source);
        let mut diagnostics: Vec<Diagnostic> = output
            .errors
            .iter()
            .map(|e| Diagnostic::error(codes::PARSE_ERROR, e.to_string(), e.location()))
            .collect();

        let symbols = self.build_symbols(&output.suite, &mut diagnostics);
        check_scopes(&output.suite, &symbols, &mut diagnostics);
        check_imports(&output.suite, &symbols, &mut diagnostics);
        if let (Some(path), Some(loader)) = (path, loader) {
            check_cross_file(path, loader, &output.suite, &symbols, &mut diagnostics);
        }
        diagnostics.sort_by(|a, b| {
            a.span
                .start
                .offset
                .cmp(&b.span.start.offset)
                .then_with(|| a.code.cmp(b.code))
        });

        tracing::debug!(
            path = ?path,
            queries = symbols.queries.len(),
            imports = symbols.imports.len(),
            diagnostics = diagnostics.len(),
            "analyzed scaf file"
        );

        AnalyzedFile {
            path: path.map(Path::to_path_buf),
            source: source.to_string(),
            suite: output.suite,
            tokens: output.tokens,
            line_index: output.line_index,
            parse_errors: output.errors,
            symbols,
            diagnostics,
        }
    }

    fn build_symbols(&self, suite: &Suite, diagnostics: &mut Vec<Diagnostic>) -> SymbolTable {
        let mut table = SymbolTable::default();

        for (index, query) in suite.queries.iter().enumerate() {
            let name = query.name.name.clone();
            let metadata = query.body.as_ref().and_then(|body| {
                match self.dialect.analyze_query(&body.text) {
                    Ok(meta) => Some(meta),
                    Err(err) => {
                        tracing::debug!(query = %name, error = %err, "query body analysis failed");
                        None
                    }
                }
            });
            if table.queries.contains_key(&name) {
                diagnostics.push(Diagnostic::warning(
                    codes::DUPLICATE_QUERY,
                    format!("duplicate query '{name}'; this definition replaces the earlier one"),
                    query.name.span,
                ));
            }
            table.queries.insert(
                name.clone(),
                QuerySymbol {
                    name,
                    name_span: query.name.span,
                    span: query.span,
                    body: query.body.as_ref().map(|b| b.text.clone()).unwrap_or_default(),
                    body_offset: query.body.as_ref().map(QueryBody::text_offset),
                    metadata,
                    index,
                },
            );
        }

        for (index, import) in suite.imports.iter().enumerate() {
            let path = import.path.as_ref().map(|p| p.value.clone()).unwrap_or_default();
            let (alias, explicit, alias_span) = match (&import.alias, &import.path) {
                (Some(ident), _) => (ident.name.clone(), true, ident.span),
                (None, Some(lit)) => match default_alias(&lit.value) {
                    Some(alias) => (alias, false, lit.span),
                    None => continue,
                },
                (None, None) => continue,
            };
            if table.imports.contains_key(&alias) {
                diagnostics.push(Diagnostic::warning(
                    codes::DUPLICATE_IMPORT,
                    format!("duplicate import alias '{alias}'"),
                    alias_span,
                ));
            }
            table.imports.insert(
                alias.clone(),
                ImportSymbol {
                    alias,
                    explicit,
                    path,
                    alias_span,
                    path_span: import.path.as_ref().map(|p| p.span),
                    span: import.span,
                    index,
                },
            );
        }

        table
    }
}

/// Span of the first `len` bytes of `span`, on the same line.
fn leading_span(span: Span, len: usize) -> Span {
    let len = len.min(span.len());
    let mut end = span.start;
    end.offset += len;
    end.column += len as u32;
    Span::new(span.start, end)
}

fn test_label_span(test: &Test) -> Span {
    test.name
        .as_ref()
        .map(|n| n.span)
        .unwrap_or_else(|| leading_span(test.span, "test".len()))
}

fn check_scopes(suite: &Suite, symbols: &SymbolTable, diagnostics: &mut Vec<Diagnostic>) {
    for scope in &suite.scopes {
        let name = &scope.query.name;
        let query = symbols.queries.get(name);
        if query.is_none() && !name.is_empty() {
            diagnostics.push(Diagnostic::error(
                codes::UNDEFINED_QUERY,
                format!("undefined query '{name}'"),
                scope.query.span,
            ));
        }
        check_items(&scope.items, query, symbols, diagnostics);
    }
}

fn check_items(
    items: &[TestOrGroup],
    query: Option<&QuerySymbol>,
    symbols: &SymbolTable,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for item in items {
        match item {
            TestOrGroup::Group(group) => {
                if group.items.is_empty() {
                    let (label, span) = match &group.name {
                        Some(name) => (name.value.as_str(), name.span),
                        None => ("", leading_span(group.span, "group".len())),
                    };
                    diagnostics.push(Diagnostic::hint(
                        codes::EMPTY_GROUP,
                        format!("group '{label}' has no tests"),
                        span,
                    ));
                }
                check_items(&group.items, query, symbols, diagnostics);
            }
            TestOrGroup::Test(test) => check_test(test, query, symbols, diagnostics),
        }
    }
}

fn check_test(
    test: &Test,
    query: Option<&QuerySymbol>,
    symbols: &SymbolTable,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let label_span = test_label_span(test);
    if test.is_empty() {
        let label = test.name.as_ref().map(|n| n.value.as_str()).unwrap_or("");
        diagnostics.push(Diagnostic::hint(
            codes::EMPTY_TEST,
            format!("test '{label}' is empty"),
            label_span,
        ));
        return;
    }

    for assert in &test.asserts {
        if let Some(AssertQuery::Named { name, .. }) = &assert.query {
            if !symbols.queries.contains_key(&name.name) {
                diagnostics.push(Diagnostic::error(
                    codes::UNDEFINED_QUERY,
                    format!("undefined query '{}'", name.name),
                    name.span,
                ));
            }
        }
    }

    let Some(query) = query else { return };
    if query.metadata.is_none() {
        return;
    }
    let declared = query.parameter_names();
    let provided: Vec<(&str, Span)> = test
        .statements
        .iter()
        .filter_map(|s| match &s.key {
            StatementKey::Param(ident) => Some((ident.name.trim_start_matches('$'), ident.span)),
            StatementKey::Field(_) => None,
        })
        .collect();

    let missing: Vec<String> = declared
        .iter()
        .copied()
        .filter(|p| !provided.iter().any(|(name, _)| name == p))
        .map(|p| format!("${p}"))
        .collect();
    if !missing.is_empty() {
        diagnostics.push(Diagnostic::error(
            codes::MISSING_REQUIRED_PARAMS,
            format!("{MISSING_PARAMS_PREFIX}{}", missing.join(", ")),
            label_span,
        ));
    }

    for (name, span) in provided {
        if !declared.contains(&name) {
            diagnostics.push(Diagnostic::warning(
                codes::UNKNOWN_PARAMETER,
                format!("unknown parameter '${name}' for query '{}'", query.name),
                span,
            ));
        }
    }
}

fn check_imports(suite: &Suite, symbols: &SymbolTable, diagnostics: &mut Vec<Diagnostic>) {
    let mut used: HashSet<&str> = HashSet::new();
    for setup in suite.all_setups() {
        for module in setup.items.iter().filter_map(SetupItem::module) {
            if module.name.is_empty() {
                continue;
            }
            used.insert(&module.name);
            if !symbols.imports.contains_key(&module.name) {
                diagnostics.push(Diagnostic::error(
                    codes::UNDEFINED_IMPORT,
                    format!("undefined import '{}'", module.name),
                    module.span,
                ));
            }
        }
    }

    for import in symbols.imports.values() {
        if !used.contains(import.alias.as_str()) {
            diagnostics.push(Diagnostic::warning(
                codes::UNUSED_IMPORT,
                format!("import '{}' is never used", import.alias),
                import.span,
            ));
        }
    }
}

fn check_cross_file(
    path: &Path,
    loader: &FileLoader,
    suite: &Suite,
    symbols: &SymbolTable,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for import in symbols.imports.values() {
        if import.path.is_empty() {
            continue;
        }
        let resolved = loader.resolve_import_path(path, &import.path);
        if !resolved.is_file() {
            diagnostics.push(Diagnostic::warning(
                codes::UNRESOLVED_IMPORT,
                format!("cannot resolve import '{}'", import.path),
                import.path_span.unwrap_or(import.span),
            ));
        }
    }

    for call in suite.all_setup_calls() {
        let Some(query) = &call.query else { continue };
        let Some(import) = symbols.imports.get(&call.module.name) else {
            continue;
        };
        let resolved = loader.resolve_import_path(path, &import.path);
        if !resolved.is_file() {
            continue;
        }
        let target = match loader.load_and_analyze(&resolved) {
            Ok(target) => target,
            Err(err) => {
                tracing::debug!(path = %resolved.display(), error = %err, "cannot load import");
                continue;
            }
        };
        if target.symbols.queries.contains_key(&query.name) {
            continue;
        }
        let available = target.symbols.query_names();
        let available = if available.is_empty() {
            "none".to_string()
        } else {
            available.join(", ")
        };
        diagnostics.push(Diagnostic::error(
            codes::UNDEFINED_SETUP_QUERY,
            format!(
                "query '{}' is not defined in '{}' (available: {available})",
                query.name, call.module.name
            ),
            query.span,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(source: &str) -> AnalyzedFile {
        Analyzer::default().analyze(None, source, None)
    }

    fn codes_of(file: &AnalyzedFile) -> Vec<&'static str> {
        file.diagnostics.iter().map(|d| d.code).collect()
    }

    #[test]
    fn undefined_scope_query_is_reported() {
        let file = analyze("query Get `MATCH (n) RETURN n`\n\nOther {\n    test \"t\" {}\n}\n");
        let diag = file
            .diagnostics_with_code(codes::UNDEFINED_QUERY)
            .next()
            .expect("undefined-query diagnostic");
        assert_eq!(diag.message, "undefined query 'Other'");
        assert_eq!(diag.span.start.line, 3);
    }

    #[test]
    fn unused_import_is_reported() {
        let file = analyze("import f \"./f\"\nquery Q `RETURN 1`\n");
        let diag = file.diagnostics_with_code(codes::UNUSED_IMPORT).next().unwrap();
        assert_eq!(diag.message, "import 'f' is never used");
    }

    #[test]
    fn import_used_in_nested_setup_is_not_unused() {
        let src = "import f \"./f\"\nquery Q `RETURN 1`\nQ {\n  group \"g\" {\n    test \"t\" {\n      setup f.Seed()\n    }\n  }\n}\n";
        let file = analyze(src);
        assert!(file.diagnostics_with_code(codes::UNUSED_IMPORT).next().is_none());
    }

    #[test]
    fn missing_required_params_names_each_parameter() {
        let src = "query GetUser `MATCH (u {id: $id, name: $name}) RETURN u`\nGetUser {\n    test \"t\" {\n        $id: 1\n    }\n}\n";
        let file = analyze(src);
        let diag = file
            .diagnostics_with_code(codes::MISSING_REQUIRED_PARAMS)
            .next()
            .unwrap();
        assert_eq!(diag.message, "missing required parameters: $name");
        assert_eq!(diag.span.start.line, 3);
    }

    #[test]
    fn unknown_parameter_is_a_warning() {
        let src = "query Q `MATCH (n {id: $id}) RETURN n`\nQ { test \"t\" { $id: 1 $other: 2 } }";
        let file = analyze(src);
        let diag = file.diagnostics_with_code(codes::UNKNOWN_PARAMETER).next().unwrap();
        assert_eq!(diag.severity, Severity::Warning);
        assert_eq!(diag.message, "unknown parameter '$other' for query 'Q'");
    }

    #[test]
    fn empty_tests_and_groups_are_hints() {
        let file = analyze("query Q `RETURN 1`\nQ {\n  test \"t\" {}\n  group \"g\" {}\n}\n");
        let codes = codes_of(&file);
        assert!(codes.contains(&codes::EMPTY_TEST));
        assert!(codes.contains(&codes::EMPTY_GROUP));
        assert!(!codes.contains(&codes::MISSING_REQUIRED_PARAMS));
    }

    #[test]
    fn duplicate_query_last_definition_wins() {
        let file = analyze("query Q `RETURN 1 AS a`\nquery Q `RETURN 2 AS b`\n");
        assert_eq!(codes_of(&file), vec![codes::DUPLICATE_QUERY]);
        let symbol = file.query("Q").unwrap();
        assert_eq!(symbol.index, 1);
        assert_eq!(symbol.returns()[0].field_name(), "b");
        assert_eq!(file.diagnostics[0].span.start.line, 2);
    }

    #[test]
    fn derived_alias_strips_dot_segments_and_extensions() {
        assert_eq!(default_alias("../shared/db").as_deref(), Some("db"));
        assert_eq!(default_alias("./fixtures.cypher.scaf").as_deref(), Some("fixtures"));
        assert_eq!(default_alias("./.."), None);
        let file = analyze("import \"../shared/db\"\nsetup db\n");
        let import = file.import("db").unwrap();
        assert!(!import.explicit);
        assert!(file.diagnostics.is_empty(), "{:?}", file.diagnostics);
    }

    #[test]
    fn undefined_import_in_setup() {
        let file = analyze("setup nope.Seed()\n");
        let diag = file.diagnostics_with_code(codes::UNDEFINED_IMPORT).next().unwrap();
        assert_eq!(diag.message, "undefined import 'nope'");
    }

    #[test]
    fn undefined_assert_query() {
        let src = "query Q `RETURN 1`\nQ { test \"t\" { assert Missing() { (x > 0) } } }";
        let file = analyze(src);
        let diag = file.diagnostics_with_code(codes::UNDEFINED_QUERY).next().unwrap();
        assert_eq!(diag.message, "undefined query 'Missing'");
    }

    #[test]
    fn parse_errors_keep_partial_symbols() {
        let file = analyze("query A `RETURN 1`\nquery B `MATCH (n {id: $id}) RETURN n`\nB {\n  test \"t\" {\n    $id:");
        assert!(file.has_parse_errors());
        assert!(codes_of(&file).contains(&codes::PARSE_ERROR));
        assert_eq!(file.symbols.queries.len(), 2);
        assert_eq!(file.query("B").unwrap().parameter_names(), vec!["id"]);
    }

    #[test]
    fn bad_query_body_degrades_to_no_metadata() {
        let file = analyze("query Q `MATCH (n RETURN n`\nQ { test \"t\" { $id: 1 } }");
        let query = file.query("Q").unwrap();
        assert!(query.metadata.is_none());
        assert!(file.diagnostics_with_code(codes::UNKNOWN_PARAMETER).next().is_none());
    }

    #[test]
    fn parameter_and_return_ranges_are_file_offsets() {
        let src = "query Q `MATCH (u {id: $id}) RETURN u.name AS name`";
        let file = analyze(src);
        let query = file.query("Q").unwrap();
        let (start, end) = query.parameter_ranges("id")[0];
        assert_eq!(&src[start..end], "$id");
        let (start, end) = query.return_field_range("name").unwrap();
        assert_eq!(&src[start..end], "name");
        assert_eq!(start, src.rfind("name").unwrap());
    }
}
