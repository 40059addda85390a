//! Context-aware completion.
//!
//! `build_context` gathers the raw facts about the cursor and `classify` turns
//! them into a single `CompletionKind`. The classification is an ordered list
//! of rules where the first match wins; overlapping cases (a dotted prefix
//! inside a test setup, a `$` inside an assert) depend on that order.

use scaf_dsl::lexer::{Keyword, TokenKind};
use tower_lsp::lsp_types::*;

use crate::analysis::{AnalyzedFile, QuerySymbol};
use crate::document::Document;
use crate::hover::keyword_docs;
use crate::resolve::{self, ScopeFlags};
use crate::utils::{line_before, offset_to_range, position_to_offset, prefix_before};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    QueryName,
    Keyword,
    Parameter,
    ReturnField,
    /// Property part of a dotted return expression: `u.na|`.
    ReturnFieldProperty,
    ImportAlias,
    /// Queries of an imported file: `fixtures.|`.
    SetupFunction,
    None,
}

#[derive(Debug, Clone)]
pub struct CompletionContext {
    pub kind: CompletionKind,
    /// Text being typed, including any leading `$` and inner dots.
    pub prefix: String,
    pub flags: ScopeFlags,
    /// Identifier before the first `.` of a dotted prefix.
    pub import_alias: Option<String>,
    pub trigger: Option<String>,
    /// The cursor is in a value position (`$id: |`).
    pub after_colon: bool,
    /// The cursor directly follows a `setup` keyword.
    pub after_setup: bool,
    /// The cursor is inside a string or query body.
    pub in_literal: bool,
    /// Byte offset of the cursor.
    pub offset: usize,
}

impl CompletionContext {
    fn prefix_start(&self) -> usize {
        self.offset - self.prefix.len()
    }

    fn is_dotted(&self) -> bool {
        !self.prefix.starts_with('$') && self.prefix.contains('.')
    }

    /// Prefix text after the last dot.
    fn member_prefix(&self) -> &str {
        self.prefix.rsplit('.').next().unwrap_or("")
    }
}

pub fn build_context(doc: &Document, position: Position, trigger: Option<&str>) -> CompletionContext {
    let file = &doc.analysis;
    let offset = position_to_offset(&doc.content, position);
    let resolved = resolve::resolve(file, position);

    let prefix = prefix_before(&doc.content, offset).to_string();
    let prefix_start = offset - prefix.len();
    let line = line_before(&doc.content, prefix_start);

    let before: Vec<_> = file
        .tokens
        .iter()
        .take_while(|t| t.span.end.offset <= prefix_start)
        .collect();
    let setup_token = match before.as_slice() {
        [.., last] if last.is_keyword(Keyword::Setup) => true,
        [.., setup, brace] => brace.kind == TokenKind::LBrace && setup.is_keyword(Keyword::Setup),
        _ => false,
    };
    let setup_text =
        line.len() > line.trim_end().len() && line.split_whitespace().last() == Some("setup");

    let in_literal = file.tokens.iter().any(|t| {
        matches!(t.kind, TokenKind::String | TokenKind::RawString)
            && t.span.start.offset < offset
            && (offset < t.span.end.offset || (offset == t.span.end.offset && t.is_unterminated()))
    });

    let import_alias = (!prefix.starts_with('$') && prefix.contains('.'))
        .then(|| prefix.split('.').next().unwrap_or("").to_string());

    let mut context = CompletionContext {
        kind: CompletionKind::None,
        prefix,
        flags: resolved.flags,
        import_alias,
        trigger: trigger.map(str::to_string),
        after_colon: line.trim_end().ends_with(':'),
        after_setup: setup_token || setup_text,
        in_literal,
        offset,
    };
    context.kind = classify(&context, doc.symbol_analysis());
    context
}

/// Decide what to offer. Rules are tried top to bottom.
pub fn classify(context: &CompletionContext, symbols: &AnalyzedFile) -> CompletionKind {
    if context.in_literal {
        return CompletionKind::None;
    }
    let flags = &context.flags;
    let trigger = context.trigger.as_deref();

    // 1. After a dot: an import alias, else a property of a return field.
    if trigger == Some(".") || context.is_dotted() {
        if let Some(alias) = &context.import_alias {
            if symbols.import(alias).is_some() {
                return CompletionKind::SetupFunction;
            }
        }
        if flags.in_test && !flags.in_setup {
            return CompletionKind::ReturnFieldProperty;
        }
        return CompletionKind::None;
    }

    // 2. Parameters anywhere inside a scope.
    let in_block = flags.in_scope || flags.in_test || flags.in_setup || flags.in_assert;
    if (context.prefix.starts_with('$') || trigger == Some("$")) && in_block {
        return CompletionKind::Parameter;
    }

    // 3. An import alias after `setup`.
    if context.after_setup {
        return CompletionKind::ImportAlias;
    }
    if trigger == Some(" ") {
        return CompletionKind::None;
    }

    // 4. Test bodies: fields, nothing in value position.
    if flags.in_test {
        if context.after_colon {
            return CompletionKind::None;
        }
        let has_returns = symbols
            .query(&flags.scope_name)
            .is_some_and(|q| !q.returns().is_empty());
        return if has_returns {
            CompletionKind::ReturnField
        } else {
            CompletionKind::Keyword
        };
    }

    // 5. Top level.
    if !flags.in_scope {
        let upper = context
            .prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_uppercase());
        return if upper {
            CompletionKind::QueryName
        } else {
            CompletionKind::Keyword
        };
    }

    // 6. Scope body outside any test.
    CompletionKind::Keyword
}

pub fn completions(
    workspace: &Workspace,
    doc: &Document,
    position: Position,
    trigger: Option<&str>,
) -> Vec<CompletionItem> {
    let context = build_context(doc, position, trigger);
    tracing::debug!(kind = ?context.kind, prefix = %context.prefix, "completion context");
    let symbols = doc.symbol_analysis();

    match context.kind {
        CompletionKind::QueryName => query_name_items(doc, &context, symbols),
        CompletionKind::Keyword => keyword_items(doc, &context),
        CompletionKind::Parameter => parameter_items(doc, &context, symbols),
        CompletionKind::ReturnField => {
            let mut items = return_field_items(doc, &context, symbols);
            items.extend(keyword_items(doc, &context));
            items
        }
        CompletionKind::ReturnFieldProperty => property_items(doc, &context, symbols),
        CompletionKind::ImportAlias => import_alias_items(doc, &context, symbols),
        CompletionKind::SetupFunction => setup_function_items(workspace, doc, &context),
        CompletionKind::None => Vec::new(),
    }
}

fn starts_with_ignore_case(candidate: &str, prefix: &str) -> bool {
    candidate
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}

fn edit_item(
    doc: &Document,
    start: usize,
    end: usize,
    label: String,
    kind: CompletionItemKind,
    detail: Option<String>,
    new_text: String,
) -> CompletionItem {
    let range = offset_to_range(&doc.content, start, end);
    CompletionItem {
        label,
        kind: Some(kind),
        detail,
        text_edit: Some(CompletionTextEdit::Edit(TextEdit::new(range, new_text))),
        ..Default::default()
    }
}

fn body_summary(query: &QuerySymbol) -> String {
    let first = query.body.trim().lines().next().unwrap_or("");
    if first.chars().count() > 60 {
        let cut: String = first.chars().take(57).collect();
        format!("{cut}...")
    } else {
        first.to_string()
    }
}

fn markdown(value: String) -> Documentation {
    Documentation::MarkupContent(MarkupContent {
        kind: MarkupKind::Markdown,
        value,
    })
}

fn query_name_items(doc: &Document, context: &CompletionContext, symbols: &AnalyzedFile) -> Vec<CompletionItem> {
    symbols
        .symbols
        .queries
        .values()
        .filter(|q| starts_with_ignore_case(&q.name, &context.prefix))
        .map(|q| {
            let mut item = edit_item(
                doc,
                context.prefix_start(),
                context.offset,
                q.name.clone(),
                CompletionItemKind::FUNCTION,
                Some(body_summary(q)),
                q.name.clone(),
            );
            item.documentation = Some(markdown(format!("```cypher\n{}\n```", q.body.trim())));
            item
        })
        .collect()
}

fn keywords_for(flags: &ScopeFlags) -> &'static [Keyword] {
    if flags.in_assert {
        &[Keyword::True, Keyword::False, Keyword::Null]
    } else if flags.in_test {
        &[Keyword::Setup, Keyword::Assert]
    } else if flags.in_scope {
        &[Keyword::Test, Keyword::Group, Keyword::Setup, Keyword::Teardown]
    } else {
        &[Keyword::Import, Keyword::Query, Keyword::Setup, Keyword::Teardown]
    }
}

fn keyword_items(doc: &Document, context: &CompletionContext) -> Vec<CompletionItem> {
    keywords_for(&context.flags)
        .iter()
        .map(|k| k.as_str())
        .filter(|k| starts_with_ignore_case(k, &context.prefix))
        .map(|k| {
            edit_item(
                doc,
                context.prefix_start(),
                context.offset,
                k.to_string(),
                CompletionItemKind::KEYWORD,
                keyword_docs(k).map(str::to_string),
                k.to_string(),
            )
        })
        .collect()
}

fn parameter_items(doc: &Document, context: &CompletionContext, symbols: &AnalyzedFile) -> Vec<CompletionItem> {
    let Some(query) = symbols.query(&context.flags.scope_name) else {
        return Vec::new();
    };
    let typed = context.prefix.trim_start_matches('$');
    let statement = context.flags.in_test && !context.flags.in_assert;
    query
        .parameter_names()
        .into_iter()
        .filter(|p| starts_with_ignore_case(p, typed))
        .map(|p| {
            let label = format!("${p}");
            let new_text = if statement {
                format!("{label}: ")
            } else {
                label.clone()
            };
            edit_item(
                doc,
                context.prefix_start(),
                context.offset,
                label,
                CompletionItemKind::VARIABLE,
                Some(format!("parameter of {}", query.name)),
                new_text,
            )
        })
        .collect()
}

fn field_detail(query: &QuerySymbol, expression: &str, aggregate: bool) -> String {
    if aggregate {
        format!("{expression} (aggregate) from {}", query.name)
    } else {
        format!("{expression} from {}", query.name)
    }
}

fn return_field_items(doc: &Document, context: &CompletionContext, symbols: &AnalyzedFile) -> Vec<CompletionItem> {
    let Some(query) = symbols.query(&context.flags.scope_name) else {
        return Vec::new();
    };
    let suffix = if context.flags.in_assert { "" } else { ": " };
    query
        .returns()
        .iter()
        .filter(|r| starts_with_ignore_case(r.field_name(), &context.prefix))
        .map(|r| {
            edit_item(
                doc,
                context.prefix_start(),
                context.offset,
                r.field_name().to_string(),
                CompletionItemKind::FIELD,
                Some(field_detail(query, &r.expression, r.is_aggregate)),
                format!("{}{suffix}", r.field_name()),
            )
        })
        .collect()
}

/// `u.na|` offers `name` for a `u.name` return, replacing only `na`.
fn property_items(doc: &Document, context: &CompletionContext, symbols: &AnalyzedFile) -> Vec<CompletionItem> {
    let Some(query) = symbols.query(&context.flags.scope_name) else {
        return Vec::new();
    };
    let member = context.member_prefix();
    let base = &context.prefix[..context.prefix.len() - member.len()];
    let suffix = if context.flags.in_assert { "" } else { ": " };
    query
        .returns()
        .iter()
        .filter_map(|r| {
            let property = r.field_name().strip_prefix(base)?;
            (!property.is_empty() && starts_with_ignore_case(property, member)).then_some((r, property))
        })
        .map(|(r, property)| {
            edit_item(
                doc,
                context.offset - member.len(),
                context.offset,
                property.to_string(),
                CompletionItemKind::FIELD,
                Some(field_detail(query, &r.expression, r.is_aggregate)),
                format!("{property}{suffix}"),
            )
        })
        .collect()
}

fn import_alias_items(doc: &Document, context: &CompletionContext, symbols: &AnalyzedFile) -> Vec<CompletionItem> {
    symbols
        .symbols
        .imports
        .values()
        .filter(|i| starts_with_ignore_case(&i.alias, &context.prefix))
        .map(|i| {
            edit_item(
                doc,
                context.prefix_start(),
                context.offset,
                i.alias.clone(),
                CompletionItemKind::MODULE,
                Some(format!("import \"{}\"", i.path)),
                i.alias.clone(),
            )
        })
        .collect()
}

fn setup_function_items(workspace: &Workspace, doc: &Document, context: &CompletionContext) -> Vec<CompletionItem> {
    let Some(alias) = &context.import_alias else {
        return Vec::new();
    };
    let Some(path) = workspace.resolve_alias(doc, alias) else {
        return Vec::new();
    };
    let Some((_, target)) = workspace.analysis_for_path(&path) else {
        return Vec::new();
    };
    let member = context.member_prefix();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    target
        .symbols
        .queries
        .values()
        .filter(|q| starts_with_ignore_case(&q.name, member))
        .map(|q| {
            let args: Vec<String> = q.parameter_names().iter().map(|p| format!("${p}: ")).collect();
            let mut item = edit_item(
                doc,
                context.offset - member.len(),
                context.offset,
                q.name.clone(),
                CompletionItemKind::FUNCTION,
                Some(format!("{alias}.{} in {file_name}", q.name)),
                format!("{}({})", q.name, args.join(", ")),
            );
            item.documentation = Some(markdown(format!("```cypher\n{}\n```", q.body.trim())));
            item
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::offset_to_position;
    use std::fs;
    use tempfile::TempDir;

    const QUERY: &str = "query GetUser `MATCH (u:User {id: $id, name: $name}) RETURN u.name, u.email AS email`\n";

    /// Open `src` with the `|` marker removed; returns the cursor position.
    fn open(workspace: &Workspace, uri: &str, src: &str) -> (Url, Position) {
        let offset = src.find('|').expect("cursor marker");
        let text = src.replacen('|', "", 1);
        let position = offset_to_position(&text, offset);
        let uri = Url::parse(uri).unwrap();
        workspace.update(uri.clone(), 1, text);
        (uri, position)
    }

    fn complete(src: &str, trigger: Option<&str>) -> (CompletionKind, Vec<CompletionItem>) {
        let workspace = Workspace::default();
        let (uri, position) = open(&workspace, "untitled:main", src);
        let doc = workspace.documents.get(&uri).unwrap();
        let context = build_context(&doc, position, trigger);
        (context.kind, completions(&workspace, &doc, position, trigger))
    }

    fn labels(items: &[CompletionItem]) -> Vec<&str> {
        items.iter().map(|i| i.label.as_str()).collect()
    }

    fn new_text(item: &CompletionItem) -> &str {
        match &item.text_edit {
            Some(CompletionTextEdit::Edit(edit)) => &edit.new_text,
            _ => panic!("expected a plain text edit"),
        }
    }

    #[test]
    fn parameters_inside_test() {
        let src = format!("{QUERY}\nGetUser {{\n    test \"t\" {{\n        $|\n    }}\n}}\n");
        let (kind, items) = complete(&src, Some("$"));
        assert_eq!(kind, CompletionKind::Parameter);
        assert_eq!(labels(&items), vec!["$id", "$name"]);
        assert_eq!(new_text(&items[0]), "$id: ");
    }

    #[test]
    fn return_fields_inside_test() {
        let src = format!("{QUERY}\nGetUser {{\n    test \"t\" {{\n        $id: 1\n        |\n    }}\n}}\n");
        let (kind, items) = complete(&src, None);
        assert_eq!(kind, CompletionKind::ReturnField);
        let names = labels(&items);
        assert!(names.contains(&"u.name"));
        assert!(names.contains(&"email"));
        assert!(names.contains(&"assert"));
    }

    #[test]
    fn dotted_prefix_inserts_only_the_property() {
        let src = format!("{QUERY}\nGetUser {{\n    test \"t\" {{\n        u.NA|\n    }}\n}}\n");
        let (kind, items) = complete(&src, None);
        assert_eq!(kind, CompletionKind::ReturnFieldProperty);
        assert_eq!(labels(&items), vec!["name"]);
        assert_eq!(new_text(&items[0]), "name: ");
    }

    #[test]
    fn value_position_offers_nothing() {
        let src = format!("{QUERY}\nGetUser {{\n    test \"t\" {{\n        $id: |\n    }}\n}}\n");
        let (kind, items) = complete(&src, None);
        assert_eq!(kind, CompletionKind::None);
        assert!(items.is_empty());
    }

    #[test]
    fn top_level_upper_case_prefix_offers_queries() {
        let src = format!("{QUERY}\nGet|");
        let (kind, items) = complete(&src, None);
        assert_eq!(kind, CompletionKind::QueryName);
        assert_eq!(labels(&items), vec!["GetUser"]);
    }

    #[test]
    fn top_level_lower_case_prefix_offers_keywords() {
        let (kind, items) = complete("qu|", None);
        assert_eq!(kind, CompletionKind::Keyword);
        assert_eq!(labels(&items), vec!["query"]);
    }

    #[test]
    fn scope_body_offers_scope_keywords() {
        let src = format!("{QUERY}\nGetUser {{\n    |\n}}\n");
        let (kind, items) = complete(&src, None);
        assert_eq!(kind, CompletionKind::Keyword);
        assert_eq!(labels(&items), vec!["test", "group", "setup", "teardown"]);
    }

    #[test]
    fn import_aliases_after_setup() {
        let src = "import fixtures \"./fixtures\"\nimport db \"./db\"\nsetup |";
        let (kind, items) = complete(src, Some(" "));
        assert_eq!(kind, CompletionKind::ImportAlias);
        assert_eq!(labels(&items), vec!["db", "fixtures"]);
    }

    #[test]
    fn space_trigger_elsewhere_offers_nothing() {
        let (kind, _) = complete("query |", Some(" "));
        assert_eq!(kind, CompletionKind::None);
    }

    #[test]
    fn nothing_inside_query_bodies() {
        let (kind, _) = complete("query Q `MATCH (n) RE|TURN n`", None);
        assert_eq!(kind, CompletionKind::None);
    }

    #[test]
    fn broken_document_uses_last_valid_symbols() {
        let workspace = Workspace::default();
        let uri = Url::parse("untitled:main").unwrap();
        workspace.update(uri.clone(), 1, QUERY.to_string());

        let src = "query GetUser `MATCH (u:User {id: $id, name: $name}) RETURN u.name, u.email AS email`\nGetUser {\n  test \"t\" {\n    $|";
        let offset = src.find('|').unwrap();
        let text = src.replacen('|', "", 1);
        let position = offset_to_position(&text, offset);
        // Only the earlier version still declares the query.
        let text = text.replacen("query GetUser", "query", 1);
        let doc = workspace.update(uri, 2, text);
        assert!(doc.analysis.has_parse_errors());
        let items = completions(&workspace, &doc, position, Some("$"));
        assert_eq!(labels(&items), vec!["$id", "$name"]);
    }

    #[test]
    fn setup_functions_from_imported_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fixtures.scaf"),
            "query CreateUser `CREATE (u:User {id: $id})`\nquery CreatePost `CREATE (p:Post)`\n",
        )
        .unwrap();
        let main = dir.path().join("main.scaf");
        let uri = Url::from_file_path(&main).unwrap();
        let workspace = Workspace::default();
        let src = "import fixtures \"./fixtures\"\nsetup fixtures.CreateU|\n";
        let (uri, position) = open(&workspace, uri.as_str(), src);
        let doc = workspace.documents.get(&uri).unwrap();

        let items = completions(&workspace, &doc, position, None);
        assert_eq!(labels(&items), vec!["CreateUser"]);
        assert_eq!(new_text(&items[0]), "CreateUser($id: )");
        let Some(CompletionTextEdit::Edit(edit)) = &items[0].text_edit else {
            panic!("expected edit");
        };
        // Only the member part after the dot is replaced.
        assert_eq!(edit.range.start, Position::new(1, 15));
    }

    #[test]
    fn classification_order_prefers_import_alias_over_fields() {
        let file = crate::analysis::Analyzer::default().analyze(None, "import u \"./u\"\n", None);
        let context = CompletionContext {
            kind: CompletionKind::None,
            prefix: "u.".to_string(),
            flags: ScopeFlags {
                scope_name: "Q".into(),
                in_scope: true,
                in_test: true,
                ..Default::default()
            },
            import_alias: Some("u".to_string()),
            trigger: Some(".".to_string()),
            after_colon: false,
            after_setup: false,
            in_literal: false,
            offset: 0,
        };
        assert_eq!(classify(&context, &file), CompletionKind::SetupFunction);
    }
}
