//! Hover documentation for keywords and user-defined symbols.

use scaf_dsl::lexer::TokenKind;
use tower_lsp::lsp_types::*;

use crate::analysis::QuerySymbol;
use crate::document::Document;
use crate::references::{symbol_at, SymbolKind};
use crate::resolve::token_at;
use crate::utils::{span_to_range, to_source_pos};
use crate::workspace::Workspace;

pub(crate) fn keyword_docs(word: &str) -> Option<&'static str> {
    match word {
        "import" => Some("Import another scaf file. Syntax: `import [alias] \"path\"`. Without an alias, the last path segment names the import."),
        "query" => Some("Query declaration. Syntax: `query Name `MATCH ... RETURN ...``. Parameters (`$name`) and return fields come from the body."),
        "setup" => Some("Setup clause run before a scope, group or test. Accepts an inline query, an import alias or a call `alias.Query($p: value)`."),
        "teardown" => Some("Teardown clause run after a scope or group. Syntax: `teardown `...``"),
        "test" => Some("Test case. Syntax: `test \"name\" { $param: value  field: expected  assert { (cond) } }`"),
        "group" => Some("Group of tests sharing setup and teardown. Syntax: `group \"name\" { ... }`"),
        "assert" => Some("Assertion. Syntax: `assert [Query(...) | `query`] { (condition) ... }`. Without a query, conditions see the scope's return fields."),
        "true" | "false" => Some("Boolean literal."),
        "null" => Some("Null literal."),
        _ => None,
    }
}

fn query_markdown(query: &QuerySymbol, heading: &str) -> String {
    let mut out = format!("**{heading}** `{}`\n\n```cypher\n{}\n```", query.name, query.body.trim());
    let params = query.parameter_names();
    if !params.is_empty() {
        let list: Vec<String> = params.iter().map(|p| format!("`${p}`")).collect();
        out.push_str(&format!("\n\nParameters: {}", list.join(", ")));
    }
    let returns = query.returns();
    if !returns.is_empty() {
        let list: Vec<String> = returns.iter().map(|r| format!("`{}`", r.field_name())).collect();
        out.push_str(&format!("\n\nReturns: {}", list.join(", ")));
    }
    out
}

fn contents_for(workspace: &Workspace, doc: &Document, position: Position) -> Option<(String, Option<Range>)> {
    let file = &doc.analysis;
    let symbols = doc.symbol_analysis();

    if let Some(symbol) = symbol_at(file, position) {
        let range = Some(span_to_range(&doc.content, symbol.span));
        let text = match &symbol.kind {
            SymbolKind::Query => match symbols.query(&symbol.name) {
                Some(query) => query_markdown(query, "query"),
                None => format!("**query** `{}` (undefined)", symbol.name),
            },
            SymbolKind::ImportAlias => {
                let import = symbols.import(&symbol.name)?;
                let mut text = format!("**import** `{}`\n\npath: `{}`", import.alias, import.path);
                if let Some(path) = workspace.resolve_alias(doc, &import.alias) {
                    if path.is_file() {
                        text.push_str(&format!("\n\nresolved: `{}`", path.display()));
                    } else {
                        text.push_str("\n\nfile not found");
                    }
                }
                text
            }
            SymbolKind::SetupQuery { alias } => {
                let target = workspace
                    .resolve_alias(doc, alias)
                    .and_then(|path| workspace.analysis_for_path(&path));
                match target.as_ref().and_then(|(_, t)| t.query(&symbol.name)) {
                    Some(query) => query_markdown(query, &format!("{alias}.")),
                    None => format!("**{alias}.** `{}` (not found)", symbol.name),
                }
            }
            SymbolKind::Parameter { query } => {
                let uses = symbols
                    .query(query)
                    .map(|q| q.parameter_ranges(&symbol.name).len())
                    .unwrap_or(0);
                format!(
                    "**parameter** `${}` of `{query}`\n\nused {uses} time(s) in the query body",
                    symbol.name
                )
            }
            SymbolKind::ReturnField { query } => {
                let item = symbols
                    .query(query)
                    .and_then(|q| q.metadata.as_ref())
                    .and_then(|m| m.return_item(&symbol.name));
                match item {
                    Some(item) => {
                        let mut text = format!(
                            "**return field** `{}` of `{query}`\n\nexpression: `{}`",
                            symbol.name, item.expression
                        );
                        if item.is_aggregate {
                            text.push_str("\n\naggregate");
                        }
                        text
                    }
                    None => format!("**field** `{}` (not returned by `{query}`)", symbol.name),
                }
            }
        };
        return Some((text, range));
    }

    let pos = to_source_pos(&doc.content, position);
    let token = token_at(&file.tokens, pos)?;
    match token.kind {
        TokenKind::Keyword(keyword) => {
            let docs = keyword_docs(keyword.as_str())?;
            Some((docs.to_string(), Some(span_to_range(&doc.content, token.span))))
        }
        _ => None,
    }
}

pub fn hover(workspace: &Workspace, doc: &Document, position: Position) -> Option<Hover> {
    let (value, range) = contents_for(workspace, doc, position)?;
    Some(Hover {
        contents: HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value,
        }),
        range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::offset_to_position;

    const SRC: &str = "query GetUser `MATCH (u {id: $id}) RETURN u.name AS name, count(u) AS n`\nGetUser {\n  test \"t\" {\n    $id: 1\n    n: 1\n  }\n}\n";

    fn hover_text(src: &str, needle: &str, delta: usize) -> Option<String> {
        let workspace = Workspace::default();
        let doc = workspace.update(Url::parse("untitled:main").unwrap(), 1, src.to_string());
        let position = offset_to_position(src, src.find(needle).unwrap() + delta);
        hover(&workspace, &doc, position).map(|h| match h.contents {
            HoverContents::Markup(m) => m.value,
            _ => unreachable!(),
        })
    }

    #[test]
    fn query_hover_lists_parameters_and_returns() {
        let text = hover_text(SRC, "GetUser {", 2).unwrap();
        assert!(text.starts_with("**query** `GetUser`"));
        assert!(text.contains("Parameters: `$id`"));
        assert!(text.contains("Returns: `name`, `n`"));
    }

    #[test]
    fn keyword_hover() {
        let text = hover_text(SRC, "test", 1).unwrap();
        assert!(text.starts_with("Test case."));
    }

    #[test]
    fn aggregate_field_hover() {
        let text = hover_text(SRC, "n: 1", 0).unwrap();
        assert!(text.contains("expression: `count(u)`"));
        assert!(text.contains("aggregate"));
    }

    #[test]
    fn parameter_hover_counts_body_uses() {
        let text = hover_text(SRC, "$id: 1", 1).unwrap();
        assert!(text.contains("used 1 time(s)"));
    }

    #[test]
    fn nothing_over_punctuation() {
        assert!(hover_text(SRC, "{\n  test", 0).is_none());
    }
}
