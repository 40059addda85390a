use scaf_dsl::ast::{Span, Suite, TestOrGroup};
use tower_lsp::lsp_types::*;

use crate::analysis::default_alias;
use crate::utils::span_to_range;

#[allow(deprecated)]
fn make_document_symbol(
    source: &str,
    name: String,
    kind: SymbolKind,
    detail: Option<String>,
    span: Span,
    selection: Span,
    children: Option<Vec<DocumentSymbol>>,
) -> DocumentSymbol {
    DocumentSymbol {
        name,
        detail,
        kind,
        tags: None,
        deprecated: None,
        range: span_to_range(source, span),
        selection_range: span_to_range(source, selection),
        children,
    }
}

fn sort_document_symbols(symbols: &mut [DocumentSymbol]) {
    symbols.sort_by_key(|symbol| (symbol.range.start, symbol.range.end));
    for children in symbols.iter_mut().filter_map(|s| s.children.as_mut()) {
        sort_document_symbols(children);
    }
}

fn item_symbols(source: &str, items: &[TestOrGroup]) -> Vec<DocumentSymbol> {
    items
        .iter()
        .map(|item| match item {
            TestOrGroup::Test(test) => make_document_symbol(
                source,
                test.name.as_ref().map_or_else(|| "test".to_string(), |n| n.value.clone()),
                SymbolKind::METHOD,
                Some("test".to_string()),
                test.span,
                test.name.as_ref().map_or(test.span, |n| n.span),
                None,
            ),
            TestOrGroup::Group(group) => make_document_symbol(
                source,
                group.name.as_ref().map_or_else(|| "group".to_string(), |n| n.value.clone()),
                SymbolKind::NAMESPACE,
                Some("group".to_string()),
                group.span,
                group.name.as_ref().map_or(group.span, |n| n.span),
                Some(item_symbols(source, &group.items)),
            ),
        })
        .collect()
}

/// Outline of a file: imports, queries and scopes with their groups and tests.
pub fn document_symbols(source: &str, suite: &Suite) -> Vec<DocumentSymbol> {
    let mut symbols = Vec::new();

    for import in &suite.imports {
        let path = import.path.as_ref().map(|p| p.value.as_str());
        let name = match (&import.alias, path) {
            (Some(alias), _) => alias.name.clone(),
            (None, Some(path)) => match default_alias(path) {
                Some(alias) => alias,
                None => continue,
            },
            (None, None) => continue,
        };
        let selection = import
            .alias
            .as_ref()
            .map(|a| a.span)
            .or_else(|| import.path.as_ref().map(|p| p.span))
            .unwrap_or(import.span);
        symbols.push(make_document_symbol(
            source,
            name,
            SymbolKind::MODULE,
            path.map(|p| format!("import from \"{p}\"")),
            import.span,
            selection,
            None,
        ));
    }

    for query in &suite.queries {
        if query.name.name.is_empty() {
            continue;
        }
        symbols.push(make_document_symbol(
            source,
            query.name.name.clone(),
            SymbolKind::FUNCTION,
            Some("query".to_string()),
            query.span,
            query.name.span,
            None,
        ));
    }

    for scope in &suite.scopes {
        symbols.push(make_document_symbol(
            source,
            scope.query.name.clone(),
            SymbolKind::NAMESPACE,
            Some("scope".to_string()),
            scope.span,
            scope.query.span,
            Some(item_symbols(source, &scope.items)),
        ));
    }

    sort_document_symbols(&mut symbols);
    symbols
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaf_dsl::parse_with_recovery;

    #[test]
    fn outline_nests_groups_and_tests() {
        let src = "import \"./shared/db\"\nquery Q `RETURN 1 AS one`\nQ {\n  group \"g\" {\n    test \"inner\" {}\n  }\n  test \"outer\" {}\n}\n";
        let suite = parse_with_recovery(src).suite;
        let symbols = document_symbols(src, &suite);
        let names: Vec<&str> = symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db", "Q", "Q"]);
        assert_eq!(symbols[0].kind, SymbolKind::MODULE);
        assert_eq!(symbols[1].kind, SymbolKind::FUNCTION);

        let scope = &symbols[2];
        let children = scope.children.as_ref().unwrap();
        assert_eq!(children[0].name, "g");
        assert_eq!(children[0].children.as_ref().unwrap()[0].name, "inner");
        assert_eq!(children[1].name, "outer");
        assert_eq!(children[1].kind, SymbolKind::METHOD);
    }

    #[test]
    fn selection_is_inside_range() {
        let src = "query Q `RETURN 1 AS one`\nQ {\n  test \"t\" {\n    one: 1\n  }\n}\n";
        let suite = parse_with_recovery(src).suite;
        for symbol in document_symbols(src, &suite) {
            assert!(symbol.selection_range.start >= symbol.range.start);
            assert!(symbol.selection_range.end <= symbol.range.end);
        }
    }
}
