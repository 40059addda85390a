use tower_lsp::lsp_types::*;

use crate::document::Document;
use crate::references::{symbol_at, SymbolKind};
use crate::utils::{offset_to_range, span_to_range};
use crate::workspace::Workspace;

fn file_start(uri: Url) -> Location {
    Location::new(uri, Range::new(Position::new(0, 0), Position::new(0, 0)))
}

pub fn goto_definition(workspace: &Workspace, doc: &Document, position: Position) -> Option<GotoDefinitionResponse> {
    let file = &doc.analysis;
    let symbol = symbol_at(file, position)?;

    let location = match &symbol.kind {
        SymbolKind::Query => {
            let query = file.query(&symbol.name)?;
            Location::new(doc.uri.clone(), span_to_range(&file.source, query.name_span))
        }
        SymbolKind::ImportAlias => {
            let path = workspace.resolve_alias(doc, &symbol.name)?;
            if !path.is_file() {
                return None;
            }
            file_start(Url::from_file_path(&path).ok()?)
        }
        SymbolKind::SetupQuery { alias } => {
            let path = workspace.resolve_alias(doc, alias)?;
            let (uri, target) = workspace.analysis_for_path(&path)?;
            match target.query(&symbol.name) {
                Some(query) => Location::new(uri, span_to_range(&target.source, query.name_span)),
                None => file_start(uri),
            }
        }
        SymbolKind::Parameter { query } => {
            let (start, end) = *file.query(query)?.parameter_ranges(&symbol.name).first()?;
            Location::new(doc.uri.clone(), offset_to_range(&file.source, start, end))
        }
        SymbolKind::ReturnField { query } => {
            let (start, end) = file.query(query)?.return_field_range(&symbol.name)?;
            Location::new(doc.uri.clone(), offset_to_range(&file.source, start, end))
        }
    };
    tracing::debug!(symbol = %symbol.name, target = %location.uri, "definition");
    Some(GotoDefinitionResponse::Scalar(location))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::offset_to_position;
    use std::fs;
    use tempfile::TempDir;

    fn location(response: GotoDefinitionResponse) -> Location {
        match response {
            GotoDefinitionResponse::Scalar(location) => location,
            other => panic!("expected one location, got {other:?}"),
        }
    }

    #[test]
    fn definitions_across_files() {
        let dir = TempDir::new().unwrap();
        let fixtures = dir.path().join("fixtures.scaf");
        fs::write(&fixtures, "// fixtures\nquery CreateUser `CREATE (:User {id: $id})`\n").unwrap();
        let main = dir.path().join("main.scaf");
        let src = "import fixtures \"./fixtures\"\nsetup fixtures.CreateUser($id: 1)\n";
        let workspace = Workspace::default();
        let doc = workspace.update(Url::from_file_path(&main).unwrap(), 1, src.to_string());
        let fixtures_uri = Url::from_file_path(&fixtures).unwrap();

        let at = |needle: &str| offset_to_position(src, src.rfind(needle).unwrap() + 1);

        let query = location(goto_definition(&workspace, &doc, at("CreateUser")).unwrap());
        assert_eq!(query.uri, fixtures_uri);
        assert_eq!(query.range, Range::new(Position::new(1, 6), Position::new(1, 16)));

        let alias = location(goto_definition(&workspace, &doc, at("fixtures.")).unwrap());
        assert_eq!(alias, file_start(fixtures_uri.clone()));

        let import = location(goto_definition(&workspace, &doc, Position::new(0, 9)).unwrap());
        assert_eq!(import, file_start(fixtures_uri));
    }

    #[test]
    fn local_definitions() {
        let src = "query Q `MATCH (u {id: $id}) RETURN u.name AS name`\nQ {\n  test \"t\" {\n    $id: 1\n    name: \"x\"\n  }\n}\n";
        let workspace = Workspace::default();
        let doc = workspace.update(Url::parse("untitled:x").unwrap(), 1, src.to_string());
        let at = |needle: &str| offset_to_position(src, src.find(needle).unwrap() + 1);
        let range_text = |l: Location| {
            let start = crate::utils::position_to_offset(src, l.range.start);
            let end = crate::utils::position_to_offset(src, l.range.end);
            (start, src[start..end].to_string())
        };

        let query = location(goto_definition(&workspace, &doc, at("Q {")).unwrap());
        assert_eq!(range_text(query), (6, "Q".to_string()));

        let param = location(goto_definition(&workspace, &doc, at("$id: 1")).unwrap());
        assert_eq!(range_text(param), (src.find("$id").unwrap(), "$id".to_string()));

        let field = location(goto_definition(&workspace, &doc, at("name: \"x\"")).unwrap());
        assert_eq!(range_text(field), (src.find("AS name").unwrap() + 3, "name".to_string()));
    }

    #[test]
    fn missing_import_has_no_definition() {
        let src = "import gone \"./gone\"\nsetup gone.X()\n";
        let workspace = Workspace::default();
        let doc = workspace.update(Url::parse("file:///nowhere/main.scaf").unwrap(), 1, src.to_string());
        assert!(goto_definition(&workspace, &doc, Position::new(1, 7)).is_none());
    }
}
