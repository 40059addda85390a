//! Rename: validation, conflict checks and the workspace edit.
//!
//! Edits come from the same reference search as find-references, so the set
//! of renamed locations always equals the set of references with the
//! declaration included.

use std::collections::HashMap;

use scaf_dsl::lexer::Keyword;
use thiserror::Error;
use tower_lsp::lsp_types::*;

use crate::analysis::AnalyzedFile;
use crate::document::Document;
use crate::references::{collect_references, symbol_at, ReferenceError, SymbolAt, SymbolKind};
use crate::utils::{is_valid_identifier, span_to_range};
use crate::workspace::Workspace;

#[derive(Debug, Error)]
pub enum RenameError {
    #[error("nothing to rename at this position")]
    NotRenameable,

    #[error("'{name}' is not a valid {what}")]
    InvalidName { name: String, what: &'static str },

    #[error("{what} '{name}' already exists")]
    NameConflict { name: String, what: &'static str },

    #[error("document not found: {0}")]
    DocumentNotFound(Url),

    #[error(transparent)]
    References(#[from] ReferenceError),
}

fn describe(kind: &SymbolKind) -> &'static str {
    match kind {
        SymbolKind::Query | SymbolKind::SetupQuery { .. } => "query name",
        SymbolKind::ImportAlias => "import alias",
        SymbolKind::Parameter { .. } => "parameter name",
        SymbolKind::ReturnField { .. } => "return field name",
    }
}

/// Range of the renameable symbol under the cursor, or `None`.
///
/// An import without an alias renames by inserting one, so its placeholder
/// is the derived alias rather than the path text.
pub fn prepare_rename(doc: &Document, position: Position) -> Option<PrepareRenameResponse> {
    let symbol = symbol_at(&doc.analysis, position)?;
    let range = span_to_range(&doc.content, symbol.span);
    if symbol.derived_import {
        return Some(PrepareRenameResponse::RangeWithPlaceholder {
            range,
            placeholder: symbol.name,
        });
    }
    Some(PrepareRenameResponse::Range(range))
}

fn validate_name(kind: &SymbolKind, new_name: &str) -> Result<(), RenameError> {
    let invalid = || RenameError::InvalidName {
        name: new_name.to_string(),
        what: describe(kind),
    };
    let bare = match kind {
        SymbolKind::Parameter { .. } => new_name.strip_prefix('$').ok_or_else(invalid)?,
        _ => new_name,
    };
    let valid = match kind {
        SymbolKind::ReturnField { .. } => bare.split('.').all(is_valid_identifier),
        _ => is_valid_identifier(bare),
    };
    if !valid || Keyword::from_word(bare).is_some() {
        return Err(invalid());
    }
    Ok(())
}

fn check_conflict(
    workspace: &Workspace,
    doc: &Document,
    symbol: &SymbolAt,
    new_name: &str,
) -> Result<(), RenameError> {
    let file: &AnalyzedFile = &doc.analysis;
    let bare = new_name.trim_start_matches('$');
    if bare == symbol.name {
        return Ok(());
    }
    let taken = match &symbol.kind {
        SymbolKind::Query => file.query(bare).is_some(),
        SymbolKind::ImportAlias => file.import(bare).is_some(),
        SymbolKind::SetupQuery { alias } => workspace
            .resolve_alias(doc, alias)
            .and_then(|path| workspace.analysis_for_path(&path))
            .is_some_and(|(_, target)| target.query(bare).is_some()),
        SymbolKind::Parameter { query } => file.query(query).is_some_and(|q| q.has_parameter(bare)),
        SymbolKind::ReturnField { query } => file
            .query(query)
            .and_then(|q| q.metadata.as_ref())
            .is_some_and(|m| m.return_item(bare).is_some()),
    };
    if taken {
        return Err(RenameError::NameConflict {
            name: new_name.to_string(),
            what: describe(&symbol.kind),
        });
    }
    Ok(())
}

pub fn rename(
    workspace: &Workspace,
    doc: &Document,
    position: Position,
    new_name: &str,
) -> Result<WorkspaceEdit, RenameError> {
    let symbol = symbol_at(&doc.analysis, position).ok_or(RenameError::NotRenameable)?;
    validate_name(&symbol.kind, new_name)?;
    check_conflict(workspace, doc, &symbol, new_name)?;

    let references = collect_references(workspace, doc, &symbol, true)?;
    if references.is_empty() {
        return Err(RenameError::NotRenameable);
    }

    let mut changes: HashMap<Url, Vec<TextEdit>> = HashMap::new();
    for reference in references {
        let new_text = match &reference.derived_import {
            Some(path_literal) => format!("{new_name} {path_literal}"),
            None => new_name.to_string(),
        };
        changes
            .entry(reference.uri)
            .or_default()
            .push(TextEdit::new(reference.range, new_text));
    }

    tracing::info!(
        old = %symbol.name,
        new = new_name,
        files = changes.len(),
        "rename"
    );
    Ok(WorkspaceEdit {
        changes: Some(changes),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::find_references;
    use crate::utils::offset_to_position;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    const SRC: &str = "import fixtures \"./fixtures\"\nquery GetUser `MATCH (u:User {id: $id}) RETURN u.name AS name`\nquery Other `RETURN 1 AS one`\nGetUser {\n  setup fixtures.CreateUser()\n  test \"t\" {\n    $id: 1\n    name: \"a\"\n    assert { (name == \"a\") }\n  }\n}\n";

    fn open(src: &str) -> (Workspace, std::sync::Arc<Document>) {
        let workspace = Workspace::default();
        let doc = workspace.update(Url::parse("untitled:main").unwrap(), 1, src.to_string());
        (workspace, doc)
    }

    fn at(src: &str, needle: &str, nth: usize) -> Position {
        offset_to_position(src, src.match_indices(needle).nth(nth).unwrap().0 + 1)
    }

    type RangeKey = (Url, (u32, u32, u32, u32));

    fn key(uri: Url, range: Range) -> RangeKey {
        let (s, e) = (range.start, range.end);
        (uri, (s.line, s.character, e.line, e.character))
    }

    fn edit_ranges(edit: &WorkspaceEdit) -> HashSet<RangeKey> {
        edit.changes
            .as_ref()
            .unwrap()
            .iter()
            .flat_map(|(uri, edits)| edits.iter().map(move |e| key(uri.clone(), e.range)))
            .collect()
    }

    fn apply(src: &str, edits: &[TextEdit]) -> String {
        let mut out = src.to_string();
        let mut sorted = edits.to_vec();
        sorted.sort_by_key(|e| std::cmp::Reverse((e.range.start.line, e.range.start.character)));
        for e in sorted {
            let start = crate::utils::position_to_offset(&out, e.range.start);
            let end = crate::utils::position_to_offset(&out, e.range.end);
            out.replace_range(start..end, &e.new_text);
        }
        out
    }

    #[test]
    fn renamed_locations_equal_references() {
        let (workspace, doc) = open(SRC);
        for (needle, nth, new_name) in [
            ("GetUser", 1, "FindUser"),
            ("fixtures", 0, "fx"),
            ("$id", 1, "$key"),
            ("name:", 0, "label"),
        ] {
            let position = at(SRC, needle, nth);
            let refs: HashSet<RangeKey> = find_references(&workspace, &doc, position, true)
                .into_iter()
                .map(|l| key(l.uri, l.range))
                .collect();
            let edit = rename(&workspace, &doc, position, new_name).unwrap();
            assert_eq!(edit_ranges(&edit), refs, "renaming {needle}");
        }
    }

    #[test]
    fn parameter_rename_rewrites_body_and_tests() {
        let (workspace, doc) = open(SRC);
        let edit = rename(&workspace, &doc, at(SRC, "$id", 1), "$key").unwrap();
        let edits = &edit.changes.unwrap()[&doc.uri];
        let renamed = apply(SRC, edits);
        assert!(renamed.contains("{id: $key}"));
        assert!(renamed.contains("    $key: 1"));
    }

    #[test]
    fn return_field_rename_keeps_keyword_and_literals() {
        let src = "query Q `MATCH (u) RETURN u.name as a`\nQ {\n  test \"t\" {\n    a: \"a\"\n    assert { (a == \"a\") }\n  }\n}\n";
        let (workspace, doc) = open(src);
        let edit = rename(&workspace, &doc, at(src, " a: ", 0), "label").unwrap();
        let renamed = apply(src, &edit.changes.unwrap()[&doc.uri]);
        assert_eq!(
            renamed,
            "query Q `MATCH (u) RETURN u.name as label`\nQ {\n  test \"t\" {\n    label: \"a\"\n    assert { (label == \"a\") }\n  }\n}\n"
        );
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (workspace, doc) = open(SRC);
        let err = rename(&workspace, &doc, at(SRC, "$id", 1), "key").unwrap_err();
        assert!(matches!(err, RenameError::InvalidName { .. }));
        let err = rename(&workspace, &doc, at(SRC, "GetUser", 1), "1abc").unwrap_err();
        assert!(matches!(err, RenameError::InvalidName { .. }));
        let err = rename(&workspace, &doc, at(SRC, "GetUser", 1), "test").unwrap_err();
        assert!(matches!(err, RenameError::InvalidName { .. }));
    }

    #[test]
    fn conflicting_names_are_rejected() {
        let (workspace, doc) = open(SRC);
        let err = rename(&workspace, &doc, at(SRC, "GetUser", 1), "Other").unwrap_err();
        assert_eq!(err.to_string(), "query name 'Other' already exists");
    }

    #[test]
    fn nothing_to_rename_in_whitespace() {
        let (workspace, doc) = open(SRC);
        let err = rename(&workspace, &doc, Position::new(3, 9), "X").unwrap_err();
        assert!(matches!(err, RenameError::NotRenameable));
        assert!(prepare_rename(&doc, Position::new(3, 9)).is_none());
    }

    #[test]
    fn renaming_a_derived_alias_inserts_it() {
        let src = "import \"./shared/db\"\nsetup db.Seed()\n";
        let (workspace, doc) = open(src);
        let position = at(src, "db\"", 0);
        match prepare_rename(&doc, position) {
            Some(PrepareRenameResponse::RangeWithPlaceholder { placeholder, .. }) => {
                assert_eq!(placeholder, "db")
            }
            other => panic!("unexpected prepare result {other:?}"),
        }
        let edit = rename(&workspace, &doc, position, "store").unwrap();
        let renamed = apply(src, &edit.changes.unwrap()[&doc.uri]);
        assert_eq!(renamed, "import store \"./shared/db\"\nsetup store.Seed()\n");
    }

    #[test]
    fn cross_file_setup_query_rename_edits_every_file() {
        let dir = TempDir::new().unwrap();
        let fixtures = dir.path().join("fixtures.scaf");
        fs::write(&fixtures, "query CreateUser `CREATE (u:User)`\nquery CreatePost `CREATE (p)`\n").unwrap();
        let main = dir.path().join("main.scaf");
        let src = "import fixtures \"./fixtures\"\nsetup fixtures.CreateUser()\n";
        let workspace = Workspace::default();
        workspace.set_root(Some(dir.path().to_path_buf()));
        let doc = workspace.update(Url::from_file_path(&main).unwrap(), 1, src.to_string());

        let position = at(src, "CreateUser", 0);
        let edit = rename(&workspace, &doc, position, "MakeUser").unwrap();
        let changes = edit.changes.unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains_key(&Url::from_file_path(&fixtures).unwrap()));

        let err = rename(&workspace, &doc, position, "CreatePost").unwrap_err();
        assert!(matches!(err, RenameError::NameConflict { .. }));
    }

    #[test]
    fn alias_rename_keeps_setup_calls_on_the_same_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fixtures.scaf"), "query CreateUser `CREATE (u:User)`\n").unwrap();
        let src = "import fixtures \"./fixtures\"\nsetup { fixtures.CreateUser(), fixtures }\n";
        let workspace = Workspace::default();
        let uri = Url::from_file_path(dir.path().join("main.scaf")).unwrap();
        let doc = workspace.update(uri.clone(), 1, src.to_string());
        let before = workspace.resolve_alias(&doc, "fixtures").unwrap();

        let edit = rename(&workspace, &doc, at(src, "fixtures", 0), "fx").unwrap();
        let renamed = apply(src, &edit.changes.unwrap()[&uri]);
        assert_eq!(renamed, "import fx \"./fixtures\"\nsetup { fx.CreateUser(), fx }\n");

        let doc = workspace.update(uri, 2, renamed);
        for setup in doc.analysis.suite.all_setups() {
            for item in &setup.items {
                let alias = &item.module().unwrap().name;
                assert_eq!(workspace.resolve_alias(&doc, alias).as_ref(), Some(&before));
            }
        }
        assert!(doc.analysis.diagnostics_with_code(crate::analysis::codes::UNDEFINED_SETUP_QUERY).next().is_none());
    }
}
