//! Shared server state: open documents, the file loader and settings.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tower_lsp::lsp_types::Url;
use walkdir::WalkDir;

use crate::analysis::{AnalyzedFile, Analyzer};
use crate::config::ServerConfig;
use crate::document::{uri_to_path, Document, DocumentStore};
use crate::loader::{clean_path, FileLoader};

#[derive(Debug)]
pub struct Workspace {
    pub documents: DocumentStore,
    pub loader: FileLoader,
    root: RwLock<Option<PathBuf>>,
    config: RwLock<ServerConfig>,
}

impl Default for Workspace {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Workspace {
    pub fn new(config: ServerConfig) -> Self {
        let analyzer = Analyzer::for_dialect(&config.dialect);
        Self {
            documents: DocumentStore::new(),
            loader: FileLoader::new(analyzer),
            root: RwLock::new(None),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> ServerConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set_config(&self, config: ServerConfig) {
        if self.config().dialect != config.dialect {
            self.loader.set_analyzer(Analyzer::for_dialect(&config.dialect));
        }
        if let Ok(mut slot) = self.config.write() {
            *slot = config;
        }
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.root.read().ok()?.clone()
    }

    pub fn set_root(&self, root: Option<PathBuf>) {
        if let Ok(mut slot) = self.root.write() {
            *slot = root.map(|r| clean_path(&r));
        }
    }

    fn analyze(&self, uri: &Url, text: &str) -> Arc<AnalyzedFile> {
        let path = uri_to_path(uri);
        Arc::new(
            self.loader
                .analyzer()
                .analyze(path.as_deref(), text, Some(&self.loader)),
        )
    }

    /// Analyse `text` and store it as the new state of `uri`.
    ///
    /// The loader's cached disk copy of the file is evicted, so its next load
    /// re-reads the file from disk. Editor buffers are never fed to the loader.
    pub fn update(&self, uri: Url, version: i32, text: String) -> Arc<Document> {
        if let Some(path) = uri_to_path(&uri) {
            self.loader.invalidate_path(&path);
        }
        let analysis = self.analyze(&uri, &text);
        let previous = self.documents.get(&uri);
        let doc = Document::new(uri, version, text, analysis, previous.as_deref());
        tracing::debug!(uri = %doc.uri, version, "document updated");
        self.documents.insert(doc)
    }

    pub fn close(&self, uri: &Url) -> Option<Arc<Document>> {
        self.documents.remove(uri)
    }

    /// Forget cached disk state for `path` after an external change.
    pub fn file_changed(&self, path: &Path) {
        self.loader.invalidate_path(path);
    }

    /// Re-analyse every open document against the current disk state.
    pub fn reanalyze_open(&self) -> Vec<Arc<Document>> {
        self.documents
            .all()
            .into_iter()
            .map(|doc| {
                let analysis = self.analyze(&doc.uri, &doc.content);
                let next = Document::new(
                    doc.uri.clone(),
                    doc.version,
                    doc.content.clone(),
                    analysis,
                    Some(&doc),
                );
                self.documents.insert(next)
            })
            .collect()
    }

    /// Analysis of the file at `path`: the open document if there is one,
    /// otherwise the loader's cached disk analysis.
    pub fn analysis_for_path(&self, path: &Path) -> Option<(Url, Arc<AnalyzedFile>)> {
        if let Some(doc) = self.documents.find_by_path(path) {
            return Some((doc.uri.clone(), doc.analysis.clone()));
        }
        let analysis = match self.loader.load_and_analyze(path) {
            Ok(analysis) => analysis,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "cannot analyze file");
                return None;
            }
        };
        let uri = Url::from_file_path(path).ok()?;
        Some((uri, analysis))
    }

    /// `.scaf` files under the workspace root that are not open documents.
    pub fn disk_files(&self) -> Vec<PathBuf> {
        let Some(root) = self.root() else {
            return Vec::new();
        };
        let open = self.documents.open_paths();
        WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| clean_path(e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == scaf_dsl::FILE_EXTENSION))
            .filter(|p| !open.contains(p))
            .collect()
    }

    /// Resolved absolute path of `alias` as imported by `doc`.
    pub fn resolve_alias(&self, doc: &Document, alias: &str) -> Option<PathBuf> {
        let base = doc.path.as_deref()?;
        let import = doc.symbol_analysis().import(alias)?;
        if import.path.is_empty() {
            return None;
        }
        Some(self.loader.resolve_import_path(base, &import.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn disk_files_skip_open_documents_and_other_extensions() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.scaf"), "").unwrap();
        fs::write(dir.path().join("nested/b.scaf"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("open.scaf"), "").unwrap();

        let workspace = Workspace::default();
        assert!(workspace.disk_files().is_empty());
        workspace.set_root(Some(dir.path().to_path_buf()));
        let open = Url::from_file_path(dir.path().join("open.scaf")).unwrap();
        workspace.update(open, 1, String::new());

        let mut names: Vec<String> = workspace
            .disk_files()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.scaf", "b.scaf"]);
    }

    #[test]
    fn update_keeps_last_valid_analysis() {
        let workspace = Workspace::default();
        let uri = Url::parse("untitled:doc").unwrap();
        workspace.update(uri.clone(), 1, "query Q `RETURN 1`\n".to_string());
        let broken = workspace.update(uri.clone(), 2, "query Q `RETURN 1`\nQ {\n  test \"t\" {\n    $\n".to_string());

        assert!(broken.analysis.has_parse_errors());
        assert_eq!(broken.version, 2);
        assert!(broken.symbol_analysis().query("Q").is_some());
        assert!(!broken.symbol_analysis().has_parse_errors());

        assert!(workspace.close(&uri).is_some());
        assert!(workspace.documents.get(&uri).is_none());
    }

    #[test]
    fn file_changes_evict_the_loader_cache() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("fixtures.scaf");
        fs::write(&target, "query A `RETURN 1`\n").unwrap();
        let workspace = Workspace::default();

        let (_, analysis) = workspace.analysis_for_path(&target).unwrap();
        assert!(analysis.query("A").is_some());
        assert!(workspace.loader.is_cached(&target));

        fs::write(&target, "query B `RETURN 1`\n").unwrap();
        workspace.file_changed(&target);
        assert!(!workspace.loader.is_cached(&target));
        let (_, analysis) = workspace.analysis_for_path(&target).unwrap();
        assert!(analysis.query("B").is_some());
    }

    #[test]
    fn set_config_replaces_settings() {
        let workspace = Workspace::default();
        let config = ServerConfig {
            workspace_references: false,
            ..ServerConfig::default()
        };
        workspace.set_config(config.clone());
        assert_eq!(workspace.config(), config);
    }
}
