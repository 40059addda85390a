use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tower_lsp::lsp_types::Url;

use crate::analysis::AnalyzedFile;
use crate::loader::clean_path;

/// One open editor buffer.
///
/// Replaced wholesale on every change; never mutated in place.
#[derive(Debug)]
pub struct Document {
    pub uri: Url,
    pub version: i32,
    pub content: String,
    /// Cleaned file-system path, when the URI is a `file:` URI.
    pub path: Option<PathBuf>,
    pub analysis: Arc<AnalyzedFile>,
    /// Most recent analysis without syntax errors.
    pub last_valid: Option<Arc<AnalyzedFile>>,
}

impl Document {
    pub fn new(
        uri: Url,
        version: i32,
        content: String,
        analysis: Arc<AnalyzedFile>,
        previous: Option<&Document>,
    ) -> Self {
        let last_valid = if analysis.has_parse_errors() {
            previous.and_then(|p| p.last_valid.clone())
        } else {
            Some(analysis.clone())
        };
        Self {
            path: uri_to_path(&uri),
            uri,
            version,
            content,
            analysis,
            last_valid,
        }
    }

    /// Analysis to use for symbol lookups: the current one unless it has
    /// syntax errors, then the last valid one, then the current one anyway.
    ///
    /// Spans must always come from `analysis`, which matches `content`.
    pub fn symbol_analysis(&self) -> &AnalyzedFile {
        if !self.analysis.has_parse_errors() {
            return &self.analysis;
        }
        self.last_valid.as_deref().unwrap_or(&self.analysis)
    }
}

pub fn uri_to_path(uri: &Url) -> Option<PathBuf> {
    if uri.scheme() != "file" {
        return None;
    }
    uri.to_file_path().ok().map(|p| clean_path(&p))
}

/// Open documents keyed by URI.
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: RwLock<HashMap<Url, Arc<Document>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &Url) -> Option<Arc<Document>> {
        self.docs.read().ok()?.get(uri).cloned()
    }

    pub fn insert(&self, doc: Document) -> Arc<Document> {
        let doc = Arc::new(doc);
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(doc.uri.clone(), doc.clone());
        }
        doc
    }

    pub fn remove(&self, uri: &Url) -> Option<Arc<Document>> {
        self.docs.write().ok()?.remove(uri)
    }

    /// Snapshot of every open document, sorted by URI.
    pub fn all(&self) -> Vec<Arc<Document>> {
        let Ok(docs) = self.docs.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = docs.values().cloned().collect();
        all.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
        all
    }

    /// The open document for a file path, whatever URI spelling it was
    /// opened under.
    pub fn find_by_path(&self, path: &Path) -> Option<Arc<Document>> {
        let key = clean_path(path);
        self.all()
            .into_iter()
            .find(|doc| doc.path.as_deref() == Some(key.as_path()))
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.all().iter().filter_map(|d| d.path.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;

    fn doc(uri: &str, text: &str, previous: Option<&Document>) -> Document {
        let uri = Url::parse(uri).unwrap();
        let analysis = Arc::new(Analyzer::default().analyze(None, text, None));
        Document::new(uri, 1, text.to_string(), analysis, previous)
    }

    #[test]
    fn last_valid_survives_broken_edits() {
        let good = doc("file:///w/a.scaf", "query A `RETURN 1`", None);
        assert!(good.last_valid.is_some());
        let broken = doc("file:///w/a.scaf", "query A `RETURN 1`\nA {", Some(&good));
        assert!(broken.analysis.has_parse_errors());
        let symbols = broken.symbol_analysis();
        assert!(!symbols.has_parse_errors());
        assert!(symbols.query("A").is_some());
    }

    #[test]
    fn broken_first_version_falls_back_to_current() {
        let broken = doc("file:///w/a.scaf", "query A `RETURN 1`\nA {", None);
        assert!(broken.last_valid.is_none());
        assert!(std::ptr::eq(broken.symbol_analysis(), broken.analysis.as_ref()));
    }

    #[test]
    fn store_finds_documents_by_path() {
        let store = DocumentStore::new();
        store.insert(doc("file:///w/sub/../a.scaf", "", None));
        assert!(store.find_by_path(Path::new("/w/a.scaf")).is_some());
        assert_eq!(store.len(), 1);
        store.remove(&Url::parse("file:///w/sub/../a.scaf").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn non_file_uris_have_no_path() {
        let d = doc("untitled:Untitled-1", "", None);
        assert!(d.path.is_none());
    }
}
