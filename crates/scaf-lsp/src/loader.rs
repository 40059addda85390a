//! Import resolution and the cross-file cache.
//!
//! All import path heuristics live here. Cached entries are keyed by cleaned
//! absolute path and are only evicted through `invalidate_path` or
//! `invalidate_all`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::analysis::{AnalyzedFile, Analyzer};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid UTF-8", path.display())]
    NotUtf8 { path: PathBuf },
}

#[derive(Debug, Default)]
struct LoaderCache {
    contents: HashMap<PathBuf, Arc<str>>,
    analyses: HashMap<PathBuf, Arc<AnalyzedFile>>,
}

#[derive(Debug)]
pub struct FileLoader {
    analyzer: RwLock<Analyzer>,
    cache: RwLock<LoaderCache>,
}

/// Lexically normalise a path: drop `.` segments and fold `..` into their
/// parent. The file system is not consulted.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl FileLoader {
    pub fn new(analyzer: Analyzer) -> Self {
        Self {
            analyzer: RwLock::new(analyzer),
            cache: RwLock::new(LoaderCache::default()),
        }
    }

    pub fn analyzer(&self) -> Analyzer {
        self.analyzer
            .read()
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Swap the analyzer, dropping every cached analysis made with the old one.
    pub fn set_analyzer(&self, analyzer: Analyzer) {
        if let Ok(mut slot) = self.analyzer.write() {
            *slot = analyzer;
        }
        if let Ok(mut cache) = self.cache.write() {
            cache.analyses.clear();
        }
    }

    /// Resolve `import` relative to the directory of `base`.
    ///
    /// Tries the joined path, then the path with `.scaf` appended, then a
    /// unique `<path>*.scaf` glob match. Falls back to the `.scaf` candidate,
    /// which may not exist.
    pub fn resolve_import_path(&self, base: &Path, import: &str) -> PathBuf {
        let dir = base.parent().unwrap_or_else(|| Path::new(""));
        let joined = clean_path(&dir.join(import));
        if joined.is_file() {
            return joined;
        }

        let has_extension = joined
            .extension()
            .is_some_and(|ext| ext == scaf_dsl::FILE_EXTENSION);
        let with_extension = if has_extension {
            joined.clone()
        } else {
            let mut name = OsString::from(joined.as_os_str());
            name.push(".");
            name.push(scaf_dsl::FILE_EXTENSION);
            PathBuf::from(name)
        };
        if with_extension.is_file() {
            return with_extension;
        }

        if !has_extension {
            let pattern = format!(
                "{}*.{}",
                glob::Pattern::escape(&joined.to_string_lossy()),
                scaf_dsl::FILE_EXTENSION
            );
            match glob::glob(&pattern) {
                Ok(paths) => {
                    let matches: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
                    if let [only] = matches.as_slice() {
                        return only.clone();
                    }
                    if matches.len() > 1 {
                        tracing::debug!(
                            import,
                            candidates = matches.len(),
                            "ambiguous import, not picking a dialect variant"
                        );
                    }
                }
                Err(err) => tracing::debug!(%pattern, error = %err, "invalid import glob"),
            }
        }

        with_extension
    }

    /// File contents, read through the cache.
    pub fn load(&self, path: &Path) -> Result<Arc<str>, LoaderError> {
        let key = clean_path(path);
        if let Ok(cache) = self.cache.read() {
            if let Some(contents) = cache.contents.get(&key) {
                return Ok(contents.clone());
            }
        }

        // Read outside the lock.
        let bytes = std::fs::read(&key).map_err(|source| LoaderError::Io {
            path: key.clone(),
            source,
        })?;
        let text = String::from_utf8(bytes).map_err(|_| LoaderError::NotUtf8 { path: key.clone() })?;
        let contents: Arc<str> = Arc::from(text);
        tracing::debug!(path = %key.display(), bytes = contents.len(), "loaded file");

        if let Ok(mut cache) = self.cache.write() {
            cache.contents.insert(key, contents.clone());
        }
        Ok(contents)
    }

    /// Analysis of the file at `path`, through the cache.
    ///
    /// The loaded file's own imports are not followed.
    pub fn load_and_analyze(&self, path: &Path) -> Result<Arc<AnalyzedFile>, LoaderError> {
        let key = clean_path(path);
        if let Ok(cache) = self.cache.read() {
            if let Some(analysis) = cache.analyses.get(&key) {
                return Ok(analysis.clone());
            }
        }

        let contents = self.load(&key)?;
        let analysis = Arc::new(self.analyzer().analyze(Some(&key), &contents, None));

        if let Ok(mut cache) = self.cache.write() {
            cache.analyses.insert(key, analysis.clone());
        }
        Ok(analysis)
    }

    pub fn invalidate_path(&self, path: &Path) {
        let key = clean_path(path);
        if let Ok(mut cache) = self.cache.write() {
            let had_contents = cache.contents.remove(&key).is_some();
            let had_analysis = cache.analyses.remove(&key).is_some();
            if had_contents || had_analysis {
                tracing::debug!(path = %key.display(), "invalidated cached file");
            }
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.contents.clear();
            cache.analyses.clear();
        }
    }

    pub fn is_cached(&self, path: &Path) -> bool {
        let key = clean_path(path);
        self.cache
            .read()
            .map(|cache| cache.contents.contains_key(&key) || cache.analyses.contains_key(&key))
            .unwrap_or(false)
    }
}

impl Default for FileLoader {
    fn default() -> Self {
        Self::new(Analyzer::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn clean_path_folds_parent_segments() {
        assert_eq!(
            clean_path(Path::new("/a/b/./../c/d.scaf")),
            PathBuf::from("/a/c/d.scaf")
        );
        assert_eq!(clean_path(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn resolves_exact_then_extension() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.scaf");
        fs::write(dir.path().join("fixtures.scaf"), "query A `RETURN 1`").unwrap();
        let loader = FileLoader::default();
        assert_eq!(
            loader.resolve_import_path(&main, "./fixtures"),
            dir.path().join("fixtures.scaf")
        );
        assert_eq!(
            loader.resolve_import_path(&main, "./fixtures.scaf"),
            dir.path().join("fixtures.scaf")
        );
    }

    #[test]
    fn resolves_unique_dialect_variant() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.scaf");
        fs::write(dir.path().join("db.cypher.scaf"), "").unwrap();
        let loader = FileLoader::default();
        assert_eq!(
            loader.resolve_import_path(&main, "./db"),
            dir.path().join("db.cypher.scaf")
        );
    }

    #[test]
    fn ambiguous_variants_fall_back_to_plain_candidate() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("main.scaf");
        fs::write(dir.path().join("db.cypher.scaf"), "").unwrap();
        fs::write(dir.path().join("db.sql.scaf"), "").unwrap();
        let loader = FileLoader::default();
        let resolved = loader.resolve_import_path(&main, "./db");
        assert_eq!(resolved, dir.path().join("db.scaf"));
        assert!(!resolved.exists());
    }

    #[test]
    fn analysis_is_cached_until_invalidated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.scaf");
        fs::write(&path, "query A `RETURN 1`").unwrap();
        let loader = FileLoader::default();

        let first = loader.load_and_analyze(&path).unwrap();
        assert!(first.query("A").is_some());

        fs::write(&path, "query B `RETURN 1`").unwrap();
        let cached = loader.load_and_analyze(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        loader.invalidate_path(&path);
        assert!(!loader.is_cached(&path));
        let fresh = loader.load_and_analyze(&path).unwrap();
        assert!(fresh.query("B").is_some());
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.scaf");
        fs::write(&path, "").unwrap();
        let loader = FileLoader::default();
        loader.load(&path).unwrap();
        assert!(loader.is_cached(&path));
        loader.invalidate_all();
        assert!(!loader.is_cached(&path));
    }

    #[test]
    fn missing_file_is_an_error() {
        let loader = FileLoader::default();
        let err = loader.load(Path::new("/definitely/not/here.scaf")).unwrap_err();
        assert!(matches!(err, LoaderError::Io { .. }));
    }

    #[test]
    fn loaded_files_do_not_follow_their_imports() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("c.scaf"), "query C `RETURN 1`").unwrap();
        fs::write(
            dir.path().join("b.scaf"),
            "import c \"./c\"\nsetup c.Missing()\n",
        )
        .unwrap();
        let loader = FileLoader::default();
        let b = loader.load_and_analyze(&dir.path().join("b.scaf")).unwrap();
        // Without transitive resolution the bad call in b goes unreported.
        assert!(b
            .diagnostics
            .iter()
            .all(|d| d.code != crate::analysis::codes::UNDEFINED_SETUP_QUERY));
    }
}
