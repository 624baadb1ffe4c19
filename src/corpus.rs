//! Corpus ingest.
//!
//! A corpus path is either one HTML file or a directory whose top-level
//! `*.html` / `*.htm` entries are the documents. Listing is sorted by
//! absolute path so document order (and therefore exemplar selection and
//! output order) is stable across runs.

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// One HTML input. The simplified form is produced by the fetcher's
/// reduction step and is what the extractor and the model actually see.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub original_html: String,
    pub simplified_html: String,
}

/// Derive a document id from its file path (the file stem).
pub fn doc_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

fn is_html_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm")
    )
}

/// List the document paths for a corpus path.
///
/// A file must have an HTML extension; a directory must contain at least
/// one HTML file. Both violations are configuration errors, not IO errors:
/// the filesystem is fine, the input is not usable as a corpus.
pub fn list_corpus(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.exists() {
        return Err(PipelineError::Config(format!(
            "corpus path does not exist: {}",
            path.display()
        )));
    }

    if path.is_file() {
        if !is_html_file(path) {
            return Err(PipelineError::Config(format!(
                "corpus file is not an HTML file: {}",
                path.display()
            )));
        }
        let absolute = absolutize(path)?;
        return Ok(vec![absolute]);
    }

    if path.is_dir() {
        let entries = std::fs::read_dir(path).map_err(|e| PipelineError::io(path, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(path, e))?;
            let entry_path = entry.path();
            if entry_path.is_file() && is_html_file(&entry_path) {
                files.push(absolutize(&entry_path)?);
            }
        }
        files.sort();

        if files.is_empty() {
            return Err(PipelineError::Config(format!(
                "no HTML files found in directory: {}",
                path.display()
            )));
        }
        return Ok(files);
    }

    Err(PipelineError::Config(format!(
        "corpus path is neither a file nor a directory: {}",
        path.display()
    )))
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| PipelineError::io(path, e))
}

/// Drop documents whose file name matches any ignore pattern. Patterns
/// are pre-validated by config, so a failure to compile one here is an
/// internal error. Filtering everything away is treated like an empty
/// corpus.
pub fn apply_ignores(paths: Vec<PathBuf>, ignores: &[String]) -> Result<Vec<PathBuf>> {
    if ignores.is_empty() {
        return Ok(paths);
    }

    let patterns: Vec<glob::Pattern> = ignores
        .iter()
        .map(|raw| {
            glob::Pattern::new(raw)
                .map_err(|e| PipelineError::Internal(format!("unvalidated ignore '{raw}': {e}")))
        })
        .collect::<Result<_>>()?;

    let kept: Vec<PathBuf> = paths
        .into_iter()
        .filter(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            !patterns.iter().any(|p| p.matches(&name))
        })
        .collect();

    if kept.is_empty() {
        return Err(PipelineError::Config(
            "every corpus document is excluded by the ignore patterns".to_string(),
        ));
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn lists_html_files_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.html"), "<html></html>").unwrap();
        fs::write(dir.path().join("a.htm"), "<html></html>").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip me").unwrap();

        let files = list_corpus(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.htm"));
        assert!(files[1].ends_with("b.html"));
    }

    #[test]
    fn single_file_corpus() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("page.HTML");
        fs::write(&file, "<html></html>").unwrap();

        let files = list_corpus(&file).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(doc_id(&files[0]), "page");
    }

    #[test]
    fn non_html_file_is_config_error() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("data.json");
        fs::write(&file, "{}").unwrap();

        assert!(matches!(
            list_corpus(&file),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn empty_directory_is_config_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            list_corpus(dir.path()),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn ignore_patterns_filter_by_file_name() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("page.html"), "<html></html>").unwrap();
        fs::write(dir.path().join("page.draft.html"), "<html></html>").unwrap();

        let paths = list_corpus(dir.path()).unwrap();
        let kept = apply_ignores(paths, &["*.draft.html".to_string()]).unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].ends_with("page.html"));
    }

    #[test]
    fn ignoring_everything_is_a_config_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("page.html"), "<html></html>").unwrap();

        let paths = list_corpus(dir.path()).unwrap();
        assert!(matches!(
            apply_ignores(paths, &["*.html".to_string()]),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn missing_path_is_config_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            list_corpus(&missing),
            Err(PipelineError::Config(_))
        ));
    }
}
