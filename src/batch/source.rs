//! Work sources: ordered, resumable item sequences

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;

use crate::batch::types::Item;

/// Errors produced while reading a work source
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkSourceError {
    /// May succeed if the run is resumed later
    #[error("Transient source error: {0}")]
    Transient(String),

    /// Will not go away by retrying
    #[error("Permanent source error: {0}")]
    Permanent(String),
}

impl WorkSourceError {
    /// Whether a resumed run could get past this error
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkSourceError::Transient(_))
    }

    /// Error message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            WorkSourceError::Transient(message) | WorkSourceError::Permanent(message) => message,
        }
    }

    fn cursor_not_found(cursor: &str) -> Self {
        WorkSourceError::Permanent(format!("cursor '{}' not found in source", cursor))
    }
}

/// Stream of items produced by a work source
pub type ItemStream<'a> = BoxStream<'a, Result<Item, WorkSourceError>>;

/// A finite, ordered, deterministic sequence of items
///
/// Resumption is only correct if `resume_from` yields the same sequence
/// relative to a given cursor across restarts.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Logical identifier of the source
    fn source_id(&self) -> &str;

    /// Number of items, when known up front
    async fn total_items(&self) -> Option<u64> {
        None
    }

    /// Items strictly after `cursor`, or all items when `cursor` is `None`
    async fn resume_from(&self, cursor: Option<&str>) -> Result<ItemStream<'_>, WorkSourceError>;
}

/// In-memory work source over a fixed list of items
#[derive(Debug, Clone)]
pub struct VecWorkSource {
    source_id: String,
    items: Vec<Item>,
}

impl VecWorkSource {
    /// Source over the given items
    pub fn new(source_id: impl Into<String>, items: Vec<Item>) -> Self {
        Self {
            source_id: source_id.into(),
            items,
        }
    }

    /// Source whose items carry only keys
    pub fn from_keys<I, K>(source_id: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::new(source_id, keys.into_iter().map(Item::keyed).collect())
    }

    /// Items in source order
    pub fn items(&self) -> &[Item] {
        &self.items
    }
}

#[async_trait]
impl WorkSource for VecWorkSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn total_items(&self) -> Option<u64> {
        Some(self.items.len() as u64)
    }

    async fn resume_from(&self, cursor: Option<&str>) -> Result<ItemStream<'_>, WorkSourceError> {
        let start = match cursor {
            None => 0,
            Some(cursor) => self
                .items
                .iter()
                .position(|item| item.key == cursor)
                .map(|position| position + 1)
                .ok_or_else(|| WorkSourceError::cursor_not_found(cursor))?,
        };
        Ok(stream::iter(self.items[start..].iter().cloned().map(Ok)).boxed())
    }
}

/// Work source reading one item per line of a text file
///
/// Blank lines and lines starting with `#` are skipped. The key is the text
/// before the first tab; anything after it becomes a string payload.
#[derive(Debug, Clone)]
pub struct LinesWorkSource {
    source_id: String,
    path: PathBuf,
}

impl LinesWorkSource {
    /// Source over the file at `path`
    pub fn new(source_id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn open(&self) -> Result<LinesStream<BufReader<File>>, WorkSourceError> {
        let file = File::open(&self.path).await.map_err(|e| {
            WorkSourceError::Transient(format!("cannot open {}: {}", self.path.display(), e))
        })?;
        Ok(LinesStream::new(BufReader::new(file).lines()))
    }
}

fn parse_line(line: &str) -> Option<Item> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line.trim_start().starts_with('#') {
        return None;
    }
    match line.split_once('\t') {
        Some((key, rest)) => Some(Item::new(key.trim(), Value::String(rest.to_string()))),
        None => Some(Item::keyed(line.trim())),
    }
}

struct LineCursor {
    lines: LinesStream<BufReader<File>>,
    skip_through: Option<String>,
    done: bool,
}

#[async_trait]
impl WorkSource for LinesWorkSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn total_items(&self) -> Option<u64> {
        let mut lines = self.open().await.ok()?;
        let mut count = 0;
        while let Some(line) = lines.next().await {
            if parse_line(&line.ok()?).is_some() {
                count += 1;
            }
        }
        Some(count)
    }

    async fn resume_from(&self, cursor: Option<&str>) -> Result<ItemStream<'_>, WorkSourceError> {
        let state = LineCursor {
            lines: self.open().await?,
            skip_through: cursor.map(str::to_owned),
            done: false,
        };

        let items = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            loop {
                match state.lines.next().await {
                    Some(Ok(line)) => {
                        let Some(item) = parse_line(&line) else { continue };
                        if let Some(cursor) = &state.skip_through {
                            if item.key == *cursor {
                                state.skip_through = None;
                            }
                            continue;
                        }
                        return Some((Ok(item), state));
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(WorkSourceError::Transient(e.to_string())), state));
                    }
                    None => {
                        state.done = true;
                        return state
                            .skip_through
                            .take()
                            .map(|cursor| (Err(WorkSourceError::cursor_not_found(&cursor)), state));
                    }
                }
            }
        });

        Ok(items.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    async fn keys(source: &dyn WorkSource, cursor: Option<&str>) -> Vec<String> {
        source
            .resume_from(cursor)
            .await
            .unwrap()
            .map(|item| item.unwrap().key)
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_vec_source_resumes_after_cursor() {
        let source = VecWorkSource::from_keys("denns", ["s1", "s2", "s3"]);
        assert_eq!(keys(&source, None).await, vec!["s1", "s2", "s3"]);
        assert_eq!(keys(&source, Some("s2")).await, vec!["s3"]);
        assert!(keys(&source, Some("s3")).await.is_empty());
        assert_eq!(source.total_items().await, Some(3));
    }

    #[tokio::test]
    async fn test_vec_source_unknown_cursor() {
        let source = VecWorkSource::from_keys("denns", ["s1"]);
        let err = source.resume_from(Some("zz")).await.err().unwrap();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_lines_source_skips_comments_and_resumes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# stores").unwrap();
        writeln!(file, "s1\t{{\"city\":\"Berlin\"}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "s2").unwrap();
        writeln!(file, "s3").unwrap();

        let source = LinesWorkSource::new("vollcorner", file.path());
        assert_eq!(source.total_items().await, Some(3));
        assert_eq!(keys(&source, None).await, vec!["s1", "s2", "s3"]);
        assert_eq!(keys(&source, Some("s1")).await, vec!["s2", "s3"]);

        let first = source.resume_from(None).await.unwrap().next().await.unwrap().unwrap();
        assert_eq!(first.payload, Value::String("{\"city\":\"Berlin\"}".to_string()));
    }

    #[tokio::test]
    async fn test_lines_source_missing_cursor_is_permanent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "s1").unwrap();

        let source = LinesWorkSource::new("vollcorner", file.path());
        let results: Vec<_> = source.resume_from(Some("gone")).await.unwrap().collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0], Err(WorkSourceError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_lines_source_missing_file_is_transient() {
        let source = LinesWorkSource::new("vollcorner", "/nonexistent/stores.txt");
        let err = source.resume_from(None).await.err().unwrap();
        assert!(err.is_transient());
    }
}
