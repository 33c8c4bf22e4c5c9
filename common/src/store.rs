//! Pair stores: where tasks keep their inputs and outputs.
//!
//! The engine only talks to the [`PairStore`] traits. [`FileStore`] keeps
//! one store per file in the [`codec`](crate::codec) line format and merges
//! stores with an external sort, so a reduce input never has to fit in
//! memory.

use std::fs;
use std::io::{self, prelude::*, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ext_sort::{buffer::LimitedBufferBuilder, ExternalSorter, ExternalSorterBuilder};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, Lines};
use tracing::debug;

use crate::codec::{decode_line, encode_line};
use crate::{Pair, TaskError};

/// Records held in memory per sorted run before spilling to disk.
const SORT_BUFFER_RECORDS: usize = 1 << 20;

/// Write half of a store, owned by exactly one task.
#[async_trait]
pub trait PairSink: Send {
    async fn insert(&mut self, pair: Pair) -> Result<(), TaskError>;

    /// Flushes everything inserted so far and returns the number of pairs
    /// written. Inserting after `finish` is not supported.
    async fn finish(&mut self) -> Result<u64, TaskError>;
}

/// Read half of a store: a lazy scan over its pairs.
#[async_trait]
pub trait PairSource: Send {
    async fn next(&mut self) -> Result<Option<Pair>, TaskError>;
}

#[async_trait]
pub trait PairStore: Send + Sync {
    /// Creates (or truncates) the store at `path`.
    async fn create(&self, path: &Path) -> Result<Box<dyn PairSink>, TaskError>;

    /// Opens an existing store for scanning in stored order.
    async fn open(&self, path: &Path) -> Result<Box<dyn PairSource>, TaskError>;

    /// Merges `sources` into a new store at `dest`, ordered by key
    /// ascending. Duplicates are kept; values of one key keep the order of
    /// `sources` and, within a source, their stored order.
    async fn merge(&self, sources: &[PathBuf], dest: &Path)
        -> Result<Box<dyn PairSource>, TaskError>;
}

/// Creates a store and fills it with `pairs`.
pub async fn create_with<I>(store: &dyn PairStore, path: &Path, pairs: I) -> Result<u64, TaskError>
where
    I: IntoIterator<Item = Pair>,
{
    let mut sink = store.create(path).await?;
    for pair in pairs {
        sink.insert(pair).await?;
    }
    sink.finish().await
}

/// Reads every pair of a store in stored order.
pub async fn read_all(store: &dyn PairStore, path: &Path) -> Result<Vec<Pair>, TaskError> {
    let mut source = store.open(path).await?;
    let mut pairs = Vec::new();
    while let Some(pair) = source.next().await? {
        pairs.push(pair);
    }
    Ok(pairs)
}

/////////////////////////////////////////////////////////////////////////////
// File-backed stores
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

#[async_trait]
impl PairStore for FileStore {
    async fn create(&self, path: &Path) -> Result<Box<dyn PairSink>, TaskError> {
        Ok(Box::new(FileSink::create(path).await?))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn PairSource>, TaskError> {
        Ok(Box::new(FileSource::open(path).await?))
    }

    async fn merge(
        &self,
        sources: &[PathBuf],
        dest: &Path,
    ) -> Result<Box<dyn PairSource>, TaskError> {
        let (sources_owned, dest_owned) = (sources.to_vec(), dest.to_path_buf());
        let merged = tokio::task::spawn_blocking(move || merge_sorted(&sources_owned, &dest_owned))
            .await
            .map_err(|e| TaskError::store(dest, e))?
            .map_err(|e| TaskError::store(dest, e))?;

        debug!("merged {} pairs from {} stores into {}", merged, sources.len(), dest.display());
        self.open(dest).await
    }
}

pub struct FileSink {
    path: PathBuf,
    writer: tokio::io::BufWriter<File>,
    count: u64,
}

impl FileSink {
    pub async fn create(path: &Path) -> Result<Self, TaskError> {
        let file = File::create(path)
            .await
            .map_err(|e| TaskError::store(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: tokio::io::BufWriter::new(file),
            count: 0,
        })
    }
}

#[async_trait]
impl PairSink for FileSink {
    async fn insert(&mut self, pair: Pair) -> Result<(), TaskError> {
        self.writer
            .write_all(encode_line(&pair).as_bytes())
            .await
            .map_err(|e| TaskError::store(&self.path, e))?;
        self.count += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<u64, TaskError> {
        self.writer
            .flush()
            .await
            .map_err(|e| TaskError::store(&self.path, e))?;
        Ok(self.count)
    }
}

pub struct FileSource {
    path: PathBuf,
    lines: Lines<tokio::io::BufReader<File>>,
    line_no: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self, TaskError> {
        let file = File::open(path)
            .await
            .map_err(|e| TaskError::store(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: tokio::io::BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait]
impl PairSource for FileSource {
    async fn next(&mut self) -> Result<Option<Pair>, TaskError> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| TaskError::store(&self.path, e))?;
            self.line_no += 1;

            match line {
                None => return Ok(None),
                Some(line) if line.is_empty() => continue,
                Some(line) => {
                    let pair = decode_line(&line)
                        .with_context(|| format!("corrupt record on line {}", self.line_no))
                        .map_err(|e| TaskError::store(&self.path, e))?;
                    return Ok(Some(pair));
                }
            }
        }
    }
}

/// Sort record of a merge. Ordering by `(key, seq)` groups equal keys and
/// keeps their values in arrival order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct SortRecord {
    key: String,
    seq: u64,
    value: String,
}

fn merge_sorted(sources: &[PathBuf], dest: &Path) -> anyhow::Result<u64> {
    let mut readers = Vec::with_capacity(sources.len());
    for path in sources {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open merge source {}", path.display()))?;
        readers.push(BufReader::new(file));
    }

    let mut seq = 0u64;
    let input = readers
        .into_iter()
        .flat_map(BufRead::lines)
        .filter(|line| !matches!(line, Ok(line) if line.is_empty()))
        .map(move |line| -> io::Result<SortRecord> {
            let pair = decode_line(&line?)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:#}")))?;
            seq += 1;
            Ok(SortRecord {
                key: pair.key,
                seq,
                value: pair.value,
            })
        });

    let scratch_parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let scratch = tempfile::Builder::new()
        .prefix(".merge-")
        .tempdir_in(scratch_parent)
        .context("failed to create merge scratch directory")?;

    let sorter: ExternalSorter<SortRecord, io::Error, LimitedBufferBuilder> =
        ExternalSorterBuilder::new()
            .with_tmp_dir(scratch.path())
            .with_buffer(LimitedBufferBuilder::new(SORT_BUFFER_RECORDS, false))
            .build()
            .map_err(|e| anyhow!("failed to build external sorter: {e}"))?;

    let sorted = sorter
        .sort(input)
        .map_err(|e| anyhow!("external sort failed: {e}"))?;

    let mut output_writer = BufWriter::new(
        fs::File::create(dest)
            .with_context(|| format!("failed to create merged store {}", dest.display()))?,
    );
    let mut count = 0u64;
    for record in sorted {
        let record = record.map_err(|e| anyhow!("external sort failed: {e}"))?;
        let pair = Pair {
            key: record.key,
            value: record.value,
        };
        output_writer.write_all(encode_line(&pair).as_bytes())?;
        count += 1;
    }
    output_writer.flush()?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<Pair> {
        raw.iter().map(|(k, v)| Pair::new(*k, *v)).collect()
    }

    #[tokio::test]
    async fn stored_pairs_scan_back_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.kv");
        let input = pairs(&[("b", "1"), ("a", "2"), ("b", "3")]);

        let written = create_with(&FileStore, &path, input.clone()).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(read_all(&FileStore, &path).await.unwrap(), input);
    }

    #[tokio::test]
    async fn opening_a_missing_store_is_a_store_error() {
        let dir = tempdir().unwrap();
        let err = FileStore
            .open(&dir.path().join("missing.kv"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::Store { .. }));
    }

    #[tokio::test]
    async fn corrupt_lines_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.kv");
        tokio::fs::write(&path, "not a record\n").await.unwrap();

        let mut source = FileStore.open(&path).await.unwrap();
        let err = source.next().await.unwrap_err();
        assert!(matches!(err, TaskError::Store { .. }));
    }

    #[tokio::test]
    async fn merge_orders_by_key_and_keeps_value_arrival_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.kv");
        let second = dir.path().join("second.kv");
        create_with(&FileStore, &first, pairs(&[("the", "a"), ("cat", "b"), ("the", "c")]))
            .await
            .unwrap();
        create_with(&FileStore, &second, pairs(&[("dog", "d"), ("the", "e"), ("cat", "f")]))
            .await
            .unwrap();

        let dest = dir.path().join("merged.kv");
        let mut merged = FileStore.merge(&[first, second], &dest).await.unwrap();
        let mut out = Vec::new();
        while let Some(pair) = merged.next().await.unwrap() {
            out.push(pair);
        }

        assert_eq!(
            out,
            pairs(&[
                ("cat", "b"),
                ("cat", "f"),
                ("dog", "d"),
                ("the", "a"),
                ("the", "c"),
                ("the", "e"),
            ])
        );
    }

    #[tokio::test]
    async fn merge_of_empty_stores_is_empty() {
        let dir = tempdir().unwrap();
        let empty = dir.path().join("empty.kv");
        create_with(&FileStore, &empty, Vec::new()).await.unwrap();

        let dest = dir.path().join("merged.kv");
        let mut merged = FileStore.merge(&[empty], &dest).await.unwrap();
        assert_eq!(merged.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn merge_with_a_missing_source_fails() {
        let dir = tempdir().unwrap();
        let result = FileStore
            .merge(&[dir.path().join("nope.kv")], &dir.path().join("merged.kv"))
            .await;
        assert!(matches!(result, Err(TaskError::Store { .. })));
    }
}
