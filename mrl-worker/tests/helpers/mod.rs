//! Shared fixtures for the map and reduce task tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::naming::{map_output_file, map_source_file};
use common::store::{create_with, read_all, FileStore, PairSink, PairSource, PairStore};
use common::transport::Location;
use common::{Pair, PairSender, TaskConfig, TaskError, ValueReceiver, Workload};
use mrl_worker::{MapTask, ReduceTask};

pub fn pairs(raw: &[(&str, &str)]) -> Vec<Pair> {
    raw.iter().map(|(k, v)| Pair::new(*k, *v)).collect()
}

/// A computation laid out in a temporary directory:
/// `source/` holds the map inputs, `map-{n}/` and `reduce-{n}/` are the
/// task work directories.
pub struct Fixture {
    pub root: TempDir,
    pub config: TaskConfig,
}

impl Fixture {
    pub fn new(map_tasks: usize, reduce_tasks: usize) -> Self {
        Self {
            root: tempfile::tempdir().expect("failed to create temp dir"),
            config: TaskConfig::new(map_tasks, reduce_tasks),
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.path().join("source")
    }

    pub fn map_dir(&self, n: usize) -> PathBuf {
        self.root.path().join(format!("map-{n}"))
    }

    pub fn reduce_dir(&self, n: usize) -> PathBuf {
        self.root.path().join(format!("reduce-{n}"))
    }

    /// Writes one input partition per map task.
    pub async fn seed_inputs(&self, partitions: Vec<Vec<Pair>>) {
        assert_eq!(partitions.len(), self.config.map_tasks);
        tokio::fs::create_dir_all(self.source_dir()).await.unwrap();
        for (n, records) in partitions.into_iter().enumerate() {
            let path = self.source_dir().join(map_source_file(n));
            create_with(&FileStore, &path, records).await.unwrap();
        }
    }

    /// Writes map outputs directly, bypassing the map phase.
    pub async fn seed_map_output(&self, map: usize, bucket: usize, records: Vec<Pair>) {
        tokio::fs::create_dir_all(self.map_dir(map)).await.unwrap();
        let path = self.map_dir(map).join(map_output_file(map, bucket));
        create_with(&FileStore, &path, records).await.unwrap();
    }

    pub fn map_task(&self, n: usize) -> MapTask {
        MapTask::new(
            self.config,
            n,
            Location::Dir(self.source_dir()),
            self.map_dir(n),
        )
    }

    pub fn reduce_task(&self, n: usize) -> ReduceTask {
        let sources = (0..self.config.map_tasks)
            .map(|m| Location::Dir(self.map_dir(m)))
            .collect();
        ReduceTask::new(self.config, n, sources, self.reduce_dir(n))
    }

    pub async fn run_maps(&self, workload: Arc<dyn Workload>) {
        let cancel = CancellationToken::new();
        for n in 0..self.config.map_tasks {
            self.map_task(n)
                .process(workload.clone(), &cancel)
                .await
                .unwrap_or_else(|e| panic!("map task {n} failed: {e}"));
        }
    }

    /// Runs every reduce task and returns all their output pairs.
    pub async fn run_reduces(&self, workload: Arc<dyn Workload>) -> Vec<Pair> {
        let cancel = CancellationToken::new();
        let mut out = Vec::new();
        for n in 0..self.config.reduce_tasks {
            let task = self.reduce_task(n);
            task.process(workload.clone(), &cancel)
                .await
                .unwrap_or_else(|e| panic!("reduce task {n} failed: {e}"));
            out.extend(read_all(&FileStore, &task.output_path()).await.unwrap());
        }
        out
    }
}

pub fn counts(pairs: &[Pair]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|pair| (pair.key.clone(), pair.value.clone()))
        .collect()
}

/////////////////////////////////////////////////////////////////////////////
// Workloads
/////////////////////////////////////////////////////////////////////////////

/// One reduce invocation as seen from inside the function.
#[derive(Debug, Clone)]
pub struct Call {
    pub key: String,
    pub values: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Splits values into words like word count, and records every reduce
/// call before emitting `(key, values joined by ',')`.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<Call>>,
    active: AtomicU64,
    pub max_active: AtomicU64,
}

#[async_trait]
impl Workload for Recorder {
    async fn map(&self, _key: String, value: String, output: PairSender) -> anyhow::Result<()> {
        for word in value.split_whitespace() {
            output.emit(word, "1").await?;
        }
        Ok(())
    }

    async fn reduce(
        &self,
        key: String,
        mut values: ValueReceiver,
        output: PairSender,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let mut seen = Vec::new();
        while let Some(value) = values.recv().await {
            // Give a wrongly overlapping engine the chance to show it.
            tokio::task::yield_now().await;
            seen.push(value);
        }
        output.emit(key.clone(), seen.join(",")).await?;

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            key,
            values: seen,
            started,
            finished: Instant::now(),
        });
        Ok(())
    }
}

/// Map and reduce functions that never finish.
pub struct Hang;

#[async_trait]
impl Workload for Hang {
    async fn map(&self, _key: String, _value: String, _output: PairSender) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn reduce(
        &self,
        _key: String,
        _values: ValueReceiver,
        _output: PairSender,
    ) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Reduce returns successfully without reading its values.
pub struct Quitter;

#[async_trait]
impl Workload for Quitter {
    async fn map(&self, _key: String, _value: String, _output: PairSender) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reduce(
        &self,
        _key: String,
        _values: ValueReceiver,
        _output: PairSender,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reduce emits one pair per value as soon as it receives it.
pub struct Streamer;

#[async_trait]
impl Workload for Streamer {
    async fn map(&self, key: String, value: String, output: PairSender) -> anyhow::Result<()> {
        output.emit(key, value).await?;
        Ok(())
    }

    async fn reduce(
        &self,
        key: String,
        mut values: ValueReceiver,
        output: PairSender,
    ) -> anyhow::Result<()> {
        while let Some(value) = values.recv().await {
            output.emit(key.clone(), value).await?;
        }
        Ok(())
    }
}

/// Every function call fails.
pub struct Broken;

#[async_trait]
impl Workload for Broken {
    async fn map(&self, key: String, _value: String, output: PairSender) -> anyhow::Result<()> {
        output.emit(key, "partial").await?;
        Err(anyhow!("boom"))
    }

    async fn reduce(
        &self,
        _key: String,
        _values: ValueReceiver,
        _output: PairSender,
    ) -> anyhow::Result<()> {
        panic!("reduce exploded");
    }
}

/////////////////////////////////////////////////////////////////////////////
// Stores
/////////////////////////////////////////////////////////////////////////////

/// File store whose sinks start failing at the `fail_at`-th insert,
/// counted over every sink it created.
pub struct FailingStore {
    fail_at: u64,
    inserts: Arc<AtomicU64>,
}

impl FailingStore {
    pub fn new(fail_at: u64) -> Self {
        Self {
            fail_at,
            inserts: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn attempted_inserts(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }
}

struct FailingSink {
    path: PathBuf,
    inner: Box<dyn PairSink>,
    fail_at: u64,
    inserts: Arc<AtomicU64>,
}

#[async_trait]
impl PairSink for FailingSink {
    async fn insert(&mut self, pair: Pair) -> Result<(), TaskError> {
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.fail_at {
            return Err(TaskError::store(&self.path, anyhow!("disk full")));
        }
        self.inner.insert(pair).await
    }

    async fn finish(&mut self) -> Result<u64, TaskError> {
        self.inner.finish().await
    }
}

#[async_trait]
impl PairStore for FailingStore {
    async fn create(&self, path: &Path) -> Result<Box<dyn PairSink>, TaskError> {
        Ok(Box::new(FailingSink {
            path: path.to_path_buf(),
            inner: FileStore.create(path).await?,
            fail_at: self.fail_at,
            inserts: Arc::clone(&self.inserts),
        }))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn PairSource>, TaskError> {
        FileStore.open(path).await
    }

    async fn merge(
        &self,
        sources: &[PathBuf],
        dest: &Path,
    ) -> Result<Box<dyn PairSource>, TaskError> {
        FileStore.merge(sources, dest).await
    }
}

/// File store whose merge skips sorting and just replays the first source.
pub struct UnsortedStore;

#[async_trait]
impl PairStore for UnsortedStore {
    async fn create(&self, path: &Path) -> Result<Box<dyn PairSink>, TaskError> {
        FileStore.create(path).await
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn PairSource>, TaskError> {
        FileStore.open(path).await
    }

    async fn merge(
        &self,
        sources: &[PathBuf],
        _dest: &Path,
    ) -> Result<Box<dyn PairSource>, TaskError> {
        FileStore.open(&sources[0]).await
    }
}
