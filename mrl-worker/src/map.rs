use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::naming::{map_input_file, map_output_file, map_source_file};
use common::store::{FileStore, PairSink, PairSource, PairStore};
use common::stream::output_stream;
use common::transport::{fetch_and_open, DefaultTransport, Location, Transport};
use common::{partition, Pair, Phase, TaskConfig, TaskError, Workload};

use crate::invocation::{Deadline, Invocation};

/// What a finished map task did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Input records the map function was called with.
    pub records: u64,
    /// Pairs emitted over all records.
    pub emitted: u64,
    /// Pairs written to each bucket, indexed by bucket.
    pub buckets: Vec<u64>,
}

/// The R output stores of one map task, addressed by [`partition`].
struct Partitioned {
    buckets: Vec<Box<dyn PairSink>>,
    counts: Vec<u64>,
}

impl Partitioned {
    fn new(buckets: Vec<Box<dyn PairSink>>) -> Self {
        let counts = vec![0; buckets.len()];
        Self { buckets, counts }
    }
}

#[async_trait]
impl PairSink for Partitioned {
    async fn insert(&mut self, pair: Pair) -> Result<(), TaskError> {
        let bucket = partition(&pair.key, self.buckets.len());
        self.buckets[bucket].insert(pair).await?;
        self.counts[bucket] += 1;
        Ok(())
    }

    /// Finishes every bucket, even after one of them failed, and reports the
    /// first failure.
    async fn finish(&mut self) -> Result<u64, TaskError> {
        let mut first_err = None;
        for bucket in &mut self.buckets {
            if let Err(err) = bucket.finish().await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(self.counts.iter().sum()),
        }
    }
}

/// Map task `index` of a computation shaped by `config`.
///
/// Reads `map_{index}_source.kv` from `source` and leaves its R bucket
/// stores `map_{index}_output_{b}.kv` in `work_dir`, which is the location
/// reduce tasks fetch them from.
pub struct MapTask {
    config: TaskConfig,
    index: usize,
    source: Location,
    work_dir: PathBuf,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PairStore>,
}

impl MapTask {
    pub fn new(
        config: TaskConfig,
        index: usize,
        source: Location,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            index,
            source,
            work_dir: work_dir.into(),
            transport: Arc::new(DefaultTransport::new()),
            store: Arc::new(FileStore),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn PairStore>) -> Self {
        self.store = store;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Path of the store holding this task's pairs for `bucket`.
    pub fn output_path(&self, bucket: usize) -> PathBuf {
        self.work_dir.join(map_output_file(self.index, bucket))
    }

    /// Runs the map function over every input record and partitions its
    /// output into the R bucket stores.
    ///
    /// Output stores written before a failure are left in place.
    #[tracing::instrument(name = "map", skip_all, fields(task = self.index))]
    pub async fn process(
        &self,
        workload: Arc<dyn Workload>,
        cancel: &CancellationToken,
    ) -> Result<MapStats, TaskError> {
        self.config.check_map_index(self.index)?;
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| TaskError::store(&self.work_dir, e))?;

        let input_path = self.work_dir.join(map_input_file(self.index));
        let mut input = fetch_and_open(
            self.transport.as_ref(),
            self.store.as_ref(),
            &self.source,
            &map_source_file(self.index),
            &input_path,
        )
        .await?;

        let mut buckets = Vec::with_capacity(self.config.reduce_tasks);
        for bucket in 0..self.config.reduce_tasks {
            buckets.push(self.store.create(&self.output_path(bucket)).await?);
        }
        let mut output = Partitioned::new(buckets);

        let mut stats = MapStats::default();
        let result = self
            .map_records(&workload, input.as_mut(), &mut output, &mut stats, cancel)
            .await;

        // Release every bucket store on the way out, failed or not.
        let finished = output.finish().await;
        result?;
        finished?;

        stats.buckets = output.counts;
        info!(
            "map task {} processed {} records into {} pairs",
            self.index, stats.records, stats.emitted
        );
        Ok(stats)
    }

    async fn map_records(
        &self,
        workload: &Arc<dyn Workload>,
        input: &mut dyn PairSource,
        output: &mut Partitioned,
        stats: &mut MapStats,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        while let Some(Pair { key, value }) = input.next().await? {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            stats.records += 1;

            let (sender, pairs) = output_stream();
            let call = {
                let workload = Arc::clone(workload);
                let key = key.clone();
                async move { workload.map(key, value, sender).await }
            };
            let deadline = Deadline::start(cancel, self.config.invocation_timeout);
            let invocation = Invocation::spawn(Phase::Map, key, pairs, deadline, call);

            let emitted = invocation.complete(output).await?;
            debug!("record {} emitted {} pairs", stats.records, emitted);
            stats.emitted += emitted;
        }
        Ok(())
    }
}
