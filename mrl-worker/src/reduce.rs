use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::naming::{map_output_file, reduce_input_file, reduce_output_file, reduce_partial_file};
use common::store::{FileStore, PairSink, PairSource, PairStore};
use common::stream::{output_stream, value_stream, ValueFeed};
use common::transport::{DefaultTransport, Location, Transport};
use common::{Pair, Phase, TaskConfig, TaskError, Workload};

use crate::invocation::{Deadline, Invocation};

/// What a finished reduce task did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceStats {
    /// Pairs read from the merged input.
    pub records: u64,
    /// Distinct keys, i.e. reduce function invocations.
    pub groups: u64,
    /// Pairs written to the output store.
    pub emitted: u64,
}

/// The one key group whose reduce function is currently running.
struct Group {
    values: ValueFeed,
    invocation: Invocation,
}

impl Group {
    fn open(workload: &Arc<dyn Workload>, key: String, deadline: Deadline) -> Self {
        let (values, receiver) = value_stream();
        let (sender, pairs) = output_stream();
        let call = {
            let workload = Arc::clone(workload);
            let key = key.clone();
            async move { workload.reduce(key, receiver, sender).await }
        };

        debug!("opening group {key:?}");
        Self {
            values,
            invocation: Invocation::spawn(Phase::Reduce, key, pairs, deadline, call),
        }
    }

    fn key(&self) -> &str {
        &self.invocation.key
    }

    /// Hands one value to the reduce function. Pairs the function emits
    /// while it still receives input are persisted in the meantime, so a
    /// function that streams its results cannot stall the engine.
    async fn forward(&mut self, value: String, sink: &mut dyn PairSink) -> Result<(), TaskError> {
        loop {
            tokio::select! {
                expiry = self.invocation.deadline.expired() => {
                    return Err(self.invocation.expired(expiry));
                }
                permit = self.values.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(value);
                            Ok(())
                        }
                        Err(_) => Err(self.invocation.rejected().await),
                    };
                }
                pair = self.invocation.output.recv(), if self.invocation.output_open => {
                    self.invocation.accept(pair, sink).await?;
                }
            }
        }
    }

    /// Ends the value stream, persists the rest of the output and waits for
    /// the function to return.
    async fn close(mut self, sink: &mut dyn PairSink) -> Result<u64, TaskError> {
        if let Err(err) = self.settle(sink).await {
            self.abandon().await;
            return Err(err);
        }
        let Group { values, invocation } = self;
        drop(values);
        invocation.complete(sink).await
    }

    /// Waits until the function has taken the last value forwarded to it,
    /// persisting its output in the meantime.
    async fn settle(&mut self, sink: &mut dyn PairSink) -> Result<(), TaskError> {
        loop {
            tokio::select! {
                expiry = self.invocation.deadline.expired() => {
                    return Err(self.invocation.expired(expiry));
                }
                taken = self.values.drained() => {
                    return if taken {
                        Ok(())
                    } else {
                        Err(self.invocation.rejected().await)
                    };
                }
                pair = self.invocation.output.recv(), if self.invocation.output_open => {
                    self.invocation.accept(pair, sink).await?;
                }
            }
        }
    }

    async fn abandon(self) {
        let Group { values, invocation } = self;
        drop(values);
        invocation.abandon().await;
    }
}

/// Reduce task `index` of a computation shaped by `config`.
///
/// `sources[m]` is where map task `m` left its bucket stores. The task
/// writes its result to `reduce_{index}_output.kv` in `work_dir`.
pub struct ReduceTask {
    config: TaskConfig,
    index: usize,
    sources: Vec<Location>,
    work_dir: PathBuf,
    transport: Arc<dyn Transport>,
    store: Arc<dyn PairStore>,
}

impl ReduceTask {
    pub fn new(
        config: TaskConfig,
        index: usize,
        sources: Vec<Location>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            index,
            sources,
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

    pub fn output_path(&self) -> PathBuf {
        self.work_dir.join(reduce_output_file(self.index))
    }

    /// Merges bucket `index` of every map task, calls the reduce function
    /// once per key in ascending key order, and stores what it emits.
    #[tracing::instrument(name = "reduce", skip_all, fields(task = self.index))]
    pub async fn process(
        &self,
        workload: Arc<dyn Workload>,
        cancel: &CancellationToken,
    ) -> Result<ReduceStats, TaskError> {
        self.config.check_reduce_index(self.index)?;
        if self.sources.len() != self.config.map_tasks {
            return Err(TaskError::Config(format!(
                "reduce task {} has {} sources but M = {}",
                self.index,
                self.sources.len(),
                self.config.map_tasks
            )));
        }
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| TaskError::store(&self.work_dir, e))?;

        let mut partials = Vec::with_capacity(self.sources.len());
        for (map_index, source) in self.sources.iter().enumerate() {
            let dest = self.work_dir.join(reduce_partial_file(self.index, map_index));
            self.transport
                .fetch(source, &map_output_file(map_index, self.index), &dest)
                .await?;
            partials.push(dest);
        }

        let input_path = self.work_dir.join(reduce_input_file(self.index));
        let mut input = self.store.merge(&partials, &input_path).await?;
        let mut output = self.store.create(&self.output_path()).await?;

        let mut stats = ReduceStats::default();
        let mut current = None;
        let result = self
            .reduce_groups(
                &workload,
                input.as_mut(),
                output.as_mut(),
                &mut current,
                &mut stats,
                cancel,
            )
            .await;

        if let Err(err) = result {
            if let Some(group) = current.take() {
                group.abandon().await;
            }
            // Release the output store; the first error is the one reported.
            let _ = output.finish().await;
            return Err(err);
        }
        output.finish().await?;

        info!(
            "reduce task {} folded {} records into {} groups, {} pairs",
            self.index, stats.records, stats.groups, stats.emitted
        );
        Ok(stats)
    }

    async fn reduce_groups(
        &self,
        workload: &Arc<dyn Workload>,
        input: &mut dyn PairSource,
        output: &mut dyn PairSink,
        current: &mut Option<Group>,
        stats: &mut ReduceStats,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        while let Some(Pair { key, value }) = input.next().await? {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            stats.records += 1;

            let same_group = matches!(current, Some(group) if group.key() == key);
            if !same_group {
                if let Some(group) = current.take() {
                    if key.as_str() < group.key() {
                        let err = TaskError::store(
                            self.work_dir.join(reduce_input_file(self.index)),
                            anyhow::anyhow!("key {key:?} follows {:?}; input is not sorted", group.key()),
                        );
                        group.abandon().await;
                        return Err(err);
                    }
                    stats.emitted += group.close(output).await?;
                    stats.groups += 1;
                }
                let deadline = Deadline::start(cancel, self.config.invocation_timeout);
                *current = Some(Group::open(workload, key, deadline));
            }

            if let Some(group) = current.as_mut() {
                group.forward(value, output).await?;
            }
        }

        if let Some(group) = current.take() {
            stats.emitted += group.close(output).await?;
            stats.groups += 1;
        }
        Ok(())
    }
}
