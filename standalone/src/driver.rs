//! Runs a whole job in this process: split, map, reduce, merge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::naming::reduce_output_file;
use common::store::{FileStore, PairStore};
use common::transport::Location;
use common::{TaskConfig, TaskError, Workload};
use mrl_worker::{MapTask, ReduceTask};

use crate::split::{input_files, split_inputs};

pub struct Job {
    /// Glob pattern for the input files.
    pub input: String,
    pub workload: Arc<dyn Workload>,
    pub output: PathBuf,
    pub config: TaskConfig,
    pub work_dir: PathBuf,
}

impl Job {
    fn source_dir(&self) -> PathBuf {
        self.work_dir.join("source")
    }

    fn map_dir(&self, n: usize) -> PathBuf {
        self.work_dir.join(format!("map-{n}"))
    }

    fn reduce_dir(&self, n: usize) -> PathBuf {
        self.work_dir.join(format!("reduce-{n}"))
    }
}

/// Runs `job` to completion and returns the number of result pairs written
/// to its output file.
pub async fn run(job: &Job, cancel: &CancellationToken) -> anyhow::Result<u64> {
    job.config.validate()?;

    let files = input_files(&job.input)?;
    let records = split_inputs(&files, job.config.map_tasks, &job.source_dir()).await?;
    info!(
        "split {} files into {} records for {} map tasks",
        files.len(),
        records,
        job.config.map_tasks
    );

    let phase = cancel.child_token();
    let mut maps = JoinSet::new();
    for n in 0..job.config.map_tasks {
        let task = MapTask::new(
            job.config,
            n,
            Location::Dir(job.source_dir()),
            job.map_dir(n),
        );
        let workload = Arc::clone(&job.workload);
        let cancel = phase.clone();
        maps.spawn(async move { (n, task.process(workload, &cancel).await) });
    }
    let map_stats = join_phase("map", maps, &phase).await?;
    info!(
        "map phase emitted {} pairs",
        map_stats.iter().map(|stats| stats.emitted).sum::<u64>()
    );

    let sources: Vec<Location> = (0..job.config.map_tasks)
        .map(|m| Location::Dir(job.map_dir(m)))
        .collect();
    let phase = cancel.child_token();
    let mut reduces = JoinSet::new();
    for n in 0..job.config.reduce_tasks {
        let task = ReduceTask::new(job.config, n, sources.clone(), job.reduce_dir(n));
        let workload = Arc::clone(&job.workload);
        let cancel = phase.clone();
        reduces.spawn(async move { (n, task.process(workload, &cancel).await) });
    }
    let reduce_stats = join_phase("reduce", reduces, &phase).await?;
    info!(
        "reduce phase folded {} groups",
        reduce_stats.iter().map(|stats| stats.groups).sum::<u64>()
    );

    let outputs: Vec<PathBuf> = (0..job.config.reduce_tasks)
        .map(|n| job.reduce_dir(n).join(reduce_output_file(n)))
        .collect();
    write_output(&outputs, &job.work_dir.join("merged.kv"), &job.output).await
}

/// Waits for every task of a phase. The first failure cancels the rest of
/// the phase and is the error returned.
async fn join_phase<T: 'static>(
    name: &str,
    mut tasks: JoinSet<(usize, Result<T, TaskError>)>,
    phase: &CancellationToken,
) -> anyhow::Result<Vec<T>> {
    let mut done = Vec::with_capacity(tasks.len());
    let mut first_err = None;

    while let Some(joined) = tasks.join_next().await {
        let (n, result) = match joined {
            Ok(joined) => joined,
            Err(err) => {
                phase.cancel();
                first_err.get_or_insert(anyhow!("{name} task panicked: {err}"));
                continue;
            }
        };
        match result {
            Ok(stats) => done.push((n, stats)),
            Err(err) => {
                if first_err.is_none() {
                    warn!("{name} task {n} failed, cancelling the rest of the phase");
                    phase.cancel();
                    first_err = Some(anyhow::Error::new(err).context(format!("{name} task {n} failed")));
                }
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }
    done.sort_by_key(|(n, _)| *n);
    Ok(done.into_iter().map(|(_, stats)| stats).collect())
}

/// Merges the reduce outputs by key and writes them as `key value` lines.
async fn write_output(outputs: &[PathBuf], merged: &Path, dest: &Path) -> anyhow::Result<u64> {
    let mut source = FileStore.merge(outputs, merged).await?;

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("failed to create output {}", dest.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut written = 0u64;
    while let Some(pair) = source.next().await? {
        writer.write_all(format!("{pair}\n").as_bytes()).await?;
        written += 1;
    }
    writer.flush().await?;
    Ok(written)
}
