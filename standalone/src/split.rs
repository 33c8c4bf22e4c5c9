//! Turns the input files into the M map source stores.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tracing::debug;

use common::naming::map_source_file;
use common::store::{FileStore, PairSink, PairStore};
use common::Pair;

/// Files matching `pattern`, in glob (alphabetical) order.
pub fn input_files(pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
    let files = glob::glob(pattern)
        .with_context(|| format!("invalid input pattern `{pattern}`"))?
        .collect::<Result<Vec<_>, _>>()?;
    if files.is_empty() {
        return Err(anyhow!("no input files match `{pattern}`"));
    }
    Ok(files)
}

/// Deals every non-empty line of `files` round-robin into `map_tasks`
/// source stores in `dest`. A line becomes the record
/// `("<file>:<line number>", line)`.
pub async fn split_inputs(files: &[PathBuf], map_tasks: usize, dest: &Path) -> anyhow::Result<u64> {
    tokio::fs::create_dir_all(dest).await?;

    let mut sinks: Vec<Box<dyn PairSink>> = Vec::with_capacity(map_tasks);
    for n in 0..map_tasks {
        sinks.push(FileStore.create(&dest.join(map_source_file(n))).await?);
    }

    let mut records = 0u64;
    for file in files {
        let text = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read input {}", file.display()))?;
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let key = format!("{}:{}", file.display(), line_no + 1);
            let sink = &mut sinks[records as usize % map_tasks];
            sink.insert(Pair::new(key, line)).await?;
            records += 1;
        }
        debug!("split {}", file.display());
    }

    for sink in &mut sinks {
        sink.finish().await?;
    }
    Ok(records)
}
