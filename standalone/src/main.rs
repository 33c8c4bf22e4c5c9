use std::time::Duration;

use anyhow::anyhow;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::TaskConfig;

mod args;
use args::{parse_args, Commands};

mod driver;
use driver::Job;

mod split;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    match parse_args() {
        Commands::Workloads => {
            for name in workload::NAMES {
                println!("{name}");
            }
        }
        Commands::Submit {
            input,
            workload,
            output,
            map_tasks,
            reduce_tasks,
            work_dir,
            timeout_secs,
        } => {
            let app = workload::try_named(&workload).ok_or_else(|| {
                anyhow!(
                    "unknown workload `{workload}`, expected one of: {}",
                    workload::NAMES.join(", ")
                )
            })?;

            let mut config = TaskConfig::new(map_tasks, reduce_tasks);
            if let Some(secs) = timeout_secs {
                config = config.with_invocation_timeout(Duration::from_secs(secs));
            }

            // Dropping the scratch directory removes it, so it lives until
            // the job is done.
            let (work_dir, _scratch) = match work_dir {
                Some(dir) => (dir, None),
                None => {
                    let scratch = tempfile::tempdir()?;
                    (scratch.path().to_path_buf(), Some(scratch))
                }
            };

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        warn!("interrupted, cancelling the job");
                        cancel.cancel();
                    }
                }
            });

            let job = Job {
                input,
                workload: app,
                output,
                config,
                work_dir,
            };
            let written = driver::run(&job, &cancel).await?;
            info!("wrote {written} pairs to {}", job.output.display());
        }
    }

    Ok(())
}
