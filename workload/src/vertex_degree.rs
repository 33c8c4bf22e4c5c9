//! A MapReduce-compatible application that computes the
//! degree of each vertex in a graph, given a list of edges.
//!

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use common::{DecodeError, PairSender, ValueReceiver, Workload};

#[derive(Debug, Clone, Copy, Default)]
pub struct VertexDegree;

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

#[async_trait]
impl Workload for VertexDegree {
    async fn map(&self, _key: String, value: String, output: PairSender) -> Result<()> {
        let edges = value
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_line)
            .collect::<Result<Vec<_>>>()?;

        for (a, b) in edges {
            output.emit(a.to_string(), "1").await?;
            output.emit(b.to_string(), "1").await?;
        }
        Ok(())
    }

    async fn reduce(&self, key: String, mut values: ValueReceiver, output: PairSender) -> Result<()> {
        let mut count = 0u64;
        while let Some(value) = values.recv().await {
            let n = value
                .parse::<u64>()
                .map_err(|e| DecodeError::new(&key, &value, e))?;
            count = count
                .checked_add(n)
                .ok_or_else(|| DecodeError::new(&key, &value, "degree overflows u64"))?;
        }

        output.emit(key, format!("deg={count}")).await?;
        Ok(())
    }
}
