//! A MapReduce-compatible implementation of word count.
//!

use anyhow::Result;
use async_trait::async_trait;

use common::{DecodeError, PairSender, ValueReceiver, Workload};

#[derive(Debug, Clone, Copy, Default)]
pub struct WordCount;

/// Lowercases `token` and drops everything that is not a letter or a digit.
fn normalize(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphabetic() || c.is_numeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[async_trait]
impl Workload for WordCount {
    async fn map(&self, _key: String, value: String, output: PairSender) -> Result<()> {
        for word in value.split_whitespace().map(normalize) {
            if !word.is_empty() {
                output.emit(word, "1").await?;
            }
        }
        Ok(())
    }

    async fn reduce(&self, key: String, mut values: ValueReceiver, output: PairSender) -> Result<()> {
        let mut count = 0i64;
        while let Some(value) = values.recv().await {
            let n = value
                .parse::<i64>()
                .map_err(|e| DecodeError::new(&key, &value, e))?;
            count = count
                .checked_add(n)
                .ok_or_else(|| DecodeError::new(&key, &value, "count overflows i64"))?;
        }

        output.emit(key, count.to_string()).await?;
        Ok(())
    }
}
