use std::time::Duration;

use crate::TaskError;

/// Shape of the whole computation, handed to every task.
///
/// `map_tasks` (M) and `reduce_tasks` (R) must be identical for every map
/// and reduce task of one computation, otherwise reduce tasks look for
/// bucket files that were never written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskConfig {
    pub map_tasks: usize,
    pub reduce_tasks: usize,

    /// Upper bound for a single map or reduce function invocation.
    /// `None` waits forever.
    pub invocation_timeout: Option<Duration>,
}

impl TaskConfig {
    pub fn new(map_tasks: usize, reduce_tasks: usize) -> Self {
        Self {
            map_tasks,
            reduce_tasks,
            invocation_timeout: None,
        }
    }

    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.map_tasks == 0 {
            return Err(TaskError::Config("at least one map task is required".into()));
        }
        if self.reduce_tasks == 0 {
            return Err(TaskError::Config("at least one reduce task is required".into()));
        }
        if self.invocation_timeout == Some(Duration::ZERO) {
            return Err(TaskError::Config("invocation timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn check_map_index(&self, index: usize) -> Result<(), TaskError> {
        self.validate()?;
        if index >= self.map_tasks {
            return Err(TaskError::Config(format!(
                "map task {index} out of range (M = {})",
                self.map_tasks
            )));
        }
        Ok(())
    }

    pub fn check_reduce_index(&self, index: usize) -> Result<(), TaskError> {
        self.validate()?;
        if index >= self.reduce_tasks {
            return Err(TaskError::Config(format!(
                "reduce task {index} out of range (R = {})",
                self.reduce_tasks
            )));
        }
        Ok(())
    }
}
