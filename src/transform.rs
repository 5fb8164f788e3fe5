//! Post-load transform execution.

use crate::error::Result;
use crate::job::Job;
use crate::staging::StagingStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What happened to a job's transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOutcome {
    /// The statement ran
    Applied,
    /// Transforms are disabled for this run
    SkippedDisabled,
    /// The job has no transform
    SkippedEmpty,
}

impl std::fmt::Display for TransformOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformOutcome::Applied => write!(f, "applied"),
            TransformOutcome::SkippedDisabled => write!(f, "skipped (disabled)"),
            TransformOutcome::SkippedEmpty => write!(f, "skipped (none)"),
        }
    }
}

/// Runs a job's transform statement in the job's open transaction.
#[derive(Debug, Clone, Copy)]
pub struct TransformRunner {
    enabled: bool,
}

impl TransformRunner {
    /// Create a runner; a disabled runner never executes anything.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Run the job's transform, if any.
    pub async fn run<S>(&self, store: &mut S, job: &Job) -> Result<TransformOutcome>
    where
        S: StagingStore + ?Sized,
    {
        if !self.enabled {
            debug!(job = %job.key, "Transforms disabled");
            return Ok(TransformOutcome::SkippedDisabled);
        }

        let Some(sql) = job.transform() else {
            debug!(job = %job.key, "No transform configured");
            return Ok(TransformOutcome::SkippedEmpty);
        };

        info!(job = %job.key, "Running transform");
        store.execute(sql).await?;
        Ok(TransformOutcome::Applied)
    }
}
