//! Per-stage run history and the incremental cutoff.
//!
//! The cutoff only moves forward, and only for runs that were not cut short
//! by quota exhaustion. The run record and the new stage state are written in
//! one store operation, after the batch has been merged.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{RunRecord, Stage, StageState};
use crate::traits::RunStore;

pub struct RunLedger<S> {
    store: S,
}

impl<S: RunStore> RunLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Current state of `stage`; a stage that never ran gets an empty state.
    pub async fn stage_state(&self, stage: Stage) -> Result<StageState, AppError> {
        Ok(self
            .store
            .load_stage(stage)
            .await?
            .unwrap_or_else(|| StageState::new(stage)))
    }

    /// Watermark of the last successful run, `None` before the first one.
    pub async fn last_cutoff(&self, stage: Stage) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self.stage_state(stage).await?.last_cutoff)
    }

    /// True iff a full run was not requested and a successful run exists.
    pub async fn should_run_incremental(
        &self,
        stage: Stage,
        override_full: bool,
    ) -> Result<bool, AppError> {
        if override_full {
            return Ok(false);
        }
        Ok(self.stage_state(stage).await?.last_success_at.is_some())
    }

    /// Append `record` and advance the stage cursor.
    ///
    /// Returns the stored record, with its `cutoff` set to the stage cutoff
    /// after this run.
    pub async fn record_run(&self, mut record: RunRecord) -> Result<RunRecord, AppError> {
        let mut state = self.stage_state(record.stage).await?;

        state.total_runs += 1;
        state.total_items += record.items_seen;
        if record.quota_exhausted {
            tracing::warn!(
                stage = %record.stage,
                cutoff = ?state.last_cutoff,
                "Run aborted by quota, cutoff not advanced"
            );
        } else {
            state.last_cutoff = state.last_cutoff.max(record.max_item_ts);
            state.last_success_at = Some(record.finished_at);
        }
        record.cutoff = state.last_cutoff;

        self.store.commit_run(&record, &state).await?;
        tracing::info!(
            stage = %record.stage,
            run_id = %record.id,
            cutoff = ?state.last_cutoff,
            "Run recorded"
        );
        Ok(record)
    }

    /// Most recent runs of `stage`, newest first.
    pub async fn history(&self, stage: Stage, limit: usize) -> Result<Vec<RunRecord>, AppError> {
        self.store.list_runs(stage, limit).await
    }
}
