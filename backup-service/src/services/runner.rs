//! Single active run guard and execution of backup and retention runs.

use crate::error::AppError;
use crate::state::AppState;
use backup_pipeline::manifest::BackupKind;
use backup_pipeline::orchestrator::BackupOutcome;
use backup_pipeline::retention::SweepReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Full,
    Incremental,
    Retention,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Full => "full backup",
            Operation::Incremental => "incremental backup",
            Operation::Retention => "retention sweep",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedRun {
    pub operation: Operation,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RunSummary {
    Backup(BackupOutcome),
    Sweep(SweepReport),
}

#[derive(Debug, Default)]
struct SlotState {
    active: Option<ActiveRun>,
    last: Option<FinishedRun>,
}

/// Holds at most one active run per process.
#[derive(Debug, Default)]
pub struct RunSlot {
    state: Mutex<SlotState>,
}

impl RunSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot, or report the run that holds it.
    pub fn try_acquire(self: &Arc<Self>, operation: Operation) -> Result<RunGuard, ActiveRun> {
        let mut state = self.lock();
        if let Some(active) = &state.active {
            return Err(active.clone());
        }
        let run = ActiveRun {
            operation,
            started_at: Utc::now(),
        };
        state.active = Some(run.clone());
        Ok(RunGuard {
            slot: self.clone(),
            run,
            error: None,
        })
    }

    pub fn active(&self) -> Option<ActiveRun> {
        self.lock().active.clone()
    }

    pub fn last(&self) -> Option<FinishedRun> {
        self.lock().last.clone()
    }
}

/// Releases the slot when dropped and records how the run ended.
pub struct RunGuard {
    slot: Arc<RunSlot>,
    run: ActiveRun,
    error: Option<String>,
}

impl fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunGuard").field("run", &self.run).finish()
    }
}

impl RunGuard {
    pub fn run(&self) -> &ActiveRun {
        &self.run
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.slot.lock();
        state.active = None;
        state.last = Some(FinishedRun {
            operation: self.run.operation,
            started_at: self.run.started_at,
            finished_at: Utc::now(),
            success: self.error.is_none(),
            error: self.error.take(),
        });
    }
}

/// Claim the slot for `operation`, mapping a busy slot to 409.
pub fn claim(state: &AppState, operation: Operation) -> Result<RunGuard, AppError> {
    state.runs.try_acquire(operation).map_err(|active| {
        tracing::warn!(requested = %operation, running = %active.operation, "Run rejected: another run is active");
        AppError::Conflict(format!(
            "A {} is already running (started {})",
            active.operation,
            active.started_at.to_rfc3339()
        ))
    })
}

/// Execute the operation the guard was claimed for; the slot is released on return.
pub async fn execute(state: Arc<AppState>, mut guard: RunGuard) -> anyhow::Result<RunSummary> {
    let operation = guard.run().operation;
    tracing::info!(operation = %operation, "Run started");

    let result = match operation {
        Operation::Full => state
            .pipeline
            .orchestrator
            .run(BackupKind::Full)
            .await
            .map(RunSummary::Backup),
        Operation::Incremental => state
            .pipeline
            .orchestrator
            .run(BackupKind::Incremental)
            .await
            .map(RunSummary::Backup),
        Operation::Retention => state.pipeline.sweeper.sweep().await.map(RunSummary::Sweep),
    };

    match result {
        Ok(summary) => {
            tracing::info!(operation = %operation, "Run finished");
            Ok(summary)
        }
        Err(e) => {
            tracing::error!(operation = %operation, error = %e, "Run failed");
            guard.fail(e.to_string());
            Err(e.into())
        }
    }
}

/// Claim the slot and run in the background. Returns the claimed run.
pub fn spawn(state: Arc<AppState>, operation: Operation) -> Result<ActiveRun, AppError> {
    let guard = claim(&state, operation)?;
    let run = guard.run().clone();
    tokio::spawn(async move {
        let _ = execute(state, guard).await;
    });
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_allows_one_run() {
        let slot = Arc::new(RunSlot::default());
        let guard = slot.try_acquire(Operation::Full).unwrap();

        let busy = slot.try_acquire(Operation::Retention).unwrap_err();
        assert_eq!(busy.operation, Operation::Full);
        assert!(format!("{guard:?}").contains("Full"));
        assert_eq!(slot.active().unwrap().operation, Operation::Full);

        drop(guard);
        assert!(slot.active().is_none());
        assert!(slot.try_acquire(Operation::Retention).is_ok());
    }

    #[test]
    fn test_guard_records_outcome() {
        let slot = Arc::new(RunSlot::default());
        assert!(slot.last().is_none());

        let mut guard = slot.try_acquire(Operation::Incremental).unwrap();
        guard.fail("No full backup found");
        drop(guard);

        let last = slot.last().unwrap();
        assert_eq!(last.operation, Operation::Incremental);
        assert!(!last.success);
        assert_eq!(last.error.as_deref(), Some("No full backup found"));
        assert!(last.finished_at >= last.started_at);

        drop(slot.try_acquire(Operation::Full).unwrap());
        assert!(slot.last().unwrap().success);
    }
}
