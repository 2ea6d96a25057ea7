use crate::services::runner::{self, Operation};
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn schedule(&self, operation: Operation, cron_expression: &str) -> anyhow::Result<()> {
        let state = self.state.clone();

        let job = Job::new_async(cron_expression, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                let guard = match state.runs.try_acquire(operation) {
                    Ok(guard) => guard,
                    Err(active) => {
                        tracing::warn!(
                            operation = %operation,
                            running = %active.operation,
                            "Skipping scheduled run: another run is active"
                        );
                        return;
                    }
                };

                tracing::info!(operation = %operation, "Scheduled run triggered");
                if let Err(e) = runner::execute(state, guard).await {
                    tracing::error!(operation = %operation, error = %e, "Scheduled run failed");
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(operation = %operation, cron = %cron_expression, "Job scheduled");
        Ok(())
    }

    /// Register the full, incremental and retention jobs from the pipeline schedule.
    pub async fn init_schedules(&self) -> anyhow::Result<()> {
        let schedule = self.state.pipeline.config.schedule.clone();
        let jobs = [
            (Operation::Full, schedule.full),
            (Operation::Incremental, schedule.incremental),
            (Operation::Retention, schedule.retention),
        ];

        let mut count = 0;
        for (operation, cron) in jobs {
            if cron.trim().is_empty() {
                tracing::info!(operation = %operation, "No schedule configured");
                continue;
            }
            if let Err(e) = self.schedule(operation, &cron).await {
                tracing::error!(operation = %operation, cron = %cron, error = %e, "Failed to schedule job");
            } else {
                count += 1;
            }
        }

        tracing::info!(count, "Cron schedules initialized");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}
