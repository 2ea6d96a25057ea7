use crate::services::runner::RunSlot;
use backup_pipeline::Pipeline;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub pipeline: Pipeline,
    pub runs: Arc<RunSlot>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            runs: Arc::new(RunSlot::default()),
            started_at: Instant::now(),
        }
    }
}
