use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;

/// Mints time-ordered identifiers for jobs, messages and startup runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new_id(&self) -> Uuid {
        Uuid::now_v7()
    }

    pub fn new_job_id(&self) -> String {
        self.new_id().to_string()
    }
}

/// Built once at startup and shared by every component.
#[derive(Debug)]
pub struct AppContext {
    pub config: Config,
    pub ids: IdGenerator,
    pub program_tag: String,
}

impl AppContext {
    pub fn new(config: Config) -> Arc<Self> {
        let program_tag = config.program_tag.clone();
        Arc::new(Self {
            config,
            ids: IdGenerator,
            program_tag,
        })
    }
}
