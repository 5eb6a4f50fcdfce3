use crate::{config::AppConfig, list::ListQueryEngine, records::RecordService, resources::Registry};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<Registry>,
    pub lists: ListQueryEngine,
    pub records: RecordService,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        registry: Arc<Registry>,
        lists: ListQueryEngine,
        records: RecordService,
    ) -> Self {
        Self {
            config,
            registry,
            lists,
            records,
        }
    }
}
