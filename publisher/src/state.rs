use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::PublishOrchestrator;

pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<PublishOrchestrator>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let orchestrator = PublishOrchestrator::new(&config);
        Arc::new(Self {
            config,
            orchestrator,
        })
    }
}
