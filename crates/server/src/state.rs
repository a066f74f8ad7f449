use ticketsync_core::{Config, IngestionOrchestrator, SanitizedConfig};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: IngestionOrchestrator,
}

impl AppState {
    pub fn new(config: Config, orchestrator: IngestionOrchestrator) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &IngestionOrchestrator {
        &self.orchestrator
    }
}
