use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::errors::{TowerError, TowerResult};
use crate::recognition::locator::PriorityTargetLocator;
use crate::recognition::traits::CustomRecognition;

/// Custom recognitions this agent offers to the host, keyed by the name the
/// host pipeline refers to them by.
#[derive(Default)]
pub struct RecognitionRegistry {
    handlers: HashMap<String, Arc<dyn CustomRecognition>>,
}

impl RecognitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CustomRecognition>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(recognition = %name, "custom recognition re-registered");
        } else {
            tracing::debug!(recognition = %name, "custom recognition registered");
        }
    }

    pub fn get(&self, name: &str) -> TowerResult<Arc<dyn CustomRecognition>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| TowerError::Config(format!("Custom recognition '{name}' not registered")))
    }

    /// Sorted, so the handshake is stable.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// The registry the agent process serves: the priority locator under its
    /// configured name.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry.register(
            config.recognition.name.clone(),
            Arc::new(PriorityTargetLocator::from_config(&config.recognition)),
        );
        registry
    }
}
