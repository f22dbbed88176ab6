//! Filter pipeline: an ordered chain of reading transforms.
//!
//! Filters run one after another on the drain thread; each receives the
//! batch produced by its predecessor and hands its output to the next. The
//! tail's output goes to storage. A filter failure discards the batch
//! explicitly rather than silently losing it.

use std::collections::HashMap;

use serde_json::Value;

use crate::model::ReadingSet;

/// Failure raised by a filter; the batch it was processing is discarded.
#[derive(Debug, thiserror::Error)]
#[error("filter {filter}: {reason}")]
pub struct FilterError {
    pub filter: String,
    pub reason: String,
}

impl FilterError {
    pub fn new(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            reason: reason.into(),
        }
    }
}

/// Pipeline configuration failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse pipeline configuration")]
    Parse,
    #[error("Unknown filter plugin '{0}'")]
    UnknownPlugin(String),
    #[error("{0}")]
    Invalid(String),
}

/// One transform in the chain.
pub trait Filter: Send {
    fn name(&self) -> &str;
    fn process(&mut self, set: ReadingSet) -> Result<ReadingSet, FilterError>;
}

/// Builds a filter instance from its JSON configuration.
pub type FilterBuilder =
    Box<dyn Fn(&Value) -> Result<Box<dyn Filter>, ConfigError> + Send + Sync>;

/// Registry of filter plugin builders, keyed by plugin name.
#[derive(Default)]
pub struct FilterRegistry {
    builders: HashMap<String, FilterBuilder>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: impl Into<String>, builder: FilterBuilder) {
        self.builders.insert(plugin.into(), builder);
    }

    fn build(&self, plugin: &str, config: &Value) -> Result<Box<dyn Filter>, ConfigError> {
        let builder = self
            .builders
            .get(plugin)
            .ok_or_else(|| ConfigError::UnknownPlugin(plugin.to_string()))?;
        builder(config)
    }
}

/// The ordered filter chain. An empty pipeline is a pass-through.
#[derive(Default)]
pub struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pipeline from a category content document of the form
    /// `{"pipeline": [{"plugin": "scale", "config": {...}}, ...]}`.
    pub fn from_config(content: &Value, registry: &FilterRegistry) -> Result<Self, ConfigError> {
        let stages = content
            .get("pipeline")
            .and_then(Value::as_array)
            .ok_or(ConfigError::Parse)?;
        let mut filters = Vec::with_capacity(stages.len());
        for stage in stages {
            let plugin = stage
                .get("plugin")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ConfigError::Invalid("pipeline entry is missing a plugin name".to_string())
                })?;
            let config = stage.get("config").cloned().unwrap_or(Value::Null);
            filters.push(registry.build(plugin, &config)?);
        }
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Run a batch through every filter in order.
    pub fn apply(&mut self, set: ReadingSet) -> Result<ReadingSet, FilterError> {
        let mut set = set;
        for filter in &mut self.filters {
            set = filter.process(set)?;
        }
        Ok(set)
    }

    /// Destroy the chain, dropping instances in reverse order so each
    /// filter outlives the ones it fed.
    pub fn teardown(mut self) {
        while let Some(filter) = self.filters.pop() {
            tracing::debug!(filter = filter.name(), "filter pipeline stage removed");
            drop(filter);
        }
    }
}
