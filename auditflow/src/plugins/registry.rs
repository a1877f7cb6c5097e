//! Explicit plugin registry.

use super::{BatchTransform, Gate, Sink, Source, Transform};
use crate::errors::PluginError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a plugin instance from its configuration.
pub type PluginFactory<T> = Arc<dyn Fn(&Value) -> Result<Arc<T>, PluginError> + Send + Sync>;

type FactoryMap<T> = RwLock<HashMap<String, PluginFactory<T>>>;

fn create<T: ?Sized>(
    factories: &FactoryMap<T>,
    role: &str,
    name: &str,
    config: &Value,
) -> Result<Arc<T>, PluginError> {
    let factory = factories
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| PluginError::new(name, format!("no {role} plugin registered under this name")))?;
    factory(config)
}

fn sorted_names<T: ?Sized>(factories: &FactoryMap<T>) -> Vec<String> {
    let mut names: Vec<String> = factories.read().keys().cloned().collect();
    names.sort();
    names
}

/// Maps plugin names to factories, per role.
///
/// Constructed by the caller and passed where needed; there is no
/// process-wide instance.
#[derive(Default)]
pub struct PluginRegistry {
    sources: FactoryMap<dyn Source>,
    transforms: FactoryMap<dyn Transform>,
    batch_transforms: FactoryMap<dyn BatchTransform>,
    gates: FactoryMap<dyn Gate>,
    sinks: FactoryMap<dyn Sink>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source factory, replacing any previous one.
    pub fn register_source<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Source>, PluginError> + Send + Sync + 'static,
    {
        self.sources.write().insert(name.into(), Arc::new(factory));
    }

    /// Registers a transform factory.
    pub fn register_transform<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Transform>, PluginError> + Send + Sync + 'static,
    {
        self.transforms.write().insert(name.into(), Arc::new(factory));
    }

    /// Registers a batch transform factory.
    pub fn register_batch_transform<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn BatchTransform>, PluginError> + Send + Sync + 'static,
    {
        self.batch_transforms
            .write()
            .insert(name.into(), Arc::new(factory));
    }

    /// Registers a gate factory.
    pub fn register_gate<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Gate>, PluginError> + Send + Sync + 'static,
    {
        self.gates.write().insert(name.into(), Arc::new(factory));
    }

    /// Registers a sink factory.
    pub fn register_sink<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Sink>, PluginError> + Send + Sync + 'static,
    {
        self.sinks.write().insert(name.into(), Arc::new(factory));
    }

    /// Builds a source.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the name is unknown or the factory fails.
    pub fn create_source(&self, name: &str, config: &Value) -> Result<Arc<dyn Source>, PluginError> {
        create(&self.sources, "source", name, config)
    }

    /// Builds a transform.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the name is unknown or the factory fails.
    pub fn create_transform(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<Arc<dyn Transform>, PluginError> {
        create(&self.transforms, "transform", name, config)
    }

    /// Builds a batch transform.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the name is unknown or the factory fails.
    pub fn create_batch_transform(
        &self,
        name: &str,
        config: &Value,
    ) -> Result<Arc<dyn BatchTransform>, PluginError> {
        create(&self.batch_transforms, "batch transform", name, config)
    }

    /// Builds a gate.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the name is unknown or the factory fails.
    pub fn create_gate(&self, name: &str, config: &Value) -> Result<Arc<dyn Gate>, PluginError> {
        create(&self.gates, "gate", name, config)
    }

    /// Builds a sink.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError`] if the name is unknown or the factory fails.
    pub fn create_sink(&self, name: &str, config: &Value) -> Result<Arc<dyn Sink>, PluginError> {
        create(&self.sinks, "sink", name, config)
    }

    /// Registered source names, sorted.
    #[must_use]
    pub fn source_names(&self) -> Vec<String> {
        sorted_names(&self.sources)
    }

    /// Registered transform names, sorted.
    #[must_use]
    pub fn transform_names(&self) -> Vec<String> {
        sorted_names(&self.transforms)
    }

    /// Registered sink names, sorted.
    #[must_use]
    pub fn sink_names(&self) -> Vec<String> {
        sorted_names(&self.sinks)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("sources", &self.source_names())
            .field("transforms", &self.transform_names())
            .field("batch_transforms", &sorted_names(&self.batch_transforms))
            .field("gates", &sorted_names(&self.gates))
            .field("sinks", &self.sink_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CollectSink, MapTransform};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_create_registered_plugins() {
        let registry = PluginRegistry::new();
        registry.register_transform("upper", |config| {
            let field = config["field"].as_str().unwrap_or("name").to_string();
            Ok(Arc::new(MapTransform::uppercase("upper", field)) as Arc<dyn Transform>)
        });
        registry.register_sink("memory", |_| Ok(Arc::new(CollectSink::new("memory")) as Arc<dyn Sink>));

        let transform = registry
            .create_transform("upper", &json!({"field": "city"}))
            .unwrap();
        assert_eq!(transform.name(), "upper");
        assert_eq!(registry.sink_names(), vec!["memory".to_string()]);
        assert!(registry.create_sink("memory", &Value::Null).is_ok());
    }

    #[test]
    fn test_unknown_plugin() {
        let registry = PluginRegistry::new();
        let err = registry.create_source("csv", &Value::Null).unwrap_err();
        assert_eq!(err.plugin, "csv");
        assert!(err.message.contains("no source plugin"));
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = PluginRegistry::new();
        let b = PluginRegistry::new();
        a.register_sink("memory", |_| Ok(Arc::new(CollectSink::new("memory")) as Arc<dyn Sink>));
        assert!(b.sink_names().is_empty());
        assert_eq!(a.sink_names().len(), 1);
    }
}
