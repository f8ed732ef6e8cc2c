//! Plugin lifecycle: init → register → execute* → teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::services::registry::ServiceRegistry;

/// An extension that contributes services to a [`ServiceRegistry`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    /// Configure the plugin before anything can call it.
    async fn init(&mut self, config: &Value) -> Result<(), ServiceError>;

    /// Publish services into the registry.
    async fn register(&self, registry: &ServiceRegistry) -> Result<(), ServiceError>;

    /// Handle a named method call.
    async fn execute(&self, method: &str, params: Value) -> Result<Value, ServiceError>;

    /// Release resources and withdraw services.
    async fn teardown(&self, registry: &ServiceRegistry) -> Result<(), ServiceError>;

    /// Called after `execute` fails, before the error reaches the caller.
    async fn on_error(&self, _method: &str, _error: &ServiceError) {}
}

/// Drives plugins through their lifecycle against one registry.
pub struct PluginHost {
    registry: Arc<ServiceRegistry>,
    /// Load order; teardown runs in reverse.
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginHost {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            plugins: RwLock::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Initialise and register a plugin.
    ///
    /// A plugin that fails to register is torn down again and not kept.
    pub async fn load(&self, mut plugin: Box<dyn Plugin>, config: &Value) -> Result<(), ServiceError> {
        let name = plugin.name().to_string();
        if self.is_loaded(&name).await {
            return Err(ServiceError::PluginInit {
                plugin: name,
                reason: "already loaded".to_string(),
            });
        }

        plugin.init(config).await.map_err(|e| match e {
            ServiceError::PluginInit { .. } => e,
            other => ServiceError::PluginInit {
                plugin: name.clone(),
                reason: other.to_string(),
            },
        })?;

        if let Err(e) = plugin.register(&self.registry).await {
            warn!(plugin = %name, error = %e, "Plugin registration failed, tearing down");
            if let Err(teardown_err) = plugin.teardown(&self.registry).await {
                warn!(plugin = %name, error = %teardown_err, "Plugin teardown failed");
            }
            return Err(e);
        }

        {
            let mut plugins = self.plugins.write().await;
            if !plugins.iter().any(|p| p.name() == name) {
                plugins.push(Arc::from(plugin));
                info!(plugin = %name, "Plugin loaded");
                return Ok(());
            }
        }

        // Lost a race with a concurrent load of the same name
        warn!(plugin = %name, "Plugin loaded concurrently, tearing down duplicate");
        if let Err(teardown_err) = plugin.teardown(&self.registry).await {
            warn!(plugin = %name, error = %teardown_err, "Plugin teardown failed");
        }
        Err(ServiceError::PluginInit {
            plugin: name,
            reason: "already loaded".to_string(),
        })
    }

    /// Route a call to a loaded plugin. Failures go through the plugin's
    /// `on_error` hook and are returned, never propagated as panics.
    pub async fn execute(
        &self,
        plugin: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ServiceError> {
        let target = self
            .plugins
            .read()
            .await
            .iter()
            .find(|p| p.name() == plugin)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownPlugin {
                plugin: plugin.to_string(),
            })?;

        debug!(plugin, method, "Executing plugin method");
        match target.execute(method, params).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(plugin, method, error = %e, "Plugin method failed");
                target.on_error(method, &e).await;
                Err(e)
            }
        }
    }

    pub async fn is_loaded(&self, plugin: &str) -> bool {
        self.plugins.read().await.iter().any(|p| p.name() == plugin)
    }

    /// Loaded plugin names in load order.
    pub async fn plugins(&self) -> Vec<String> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Tear down every plugin, newest first.
    ///
    /// Every plugin gets its teardown even if an earlier one fails; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        let plugins: Vec<Arc<dyn Plugin>> = self.plugins.write().await.drain(..).collect();
        let mut first_err = None;

        for plugin in plugins.iter().rev() {
            match plugin.teardown(&self.registry).await {
                Ok(()) => debug!(plugin = %plugin.name(), "Plugin torn down"),
                Err(e) => {
                    warn!(plugin = %plugin.name(), error = %e, "Plugin teardown failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        info!(count = plugins.len(), "Plugins shut down");
        first_err.map_or(Ok(()), Err)
    }
}
