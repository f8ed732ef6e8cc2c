//! Service registry for sharing capabilities between tasks and plugins.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ServiceError;

type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// Name → service instance map.
///
/// Passed around explicitly rather than held in a global, so separate hosts
/// (and tests) never see each other's registrations.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceHandle>>,
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register `service` under `name`. Fails if the name is taken; the
    /// existing registration is left untouched.
    pub async fn register_service<T>(
        &self,
        name: impl Into<String>,
        service: Arc<T>,
    ) -> Result<(), ServiceError>
    where
        T: Send + Sync + 'static,
    {
        let name = name.into();
        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            tracing::warn!(service = %name, "Rejected duplicate service registration");
            return Err(ServiceError::AlreadyRegistered { name });
        }
        tracing::debug!(service = %name, kind = type_name::<T>(), "Registered service");
        services.insert(name, service);
        Ok(())
    }

    /// Get a service by name. `None` if absent or registered as another type.
    pub async fn get_service<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let handle = self.services.read().await.get(name).cloned()?;
        handle.downcast::<T>().ok()
    }

    /// Like [`get_service`](Self::get_service), but absence is an error.
    pub async fn require_service<T>(&self, name: &str) -> Result<Arc<T>, ServiceError>
    where
        T: Send + Sync + 'static,
    {
        let handle = self
            .services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::NotRegistered {
                name: name.to_string(),
            })?;
        handle.downcast::<T>().map_err(|_| ServiceError::TypeMismatch {
            name: name.to_string(),
            expected: type_name::<T>(),
        })
    }

    /// Remove a service. Returns whether one was registered.
    pub async fn unregister_service(&self, name: &str) -> bool {
        let removed = self.services.write().await.remove(name).is_some();
        if removed {
            tracing::debug!(service = %name, "Unregistered service");
        }
        removed
    }

    /// Check if a service exists.
    pub async fn has(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    /// List registered service names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[tokio::test]
    async fn register_and_get() {
        let registry = ServiceRegistry::new();
        registry
            .register_service("clock", Arc::new(Clock(7)))
            .await
            .unwrap();

        let clock = registry.get_service::<Clock>("clock").await.unwrap();
        assert_eq!(*clock, Clock(7));
        assert!(registry.get_service::<Clock>("missing").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_first() {
        let registry = ServiceRegistry::new();
        registry
            .register_service("clock", Arc::new(Clock(1)))
            .await
            .unwrap();

        let err = registry.register_service("clock", Arc::new(Clock(2))).await;
        assert!(matches!(err, Err(ServiceError::AlreadyRegistered { .. })));

        let clock = registry.require_service::<Clock>("clock").await.unwrap();
        assert_eq!(clock.0, 1);
    }

    #[tokio::test]
    async fn require_reports_missing_and_mismatch() {
        let registry = ServiceRegistry::new();
        registry
            .register_service("name", Arc::new("svc".to_string()))
            .await
            .unwrap();

        assert!(matches!(
            registry.require_service::<Clock>("none").await,
            Err(ServiceError::NotRegistered { .. })
        ));
        assert!(matches!(
            registry.require_service::<Clock>("name").await,
            Err(ServiceError::TypeMismatch { .. })
        ));
        assert!(registry.get_service::<Clock>("name").await.is_none());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ServiceRegistry::new();
        registry
            .register_service("clock", Arc::new(Clock(0)))
            .await
            .unwrap();

        assert!(registry.unregister_service("clock").await);
        assert!(!registry.unregister_service("clock").await);
        assert!(!registry.has("clock").await);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn registries_are_isolated() {
        let a = ServiceRegistry::new();
        let b = ServiceRegistry::new();
        a.register_service("clock", Arc::new(Clock(1))).await.unwrap();
        assert!(b.register_service("clock", Arc::new(Clock(2))).await.is_ok());
        assert_eq!(a.require_service::<Clock>("clock").await.unwrap().0, 1);
        assert_eq!(b.require_service::<Clock>("clock").await.unwrap().0, 2);
    }
}
