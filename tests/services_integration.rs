//! Service registry and plugin host through the public API.

use std::sync::Arc;

use agent_jobs::error::ServiceError;
use agent_jobs::services::{Plugin, PluginHost, ServiceRegistry};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

/// Greeter service contributed by the plugin.
struct Greeter {
    greeting: String,
}

impl Greeter {
    fn greet(&self, name: &str) -> String {
        format!("{}, {name}!", self.greeting)
    }
}

#[derive(Default)]
struct GreeterPlugin {
    greeting: String,
    errors: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    async fn init(&mut self, config: &Value) -> Result<(), ServiceError> {
        self.greeting = config
            .get("greeting")
            .and_then(Value::as_str)
            .unwrap_or("Hello")
            .to_string();
        Ok(())
    }

    async fn register(&self, registry: &ServiceRegistry) -> Result<(), ServiceError> {
        registry
            .register_service(
                "greeter",
                Arc::new(Greeter {
                    greeting: self.greeting.clone(),
                }),
            )
            .await
    }

    async fn execute(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "greet" => {
                let name = params.get("name").and_then(Value::as_str).ok_or_else(|| {
                    ServiceError::PluginExecution {
                        plugin: "greeter".to_string(),
                        method: method.to_string(),
                        reason: "missing name".to_string(),
                    }
                })?;
                Ok(json!(format!("{}, {name}!", self.greeting)))
            }
            _ => Err(ServiceError::UnknownMethod {
                plugin: "greeter".to_string(),
                method: method.to_string(),
            }),
        }
    }

    async fn teardown(&self, registry: &ServiceRegistry) -> Result<(), ServiceError> {
        registry.unregister_service("greeter").await;
        Ok(())
    }

    async fn on_error(&self, method: &str, error: &ServiceError) {
        self.errors.lock().await.push(format!("{method}: {error}"));
    }
}

#[tokio::test]
async fn plugin_services_are_visible_through_registry() {
    let registry = Arc::new(ServiceRegistry::new());
    let host = PluginHost::new(Arc::clone(&registry));
    host.load(Box::new(GreeterPlugin::default()), &json!({"greeting": "Hi"}))
        .await
        .unwrap();

    let greeter = registry.require_service::<Greeter>("greeter").await.unwrap();
    assert_eq!(greeter.greet("Ada"), "Hi, Ada!");
    assert_eq!(
        host.execute("greeter", "greet", json!({"name": "Bo"})).await.unwrap(),
        json!("Hi, Bo!")
    );

    host.shutdown().await.unwrap();
    assert!(registry.get_service::<Greeter>("greeter").await.is_none());
}

#[tokio::test]
async fn failed_execution_reaches_on_error_hook() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let host = PluginHost::new(Arc::new(ServiceRegistry::new()));
    host.load(
        Box::new(GreeterPlugin {
            errors: Arc::clone(&errors),
            ..Default::default()
        }),
        &json!({}),
    )
    .await
    .unwrap();

    let err = host.execute("greeter", "greet", json!({})).await;
    assert!(matches!(err, Err(ServiceError::PluginExecution { .. })));
    assert_eq!(errors.lock().await.len(), 1);
    assert!(errors.lock().await[0].starts_with("greet:"));
}

#[tokio::test]
async fn second_registration_fails_and_first_survives() {
    let registry = ServiceRegistry::new();
    registry
        .register_service("greeter", Arc::new(Greeter { greeting: "Hello".into() }))
        .await
        .unwrap();

    let err = registry
        .register_service("greeter", Arc::new(Greeter { greeting: "Yo".into() }))
        .await;
    assert!(matches!(err, Err(ServiceError::AlreadyRegistered { .. })));

    let greeter = registry.require_service::<Greeter>("greeter").await.unwrap();
    assert_eq!(greeter.greet("Ada"), "Hello, Ada!");
}
