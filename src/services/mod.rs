//! In-process extension point: named services and the plugins that provide them.

pub mod plugin;
pub mod registry;

pub use plugin::{Plugin, PluginHost};
pub use registry::ServiceRegistry;
