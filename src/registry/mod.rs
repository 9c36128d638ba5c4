//! # Registry
//!
//! Task templates and the step handlers their steps reference, bound
//! together and validated once at startup.
//!
//! A registry is normally passed explicitly to the coordinator. Hosts that
//! want a process-wide registry can [`install_global`] one; installation
//! happens once and the registry is read-only afterwards.

pub mod task_handler_registry;

pub use task_handler_registry::{
    RegisteredTemplate, RegistryStats, TaskHandlerRegistry, TaskHandlerRegistryBuilder,
    TemplateKey,
};

use crate::error::{Result, TaskerError};
use std::sync::{Arc, OnceLock};

static GLOBAL_REGISTRY: OnceLock<Arc<TaskHandlerRegistry>> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install_global(registry: Arc<TaskHandlerRegistry>) -> Result<()> {
    GLOBAL_REGISTRY.set(registry).map_err(|_| {
        TaskerError::RegistryError("A global task handler registry is already installed".to_string())
    })
}

/// The process-wide registry, if one was installed
pub fn global() -> Option<Arc<TaskHandlerRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
