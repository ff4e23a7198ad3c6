//! Capability registry: capability tag -> executor function.
//!
//! Lookup clones the registered `Arc`, so a dispatch captures the executor
//! by value; replacing a registration never affects jobs already running.

use std::collections::HashMap;
use std::sync::RwLock;
use vigil_protocol::{Capability, ExecutorFn};

#[derive(Default)]
pub struct CapabilityRegistry {
    executors: RwLock<HashMap<Capability, ExecutorFn>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or atomically replace) the executor for a capability.
    /// Returns true when an earlier registration was replaced.
    pub fn register(&self, capability: Capability, executor: ExecutorFn) -> bool {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        let replaced = executors.insert(capability, executor).is_some();
        if replaced {
            tracing::info!("Executor replaced for capability {}", capability);
        } else {
            tracing::info!("Executor registered for capability {}", capability);
        }
        replaced
    }

    pub fn unregister(&self, capability: Capability) -> bool {
        let mut executors = self.executors.write().unwrap_or_else(|e| e.into_inner());
        executors.remove(&capability).is_some()
    }

    /// The current executor for a capability, captured by value.
    pub fn get(&self, capability: Capability) -> Option<ExecutorFn> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors.get(&capability).cloned()
    }

    pub fn is_registered(&self, capability: Capability) -> bool {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        executors.contains_key(&capability)
    }

    /// Capabilities that currently have an executor.
    pub fn registered(&self) -> Vec<Capability> {
        let executors = self.executors.read().unwrap_or_else(|e| e.into_inner());
        let mut capabilities: Vec<Capability> = executors.keys().copied().collect();
        capabilities.sort();
        capabilities
    }
}
