//! # Resource Gates
//!
//! Concurrency limits for dispatch: one global bound on the worker pool and
//! one independent bound per resource class, so a quota-limited generation
//! service cannot starve local combine/merge work. A task is dispatched only
//! when it holds a permit from both; permits are released when the attempt's
//! future is dropped.

use crate::config::{ExecutionConfig, ResourceLimitsConfig};
use crate::models::ResourceClass;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Permits held by one in-flight attempt
#[derive(Debug)]
pub struct DispatchPermit {
    pub class: ResourceClass,
    _global: OwnedSemaphorePermit,
    _class: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct ResourceGates {
    global: Arc<Semaphore>,
    global_limit: usize,
    classes: HashMap<ResourceClass, (Arc<Semaphore>, usize)>,
}

impl ResourceGates {
    pub fn new(execution: &ExecutionConfig, limits: &ResourceLimitsConfig) -> Self {
        let classes = ResourceClass::ALL
            .into_iter()
            .map(|class| {
                let limit = limits.limit_for(class);
                (class, (Arc::new(Semaphore::new(limit)), limit))
            })
            .collect();
        Self {
            global: Arc::new(Semaphore::new(execution.max_concurrent_tasks)),
            global_limit: execution.max_concurrent_tasks,
            classes,
        }
    }

    /// Take a slot for `class` without waiting. `None` means the caller must
    /// leave the task READY and try again later.
    pub fn try_acquire(&self, class: ResourceClass) -> Option<DispatchPermit> {
        let (semaphore, _) = self.classes.get(&class)?;
        let class_permit = match Arc::clone(semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => return None,
        };
        let global_permit = Arc::clone(&self.global).try_acquire_owned().ok()?;
        Some(DispatchPermit {
            class,
            _global: global_permit,
            _class: class_permit,
        })
    }

    pub fn global_available(&self) -> usize {
        self.global.available_permits()
    }

    pub fn available(&self, class: ResourceClass) -> usize {
        self.classes
            .get(&class)
            .map(|(semaphore, _)| semaphore.available_permits())
            .unwrap_or(0)
    }

    pub fn in_use(&self, class: ResourceClass) -> usize {
        self.classes
            .get(&class)
            .map(|(semaphore, limit)| limit.saturating_sub(semaphore.available_permits()))
            .unwrap_or(0)
    }

    pub fn global_in_use(&self) -> usize {
        self.global_limit
            .saturating_sub(self.global.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates(global: usize, generation: usize) -> ResourceGates {
        let execution = ExecutionConfig {
            max_concurrent_tasks: global,
            ..ExecutionConfig::default()
        };
        let limits = ResourceLimitsConfig {
            generation,
            ..ResourceLimitsConfig::default()
        };
        ResourceGates::new(&execution, &limits)
    }

    #[test]
    fn test_class_limit_is_independent() {
        let gates = gates(8, 2);
        let first = gates.try_acquire(ResourceClass::Generation);
        let second = gates.try_acquire(ResourceClass::Generation);
        assert!(first.is_some() && second.is_some());
        assert!(gates.try_acquire(ResourceClass::Generation).is_none());
        // A saturated generation class does not block local media work
        assert!(gates.try_acquire(ResourceClass::LocalMedia).is_some());
        assert_eq!(gates.in_use(ResourceClass::Generation), 2);

        drop(first);
        assert!(gates.try_acquire(ResourceClass::Generation).is_some());
    }

    #[test]
    fn test_global_limit_caps_all_classes() {
        let gates = gates(1, 3);
        let held = gates.try_acquire(ResourceClass::StorageIo);
        assert!(held.is_some());
        assert!(gates.try_acquire(ResourceClass::Generation).is_none());
        // The class permit taken before the global check is released again
        assert_eq!(gates.available(ResourceClass::Generation), 3);
        assert_eq!(gates.global_in_use(), 1);
    }
}
