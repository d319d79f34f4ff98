//! Registry of resources created during a driver session, plus per-name write locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use propensity_types::ResourceHandle;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::identifier::ResourceName;

/// A resource the session created, with the statement that created it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredResource {
    pub name: ResourceName,
    pub handle: ResourceHandle,
    /// Step that last created or replaced the resource
    pub step: String,
    pub sql: String,
}

/// One entry per qualified name; re-creating a name replaces its entry.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    by_name: IndexMap<String, RegisteredResource>,
    by_step: HashMap<String, ResourceName>,
}

impl ResourceRegistry {
    pub fn register(&mut self, step: &str, name: ResourceName, handle: ResourceHandle, sql: String) {
        self.by_step.insert(step.to_string(), name.clone());
        self.by_name.insert(
            name.to_string(),
            RegisteredResource {
                name,
                handle,
                step: step.to_string(),
                sql,
            },
        );
    }

    pub fn get(&self, name: &ResourceName) -> Option<&RegisteredResource> {
        self.by_name.get(&name.to_string())
    }

    /// Resource most recently created by `step`.
    pub fn created_by(&self, step: &str) -> Option<&RegisteredResource> {
        self.by_step.get(step).and_then(|name| self.get(name))
    }

    /// Step id to resource name, the scope statement templates resolve against.
    pub fn step_names(&self) -> HashMap<String, ResourceName> {
        self.by_step.clone()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Resources in first-creation order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredResource> {
        self.by_name.values()
    }
}

/// Async write locks keyed by qualified resource name.
///
/// Holding the guard while a create-or-replace statement runs keeps two
/// concurrent steps from replacing the same resource at once.
#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ResourceLocks {
    pub async fn acquire(&self, name: &ResourceName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn view(name: &str) -> (ResourceName, ResourceHandle) {
        (ResourceName::parse(name).expect("valid"), ResourceHandle::view(name))
    }

    #[test]
    fn re_registering_a_name_keeps_one_entry() {
        let mut registry = ResourceRegistry::default();
        let (name, handle) = view("bqml_tutorial.training_data");

        registry.register("training_data", name.clone(), handle.clone(), "CREATE ... v1".into());
        registry.register("training_data", name.clone(), handle, "CREATE ... v2".into());

        assert_eq!(registry.len(), 1);
        let entry = registry.get(&name).expect("registered");
        assert_eq!(entry.sql, "CREATE ... v2");
        assert_eq!(registry.created_by("training_data").map(|entry| entry.step.as_str()), Some("training_data"));
        assert_eq!(registry.step_names().get("training_data"), Some(&name));
    }

    #[tokio::test(start_paused = true)]
    async fn locks_serialize_the_same_name() {
        let locks = ResourceLocks::default();
        let (name, _) = view("bqml_tutorial.shared");

        let first = locks.acquire(&name).await;
        let contender = {
            let locks = locks.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(&name).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.expect("contender finishes");

        let (other, _) = view("bqml_tutorial.other");
        let _held = locks.acquire(&name).await;
        let _independent = locks.acquire(&other).await;
    }
}
