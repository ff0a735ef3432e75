//! Thread-safe registry of individually-locked resources.
//!
//! A coarse lock guards the id → node table; each resource carries its own
//! lock so unrelated resources (the main executor and a vision encoder,
//! say) never contend. Acquisition yields a move-only guard that releases
//! on drop along every exit path.

use std::any::Any;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as ResourceMutex, OwnedMutexGuard};

use edgelm_kernel::error::{Error, Result};

/// Well-known resource ids.
pub mod resource_ids {
    pub const MAIN_EXECUTOR: u32 = 0;
    pub const VISION_EXECUTOR: u32 = 1;
    pub const AUDIO_EXECUTOR: u32 = 2;
    pub const TOKENIZER_0: u32 = 3;
}

/// Exclusive scoped access to a registered resource. Non-copyable; the
/// per-resource lock is released when the guard drops.
pub struct ResourceGuard<T> {
    guard: OwnedMutexGuard<T>,
}

impl<T> std::fmt::Debug for ResourceGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").finish_non_exhaustive()
    }
}

impl<T> Deref for ResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ResourceGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

type ErasedNode = Arc<dyn Any + Send + Sync>;

/// Registry mapping integer resource ids to type-erased, individually
/// locked resources. Resources live until the registry is dropped.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<HashMap<u32, ErasedNode>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource under `id`. Fails with `AlreadyExists` on a
    /// duplicate id.
    pub fn register<T: Send + 'static>(&self, id: u32, resource: T) -> Result<()> {
        let mut table = self.resources.lock().expect("registry table poisoned");
        if table.contains_key(&id) {
            return Err(Error::already_exists(format!(
                "resource id '{id}' already exists"
            )));
        }
        table.insert(id, Arc::new(ResourceMutex::new(resource)));
        Ok(())
    }

    fn node<T: Send + 'static>(&self, id: u32) -> Result<Arc<ResourceMutex<T>>> {
        let table = self.resources.lock().expect("registry table poisoned");
        let node = table
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("resource id '{id}' not found")))?;
        drop(table);
        node.downcast::<ResourceMutex<T>>().map_err(|_| {
            Error::invalid_argument(format!("type mismatch when acquiring resource id '{id}'"))
        })
    }

    /// Acquires exclusive access to the resource under `id`. Blocks while
    /// another guard for the same resource is alive; the table lock is not
    /// held while waiting.
    pub fn acquire<T: Send + 'static>(&self, id: u32) -> Result<ResourceGuard<T>> {
        let node = self.node::<T>(id)?;
        Ok(ResourceGuard {
            guard: node.blocking_lock_owned(),
        })
    }

    /// Runs `f` against a read view of the resource. Intended for brief
    /// invariant checks, not long-lived reads.
    pub fn with_view<T: Send + 'static, R>(&self, id: u32, f: impl FnOnce(&T) -> R) -> Result<R> {
        let node = self.node::<T>(id)?;
        let guard = node.blocking_lock();
        Ok(f(&guard))
    }

    /// Whether a resource is registered under `id`. Briefly takes the
    /// table lock.
    pub fn has_resource(&self, id: u32) -> bool {
        self.resources
            .lock()
            .expect("registry table poisoned")
            .contains_key(&id)
    }
}
