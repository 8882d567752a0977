//! Process-local registry resolving [`AllocatorId`]s to allocators.
//!
//! Shared structures only store allocator ids. Each process keeps one
//! `MemoryManager` and passes it wherever an id has to be turned back into a
//! usable allocator, so any id the process has registered (by creating or
//! attaching the allocator) can be resolved.

use crate::allocator::{Allocator, StackAllocator};
use crate::backend::{ArrayBackend, MemoryBackend, MemoryBackendFactory, MemoryBackendId, MemoryBackendType};
use crate::error::{MemoryError, Result};
use crate::pointer::AllocatorId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MemoryManager {
    allocators: RwLock<HashMap<AllocatorId, Arc<dyn Allocator>>>,
    root: Arc<dyn Allocator>,
}

impl MemoryManager {
    /// Size of the in-process root heap used by [`MemoryManager::new`].
    pub const DEFAULT_ROOT_SIZE: usize = 4 << 20;

    pub fn new() -> Result<Self> {
        Self::with_root_size(Self::DEFAULT_ROOT_SIZE)
    }

    /// Build a manager whose root allocator is a `root_size` byte heap buffer.
    pub fn with_root_size(root_size: usize) -> Result<Self> {
        let backend = ArrayBackend::shm_init(MemoryBackendId::ROOT, root_size)?;
        let root: Arc<dyn Allocator> =
            Arc::new(StackAllocator::create(Box::new(backend), AllocatorId::ROOT, 0)?);
        let mut allocators = HashMap::new();
        allocators.insert(AllocatorId::ROOT, root.clone());
        Ok(Self {
            allocators: RwLock::new(allocators),
            root,
        })
    }

    /// The process-local root allocator.
    pub fn default_allocator(&self) -> Arc<dyn Allocator> {
        self.root.clone()
    }

    /// Make `alloc` resolvable by its id, replacing any previous registration.
    pub fn register(&self, alloc: Arc<dyn Allocator>) -> AllocatorId {
        let id = alloc.id();
        if self.allocators.write().insert(id, alloc).is_some() {
            warn!(%id, "allocator id registered twice; previous entry replaced");
        }
        debug!(%id, "registered allocator");
        id
    }

    pub fn resolve(&self, id: AllocatorId) -> Result<Arc<dyn Allocator>> {
        self.allocators
            .read()
            .get(&id)
            .cloned()
            .ok_or(MemoryError::UnknownAllocator(id))
    }

    /// Forget an allocator. Its backend is released once the last handle drops.
    pub fn unregister(&self, id: AllocatorId) -> Option<Arc<dyn Allocator>> {
        if id == AllocatorId::ROOT {
            return None;
        }
        self.allocators.write().remove(&id)
    }

    pub fn create_backend(
        &self,
        kind: MemoryBackendType,
        id: MemoryBackendId,
        size: usize,
        url: &str,
    ) -> Result<Box<dyn MemoryBackend>> {
        MemoryBackendFactory::create(kind, id, size, url)
    }

    pub fn attach_backend(&self, kind: MemoryBackendType, url: &str) -> Result<Box<dyn MemoryBackend>> {
        MemoryBackendFactory::attach(kind, url)
    }

    /// Format `backend` with a new stack allocator and register it.
    pub fn create_stack_allocator(
        &self,
        backend: Box<dyn MemoryBackend>,
        id: AllocatorId,
        custom_header_size: usize,
    ) -> Result<Arc<dyn Allocator>> {
        let alloc: Arc<dyn Allocator> =
            Arc::new(StackAllocator::create(backend, id, custom_header_size)?);
        self.register(alloc.clone());
        Ok(alloc)
    }

    /// Reopen the stack allocator persisted in `backend` and register it.
    pub fn attach_stack_allocator(&self, backend: Box<dyn MemoryBackend>) -> Result<Arc<dyn Allocator>> {
        let alloc: Arc<dyn Allocator> = Arc::new(StackAllocator::attach(backend)?);
        self.register(alloc.clone());
        Ok(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_allocator_is_always_resolvable() {
        let mm = MemoryManager::with_root_size(1 << 16).expect("manager");
        let root = mm.resolve(AllocatorId::ROOT).expect("root");
        assert_eq!(root.id(), AllocatorId::ROOT);
        assert!(mm.unregister(AllocatorId::ROOT).is_none());
        assert!(mm.resolve(AllocatorId::ROOT).is_ok());
    }

    #[test]
    fn unknown_ids_fail_to_resolve() {
        let mm = MemoryManager::with_root_size(1 << 16).expect("manager");
        let id = AllocatorId::new(9, 9);
        match mm.resolve(id) {
            Err(MemoryError::UnknownAllocator(missing)) => assert_eq!(missing, id),
            other => panic!("unexpected: {:?}", other.map(|a| a.id())),
        }
    }

    #[test]
    fn created_allocators_are_registered_until_unregistered() {
        let mm = MemoryManager::with_root_size(1 << 16).expect("manager");
        let backend = mm
            .create_backend(MemoryBackendType::ArrayBackend, MemoryBackendId::get(1), 1 << 16, "")
            .expect("backend");
        let id = AllocatorId::new(1, 0);
        let alloc = mm.create_stack_allocator(backend, id, 64).expect("alloc");
        assert!(Arc::ptr_eq(&alloc, &mm.resolve(id).expect("resolve")));
        assert!(mm.unregister(id).is_some());
        assert!(mm.resolve(id).is_err());
    }
}
