//! Type resolution and the session-scoped type cache.
//!
//! A type handle is just an address. Resolving one means reading the
//! method table it points at and either finding the [`ClrType`] the
//! session already knows for that structural type, or constructing a new
//! one. The subtlety is domain-neutral typing: the same type loaded into
//! two isolated domains has two distinct handles, but must resolve to
//! *one* shared `ClrType`: identity, not mere equality.

use crate::gcdesc::GcMap;
use clrscope_core::{Addr, ComponentKind, MemorySource, RuntimeAbi};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock};

/// A resolved, cached type descriptor.
///
/// One `ClrType` exists per structural type per session, no matter how
/// many domains load it; equality is identity. The only mutation after
/// construction is attaching lazily fetched sub-data (additional handle
/// aliases, the decoded GC map).
pub struct ClrType {
    module: Addr,
    token: u32,
    base_size: u32,
    component_size: u32,
    component_kind: ComponentKind,
    parent: Addr,
    contains_pointers: bool,
    shared: bool,
    collectible: bool,
    loader_allocator_handle: Addr,
    is_free: bool,
    /// `(domain, handle)` aliases, kept sorted ascending by domain id.
    aliases: Mutex<Vec<(u32, Addr)>>,
    gc_map: OnceLock<Option<GcMap>>,
}

impl ClrType {
    fn new(handle: Addr, data: &clrscope_core::MethodTableData) -> Self {
        Self {
            module: data.module,
            token: data.token,
            base_size: data.base_size,
            component_size: data.component_size,
            component_kind: data.component_kind,
            parent: data.parent,
            contains_pointers: data.contains_pointers,
            shared: data.shared,
            collectible: data.collectible,
            loader_allocator_handle: data.loader_allocator_handle,
            is_free: data.is_free,
            aliases: Mutex::new(vec![(data.domain, handle)]),
            gc_map: OnceLock::new(),
        }
    }

    /// Owning module address.
    pub fn module(&self) -> Addr {
        self.module
    }

    /// Metadata token within the owning module.
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Fixed portion of an instance's size.
    pub fn base_size(&self) -> u32 {
        self.base_size
    }

    /// Per-element size; nonzero means array or string.
    pub fn component_size(&self) -> u32 {
        self.component_size
    }

    /// Parent type's handle, zero at the root.
    pub fn parent_handle(&self) -> Addr {
        self.parent
    }

    /// Whether instances contain object-reference slots.
    pub fn contains_pointers(&self) -> bool {
        self.contains_pointers
    }

    /// Whether this type can be unloaded. Collectible types keep their
    /// loader-allocator object reachable through every instance.
    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    /// Handle slot holding the loader-allocator object.
    pub fn loader_allocator_handle(&self) -> Addr {
        self.loader_allocator_handle
    }

    /// Whether this is the free-space sentinel type.
    pub fn is_free(&self) -> bool {
        self.is_free
    }

    /// Whether instances are array-shaped (excluding strings, which have
    /// a component size but their own layout).
    pub fn is_array(&self) -> bool {
        self.component_size != 0 && self.component_kind != ComponentKind::None
    }

    /// Whether this is an array of object references.
    pub fn is_object_array(&self) -> bool {
        self.component_size != 0 && self.component_kind == ComponentKind::Reference
    }

    /// The canonical handle: the alias belonging to the first domain (in
    /// ascending domain-id order) that loaded this type.
    pub fn type_handle(&self) -> Addr {
        self.aliases.lock()[0].1
    }

    /// Every known handle for this type, ascending by domain id.
    pub fn enumerate_type_handles(&self) -> Vec<Addr> {
        self.aliases.lock().iter().map(|&(_, h)| h).collect()
    }

    /// Record `handle` as this type's representative in `domain`.
    fn register_alias(&self, domain: u32, handle: Addr) {
        let mut aliases = self.aliases.lock();
        if aliases.iter().any(|&(_, h)| h == handle) {
            return;
        }
        let at = aliases.partition_point(|&(d, _)| d <= domain);
        aliases.insert(at, (domain, handle));
    }

    /// The type's decoded GC pointer map, fetched and cached on first use.
    /// `None` when the type has no descriptor or it is unreadable.
    pub fn gc_map(&self, mem: &dyn MemorySource) -> Option<&GcMap> {
        self.gc_map
            .get_or_init(|| GcMap::decode(mem, self.type_handle()))
            .as_ref()
    }
}

impl PartialEq for ClrType {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for ClrType {}

impl std::fmt::Debug for ClrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClrType")
            .field("module", &format_args!("{:#x}", self.module))
            .field("token", &format_args!("{:#x}", self.token))
            .field("base_size", &self.base_size)
            .field("component_size", &self.component_size)
            .field("free", &self.is_free)
            .finish()
    }
}

#[derive(Default)]
struct TypeMaps {
    by_handle: FxHashMap<Addr, Arc<ClrType>>,
    by_key: FxHashMap<(Addr, u32), Arc<ClrType>>,
}

/// The session-scoped handle → type cache.
///
/// Owned by one analysis session and passed explicitly to the components
/// that resolve types; nothing here is process-global.
pub struct TypeFactory {
    mem: Arc<dyn MemorySource>,
    abi: Arc<dyn RuntimeAbi>,
    maps: Mutex<TypeMaps>,
}

impl TypeFactory {
    /// Create an empty cache reading through `mem` with layout knowledge
    /// from `abi`.
    pub fn new(mem: Arc<dyn MemorySource>, abi: Arc<dyn RuntimeAbi>) -> Self {
        Self {
            mem,
            abi,
            maps: Mutex::new(TypeMaps::default()),
        }
    }

    /// Resolve `handle` to its shared [`ClrType`].
    ///
    /// Returns `None` when the handle is unreadable or does not look like
    /// a type descriptor; callers stop walking that branch, nothing is
    /// thrown. `_instance` is the address the handle was observed at, kept
    /// for diagnostic value only.
    pub fn get_or_create(&self, handle: Addr, _instance: Addr) -> Option<Arc<ClrType>> {
        if handle == 0 {
            return None;
        }
        if let Some(existing) = self.maps.lock().by_handle.get(&handle) {
            return Some(existing.clone());
        }

        let data = self.abi.read_method_table(&*self.mem, handle)?;
        let key = (data.module, data.token);

        let mut maps = self.maps.lock();
        // Double-checked: another resolution may have raced us here while
        // the descriptor read ran unlocked.
        if let Some(existing) = maps.by_handle.get(&handle) {
            return Some(existing.clone());
        }
        if let Some(existing) = maps.by_key.get(&key).cloned() {
            existing.register_alias(data.domain, handle);
            maps.by_handle.insert(handle, existing.clone());
            return Some(existing);
        }

        let created = Arc::new(ClrType::new(handle, &data));
        maps.by_handle.insert(handle, created.clone());
        maps.by_key.insert(key, created.clone());
        Some(created)
    }

    /// Every distinct type resolved so far.
    pub fn known_types(&self) -> Vec<Arc<ClrType>> {
        self.maps.lock().by_key.values().cloned().collect()
    }

    /// The memory source types read through.
    pub fn memory(&self) -> &Arc<dyn MemorySource> {
        &self.mem
    }
}
