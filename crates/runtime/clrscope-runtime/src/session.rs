//! The analysis session: one target, one reconstructed heap, cached roots.
//!
//! A [`Session`] owns the memory source, the type cache, the heap view, and
//! the collaborator contracts that describe the target's threads, handles,
//! and statics. It adds the stateful layers on top of the pure walkers:
//! the root cache, the dependent-handle side map, and the optional
//! materialized heap cache. One session serves one thread of analysis.

use crate::roots::{self, ClrRoot};
use clrscope_core::{
    Addr, CancelToken, Error, FinalizerQueueSegment, HandleSource, HeapProvider, MemorySource,
    ModuleInfo, ModuleSource, Result, RuntimeAbi, SessionConfig, StaticRootSource, ThreadInfo,
    ThreadSource,
};
use clrscope_heap::{ClrHeap, ClrObject, ClrType, HeapCache, ObjRef, TypeFactory};
use log::{debug, info};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::sync::Arc;

/// The collaborator contracts a session is built from.
///
/// A dump or live-process reader implements these; the session never
/// touches the target except through them and the memory source.
pub struct SessionSources {
    pub provider: Arc<dyn HeapProvider>,
    pub threads: Arc<dyn ThreadSource>,
    pub handles: Arc<dyn HandleSource>,
    pub statics: Arc<dyn StaticRootSource>,
    pub modules: Arc<dyn ModuleSource>,
}

/// One target under analysis.
pub struct Session {
    heap: ClrHeap,
    threads: Arc<dyn ThreadSource>,
    handles: Arc<dyn HandleSource>,
    statics: Arc<dyn StaticRootSource>,
    modules: Vec<ModuleInfo>,
    finalizer_roots: Vec<FinalizerQueueSegment>,
    finalizer_objects: Vec<FinalizerQueueSegment>,
    root_cache: Mutex<Option<Arc<Vec<ClrRoot>>>>,
    dependent: Mutex<Option<Arc<FxHashMap<Addr, Vec<Addr>>>>>,
    heap_cache: Mutex<Option<Arc<HeapCache>>>,
    disposed: Cell<bool>,
}

impl Session {
    /// Open a session over `mem` with the given ABI accessor and
    /// collaborators.
    ///
    /// An unsupported runtime build fails here (the ABI accessor's
    /// constructor rejects it); a malformed segment table fails here too.
    /// Everything downstream is best-effort.
    pub fn open(
        mem: Arc<dyn MemorySource>,
        abi: Arc<dyn RuntimeAbi>,
        sources: SessionSources,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mem: Arc<dyn MemorySource> = if config.cache_reads {
            Arc::new(clrscope_core::CachedMemory::new(mem))
        } else {
            mem
        };
        let types = Arc::new(TypeFactory::new(mem.clone(), abi.clone()));
        let finalizer_roots = sources.provider.finalizer_roots();
        let finalizer_objects = sources.provider.finalizer_objects();
        let heap = ClrHeap::new(mem, abi, types, &*sources.provider, config)?;
        let modules = sources.modules.modules();
        info!(
            "session opened: {} segments, {} modules",
            heap.segments().len(),
            modules.len()
        );
        Ok(Self {
            heap,
            threads: sources.threads,
            handles: sources.handles,
            statics: sources.statics,
            modules,
            finalizer_roots,
            finalizer_objects,
            root_cache: Mutex::new(None),
            dependent: Mutex::new(None),
            heap_cache: Mutex::new(None),
            disposed: Cell::new(false),
        })
    }

    fn live(&self) -> Result<()> {
        if self.disposed.get() {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    /// The reconstructed heap view.
    pub fn heap(&self) -> Result<&ClrHeap> {
        self.live()?;
        Ok(&self.heap)
    }

    /// Loaded native modules, as reported at session open.
    pub fn modules(&self) -> Result<&[ModuleInfo]> {
        self.live()?;
        Ok(&self.modules)
    }

    /// All target threads.
    pub fn threads(&self) -> Result<Vec<ThreadInfo>> {
        self.live()?;
        Ok(self.threads.threads())
    }

    /// Lazily enumerate every heap object.
    ///
    /// Once [`cache_heap`](Self::cache_heap) has run, enumeration replays
    /// the materialized cache and touches no target memory.
    pub fn enumerate_objects(&self) -> Result<Box<dyn Iterator<Item = ClrObject> + '_>> {
        self.live()?;
        if let Some(cache) = self.heap_cache.lock().as_ref() {
            return Ok(Box::new(cache.enumerate_objects()));
        }
        Ok(Box::new(self.heap.enumerate_objects()))
    }

    /// The loaded native module whose mapped image contains `addr`.
    pub fn module_containing(&self, addr: Addr) -> Result<Option<&ModuleInfo>> {
        self.live()?;
        Ok(self.modules.iter().find(|module| module.contains(addr)))
    }

    /// The type of the object starting at `addr`, served from the heap
    /// cache when one has been built.
    pub fn object_type_at(&self, addr: Addr) -> Result<Option<Arc<ClrType>>> {
        self.live()?;
        if let Some(cache) = self.heap_cache.lock().as_ref() {
            return Ok(cache.type_of(addr).cloned());
        }
        Ok(self.heap.object_type_at(addr))
    }

    /// Read the string object at `addr`.
    pub fn read_string(&self, addr: Addr) -> Result<Option<String>> {
        self.live()?;
        Ok(self.heap.read_string(addr))
    }

    /// Enumerate every GC root, all categories combined.
    ///
    /// Served from the root cache when [`cache_roots`](Self::cache_roots)
    /// has run; computed fresh (and not retained) otherwise. Category
    /// order is fixed: handle table, finalizer queue, statics, stacks.
    pub fn enumerate_roots(&self, cancel: &CancelToken) -> Result<Arc<Vec<ClrRoot>>> {
        self.live()?;
        if let Some(cached) = self.root_cache.lock().as_ref() {
            return Ok(cached.clone());
        }
        Ok(Arc::new(self.compute_roots(cancel)?))
    }

    fn compute_roots(&self, cancel: &CancelToken) -> Result<Vec<ClrRoot>> {
        let mut all = roots::handle_roots(&self.heap, &*self.handles, cancel)?;
        all.extend(roots::finalizer_roots(
            &self.heap,
            &self.finalizer_roots,
            cancel,
        )?);
        all.extend(roots::static_roots(&self.heap, &*self.statics, cancel)?);
        all.extend(roots::stack_roots(&self.heap, &*self.threads, cancel)?);
        debug!("computed {} roots", all.len());
        Ok(all)
    }

    /// Compute and retain the full root set. Idempotent; cancellation
    /// leaves no partial cache behind.
    pub fn cache_roots(&self, cancel: &CancelToken) -> Result<()> {
        self.live()?;
        if self.root_cache.lock().is_some() {
            return Ok(());
        }
        let computed = Arc::new(self.compute_roots(cancel)?);
        *self.root_cache.lock() = Some(computed);
        Ok(())
    }

    /// Drop the retained root set (and the dependent-handle map built
    /// alongside it).
    pub fn clear_root_cache(&self) {
        *self.root_cache.lock() = None;
        *self.dependent.lock() = None;
    }

    fn dependent_map(&self, cancel: &CancelToken) -> Result<Arc<FxHashMap<Addr, Vec<Addr>>>> {
        if let Some(map) = self.dependent.lock().as_ref() {
            return Ok(map.clone());
        }
        let map = Arc::new(roots::dependent_handle_map(&*self.handles, cancel)?);
        *self.dependent.lock() = Some(map.clone());
        Ok(map)
    }

    /// Objects kept alive by dependent handles whose primary is `addr`.
    pub fn dependent_targets(&self, addr: Addr, cancel: &CancelToken) -> Result<Vec<Addr>> {
        self.live()?;
        let map = self.dependent_map(cancel)?;
        Ok(map.get(&addr).cloned().unwrap_or_default())
    }

    /// Enumerate `obj`'s outgoing references: its GC-map slots unioned
    /// with any dependent-handle edges whose primary is `obj`. Served from
    /// the heap cache when one has been built.
    pub fn enumerate_object_references(
        &self,
        obj: &ClrObject,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<ObjRef>> {
        self.live()?;
        let cached = self
            .heap_cache
            .lock()
            .as_ref()
            .and_then(|cache| cache.references_of(obj.address()).map(<[ObjRef]>::to_vec));
        let mut refs: Vec<ObjRef> = match cached {
            Some(refs) => refs,
            None => self.heap.enumerate_object_references(obj, carefully).collect(),
        };
        for target in self.dependent_targets(obj.address(), cancel)? {
            refs.push(ObjRef {
                target,
                offset: None,
            });
        }
        Ok(refs)
    }

    /// Addresses of every registered finalizable object (distinct from
    /// finalizer *roots*, whose finalizers are pending).
    pub fn enumerate_finalizable_objects(&self) -> Result<Vec<Addr>> {
        self.live()?;
        Ok(roots::finalizer_queue_objects(
            &self.heap,
            &self.finalizer_objects,
        ))
    }

    /// Build and retain the materialized heap cache. Idempotent.
    pub fn cache_heap(&self, cancel: &CancelToken) -> Result<()> {
        self.live()?;
        if self.heap_cache.lock().is_some() {
            return Ok(());
        }
        let cache = Arc::new(HeapCache::build(&self.heap, cancel)?);
        *self.heap_cache.lock() = Some(cache);
        Ok(())
    }

    /// The materialized heap cache, if built.
    pub fn heap_cache(&self) -> Result<Option<Arc<HeapCache>>> {
        self.live()?;
        Ok(self.heap_cache.lock().clone())
    }

    /// Release caches and mark the session unusable. Idempotent; every
    /// subsequent operation returns [`Error::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.clear_root_cache();
        *self.heap_cache.lock() = None;
        debug!("session disposed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}
