//! Thread, GC-handle, and static-variable contracts consumed by root
//! enumeration.
//!
//! The target-side machinery that produces these (stack unwind support,
//! handle-table readers, field layout from metadata) lives outside the
//! core; root enumeration only needs the slot addresses and raw values
//! reported here, and re-validates everything against the reconstructed
//! heap before yielding a root.

use crate::memory::Addr;

/// One live or dead target thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadInfo {
    /// OS thread id.
    pub id: u32,
    /// Dead threads contribute no stack roots.
    pub alive: bool,
    /// Lower stack bound.
    pub stack_base: Addr,
    /// Upper stack bound.
    pub stack_limit: Addr,
}

/// One entry of a thread's reported stack-reference table.
#[derive(Debug, Clone, Copy)]
pub struct StackRef {
    /// Address of the stack slot holding the reference.
    pub address: Addr,
    /// The reported object (or interior) pointer.
    pub object: Addr,
    /// Points into the middle of an object rather than at its header.
    pub interior: bool,
    /// Slot pins its target.
    pub pinned: bool,
}

/// Thread and stack-reference enumeration contract.
pub trait ThreadSource: Send + Sync {
    /// All target threads.
    fn threads(&self) -> Vec<ThreadInfo>;

    /// The pre-computed stack-reference table for one thread.
    fn stack_refs(&self, thread_id: u32) -> Vec<StackRef>;

    /// Whether the stack-reference tables are exact. Inexact (conservative)
    /// tables may report the same object many times; enumeration
    /// de-duplicates per thread in that case.
    fn exact_stack_walk(&self) -> bool {
        true
    }
}

/// GC handle classification, as stored in the target's handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    WeakShort,
    WeakLong,
    Strong,
    Pinned,
    RefCount,
    Dependent,
    AsyncPinned,
    SizedRef,
}

/// One GC handle.
#[derive(Debug, Clone, Copy)]
pub struct ClrHandle {
    /// Address of the handle slot itself.
    pub address: Addr,
    /// Primary target object.
    pub object: Addr,
    /// Classification.
    pub kind: HandleKind,
    /// Reference count; only meaningful for [`HandleKind::RefCount`].
    pub ref_count: u32,
    /// Secondary target; only meaningful for [`HandleKind::Dependent`].
    pub dependent_target: Addr,
    /// Owning domain id.
    pub domain: u32,
}

/// Handle-table enumeration contract.
pub trait HandleSource: Send + Sync {
    /// All GC handles in the target.
    fn handles(&self) -> Vec<ClrHandle>;
}

/// Address of one static (or thread-static) field slot.
///
/// Fields of primitive type are filtered out by the producer; every slot
/// reported here potentially holds an object reference.
#[derive(Debug, Clone)]
pub struct StaticFieldSlot {
    /// Address of the slot holding the reference.
    pub address: Addr,
    /// Domain the slot belongs to.
    pub domain: u32,
    /// Owning thread for thread-static slots, `None` for regular statics.
    pub thread: Option<u32>,
    /// Diagnostic name, `Type.field` form; may be empty.
    pub name: String,
}

/// Static and thread-static field slot enumeration contract.
pub trait StaticRootSource: Send + Sync {
    /// Every static field slot that could hold an object reference, across
    /// all loaded types, domains, and (for thread statics) threads.
    fn static_slots(&self) -> Vec<StaticFieldSlot>;
}

impl HandleKind {
    /// Whether this handle kind keeps its target alive on its own.
    /// Ref-counted handles additionally require a nonzero count.
    pub fn is_strong(self) -> bool {
        matches!(
            self,
            HandleKind::Strong
                | HandleKind::Pinned
                | HandleKind::AsyncPinned
                | HandleKind::SizedRef
                | HandleKind::RefCount
        )
    }
}
