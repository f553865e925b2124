//! # clrscope-core
//!
//! Leaf contracts for the clrscope workspace. Everything above this crate
//! (heap reconstruction, root enumeration, the analysis session) consumes the
//! target process exclusively through the narrow interfaces defined here:
//!
//! - [`MemorySource`]: raw address-range reads over a dump, core file, or
//!   suspended process. Partial reads are routine, not errors.
//! - [`ModuleSource`]: enumeration of loaded native modules.
//! - [`RuntimeAbi`]: the per-runtime-build seam that knows structure layouts
//!   and field offsets, so the same walking algorithms serve multiple
//!   runtime releases.
//! - [`ThreadSource`] / [`HandleSource`] / [`StaticRootSource`]: the
//!   thread-stack, GC-handle-table, and static-variable contracts consumed
//!   by root enumeration.
//!
//! The platform-specific readers (minidump, ELF core, live attach) implement
//! these traits; they are deliberately out of scope for this workspace.

pub mod abi;
pub mod cancel;
pub mod config;
pub mod error;
pub mod memory;
pub mod modules;
pub mod provider;
pub mod threads;

pub use abi::{ComponentKind, DesktopAbi, MethodTableData, RuntimeAbi, RuntimeVersion};
pub use cancel::CancelToken;
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use memory::{Addr, CachedMemory, MemoryExt, MemorySource, SnapshotMemory};
pub use modules::{BuildId, ModuleInfo, ModuleSource};
pub use provider::{FinalizerQueueSegment, HeapProvider, SegmentData};
pub use threads::{
    ClrHandle, HandleKind, HandleSource, StackRef, StaticFieldSlot, StaticRootSource, ThreadInfo,
    ThreadSource,
};
