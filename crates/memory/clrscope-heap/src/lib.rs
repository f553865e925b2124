//! # clrscope-heap
//!
//! Reconstruction of a managed runtime's GC heap from raw memory: given the
//! segment layout and a few well-known method tables, this crate resolves
//! type handles into cached [`ClrType`] descriptors, decodes each type's GC
//! pointer map, and walks segments to produce the full typed object graph.
//!
//! All enumeration is lazy and pull-based; all failure handling is
//! best-effort. A truncated dump or a torn live snapshot yields partial
//! results, never an error: unreadable memory and structurally invalid
//! runtime data both terminate the affected branch and let the larger
//! enumeration continue.
//!
//! ## Layering
//!
//! ```text
//! segment   sorted, validated segment table + allocation contexts
//!    ↓
//! types     handle -> ClrType resolution, domain-neutral dedup
//!    ↓
//! gcdesc    per-type pointer-map decoding and instance walking
//!    ↓
//! walker    ClrHeap: object + reference enumeration
//!    ↓
//! cache     optional precomputed snapshot for repeatable O(1) queries
//! ```

pub mod cache;
pub mod gcdesc;
pub mod segment;
pub mod testing;
pub mod types;
pub mod walker;

pub use cache::HeapCache;
pub use gcdesc::GcMap;
pub use segment::{Segment, SegmentKind};
pub use types::{ClrType, TypeFactory};
pub use walker::{ClrHeap, ClrObject, ObjRef};
