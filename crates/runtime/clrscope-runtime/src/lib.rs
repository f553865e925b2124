//! # clrscope-runtime
//!
//! The top layer of the clrscope workspace. The analysis [`Session`] binds
//! a memory source, the runtime ABI accessor, and the collaborator
//! contracts into one queryable view of a managed process: heap objects,
//! GC roots across every category, dependent-handle edges, and the
//! optional materialized heap cache.
//!
//! The session model is deliberately single-threaded: one `Session` per
//! analysis thread, sharing nothing but the immutable memory source.

pub mod roots;
pub mod session;

pub use roots::{ClrRoot, RootKind};
pub use session::{Session, SessionSources};
