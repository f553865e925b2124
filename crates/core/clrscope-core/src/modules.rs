//! Loaded-module catalog contract.
//!
//! The core only needs enough about each native module to anchor type
//! resolution and symbol matching; actual symbol parsing happens outside
//! this workspace.

use crate::memory::Addr;

/// Identity used to match a module against its symbol file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildId {
    /// ELF build-id or PE debug GUID.
    Guid([u8; 16]),
    /// PE timestamp/size pair.
    TimeStamp { timestamp: u32, size: u32 },
    /// No identity available (anonymous or synthetic module).
    None,
}

/// One loaded native module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Load address of the image.
    pub base: Addr,
    /// Size of the mapped image in bytes.
    pub file_size: u64,
    /// On-disk path, empty when unknown.
    pub path: String,
    /// Symbol-matching identity.
    pub build_id: BuildId,
}

/// Enumeration of the target's loaded native modules.
pub trait ModuleSource: Send + Sync {
    /// All loaded modules, in no particular order.
    fn modules(&self) -> Vec<ModuleInfo>;
}

impl ModuleInfo {
    /// Whether `addr` falls inside this module's mapped image.
    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.base && addr - self.base < self.file_size
    }
}
