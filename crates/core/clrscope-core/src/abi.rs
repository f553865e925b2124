//! The per-runtime-build ABI seam.
//!
//! Different runtime releases lay out their internal structures differently.
//! Rather than keying subclass trees on version, all layout knowledge is
//! concentrated in one strategy object implementing [`RuntimeAbi`], injected
//! at session construction. The walking algorithms above never hard-code an
//! offset; they ask the ABI.
//!
//! [`DesktopAbi`] implements the layout used by the supported desktop
//! runtime family. A target reporting any other version fails session
//! construction with [`Error::UnsupportedRuntime`]; silently misreading
//! every structure would be strictly worse than refusing up front.

use crate::error::{Error, Result};
use crate::memory::{Addr, MemoryExt, MemorySource};

/// Version reported by the target's runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub revision: u32,
}

impl std::fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// What an array-like type's elements are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// Not an array/string type.
    None,
    /// Elements are object references.
    Reference,
    /// Elements are inline value types or primitives.
    Value,
}

/// Structural description of a type, decoded from its method table.
///
/// Field meanings follow the runtime's own descriptor: `component_size`
/// nonzero marks an array or string, where an instance's size is
/// `base_size + component_size * element_count`.
#[derive(Debug, Clone, Copy)]
pub struct MethodTableData {
    /// This descriptor is the free-space sentinel; other fields are invalid.
    pub is_free: bool,
    /// Owning module address.
    pub module: Addr,
    /// Parent type's method table, zero for the root type.
    pub parent: Addr,
    /// Fixed portion of an instance's size in bytes.
    pub base_size: u32,
    /// Per-element size; nonzero for arrays and strings.
    pub component_size: u32,
    /// Metadata token within the owning module.
    pub token: u32,
    /// Id of the domain the owning module instance is loaded into.
    pub domain: u32,
    /// Element kind for array-like types.
    pub component_kind: ComponentKind,
    /// Instances contain object-reference slots (a GC descriptor exists).
    pub contains_pointers: bool,
    /// Type is domain-neutral (one method table shared by all domains).
    pub shared: bool,
    /// Type can be unloaded; its loader allocator must be kept reachable.
    pub collectible: bool,
    /// Handle to the loader-allocator object for collectible types.
    pub loader_allocator_handle: Addr,
}

/// Layout and field-offset knowledge for one runtime build family.
pub trait RuntimeAbi: Send + Sync {
    /// Decode the method table at `handle`, or `None` if the memory is
    /// unreadable or does not look like a type descriptor.
    fn read_method_table(&self, mem: &dyn MemorySource, handle: Addr) -> Option<MethodTableData>;

    /// Offset of a string's stored character count from the object start.
    fn string_length_offset(&self, pointer_size: u32) -> u64;

    /// Offset of a string's first character from the object start.
    fn string_first_char_offset(&self, pointer_size: u32) -> u64;

    /// Offset of an array's first element from the object start.
    fn array_data_offset(&self, pointer_size: u32) -> u64;

    /// Offset of the pinned user-object slot inside an async-pinned
    /// handle's target (the overlapped I/O state object).
    fn async_pinned_user_object_offset(&self, pointer_size: u32) -> u64;
}

/// Method-table field offsets consumed by [`DesktopAbi`].
///
/// This is the marshaled descriptor shape the diagnostics interface exposes,
/// independent of the target's pointer width. Synthetic-target tests write
/// these same offsets.
pub mod mt_layout {
    /// `u32` per-element size.
    pub const COMPONENT_SIZE: u64 = 0x00;
    /// `u32` flag word, see [`flags`].
    pub const FLAGS: u64 = 0x04;
    /// `u32` fixed instance size.
    pub const BASE_SIZE: u64 = 0x08;
    /// `u32` metadata token.
    pub const TOKEN: u64 = 0x0C;
    /// `u64` parent method table.
    pub const PARENT: u64 = 0x10;
    /// `u64` owning module.
    pub const MODULE: u64 = 0x18;
    /// `u64` loader-allocator handle.
    pub const LOADER_ALLOCATOR: u64 = 0x20;
    /// `u32` owning domain id.
    pub const DOMAIN: u64 = 0x28;
    /// `u32` element kind (0 none, 1 reference, 2 value).
    pub const COMPONENT_KIND: u64 = 0x2C;
    /// Total descriptor size in bytes.
    pub const SIZE: u64 = 0x30;

    /// Bits of the [`FLAGS`] word.
    pub mod flags {
        pub const FREE: u32 = 1 << 0;
        pub const CONTAINS_POINTERS: u32 = 1 << 1;
        pub const SHARED: u32 = 1 << 2;
        pub const COLLECTIBLE: u32 = 1 << 3;
    }
}

/// Sanity bound for descriptor sizes; anything larger is garbage memory.
const MAX_PLAUSIBLE_SIZE: u32 = 0x1000_0000;

/// ABI for the supported desktop runtime family (major version 4).
#[derive(Debug)]
pub struct DesktopAbi {
    version: RuntimeVersion,
}

impl DesktopAbi {
    /// Build the ABI accessor for `version`, rejecting unsupported builds.
    pub fn new(version: RuntimeVersion) -> Result<Self> {
        if version.major != 4 {
            return Err(Error::unsupported_runtime(version));
        }
        Ok(Self { version })
    }

    /// The version this accessor was built for.
    pub fn version(&self) -> RuntimeVersion {
        self.version
    }
}

impl RuntimeAbi for DesktopAbi {
    fn read_method_table(&self, mem: &dyn MemorySource, handle: Addr) -> Option<MethodTableData> {
        if handle == 0 {
            return None;
        }
        let raw = mem.read_bytes(handle, mt_layout::SIZE as usize)?;
        if raw.iter().all(|&b| b == 0) {
            return None;
        }

        let u32_at = |off: u64| {
            let off = off as usize;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&raw[off..off + 4]);
            u32::from_le_bytes(buf)
        };
        let u64_at = |off: u64| {
            let off = off as usize;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(buf)
        };

        let flags = u32_at(mt_layout::FLAGS);
        let is_free = flags & mt_layout::flags::FREE != 0;
        let base_size = u32_at(mt_layout::BASE_SIZE);
        let component_size = u32_at(mt_layout::COMPONENT_SIZE);

        // Zeroed or garbage descriptor regions are rejected, not errored.
        if !is_free && base_size == 0 {
            return None;
        }
        if base_size > MAX_PLAUSIBLE_SIZE || component_size > MAX_PLAUSIBLE_SIZE {
            return None;
        }

        let component_kind = match u32_at(mt_layout::COMPONENT_KIND) {
            0 => ComponentKind::None,
            1 => ComponentKind::Reference,
            2 => ComponentKind::Value,
            _ => return None,
        };

        Some(MethodTableData {
            is_free,
            module: u64_at(mt_layout::MODULE),
            parent: u64_at(mt_layout::PARENT),
            base_size,
            component_size,
            token: u32_at(mt_layout::TOKEN),
            domain: u32_at(mt_layout::DOMAIN),
            component_kind,
            contains_pointers: flags & mt_layout::flags::CONTAINS_POINTERS != 0,
            shared: flags & mt_layout::flags::SHARED != 0,
            collectible: flags & mt_layout::flags::COLLECTIBLE != 0,
            loader_allocator_handle: u64_at(mt_layout::LOADER_ALLOCATOR),
        })
    }

    fn string_length_offset(&self, pointer_size: u32) -> u64 {
        u64::from(pointer_size)
    }

    fn string_first_char_offset(&self, pointer_size: u32) -> u64 {
        u64::from(pointer_size) + 4
    }

    fn array_data_offset(&self, pointer_size: u32) -> u64 {
        u64::from(pointer_size) * 2
    }

    fn async_pinned_user_object_offset(&self, pointer_size: u32) -> u64 {
        u64::from(pointer_size) * 3
    }
}
