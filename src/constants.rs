// src/constants.rs
//! System-wide constants: page geometry, cnode layout, child address-space
//! layout, and RPC tunables.

/// Smallest page size (AArch64 4 KiB granule).
pub const BASE_PAGE_SIZE: usize = 4096;

/// Number of slots in an L2 cnode.
pub const L2_CNODE_SLOTS: usize = 256;

/// Size of the RAM backing an L2 cnode (64-byte capability table entries).
pub const OBJSIZE_L2CNODE: usize = L2_CNODE_SLOTS * 64;

/// Low-water mark of the slot pre-allocator. One deep paging operation may
/// consume up to this many slots before a refill can complete.
pub const SLOT_ALLOC_LOW_WATER: usize = 40;

/// Slab refill threshold for the paging node slab.
pub const PAGING_SLAB_LOW_WATER: usize = 64;

/// Cache line size; one ring-buffer cell.
pub const CACHE_LINE_SIZE: usize = 64;

/// Maximum length of a dispatcher name, including the NUL terminator.
pub const DISP_NAME_LEN: usize = 16;

/// Size of the dispatcher control frame.
pub const DISPATCHER_FRAME_SIZE: usize = 1 << 16;

/// Fixed virtual address of the dispatcher frame in a child's vspace.
pub const CHILD_DISPFRAME_VADDR: u64 = 0x2000_0000;

/// Fixed virtual address of the argument page in a child's vspace.
pub const CHILD_ARGFRAME_VADDR: u64 = CHILD_DISPFRAME_VADDR + DISPATCHER_FRAME_SIZE as u64;

/// Maximum number of command line arguments passed to a child.
pub const MAX_CMDLINE_ARGS: usize = 64;

/// Maximum number of environment variables passed to a child.
pub const MAX_ENVIRON_VARS: usize = 64;

/// Maximum number of cores addressable by the RPC layer.
pub const MAX_COREID: usize = 4;

/// Chunk size requested from core 0 when a core runs out of local RAM.
pub const RAM_PER_CORE: usize = 64 * 1024 * 1024;

/// Per-core PID namespace: pid = core * PID_CORE_FACTOR + counter.
pub const PID_CORE_FACTOR: u32 = 10_000_000;

/// Number of slots in a (simplified) root L1 cnode before a refill.
pub const L1_CNODE_SLOTS: usize = 256;

/// Root cnode layout of a spawned child.
pub mod rootcn_slot {
    /// Task cnode.
    pub const TASKCN: u32 = 0;
    /// Page cnode (slot 0 holds the child's L0 vnode).
    pub const PAGECN: u32 = 1;
    /// Base page cnode, populated with `L2_CNODE_SLOTS` page-sized RAM caps.
    pub const BASE_PAGE_CN: u32 = 2;
    /// Reserved L2 cnodes for the child's own slot allocator.
    pub const SLOT_ALLOC0: u32 = 3;
    pub const SLOT_ALLOC1: u32 = 4;
    pub const SLOT_ALLOC2: u32 = 5;
}

/// Task cnode layout of a spawned child.
pub mod taskcn_slot {
    /// The child's own dispatcher capability.
    pub const DISPATCHER: u32 = 1;
    /// Copy of the child's root cnode.
    pub const ROOTCN: u32 = 2;
    /// The dispatcher control frame.
    pub const DISPFRAME: u32 = 3;
    /// The argument page.
    pub const ARGSPAGE: u32 = 4;
    /// Endpoint to init.
    pub const INITEP: u32 = 5;
    /// First slot free for a user transfer capability.
    pub const FREE: u32 = 6;
}
