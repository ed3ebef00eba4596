// src/capability/mod.rs
//! Capability references and the kernel invocation surface.
//!
//! A capability is an unforgeable kernel-managed reference to a kernel
//! object. Userspace addresses one by `(cnode address, slot index, level)`;
//! the kernel refcount manages the object's lifetime.
//!
//! # Design
//!
//! - [`CapRef`] is a **move-only** handle: it does not implement `Clone` or
//!   `Copy`. A second kernel-visible handle to the same object is produced
//!   by `cap_copy`, and a second *reference to the same slot* (the
//!   C-style by-value capref) is minted explicitly with [`CapRef::alias`].
//! - The microkernel syscall surface is out of scope for this crate and
//!   appears only as the [`KernelInterface`] trait. Tests inject the mock in
//!   [`mock`]; on hardware the trait maps one-to-one onto invocations.

#[cfg(test)]
pub mod mock;

use bitflags::bitflags;

use crate::errors::KernelCallError;

/// Core identifier (one byte, encoded into the PID high digits).
pub type CoreId = u8;

/// Kernel object types visible to this runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapType {
    /// Empty slot
    Null,
    /// Untyped RAM
    Ram,
    /// Mappable frame
    Frame,
    /// Device frame (uncached)
    DevFrame,
    /// Root capability table
    L1CNode,
    /// Second-level capability table
    L2CNode,
    /// Page table, level 0 (root)
    VnodeL0,
    /// Page table, level 1
    VnodeL1,
    /// Page table, level 2
    VnodeL2,
    /// Page table, level 3 (leaf)
    VnodeL3,
    /// Dispatcher control block
    Dispatcher,
    /// LMP endpoint
    Endpoint,
    /// Mapping capability returned by `vnode_map`
    Mapping,
}

impl CapType {
    /// One-byte wire encoding used when shipping a capability identity
    /// across cores. Only memory object types are transferable.
    #[must_use]
    pub const fn wire_code(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Ram => 1,
            Self::Frame => 2,
            Self::DevFrame => 3,
            Self::L1CNode => 4,
            Self::L2CNode => 5,
            Self::VnodeL0 => 6,
            Self::VnodeL1 => 7,
            Self::VnodeL2 => 8,
            Self::VnodeL3 => 9,
            Self::Dispatcher => 10,
            Self::Endpoint => 11,
            Self::Mapping => 12,
        }
    }

    /// Decode a wire code; unknown values decode to `Null`.
    #[must_use]
    pub const fn from_wire_code(code: u8) -> Self {
        match code {
            1 => Self::Ram,
            2 => Self::Frame,
            3 => Self::DevFrame,
            4 => Self::L1CNode,
            5 => Self::L2CNode,
            6 => Self::VnodeL0,
            7 => Self::VnodeL1,
            8 => Self::VnodeL2,
            9 => Self::VnodeL3,
            10 => Self::Dispatcher,
            11 => Self::Endpoint,
            12 => Self::Mapping,
            _ => Self::Null,
        }
    }
}

/// Page table level of a vnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VnodeLevel {
    L0,
    L1,
    L2,
    L3,
}

impl VnodeLevel {
    /// The capability type of a vnode at this level.
    #[must_use]
    pub const fn cap_type(&self) -> CapType {
        match self {
            Self::L0 => CapType::VnodeL0,
            Self::L1 => CapType::VnodeL1,
            Self::L2 => CapType::VnodeL2,
            Self::L3 => CapType::VnodeL3,
        }
    }

    /// The next level down, or `None` at the leaf.
    #[must_use]
    pub const fn child(&self) -> Option<Self> {
        match self {
            Self::L0 => Some(Self::L1),
            Self::L1 => Some(Self::L2),
            Self::L2 => Some(Self::L3),
            Self::L3 => None,
        }
    }
}

/// Level of a cnode within the two-level cspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CNodeLevel {
    /// The per-process root cnode
    L1,
    /// Any second-level cnode
    Other,
}

/// Reference to a capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CNodeRef {
    /// Address of the root cnode this table hangs off
    pub croot: u32,
    /// Address of the table itself
    pub address: u32,
    /// Table level
    pub level: CNodeLevel,
}

impl CNodeRef {
    /// The null cnode reference.
    pub const NULL: Self = Self {
        croot: 0,
        address: 0,
        level: CNodeLevel::Other,
    };
}

/// Move-only reference to a capability slot.
#[derive(Debug, PartialEq, Eq)]
pub struct CapRef {
    /// The cnode containing the slot
    pub cnode: CNodeRef,
    /// Slot index within the cnode
    pub slot: u32,
}

impl CapRef {
    /// The null capability.
    pub const NULL: Self = Self {
        cnode: CNodeRef::NULL,
        slot: 0,
    };

    /// Construct a reference to `slot` within `cnode`.
    #[must_use]
    pub const fn at(cnode: CNodeRef, slot: u32) -> Self {
        Self { cnode, slot }
    }

    /// Whether this is the null capability.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.cnode == CNodeRef::NULL && self.slot == 0
    }

    /// Mint another reference to the same slot.
    ///
    /// This does not touch the kernel; it is the explicit spelling of the
    /// C-style by-value capref copy. Use `cap_copy` to create a second
    /// kernel-visible capability.
    #[must_use]
    pub const fn alias(&self) -> Self {
        Self {
            cnode: self.cnode,
            slot: self.slot,
        }
    }
}

/// Identity of a kernel object, as reported by `cap_identify`.
///
/// `(base, bytes, owner)` is the serialized form used when shipping
/// capabilities across cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapIdentity {
    /// Object type
    pub ctype: CapType,
    /// Physical base address
    pub base: u64,
    /// Object size in bytes
    pub bytes: u64,
    /// Owning core
    pub owner: CoreId,
}

bitflags! {
    /// Mapping permission flags, passed through to `vnode_map`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        const NOCACHE = 1 << 3;
    }
}

impl MapFlags {
    /// Read + write, the default for data frames.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    /// Read + write, uncached. Used for DMA-visible frames.
    pub const READ_WRITE_NOCACHE: Self = Self::READ_WRITE.union(Self::NOCACHE);
    /// Read + execute, for text segments.
    pub const READ_EXECUTE: Self = Self::READ.union(Self::EXECUTE);
}

/// The microkernel invocation surface consumed by this runtime.
///
/// Each method corresponds to one capability invocation or well-known
/// dispatcher value. Implementations are external to this crate; the tests
/// use [`mock::MockKernel`].
pub trait KernelInterface {
    /// Allocate a fresh slot in the root cnode.
    fn slot_alloc_root(&self) -> Result<CapRef, KernelCallError>;

    /// Grow the root cnode slot allocator with an L2-cnode-sized RAM cap.
    fn root_slot_refill(&self, ram: CapRef) -> Result<(), KernelCallError>;

    /// Create a page table object of the given level in `dest`.
    fn vnode_create(&self, dest: &CapRef, level: VnodeLevel) -> Result<(), KernelCallError>;

    /// Install `child` (a vnode or frame) at `slot` of the vnode `parent`.
    ///
    /// `offset` is the byte offset into the mapped object, `pte_count` the
    /// number of consecutive entries to fill. The mapping capability is
    /// deposited in `mapping`.
    #[allow(clippy::too_many_arguments)]
    fn vnode_map(
        &self,
        parent: &CapRef,
        child: &CapRef,
        slot: u32,
        flags: MapFlags,
        offset: usize,
        pte_count: usize,
        mapping: &CapRef,
    ) -> Result<(), KernelCallError>;

    /// Copy the capability in `src` into the empty slot `dest`.
    fn cap_copy(&self, dest: &CapRef, src: &CapRef) -> Result<(), KernelCallError>;

    /// Retype `count` objects of `new_type`/`objsize` out of `src` at
    /// `offset`, depositing them in consecutive slots starting at `dest`.
    fn cap_retype(
        &self,
        dest: &CapRef,
        src: &CapRef,
        offset: usize,
        new_type: CapType,
        objsize: usize,
        count: usize,
    ) -> Result<(), KernelCallError>;

    /// Query the identity of the object behind a capability.
    fn cap_identify(&self, cap: &CapRef) -> Result<CapIdentity, KernelCallError>;

    /// Delete a capability, consuming the handle.
    fn cap_destroy(&self, cap: CapRef) -> Result<(), KernelCallError>;

    /// Create an L1 cnode in `dest`; returns its cnode reference.
    fn cnode_create_l1(&self, dest: &CapRef) -> Result<CNodeRef, KernelCallError>;

    /// Create an L2 cnode at `slot` of the foreign L1 cnode `parent_l1`.
    fn cnode_create_foreign_l2(
        &self,
        parent_l1: &CapRef,
        slot: u32,
    ) -> Result<CNodeRef, KernelCallError>;

    /// Derive the cnode reference of an L2 cnode capability.
    fn cnode_from_cap(&self, cnode_cap: &CapRef) -> Result<CNodeRef, KernelCallError>;

    /// Create a dispatcher object in `dest`.
    fn dispatcher_create(&self, dest: &CapRef) -> Result<(), KernelCallError>;

    /// Configure and optionally run a dispatcher.
    fn invoke_dispatcher(
        &self,
        disp: &CapRef,
        domain_disp: &CapRef,
        rootcn: &CapRef,
        vroot: &CapRef,
        dispframe: &CapRef,
        run: bool,
    ) -> Result<(), KernelCallError>;

    /// Stop a running dispatcher.
    fn invoke_dispatcher_stop(&self, disp: &CapRef) -> Result<(), KernelCallError>;

    /// Create an LMP endpoint with the given receive buffer length.
    fn endpoint_create(&self, dest: &CapRef, buflen: usize) -> Result<(), KernelCallError>;

    /// Forge a RAM capability for a physical region known from another core.
    fn ram_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        owner: CoreId,
    ) -> Result<(), KernelCallError>;

    /// Forge a frame capability for a physical region known from another core.
    fn frame_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        owner: CoreId,
    ) -> Result<(), KernelCallError>;

    /// Forge a device frame capability.
    fn devframe_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        owner: CoreId,
    ) -> Result<(), KernelCallError>;

    /// The core this dispatcher runs on.
    fn core_id(&self) -> CoreId;

    /// The well-known capability to this dispatcher's own control block.
    fn own_dispatcher(&self) -> CapRef;
}
