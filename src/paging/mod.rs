// src/paging/mod.rs
//! Four-level page table management.
//!
//! A [`PagingState`] owns the capability references for every intermediate
//! table and leaf mapping of one vspace: a root (L0) vnode plus a tree of
//! per-level nodes. Children are kept in a direct-mapped table of 512
//! entries per level (one slot per hardware entry), trading memory for O(1)
//! lookup, and the node records themselves come from a slab that refills
//! below a low-water mark so deep mapping operations never starve it.
//!
//! Only fixed-address mapping is provided here; fresh-address self-mapping
//! goes through the [`VspaceMapper`] trait, implemented by [`InitVspace`]
//! with a simple non-reusing range allocator.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use log::debug;

use crate::capability::{CapRef, KernelInterface, MapFlags, VnodeLevel};
use crate::constants::{BASE_PAGE_SIZE, PAGING_SLAB_LOW_WATER};
use crate::errors::PagingError;
use crate::mm::CoreResources;

/// Entries per translation table.
const PT_ENTRIES: usize = 512;

/// Nodes grown into the slab at construction.
const SLAB_INIT_NODES: usize = 1024;

/// Nodes added per refill.
const SLAB_REFILL_NODES: usize = 512;

type ChildTable = [Option<u32>; PT_ENTRIES];

fn new_child_table() -> Box<ChildTable> {
    Box::new([None; PT_ENTRIES])
}

/// Slot index of `vaddr` at the table level whose entries start at `shift`.
#[inline]
const fn slot_at(vaddr: u64, shift: u32) -> usize {
    ((vaddr >> shift) & 0x1ff) as usize
}

const L0_SHIFT: u32 = 39;
const L1_SHIFT: u32 = 30;
const L2_SHIFT: u32 = 21;
const L3_SHIFT: u32 = 12;

/// One tracked table or page entry.
struct PtNode {
    /// Table capability for intermediate levels, the mapped frame at leaves
    cap: CapRef,
    /// Mapping capability returned by `vnode_map`
    mapping: CapRef,
    /// Slot this node occupies in its parent
    slot: u16,
    /// Child table; `None` marks a leaf page record
    children: Option<Box<ChildTable>>,
}

/// Slab allocator backing the node records.
struct NodeSlab {
    nodes: Vec<Option<PtNode>>,
    free: Vec<u32>,
    refilling: bool,
}

impl NodeSlab {
    fn with_capacity(n: usize) -> Self {
        let mut slab = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            refilling: false,
        };
        slab.grow(n);
        slab
    }

    fn grow(&mut self, n: usize) {
        self.nodes.reserve(n);
        for _ in 0..n {
            self.free.push(self.nodes.len() as u32);
            self.nodes.push(None);
        }
    }

    fn free_count(&self) -> usize {
        self.free.len()
    }

    fn insert(&mut self, node: PtNode) -> core::result::Result<u32, PagingError> {
        let idx = self.free.pop().ok_or(PagingError::SlabExhausted)?;
        self.nodes[idx as usize] = Some(node);
        Ok(idx)
    }

    fn node(&self, idx: u32) -> &PtNode {
        self.nodes[idx as usize].as_ref().expect("vacant slab node")
    }

    fn node_mut(&mut self, idx: u32) -> &mut PtNode {
        self.nodes[idx as usize].as_mut().expect("vacant slab node")
    }
}

/// Paging state of one vspace.
pub struct PagingState {
    root: CapRef,
    root_children: Box<ChildTable>,
    slab: NodeSlab,
}

impl PagingState {
    /// Create a paging state over the given root (L0) vnode capability.
    #[must_use]
    pub fn new(root: CapRef) -> Self {
        Self {
            root,
            root_children: new_child_table(),
            slab: NodeSlab::with_capacity(SLAB_INIT_NODES),
        }
    }

    /// The root vnode capability of this vspace.
    #[must_use]
    pub fn root_cap(&self) -> &CapRef {
        &self.root
    }

    /// Free node records currently available.
    #[must_use]
    pub fn slab_free_count(&self) -> usize {
        self.slab.free_count()
    }

    fn child_of(&self, parent: Option<u32>, slot: usize) -> Option<u32> {
        match parent {
            None => self.root_children[slot],
            Some(idx) => {
                let table = self
                    .slab
                    .node(idx)
                    .children
                    .as_ref()
                    .expect("leaf used as table");
                table[slot]
            }
        }
    }

    fn set_child(&mut self, parent: Option<u32>, slot: usize, child: u32) {
        match parent {
            None => self.root_children[slot] = Some(child),
            Some(idx) => {
                let table = self
                    .slab
                    .node_mut(idx)
                    .children
                    .as_mut()
                    .expect("leaf used as table");
                table[slot] = Some(child);
            }
        }
    }

    fn parent_cap(&self, parent: Option<u32>) -> CapRef {
        match parent {
            None => self.root.alias(),
            Some(idx) => self.slab.node(idx).cap.alias(),
        }
    }

    /// Find the table at `slot` of `parent`, creating and mapping it if
    /// absent. A node is only recorded once its `vnode_map` succeeded, so a
    /// failed call leaves the tree consistent and re-entry just retries.
    fn ensure_table(
        &mut self,
        kernel: &dyn KernelInterface,
        res: &mut CoreResources,
        parent: Option<u32>,
        slot: usize,
        level: VnodeLevel,
        flags: MapFlags,
    ) -> core::result::Result<u32, PagingError> {
        if let Some(idx) = self.child_of(parent, slot) {
            return Ok(idx);
        }

        let table_cap = res
            .slots
            .alloc(kernel, &mut res.mm, 1)
            .map_err(PagingError::SlotAlloc)?;
        kernel
            .vnode_create(&table_cap, level)
            .map_err(PagingError::VnodeCreate)?;

        let mapping = res
            .slots
            .alloc(kernel, &mut res.mm, 1)
            .map_err(PagingError::SlotAlloc)?;
        let parent_cap = self.parent_cap(parent);
        kernel
            .vnode_map(&parent_cap, &table_cap, slot as u32, flags, 0, 1, &mapping)
            .map_err(PagingError::VnodeMap)?;

        let idx = self.slab.insert(PtNode {
            cap: table_cap,
            mapping,
            slot: slot as u16,
            children: Some(new_child_table()),
        })?;
        self.set_child(parent, slot, idx);
        Ok(idx)
    }

    /// Map `bytes` of `frame` at the fixed virtual address `vaddr`.
    ///
    /// `bytes` is rounded up to whole pages. Ranges crossing an L3-table
    /// boundary are split into per-table chunks, each mapped with the
    /// running byte offset into the frame. Mapping an already-mapped page
    /// fails with [`PagingError::AlreadyMapped`].
    pub fn map_fixed(
        &mut self,
        kernel: &dyn KernelInterface,
        res: &mut CoreResources,
        vaddr: u64,
        frame: &CapRef,
        bytes: usize,
        flags: MapFlags,
    ) -> core::result::Result<(), PagingError> {
        if vaddr as usize % BASE_PAGE_SIZE != 0 {
            return Err(PagingError::Unaligned);
        }
        if bytes == 0 {
            return Err(PagingError::InvalidSize);
        }

        // Keep the slab from starving mid-walk. The guard flag is cleared
        // on exit so later refills are not suppressed.
        if !self.slab.refilling && self.slab.free_count() < PAGING_SLAB_LOW_WATER {
            self.slab.refilling = true;
            debug!("[Paging] refilling node slab");
            self.slab.grow(SLAB_REFILL_NODES);
            self.slab.refilling = false;
        }

        let mut remaining = bytes.div_ceil(BASE_PAGE_SIZE);
        let mut va = vaddr;
        let mut frame_offset = 0usize;

        while remaining > 0 {
            let l3_slot = slot_at(va, L3_SHIFT);
            let chunk = remaining.min(PT_ENTRIES - l3_slot);

            let l1 = self.ensure_table(
                kernel,
                res,
                None,
                slot_at(va, L0_SHIFT),
                VnodeLevel::L1,
                flags,
            )?;
            let l2 = self.ensure_table(
                kernel,
                res,
                Some(l1),
                slot_at(va, L1_SHIFT),
                VnodeLevel::L2,
                flags,
            )?;
            let l3 = self.ensure_table(
                kernel,
                res,
                Some(l2),
                slot_at(va, L2_SHIFT),
                VnodeLevel::L3,
                flags,
            )?;

            for i in 0..chunk {
                if self.child_of(Some(l3), l3_slot + i).is_some() {
                    return Err(PagingError::AlreadyMapped);
                }
            }

            let mapping = res
                .slots
                .alloc(kernel, &mut res.mm, 1)
                .map_err(PagingError::SlotAlloc)?;
            let l3_cap = self.parent_cap(Some(l3));
            kernel
                .vnode_map(
                    &l3_cap,
                    frame,
                    l3_slot as u32,
                    flags,
                    frame_offset,
                    chunk,
                    &mapping,
                )
                .map_err(PagingError::VnodeMap)?;

            for i in 0..chunk {
                let idx = self.slab.insert(PtNode {
                    cap: frame.alias(),
                    mapping: mapping.alias(),
                    slot: (l3_slot + i) as u16,
                    children: None,
                })?;
                self.set_child(Some(l3), l3_slot + i, idx);
            }

            remaining -= chunk;
            va += (chunk * BASE_PAGE_SIZE) as u64;
            frame_offset += chunk * BASE_PAGE_SIZE;
        }

        Ok(())
    }

    /// Walk the four-level path of `vaddr` and return the leaf
    /// `(frame, mapping)` capabilities, if mapped.
    #[must_use]
    pub fn lookup(&self, vaddr: u64) -> Option<(&CapRef, &CapRef)> {
        let l1 = self.child_of(None, slot_at(vaddr, L0_SHIFT))?;
        let l2 = self.child_of(Some(l1), slot_at(vaddr, L1_SHIFT))?;
        let l3 = self.child_of(Some(l2), slot_at(vaddr, L2_SHIFT))?;
        let leaf = self.child_of(Some(l3), slot_at(vaddr, L3_SHIFT))?;
        let node = self.slab.node(leaf);
        debug_assert_eq!(node.slot as usize, slot_at(vaddr, L3_SHIFT));
        Some((&node.cap, &node.mapping))
    }
}

/// Self-mapping interface of a dispatcher's own vspace.
///
/// The contract of the fresh-address variants of the paging interface:
/// every call returns a fresh aligned range that never collides with a
/// prior mapping.
pub trait VspaceMapper {
    /// Map `bytes` of `frame` somewhere in the own address space and
    /// return a pointer to the mapped range.
    fn map_frame(
        &mut self,
        kernel: &dyn KernelInterface,
        res: &mut CoreResources,
        frame: &CapRef,
        bytes: usize,
        flags: MapFlags,
    ) -> core::result::Result<NonNull<u8>, PagingError>;
}

/// [`VspaceMapper`] over a [`PagingState`] with a bump range allocator.
pub struct InitVspace {
    state: PagingState,
    next_vaddr: u64,
    limit: u64,
}

impl InitVspace {
    /// Create a self-mapping view allocating from `[base, limit)`.
    #[must_use]
    pub fn new(state: PagingState, base: u64, limit: u64) -> Self {
        Self {
            state,
            next_vaddr: base,
            limit,
        }
    }

    /// The underlying paging state.
    #[must_use]
    pub fn state(&self) -> &PagingState {
        &self.state
    }
}

impl VspaceMapper for InitVspace {
    fn map_frame(
        &mut self,
        kernel: &dyn KernelInterface,
        res: &mut CoreResources,
        frame: &CapRef,
        bytes: usize,
        flags: MapFlags,
    ) -> core::result::Result<NonNull<u8>, PagingError> {
        let rounded = bytes.max(1).next_multiple_of(BASE_PAGE_SIZE) as u64;
        if self.next_vaddr + rounded > self.limit {
            return Err(PagingError::VaExhausted);
        }
        let va = self.next_vaddr;
        self.state
            .map_fixed(kernel, res, va, frame, rounded as usize, flags)?;
        self.next_vaddr = va + rounded;
        NonNull::new(va as *mut u8).ok_or(PagingError::VaExhausted)
    }
}
