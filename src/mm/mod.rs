// src/mm/mod.rs
//! RAM capability manager.
//!
//! [`Mm`] tracks untyped RAM handed over at boot and carves allocation-sized
//! RAM capabilities out of it by retype. Region bookkeeping lives in a
//! fixed-capacity node pool so the manager works before page mapping is
//! functional.
//!
//! [`CoreResources`] bundles the manager with the slot pre-allocator and
//! provides the composite allocation helpers (`ram_alloc`, `frame_alloc`)
//! that the paging, spawn, and RPC layers use.

pub mod slot_alloc;

pub use slot_alloc::SlotPrealloc;

use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::capability::{CNodeRef, CapRef, CapType, KernelInterface};
use crate::constants::BASE_PAGE_SIZE;
use crate::errors::{MmError, Result, RuntimeError};

/// Size of the static region-node pool.
const MM_NODE_POOL_BYTES: usize = 64 * 1024;

/// Maximum number of tracked regions.
pub const MAX_REGIONS: usize = MM_NODE_POOL_BYTES / core::mem::size_of::<Region>();

#[derive(Clone, Copy)]
struct Region {
    base: u64,
    bytes: u64,
    /// Slot of the boot-time RAM cap this region was carved from
    root_cnode: CNodeRef,
    root_slot: u32,
    root_base: u64,
    free: bool,
}

/// RAM capability allocator.
pub struct Mm {
    regions: ArrayVec<Region, MAX_REGIONS>,
}

impl Default for Mm {
    fn default() -> Self {
        Self::new()
    }
}

impl Mm {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: ArrayVec::new(),
        }
    }

    /// Hand a RAM capability over to the manager.
    ///
    /// The capability is identified with the kernel and becomes the retype
    /// source for allocations inside its range.
    pub fn add(&mut self, kernel: &dyn KernelInterface, cap: CapRef) -> core::result::Result<(), MmError> {
        let identity = kernel.cap_identify(&cap).map_err(MmError::Identify)?;
        if identity.ctype != CapType::Ram {
            return Err(MmError::Identify(
                crate::errors::KernelCallError::TypeMismatch,
            ));
        }
        let region = Region {
            base: identity.base,
            bytes: identity.bytes,
            root_cnode: cap.cnode,
            root_slot: cap.slot,
            root_base: identity.base,
            free: true,
        };
        let pos = self
            .regions
            .iter()
            .position(|r| r.base > region.base)
            .unwrap_or(self.regions.len());
        if self.regions.try_insert(pos, region).is_err() {
            return Err(MmError::PoolExhausted);
        }
        debug!(
            "[Mm] added RAM {:#x}/{:#x}",
            identity.base, identity.bytes
        );
        Ok(())
    }

    /// Total bytes currently free.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.regions.iter().filter(|r| r.free).map(|r| r.bytes).sum()
    }

    /// Allocate `size` bytes aligned to `align`, retyping a fresh RAM cap
    /// into the caller-provided empty slot `dest`.
    pub fn alloc_into(
        &mut self,
        kernel: &dyn KernelInterface,
        dest: CapRef,
        size: usize,
        align: usize,
    ) -> core::result::Result<CapRef, MmError> {
        let size = (size.max(1) as u64).next_multiple_of(BASE_PAGE_SIZE as u64);
        let align = align.max(BASE_PAGE_SIZE) as u64;

        let idx = self
            .regions
            .iter()
            .position(|r| {
                r.free && {
                    let aligned = r.base.next_multiple_of(align);
                    aligned + size <= r.base + r.bytes
                }
            })
            .ok_or(MmError::NoMemory)?;

        // Splitting can add up to two new nodes.
        if self.regions.remaining_capacity() < 2 {
            return Err(MmError::PoolExhausted);
        }

        let region = self.regions[idx];
        let aligned = region.base.next_multiple_of(align);
        let offset = (aligned - region.root_base) as usize;

        let root_cap = CapRef::at(region.root_cnode, region.root_slot);
        kernel
            .cap_retype(&dest, &root_cap, offset, CapType::Ram, size as usize, 1)
            .map_err(MmError::Retype)?;

        // Bookkeeping: carve [aligned, aligned + size) out of the region.
        let pre = aligned - region.base;
        let post = (region.base + region.bytes) - (aligned + size);
        self.regions[idx] = Region {
            base: aligned,
            bytes: size,
            free: false,
            ..region
        };
        if post > 0 {
            let node = Region {
                base: aligned + size,
                bytes: post,
                free: true,
                ..region
            };
            // Capacity checked above.
            let _ = self.regions.try_insert(idx + 1, node);
        }
        if pre > 0 {
            let node = Region {
                base: region.base,
                bytes: pre,
                free: true,
                ..region
            };
            let _ = self.regions.try_insert(idx, node);
        }
        Ok(dest)
    }

    /// Return an allocation to the manager and delete its capability.
    pub fn free(
        &mut self,
        kernel: &dyn KernelInterface,
        cap: CapRef,
    ) -> core::result::Result<(), MmError> {
        let identity = kernel.cap_identify(&cap).map_err(MmError::Identify)?;
        let idx = self
            .regions
            .iter()
            .position(|r| !r.free && r.base == identity.base && r.bytes == identity.bytes)
            .ok_or(MmError::UnknownRegion)?;
        kernel.cap_destroy(cap).map_err(MmError::Destroy)?;
        self.regions[idx].free = true;
        self.coalesce(idx);
        Ok(())
    }

    fn coalesce(&mut self, idx: usize) {
        // Merge with the successor first so `idx` stays valid.
        if idx + 1 < self.regions.len() {
            let (a, b) = (self.regions[idx], self.regions[idx + 1]);
            if a.free && b.free && a.root_base == b.root_base && a.base + a.bytes == b.base {
                self.regions[idx].bytes += b.bytes;
                self.regions.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (a, b) = (self.regions[idx - 1], self.regions[idx]);
            if a.free && b.free && a.root_base == b.root_base && a.base + a.bytes == b.base {
                self.regions[idx - 1].bytes += b.bytes;
                self.regions.remove(idx);
            }
        }
    }
}

/// The slot allocator and RAM manager of one dispatcher, bundled so the
/// composite allocation paths can split the borrow.
pub struct CoreResources {
    pub slots: SlotPrealloc,
    pub mm: Mm,
}

impl CoreResources {
    /// Bundle a slot allocator and a RAM manager.
    #[must_use]
    pub fn new(slots: SlotPrealloc, mm: Mm) -> Self {
        Self { slots, mm }
    }

    /// Allocate one fresh capability slot.
    pub fn alloc_slot(&mut self, kernel: &dyn KernelInterface) -> Result<CapRef> {
        Ok(self.slots.alloc(kernel, &mut self.mm, 1)?)
    }

    /// Allocate `n` contiguous capability slots.
    pub fn alloc_slots(&mut self, kernel: &dyn KernelInterface, n: usize) -> Result<CapRef> {
        Ok(self.slots.alloc(kernel, &mut self.mm, n)?)
    }

    /// Allocate an aligned RAM capability.
    pub fn ram_alloc_aligned(
        &mut self,
        kernel: &dyn KernelInterface,
        size: usize,
        align: usize,
    ) -> Result<CapRef> {
        let dest = self.slots.alloc(kernel, &mut self.mm, 1)?;
        Ok(self.mm.alloc_into(kernel, dest, size, align)?)
    }

    /// Allocate a page-aligned RAM capability.
    pub fn ram_alloc(&mut self, kernel: &dyn KernelInterface, size: usize) -> Result<CapRef> {
        self.ram_alloc_aligned(kernel, size, BASE_PAGE_SIZE)
    }

    /// Allocate a mappable frame of at least `bytes` (page rounded).
    pub fn frame_alloc(&mut self, kernel: &dyn KernelInterface, bytes: usize) -> Result<CapRef> {
        let rounded = bytes.max(1).next_multiple_of(BASE_PAGE_SIZE);
        let ram = self.ram_alloc_aligned(kernel, rounded, BASE_PAGE_SIZE)?;
        let dest = self.slots.alloc(kernel, &mut self.mm, 1)?;
        kernel
            .cap_retype(&dest, &ram, 0, CapType::Frame, rounded, 1)
            .map_err(RuntimeError::Kernel)?;
        if let Err(e) = kernel.cap_destroy(ram) {
            warn!("[Mm] destroying intermediate RAM cap failed: {e}");
        }
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::MockKernel;
    use crate::constants::{L2_CNODE_SLOTS, OBJSIZE_L2CNODE};

    fn fresh(kernel: &MockKernel) -> CoreResources {
        let bucket = kernel.install_l2_cnode();
        let slots = SlotPrealloc::new(bucket, L2_CNODE_SLOTS).unwrap();
        CoreResources::new(slots, Mm::new())
    }

    #[test]
    fn test_add_and_alloc() {
        let kernel = MockKernel::new(0, 64);
        let mut res = fresh(&kernel);
        let ram = kernel.install_ram(1024 * 1024);
        res.mm.add(&kernel, ram).unwrap();
        assert_eq!(res.mm.free_bytes(), 1024 * 1024);

        let cap = res.ram_alloc(&kernel, 8192).unwrap();
        let id = kernel.cap_identify(&cap).unwrap();
        assert_eq!(id.ctype, CapType::Ram);
        assert_eq!(id.bytes, 8192);
        assert_eq!(res.mm.free_bytes(), 1024 * 1024 - 8192);
    }

    #[test]
    fn test_alloc_respects_alignment() {
        let kernel = MockKernel::new(0, 64);
        let mut res = fresh(&kernel);
        let ram = kernel.install_ram(4 * 1024 * 1024);
        res.mm.add(&kernel, ram).unwrap();

        // Burn one page so the next region base is unaligned for 64 KiB.
        let _small = res.ram_alloc(&kernel, BASE_PAGE_SIZE).unwrap();
        let big = res.ram_alloc_aligned(&kernel, 65536, 65536).unwrap();
        let id = kernel.cap_identify(&big).unwrap();
        assert_eq!(id.base % 65536, 0);
    }

    #[test]
    fn test_no_memory_when_depleted() {
        let kernel = MockKernel::new(0, 64);
        let mut res = fresh(&kernel);
        let ram = kernel.install_ram(OBJSIZE_L2CNODE as u64 * 4);
        res.mm.add(&kernel, ram).unwrap();

        let err = res.ram_alloc(&kernel, 1024 * 1024).unwrap_err();
        assert!(matches!(err, RuntimeError::Mm(MmError::NoMemory)));
    }

    #[test]
    fn test_free_and_coalesce() {
        let kernel = MockKernel::new(0, 64);
        let mut res = fresh(&kernel);
        let ram = kernel.install_ram(256 * 1024);
        res.mm.add(&kernel, ram).unwrap();

        let a = res.ram_alloc(&kernel, 64 * 1024).unwrap();
        let b = res.ram_alloc(&kernel, 64 * 1024).unwrap();
        assert_eq!(res.mm.free_bytes(), 128 * 1024);

        res.mm.free(&kernel, a).unwrap();
        res.mm.free(&kernel, b).unwrap();
        assert_eq!(res.mm.free_bytes(), 256 * 1024);

        // After coalescing the full region must be allocatable again.
        let whole = res.ram_alloc(&kernel, 256 * 1024).unwrap();
        let id = kernel.cap_identify(&whole).unwrap();
        assert_eq!(id.bytes, 256 * 1024);
    }

    #[test]
    fn test_frame_alloc_rounds_and_types() {
        let kernel = MockKernel::new(0, 64);
        let mut res = fresh(&kernel);
        let ram = kernel.install_ram(1024 * 1024);
        res.mm.add(&kernel, ram).unwrap();

        let frame = res.frame_alloc(&kernel, 5000).unwrap();
        let id = kernel.cap_identify(&frame).unwrap();
        assert_eq!(id.ctype, CapType::Frame);
        assert_eq!(id.bytes, 8192);
    }
}
