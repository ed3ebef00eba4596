// src/capability/mock.rs
//! Mock kernel for hosted tests.
//!
//! Implements [`KernelInterface`] over an in-memory object table. Frames are
//! backed by page-aligned heap allocations so the spawner and the ring
//! transport can be exercised for real; capability slots are tracked per
//! cnode so double-use and type confusion surface as errors, the same way
//! the kernel would refuse the invocation.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use spin::Mutex;

use super::{
    CNodeLevel, CNodeRef, CapIdentity, CapRef, CapType, CoreId, KernelInterface, MapFlags,
    VnodeLevel,
};
use crate::constants::{L2_CNODE_SLOTS, OBJSIZE_L2CNODE};
use crate::errors::KernelCallError;
use crate::mm::CoreResources;
use crate::paging::VspaceMapper;

/// Page-aligned heap allocation backing a mock frame.
pub struct AlignedMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedMem {
    fn zeroed(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), 4096).expect("bad layout");
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("mock frame allocation failed");
        Self { ptr, layout }
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for AlignedMem {
    fn drop(&mut self) {
        // SAFETY: allocated with the stored layout in `zeroed`
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is plain memory; synchronization is the test's job.
unsafe impl Send for AlignedMem {}
unsafe impl Sync for AlignedMem {}

struct MockObject {
    ctype: CapType,
    base: u64,
    bytes: u64,
    mem: Option<AlignedMem>,
    /// Assigned cnode address for cnode-typed objects
    cnode_addr: Option<u32>,
}

/// One recorded `invoke_dispatcher` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRecord {
    pub disp: u64,
    pub rootcn: u64,
    pub vroot: u64,
    pub dispframe: u64,
    pub run: bool,
}

struct MockState {
    next_obj: u64,
    next_cnode_addr: u32,
    next_phys: u64,
    /// (cnode address, slot) -> object id
    slots: BTreeMap<(u32, u32), u64>,
    objects: BTreeMap<u64, MockObject>,
    /// vnode object id -> occupied entry slots
    vnode_entries: BTreeMap<u64, BTreeMap<u32, u64>>,
    root_next_slot: u32,
    root_free: u32,
    launches: Vec<LaunchRecord>,
    stopped: Vec<u64>,
    own_disp_cnode: CNodeRef,
}

/// In-memory kernel double.
pub struct MockKernel {
    core: CoreId,
    state: Mutex<MockState>,
}

/// The root cnode of the mock cspace.
pub const ROOT_CNODE: CNodeRef = CNodeRef {
    croot: 1,
    address: 1,
    level: CNodeLevel::L1,
};

impl MockKernel {
    /// Create a mock kernel for `core` with `root_slots` free root slots.
    pub fn new(core: CoreId, root_slots: u32) -> Self {
        let mut state = MockState {
            next_obj: 1,
            next_cnode_addr: 2,
            next_phys: 0x8000_0000,
            slots: BTreeMap::new(),
            objects: BTreeMap::new(),
            vnode_entries: BTreeMap::new(),
            root_next_slot: 0,
            root_free: root_slots,
            launches: Vec::new(),
            stopped: Vec::new(),
            own_disp_cnode: CNodeRef::NULL,
        };
        // The dispatcher's own control block lives in a well-known cnode.
        let addr = state.next_cnode_addr;
        state.next_cnode_addr += 1;
        let cnode = CNodeRef {
            croot: ROOT_CNODE.address,
            address: addr,
            level: CNodeLevel::Other,
        };
        state.own_disp_cnode = cnode;
        let id = state.next_obj;
        state.next_obj += 1;
        state.objects.insert(
            id,
            MockObject {
                ctype: CapType::Dispatcher,
                base: 0,
                bytes: 0,
                mem: None,
                cnode_addr: None,
            },
        );
        state.slots.insert((addr, 0), id);
        Self {
            core,
            state: Mutex::new(state),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock())
    }

    // ------------------------------------------------------------------
    // Test setup helpers (not part of the kernel surface)
    // ------------------------------------------------------------------

    /// Create an empty L2 cnode, e.g. the initial slot-allocator bucket.
    pub fn install_l2_cnode(&self) -> CNodeRef {
        self.with_state(|st| {
            let addr = st.next_cnode_addr;
            st.next_cnode_addr += 1;
            st.alloc_object(MockObject {
                ctype: CapType::L2CNode,
                base: 0,
                bytes: OBJSIZE_L2CNODE as u64,
                mem: None,
                cnode_addr: Some(addr),
            });
            CNodeRef {
                croot: ROOT_CNODE.address,
                address: addr,
                level: CNodeLevel::Other,
            }
        })
    }

    /// Create a RAM object of `bytes` and return a capability to it.
    pub fn install_ram(&self, bytes: u64) -> CapRef {
        self.with_state(|st| {
            let base = st.take_phys(bytes);
            let id = st.alloc_object(MockObject {
                ctype: CapType::Ram,
                base,
                bytes,
                mem: None,
                cnode_addr: None,
            });
            st.place_in_fresh_cnode(id)
        })
    }

    /// Create a frame holding a copy of `data` (e.g. a boot module image).
    pub fn install_module_frame(&self, data: &[u8]) -> CapRef {
        self.with_state(|st| {
            let size = data.len().max(1).next_multiple_of(4096);
            let mem = AlignedMem::zeroed(size);
            // SAFETY: freshly allocated region of at least data.len() bytes
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), mem.as_ptr(), data.len());
            }
            let base = st.take_phys(size as u64);
            let id = st.alloc_object(MockObject {
                ctype: CapType::Frame,
                base,
                bytes: size as u64,
                mem: Some(mem),
                cnode_addr: None,
            });
            st.place_in_fresh_cnode(id)
        })
    }

    /// Pointer to the memory backing a mock frame.
    pub fn frame_ptr(&self, cap: &CapRef) -> Option<NonNull<u8>> {
        self.with_state(|st| {
            let id = st.resolve(cap).ok()?;
            let obj = st.objects.get(&id)?;
            obj.mem.as_ref().and_then(|m| NonNull::new(m.as_ptr()))
        })
    }

    /// The object id behind a capability (for distinctness assertions).
    pub fn object_id(&self, cap: &CapRef) -> Option<u64> {
        self.with_state(|st| st.resolve(cap).ok())
    }

    /// Number of live objects of the given type.
    pub fn count_objects(&self, ctype: CapType) -> usize {
        self.with_state(|st| st.objects.values().filter(|o| o.ctype == ctype).count())
    }

    /// Number of live L2 cnode objects (for refill accounting in tests).
    pub fn l2_cnode_count(&self) -> usize {
        self.count_objects(CapType::L2CNode)
    }

    /// All recorded dispatcher launches.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.with_state(|st| st.launches.clone())
    }

    /// Object ids of stopped dispatchers.
    pub fn stopped(&self) -> Vec<u64> {
        self.with_state(|st| st.stopped.clone())
    }
}

impl MockState {
    fn alloc_object(&mut self, obj: MockObject) -> u64 {
        let id = self.next_obj;
        self.next_obj += 1;
        self.objects.insert(id, obj);
        id
    }

    fn take_phys(&mut self, bytes: u64) -> u64 {
        let base = self.next_phys;
        self.next_phys += bytes.next_multiple_of(4096);
        base
    }

    fn place_in_fresh_cnode(&mut self, id: u64) -> CapRef {
        let addr = self.next_cnode_addr;
        self.next_cnode_addr += 1;
        let cnode = CNodeRef {
            croot: ROOT_CNODE.address,
            address: addr,
            level: CNodeLevel::Other,
        };
        self.slots.insert((addr, 0), id);
        CapRef::at(cnode, 0)
    }

    fn resolve(&self, cap: &CapRef) -> Result<u64, KernelCallError> {
        self.slots
            .get(&(cap.cnode.address, cap.slot))
            .copied()
            .ok_or(KernelCallError::InvalidCapability)
    }

    fn expect_empty(&self, cap: &CapRef) -> Result<(), KernelCallError> {
        if self.slots.contains_key(&(cap.cnode.address, cap.slot)) {
            Err(KernelCallError::SlotInUse)
        } else {
            Ok(())
        }
    }

    fn object_type(&self, id: u64) -> CapType {
        self.objects.get(&id).map_or(CapType::Null, |o| o.ctype)
    }

    fn is_vnode(&self, id: u64) -> bool {
        matches!(
            self.object_type(id),
            CapType::VnodeL0 | CapType::VnodeL1 | CapType::VnodeL2 | CapType::VnodeL3
        )
    }
}

impl KernelInterface for MockKernel {
    fn slot_alloc_root(&self) -> Result<CapRef, KernelCallError> {
        self.with_state(|st| {
            if st.root_free == 0 {
                return Err(KernelCallError::NoSpace);
            }
            let slot = st.root_next_slot;
            st.root_next_slot += 1;
            st.root_free -= 1;
            Ok(CapRef::at(ROOT_CNODE, slot))
        })
    }

    fn root_slot_refill(&self, ram: CapRef) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let id = st.resolve(&ram)?;
            if st.object_type(id) != CapType::Ram {
                return Err(KernelCallError::TypeMismatch);
            }
            st.slots.remove(&(ram.cnode.address, ram.slot));
            st.root_free += L2_CNODE_SLOTS as u32;
            Ok(())
        })
    }

    fn vnode_create(&self, dest: &CapRef, level: VnodeLevel) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            st.expect_empty(dest)?;
            let id = st.alloc_object(MockObject {
                ctype: level.cap_type(),
                base: 0,
                bytes: 4096,
                mem: None,
                cnode_addr: None,
            });
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(())
        })
    }

    fn vnode_map(
        &self,
        parent: &CapRef,
        child: &CapRef,
        slot: u32,
        _flags: MapFlags,
        _offset: usize,
        pte_count: usize,
        mapping: &CapRef,
    ) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let parent_id = st.resolve(parent)?;
            if !st.is_vnode(parent_id) {
                return Err(KernelCallError::TypeMismatch);
            }
            let child_id = st.resolve(child)?;
            if pte_count == 0 || slot as usize + pte_count > 512 {
                return Err(KernelCallError::InvalidMapping);
            }
            st.expect_empty(mapping)?;
            {
                let entries = st.vnode_entries.entry(parent_id).or_default();
                for i in 0..pte_count as u32 {
                    if entries.contains_key(&(slot + i)) {
                        return Err(KernelCallError::InvalidMapping);
                    }
                }
                for i in 0..pte_count as u32 {
                    entries.insert(slot + i, child_id);
                }
            }
            let map_id = st.alloc_object(MockObject {
                ctype: CapType::Mapping,
                base: 0,
                bytes: 0,
                mem: None,
                cnode_addr: None,
            });
            st.slots.insert((mapping.cnode.address, mapping.slot), map_id);
            Ok(())
        })
    }

    fn cap_copy(&self, dest: &CapRef, src: &CapRef) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let id = st.resolve(src)?;
            st.expect_empty(dest)?;
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(())
        })
    }

    fn cap_retype(
        &self,
        dest: &CapRef,
        src: &CapRef,
        offset: usize,
        new_type: CapType,
        objsize: usize,
        count: usize,
    ) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let src_id = st.resolve(src)?;
            let (src_base, src_bytes) = {
                let obj = st.objects.get(&src_id).ok_or(KernelCallError::InvalidCapability)?;
                if obj.ctype != CapType::Ram {
                    return Err(KernelCallError::TypeMismatch);
                }
                (obj.base, obj.bytes)
            };
            if count == 0 || objsize == 0 {
                return Err(KernelCallError::InvalidRetype);
            }
            if (offset + objsize * count) as u64 > src_bytes {
                return Err(KernelCallError::InvalidRetype);
            }
            for i in 0..count as u32 {
                let slot = CapRef::at(dest.cnode, dest.slot + i);
                st.expect_empty(&slot)?;
            }
            for i in 0..count {
                let mem = match new_type {
                    CapType::Frame | CapType::DevFrame => Some(AlignedMem::zeroed(objsize)),
                    _ => None,
                };
                let cnode_addr = if new_type == CapType::L2CNode {
                    let addr = st.next_cnode_addr;
                    st.next_cnode_addr += 1;
                    Some(addr)
                } else {
                    None
                };
                let id = st.alloc_object(MockObject {
                    ctype: new_type,
                    base: src_base + offset as u64 + (i * objsize) as u64,
                    bytes: objsize as u64,
                    mem,
                    cnode_addr,
                });
                st.slots.insert((dest.cnode.address, dest.slot + i as u32), id);
            }
            Ok(())
        })
    }

    fn cap_identify(&self, cap: &CapRef) -> Result<CapIdentity, KernelCallError> {
        self.with_state(|st| {
            let id = st.resolve(cap)?;
            let obj = st.objects.get(&id).ok_or(KernelCallError::InvalidCapability)?;
            Ok(CapIdentity {
                ctype: obj.ctype,
                base: obj.base,
                bytes: obj.bytes,
                owner: self.core,
            })
        })
    }

    fn cap_destroy(&self, cap: CapRef) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            st.resolve(&cap)?;
            st.slots.remove(&(cap.cnode.address, cap.slot));
            Ok(())
        })
    }

    fn cnode_create_l1(&self, dest: &CapRef) -> Result<CNodeRef, KernelCallError> {
        self.with_state(|st| {
            st.expect_empty(dest)?;
            let addr = st.next_cnode_addr;
            st.next_cnode_addr += 1;
            let id = st.alloc_object(MockObject {
                ctype: CapType::L1CNode,
                base: 0,
                bytes: 0,
                mem: None,
                cnode_addr: Some(addr),
            });
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(CNodeRef {
                croot: addr,
                address: addr,
                level: CNodeLevel::L1,
            })
        })
    }

    fn cnode_create_foreign_l2(
        &self,
        parent_l1: &CapRef,
        slot: u32,
    ) -> Result<CNodeRef, KernelCallError> {
        self.with_state(|st| {
            let parent_id = st.resolve(parent_l1)?;
            let parent_addr = {
                let obj = st
                    .objects
                    .get(&parent_id)
                    .ok_or(KernelCallError::InvalidCapability)?;
                if obj.ctype != CapType::L1CNode {
                    return Err(KernelCallError::TypeMismatch);
                }
                obj.cnode_addr.ok_or(KernelCallError::InvalidCapability)?
            };
            if st.slots.contains_key(&(parent_addr, slot)) {
                return Err(KernelCallError::SlotInUse);
            }
            let addr = st.next_cnode_addr;
            st.next_cnode_addr += 1;
            let id = st.alloc_object(MockObject {
                ctype: CapType::L2CNode,
                base: 0,
                bytes: OBJSIZE_L2CNODE as u64,
                mem: None,
                cnode_addr: Some(addr),
            });
            st.slots.insert((parent_addr, slot), id);
            Ok(CNodeRef {
                croot: parent_addr,
                address: addr,
                level: CNodeLevel::Other,
            })
        })
    }

    fn cnode_from_cap(&self, cnode_cap: &CapRef) -> Result<CNodeRef, KernelCallError> {
        self.with_state(|st| {
            let id = st.resolve(cnode_cap)?;
            let obj = st.objects.get(&id).ok_or(KernelCallError::InvalidCapability)?;
            if obj.ctype != CapType::L2CNode {
                return Err(KernelCallError::TypeMismatch);
            }
            Ok(CNodeRef {
                croot: cnode_cap.cnode.croot,
                address: obj.cnode_addr.ok_or(KernelCallError::InvalidCapability)?,
                level: CNodeLevel::Other,
            })
        })
    }

    fn dispatcher_create(&self, dest: &CapRef) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            st.expect_empty(dest)?;
            let id = st.alloc_object(MockObject {
                ctype: CapType::Dispatcher,
                base: 0,
                bytes: 0,
                mem: None,
                cnode_addr: None,
            });
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(())
        })
    }

    fn invoke_dispatcher(
        &self,
        disp: &CapRef,
        domain_disp: &CapRef,
        rootcn: &CapRef,
        vroot: &CapRef,
        dispframe: &CapRef,
        run: bool,
    ) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let disp_id = st.resolve(disp)?;
            let domain_id = st.resolve(domain_disp)?;
            let rootcn_id = st.resolve(rootcn)?;
            let vroot_id = st.resolve(vroot)?;
            let frame_id = st.resolve(dispframe)?;
            if st.object_type(disp_id) != CapType::Dispatcher
                || st.object_type(domain_id) != CapType::Dispatcher
            {
                return Err(KernelCallError::TypeMismatch);
            }
            if st.object_type(rootcn_id) != CapType::L1CNode {
                return Err(KernelCallError::TypeMismatch);
            }
            if st.object_type(vroot_id) != CapType::VnodeL0 {
                return Err(KernelCallError::TypeMismatch);
            }
            if st.object_type(frame_id) != CapType::Frame {
                return Err(KernelCallError::TypeMismatch);
            }
            st.launches.push(LaunchRecord {
                disp: disp_id,
                rootcn: rootcn_id,
                vroot: vroot_id,
                dispframe: frame_id,
                run,
            });
            Ok(())
        })
    }

    fn invoke_dispatcher_stop(&self, disp: &CapRef) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            let id = st.resolve(disp)?;
            if st.object_type(id) != CapType::Dispatcher {
                return Err(KernelCallError::TypeMismatch);
            }
            st.stopped.push(id);
            Ok(())
        })
    }

    fn endpoint_create(&self, dest: &CapRef, _buflen: usize) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            st.expect_empty(dest)?;
            let id = st.alloc_object(MockObject {
                ctype: CapType::Endpoint,
                base: 0,
                bytes: 0,
                mem: None,
                cnode_addr: None,
            });
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(())
        })
    }

    fn ram_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        _owner: CoreId,
    ) -> Result<(), KernelCallError> {
        self.forge(dest, CapType::Ram, base, bytes)
    }

    fn frame_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        _owner: CoreId,
    ) -> Result<(), KernelCallError> {
        self.forge(dest, CapType::Frame, base, bytes)
    }

    fn devframe_forge(
        &self,
        dest: &CapRef,
        base: u64,
        bytes: u64,
        _owner: CoreId,
    ) -> Result<(), KernelCallError> {
        self.forge(dest, CapType::DevFrame, base, bytes)
    }

    fn core_id(&self) -> CoreId {
        self.core
    }

    fn own_dispatcher(&self) -> CapRef {
        self.with_state(|st| CapRef::at(st.own_disp_cnode, 0))
    }
}

impl MockKernel {
    fn forge(
        &self,
        dest: &CapRef,
        ctype: CapType,
        base: u64,
        bytes: u64,
    ) -> Result<(), KernelCallError> {
        self.with_state(|st| {
            st.expect_empty(dest)?;
            let mem = match ctype {
                CapType::Frame | CapType::DevFrame => Some(AlignedMem::zeroed(bytes as usize)),
                _ => None,
            };
            let id = st.alloc_object(MockObject {
                ctype,
                base,
                bytes,
                mem,
                cnode_addr: None,
            });
            st.slots.insert((dest.cnode.address, dest.slot), id);
            Ok(())
        })
    }
}

/// [`VspaceMapper`] backed by the mock kernel's frame memory.
pub struct MockVspace<'k> {
    kernel: &'k MockKernel,
}

impl<'k> MockVspace<'k> {
    pub fn new(kernel: &'k MockKernel) -> Self {
        Self { kernel }
    }
}

impl VspaceMapper for MockVspace<'_> {
    fn map_frame(
        &mut self,
        _kernel: &dyn KernelInterface,
        _res: &mut CoreResources,
        frame: &CapRef,
        _bytes: usize,
        _flags: MapFlags,
    ) -> Result<NonNull<u8>, crate::errors::PagingError> {
        self.kernel
            .frame_ptr(frame)
            .ok_or(crate::errors::PagingError::VnodeMap(
                KernelCallError::InvalidCapability,
            ))
    }
}
