// src/spawn/mod.rs
//! Process spawner.
//!
//! Builds a child domain from an ELF boot module: capability space, virtual
//! address space, loaded segments, dispatcher control block, init endpoint,
//! and argument page, then hands the dispatcher to the kernel. Each step is
//! a separate function wrapping its failures in a step-specific error kind;
//! a failed construction is abandoned without teardown.

pub mod elf;

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::ptr::NonNull;

use log::debug;

use crate::capability::{CNodeRef, CapRef, CapType, KernelInterface, MapFlags, VnodeLevel};
use crate::constants::{
    rootcn_slot, taskcn_slot, BASE_PAGE_SIZE, CHILD_ARGFRAME_VADDR, CHILD_DISPFRAME_VADDR,
    DISPATCHER_FRAME_SIZE, DISP_NAME_LEN, L2_CNODE_SLOTS, MAX_CMDLINE_ARGS, MAX_ENVIRON_VARS,
};
use crate::errors::{ElfError, MmError, ProcError, Result, RuntimeError, SpawnError};
use crate::mm::CoreResources;
use crate::paging::{PagingState, VspaceMapper};
use crate::process::{Pid, ProcTable};

/// Receive buffer length of the init endpoint.
const PROC_ENDPOINT_BUF_LEN: usize = 32;

/// Position-independent-code base register (x10) in the save area.
const PIC_REGISTER: usize = 10;

/// Saved register area of a dispatcher (x0..x30, sp, pc).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterState {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
}

impl RegisterState {
    const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
        }
    }
}

/// In-memory layout of the dispatcher control frame shared with the kernel.
#[repr(C)]
pub struct DispatcherFrame {
    /// Non-zero while the dispatcher runs disabled
    pub disabled: u32,
    /// Core the dispatcher is bound to
    pub core_id: u32,
    /// PID of the domain
    pub domain_id: u32,
    _reserved: u32,
    /// Address of this frame in the domain's own vspace
    pub udisp: u64,
    /// Base of the `.got` section
    pub got_base: u64,
    pub eh_frame: u64,
    pub eh_frame_size: u64,
    pub eh_frame_hdr: u64,
    pub eh_frame_hdr_size: u64,
    /// Name, NUL terminated
    pub name: [u8; DISP_NAME_LEN],
    /// Registers restored when resuming enabled
    pub enabled_area: RegisterState,
    /// Registers restored when resuming disabled
    pub disabled_area: RegisterState,
}

const _: () = assert!(core::mem::size_of::<DispatcherFrame>() <= DISPATCHER_FRAME_SIZE);

/// Start-of-argument-page record handed to a starting domain.
#[repr(C)]
pub struct SpawnDomainParams {
    pub argc: u64,
    /// Child-side argv pointers, NULL terminated
    pub argv: [u64; MAX_CMDLINE_ARGS + 1],
    /// Child-side envp pointers, NULL terminated
    pub envp: [u64; MAX_ENVIRON_VARS + 1],
    /// Opaque terminal state pointer inherited from the spawner
    pub terminal_state: u64,
}

const _: () = assert!(core::mem::size_of::<SpawnDomainParams>() < BASE_PAGE_SIZE);

/// One bootable module image.
pub struct BootModule {
    /// Module name (path-like)
    pub name: String,
    /// Cnode holding the module frame
    pub cnode: CNodeRef,
    /// Slot of the module frame
    pub slot: u32,
    /// Image size in bytes
    pub bytes: usize,
    /// Command line recorded for the module
    pub opts: String,
}

impl BootModule {
    /// Capability to the module frame.
    #[must_use]
    pub fn frame(&self) -> CapRef {
        CapRef::at(self.cnode, self.slot)
    }
}

/// Boot-time module list.
pub struct BootInfo {
    pub modules: Vec<BootModule>,
}

impl BootInfo {
    /// Find a module by the last path component of its name.
    #[must_use]
    pub fn find_module(&self, name: &str) -> Option<&BootModule> {
        let wanted = name.rsplit('/').next().unwrap_or(name);
        self.modules
            .iter()
            .find(|m| m.name.rsplit('/').next().unwrap_or(&m.name) == wanted)
    }
}

/// Per-child construction record, filled step by step.
pub struct SpawnInfo {
    pub pid: Option<Pid>,
    pub binary_name: String,
    /// The child's L1 cnode capability, held in the parent
    pub rootcn: Option<CapRef>,
    pub taskcn: Option<CNodeRef>,
    pub pagecn: Option<CNodeRef>,
    pub base_page_cn: Option<CNodeRef>,
    /// Copy of the child's dispatcher capability, held in the parent
    pub dispatcher_cap_in_parent: Option<CapRef>,
    /// The child's paging state, driven from the parent
    pub child_paging: Option<PagingState>,
    /// ELF entry point
    pub pc: u64,
    /// `.got` base address in the child's vspace
    pub got_addr: u64,
    /// Parent-side pointer to the dispatcher frame
    pub disp_frame_ptr: Option<NonNull<u8>>,
    /// Parent-side pointer to the argument page
    pub arg_page_ptr: Option<NonNull<u8>>,
    pub cap_to_transfer: CapRef,
    pub terminal_state: u64,
}

impl Default for SpawnInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl SpawnInfo {
    /// An empty record.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pid: None,
            binary_name: String::new(),
            rootcn: None,
            taskcn: None,
            pagecn: None,
            base_page_cn: None,
            dispatcher_cap_in_parent: None,
            child_paging: None,
            pc: 0,
            got_addr: 0,
            disp_frame_ptr: None,
            arg_page_ptr: None,
            cap_to_transfer: CapRef::NULL,
            terminal_state: 0,
        }
    }

    fn taskcn(&self) -> CNodeRef {
        self.taskcn.expect("cspace not set up")
    }
}

/// The spawner: borrows the runtime pieces a spawn drives.
///
/// `'k` is the lifetime of the injected kernel surface and vspace mapper;
/// `'a` the (usually shorter) borrow of the runtime state.
pub struct Spawner<'a, 'k> {
    pub kernel: &'a (dyn KernelInterface + 'k),
    pub res: &'a mut CoreResources,
    pub vspace: &'a mut (dyn VspaceMapper + 'k),
    pub bootinfo: &'a BootInfo,
    pub procs: &'a mut ProcTable,
    pub environ: &'a [String],
}

impl Spawner<'_, '_> {
    /// Spawn a new dispatcher running `argv[0]` with the given arguments.
    ///
    /// `transfer_cap` (if non-null) is installed in the child's first free
    /// task slot; `terminal_state` is passed through the argument page.
    pub fn spawn_load_argv(
        &mut self,
        argv: &[&str],
        transfer_cap: CapRef,
        terminal_state: u64,
        si: &mut SpawnInfo,
    ) -> Result<Pid> {
        let name = *argv.first().ok_or(RuntimeError::Spawn(SpawnError::FindModule))?;

        // Resolve the module up front; copy what we need out of bootinfo.
        let module = self
            .bootinfo
            .find_module(name)
            .ok_or(RuntimeError::Spawn(SpawnError::FindModule))?;
        let module_frame = module.frame();
        let module_bytes = module.bytes;

        si.cap_to_transfer = transfer_cap;
        si.terminal_state = terminal_state;
        si.binary_name = name.to_string();

        // Process node; the channel starts as an unbound LMP channel.
        let node = self
            .procs
            .alloc()
            .map_err(|e: ProcError| RuntimeError::Spawn(SpawnError::ProcAlloc(e)))?;
        let mut truncated = name.to_string();
        truncated.truncate(DISP_NAME_LEN - 1);
        node.name = truncated;
        let pid = node.pid();
        si.pid = Some(pid);

        debug!("[Spawn] building \"{name}\" as pid {pid}");

        self.setup_cspace(si)?;
        self.setup_vspace(si)?;
        self.setup_elf(si, &module_frame, module_bytes)?;
        self.setup_dispatcher(si)?;
        self.setup_endpoint(si)?;
        self.setup_arguments(si, argv)?;
        self.start_dispatcher(si)?;

        debug!("[Spawn] pid {pid} running");
        Ok(pid)
    }

    /// Spawn from a flat command line (whitespace separated).
    pub fn spawn_load_cmdline(
        &mut self,
        cmdline: &str,
        transfer_cap: CapRef,
        terminal_state: u64,
        si: &mut SpawnInfo,
    ) -> Result<Pid> {
        let argv: Vec<&str> = cmdline.split_whitespace().collect();
        if argv.is_empty() {
            return Err(RuntimeError::Spawn(SpawnError::GetCmdlineArgs));
        }
        self.spawn_load_argv(&argv, transfer_cap, terminal_state, si)
    }

    /// Spawn a module by name, using its recorded command line.
    pub fn spawn_load_by_name(
        &mut self,
        name: &str,
        transfer_cap: CapRef,
        si: &mut SpawnInfo,
    ) -> Result<Pid> {
        let opts = {
            let module = self
                .bootinfo
                .find_module(name)
                .ok_or(RuntimeError::Spawn(SpawnError::FindModule))?;
            if module.opts.is_empty() {
                module.name.clone()
            } else {
                module.opts.clone()
            }
        };
        self.spawn_load_cmdline(&opts, transfer_cap, 0, si)
    }

    /// Stop a running child and release its process node.
    pub fn kill(&mut self, pid: Pid) -> Result<()> {
        let node = self.procs.get(pid)?;
        let dispatcher = node
            .dispatcher
            .as_ref()
            .ok_or(RuntimeError::Proc(ProcError::PidNotFound))?
            .alias();
        self.kernel
            .invoke_dispatcher_stop(&dispatcher)
            .map_err(|e| RuntimeError::Proc(ProcError::Kill(e)))?;
        self.procs.delete(pid)?;
        Ok(())
    }

    fn alloc_slot(&mut self) -> core::result::Result<CapRef, SpawnError> {
        self.res
            .slots
            .alloc(self.kernel, &mut self.res.mm, 1)
            .map_err(SpawnError::SlotAlloc)
    }

    /// Allocate a frame of the page-rounded size through the RAM manager.
    fn alloc_frame(&mut self, bytes: usize) -> core::result::Result<CapRef, SpawnError> {
        let rounded = bytes.max(1).next_multiple_of(BASE_PAGE_SIZE);
        let ram_dest = self.alloc_slot()?;
        let ram = self
            .res
            .mm
            .alloc_into(self.kernel, ram_dest, rounded, BASE_PAGE_SIZE)
            .map_err(SpawnError::FrameAlloc)?;
        let dest = self.alloc_slot()?;
        self.kernel
            .cap_retype(&dest, &ram, 0, CapType::Frame, rounded, 1)
            .map_err(|e| SpawnError::FrameAlloc(MmError::Retype(e)))?;
        Ok(dest)
    }

    /// Allocate a zeroed frame and map it into the parent.
    fn alloc_mapped_frame(
        &mut self,
        bytes: usize,
    ) -> core::result::Result<(CapRef, NonNull<u8>), SpawnError> {
        let frame = self.alloc_frame(bytes)?;
        let ptr = self
            .vspace
            .map_frame(self.kernel, self.res, &frame, bytes, MapFlags::READ_WRITE)
            .map_err(SpawnError::MapToSelf)?;
        // SAFETY: freshly mapped writable range of at least `bytes`
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, bytes) };
        Ok((frame, ptr))
    }

    /// Build the child's capability space.
    fn setup_cspace(&mut self, si: &mut SpawnInfo) -> core::result::Result<(), SpawnError> {
        let l1_slot = self.alloc_slot()?;
        self.kernel
            .cnode_create_l1(&l1_slot)
            .map_err(SpawnError::CreateRootCn)?;

        let taskcn = self
            .kernel
            .cnode_create_foreign_l2(&l1_slot, rootcn_slot::TASKCN)
            .map_err(SpawnError::CreateForeignL2)?;

        // The child needs a handle to its own cspace.
        self.kernel
            .cap_copy(&CapRef::at(taskcn, taskcn_slot::ROOTCN), &l1_slot)
            .map_err(SpawnError::CopyDomainCap)?;

        for slot in [
            rootcn_slot::SLOT_ALLOC0,
            rootcn_slot::SLOT_ALLOC1,
            rootcn_slot::SLOT_ALLOC2,
        ] {
            self.kernel
                .cnode_create_foreign_l2(&l1_slot, slot)
                .map_err(SpawnError::CreateForeignL2)?;
        }

        // BASE_PAGE_CN: L2_CNODE_SLOTS page-sized RAM caps in one retype.
        let base_page_cn = self
            .kernel
            .cnode_create_foreign_l2(&l1_slot, rootcn_slot::BASE_PAGE_CN)
            .map_err(SpawnError::CreateForeignL2)?;
        let ram_dest = self.alloc_slot()?;
        let ram = self
            .res
            .mm
            .alloc_into(
                self.kernel,
                ram_dest,
                BASE_PAGE_SIZE * L2_CNODE_SLOTS,
                BASE_PAGE_SIZE,
            )
            .map_err(SpawnError::FrameAlloc)?;
        self.kernel
            .cap_retype(
                &CapRef::at(base_page_cn, 0),
                &ram,
                0,
                CapType::Ram,
                BASE_PAGE_SIZE,
                L2_CNODE_SLOTS,
            )
            .map_err(SpawnError::FillBasePageCn)?;

        let pagecn = self
            .kernel
            .cnode_create_foreign_l2(&l1_slot, rootcn_slot::PAGECN)
            .map_err(SpawnError::CreateForeignL2)?;

        if !si.cap_to_transfer.is_null() {
            self.kernel
                .cap_copy(
                    &CapRef::at(taskcn, taskcn_slot::FREE),
                    &si.cap_to_transfer,
                )
                .map_err(SpawnError::CopyDomainCap)?;
        }

        si.rootcn = Some(l1_slot);
        si.taskcn = Some(taskcn);
        si.pagecn = Some(pagecn);
        si.base_page_cn = Some(base_page_cn);
        Ok(())
    }

    /// Create the child's L0 vnode and paging state.
    fn setup_vspace(&mut self, si: &mut SpawnInfo) -> core::result::Result<(), SpawnError> {
        // Create the root table in our cspace so we can keep invoking it.
        let l0_parent = self.alloc_slot()?;
        self.kernel
            .vnode_create(&l0_parent, VnodeLevel::L0)
            .map_err(SpawnError::CreateVnode)?;

        let pagecn = si.pagecn.expect("cspace not set up");
        self.kernel
            .cap_copy(&CapRef::at(pagecn, 0), &l0_parent)
            .map_err(SpawnError::CopyVnode)?;

        si.child_paging = Some(PagingState::new(l0_parent));
        Ok(())
    }

    /// Map the module, validate it, and load every loadable segment.
    fn setup_elf(
        &mut self,
        si: &mut SpawnInfo,
        module_frame: &CapRef,
        module_bytes: usize,
    ) -> core::result::Result<(), SpawnError> {
        let module_ptr = self
            .vspace
            .map_frame(
                self.kernel,
                self.res,
                module_frame,
                module_bytes,
                MapFlags::READ,
            )
            .map_err(SpawnError::MapToSelf)?;
        // SAFETY: the module frame stays mapped for the whole spawn
        let image = unsafe { core::slice::from_raw_parts(module_ptr.as_ptr(), module_bytes) };

        if !elf::is_elf(image) {
            return Err(SpawnError::ElfMap);
        }

        let hdr = elf::parse_header(image)?;
        si.pc = hdr.entry;

        for phdr in elf::program_headers(image, &hdr)? {
            if phdr.is_load() {
                self.load_segment(si, image, &phdr)?;
            }
        }

        si.got_addr = elf::find_section_addr(image, &hdr, ".got")?;
        Ok(())
    }

    /// Load one segment: a fresh frame mapped fixed into the child with
    /// the segment's permissions and writable into the parent for filling.
    fn load_segment(
        &mut self,
        si: &mut SpawnInfo,
        image: &[u8],
        phdr: &elf::ProgramHeader,
    ) -> core::result::Result<(), SpawnError> {
        let fbase = phdr.vaddr / BASE_PAGE_SIZE as u64 * BASE_PAGE_SIZE as u64;
        let esize = ((phdr.vaddr - fbase + phdr.memsz) as usize).next_multiple_of(BASE_PAGE_SIZE);

        let file_start = phdr.offset as usize;
        let file_end = file_start + phdr.filesz as usize;
        if file_end > image.len() {
            return Err(SpawnError::ElfLoad(ElfError::InvalidProgramHeader));
        }

        let frame = self.alloc_frame(esize)?;

        let child_paging = si.child_paging.as_mut().expect("vspace not set up");
        child_paging
            .map_fixed(self.kernel, self.res, fbase, &frame, esize, phdr.map_flags())
            .map_err(SpawnError::PagingMap)?;

        let parent_ptr = self
            .vspace
            .map_frame(self.kernel, self.res, &frame, esize, MapFlags::READ_WRITE)
            .map_err(SpawnError::MapToSelf)?;

        // Fill at the segment's offset within the first page.
        let seg_off = (phdr.vaddr - fbase) as usize;
        // SAFETY: parent mapping covers esize >= seg_off + memsz
        unsafe {
            let dst = parent_ptr.as_ptr().add(seg_off);
            core::ptr::copy_nonoverlapping(
                image[file_start..file_end].as_ptr(),
                dst,
                phdr.filesz as usize,
            );
            // BSS
            core::ptr::write_bytes(
                dst.add(phdr.filesz as usize),
                0,
                (phdr.memsz - phdr.filesz) as usize,
            );
        }
        Ok(())
    }

    /// Create the dispatcher and populate its control frame.
    fn setup_dispatcher(&mut self, si: &mut SpawnInfo) -> core::result::Result<(), SpawnError> {
        let taskcn = si.taskcn();

        let child_dispatcher_slot = CapRef::at(taskcn, taskcn_slot::DISPATCHER);
        self.kernel
            .dispatcher_create(&child_dispatcher_slot)
            .map_err(SpawnError::CreateDispatcher)?;

        let parent_copy = self.alloc_slot()?;
        self.kernel
            .cap_copy(&parent_copy, &child_dispatcher_slot)
            .map_err(SpawnError::CopyDomainCap)?;

        let (dispframe, ptr) = self.alloc_mapped_frame(DISPATCHER_FRAME_SIZE)?;

        // SAFETY: page-aligned writable frame of DISPATCHER_FRAME_SIZE bytes
        let disp = unsafe { &mut *ptr.as_ptr().cast::<DispatcherFrame>() };
        disp.core_id = u32::from(self.kernel.core_id());
        disp.domain_id = si.pid.expect("pid not set").raw();
        disp.udisp = CHILD_DISPFRAME_VADDR;
        disp.disabled = 1;
        disp.name.fill(0);
        let name_bytes = si.binary_name.as_bytes();
        let copy = name_bytes.len().min(DISP_NAME_LEN - 1);
        disp.name[..copy].copy_from_slice(&name_bytes[..copy]);
        disp.disabled_area = RegisterState::zeroed();
        disp.enabled_area = RegisterState::zeroed();
        disp.disabled_area.pc = si.pc;
        disp.enabled_area.regs[PIC_REGISTER] = si.got_addr;
        disp.disabled_area.regs[PIC_REGISTER] = si.got_addr;
        disp.got_base = si.got_addr;
        disp.eh_frame = 0;
        disp.eh_frame_size = 0;
        disp.eh_frame_hdr = 0;
        disp.eh_frame_hdr_size = 0;

        self.kernel
            .cap_copy(&CapRef::at(taskcn, taskcn_slot::DISPFRAME), &dispframe)
            .map_err(SpawnError::CopyDomainCap)?;

        let child_paging = si.child_paging.as_mut().expect("vspace not set up");
        child_paging
            .map_fixed(
                self.kernel,
                self.res,
                CHILD_DISPFRAME_VADDR,
                &dispframe,
                DISPATCHER_FRAME_SIZE,
                MapFlags::READ_WRITE,
            )
            .map_err(SpawnError::PagingMap)?;

        // Record the dispatcher in the process node.
        let pid = si.pid.expect("pid not set");
        if let Ok(node) = self.procs.get_mut(pid) {
            node.dispatcher = Some(parent_copy.alias());
        }

        si.dispatcher_cap_in_parent = Some(parent_copy);
        si.disp_frame_ptr = Some(ptr);
        Ok(())
    }

    /// Create the init endpoint and install it into the child.
    fn setup_endpoint(&mut self, si: &mut SpawnInfo) -> core::result::Result<(), SpawnError> {
        let ep_slot = self.alloc_slot()?;
        self.kernel
            .endpoint_create(&ep_slot, PROC_ENDPOINT_BUF_LEN)
            .map_err(SpawnError::EndpointInit)?;

        self.kernel
            .cap_copy(&CapRef::at(si.taskcn(), taskcn_slot::INITEP), &ep_slot)
            .map_err(SpawnError::CopyDomainCap)?;

        // Register receive on the channel; it stays in bind-wait until the
        // child sends its endpoint back.
        let pid = si.pid.expect("pid not set");
        if let Ok(node) = self.procs.get_mut(pid) {
            node.chan.local_ep = Some(ep_slot);
            node.chan.recv_registered = true;
        }
        Ok(())
    }

    /// Build the argument page: `SpawnDomainParams` followed by the argv
    /// and envp strings, with child-side pointers.
    fn setup_arguments(
        &mut self,
        si: &mut SpawnInfo,
        argv: &[&str],
    ) -> core::result::Result<(), SpawnError> {
        let (argpage, ptr) = self.alloc_mapped_frame(BASE_PAGE_SIZE)?;

        let child_paging = si.child_paging.as_mut().expect("vspace not set up");
        child_paging
            .map_fixed(
                self.kernel,
                self.res,
                CHILD_ARGFRAME_VADDR,
                &argpage,
                BASE_PAGE_SIZE,
                MapFlags::READ_WRITE,
            )
            .map_err(SpawnError::PagingMap)?;

        // Copy the strings first, recording the child-side pointers; the
        // header is written in one go afterwards.
        let mut offset = core::mem::size_of::<SpawnDomainParams>();
        let mut argv_ptrs = [0u64; MAX_CMDLINE_ARGS + 1];
        for (i, arg) in argv.iter().take(MAX_CMDLINE_ARGS).enumerate() {
            argv_ptrs[i] = CHILD_ARGFRAME_VADDR + offset as u64;
            offset = Self::copy_string(ptr, offset, arg)?;
        }

        let mut envp_ptrs = [0u64; MAX_ENVIRON_VARS + 1];
        for (i, var) in self.environ.iter().take(MAX_ENVIRON_VARS).enumerate() {
            envp_ptrs[i] = CHILD_ARGFRAME_VADDR + offset as u64;
            offset = Self::copy_string(ptr, offset, var)?;
        }

        // SAFETY: zeroed writable page, strings live past the header
        let params = unsafe { &mut *ptr.as_ptr().cast::<SpawnDomainParams>() };
        params.terminal_state = si.terminal_state;
        params.argc = argv.len().min(MAX_CMDLINE_ARGS) as u64;
        params.argv = argv_ptrs;
        params.envp = envp_ptrs;

        self.kernel
            .cap_copy(&CapRef::at(si.taskcn(), taskcn_slot::ARGSPAGE), &argpage)
            .map_err(SpawnError::CopyDomainCap)?;

        si.arg_page_ptr = Some(ptr);
        Ok(())
    }

    /// Copy a NUL-terminated string into the argument page; returns the
    /// next free offset.
    fn copy_string(
        page: NonNull<u8>,
        offset: usize,
        s: &str,
    ) -> core::result::Result<usize, SpawnError> {
        let copy_len = s.len() + 1;
        if offset + copy_len >= BASE_PAGE_SIZE {
            return Err(SpawnError::ArgsPageOverflow);
        }
        // SAFETY: bounds checked against the page above
        unsafe {
            let dst = page.as_ptr().add(offset);
            core::ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
            dst.add(s.len()).write(0);
        }
        Ok(offset + copy_len)
    }

    /// Point x0 at the argument page and hand the dispatcher to the kernel.
    fn start_dispatcher(&mut self, si: &mut SpawnInfo) -> core::result::Result<(), SpawnError> {
        let disp_ptr = si.disp_frame_ptr.expect("dispatcher not set up");
        // SAFETY: dispatcher frame mapped writable in setup_dispatcher
        let disp = unsafe { &mut *disp_ptr.as_ptr().cast::<DispatcherFrame>() };
        disp.enabled_area.regs[0] = CHILD_ARGFRAME_VADDR;

        let pagecn = si.pagecn.expect("cspace not set up");
        let child_rootvn = CapRef::at(pagecn, 0);
        let child_dispframe = CapRef::at(si.taskcn(), taskcn_slot::DISPFRAME);

        self.kernel
            .invoke_dispatcher(
                si.dispatcher_cap_in_parent
                    .as_ref()
                    .expect("dispatcher not set up"),
                &self.kernel.own_dispatcher(),
                si.rootcn.as_ref().expect("cspace not set up"),
                &child_rootvn,
                &child_dispframe,
                true,
            )
            .map_err(SpawnError::MakeRunnable)
    }
}
