// src/rpc/dispatch.rs
//! Request dispatch for the init runtime.
//!
//! [`InitRuntime`] is the top-level handle owning the per-core singletons:
//! resources, process table, boot info, URPC links, and terminal state.
//! Every request identifier maps to one handler; requests targeting another
//! core (explicitly or through the PID encoding) are forwarded over the
//! URPC link and answered from the peer's reply.
//!
//! All handlers run to completion on the local core. A forwarded call
//! blocks on the link; concurrent calls in both directions on the same
//! link can deadlock (open issue, see the link documentation).

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::capability::{CapRef, CapType, CoreId, KernelInterface, MapFlags};
use crate::constants::{MAX_COREID, RAM_PER_CORE};
use crate::errors::{MmError, ProcError, Result, RpcError, RuntimeError};
use crate::mm::CoreResources;
use crate::paging::VspaceMapper;
use crate::process::{ConnState, LmpChannel, Pid, ProcTable};
use crate::rpc::urpc::{UrpcLink, URPC_FRAME_SIZE};
use crate::rpc::{
    payload_str, read_u64, BindCoreUrpcMsg, CapIdentityMsg, PidListMsg, RamReplyMsg,
    RamRequestMsg, RpcIdentifier, SpawnMsg,
};
use crate::spawn::{BootInfo, SpawnInfo, Spawner};
use crate::terminal::Terminal;

const _: () = assert!(MAX_COREID == 4, "links array below assumes four cores");

/// Top-level runtime handle of one init dispatcher.
pub struct InitRuntime<'k> {
    kernel: &'k dyn KernelInterface,
    pub res: CoreResources,
    pub vspace: Box<dyn VspaceMapper + 'k>,
    pub bootinfo: BootInfo,
    pub procs: ProcTable,
    pub environ: Vec<String>,
    /// URPC links, indexed by peer core
    pub links: [Option<UrpcLink>; MAX_COREID],
    /// Terminal state; present on the core driving the serial device
    pub terminal: Option<Terminal>,
    nameserver: Option<LmpChannel>,
}

impl<'k> InitRuntime<'k> {
    /// Assemble a runtime from its parts.
    pub fn new(
        kernel: &'k dyn KernelInterface,
        res: CoreResources,
        vspace: Box<dyn VspaceMapper + 'k>,
        bootinfo: BootInfo,
        procs: ProcTable,
        environ: Vec<String>,
    ) -> Self {
        Self {
            kernel,
            res,
            vspace,
            bootinfo,
            procs,
            environ,
            links: [None, None, None, None],
            terminal: None,
            nameserver: None,
        }
    }

    /// The core this runtime serves.
    #[must_use]
    pub fn core_id(&self) -> CoreId {
        self.kernel.core_id()
    }

    /// A spawner borrowing this runtime's pieces.
    pub fn spawner(&mut self) -> Spawner<'_, 'k> {
        Spawner {
            kernel: self.kernel,
            res: &mut self.res,
            vspace: &mut *self.vspace,
            bootinfo: &self.bootinfo,
            procs: &mut self.procs,
            environ: &self.environ,
        }
    }

    // ------------------------------------------------------------------
    // Link serving
    // ------------------------------------------------------------------

    /// Handle one pending request from the given peer core, if any.
    ///
    /// Returns `Ok(true)` when a request was served.
    pub fn poll_link(&mut self, core: usize) -> Result<bool> {
        let msg = {
            let link = self.links[core]
                .as_ref()
                .ok_or(RuntimeError::Rpc(RpcError::LinkNotEstablished))?;
            match link.try_recv_request() {
                None => return Ok(false),
                Some(msg) => msg,
            }
        };
        self.dispatch_and_reply(core, &msg)?;
        Ok(true)
    }

    fn dispatch_and_reply(&mut self, core: usize, msg: &[u8]) -> Result<()> {
        // Capabilities do not travel over the ring; cap-bearing requests
        // use the local fast path only.
        let result = match msg.first().and_then(|b| RpcIdentifier::from_u8(*b)) {
            None => Err(RuntimeError::Rpc(RpcError::UnknownIdentifier)),
            Some(ident) => self.handle(ident, &msg[1..], CapRef::NULL),
        };

        let link = self.links[core].as_ref().expect("link vanished mid-serve");
        match result {
            Ok((payload, _cap)) => link.reply_ack(&payload).map_err(RuntimeError::Rpc),
            Err(e) => {
                warn!("[Rpc] request from core {core} failed: {e}");
                link.reply_nack(e.code()).map_err(RuntimeError::Rpc)
            }
        }
    }

    fn forward_to_core(
        &mut self,
        core: CoreId,
        ident: RpcIdentifier,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        debug!("[Rpc] forwarding {ident:?} to core {core}");
        let link = self.links[core as usize]
            .as_ref()
            .ok_or(RuntimeError::Rpc(RpcError::LinkNotEstablished))?;
        link.call(ident, payload).map_err(RuntimeError::Rpc)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Dispatch one request. Returns the reply payload and an optional
    /// reply capability.
    pub fn handle(
        &mut self,
        ident: RpcIdentifier,
        payload: &[u8],
        in_cap: CapRef,
    ) -> Result<(Vec<u8>, CapRef)> {
        match ident {
            RpcIdentifier::Num => self.handle_num(payload),
            RpcIdentifier::Str => self.handle_str(payload),
            RpcIdentifier::RamRequest => self.handle_ram_request(payload),
            RpcIdentifier::RemoteRamRequest => self.handle_remote_ram_request(payload),
            RpcIdentifier::ProcessSpawn | RpcIdentifier::ProcessSpawnWithStdin => {
                self.handle_spawn(ident, payload)
            }
            RpcIdentifier::ProcessGetName => self.handle_get_name(payload),
            RpcIdentifier::GetLocalPids => self.handle_get_local_pids(),
            RpcIdentifier::ProcessGetAllPids => self.handle_get_all_pids(),
            RpcIdentifier::TransferCap => self.handle_transfer_cap(payload, in_cap),
            RpcIdentifier::RemoteCapTransfer => self.handle_remote_cap_transfer(payload),
            RpcIdentifier::BindCoreUrpc => self.handle_bind_core_urpc(payload),
            RpcIdentifier::TerminalGetChar
            | RpcIdentifier::TerminalPutChar
            | RpcIdentifier::TerminalGets
            | RpcIdentifier::TerminalPuts
            | RpcIdentifier::TerminalAcquire
            | RpcIdentifier::TerminalRelease
            | RpcIdentifier::TerminalHasStdin => self.handle_terminal(ident, payload),
            RpcIdentifier::RegisterNameserver => self.handle_register_nameserver(),
            RpcIdentifier::BindNameserver => self.handle_bind_nameserver(payload),
            RpcIdentifier::RemoteBindNameserver => self.handle_remote_bind_nameserver(payload),
            RpcIdentifier::Ack | RpcIdentifier::Nack => {
                Err(RuntimeError::Rpc(RpcError::UnknownIdentifier))
            }
        }
    }

    fn handle_num(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        if self.core_id() == 0 {
            let num = read_u64(payload, 0).map_err(RuntimeError::Rpc)?;
            debug!("[Rpc] received number {num}");
            Ok((Vec::new(), CapRef::NULL))
        } else {
            let reply = self.forward_to_core(0, RpcIdentifier::Num, payload)?;
            Ok((reply, CapRef::NULL))
        }
    }

    fn handle_str(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        if self.core_id() == 0 {
            let s = payload_str(payload).map_err(RuntimeError::Rpc)?;
            debug!("[Rpc] received string \"{s}\"");
            Ok((Vec::new(), CapRef::NULL))
        } else {
            let reply = self.forward_to_core(0, RpcIdentifier::Str, payload)?;
            Ok((reply, CapRef::NULL))
        }
    }

    /// Local RAM allocation, escalating to core 0 when the pool runs dry.
    fn handle_ram_request(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let msg = RamRequestMsg::decode(payload).map_err(RuntimeError::Rpc)?;

        match self
            .res
            .ram_alloc_aligned(self.kernel, msg.size as usize, msg.align as usize)
        {
            Ok(cap) => Ok((Vec::new(), cap)),
            Err(RuntimeError::Mm(MmError::NoMemory)) => {
                debug!("[Rpc] not enough memory locally, requesting core 0");

                let escalated = RamRequestMsg {
                    size: (msg.size * 2).max(RAM_PER_CORE as u64),
                    align: msg.align,
                }
                .encode();
                let reply =
                    self.forward_to_core(0, RpcIdentifier::RemoteRamRequest, &escalated)?;
                let ram = RamReplyMsg::decode(&reply).map_err(RuntimeError::Rpc)?;

                // Forge a local cap over the granted region and grow the
                // local manager with it.
                let slot = self.res.alloc_slot(self.kernel)?;
                self.kernel
                    .ram_forge(&slot, ram.base, ram.bytes, self.kernel.core_id())
                    .map_err(RuntimeError::Kernel)?;
                self.res.mm.add(self.kernel, slot).map_err(RuntimeError::Mm)?;
                debug!("[Rpc] added RAM {:#x}/{:#x} from core 0", ram.base, ram.bytes);

                let cap = self.res.ram_alloc_aligned(
                    self.kernel,
                    msg.size as usize,
                    msg.align as usize,
                )?;
                Ok((Vec::new(), cap))
            }
            Err(e) => Err(e),
        }
    }

    /// Serve an escalated RAM request; the grant is serialized by identity
    /// since capabilities cannot travel over the ring.
    fn handle_remote_ram_request(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let msg = RamRequestMsg::decode(payload).map_err(RuntimeError::Rpc)?;
        debug!(
            "[Rpc] remote RAM request, size {:#x} align {:#x}",
            msg.size, msg.align
        );

        let cap = self
            .res
            .ram_alloc_aligned(self.kernel, msg.size as usize, msg.align as usize)?;
        let identity = self.kernel.cap_identify(&cap).map_err(RuntimeError::Kernel)?;

        debug!(
            "[Rpc] giving out RAM {:#x}/{:#x}",
            identity.base, identity.bytes
        );
        let reply = RamReplyMsg {
            base: identity.base,
            bytes: identity.bytes,
        };
        Ok((reply.encode(), CapRef::NULL))
    }

    fn handle_spawn(
        &mut self,
        ident: RpcIdentifier,
        payload: &[u8],
    ) -> Result<(Vec<u8>, CapRef)> {
        let msg = SpawnMsg::decode(payload).map_err(RuntimeError::Rpc)?;

        if msg.core == self.core_id() {
            let mut si = SpawnInfo::new();
            let terminal_state = msg.terminal_state;
            let pid = self.spawner().spawn_load_cmdline(
                &msg.cmdline,
                CapRef::NULL,
                terminal_state,
                &mut si,
            )?;
            Ok((pid.raw().to_le_bytes().to_vec(), CapRef::NULL))
        } else {
            let reply = self.forward_to_core(msg.core, ident, payload)?;
            Ok((reply, CapRef::NULL))
        }
    }

    fn handle_get_name(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let pid = Pid::from_raw(super::read_u32(payload, 0).map_err(RuntimeError::Rpc)?);
        if pid.core() == self.core_id() {
            let name = self.procs.get(pid)?.name.clone();
            let mut reply = name.into_bytes();
            reply.push(0);
            Ok((reply, CapRef::NULL))
        } else {
            let reply = self.forward_to_core(pid.core(), RpcIdentifier::ProcessGetName, payload)?;
            Ok((reply, CapRef::NULL))
        }
    }

    fn handle_get_local_pids(&mut self) -> Result<(Vec<u8>, CapRef)> {
        let msg = PidListMsg {
            pids: self.procs.all_pids(),
        };
        Ok((msg.encode(), CapRef::NULL))
    }

    /// Collect PIDs from every reachable core.
    fn handle_get_all_pids(&mut self) -> Result<(Vec<u8>, CapRef)> {
        let mut pids = self.procs.all_pids();
        for core in 0..MAX_COREID {
            if core == self.core_id() as usize || self.links[core].is_none() {
                continue;
            }
            let reply =
                self.forward_to_core(core as CoreId, RpcIdentifier::GetLocalPids, &[])?;
            let remote = PidListMsg::decode(&reply).map_err(RuntimeError::Rpc)?;
            pids.extend(remote.pids);
        }
        Ok((PidListMsg { pids }.encode(), CapRef::NULL))
    }

    /// Deliver a capability to a process, possibly on another core.
    fn handle_transfer_cap(
        &mut self,
        payload: &[u8],
        in_cap: CapRef,
    ) -> Result<(Vec<u8>, CapRef)> {
        let pid = Pid::from_raw(super::read_u32(payload, 0).map_err(RuntimeError::Rpc)?);
        if in_cap.is_null() {
            return Err(RuntimeError::Rpc(RpcError::CapExpected));
        }
        debug!("[Rpc] transfer cap to {pid}");

        if pid.core() == self.core_id() {
            // Local fast path: straight onto the target's channel, never
            // blocking; transient errors surface to the caller.
            let node = self.procs.get(pid)?;
            node.chan.put_cap(in_cap).map_err(RuntimeError::Rpc)?;
        } else {
            let identity = self
                .kernel
                .cap_identify(&in_cap)
                .map_err(RuntimeError::Kernel)?;
            match identity.ctype {
                CapType::Frame | CapType::DevFrame | CapType::Ram => {}
                _ => return Err(RuntimeError::Rpc(RpcError::CapRefused)),
            }
            let msg = CapIdentityMsg {
                pid,
                ctype: identity.ctype,
                base: identity.base,
                bytes: identity.bytes,
            };
            self.forward_to_core(pid.core(), RpcIdentifier::RemoteCapTransfer, &msg.encode())?;
        }
        Ok((Vec::new(), CapRef::NULL))
    }

    /// Reconstruct a serialized capability and deliver it locally.
    fn handle_remote_cap_transfer(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let msg = CapIdentityMsg::decode(payload).map_err(RuntimeError::Rpc)?;
        debug!("[Rpc] received cap for {}", msg.pid);

        if msg.pid.core() != self.core_id() {
            return Err(RuntimeError::Proc(ProcError::PidNotFound));
        }

        let slot = self.res.alloc_slot(self.kernel)?;
        let owner = self.kernel.core_id();
        match msg.ctype {
            CapType::Frame => self
                .kernel
                .frame_forge(&slot, msg.base, msg.bytes, owner)
                .map_err(RuntimeError::Kernel)?,
            CapType::DevFrame => self
                .kernel
                .devframe_forge(&slot, msg.base, msg.bytes, owner)
                .map_err(RuntimeError::Kernel)?,
            CapType::Ram => self
                .kernel
                .ram_forge(&slot, msg.base, msg.bytes, owner)
                .map_err(RuntimeError::Kernel)?,
            _ => return Err(RuntimeError::Rpc(RpcError::CapRefused)),
        }

        let node = self.procs.get(msg.pid)?;
        node.chan.put_cap(slot).map_err(RuntimeError::Rpc)?;
        Ok((Vec::new(), CapRef::NULL))
    }

    /// Forge the shared frame from its identity and bring up the link.
    fn handle_bind_core_urpc(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let msg = BindCoreUrpcMsg::decode(payload).map_err(RuntimeError::Rpc)?;
        debug!("[Rpc] binding urpc with core {}", msg.core);

        let slot = self.res.alloc_slot(self.kernel)?;
        self.kernel
            .frame_forge(&slot, msg.base, msg.bytes, self.kernel.core_id())
            .map_err(RuntimeError::Kernel)?;

        let ptr = self
            .vspace
            .map_frame(
                self.kernel,
                &mut self.res,
                &slot,
                URPC_FRAME_SIZE,
                MapFlags::READ_WRITE,
            )
            .map_err(RuntimeError::Paging)?;

        // The frame creator already initialized both rings.
        // SAFETY: the frame is mapped writable for URPC_FRAME_SIZE bytes
        let link = unsafe { UrpcLink::from_frame(ptr, msg.listener_first, false) }
            .map_err(RuntimeError::Ring)?;
        self.links[msg.core as usize] = Some(link);

        debug!("[Rpc] urpc link to core {} up", msg.core);
        Ok((Vec::new(), CapRef::NULL))
    }

    fn handle_terminal(
        &mut self,
        ident: RpcIdentifier,
        payload: &[u8],
    ) -> Result<(Vec<u8>, CapRef)> {
        if self.core_id() != 0 {
            let reply = self.forward_to_core(0, ident, payload)?;
            return Ok((reply, CapRef::NULL));
        }
        let terminal = self
            .terminal
            .as_mut()
            .ok_or(RuntimeError::Rpc(RpcError::NotImplemented))?;

        match ident {
            RpcIdentifier::TerminalGetChar => {
                let token = read_u64(payload, 0).map_err(RuntimeError::Rpc)?;
                let c = terminal.getchar(token).map_err(RuntimeError::Terminal)?;
                Ok((vec![c], CapRef::NULL))
            }
            RpcIdentifier::TerminalPutChar => {
                let c = *payload
                    .first()
                    .ok_or(RuntimeError::Rpc(RpcError::InvalidPayloadSize))?;
                terminal.putchar(c);
                Ok((Vec::new(), CapRef::NULL))
            }
            RpcIdentifier::TerminalPuts => {
                let written = terminal.puts(payload);
                Ok(((written as u64).to_le_bytes().to_vec(), CapRef::NULL))
            }
            RpcIdentifier::TerminalGets => {
                let token = read_u64(payload, 0).map_err(RuntimeError::Rpc)?;
                let len = read_u64(payload, 8).map_err(RuntimeError::Rpc)? as usize;
                let mut buf = Vec::with_capacity(len);
                for _ in 0..len {
                    match terminal.getchar(token) {
                        Ok(c) => buf.push(c),
                        Err(crate::errors::TerminalError::NoInput) => break,
                        Err(e) => return Err(RuntimeError::Terminal(e)),
                    }
                }
                Ok((buf, CapRef::NULL))
            }
            RpcIdentifier::TerminalAcquire => {
                let use_stdin = payload.first().copied().unwrap_or(0) != 0;
                let token = terminal.acquire(use_stdin);
                Ok((token.to_le_bytes().to_vec(), CapRef::NULL))
            }
            RpcIdentifier::TerminalRelease => {
                let token = read_u64(payload, 0).map_err(RuntimeError::Rpc)?;
                terminal.release(token);
                Ok((Vec::new(), CapRef::NULL))
            }
            RpcIdentifier::TerminalHasStdin => {
                let token = read_u64(payload, 0).map_err(RuntimeError::Rpc)?;
                Ok((vec![u8::from(terminal.can_use_stdin(token))], CapRef::NULL))
            }
            _ => Err(RuntimeError::Rpc(RpcError::UnknownIdentifier)),
        }
    }

    fn handle_register_nameserver(&mut self) -> Result<(Vec<u8>, CapRef)> {
        let mut chan = LmpChannel::new();
        chan.state = ConnState::Connected;
        self.nameserver = Some(chan);
        Ok((Vec::new(), CapRef::NULL))
    }

    /// Allocate and zero a bidirectional URPC frame for a client, then hand
    /// it to the nameserver (directly on core 0, by identity otherwise).
    fn handle_bind_nameserver(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let pid = Pid::from_raw(super::read_u32(payload, 0).map_err(RuntimeError::Rpc)?);
        debug!("[Rpc] {pid} binding nameserver");

        let frame = self.res.frame_alloc(self.kernel, URPC_FRAME_SIZE)?;
        let ptr = self
            .vspace
            .map_frame(
                self.kernel,
                &mut self.res,
                &frame,
                URPC_FRAME_SIZE,
                MapFlags::READ_WRITE,
            )
            .map_err(RuntimeError::Paging)?;
        // The coordinator zeroes the shared frame.
        // SAFETY: mapped writable for URPC_FRAME_SIZE bytes
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, URPC_FRAME_SIZE) };

        if self.core_id() == 0 {
            let nameserver = self
                .nameserver
                .as_ref()
                .ok_or(RuntimeError::Rpc(RpcError::TargetDisabled))?;
            // Never block; the client retries on transient failure.
            nameserver
                .put_cap(frame.alias())
                .map_err(RuntimeError::Rpc)?;
        } else {
            let identity = self
                .kernel
                .cap_identify(&frame)
                .map_err(RuntimeError::Kernel)?;
            let msg = CapIdentityMsg {
                pid,
                ctype: identity.ctype,
                base: identity.base,
                bytes: identity.bytes,
            };
            self.forward_to_core(0, RpcIdentifier::RemoteBindNameserver, &msg.encode())?;
        }
        Ok((Vec::new(), frame))
    }

    fn handle_remote_bind_nameserver(&mut self, payload: &[u8]) -> Result<(Vec<u8>, CapRef)> {
        let msg = CapIdentityMsg::decode(payload).map_err(RuntimeError::Rpc)?;
        if msg.ctype != CapType::Frame {
            return Err(RuntimeError::Rpc(RpcError::CapRefused));
        }

        let slot = self.res.alloc_slot(self.kernel)?;
        self.kernel
            .frame_forge(&slot, msg.base, msg.bytes, self.kernel.core_id())
            .map_err(RuntimeError::Kernel)?;

        let nameserver = self
            .nameserver
            .as_ref()
            .ok_or(RuntimeError::Rpc(RpcError::TargetDisabled))?;
        nameserver.put_cap(slot).map_err(RuntimeError::Rpc)?;
        Ok((Vec::new(), CapRef::NULL))
    }
}
