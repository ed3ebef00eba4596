// src/errors/unified.rs
//! Unified error types for the init runtime.
//!
//! This module provides a consistent error handling approach across all
//! runtime subsystems. Each layer wraps the error of the layer below it, so
//! a failure carries its full context stack: formatting a [`RuntimeError`]
//! prints something like `spawn error: map dispatcher frame: vnode map
//! failed: slot in use`.
//!
//! For transport over the URPC rings every error flattens to a 32-bit code
//! (`class << 8 | kind`); the receiving side keeps the raw value in
//! [`RemoteError`] rather than attempting a lossy reconstruction.

use core::fmt;

/// Top-level runtime error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// Kernel invocation failure
    Kernel(KernelCallError),
    /// RAM manager error
    Mm(MmError),
    /// Slot pre-allocator error
    SlotAlloc(SlotAllocError),
    /// Paging subsystem error
    Paging(PagingError),
    /// Process table error
    Proc(ProcError),
    /// Spawner error
    Spawn(SpawnError),
    /// RPC dispatch error
    Rpc(RpcError),
    /// Ring buffer error
    Ring(RingError),
    /// Filesystem error
    Fs(FsError),
    /// Terminal error
    Terminal(TerminalError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(e) => write!(f, "kernel error: {e}"),
            Self::Mm(e) => write!(f, "mm error: {e}"),
            Self::SlotAlloc(e) => write!(f, "slot alloc error: {e}"),
            Self::Paging(e) => write!(f, "paging error: {e}"),
            Self::Proc(e) => write!(f, "proc error: {e}"),
            Self::Spawn(e) => write!(f, "spawn error: {e}"),
            Self::Rpc(e) => write!(f, "rpc error: {e}"),
            Self::Ring(e) => write!(f, "ring error: {e}"),
            Self::Fs(e) => write!(f, "fs error: {e}"),
            Self::Terminal(e) => write!(f, "terminal error: {e}"),
        }
    }
}

/// Result type alias for runtime operations
pub type Result<T> = core::result::Result<T, RuntimeError>;

/// Kernel invocation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelCallError {
    /// No free slot in the target cnode
    NoSpace,
    /// The destination slot is already occupied
    SlotInUse,
    /// The slot or cnode address does not exist
    InvalidSlot,
    /// The capability does not refer to a live kernel object
    InvalidCapability,
    /// The capability has the wrong type for this invocation
    TypeMismatch,
    /// The requested mapping is invalid (bad slot, count, or offset)
    InvalidMapping,
    /// Retype arguments are invalid (offset, size, or count)
    InvalidRetype,
    /// The dispatcher invocation was refused
    InvokeFailed,
}

impl KernelCallError {
    /// Returns a string representation of the kernel call error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoSpace => "no free slot",
            Self::SlotInUse => "slot in use",
            Self::InvalidSlot => "invalid slot",
            Self::InvalidCapability => "invalid capability",
            Self::TypeMismatch => "capability type mismatch",
            Self::InvalidMapping => "invalid mapping",
            Self::InvalidRetype => "invalid retype",
            Self::InvokeFailed => "dispatcher invoke failed",
        }
    }

    const fn kind(&self) -> u8 {
        match self {
            Self::NoSpace => 0,
            Self::SlotInUse => 1,
            Self::InvalidSlot => 2,
            Self::InvalidCapability => 3,
            Self::TypeMismatch => 4,
            Self::InvalidMapping => 5,
            Self::InvalidRetype => 6,
            Self::InvokeFailed => 7,
        }
    }
}

impl fmt::Display for KernelCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RAM manager errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No region satisfies the request
    NoMemory,
    /// The region node pool is exhausted
    PoolExhausted,
    /// Identifying the capability failed
    Identify(KernelCallError),
    /// Retyping the region failed
    Retype(KernelCallError),
    /// Destroying the returned capability failed
    Destroy(KernelCallError),
    /// The freed capability does not match a tracked allocation
    UnknownRegion,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory"),
            Self::PoolExhausted => write!(f, "region node pool exhausted"),
            Self::Identify(e) => write!(f, "cap identify: {e}"),
            Self::Retype(e) => write!(f, "region retype: {e}"),
            Self::Destroy(e) => write!(f, "cap destroy: {e}"),
            Self::UnknownRegion => write!(f, "unknown region"),
        }
    }
}

impl MmError {
    const fn kind(&self) -> u8 {
        match self {
            Self::NoMemory => 0,
            Self::PoolExhausted => 1,
            Self::Identify(_) => 2,
            Self::Retype(_) => 3,
            Self::Destroy(_) => 4,
            Self::UnknownRegion => 5,
        }
    }
}

/// Slot pre-allocator errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAllocError {
    /// Neither bucket can satisfy the request
    SlotEmpty,
    /// More slots requested than an L2 cnode holds
    TooManySlots,
    /// The initial cnode did not have the expected free space
    InitialSpace,
    /// Refill failed to allocate backing RAM
    RefillRam(MmError),
    /// Refill failed to obtain a root cnode slot
    RootSlot(KernelCallError),
    /// Refill failed to retype the new cnode
    CnodeCreate(KernelCallError),
}

impl fmt::Display for SlotAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SlotEmpty => write!(f, "out of slots"),
            Self::TooManySlots => write!(f, "request exceeds cnode size"),
            Self::InitialSpace => write!(f, "initial cnode not empty"),
            Self::RefillRam(e) => write!(f, "refill ram alloc: {e}"),
            Self::RootSlot(e) => write!(f, "root slot alloc: {e}"),
            Self::CnodeCreate(e) => write!(f, "cnode create: {e}"),
        }
    }
}

impl SlotAllocError {
    const fn kind(&self) -> u8 {
        match self {
            Self::SlotEmpty => 0,
            Self::TooManySlots => 1,
            Self::InitialSpace => 2,
            Self::RefillRam(_) => 3,
            Self::RootSlot(_) => 4,
            Self::CnodeCreate(_) => 5,
        }
    }
}

/// Paging subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// The virtual address is not page aligned
    Unaligned,
    /// Zero-length mapping requested
    InvalidSize,
    /// The page slot already holds a mapping
    AlreadyMapped,
    /// The node slab ran dry and could not refill
    SlabExhausted,
    /// Allocating a slot for a vnode or mapping failed
    SlotAlloc(SlotAllocError),
    /// Creating an intermediate vnode failed
    VnodeCreate(KernelCallError),
    /// Installing a mapping failed
    VnodeMap(KernelCallError),
    /// The virtual address range allocator is exhausted
    VaExhausted,
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unaligned => write!(f, "address not page aligned"),
            Self::InvalidSize => write!(f, "zero-length mapping"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
            Self::SlabExhausted => write!(f, "node slab exhausted"),
            Self::SlotAlloc(e) => write!(f, "slot alloc: {e}"),
            Self::VnodeCreate(e) => write!(f, "vnode create: {e}"),
            Self::VnodeMap(e) => write!(f, "vnode map: {e}"),
            Self::VaExhausted => write!(f, "virtual address space exhausted"),
        }
    }
}

impl PagingError {
    const fn kind(&self) -> u8 {
        match self {
            Self::Unaligned => 0,
            Self::InvalidSize => 1,
            Self::AlreadyMapped => 2,
            Self::SlabExhausted => 3,
            Self::SlotAlloc(_) => 4,
            Self::VnodeCreate(_) => 5,
            Self::VnodeMap(_) => 6,
            Self::VaExhausted => 7,
        }
    }
}

/// Process table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// The per-core PID counter is exhausted
    NoAvailablePid,
    /// No process with the given PID
    PidNotFound,
    /// Killing the process failed
    Kill(KernelCallError),
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAvailablePid => write!(f, "no available pid"),
            Self::PidNotFound => write!(f, "pid not found"),
            Self::Kill(e) => write!(f, "kill: {e}"),
        }
    }
}

impl ProcError {
    const fn kind(&self) -> u8 {
        match self {
            Self::NoAvailablePid => 0,
            Self::PidNotFound => 1,
            Self::Kill(_) => 2,
        }
    }
}

/// ELF parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// The buffer is too small for the requested structure
    TooSmall,
    /// Bad magic, class, or endianness
    InvalidHeader,
    /// A program header is malformed
    InvalidProgramHeader,
    /// A section header is malformed
    InvalidSectionHeader,
    /// The binary has no `.got` section
    NoGotSection,
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => write!(f, "file too small"),
            Self::InvalidHeader => write!(f, "invalid ELF header"),
            Self::InvalidProgramHeader => write!(f, "invalid program header"),
            Self::InvalidSectionHeader => write!(f, "invalid section header"),
            Self::NoGotSection => write!(f, "no .got section"),
        }
    }
}

/// Spawner errors, one per construction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The binary was not found in the boot module list
    FindModule,
    /// Allocating the process node failed
    ProcAlloc(ProcError),
    /// Creating the child's root cnode failed
    CreateRootCn(KernelCallError),
    /// Creating a foreign L2 cnode failed
    CreateForeignL2(KernelCallError),
    /// Copying a capability into the child failed
    CopyDomainCap(KernelCallError),
    /// Filling the base page cnode failed
    FillBasePageCn(KernelCallError),
    /// Allocating RAM or a frame for the child failed
    FrameAlloc(MmError),
    /// Allocating a parent-side slot failed
    SlotAlloc(SlotAllocError),
    /// Creating the child's L0 vnode failed
    CreateVnode(KernelCallError),
    /// Copying the child's L0 vnode into its page cnode failed
    CopyVnode(KernelCallError),
    /// The module is not a valid ELF image
    ElfMap,
    /// Parsing or loading the ELF failed
    ElfLoad(ElfError),
    /// Mapping a segment or frame into the child failed
    PagingMap(PagingError),
    /// Mapping a frame into the parent failed
    MapToSelf(PagingError),
    /// Creating the dispatcher failed
    CreateDispatcher(KernelCallError),
    /// Creating the init endpoint failed
    EndpointInit(KernelCallError),
    /// The concatenated argv + envp exceed the argument page
    ArgsPageOverflow,
    /// No command line could be derived for the module
    GetCmdlineArgs,
    /// The final dispatcher invocation failed
    MakeRunnable(KernelCallError),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FindModule => write!(f, "module not found"),
            Self::ProcAlloc(e) => write!(f, "proc node alloc: {e}"),
            Self::CreateRootCn(e) => write!(f, "create root cnode: {e}"),
            Self::CreateForeignL2(e) => write!(f, "create foreign L2: {e}"),
            Self::CopyDomainCap(e) => write!(f, "copy domain cap: {e}"),
            Self::FillBasePageCn(e) => write!(f, "fill base page cnode: {e}"),
            Self::FrameAlloc(e) => write!(f, "frame alloc: {e}"),
            Self::SlotAlloc(e) => write!(f, "slot alloc: {e}"),
            Self::CreateVnode(e) => write!(f, "create vnode: {e}"),
            Self::CopyVnode(e) => write!(f, "copy vnode: {e}"),
            Self::ElfMap => write!(f, "not an ELF image"),
            Self::ElfLoad(e) => write!(f, "elf load: {e}"),
            Self::PagingMap(e) => write!(f, "map into child: {e}"),
            Self::MapToSelf(e) => write!(f, "map to self: {e}"),
            Self::CreateDispatcher(e) => write!(f, "create dispatcher: {e}"),
            Self::EndpointInit(e) => write!(f, "endpoint init: {e}"),
            Self::ArgsPageOverflow => write!(f, "argument page overflow"),
            Self::GetCmdlineArgs => write!(f, "no command line"),
            Self::MakeRunnable(e) => write!(f, "make runnable: {e}"),
        }
    }
}

impl SpawnError {
    const fn kind(&self) -> u8 {
        match self {
            Self::FindModule => 0,
            Self::ProcAlloc(_) => 1,
            Self::CreateRootCn(_) => 2,
            Self::CreateForeignL2(_) => 3,
            Self::CopyDomainCap(_) => 4,
            Self::FillBasePageCn(_) => 5,
            Self::FrameAlloc(_) => 6,
            Self::SlotAlloc(_) => 7,
            Self::CreateVnode(_) => 8,
            Self::CopyVnode(_) => 9,
            Self::ElfMap => 10,
            Self::ElfLoad(_) => 11,
            Self::PagingMap(_) => 12,
            Self::MapToSelf(_) => 13,
            Self::CreateDispatcher(_) => 14,
            Self::EndpointInit(_) => 15,
            Self::ArgsPageOverflow => 16,
            Self::GetCmdlineArgs => 17,
            Self::MakeRunnable(_) => 18,
        }
    }
}

/// Error code received from a peer core over URPC.
///
/// Only the flattened 32-bit value survives the wire; the class byte is
/// decoded for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteError(pub u32);

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match (self.0 >> 8) as u8 {
            1 => "kernel",
            2 => "mm",
            3 => "slot alloc",
            4 => "paging",
            5 => "proc",
            6 => "spawn",
            7 => "rpc",
            8 => "ring",
            9 => "fs",
            10 => "terminal",
            _ => "unknown",
        };
        write!(f, "remote {class} error (code {:#06x})", self.0)
    }
}

/// RPC dispatch errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcError {
    /// The payload is too small for the declared message type
    InvalidPayloadSize,
    /// A string payload is not NUL terminated within its size
    NonTerminatedString,
    /// The identifier byte does not name a known request
    UnknownIdentifier,
    /// No handler is installed for this request
    NotImplemented,
    /// The request requires a capability but none was sent
    CapExpected,
    /// The capability type cannot be transferred across cores
    CapRefused,
    /// No URPC link is established to the target core
    LinkNotEstablished,
    /// The target channel cannot accept the message right now; retry
    TargetDisabled,
    /// The reply frame was malformed
    ReplyMalformed,
    /// The peer replied NACK with this error value
    Remote(RemoteError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPayloadSize => write!(f, "invalid payload size"),
            Self::NonTerminatedString => write!(f, "non-terminating string"),
            Self::UnknownIdentifier => write!(f, "unknown identifier"),
            Self::NotImplemented => write!(f, "not implemented"),
            Self::CapExpected => write!(f, "capability expected"),
            Self::CapRefused => write!(f, "capability transfer refused"),
            Self::LinkNotEstablished => write!(f, "no link to core"),
            Self::TargetDisabled => write!(f, "target disabled, retry"),
            Self::ReplyMalformed => write!(f, "malformed reply"),
            Self::Remote(e) => write!(f, "{e}"),
        }
    }
}

impl RpcError {
    const fn kind(&self) -> u8 {
        match self {
            Self::InvalidPayloadSize => 0,
            Self::NonTerminatedString => 1,
            Self::UnknownIdentifier => 2,
            Self::NotImplemented => 3,
            Self::CapExpected => 4,
            Self::CapRefused => 5,
            Self::LinkNotEstablished => 6,
            Self::TargetDisabled => 7,
            Self::ReplyMalformed => 8,
            Self::Remote(_) => 9,
        }
    }
}

/// Ring buffer errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The ring holds no free cell
    Full,
    /// The ring holds no pending cell
    Empty,
    /// The backing buffer is not page aligned
    Unaligned,
}

impl RingError {
    /// Returns a string representation of the ring error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "ring full",
            Self::Empty => "ring empty",
            Self::Unaligned => "buffer not page aligned",
        }
    }

    const fn kind(&self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Empty => 1,
            Self::Unaligned => 2,
        }
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filesystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The boot parameter block is malformed
    InvalidBpb,
    /// Reading a block from the device failed
    BlockRead,
    /// Writing a block to the device failed
    BlockWrite,
    /// The path does not exist
    NotFound,
    /// A path component is not a directory
    NotDir,
    /// The entry is a directory where a file was expected
    NotFile,
    /// The name is not a valid 8.3 short name
    IllegalName,
    /// No free cluster remains on the volume
    DiskFull,
    /// A position is past the end of the cluster chain
    IndexBounds,
    /// The FAT chain contains a bad cluster marker
    BadCluster,
    /// The directory is not empty
    NotEmpty,
    /// The root directory cannot be deleted
    RootDelete,
    /// End of file
    Eof,
}

impl FsError {
    /// Returns a string representation of the filesystem error.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidBpb => "invalid boot parameter block",
            Self::BlockRead => "block read failed",
            Self::BlockWrite => "block write failed",
            Self::NotFound => "not found",
            Self::NotDir => "not a directory",
            Self::NotFile => "not a file",
            Self::IllegalName => "illegal short name",
            Self::DiskFull => "disk full",
            Self::IndexBounds => "position out of bounds",
            Self::BadCluster => "bad cluster in chain",
            Self::NotEmpty => "directory not empty",
            Self::RootDelete => "cannot delete root",
            Self::Eof => "end of file",
        }
    }

    const fn kind(&self) -> u8 {
        match self {
            Self::InvalidBpb => 0,
            Self::BlockRead => 1,
            Self::BlockWrite => 2,
            Self::NotFound => 3,
            Self::NotDir => 4,
            Self::NotFile => 5,
            Self::IllegalName => 6,
            Self::DiskFull => 7,
            Self::IndexBounds => 8,
            Self::BadCluster => 9,
            Self::NotEmpty => 10,
            Self::RootDelete => 11,
            Self::Eof => 12,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalError {
    /// Another state token currently owns stdin
    InUse,
    /// No character is pending
    NoInput,
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InUse => write!(f, "terminal in use"),
            Self::NoInput => write!(f, "no input pending"),
        }
    }
}

impl TerminalError {
    const fn kind(&self) -> u8 {
        match self {
            Self::InUse => 0,
            Self::NoInput => 1,
        }
    }
}

impl From<KernelCallError> for RuntimeError {
    fn from(err: KernelCallError) -> Self {
        Self::Kernel(err)
    }
}

impl From<MmError> for RuntimeError {
    fn from(err: MmError) -> Self {
        Self::Mm(err)
    }
}

impl From<SlotAllocError> for RuntimeError {
    fn from(err: SlotAllocError) -> Self {
        Self::SlotAlloc(err)
    }
}

impl From<PagingError> for RuntimeError {
    fn from(err: PagingError) -> Self {
        Self::Paging(err)
    }
}

impl From<ProcError> for RuntimeError {
    fn from(err: ProcError) -> Self {
        Self::Proc(err)
    }
}

impl From<SpawnError> for RuntimeError {
    fn from(err: SpawnError) -> Self {
        Self::Spawn(err)
    }
}

impl From<RpcError> for RuntimeError {
    fn from(err: RpcError) -> Self {
        Self::Rpc(err)
    }
}

impl From<RingError> for RuntimeError {
    fn from(err: RingError) -> Self {
        Self::Ring(err)
    }
}

impl From<FsError> for RuntimeError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<TerminalError> for RuntimeError {
    fn from(err: TerminalError) -> Self {
        Self::Terminal(err)
    }
}

impl From<SlotAllocError> for PagingError {
    fn from(err: SlotAllocError) -> Self {
        Self::SlotAlloc(err)
    }
}

impl From<ElfError> for SpawnError {
    fn from(err: ElfError) -> Self {
        Self::ElfLoad(err)
    }
}

impl RuntimeError {
    /// Flatten the error into a 32-bit wire code: `class << 8 | kind`.
    ///
    /// Nested context below one level is not representable on the wire; the
    /// local `Display` output keeps the full stack.
    #[must_use]
    pub const fn code(&self) -> u32 {
        let (class, kind) = match self {
            Self::Kernel(e) => (1u32, e.kind()),
            Self::Mm(e) => (2, e.kind()),
            Self::SlotAlloc(e) => (3, e.kind()),
            Self::Paging(e) => (4, e.kind()),
            Self::Proc(e) => (5, e.kind()),
            Self::Spawn(e) => (6, e.kind()),
            Self::Rpc(e) => (7, e.kind()),
            Self::Ring(e) => (8, e.kind()),
            Self::Fs(e) => (9, e.kind()),
            Self::Terminal(e) => (10, e.kind()),
        };
        (class << 8) | kind as u32
    }

    /// True for transient conditions the caller should retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(RpcError::TargetDisabled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_stack() {
        let err = RuntimeError::Spawn(SpawnError::PagingMap(PagingError::VnodeMap(
            KernelCallError::SlotInUse,
        )));
        let text = alloc::format!("{err}");
        assert!(text.contains("spawn"));
        assert!(text.contains("map into child"));
        assert!(text.contains("vnode map"));
        assert!(text.contains("slot in use"));
    }

    #[test]
    fn test_error_conversions() {
        let mm_err = MmError::NoMemory;
        let rt: RuntimeError = mm_err.into();
        assert!(matches!(rt, RuntimeError::Mm(MmError::NoMemory)));

        let pe: PagingError = SlotAllocError::SlotEmpty.into();
        assert!(matches!(pe, PagingError::SlotAlloc(SlotAllocError::SlotEmpty)));
    }

    #[test]
    fn test_wire_codes_are_distinct() {
        let a = RuntimeError::Mm(MmError::NoMemory).code();
        let b = RuntimeError::Mm(MmError::PoolExhausted).code();
        let c = RuntimeError::SlotAlloc(SlotAllocError::SlotEmpty).code();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a >> 8, b >> 8);
    }

    #[test]
    fn test_remote_error_display() {
        let code = RuntimeError::Mm(MmError::NoMemory).code();
        let remote = RemoteError(code);
        let text = alloc::format!("{remote}");
        assert!(text.contains("remote mm error"));
    }
}
