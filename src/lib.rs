// src/lib.rs
//! `aos_init` - userspace init runtime for a capability-based AArch64
//! microkernel.
//!
//! This crate contains the `init`-side system services of the OS: the
//! four-level paging state, the self-refilling slot pre-allocator, the RAM
//! manager, the process table and spawner (ELF loader + address-space
//! constructor), the RPC dispatch layer with its cache-line ring transport,
//! and a FAT32 filesystem over a block device.
//!
//! The kernel syscall surface is abstracted behind the
//! [`capability::KernelInterface`] trait; tests inject a mock kernel and run
//! hosted. All subsystem state is owned by explicit handles (no process-wide
//! singletons), so a fresh runtime can be constructed per test.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod capability;
pub mod constants;
pub mod errors;
pub mod fs;
pub mod mm;
pub mod paging;
pub mod process;
pub mod ringbuffer;
pub mod rpc;
pub mod spawn;
pub mod terminal;

pub use errors::{Result, RuntimeError};
