// src/process/mod.rs
//! Process table.
//!
//! Each spawned domain is tracked by a [`ProcNode`] keyed by PID in an
//! ordered map, with a free list of released nodes so PIDs are recycled.
//! A PID encodes its owning core in the high digits
//! (`core * PID_CORE_FACTOR + counter`), which makes every PID globally
//! unique and locally routable.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crossbeam_queue::SegQueue;

use crate::capability::{CapRef, CoreId};
use crate::constants::PID_CORE_FACTOR;
use crate::errors::{ProcError, RpcError};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    /// Construct from a raw value (e.g. off the wire).
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The core this PID belongs to.
    #[must_use]
    pub const fn core(self) -> CoreId {
        (self.0 / PID_CORE_FACTOR) as CoreId
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state of an LMP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the peer's endpoint capability
    BindWait,
    /// Bound in both directions
    Connected,
}

/// Local (same-core) message channel to a child.
pub struct LmpChannel {
    /// Connection state; starts in `BindWait` until the child binds back
    pub state: ConnState,
    /// Our endpoint capability, installed into the child's task cnode
    pub local_ep: Option<CapRef>,
    /// Whether the receive closure is registered with the waitset
    pub recv_registered: bool,
    /// Capabilities delivered to the child but not yet fetched
    pending_caps: SegQueue<CapRef>,
}

impl Default for LmpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl LmpChannel {
    /// Create an unbound channel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnState::BindWait,
            local_ep: None,
            recv_registered: false,
            pending_caps: SegQueue::new(),
        }
    }

    /// Queue a capability for delivery; non-blocking.
    ///
    /// Fails with a transient error while the channel is still binding so
    /// the caller can retry.
    pub fn put_cap(&self, cap: CapRef) -> Result<(), RpcError> {
        if self.state != ConnState::Connected {
            return Err(RpcError::TargetDisabled);
        }
        self.pending_caps.push(cap);
        Ok(())
    }

    /// Fetch the next delivered capability, if any.
    pub fn take_cap(&self) -> Option<CapRef> {
        self.pending_caps.pop()
    }

    /// Number of capabilities waiting to be fetched.
    #[must_use]
    pub fn pending_cap_count(&self) -> usize {
        self.pending_caps.len()
    }
}

/// One tracked process.
pub struct ProcNode {
    pid: Pid,
    /// Binary name, truncated to the dispatcher name length
    pub name: String,
    /// The child's dispatcher capability, held in the parent
    pub dispatcher: Option<CapRef>,
    /// RPC channel to the child
    pub chan: LmpChannel,
    /// A cap-receive is in flight on the channel
    pub accepting_cap: bool,
}

impl ProcNode {
    /// The node's PID.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

/// Per-core process table.
pub struct ProcTable {
    core: CoreId,
    running: BTreeMap<Pid, ProcNode>,
    free_list: Vec<ProcNode>,
    pid_upper: u32,
}

impl ProcTable {
    /// Create an empty table for `core`.
    #[must_use]
    pub fn new(core: CoreId) -> Self {
        Self {
            core,
            running: BTreeMap::new(),
            free_list: Vec::new(),
            pid_upper: 1,
        }
    }

    /// Number of running processes.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Allocate a process node.
    ///
    /// A node from the free list keeps its previous PID; otherwise a fresh
    /// PID is minted until the per-core counter is exhausted.
    pub fn alloc(&mut self) -> Result<&mut ProcNode, ProcError> {
        let node = match self.free_list.pop() {
            Some(mut node) => {
                node.chan = LmpChannel::new();
                node.accepting_cap = false;
                node
            }
            None => {
                if self.pid_upper == PID_CORE_FACTOR {
                    return Err(ProcError::NoAvailablePid);
                }
                let pid = Pid(self.pid_upper + u32::from(self.core) * PID_CORE_FACTOR);
                self.pid_upper += 1;
                ProcNode {
                    pid,
                    name: String::new(),
                    dispatcher: None,
                    chan: LmpChannel::new(),
                    accepting_cap: false,
                }
            }
        };
        let pid = node.pid;
        self.running.insert(pid, node);
        Ok(self.running.get_mut(&pid).expect("just inserted"))
    }

    /// Remove a process, clearing its name and dispatcher, and park the
    /// node on the free list for PID reuse.
    pub fn delete(&mut self, pid: Pid) -> Result<(), ProcError> {
        let mut node = self.running.remove(&pid).ok_or(ProcError::PidNotFound)?;
        node.name.clear();
        node.dispatcher = None;
        self.free_list.push(node);
        Ok(())
    }

    /// Look up a running process.
    pub fn get(&self, pid: Pid) -> Result<&ProcNode, ProcError> {
        self.running.get(&pid).ok_or(ProcError::PidNotFound)
    }

    /// Look up a running process mutably.
    pub fn get_mut(&mut self, pid: Pid) -> Result<&mut ProcNode, ProcError> {
        self.running.get_mut(&pid).ok_or(ProcError::PidNotFound)
    }

    /// All running PIDs, in order.
    #[must_use]
    pub fn all_pids(&self) -> Vec<Pid> {
        self.running.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CNodeLevel, CNodeRef};

    #[test]
    fn test_pid_core_round_trip() {
        for core in 0..4u8 {
            let mut table = ProcTable::new(core);
            let pid = table.alloc().unwrap().pid();
            assert_eq!(pid.core(), core);
        }
    }

    #[test]
    fn test_first_pids_per_core() {
        let mut t0 = ProcTable::new(0);
        assert_eq!(t0.alloc().unwrap().pid().raw(), 1);
        let mut t1 = ProcTable::new(1);
        assert_eq!(t1.alloc().unwrap().pid().raw(), 10_000_001);
    }

    #[test]
    fn test_free_list_reuses_pid() {
        let mut table = ProcTable::new(0);
        let a = table.alloc().unwrap().pid();
        let b = table.alloc().unwrap().pid();
        assert_ne!(a, b);

        table.delete(a).unwrap();
        assert_eq!(table.running_count(), 1);

        // The released node comes back with its old PID.
        let c = table.alloc().unwrap().pid();
        assert_eq!(c, a);
        assert_eq!(table.running_count(), 2);

        // And it is handed out at most once.
        let d = table.alloc().unwrap().pid();
        assert_ne!(d, a);
        assert_ne!(d, b);
    }

    #[test]
    fn test_running_count_matches_tree() {
        let mut table = ProcTable::new(0);
        let mut pids = Vec::new();
        for _ in 0..10 {
            pids.push(table.alloc().unwrap().pid());
        }
        assert_eq!(table.running_count(), table.all_pids().len());

        for pid in pids.iter().take(5) {
            table.delete(*pid).unwrap();
        }
        assert_eq!(table.running_count(), 5);
        assert_eq!(table.running_count(), table.all_pids().len());
    }

    #[test]
    fn test_all_pids_in_order() {
        let mut table = ProcTable::new(0);
        for _ in 0..8 {
            table.alloc().unwrap();
        }
        let pids = table.all_pids();
        assert!(pids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_lookup_missing() {
        let mut table = ProcTable::new(0);
        assert!(matches!(
            table.get(Pid::from_raw(42)),
            Err(ProcError::PidNotFound)
        ));
        assert!(matches!(
            table.delete(Pid::from_raw(42)),
            Err(ProcError::PidNotFound)
        ));
    }

    #[test]
    fn test_channel_cap_queue() {
        let cn = CNodeRef {
            croot: 1,
            address: 9,
            level: CNodeLevel::Other,
        };
        let mut chan = LmpChannel::new();
        assert!(matches!(
            chan.put_cap(CapRef::at(cn, 1)),
            Err(RpcError::TargetDisabled)
        ));

        chan.state = ConnState::Connected;
        chan.put_cap(CapRef::at(cn, 1)).unwrap();
        chan.put_cap(CapRef::at(cn, 2)).unwrap();
        assert_eq!(chan.pending_cap_count(), 2);
        assert_eq!(chan.take_cap().unwrap().slot, 1);
        assert_eq!(chan.take_cap().unwrap().slot, 2);
        assert!(chan.take_cap().is_none());
    }
}
