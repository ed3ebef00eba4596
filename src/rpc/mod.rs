// src/rpc/mod.rs
//! RPC identifiers and wire formats.
//!
//! Every request starts with a one-byte identifier; the payload layout is
//! per-request and encoded little endian by hand (the transport treats it
//! as opaque bytes). Replies start with [`RpcIdentifier::Ack`] or
//! [`RpcIdentifier::Nack`]; a NACK carries the 32-bit flattened error.

pub mod dispatch;
pub mod urpc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::capability::{CapType, CoreId};
use crate::errors::RpcError;
use crate::process::Pid;

/// Closed set of request identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcIdentifier {
    /// Positive reply
    Ack = 0,
    /// Negative reply carrying an error code
    Nack = 1,
    /// Deliver a capability to a process
    TransferCap = 2,
    /// Send a number (diagnostics)
    Num = 3,
    /// Send a string (diagnostics)
    Str = 4,
    /// Allocate RAM
    RamRequest = 5,
    /// Spawn a process on a given core
    ProcessSpawn = 6,
    /// Spawn with inherited terminal state
    ProcessSpawnWithStdin = 7,
    /// Name of a PID
    ProcessGetName = 8,
    /// All PIDs across cores
    ProcessGetAllPids = 9,
    TerminalGetChar = 10,
    TerminalPutChar = 11,
    TerminalGets = 12,
    TerminalPuts = 13,
    TerminalAcquire = 14,
    TerminalRelease = 15,
    TerminalHasStdin = 16,
    RegisterNameserver = 17,
    BindNameserver = 18,
    /// Internal: establish a URPC link from a frame identity
    BindCoreUrpc = 19,
    /// Internal: RAM request escalated to core 0
    RemoteRamRequest = 20,
    /// Internal: serialized capability delivery
    RemoteCapTransfer = 21,
    /// Internal: nameserver bind forwarded to core 0
    RemoteBindNameserver = 22,
    /// Internal: PIDs of one core
    GetLocalPids = 23,
}

impl RpcIdentifier {
    /// Decode an identifier byte.
    #[must_use]
    pub const fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => Self::Ack,
            1 => Self::Nack,
            2 => Self::TransferCap,
            3 => Self::Num,
            4 => Self::Str,
            5 => Self::RamRequest,
            6 => Self::ProcessSpawn,
            7 => Self::ProcessSpawnWithStdin,
            8 => Self::ProcessGetName,
            9 => Self::ProcessGetAllPids,
            10 => Self::TerminalGetChar,
            11 => Self::TerminalPutChar,
            12 => Self::TerminalGets,
            13 => Self::TerminalPuts,
            14 => Self::TerminalAcquire,
            15 => Self::TerminalRelease,
            16 => Self::TerminalHasStdin,
            17 => Self::RegisterNameserver,
            18 => Self::BindNameserver,
            19 => Self::BindCoreUrpc,
            20 => Self::RemoteRamRequest,
            21 => Self::RemoteCapTransfer,
            22 => Self::RemoteBindNameserver,
            23 => Self::GetLocalPids,
            _ => return None,
        })
    }
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> Result<u32, RpcError> {
    let bytes = buf
        .get(off..off + 4)
        .ok_or(RpcError::InvalidPayloadSize)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> Result<u64, RpcError> {
    let bytes = buf
        .get(off..off + 8)
        .ok_or(RpcError::InvalidPayloadSize)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Verify a string payload terminates within its size.
pub(crate) fn payload_str(buf: &[u8]) -> Result<&str, RpcError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(RpcError::NonTerminatedString)?;
    core::str::from_utf8(&buf[..nul]).map_err(|_| RpcError::NonTerminatedString)
}

/// RAM allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRequestMsg {
    pub size: u64,
    pub align: u64,
}

impl RamRequestMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.align.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        Ok(Self {
            size: read_u64(buf, 0)?,
            align: read_u64(buf, 8)?,
        })
    }
}

/// Serialized RAM identity handed back by a remote allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamReplyMsg {
    pub base: u64,
    pub bytes: u64,
}

impl RamReplyMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&self.base.to_le_bytes());
        buf.extend_from_slice(&self.bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        Ok(Self {
            base: read_u64(buf, 0)?,
            bytes: read_u64(buf, 8)?,
        })
    }
}

/// Process spawn request: target core plus command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnMsg {
    pub core: CoreId,
    pub terminal_state: u64,
    pub cmdline: String,
}

impl SpawnMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9 + self.cmdline.len() + 1);
        buf.push(self.core);
        buf.extend_from_slice(&self.terminal_state.to_le_bytes());
        buf.extend_from_slice(self.cmdline.as_bytes());
        buf.push(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() < 10 {
            return Err(RpcError::InvalidPayloadSize);
        }
        let core = buf[0];
        let terminal_state = read_u64(buf, 1)?;
        let cmdline = payload_str(&buf[9..])?.into();
        Ok(Self {
            core,
            terminal_state,
            cmdline,
        })
    }
}

/// Serialized capability identity, routed to the PID's core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapIdentityMsg {
    pub pid: Pid,
    pub ctype: CapType,
    pub base: u64,
    pub bytes: u64,
}

impl CapIdentityMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21);
        buf.extend_from_slice(&self.pid.raw().to_le_bytes());
        buf.push(self.ctype.wire_code());
        buf.extend_from_slice(&self.base.to_le_bytes());
        buf.extend_from_slice(&self.bytes.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        Ok(Self {
            pid: Pid::from_raw(read_u32(buf, 0)?),
            ctype: CapType::from_wire_code(*buf.get(4).ok_or(RpcError::InvalidPayloadSize)?),
            base: read_u64(buf, 5)?,
            bytes: read_u64(buf, 13)?,
        })
    }
}

/// URPC link establishment: peer core and shared frame identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindCoreUrpcMsg {
    pub core: CoreId,
    pub base: u64,
    pub bytes: u64,
    pub listener_first: bool,
}

impl BindCoreUrpcMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18);
        buf.push(self.core);
        buf.extend_from_slice(&self.base.to_le_bytes());
        buf.extend_from_slice(&self.bytes.to_le_bytes());
        buf.push(u8::from(self.listener_first));
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() < 18 {
            return Err(RpcError::InvalidPayloadSize);
        }
        Ok(Self {
            core: buf[0],
            base: read_u64(buf, 1)?,
            bytes: read_u64(buf, 9)?,
            listener_first: buf[17] != 0,
        })
    }
}

/// PID list reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidListMsg {
    pub pids: Vec<Pid>,
}

impl PidListMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.pids.len() * 4);
        buf.extend_from_slice(&(self.pids.len() as u64).to_le_bytes());
        for pid in &self.pids {
            buf.extend_from_slice(&pid.raw().to_le_bytes());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        let count = read_u64(buf, 0)? as usize;
        let mut pids = Vec::with_capacity(count);
        for i in 0..count {
            pids.push(Pid::from_raw(read_u32(buf, 8 + i * 4)?));
        }
        Ok(Self { pids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_round_trip() {
        for raw in 0..=23u8 {
            let ident = RpcIdentifier::from_u8(raw).unwrap();
            assert_eq!(ident as u8, raw);
        }
        assert!(RpcIdentifier::from_u8(200).is_none());
    }

    #[test]
    fn test_spawn_msg_round_trip() {
        let msg = SpawnMsg {
            core: 1,
            terminal_state: 0xDEAD,
            cmdline: "hello AOS".into(),
        };
        assert_eq!(SpawnMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_cap_identity_round_trip() {
        let msg = CapIdentityMsg {
            pid: Pid::from_raw(10_000_002),
            ctype: CapType::Frame,
            base: 0x8000_0000,
            bytes: 0x2000,
        };
        assert_eq!(CapIdentityMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_pid_list_round_trip() {
        let msg = PidListMsg {
            pids: vec![Pid::from_raw(1), Pid::from_raw(10_000_001)],
        };
        assert_eq!(PidListMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_short_payloads_rejected() {
        assert!(matches!(
            RamRequestMsg::decode(&[0u8; 4]),
            Err(RpcError::InvalidPayloadSize)
        ));
        assert!(matches!(
            SpawnMsg::decode(&[0u8; 3]),
            Err(RpcError::InvalidPayloadSize)
        ));
    }

    #[test]
    fn test_non_terminated_string() {
        assert!(matches!(
            payload_str(b"no nul here"),
            Err(RpcError::NonTerminatedString)
        ));
        assert_eq!(payload_str(b"ok\0junk").unwrap(), "ok");
    }
}
