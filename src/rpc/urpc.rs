// src/rpc/urpc.rs
//! Inter-core RPC link over a shared frame.
//!
//! The frame holds two contiguous page-sized regions, one ring buffer per
//! direction. A call writes `(identifier byte ‖ payload)` into the outgoing
//! ring and blocks on the incoming ring for the reply; replies are matched
//! positionally to the most recent outstanding request, not by correlation
//! id, so concurrent calls in both directions on one link can deadlock
//! (known open issue).

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::constants::BASE_PAGE_SIZE;
use crate::errors::{RemoteError, RingError, RpcError};
use crate::ringbuffer::{RingBuffer, RingConsumer, RingProducer};
use crate::rpc::RpcIdentifier;

/// Size of one direction's shared region.
pub const URPC_SHARED_FRAME_SIZE: usize = BASE_PAGE_SIZE;

/// Size of the whole bidirectional URPC frame.
pub const URPC_FRAME_SIZE: usize = 2 * URPC_SHARED_FRAME_SIZE;

/// One direction-pair link to a peer core.
pub struct UrpcLink {
    send: RingProducer,
    recv: RingConsumer,
}

impl UrpcLink {
    /// Build a link over a mapped URPC frame.
    ///
    /// `first_half_send` selects which half carries this side's outgoing
    /// messages; the peer must use the opposite value. When `initialize` is
    /// set, both rings are reset (exactly one side does this).
    ///
    /// # Safety
    ///
    /// `base` must point to `URPC_FRAME_SIZE` bytes of shared writable
    /// memory, page aligned, outliving the link.
    pub unsafe fn from_frame(
        base: NonNull<u8>,
        first_half_send: bool,
        initialize: bool,
    ) -> Result<Self, RingError> {
        // SAFETY: second half is within the frame per the contract
        let second = unsafe { NonNull::new_unchecked(base.as_ptr().add(URPC_SHARED_FRAME_SIZE)) };
        let (send_buf, recv_buf) = if first_half_send {
            (base, second)
        } else {
            (second, base)
        };
        // SAFETY: forwarded contract
        let (send, recv) = unsafe {
            if initialize {
                (RingBuffer::init(send_buf)?, RingBuffer::init(recv_buf)?)
            } else {
                (RingBuffer::attach(send_buf)?, RingBuffer::attach(recv_buf)?)
            }
        };
        Ok(Self {
            send: RingProducer::new(send),
            recv: RingConsumer::new(recv),
        })
    }

    /// Issue a call and block for the reply.
    pub fn call(&self, ident: RpcIdentifier, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.send_request(ident, payload)?;
        self.recv_reply()
    }

    /// Send `(identifier ‖ payload)` without waiting for a reply.
    pub fn send_request(&self, ident: RpcIdentifier, payload: &[u8]) -> Result<(), RpcError> {
        let mut msg = Vec::with_capacity(1 + payload.len());
        msg.push(ident as u8);
        msg.extend_from_slice(payload);
        self.send
            .transmit(&msg)
            .map_err(|_| RpcError::LinkNotEstablished)
    }

    /// Block for an ACK/NACK reply.
    pub fn recv_reply(&self) -> Result<Vec<u8>, RpcError> {
        let reply = self.recv.recv().map_err(|_| RpcError::ReplyMalformed)?;
        match reply.first().copied() {
            Some(b) if b == RpcIdentifier::Ack as u8 => Ok(reply[1..].to_vec()),
            Some(b) if b == RpcIdentifier::Nack as u8 => {
                let code = super::read_u32(&reply, 1).map_err(|_| RpcError::ReplyMalformed)?;
                Err(RpcError::Remote(RemoteError(code)))
            }
            _ => Err(RpcError::ReplyMalformed),
        }
    }

    /// Fetch one incoming request if a message is pending.
    pub fn try_recv_request(&self) -> Option<Vec<u8>> {
        if self.recv.has_data() {
            self.recv.recv().ok()
        } else {
            None
        }
    }

    /// Reply ACK with a payload.
    pub fn reply_ack(&self, payload: &[u8]) -> Result<(), RpcError> {
        let mut msg = Vec::with_capacity(1 + payload.len());
        msg.push(RpcIdentifier::Ack as u8);
        msg.extend_from_slice(payload);
        self.send
            .transmit(&msg)
            .map_err(|_| RpcError::LinkNotEstablished)
    }

    /// Reply NACK with a flattened error code.
    pub fn reply_nack(&self, code: u32) -> Result<(), RpcError> {
        let mut msg = Vec::with_capacity(5);
        msg.push(RpcIdentifier::Nack as u8);
        msg.extend_from_slice(&code.to_le_bytes());
        self.send
            .transmit(&msg)
            .map_err(|_| RpcError::LinkNotEstablished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    struct FrameBuf {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl FrameBuf {
        fn new() -> Self {
            let layout = Layout::from_size_align(URPC_FRAME_SIZE, BASE_PAGE_SIZE).unwrap();
            let raw = unsafe { std::alloc::alloc_zeroed(layout) };
            Self {
                ptr: NonNull::new(raw).unwrap(),
                layout,
            }
        }
    }

    impl Drop for FrameBuf {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_request_reply_over_link_pair() {
        let frame = FrameBuf::new();
        let a = unsafe { UrpcLink::from_frame(frame.ptr, true, true) }.unwrap();
        let b = unsafe { UrpcLink::from_frame(frame.ptr, false, false) }.unwrap();

        a.send_request(RpcIdentifier::Num, &42u64.to_le_bytes())
            .unwrap();
        let req = b.try_recv_request().unwrap();
        assert_eq!(req[0], RpcIdentifier::Num as u8);
        assert_eq!(&req[1..], &42u64.to_le_bytes()[..]);

        b.reply_ack(b"pong").unwrap();
        assert_eq!(a.recv_reply().unwrap(), b"pong");
    }

    #[test]
    fn test_nack_carries_error_code() {
        let frame = FrameBuf::new();
        let a = unsafe { UrpcLink::from_frame(frame.ptr, true, true) }.unwrap();
        let b = unsafe { UrpcLink::from_frame(frame.ptr, false, false) }.unwrap();

        a.send_request(RpcIdentifier::Str, b"x\0").unwrap();
        let _req = b.try_recv_request().unwrap();
        b.reply_nack(0x0200).unwrap();

        match a.recv_reply() {
            Err(RpcError::Remote(RemoteError(code))) => assert_eq!(code, 0x0200),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn test_no_pending_request() {
        let frame = FrameBuf::new();
        let a = unsafe { UrpcLink::from_frame(frame.ptr, true, true) }.unwrap();
        assert!(a.try_recv_request().is_none());
    }
}
