//! Allocation Event (§3): the fixed-header-plus-payload struct produced
//! by the hook and handed to the `on_event` callback. The stack payload
//! is a fixed-size inline array rather than a `Vec` — capturing it must
//! not allocate, and this is also what lets each producer ring hold
//! events inline with no per-push heap traffic.

use crate::config::MAX_STACK_CAPTURE_BYTES;
use crate::context::REG_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Alloc,
    Free,
}

#[derive(Clone)]
pub struct AllocationEvent {
    pub kind: EventKind,
    pub tid: u32,
    pub addr: u64,
    pub size: u64,
    pub period: u64,
    pub regs: [u64; REG_COUNT],
    pub stack_len: u32,
    pub stack: [u8; MAX_STACK_CAPTURE_BYTES],
}

impl AllocationEvent {
    /// An `Alloc` event with a captured stack prefix.
    pub fn alloc(
        tid: u32,
        addr: u64,
        size: u64,
        period: u64,
        regs: [u64; REG_COUNT],
        stack: &[u8],
    ) -> Self {
        let mut buf = [0u8; MAX_STACK_CAPTURE_BYTES];
        let len = stack.len().min(buf.len());
        buf[..len].copy_from_slice(&stack[..len]);
        AllocationEvent {
            kind: EventKind::Alloc,
            tid,
            addr,
            size,
            period,
            regs,
            stack_len: len as u32,
            stack: buf,
        }
    }

    /// A `Free` event. §4.F's free path never captures context — only
    /// the address is needed to correlate with a prior `Alloc`.
    pub fn free(tid: u32, addr: u64, period: u64) -> Self {
        AllocationEvent {
            kind: EventKind::Free,
            tid,
            addr,
            size: 0,
            period,
            regs: [0; REG_COUNT],
            stack_len: 0,
            stack: [0u8; MAX_STACK_CAPTURE_BYTES],
        }
    }

    pub fn stack(&self) -> &[u8] {
        &self.stack[..self.stack_len as usize]
    }
}

impl std::fmt::Debug for AllocationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEvent")
            .field("kind", &self.kind)
            .field("tid", &self.tid)
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("period", &self.period)
            .field("stack_len", &self.stack_len)
            .finish()
    }
}
