//! Interpreter activation frames.
//!
//! ```text
//!        | local 0          |  <- locals (highest address)
//!        | ...              |
//!        | local n-1        |
//!        | return address   |  fp + 8
//! fp ->  | saved fp         |
//!        | sender sp        |  fp - 8
//!        | last sp          |
//!        | method           |
//!        | mirror           |
//!        | mdp              |
//!        | cp cache         |
//!        | locals (rel.)    |
//!        | bcp              |
//!        | monitor blk top  |  fp - 72
//!        | monitors ...     |  16 bytes each: lock word, object
//!        | expression stack |
//! sp ->  | ...              |
//! ```
//!
//! The generator and the stack walker both derive slot offsets from
//! [`LAYOUT`].

use crate::vm::method::Method;
use crate::vm::oop::Oop;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Written by the call instruction
    ReturnAddress,
    SavedFp,
    /// Caller's stack pointer at the call
    SenderSp,
    /// Expression stack pointer while this frame is calling out, else 0
    LastSp,
    Method,
    /// Holder's class mirror; a GC root
    Mirror,
    /// Profile cells of the method data block, 0 when not profiling
    Mdp,
    Cache,
    /// Locals pointer as a word offset from fp
    Locals,
    Bcp,
    /// Monitor block top as a word offset from fp
    MonitorBlockTop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub kind: SlotKind,
    pub name: &'static str,
    /// Slot holds an object reference the collector must visit.
    pub gc_root: bool,
}

/// Fixed part of the frame, highest address first; entry `i` is at
/// `fp + (1 - i) * 8`.
pub const LAYOUT: [FrameSlot; 11] = [
    FrameSlot { kind: SlotKind::ReturnAddress, name: "return address", gc_root: false },
    FrameSlot { kind: SlotKind::SavedFp, name: "saved fp", gc_root: false },
    FrameSlot { kind: SlotKind::SenderSp, name: "sender sp", gc_root: false },
    FrameSlot { kind: SlotKind::LastSp, name: "last sp", gc_root: false },
    FrameSlot { kind: SlotKind::Method, name: "method", gc_root: false },
    FrameSlot { kind: SlotKind::Mirror, name: "mirror", gc_root: true },
    FrameSlot { kind: SlotKind::Mdp, name: "mdp", gc_root: false },
    FrameSlot { kind: SlotKind::Cache, name: "cp cache", gc_root: false },
    FrameSlot { kind: SlotKind::Locals, name: "locals", gc_root: false },
    FrameSlot { kind: SlotKind::Bcp, name: "bcp", gc_root: false },
    FrameSlot { kind: SlotKind::MonitorBlockTop, name: "monitor block top", gc_root: false },
];

/// Word offset of a slot from fp.
pub const fn word_offset(kind: SlotKind) -> i32 {
    let mut i = 0;
    while i < LAYOUT.len() {
        if LAYOUT[i].kind as u8 == kind as u8 {
            return 1 - i as i32;
        }
        i += 1;
    }
    panic!("slot missing from frame layout")
}

/// Byte offset of a slot from fp.
pub const fn offset(kind: SlotKind) -> i32 {
    word_offset(kind) * 8
}

pub const RETURN_ADDRESS: i32 = offset(SlotKind::ReturnAddress);
pub const SENDER_SP: i32 = offset(SlotKind::SenderSp);
pub const LAST_SP: i32 = offset(SlotKind::LastSp);
pub const METHOD: i32 = offset(SlotKind::Method);
pub const MIRROR: i32 = offset(SlotKind::Mirror);
pub const MDP: i32 = offset(SlotKind::Mdp);
pub const CACHE: i32 = offset(SlotKind::Cache);
pub const LOCALS: i32 = offset(SlotKind::Locals);
pub const BCP: i32 = offset(SlotKind::Bcp);
pub const MONITOR_BLOCK_TOP: i32 = offset(SlotKind::MonitorBlockTop);

/// Words between fp and the initial monitor block top.
pub const FIXED_WORDS: i32 = -word_offset(SlotKind::MonitorBlockTop);
/// Relativized monitor block top of a frame with no monitors.
pub const MONITOR_BLOCK_BOTTOM: i32 = word_offset(SlotKind::MonitorBlockTop);

pub const MONITOR_SIZE: i32 = 16;
pub const MONITOR_LOCK_OFFSET: i32 = 0;
pub const MONITOR_OBJ_OFFSET: i32 = 8;
/// Monitor of a synchronized method, the first one allocated.
pub const METHOD_MONITOR: i32 = MONITOR_BLOCK_TOP - MONITOR_SIZE;

/// Words a frame needs beyond locals and expression stack, with the
/// return address and one slot of slack.
pub const OVERHEAD_WORDS: i32 = FIXED_WORDS + 2;

fn read(addr: usize) -> usize {
    // SAFETY: frame addresses come from a live thread stack.
    unsafe { *(addr as *const usize) }
}

/// A view of one interpreter frame on a thread stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    fp: usize,
    sp: usize,
}

impl Frame {
    pub fn new(fp: usize, sp: usize) -> Frame {
        Frame { fp, sp }
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn slot_addr(&self, kind: SlotKind) -> usize {
        (self.fp as isize + offset(kind) as isize) as usize
    }

    pub fn slot(&self, kind: SlotKind) -> usize {
        read(self.slot_addr(kind))
    }

    pub(crate) fn set_slot(&self, kind: SlotKind, value: usize) {
        // SAFETY: as for `read`.
        unsafe { *(self.slot_addr(kind) as *mut usize) = value }
    }

    pub fn method(&self) -> &Method {
        // SAFETY: the method slot of a live frame names a method of a loaded class.
        unsafe { &*(self.slot(SlotKind::Method) as *const Method) }
    }

    pub fn return_address(&self) -> usize {
        self.slot(SlotKind::ReturnAddress)
    }

    pub fn sender_fp(&self) -> usize {
        self.slot(SlotKind::SavedFp)
    }

    pub fn sender_sp(&self) -> usize {
        self.slot(SlotKind::SenderSp)
    }

    pub fn mirror(&self) -> Oop {
        Oop::from_raw(self.slot(SlotKind::Mirror))
    }

    pub fn bcp(&self) -> usize {
        self.slot(SlotKind::Bcp)
    }

    pub(crate) fn set_bcp(&self, bcp: usize) {
        self.set_slot(SlotKind::Bcp, bcp)
    }

    pub fn bci(&self) -> Option<usize> {
        self.method().bci_of(self.bcp())
    }

    /// Address of local 0.
    pub fn locals(&self) -> usize {
        let rel = self.slot(SlotKind::Locals) as isize;
        (self.fp as isize + rel * 8) as usize
    }

    pub fn local_addr(&self, index: usize) -> usize {
        self.locals() - index * 8
    }

    pub fn local(&self, index: usize) -> u64 {
        read(self.local_addr(index)) as u64
    }

    pub fn monitor_block_top(&self) -> usize {
        let rel = self.slot(SlotKind::MonitorBlockTop) as isize;
        (self.fp as isize + rel * 8) as usize
    }

    pub fn monitor_block_bottom(&self) -> usize {
        (self.fp as isize + (MONITOR_BLOCK_BOTTOM * 8) as isize) as usize
    }

    /// Addresses of the monitors in use, most recent first.
    pub fn monitors(&self) -> impl Iterator<Item = usize> + '_ {
        (self.monitor_block_top()..self.monitor_block_bottom())
            .step_by(MONITOR_SIZE as usize)
            .filter(|m| read(m + MONITOR_OBJ_OFFSET as usize) != 0)
    }

    pub fn monitor_objects(&self) -> Vec<Oop> {
        self.monitors()
            .map(|m| Oop::from_raw(read(m + MONITOR_OBJ_OFFSET as usize)))
            .collect()
    }

    /// Expression stack slots, top first.
    pub fn expression_stack(&self) -> Vec<u64> {
        (self.sp..self.monitor_block_top())
            .step_by(8)
            .map(|a| read(a) as u64)
            .collect()
    }

    pub fn expression_stack_depth(&self) -> usize {
        self.monitor_block_top().saturating_sub(self.sp) / 8
    }

    /// Visit the address of every slot that may hold an object reference:
    /// mirror, locals, monitor objects and expression stack.
    pub fn oops_do(&self, mut f: impl FnMut(usize)) {
        for (i, slot) in LAYOUT.iter().enumerate() {
            if slot.gc_root {
                f((self.fp as isize + (1 - i as isize) * 8) as usize);
            }
        }
        let method = self.method();
        let nlocals = if method.is_native() {
            method.size_of_parameters()
        } else {
            method.max_locals()
        };
        for i in 0..nlocals {
            f(self.local_addr(i));
        }
        for m in self.monitors() {
            f(m + MONITOR_OBJ_OFFSET as usize);
        }
        for a in (self.sp..self.monitor_block_top()).step_by(8) {
            f(a);
        }
    }

    /// Check the frame invariants: `sp <= monitor block top <= bottom`,
    /// locals above the fixed part, mirror present.
    pub fn verify(&self) -> Result<(), String> {
        let mbt = self.monitor_block_top();
        if self.sp > mbt {
            return Err(format!("expression stack underflow: sp {:#x} > {:#x}", self.sp, mbt));
        }
        if mbt > self.monitor_block_bottom() {
            return Err(format!("monitor block top {:#x} above its bottom", mbt));
        }
        if (self.monitor_block_bottom() - mbt) % MONITOR_SIZE as usize != 0 {
            return Err("monitor block is not a whole number of monitors".into());
        }
        if self.locals() <= self.fp {
            return Err(format!("locals {:#x} below fp {:#x}", self.locals(), self.fp));
        }
        if self.slot(SlotKind::Method) == 0 {
            return Err("frame without a method".into());
        }
        if self.mirror().is_null() {
            return Err(format!("null mirror in frame of {}", self.method().qualified_name()));
        }
        Ok(())
    }
}

/// Walks the interpreter frames of one thread, youngest first, across
/// nested entry frames.
pub struct FrameWalker {
    segments: Vec<(usize, usize)>,
    current: Option<Frame>,
    entry_return: usize,
}

impl FrameWalker {
    /// `segments` are the `(sp, fp)` anchors of each activation, innermost
    /// first; `entry_return` is the return address into the call stub.
    pub fn new(mut segments: Vec<(usize, usize)>, entry_return: usize) -> Self {
        segments.reverse();
        let mut walker = Self {
            segments,
            current: None,
            entry_return,
        };
        walker.next_segment();
        walker
    }

    fn next_segment(&mut self) {
        self.current = self
            .segments
            .pop()
            .filter(|(_, fp)| *fp != 0)
            .map(|(sp, fp)| Frame::new(fp, sp));
    }
}

impl Iterator for FrameWalker {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let frame = self.current?;
        if frame.return_address() == self.entry_return {
            self.next_segment();
        } else {
            self.current = Some(Frame::new(frame.sender_fp(), frame.sender_sp()));
        }
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_offsets() {
        assert_eq!(RETURN_ADDRESS, 8);
        assert_eq!(offset(SlotKind::SavedFp), 0);
        assert_eq!(SENDER_SP, -8);
        assert_eq!(LAST_SP, -16);
        assert_eq!(METHOD, -24);
        assert_eq!(MIRROR, -32);
        assert_eq!(MDP, -40);
        assert_eq!(CACHE, -48);
        assert_eq!(LOCALS, -56);
        assert_eq!(BCP, -64);
        assert_eq!(MONITOR_BLOCK_TOP, -72);
        assert_eq!(FIXED_WORDS, 9);
        assert_eq!(METHOD_MONITOR, -88);
    }

    #[test]
    fn test_only_mirror_is_a_fixed_root() {
        let roots: Vec<_> = LAYOUT.iter().filter(|s| s.gc_root).map(|s| s.kind).collect();
        assert_eq!(roots, vec![SlotKind::Mirror]);
    }

    #[test]
    fn test_frame_view_over_words() {
        // a fake stack: locals at the top, then the fixed part, two
        // expression stack words
        let mut words = vec![0usize; 32];
        let base = words.as_mut_ptr() as usize;
        let fp = base + 20 * 8;
        let at = |off: i32| ((fp as isize + off as isize) - base as isize) as usize / 8;
        words[at(LOCALS)] = 3usize; // locals at fp + 24
        words[at(MONITOR_BLOCK_TOP)] = (MONITOR_BLOCK_BOTTOM - 2) as isize as usize;
        words[at(MONITOR_BLOCK_TOP - 16 + 8)] = 0x1000;
        words[at(24)] = 77;
        words[at(METHOD)] = 1;
        words[at(MIRROR)] = 0x2000;
        let sp = fp - 13 * 8;
        let frame = Frame::new(fp, sp);
        assert_eq!(frame.locals(), fp + 24);
        assert_eq!(frame.local(0), 77);
        assert_eq!(frame.monitor_block_top(), fp - 88);
        assert_eq!(frame.monitor_objects(), vec![Oop::from_raw(0x1000)]);
        assert_eq!(frame.expression_stack_depth(), 2);
        assert!(frame.verify().is_ok());
        assert!(Frame::new(fp, fp - 80).verify().is_err());
    }
}
