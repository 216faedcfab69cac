//! Snapshot-at-the-beginning barrier support.
//!
//! While concurrent marking is active, the previous value of every
//! reference store and every referent read through `Reference.get` is
//! logged so the marker sees the heap as it was when marking started.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use super::oop::Oop;

#[derive(Default)]
pub struct SatbBarrier {
    /// Read by generated code before each barriered access.
    marking_active: AtomicU8,
    queue: Mutex<Vec<Oop>>,
}

impl SatbBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marking_active_addr(&self) -> usize {
        &self.marking_active as *const AtomicU8 as usize
    }

    pub fn is_marking(&self) -> bool {
        self.marking_active.load(Ordering::Acquire) != 0
    }

    pub fn set_marking(&self, on: bool) {
        self.marking_active.store(on as u8, Ordering::Release);
        log::debug!("satb: marking {}", if on { "started" } else { "stopped" });
    }

    pub fn enqueue(&self, pre_val: Oop) {
        if !pre_val.is_null() {
            self.queue.lock().push(pre_val);
        }
    }

    /// Take the values logged so far.
    pub fn drain(&self) -> Vec<Oop> {
        std::mem::take(&mut *self.queue.lock())
    }
}
