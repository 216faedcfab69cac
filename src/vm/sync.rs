//! Object monitors.
//!
//! Monitors are inflated on first use and kept in a table keyed by the
//! object address. Entering is a blocking, recursive acquire; the thread
//! is marked `Blocked` while it waits so a safepoint does not wait for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use super::oop::Oop;
use super::thread::{JavaThread, ThreadState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MonitorState {
    owner: usize,
    recursions: u32,
}

/// Exiting a monitor the thread does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalMonitorState;

#[derive(Default)]
pub struct ObjectSynchronizer {
    monitors: Mutex<HashMap<usize, MonitorState>>,
    released: Condvar,
    enters: AtomicU64,
    exits: AtomicU64,
}

impl ObjectSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, thread: &JavaThread, obj: Oop) {
        let me = thread.id();
        let mut monitors = self.monitors.lock();
        loop {
            match monitors.get_mut(&obj.raw()) {
                None => {
                    monitors.insert(
                        obj.raw(),
                        MonitorState {
                            owner: me,
                            recursions: 0,
                        },
                    );
                    break;
                }
                Some(m) if m.owner == me => {
                    m.recursions += 1;
                    break;
                }
                Some(_) => {
                    let previous = thread.state();
                    thread.set_state(ThreadState::Blocked);
                    log::trace!("thread {} blocks on monitor of {}", me, obj);
                    self.released.wait(&mut monitors);
                    thread.set_state(previous);
                }
            }
        }
        self.enters.fetch_add(1, Ordering::Relaxed);
    }

    pub fn exit(&self, thread: &JavaThread, obj: Oop) -> Result<(), IllegalMonitorState> {
        let mut monitors = self.monitors.lock();
        let m = monitors
            .get_mut(&obj.raw())
            .filter(|m| m.owner == thread.id())
            .ok_or(IllegalMonitorState)?;
        if m.recursions > 0 {
            m.recursions -= 1;
        } else {
            monitors.remove(&obj.raw());
            self.released.notify_all();
        }
        self.exits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn owner_of(&self, obj: Oop) -> Option<usize> {
        self.monitors.lock().get(&obj.raw()).map(|m| m.owner)
    }

    pub fn holds_lock(&self, thread: &JavaThread, obj: Oop) -> bool {
        self.owner_of(obj) == Some(thread.id())
    }

    pub fn enter_count(&self) -> u64 {
        self.enters.load(Ordering::Relaxed)
    }

    pub fn exit_count(&self) -> u64 {
        self.exits.load(Ordering::Relaxed)
    }
}
