//! Safepoint synchronization.
//!
//! A safepoint is requested by raising the poll word and switching every
//! interpreter dispatch to the safepoint table. Threads executing Java
//! code notice it at their next bytecode, call into the VM and block
//! there until the requester resumes them. Threads in native code or
//! already blocked count as stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::interpreter::frame::Frame;

use super::Vm;
use super::thread::{JavaThread, ThreadState};

/// Called with the top interpreter frame at every poll while installed.
pub type DebugHook = dyn Fn(&JavaThread, &Frame) + Send + Sync;

#[derive(Default)]
struct SyncState {
    active: bool,
    requester: Option<std::thread::ThreadId>,
}

pub struct SafepointSynchronizer {
    /// Non-zero while a safepoint is being synchronized; read by generated code.
    poll_word: AtomicUsize,
    state: Mutex<SyncState>,
    resumed: Condvar,
    debug_hook: Mutex<Option<Arc<DebugHook>>>,
    single_step: AtomicBool,
    polls: AtomicU64,
    safepoints: AtomicU64,
}

impl Default for SafepointSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SafepointSynchronizer {
    pub fn new() -> Self {
        Self {
            poll_word: AtomicUsize::new(0),
            state: Mutex::new(SyncState::default()),
            resumed: Condvar::new(),
            debug_hook: Mutex::new(None),
            single_step: AtomicBool::new(false),
            polls: AtomicU64::new(0),
            safepoints: AtomicU64::new(0),
        }
    }

    pub fn poll_word_addr(&self) -> usize {
        &self.poll_word as *const AtomicUsize as usize
    }

    pub fn is_synchronizing(&self) -> bool {
        self.poll_word.load(Ordering::Acquire) != 0
    }

    /// Stop every Java thread at a safepoint. The returned scope resumes
    /// them when dropped.
    pub fn synchronize<'a>(&'a self, vm: &'a Vm) -> SafepointScope<'a> {
        {
            let mut state = self.state.lock();
            while state.active {
                self.resumed.wait(&mut state);
            }
            state.active = true;
            state.requester = Some(std::thread::current().id());
        }
        self.poll_word.store(1, Ordering::Release);
        vm.interpreter().notice_safepoints();
        log::debug!("safepoint: synchronizing");
        loop {
            let running = vm
                .threads()
                .iter()
                .filter(|t| matches!(t.state(), ThreadState::InJava | ThreadState::InVm | ThreadState::InNativeTrans))
                .count();
            if running == 0 {
                break;
            }
            let mut state = self.state.lock();
            self.resumed.wait_for(&mut state, Duration::from_millis(1));
        }
        self.safepoints.fetch_add(1, Ordering::Relaxed);
        log::debug!("safepoint: all threads stopped");
        SafepointScope { sync: self, vm }
    }

    fn resume(&self, vm: &Vm) {
        self.poll_word.store(0, Ordering::Release);
        if !self.keeps_safepoint_table() {
            vm.interpreter().ignore_safepoints();
        }
        let mut state = self.state.lock();
        state.active = false;
        state.requester = None;
        self.resumed.notify_all();
        log::debug!("safepoint: resumed");
    }

    /// Block the calling Java thread while a safepoint is in progress.
    pub fn block_if_requested(&self, thread: &JavaThread) {
        if !self.is_synchronizing() {
            return;
        }
        let mut state = self.state.lock();
        if state.requester == Some(std::thread::current().id()) {
            return;
        }
        let previous = thread.state();
        thread.set_state(ThreadState::Blocked);
        while state.active {
            self.resumed.wait(&mut state);
        }
        thread.set_state(previous);
    }

    /// Entered from the safepoint dispatch table.
    pub(crate) fn poll(&self, thread: &JavaThread) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let hook = self.debug_hook.lock().clone();
        if let Some(hook) = hook {
            if let Some(frame) = thread.last_frame() {
                hook(thread, &frame);
            }
        }
        self.block_if_requested(thread);
    }

    pub fn set_debug_hook(&self, vm: &Vm, hook: Option<Arc<DebugHook>>) {
        let installed = hook.is_some();
        *self.debug_hook.lock() = hook;
        if installed {
            vm.interpreter().notice_safepoints();
        } else if !self.keeps_safepoint_table() && !self.is_synchronizing() {
            vm.interpreter().ignore_safepoints();
        }
    }

    /// Keep the safepoint table active so the debug hook sees every bytecode.
    pub fn set_single_step(&self, vm: &Vm, on: bool) {
        self.single_step.store(on, Ordering::Release);
        if on {
            vm.interpreter().notice_safepoints();
        } else if !self.keeps_safepoint_table() && !self.is_synchronizing() {
            vm.interpreter().ignore_safepoints();
        }
    }

    fn keeps_safepoint_table(&self) -> bool {
        self.single_step.load(Ordering::Acquire) || self.debug_hook.lock().is_some()
    }

    /// Safepoint polls taken by interpreted code.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn safepoint_count(&self) -> u64 {
        self.safepoints.load(Ordering::Relaxed)
    }
}

/// All Java threads are stopped while this is alive.
pub struct SafepointScope<'a> {
    sync: &'a SafepointSynchronizer,
    vm: &'a Vm,
}

impl Drop for SafepointScope<'_> {
    fn drop(&mut self) {
        self.sync.resume(self.vm);
    }
}
