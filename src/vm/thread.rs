//! Java threads.
//!
//! A `JavaThread` is shared between Rust and generated code: the fields at
//! the front are read and written by the interpreter through the
//! [`offsets`] below, so the struct is `repr(C)` and all of them are
//! atomics. Each thread owns its Java stack; interpreter frames are laid
//! out in it directly.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::config::STACK_PAGE_SIZE;
use crate::error::{VmError, VmResult};
use crate::interpreter::frame::Frame;
use crate::interpreter::tos::TosState;

use super::Vm;
use super::deopt::UnpackPlan;
use super::javacalls::JavaValue;
use super::oop::{BasicType, Oop};

/// Thread ID counter for generating unique IDs.
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

fn next_thread_id() -> usize {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    New = 0,
    InNative = 4,
    InNativeTrans = 5,
    InVm = 6,
    InJava = 8,
    Blocked = 10,
}

impl ThreadState {
    fn from_u32(v: u32) -> ThreadState {
        match v {
            4 => ThreadState::InNative,
            5 => ThreadState::InNativeTrans,
            6 => ThreadState::InVm,
            8 => ThreadState::InJava,
            10 => ThreadState::Blocked,
            _ => ThreadState::New,
        }
    }
}

/// Bits of `popframe_condition`.
pub mod popframe {
    pub const INACTIVE: u32 = 0;
    pub const PENDING: u32 = 1;
    pub const PROCESSING: u32 = 2;
    /// The caller must re-execute the invoke with the preserved arguments.
    pub const FORCE_DEOPT_REEXECUTION: u32 = 4;
}

pub mod earlyret {
    pub const INACTIVE: u32 = 0;
    pub const PENDING: u32 = 1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StackGuardState {
    Enabled = 0,
    YellowDisabled = 1,
}

/// Last Java frame, published while the thread is in the VM.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FrameAnchor {
    pub(crate) sp: AtomicUsize,
    pub(crate) fp: AtomicUsize,
    pub(crate) pc: AtomicUsize,
}

/// Environment pointer handed to native methods as their first argument.
#[repr(C)]
#[derive(Debug, Default)]
pub struct JniEnv {
    thread: AtomicUsize,
}

impl JniEnv {
    /// # Safety
    /// `env` must be the argument a native method was called with.
    pub unsafe fn from_raw<'a>(env: usize) -> &'a JniEnv {
        // SAFETY: guaranteed by the caller.
        unsafe { &*(env as *const JniEnv) }
    }

    pub fn thread(&self) -> &JavaThread {
        // SAFETY: set once the thread is allocated; the env lives inside it.
        unsafe { JavaThread::from_raw(self.thread.load(Ordering::Relaxed)) }
    }
}

pub const HANDLE_CAPACITY: usize = 64;

/// Local handles created while a native method runs; reset on return.
#[repr(C)]
pub struct HandleBlock {
    pub(crate) top: AtomicUsize,
    slots: [AtomicUsize; HANDLE_CAPACITY],
}

impl Default for HandleBlock {
    fn default() -> Self {
        Self {
            top: AtomicUsize::new(0),
            slots: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }
}

/// Argument registers filled by the slow signature handler.
#[repr(C)]
#[derive(Default)]
pub struct NativeScratch {
    pub(crate) ints: [AtomicU64; 6],
    pub(crate) floats: [AtomicU64; 8],
}

/// Where the deoptimization stub continues after frames are unpacked.
#[repr(C)]
#[derive(Default)]
pub struct DeoptState {
    pub(crate) fp: AtomicUsize,
    pub(crate) pc: AtomicUsize,
    pub(crate) result: AtomicU64,
}

struct ThreadStack {
    base: *mut u8,
    layout: Layout,
}

impl ThreadStack {
    fn new(size: usize) -> VmResult<ThreadStack> {
        let layout = Layout::from_size_align(size, STACK_PAGE_SIZE)
            .map_err(|e| VmError::Program(format!("bad stack size: {}", e)))?;
        // SAFETY: the layout has non-zero size (validated by the config).
        let base = unsafe { alloc_zeroed(layout) };
        if base.is_null() {
            return Err(VmError::Program(format!("cannot allocate a {} byte stack", size)));
        }
        Ok(ThreadStack { base, layout })
    }

    fn low(&self) -> usize {
        self.base as usize
    }

    fn high(&self) -> usize {
        self.base as usize + self.layout.size()
    }
}

impl Drop for ThreadStack {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base, self.layout) }
    }
}

#[repr(C)]
pub struct JavaThread {
    pub(crate) state: AtomicU32,
    pub(crate) suspend_flags: AtomicU32,
    pub(crate) pending_exception: AtomicUsize,
    pub(crate) vm_result: AtomicUsize,
    pub(crate) anchor: FrameAnchor,
    pub(crate) stack_overflow_limit: AtomicUsize,
    pub(crate) stack_guard_state: AtomicU32,
    pub(crate) do_not_unlock_if_synchronized: AtomicU8,
    pub(crate) interp_only_mode: AtomicU8,
    pub(crate) popframe_condition: AtomicU32,
    pub(crate) earlyret_state: AtomicU32,
    pub(crate) earlyret_tos: AtomicU32,
    pub(crate) earlyret_value: AtomicU64,
    pub(crate) earlyret_oop: AtomicUsize,
    pub(crate) jni_env: JniEnv,
    pub(crate) handles: HandleBlock,
    pub(crate) native_scratch: NativeScratch,
    pub(crate) deopt: DeoptState,
    stack: ThreadStack,
    red_zone: usize,
    yellow_zone: usize,
    shadow_zone: usize,
    vm: *const Vm,
    id: usize,
    name: String,
    /// Anchors of outer activations while a nested Java call runs.
    anchor_stack: Mutex<Vec<[usize; 3]>>,
    popframe_preserved: Mutex<Option<Vec<u64>>>,
    deopt_plan: Mutex<Option<UnpackPlan>>,
}

/// Field offsets used by generated code.
pub mod offsets {
    use super::*;

    pub const STATE: i32 = offset_of!(JavaThread, state) as i32;
    pub const SUSPEND_FLAGS: i32 = offset_of!(JavaThread, suspend_flags) as i32;
    pub const PENDING_EXCEPTION: i32 = offset_of!(JavaThread, pending_exception) as i32;
    pub const VM_RESULT: i32 = offset_of!(JavaThread, vm_result) as i32;
    pub const ANCHOR_SP: i32 = (offset_of!(JavaThread, anchor) + offset_of!(FrameAnchor, sp)) as i32;
    pub const ANCHOR_FP: i32 = (offset_of!(JavaThread, anchor) + offset_of!(FrameAnchor, fp)) as i32;
    pub const ANCHOR_PC: i32 = (offset_of!(JavaThread, anchor) + offset_of!(FrameAnchor, pc)) as i32;
    pub const STACK_OVERFLOW_LIMIT: i32 = offset_of!(JavaThread, stack_overflow_limit) as i32;
    pub const STACK_GUARD_STATE: i32 = offset_of!(JavaThread, stack_guard_state) as i32;
    pub const DO_NOT_UNLOCK_IF_SYNCHRONIZED: i32 = offset_of!(JavaThread, do_not_unlock_if_synchronized) as i32;
    pub const INTERP_ONLY_MODE: i32 = offset_of!(JavaThread, interp_only_mode) as i32;
    pub const POPFRAME_CONDITION: i32 = offset_of!(JavaThread, popframe_condition) as i32;
    pub const EARLYRET_STATE: i32 = offset_of!(JavaThread, earlyret_state) as i32;
    pub const EARLYRET_TOS: i32 = offset_of!(JavaThread, earlyret_tos) as i32;
    pub const EARLYRET_VALUE: i32 = offset_of!(JavaThread, earlyret_value) as i32;
    pub const EARLYRET_OOP: i32 = offset_of!(JavaThread, earlyret_oop) as i32;
    pub const JNI_ENV: i32 = offset_of!(JavaThread, jni_env) as i32;
    pub const HANDLES_TOP: i32 = (offset_of!(JavaThread, handles) + offset_of!(HandleBlock, top)) as i32;
    pub const NATIVE_SCRATCH_INTS: i32 =
        (offset_of!(JavaThread, native_scratch) + offset_of!(NativeScratch, ints)) as i32;
    pub const NATIVE_SCRATCH_FLOATS: i32 =
        (offset_of!(JavaThread, native_scratch) + offset_of!(NativeScratch, floats)) as i32;
    pub const DEOPT_FP: i32 = (offset_of!(JavaThread, deopt) + offset_of!(DeoptState, fp)) as i32;
    pub const DEOPT_PC: i32 = (offset_of!(JavaThread, deopt) + offset_of!(DeoptState, pc)) as i32;
    pub const DEOPT_RESULT: i32 = (offset_of!(JavaThread, deopt) + offset_of!(DeoptState, result)) as i32;
}

impl JavaThread {
    pub(crate) fn new(vm: &Vm, name: &str) -> VmResult<Arc<JavaThread>> {
        let config = vm.config();
        let stack = ThreadStack::new(config.stack_size)?;
        let red_zone = config.stack_red_pages * STACK_PAGE_SIZE;
        let yellow_zone = config.stack_yellow_pages * STACK_PAGE_SIZE;
        let shadow_zone = config.stack_shadow_pages * STACK_PAGE_SIZE;
        let limit = stack.low() + red_zone + yellow_zone + shadow_zone;
        let thread = Arc::new(JavaThread {
            state: AtomicU32::new(ThreadState::New as u32),
            suspend_flags: AtomicU32::new(0),
            pending_exception: AtomicUsize::new(0),
            vm_result: AtomicUsize::new(0),
            anchor: FrameAnchor::default(),
            stack_overflow_limit: AtomicUsize::new(limit),
            stack_guard_state: AtomicU32::new(StackGuardState::Enabled as u32),
            do_not_unlock_if_synchronized: AtomicU8::new(0),
            interp_only_mode: AtomicU8::new(0),
            popframe_condition: AtomicU32::new(popframe::INACTIVE),
            earlyret_state: AtomicU32::new(earlyret::INACTIVE),
            earlyret_tos: AtomicU32::new(TosState::Vtos as u32),
            earlyret_value: AtomicU64::new(0),
            earlyret_oop: AtomicUsize::new(0),
            jni_env: JniEnv::default(),
            handles: HandleBlock::default(),
            native_scratch: NativeScratch::default(),
            deopt: DeoptState::default(),
            stack,
            red_zone,
            yellow_zone,
            shadow_zone,
            vm: vm as *const Vm,
            id: next_thread_id(),
            name: name.to_string(),
            anchor_stack: Mutex::new(Vec::new()),
            popframe_preserved: Mutex::new(None),
            deopt_plan: Mutex::new(None),
        });
        let addr = Arc::as_ptr(&thread) as usize;
        thread.jni_env.thread.store(addr, Ordering::Relaxed);
        log::debug!(
            "thread {} '{}': stack {:#x}..{:#x}",
            thread.id,
            thread.name,
            thread.stack.low(),
            thread.stack.high()
        );
        Ok(thread)
    }

    /// # Safety
    /// `addr` must be the address of a live thread, as passed to runtime
    /// entries in the thread register.
    pub unsafe fn from_raw<'a>(addr: usize) -> &'a JavaThread {
        // SAFETY: guaranteed by the caller.
        unsafe { &*(addr as *const JavaThread) }
    }

    pub fn addr(&self) -> usize {
        self as *const JavaThread as usize
    }

    pub fn vm(&self) -> &Vm {
        // SAFETY: threads are owned by their VM and dropped with it.
        unsafe { &*self.vm }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    // ----- exceptions -----

    pub fn has_pending_exception(&self) -> bool {
        self.pending_exception.load(Ordering::Acquire) != 0
    }

    pub fn pending_exception(&self) -> Oop {
        Oop::from_raw(self.pending_exception.load(Ordering::Acquire))
    }

    pub fn set_pending_exception(&self, exception: Oop) {
        self.pending_exception.store(exception.raw(), Ordering::Release);
    }

    pub fn clear_pending_exception(&self) -> Oop {
        Oop::from_raw(self.pending_exception.swap(0, Ordering::AcqRel))
    }

    pub fn set_vm_result(&self, obj: Oop) {
        self.vm_result.store(obj.raw(), Ordering::Release);
    }

    pub fn take_vm_result(&self) -> Oop {
        Oop::from_raw(self.vm_result.swap(0, Ordering::AcqRel))
    }

    pub fn vm_result(&self) -> Oop {
        Oop::from_raw(self.vm_result.load(Ordering::Acquire))
    }

    // ----- anchor and frames -----

    pub fn last_java_sp(&self) -> usize {
        self.anchor.sp.load(Ordering::Acquire)
    }

    pub fn last_java_fp(&self) -> usize {
        self.anchor.fp.load(Ordering::Acquire)
    }

    pub fn has_last_java_frame(&self) -> bool {
        self.last_java_sp() != 0
    }

    /// Top interpreter frame while the thread is in the VM.
    pub fn last_frame(&self) -> Option<Frame> {
        let fp = self.last_java_fp();
        (self.has_last_java_frame() && fp != 0).then(|| Frame::new(fp, self.last_java_sp()))
    }

    pub(crate) fn push_anchor(&self) {
        let saved = [
            self.anchor.sp.swap(0, Ordering::AcqRel),
            self.anchor.fp.swap(0, Ordering::AcqRel),
            self.anchor.pc.swap(0, Ordering::AcqRel),
        ];
        self.anchor_stack.lock().push(saved);
    }

    pub(crate) fn pop_anchor(&self) {
        if let Some([sp, fp, pc]) = self.anchor_stack.lock().pop() {
            self.anchor.sp.store(sp, Ordering::Release);
            self.anchor.fp.store(fp, Ordering::Release);
            self.anchor.pc.store(pc, Ordering::Release);
        }
    }

    /// Anchors of all activations, innermost first, including the current one.
    pub(crate) fn anchors(&self) -> Vec<(usize, usize)> {
        let mut all = Vec::new();
        if self.has_last_java_frame() {
            all.push((self.last_java_sp(), self.last_java_fp()));
        }
        for [sp, fp, _] in self.anchor_stack.lock().iter().rev() {
            if *sp != 0 {
                all.push((*sp, *fp));
            }
        }
        all
    }

    // ----- stack -----

    pub fn stack_low(&self) -> usize {
        self.stack.low()
    }

    pub fn stack_high(&self) -> usize {
        self.stack.high()
    }

    pub fn stack_overflow_limit(&self) -> usize {
        self.stack_overflow_limit.load(Ordering::Acquire)
    }

    pub fn stack_guard_state(&self) -> StackGuardState {
        if self.stack_guard_state.load(Ordering::Acquire) == StackGuardState::YellowDisabled as u32 {
            StackGuardState::YellowDisabled
        } else {
            StackGuardState::Enabled
        }
    }

    /// Let the thread use the yellow zone to handle a stack overflow.
    pub(crate) fn disable_yellow_zone(&self) {
        let limit = self.stack.low() + self.red_zone + self.shadow_zone;
        self.stack_overflow_limit.store(limit, Ordering::Release);
        self.stack_guard_state
            .store(StackGuardState::YellowDisabled as u32, Ordering::Release);
        log::debug!("thread {}: yellow zone disabled", self.id);
    }

    /// Re-arm the yellow zone once `sp` is clear of it.
    pub(crate) fn reguard_yellow_zone(&self, sp: usize) -> bool {
        if self.stack_guard_state() == StackGuardState::Enabled {
            return true;
        }
        let limit = self.stack.low() + self.red_zone + self.yellow_zone + self.shadow_zone;
        if sp != 0 && sp < limit + self.shadow_zone {
            return false;
        }
        self.stack_overflow_limit.store(limit, Ordering::Release);
        self.stack_guard_state
            .store(StackGuardState::Enabled as u32, Ordering::Release);
        log::debug!("thread {}: yellow zone re-armed", self.id);
        true
    }

    /// A nested activation starting at `sp` would run inside the guard zones.
    pub(crate) fn in_guard_zone(&self, sp: usize) -> bool {
        sp < self.stack_overflow_limit()
    }

    // ----- handles -----

    /// Make a local handle for `obj`; null stays a null handle.
    pub fn new_handle(&self, obj: Oop) -> usize {
        if obj.is_null() {
            return 0;
        }
        let top = self.handles.top.fetch_add(1, Ordering::AcqRel);
        match self.handles.slots.get(top) {
            Some(slot) => {
                slot.store(obj.raw(), Ordering::Relaxed);
                slot as *const AtomicUsize as usize
            }
            None => {
                self.handles.top.store(HANDLE_CAPACITY, Ordering::Release);
                log::error!("thread {}: local handle block exhausted", self.id);
                0
            }
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.top.load(Ordering::Acquire)
    }

    pub fn jni_env(&self) -> usize {
        &self.jni_env as *const JniEnv as usize
    }

    // ----- interpreter-only mode, pop frame, early return -----

    pub fn set_interp_only_mode(&self, on: bool) {
        self.interp_only_mode.store(on as u8, Ordering::Release);
    }

    pub fn is_interp_only_mode(&self) -> bool {
        self.interp_only_mode.load(Ordering::Acquire) != 0
    }

    pub fn popframe_condition(&self) -> u32 {
        self.popframe_condition.load(Ordering::Acquire)
    }

    pub(crate) fn set_popframe_condition(&self, condition: u32) {
        self.popframe_condition.store(condition, Ordering::Release);
    }

    /// Ask the interpreter to pop the top frame at its next VM transition.
    pub fn request_pop_frame(&self) {
        self.popframe_condition
            .fetch_or(popframe::PENDING, Ordering::AcqRel);
    }

    pub(crate) fn preserve_popframe_args(&self, args: Vec<u64>) {
        *self.popframe_preserved.lock() = Some(args);
    }

    pub(crate) fn take_popframe_args(&self) -> Option<Vec<u64>> {
        self.popframe_preserved.lock().take()
    }

    /// Ask the interpreter to return `value` from the top frame. The value
    /// must match the result type of the frame's method.
    pub fn request_early_return(&self, value: JavaValue) -> VmResult<()> {
        let frame = self
            .last_frame()
            .ok_or_else(|| VmError::BadArguments("thread has no Java frame".into()))?;
        let result = frame.method().result_type();
        let matches = match (result, value) {
            (BasicType::Void, JavaValue::Void) => true,
            (BasicType::Long, JavaValue::Long(_)) => true,
            (BasicType::Float, JavaValue::Float(_)) => true,
            (BasicType::Double, JavaValue::Double(_)) => true,
            (t, JavaValue::Object(_)) => t.is_reference(),
            (t, JavaValue::Int(_)) => t.tos_state().is_int_like(),
            _ => false,
        };
        if !matches {
            return Err(VmError::BadArguments(format!(
                "early return value {:?} does not match {}",
                value,
                frame.method().qualified_name()
            )));
        }
        let tos = result.tos_state();
        match value {
            JavaValue::Object(obj) => self.earlyret_oop.store(obj.raw(), Ordering::Release),
            other => self.earlyret_value.store(other.raw_bits(), Ordering::Release),
        }
        self.earlyret_tos.store(tos as u32, Ordering::Release);
        self.earlyret_state.store(earlyret::PENDING, Ordering::Release);
        Ok(())
    }

    pub fn is_earlyret_pending(&self) -> bool {
        self.earlyret_state.load(Ordering::Acquire) == earlyret::PENDING
    }

    // ----- deoptimization -----

    pub(crate) fn set_deopt_plan(&self, plan: UnpackPlan) {
        *self.deopt_plan.lock() = Some(plan);
    }

    pub(crate) fn take_deopt_plan(&self) -> Option<UnpackPlan> {
        self.deopt_plan.lock().take()
    }
}

impl std::fmt::Debug for JavaThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// SAFETY: shared state is atomic or behind locks; the VM pointer outlives the thread.
unsafe impl Send for JavaThread {}
unsafe impl Sync for JavaThread {}

/// Marks a thread as running VM code for the duration of a runtime entry.
/// Leaving the VM blocks while a safepoint is in progress.
pub struct ThreadInVmFromJava<'a> {
    thread: &'a JavaThread,
    previous: ThreadState,
}

impl<'a> ThreadInVmFromJava<'a> {
    pub fn new(thread: &'a JavaThread) -> Self {
        let previous = thread.state();
        thread.set_state(ThreadState::InVm);
        Self { thread, previous }
    }
}

impl Drop for ThreadInVmFromJava<'_> {
    fn drop(&mut self) {
        self.thread.vm().safepoint().block_if_requested(self.thread);
        let next = if self.previous == ThreadState::InNativeTrans {
            ThreadState::InJava
        } else {
            self.previous
        };
        self.thread.set_state(next);
    }
}
