//! Safepoint dispatch, debugger hooks, pop frame and early return.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use common::{class, load, vm};
use templar::interpreter::frame::Frame;
use templar::vm::JavaThread;
use templar::vm::safepoint::DebugHook;
use templar::{JavaValue, Vm};

/// Exercises calls, objects, arrays, longs, doubles, exceptions and
/// monitors so both dispatch tables are compared on most templates.
const WORKLOAD: &str = r#"
[[class]]
name = "Work"

[[class.field]]
name = "total"
descriptor = "J"
access = ["static"]

[[class.method]]
name = "step"
descriptor = "(I)I"
access = ["static", "synchronized"]
code = """
start:  iload_0
        iconst_3
        irem
        ifne odd
        iload_0
        iconst_0
        idiv
        ireturn
odd:    iload_0
        i2d
        invokestatic java/lang/Math.sqrt(D)D
        d2i
        ireturn
end:
handler:
        pop
        iconst_m1
        ireturn
.catch start end handler java/lang/ArithmeticException
"""

[[class.method]]
name = "run"
descriptor = "()J"
access = ["static"]
code = """
        bipush 50
        newarray int
        astore_0
        iconst_0
        istore_1
loop:   iload_1
        aload_0
        arraylength
        if_icmpge done
        aload_0
        iload_1
        iload_1
        invokestatic Work.step(I)I
        iastore
        getstatic Work.total J
        aload_0
        iload_1
        iaload
        i2l
        ladd
        iload_1
        i2l
        lmul
        putstatic Work.total J
        iinc 1 1
        goto loop
done:   getstatic Work.total J
        invokestatic java/lang/System.println(J)V
        getstatic Work.total J
        lreturn
"""
"#;

#[test]
fn test_safepoint_table_gives_identical_results() {
    let normal = vm();
    load(&normal, WORKLOAD);
    let expected = normal.call_static("Work", "run", "()J", &[]).unwrap();
    let expected_output = normal.take_output();
    assert_eq!(normal.safepoint().poll_count(), 0);

    let polled = vm();
    load(&polled, WORKLOAD);
    polled.safepoint().set_single_step(&polled, true);
    let result = polled.call_static("Work", "run", "()J", &[]).unwrap();
    assert_eq!(result, expected);
    assert_eq!(polled.take_output(), expected_output);
    assert!(polled.safepoint().poll_count() > 500);

    // switching back stops the polls
    polled.safepoint().set_single_step(&polled, false);
    let polls = polled.safepoint().poll_count();
    load(&polled, &class("Again", &[("run", "()I", "static", "iconst_1\nireturn")]));
    polled.call_static("Again", "run", "()I", &[]).unwrap();
    assert_eq!(polled.safepoint().poll_count(), polls);
}

#[test]
fn test_debug_hook_sees_every_bytecode() {
    let vm = vm();
    load(
        &vm,
        &class(
            "H",
            &[(
                "run",
                "()I",
                "static",
                "
            iconst_1
            iconst_2
            iadd
            ireturn",
            )],
        ),
    );
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = seen.clone();
    let hook: Arc<DebugHook> = Arc::new(move |_thread: &JavaThread, frame: &Frame| {
        if frame.method().name() == "run" {
            log.lock().push(frame.bci().unwrap_or(usize::MAX));
        }
    });
    vm.safepoint().set_debug_hook(&vm, Some(hook));
    assert_eq!(vm.call_static("H", "run", "()I", &[]).unwrap(), JavaValue::Int(3));
    vm.safepoint().set_debug_hook(&vm, None);
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);
}

#[test]
fn test_synchronize_with_no_running_threads() {
    let vm = vm();
    let before = vm.safepoint().safepoint_count();
    {
        let _scope = vm.safepoint().synchronize(&vm);
        assert!(vm.safepoint().is_synchronizing());
    }
    assert!(!vm.safepoint().is_synchronizing());
    assert_eq!(vm.safepoint().safepoint_count(), before + 1);
}

const COUNTER: &str = r#"
[[class]]
name = "C"

[[class.field]]
name = "n"
descriptor = "I"
access = ["static"]

[[class.method]]
name = "bump"
descriptor = "(I)I"
access = ["static"]
code = """
        getstatic C.n I
        iload_0
        iadd
        putstatic C.n I
        getstatic C.n I
        ireturn
"""

[[class.method]]
name = "caller"
descriptor = "()I"
access = ["static"]
code = """
        bipush 5
        invokestatic C.bump(I)I
        bipush 100
        iadd
        ireturn
"""
"#;

/// Install a hook that runs `action` once, the first time `bump` reaches
/// the second `getstatic` (bci 8).
fn once_in_bump(vm: &Vm, action: impl Fn(&JavaThread) + Send + Sync + 'static) -> Arc<AtomicBool> {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let hook: Arc<DebugHook> = Arc::new(move |thread: &JavaThread, frame: &Frame| {
        if frame.method().name() == "bump" && frame.bci() == Some(8) && !flag.swap(true, Ordering::SeqCst) {
            action(thread);
        }
    });
    vm.safepoint().set_debug_hook(vm, Some(hook));
    fired
}

#[test]
fn test_pop_frame_reexecutes_the_invoke_of_an_interpreted_caller() {
    let vm = vm();
    load(&vm, COUNTER);
    let fired = once_in_bump(&vm, |thread| thread.request_pop_frame());
    // bump runs twice: the popped activation already stored n = 5
    let result = vm.call_static("C", "caller", "()I", &[]).unwrap();
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(result, JavaValue::Int(110));
}

#[test]
fn test_pop_frame_called_from_the_vm_is_reissued() {
    let vm = vm();
    load(&vm, COUNTER);
    once_in_bump(&vm, |thread| thread.request_pop_frame());
    let result = vm.call_static("C", "bump", "(I)I", &[JavaValue::Int(7)]).unwrap();
    assert_eq!(result, JavaValue::Int(14));
    let thread = vm.main_thread().unwrap();
    assert_eq!(thread.popframe_condition(), templar::vm::thread::popframe::INACTIVE);
}

#[test]
fn test_early_return_replaces_the_result() {
    let vm = vm();
    load(&vm, COUNTER);
    once_in_bump(&vm, |thread| {
        thread.request_early_return(JavaValue::Int(-1)).unwrap();
    });
    let result = vm.call_static("C", "caller", "()I", &[]).unwrap();
    assert_eq!(result, JavaValue::Int(99));
    assert!(!vm.main_thread().unwrap().is_earlyret_pending());
}

#[test]
fn test_early_return_type_must_match() {
    let vm = vm();
    load(&vm, COUNTER);
    let errors = Arc::new(AtomicUsize::new(0));
    let count = errors.clone();
    once_in_bump(&vm, move |thread| {
        if thread.request_early_return(JavaValue::Double(1.0)).is_err() {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(vm.call_static("C", "caller", "()I", &[]).unwrap(), JavaValue::Int(105));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}
