//! Compilation policy, profiling, deoptimization, agent events, GC
//! barriers and configuration loading.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::{class, load, vm, vm_with};
use parking_lot::Mutex;
use templar::interpreter::frame::Frame;
use templar::vm::compile::{CompileRequest, CompilerTier};
use templar::vm::deopt::{UnpackPlan, VirtualFrame, unpack_and_resume};
use templar::vm::jvmti::{EventListener, JvmtiEvent};
use templar::vm::safepoint::DebugHook;
use templar::vm::{JavaThread, Method};
use templar::{Backend, ConfigError, GcBarrier, InterpreterConfig, JavaValue, Vm, VmError};

fn method<'v>(vm: &'v Vm, class: &str, name: &str, descriptor: &str) -> &'v Method {
    vm.find_class(class)
        .and_then(|k| k.find_method(name, descriptor))
        .unwrap_or_else(|| panic!("{}.{}{} not defined", class, name, descriptor))
}

fn config(f: impl FnOnce(&mut InterpreterConfig)) -> InterpreterConfig {
    let mut config = InterpreterConfig::default();
    f(&mut config);
    config
}

const CALLS: &str = r#"
[[class]]
name = "P"

[[class.method]]
name = "inc"
descriptor = "(I)I"
access = ["static"]
code = """
        iload_0
        iconst_1
        iadd
        ireturn
"""

[[class.method]]
name = "run"
descriptor = "()I"
access = ["static"]
code = """
        iconst_0
        istore_0
loop:   iload_0
        bipush 60
        if_icmpge done
        iload_0
        invokestatic P.inc(I)I
        istore_0
        goto loop
done:   iload_0
        ireturn
"""
"#;

#[test]
fn test_hot_method_is_requested_once() {
    let vm = vm_with(config(|c| {
        c.compile_threshold = 50;
        c.backedge_threshold = 100_000;
    }));
    load(&vm, CALLS);
    assert_eq!(vm.call_static("P", "run", "()I", &[]).unwrap(), JavaValue::Int(60));

    let history = vm.compiler().history();
    let requests: Vec<&CompileRequest> = history.iter().filter(|r| r.method == "P.inc(I)I").collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].osr_bci, None);
    assert_eq!(requests[0].invocation_count, 50);
    // the counter restarted after the request
    assert_eq!(method(&vm, "P", "inc", "(I)I").invocation_count(), 10);
    assert!(history.iter().all(|r| r.method != "P.run()I"));
}

#[test]
fn test_hot_loop_requests_osr_at_the_backward_branch() {
    let vm = vm_with(config(|c| {
        c.compile_threshold = 100_000;
        c.backedge_threshold = 20;
    }));
    load(
        &vm,
        &class(
            "L",
            &[(
                "run",
                "()I",
                "static",
                "
        iconst_0
        istore_0
loop:   iload_0
        bipush 30
        if_icmpge done
        iinc 0 1
        goto loop
done:   iload_0
        ireturn",
            )],
        ),
    );
    assert_eq!(vm.call_static("L", "run", "()I", &[]).unwrap(), JavaValue::Int(30));
    let history = vm.compiler().history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].method, "L.run()I");
    assert_eq!(history[0].osr_bci, Some(11));
    assert_eq!(history[0].backedge_count, 20);
}

#[test]
fn test_tiered_counters_notify_at_powers_of_two() {
    let vm = vm_with(config(|c| {
        c.tiered_compilation = true;
        c.profile_interpreter = false;
        c.tier0_invoke_notify_freq_log = 4;
        c.tier0_backedge_notify_freq_log = 30;
    }));
    load(&vm, CALLS);
    vm.call_static("P", "run", "()I", &[]).unwrap();
    // 60 invocations notify at 16, 32 and 48; the first request is still
    // pending when the others arrive
    assert_eq!(vm.compiler().request_count(), 1);
    assert_eq!(vm.compiler().duplicate_count(), 2);
    assert_eq!(vm.compiler().pending().len(), 1);
}

#[test]
fn test_branch_profile_after_warm_up() {
    let vm = vm_with(config(|c| c.compile_threshold = 50));
    load(
        &vm,
        &class(
            "S",
            &[(
                "sign",
                "(I)I",
                "static",
                "
        iload_0
        ifle neg
        iconst_1
        ireturn
neg:    iconst_m1
        ireturn",
            )],
        ),
    );
    let sign = method(&vm, "S", "sign", "(I)I");
    let call = |v: i32| vm.call_static("S", "sign", "(I)I", &[JavaValue::Int(v)]).unwrap();

    for _ in 0..5 {
        call(1);
    }
    assert!(sign.method_data().is_none());
    // the profile limit is a third of the compile threshold
    for _ in 0..20 {
        call(1);
    }
    let mdo = sign.method_data().expect("profiled after warm-up");
    let (taken, not_taken) = (mdo.taken(1), mdo.not_taken(1));

    for _ in 0..5 {
        assert_eq!(call(-3), JavaValue::Int(-1));
    }
    for _ in 0..3 {
        assert_eq!(call(8), JavaValue::Int(1));
    }
    assert_eq!(mdo.taken(1) - taken, 5);
    assert_eq!(mdo.not_taken(1) - not_taken, 3);
}

#[test]
fn test_profiling_can_be_disabled() {
    let vm = vm_with(config(|c| {
        c.compile_threshold = 50;
        c.profile_interpreter = false;
    }));
    load(&vm, CALLS);
    vm.call_static("P", "run", "()I", &[]).unwrap();
    assert!(method(&vm, "P", "inc", "(I)I").method_data().is_none());
}

struct RecordingTier {
    seen: Arc<Mutex<Vec<String>>>,
}

impl CompilerTier for RecordingTier {
    fn name(&self) -> &str {
        "recording"
    }

    fn compile(&self, request: &CompileRequest) -> Option<usize> {
        self.seen.lock().push(request.method.clone());
        Some(0x1000)
    }
}

#[test]
fn test_compiler_tier_publishes_entries() {
    let vm = vm_with(config(|c| {
        c.compile_threshold = 50;
        c.backedge_threshold = 100_000;
    }));
    load(&vm, CALLS);
    let seen = Arc::new(Mutex::new(Vec::new()));
    vm.compiler().set_tier(Box::new(RecordingTier { seen: seen.clone() }));
    vm.call_static("P", "run", "()I", &[]).unwrap();

    assert_eq!(vm.compiler().process_queue(), 1);
    assert_eq!(*seen.lock(), vec!["P.inc(I)I".to_string()]);
    assert!(vm.compiler().pending().is_empty());
    let inc = method(&vm, "P", "inc", "(I)I");
    assert_eq!(inc.compiled_entry(), Some(0x1000));
    // later requests are answered with the published entry
    assert_eq!(vm.compiler().request(inc, None), Some(0x1000));
}

const CALC: &str = r#"
[[class]]
name = "Calc"

[[class.method]]
name = "twice"
descriptor = "(I)I"
access = ["static"]
code = """
        iload_0
        iload_0
        iadd
        ireturn
"""

[[class.method]]
name = "outer"
descriptor = "()I"
access = ["static"]
code = """
        bipush 21
        invokestatic Calc.twice(I)I
        iconst_1
        iadd
        ireturn
"""
"#;

#[test]
fn test_unpack_reexecutes_the_youngest_frame() {
    let vm = vm();
    load(&vm, CALC);
    // resolve the call site first
    assert_eq!(vm.call_static("Calc", "outer", "()I", &[]).unwrap(), JavaValue::Int(43));

    let outer = method(&vm, "Calc", "outer", "()I");
    let twice = method(&vm, "Calc", "twice", "(I)I");
    let thread = vm.main_thread().unwrap();
    let plan = UnpackPlan::new(vec![VirtualFrame::new(outer, 2), VirtualFrame::new(twice, 0).with_locals(vec![21])]);
    assert_eq!(unpack_and_resume(&thread, plan).unwrap(), JavaValue::Int(43));

    // a different local value proves the frame was rebuilt from the plan
    let plan = UnpackPlan::new(vec![VirtualFrame::new(outer, 2), VirtualFrame::new(twice, 0).with_locals(vec![5])]);
    assert_eq!(unpack_and_resume(&thread, plan).unwrap(), JavaValue::Int(11));
}

#[test]
fn test_unpack_completes_a_pending_call() {
    let vm = vm();
    load(&vm, CALC);
    vm.call_static("Calc", "outer", "()I", &[]).unwrap();
    let outer = method(&vm, "Calc", "outer", "()I");
    let thread = vm.main_thread().unwrap();
    let plan = UnpackPlan::new(vec![VirtualFrame::new(outer, 2)]).returning(JavaValue::Int(7));
    assert_eq!(unpack_and_resume(&thread, plan).unwrap(), JavaValue::Int(8));
}

#[test]
fn test_unpack_rejects_bad_plans() {
    let vm = vm();
    load(&vm, CALC);
    let outer = method(&vm, "Calc", "outer", "()I");
    let thread = vm.main_thread().unwrap();
    let cases = [
        UnpackPlan::new(Vec::new()),
        UnpackPlan::new(vec![VirtualFrame::new(outer, 100)]),
        // a caller frame must be at an invoke
        UnpackPlan::new(vec![VirtualFrame::new(outer, 0), VirtualFrame::new(outer, 0)]),
        UnpackPlan::new(vec![VirtualFrame::new(outer, 5)]).returning(JavaValue::Int(1)),
    ];
    for plan in cases {
        assert!(matches!(unpack_and_resume(&thread, plan), Err(VmError::BadArguments(_))));
    }
}

#[test]
fn test_method_events_in_interp_only_mode() {
    let vm = vm();
    load(&vm, CALC);
    let thread = vm.main_thread().unwrap();

    vm.call_static("Calc", "outer", "()I", &[]).unwrap();
    assert!(vm.jvmti().take_events().is_empty());

    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    let listener: Arc<EventListener> = Arc::new(move |_: &JvmtiEvent| *counter.lock() += 1);
    vm.jvmti().set_listener(Some(listener));
    thread.set_interp_only_mode(true);
    vm.call_static("Calc", "outer", "()I", &[]).unwrap();
    thread.set_interp_only_mode(false);

    let id = thread.id();
    let events = vm.jvmti().take_events();
    assert_eq!(
        events,
        vec![
            JvmtiEvent::MethodEntry { thread: id, method: "Calc.outer()I".into() },
            JvmtiEvent::MethodEntry { thread: id, method: "Calc.twice(I)I".into() },
            JvmtiEvent::MethodExit { thread: id, method: "Calc.twice(I)I".into() },
            JvmtiEvent::MethodExit { thread: id, method: "Calc.outer()I".into() },
        ]
    );
    assert_eq!(*seen.lock(), 4);
    assert_eq!(vm.jvmti().posted_count(), 4);
}

#[test]
fn test_exit_event_posted_on_exception_unwind() {
    let vm = vm();
    load(
        &vm,
        &class(
            "U",
            &[
                ("fail", "()I", "static", "iconst_1\niconst_0\nidiv\nireturn"),
                ("run", "()I", "static", "invokestatic U.fail()I\nireturn"),
            ],
        ),
    );
    let thread = vm.main_thread().unwrap();
    thread.set_interp_only_mode(true);
    let result = vm.call_static("U", "run", "()I", &[]);
    thread.set_interp_only_mode(false);
    common::assert_uncaught(result, "java/lang/ArithmeticException");
    let methods: Vec<String> = vm.jvmti().take_events().iter().map(|e| e.method().to_string()).collect();
    assert_eq!(methods, vec!["U.run()I", "U.fail()I", "U.fail()I", "U.run()I"]);
}

const FINALIZABLE: &str = r#"
[[class]]
name = "F"

[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
        aload_0
        invokespecial java/lang/Object.<init>()V
        return
"""

[[class.method]]
name = "finalize"
descriptor = "()V"
code = "return"

[[class]]
name = "Plain"

[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
        aload_0
        invokespecial java/lang/Object.<init>()V
        return
"""

[[class]]
name = "Make"

[[class.method]]
name = "run"
descriptor = "()V"
access = ["static"]
code = """
        new F
        dup
        invokespecial F.<init>()V
        pop
        new Plain
        dup
        invokespecial Plain.<init>()V
        pop
        new F
        dup
        invokespecial F.<init>()V
        pop
        return
"""
"#;

#[test]
fn test_objects_with_finalizers_are_registered() {
    let vm = vm();
    load(&vm, FINALIZABLE);
    vm.call_static("Make", "run", "()V", &[]).unwrap();
    let registered = vm.finalizable_objects();
    assert_eq!(registered.len(), 2);
    assert!(registered.iter().all(|o| o.klass().name() == "F"));
}

#[test]
fn test_frame_roots_cover_locals_and_expressions() {
    let vm = vm();
    load(
        &vm,
        &class(
            "R",
            &[(
                "hold",
                "()Ljava/lang/Object;",
                "static",
                "
        new java/lang/Object
        dup
        invokespecial java/lang/Object.<init>()V
        astore_0
        aload_0
        aload_0
        pop
        areturn",
            )],
        ),
    );
    // at bci 9 (the second aload_0) the object is in local 0 and on the stack
    let found = Arc::new(Mutex::new(None));
    let sink = found.clone();
    let hook: Arc<DebugHook> = Arc::new(move |thread: &JavaThread, frame: &Frame| {
        if frame.method().name() != "hold" || frame.bci() != Some(9) {
            return;
        }
        let obj = frame.local(0);
        let roots = thread.vm().frame_roots(thread);
        // SAFETY: the roots are slots of live frames of this thread.
        let holding = roots.iter().filter(|&&slot| unsafe { *(slot as *const u64) } == obj).count();
        *sink.lock() = Some((obj, roots.contains(&frame.local_addr(0)), holding));
    });
    vm.safepoint().set_debug_hook(&vm, Some(hook));
    let result = vm.call_static("R", "hold", "()Ljava/lang/Object;", &[]).unwrap();
    vm.safepoint().set_debug_hook(&vm, None);

    let (obj, has_local, holding) = found.lock().take().expect("hook ran at bci 9");
    assert_ne!(obj, 0);
    assert!(has_local);
    assert!(holding >= 2);
    match result {
        JavaValue::Object(o) => assert_eq!(o.raw() as u64, obj),
        other => panic!("expected an object, got {:?}", other),
    }
}

const BOX: &str = r#"
[[class]]
name = "Box"

[[class.field]]
name = "v"
descriptor = "Ljava/lang/Object;"

[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
        aload_0
        invokespecial java/lang/Object.<init>()V
        return
"""

[[class.method]]
name = "fill"
descriptor = "()V"
access = ["static"]
code = """
        new Box
        dup
        invokespecial Box.<init>()V
        astore_0
        aload_0
        ldc "first"
        putfield Box.v Ljava/lang/Object;
        aload_0
        ldc "second"
        putfield Box.v Ljava/lang/Object;
        return
"""

[[class.method]]
name = "referent"
descriptor = "()Ljava/lang/Object;"
access = ["static"]
code = """
        new java/lang/ref/Reference
        dup
        ldc "kept"
        invokespecial java/lang/ref/Reference.<init>(Ljava/lang/Object;)V
        invokevirtual java/lang/ref/Reference.get()Ljava/lang/Object;
        areturn
"""
"#;

#[test]
fn test_satb_barrier_logs_previous_values() {
    let vm = vm_with(config(|c| c.gc_barrier = GcBarrier::Satb));
    load(&vm, BOX);

    vm.call_static("Box", "fill", "()V", &[]).unwrap();
    assert!(vm.satb().drain().is_empty());

    vm.satb().set_marking(true);
    vm.call_static("Box", "fill", "()V", &[]).unwrap();
    vm.satb().set_marking(false);
    let logged = vm.satb().drain();
    assert_eq!(logged.len(), 1);
    assert_eq!(vm.string_value(logged[0]).as_deref(), Some("first"));
}

#[test]
fn test_satb_barrier_logs_reference_get() {
    let vm = vm_with(config(|c| c.gc_barrier = GcBarrier::Satb));
    load(&vm, BOX);
    vm.satb().set_marking(true);
    let result = vm.call_static("Box", "referent", "()Ljava/lang/Object;", &[]).unwrap();
    vm.satb().set_marking(false);
    let JavaValue::Object(referent) = result else {
        panic!("expected an object, got {:?}", result);
    };
    assert_eq!(vm.string_value(referent).as_deref(), Some("kept"));
    assert!(vm.satb().drain().contains(&referent));
}

#[test]
fn test_no_barrier_without_satb() {
    let vm = vm();
    load(&vm, BOX);
    vm.satb().set_marking(true);
    vm.call_static("Box", "fill", "()V", &[]).unwrap();
    vm.call_static("Box", "referent", "()Ljava/lang/Object;", &[]).unwrap();
    assert!(vm.satb().drain().is_empty());
}

#[test]
fn test_x86_64_backend_generates_but_does_not_execute() {
    let vm = vm_with(config(|c| c.backend = Backend::X86_64));
    let interpreter = vm.interpreter();
    assert!(!interpreter.is_executable());
    assert!(!interpreter.listing(false).is_empty());
    assert!(interpreter.stats().code_bytes > 0);
    load(&vm, &class("X", &[("run", "()I", "static", "iconst_1\nireturn")]));
    assert!(matches!(
        vm.call_static("X", "run", "()I", &[]),
        Err(VmError::UnsupportedBackend(_))
    ));
}

#[test]
fn test_config_file_round_trip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "backend = \"x86-64\"").unwrap();
    writeln!(file, "compile_threshold = 77").unwrap();
    writeln!(file, "gc_barrier = \"satb\"").unwrap();
    let loaded = InterpreterConfig::load(file.path()).unwrap();
    assert_eq!(loaded.backend, Backend::X86_64);
    assert_eq!(loaded.compile_threshold, 77);
    assert_eq!(loaded.gc_barrier, GcBarrier::Satb);
    // unspecified keys keep their defaults
    assert_eq!(loaded.stack_size, InterpreterConfig::default().stack_size);

    let text = loaded.to_toml_string().unwrap();
    assert_eq!(InterpreterConfig::from_toml_str(&text).unwrap(), loaded);
}

#[test]
fn test_invalid_config_is_rejected() {
    for text in [
        "stack_size = 1000",
        "stack_size = 8192\nstack_yellow_pages = 2",
        "stack_red_pages = 0",
        "compile_threshold = 0",
        "interpreter_profile_percentage = 150",
        "tier0_invoke_notify_freq_log = 31",
    ] {
        assert!(
            matches!(InterpreterConfig::from_toml_str(text), Err(ConfigError::Invalid(_))),
            "accepted: {}",
            text
        );
    }
    assert!(matches!(
        InterpreterConfig::from_toml_str("compile_threshold = \"many\""),
        Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
        InterpreterConfig::load(std::path::Path::new("/nonexistent/templar.toml")),
        Err(ConfigError::Io(_))
    ));

    let bad = config(|c| c.stack_red_pages = 0);
    assert!(matches!(Vm::new(bad), Err(VmError::Config(_))));
}
