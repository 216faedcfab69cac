//! Programs run end to end on the portable backend.

mod common;

use std::sync::Arc;

use common::{assert_uncaught, class, eval, eval_int, load, vm, vm_with};
use parking_lot::Mutex;
use templar::interpreter::frame::Frame;
use templar::vm::JavaThread;
use templar::vm::safepoint::DebugHook;
use templar::{InterpreterConfig, JavaValue, Vm};

#[test]
fn test_int_arithmetic() {
    assert_eq!(
        eval_int(
            "
            bipush 10
            bipush 20
            iconst_2
            imul
            iadd
            bipush 7
            irem
            ireturn"
        ),
        1
    );
    assert_eq!(eval_int("ldc -2147483648\niconst_m1\nidiv\nireturn"), i32::MIN);
    assert_eq!(eval_int("ldc -2147483648\niconst_m1\nirem\nireturn"), 0);
    assert_eq!(eval_int("iconst_m1\nbipush 28\niushr\nireturn"), 15);
    assert_eq!(eval_int("bipush -16\niconst_2\nishr\nireturn"), -4);
    assert_eq!(eval_int("sipush 300\ni2b\nireturn"), 44);
    assert_eq!(eval_int("iconst_m1\ni2c\nireturn"), 65535);
    assert_eq!(eval_int("ldc 70000\ni2s\nireturn"), 4464);
}

#[test]
fn test_long_and_floating_point() {
    assert_eq!(
        eval("J", "ldc 4000000000L\nldc2_w 3\nlmul\nlconst_1\nlsub\nlreturn").unwrap(),
        JavaValue::Long(11_999_999_999)
    );
    assert_eq!(eval_int("ldc 5L\nldc 3L\nlcmp\nireturn"), 1);
    assert_eq!(
        eval("D", "ldc 1.5d\nldc 2.25d\ndmul\ndreturn").unwrap(),
        JavaValue::Double(3.375)
    );
    assert_eq!(eval("F", "ldc 1.5f\nfconst_2\nfdiv\nfreturn").unwrap(), JavaValue::Float(0.75));
    // NaN compares per the opcode's bias
    assert_eq!(eval_int("dconst_0\ndconst_0\nddiv\ndconst_1\ndcmpg\nireturn"), 1);
    assert_eq!(eval_int("dconst_0\ndconst_0\nddiv\ndconst_1\ndcmpl\nireturn"), -1);
    // conversions saturate
    assert_eq!(eval_int("ldc 1e20d\nd2i\nireturn"), i32::MAX);
    assert_eq!(eval_int("dconst_0\ndconst_0\nddiv\nd2i\nireturn"), 0);
    assert_eq!(eval("J", "ldc -1e30f\nf2l\nlreturn").unwrap(), JavaValue::Long(i64::MIN));
    assert_eq!(eval("D", "bipush 7\ni2d\ndreturn").unwrap(), JavaValue::Double(7.0));
}

#[test]
fn test_loops_and_locals() {
    // sum of 1..=100
    let sum = eval_int(
        "
            iconst_0
            istore_0
            iconst_1
            istore_1
    loop:   iload_1
            bipush 100
            if_icmpgt done
            iload_0
            iload_1
            iadd
            istore_0
            iinc 1 1
            goto loop
    done:   iload_0
            ireturn",
    );
    assert_eq!(sum, 5050);

    // locals beyond 255 go through wide
    let wide = eval_int(
        "
            .max_locals 300
            sipush 1234
            istore 290
            iinc 290 1000
            iload 290
            ireturn",
    );
    assert_eq!(wide, 2234);
}

#[test]
fn test_switches() {
    let vm = vm();
    load(
        &vm,
        &class(
            "S",
            &[
                (
                    "table",
                    "(I)I",
                    "static",
                    "
            iload_0
            tableswitch 1 default=d one two three
    one:    bipush 10
            ireturn
    two:    bipush 20
            ireturn
    three:  bipush 30
            ireturn
    d:      iconst_m1
            ireturn",
                ),
                (
                    "lookup",
                    "(I)I",
                    "static",
                    "
            iload_0
            lookupswitch default=d -5:a 100:b 7:c
    a:      iconst_1
            ireturn
    b:      iconst_2
            ireturn
    c:      iconst_3
            ireturn
    d:      iconst_0
            ireturn",
                ),
            ],
        ),
    );
    let call = |name: &str, arg: i32| vm.call_static("S", name, "(I)I", &[JavaValue::Int(arg)]).unwrap();
    assert_eq!(call("table", 1), JavaValue::Int(10));
    assert_eq!(call("table", 3), JavaValue::Int(30));
    assert_eq!(call("table", 0), JavaValue::Int(-1));
    assert_eq!(call("table", 4), JavaValue::Int(-1));
    assert_eq!(call("lookup", -5), JavaValue::Int(1));
    assert_eq!(call("lookup", 7), JavaValue::Int(3));
    assert_eq!(call("lookup", 100), JavaValue::Int(2));
    assert_eq!(call("lookup", 8), JavaValue::Int(0));
}

#[test]
fn test_arrays() {
    let sum = eval_int(
        "
            bipush 10
            newarray int
            astore_0
            iconst_0
            istore_1
    fill:   iload_1
            bipush 10
            if_icmpge summed
            aload_0
            iload_1
            iload_1
            iload_1
            imul
            iastore
            iinc 1 1
            goto fill
    summed: iconst_0
            istore_2
            iconst_0
            istore_1
    add:    iload_1
            aload_0
            arraylength
            if_icmpge done
            iload_2
            aload_0
            iload_1
            iaload
            iadd
            istore_2
            iinc 1 1
            goto add
    done:   iload_2
            ireturn",
    );
    assert_eq!(sum, 285);

    // byte arrays store truncated values; char arrays zero-extend
    assert_eq!(eval_int("iconst_1\nnewarray byte\ndup\niconst_0\nsipush 200\nbastore\niconst_0\nbaload\nireturn"), -56);
    assert_eq!(eval_int("iconst_1\nnewarray char\ndup\niconst_0\niconst_m1\ncastore\niconst_0\ncaload\nireturn"), 65535);

    let dims = eval_int(
        "
            iconst_3
            iconst_4
            multianewarray [[J 2
            iconst_2
            aaload
            arraylength
            ireturn",
    );
    assert_eq!(dims, 4);
}

#[test]
fn test_array_errors() {
    assert_uncaught(
        eval("I", "iconst_2\nnewarray int\niconst_2\niaload\nireturn"),
        "java/lang/ArrayIndexOutOfBoundsException",
    );
    assert_uncaught(
        eval("I", "iconst_m1\nnewarray int\narraylength\nireturn"),
        "java/lang/NegativeArraySizeException",
    );
    assert_uncaught(
        eval("I", "aconst_null\narraylength\nireturn"),
        "java/lang/NullPointerException",
    );
    assert_uncaught(
        eval(
            "V",
            "iconst_1\nanewarray java/lang/String\niconst_0\nnew java/lang/Object\naastore\nreturn",
        ),
        "java/lang/ArrayStoreException",
    );
}

const SHAPES: &str = r#"
[[class]]
name = "Shape"
access = ["abstract"]

[[class.field]]
name = "created"
descriptor = "I"
access = ["static"]

[[class.field]]
name = "scale"
descriptor = "I"

[[class.method]]
name = "<init>"
descriptor = "(I)V"
code = """
    aload_0
    invokespecial java/lang/Object.<init>()V
    aload_0
    iload_1
    putfield Shape.scale I
    getstatic Shape.created I
    iconst_1
    iadd
    putstatic Shape.created I
    return
"""

[[class.method]]
name = "area"
descriptor = "()I"
access = ["abstract"]

[[class]]
name = "Named"
access = ["interface", "abstract"]

[[class.method]]
name = "id"
descriptor = "()I"
access = ["public", "abstract"]

[[class]]
name = "Square"
super = "Shape"
interfaces = ["Named"]

[[class.method]]
name = "<init>"
descriptor = "(I)V"
code = """
    aload_0
    iload_1
    invokespecial Shape.<init>(I)V
    return
"""

[[class.method]]
name = "area"
descriptor = "()I"
code = """
    aload_0
    getfield Shape.scale I
    dup
    imul
    ireturn
"""

[[class.method]]
name = "id"
descriptor = "()I"
access = ["public"]
code = """
    bipush 4
    ireturn
"""

[[class]]
name = "Triangle"
super = "Shape"
interfaces = ["Named"]

[[class.method]]
name = "<init>"
descriptor = "(I)V"
code = """
    aload_0
    iload_1
    invokespecial Shape.<init>(I)V
    return
"""

[[class.method]]
name = "area"
descriptor = "()I"
code = """
    aload_0
    getfield Shape.scale I
    dup
    imul
    iconst_2
    idiv
    ireturn
"""

[[class.method]]
name = "id"
descriptor = "()I"
access = ["public"]
code = """
    iconst_3
    ireturn
"""
"#;

#[test]
fn test_objects_and_dispatch() {
    let vm = vm();
    load(&vm, SHAPES);
    load(
        &vm,
        &class(
            "Main",
            &[
                (
                    "areas",
                    "()I",
                    "static",
                    "
            new Square
            dup
            iconst_3
            invokespecial Square.<init>(I)V
            invokevirtual Shape.area()I
            new Triangle
            dup
            iconst_4
            invokespecial Triangle.<init>(I)V
            invokevirtual Shape.area()I
            iadd
            ireturn",
                ),
                (
                    "ids",
                    "()I",
                    "static",
                    "
            new Square
            dup
            iconst_1
            invokespecial Square.<init>(I)V
            invokeinterface Named.id()I
            new Triangle
            dup
            iconst_1
            invokespecial Triangle.<init>(I)V
            invokeinterface Named.id()I
            bipush 10
            imul
            iadd
            ireturn",
                ),
                (
                    "created",
                    "()I",
                    "static",
                    "
            getstatic Shape.created I
            ireturn",
                ),
                (
                    "checks",
                    "()I",
                    "static",
                    "
            new Square
            dup
            iconst_1
            invokespecial Square.<init>(I)V
            astore_0
            aload_0
            instanceof Named
            aload_0
            instanceof Triangle
            iconst_2
            imul
            iadd
            aconst_null
            instanceof Shape
            iconst_4
            imul
            iadd
            ireturn",
                ),
                (
                    "bad_cast",
                    "()I",
                    "static",
                    "
            new Square
            dup
            iconst_1
            invokespecial Square.<init>(I)V
            checkcast Triangle
            invokevirtual Shape.area()I
            ireturn",
                ),
            ],
        ),
    );
    let call = |name: &str| vm.call_static("Main", name, "()I", &[]);
    assert_eq!(call("areas").unwrap(), JavaValue::Int(9 + 8));
    assert_eq!(call("ids").unwrap(), JavaValue::Int(34));
    assert_eq!(call("created").unwrap(), JavaValue::Int(4));
    assert_eq!(call("checks").unwrap(), JavaValue::Int(1));
    assert_uncaught(call("bad_cast"), "java/lang/ClassCastException");
}

#[test]
fn test_abstract_class_cannot_be_instantiated() {
    let vm = vm();
    load(&vm, SHAPES);
    load(
        &vm,
        &class(
            "Main",
            &[("make", "()V", "static", "new Shape\npop\nreturn")],
        ),
    );
    assert_uncaught(vm.call_static("Main", "make", "()V", &[]), "java/lang/InstantiationError");
}

#[test]
fn test_exception_handlers() {
    let caught = eval_int(
        "
    start:  iconst_1
            iconst_0
            idiv
            ireturn
    end:
    handler:
            pop
            bipush 99
            ireturn
    .catch start end handler java/lang/ArithmeticException",
    );
    assert_eq!(caught, 99);

    // a handler for an unrelated class does not match
    assert_uncaught(
        eval(
            "I",
            "
    start:  iconst_1
            iconst_0
            idiv
            ireturn
    end:
    handler:
            pop
            iconst_0
            ireturn
    .catch start end handler java/lang/ClassCastException",
        ),
        "java/lang/ArithmeticException",
    );

    // athrow of a user exception with a message unwinds through a caller
    let vm = vm();
    load(
        &vm,
        &class(
            "E",
            &[
                (
                    "fail",
                    "()V",
                    "static",
                    "
            new java/lang/RuntimeException
            dup
            ldc \"broken\"
            invokespecial java/lang/RuntimeException.<init>(Ljava/lang/String;)V
            athrow",
                ),
                (
                    "outer",
                    "()I",
                    "static",
                    "
    start:  invokestatic E.fail()V
            iconst_0
            ireturn
    end:
    handler:
            invokevirtual java/lang/Throwable.getMessage()Ljava/lang/String;
            invokevirtual java/lang/String.length()I
            ireturn
    .catch start end handler java/lang/RuntimeException",
                ),
            ],
        ),
    );
    assert_eq!(vm.call_static("E", "outer", "()I", &[]).unwrap(), JavaValue::Int(6));
    let message = assert_uncaught(vm.call_static("E", "fail", "()V", &[]), "java/lang/RuntimeException");
    assert_eq!(message.as_deref(), Some("broken"));
}

#[test]
fn test_null_receiver_throws() {
    assert_uncaught(
        eval("I", "aconst_null\ninvokevirtual java/lang/String.length()I\nireturn"),
        "java/lang/NullPointerException",
    );
    assert_uncaught(
        eval("V", "aconst_null\nathrow"),
        "java/lang/NullPointerException",
    );
}

#[test]
fn test_strings_and_output() {
    let vm = vm();
    load(
        &vm,
        &class(
            "P",
            &[(
                "run",
                "()I",
                "static",
                "
            ldc \"hello\"
            invokestatic java/lang/System.println(Ljava/lang/String;)V
            bipush 42
            invokestatic java/lang/System.println(I)V
            ldc 9L
            invokestatic java/lang/System.println(J)V
            ldc 2.5d
            invokestatic java/lang/System.println(D)V
            ldc \"hello\"
            ldc \"hello\"
            if_acmpne different
            ldc \"world\"
            iconst_1
            invokevirtual java/lang/String.charAt(I)C
            ireturn
    different:
            iconst_m1
            ireturn",
            )],
        ),
    );
    assert_eq!(vm.call_static("P", "run", "()I", &[]).unwrap(), JavaValue::Int('o' as i32));
    assert_eq!(vm.take_output(), "hello\n42\n9\n2.5\n");
}

#[test]
fn test_math_intrinsics_and_natives() {
    let sqrt = eval("D", "ldc 2.0d\ninvokestatic java/lang/Math.sqrt(D)D\ndreturn").unwrap();
    assert_eq!(sqrt, JavaValue::Double(2.0f64.sqrt()));
    let pow = eval("D", "ldc 2.0d\nldc 10.0d\ninvokestatic java/lang/Math.pow(DD)D\ndreturn").unwrap();
    assert_eq!(pow, JavaValue::Double(1024.0));
    let abs = eval("D", "ldc -3.5d\ninvokestatic java/lang/Math.abs(D)D\ndreturn").unwrap();
    assert_eq!(abs, JavaValue::Double(3.5));

    // the same natives without intrinsic entries
    let config = templar::InterpreterConfig {
        use_intrinsics: false,
        ..Default::default()
    };
    let vm = common::vm_with(config);
    load(
        &vm,
        &class(
            "M",
            &[("run", "()D", "static", "ldc 100.0d\ninvokestatic java/lang/Math.log10(D)D\ndreturn")],
        ),
    );
    assert_eq!(vm.call_static("M", "run", "()D", &[]).unwrap(), JavaValue::Double(2.0));
}

#[test]
fn test_static_initializer_runs_once() {
    let vm = vm();
    load(
        &vm,
        r#"
[[class]]
name = "Counter"

[[class.field]]
name = "value"
descriptor = "I"
access = ["static"]

[[class.method]]
name = "<clinit>"
descriptor = "()V"
access = ["static"]
code = """
    bipush 40
    putstatic Counter.value I
    ldc "init"
    invokestatic java/lang/System.println(Ljava/lang/String;)V
    return
"""

[[class.method]]
name = "next"
descriptor = "()I"
access = ["static"]
code = """
    getstatic Counter.value I
    iconst_1
    iadd
    dup
    putstatic Counter.value I
    ireturn
"""
"#,
    );
    assert_eq!(vm.call_static("Counter", "next", "()I", &[]).unwrap(), JavaValue::Int(41));
    assert_eq!(vm.call_static("Counter", "next", "()I", &[]).unwrap(), JavaValue::Int(42));
    assert_eq!(vm.take_output(), "init\n");
}

#[test]
fn test_failing_static_initializer() {
    let vm = vm();
    load(
        &vm,
        r#"
[[class]]
name = "Broken"

[[class.method]]
name = "<clinit>"
descriptor = "()V"
access = ["static"]
code = """
    iconst_1
    iconst_0
    idiv
    pop
    return
"""

[[class.method]]
name = "f"
descriptor = "()I"
access = ["static"]
code = """
    iconst_1
    ireturn
"""
"#,
    );
    assert_uncaught(
        vm.call_static("Broken", "f", "()I", &[]),
        "java/lang/ExceptionInInitializerError",
    );
    assert_uncaught(vm.call_static("Broken", "f", "()I", &[]), "java/lang/NoClassDefFoundError");
}

#[test]
fn test_synchronized_methods_and_blocks() {
    let vm = vm();
    load(
        &vm,
        &class(
            "L",
            &[
                (
                    "locked",
                    "(I)I",
                    "static synchronized",
                    "
            iload_0
            iconst_1
            iadd
            ireturn",
                ),
                (
                    "block",
                    "()I",
                    "static",
                    "
            new java/lang/Object
            dup
            invokespecial java/lang/Object.<init>()V
            astore_0
            aload_0
            monitorenter
            aload_0
            monitorenter
            bipush 5
            invokestatic L.locked(I)I
            istore_1
            aload_0
            monitorexit
            aload_0
            monitorexit
            iload_1
            ireturn",
                ),
                (
                    "unbalanced",
                    "()V",
                    "static",
                    "
            new java/lang/Object
            monitorexit
            return",
                ),
            ],
        ),
    );
    let enters = vm.sync().enter_count();
    assert_eq!(vm.call_static("L", "block", "()I", &[]).unwrap(), JavaValue::Int(6));
    assert_eq!(vm.sync().enter_count() - enters, 3);
    assert_eq!(vm.sync().enter_count(), vm.sync().exit_count());
    assert_uncaught(
        vm.call_static("L", "unbalanced", "()V", &[]),
        "java/lang/IllegalMonitorStateException",
    );
}

#[test]
fn test_exception_releases_synchronized_method_lock() {
    let vm = vm();
    load(
        &vm,
        &class(
            "X",
            &[(
                "boom",
                "()I",
                "static synchronized",
                "
            iconst_1
            iconst_0
            idiv
            ireturn",
            )],
        ),
    );
    assert_uncaught(vm.call_static("X", "boom", "()I", &[]), "java/lang/ArithmeticException");
    assert_eq!(vm.sync().enter_count(), vm.sync().exit_count());
}

#[test]
fn test_native_calls_back_into_java() {
    let vm = vm();
    load(
        &vm,
        &class(
            "N",
            &[
                (
                    "square",
                    "(I)I",
                    "static",
                    "
            iload_0
            iload_0
            imul
            ireturn",
                ),
                (
                    "run",
                    "()I",
                    "static",
                    "
            ldc \"N\"
            ldc \"square\"
            bipush 12
            invokestatic java/lang/System.callStatic(Ljava/lang/String;Ljava/lang/String;I)I
            iconst_1
            iadd
            ireturn",
                ),
            ],
        ),
    );
    assert_eq!(vm.call_static("N", "run", "()I", &[]).unwrap(), JavaValue::Int(145));
}

#[test]
fn test_missing_native_is_unsatisfied_link() {
    let vm = vm();
    load(
        &vm,
        r#"
[[class]]
name = "Nat"

[[class.method]]
name = "missing"
descriptor = "(I)I"
access = ["static", "native"]
"#,
    );
    assert_uncaught(
        vm.call_static("Nat", "missing", "(I)I", &[JavaValue::Int(1)]),
        "java/lang/UnsatisfiedLinkError",
    );
}

#[test]
fn test_deep_recursion_overflows_the_stack() {
    let vm = vm();
    load(
        &vm,
        &class(
            "R",
            &[
                (
                    "down",
                    "(I)I",
                    "static",
                    "
            iload_0
            iconst_1
            iadd
            invokestatic R.down(I)I
            ireturn",
                ),
                (
                    "depth",
                    "(I)I",
                    "static",
                    "
            iload_0
            ifle base
            iload_0
            iconst_1
            isub
            invokestatic R.depth(I)I
            iconst_1
            iadd
            ireturn
    base:   iconst_0
            ireturn",
                ),
            ],
        ),
    );
    assert_uncaught(
        vm.call_static("R", "down", "(I)I", &[JavaValue::Int(0)]),
        "java/lang/StackOverflowError",
    );
    // the thread is usable again afterwards
    assert_eq!(
        vm.call_static("R", "depth", "(I)I", &[JavaValue::Int(500)]).unwrap(),
        JavaValue::Int(500)
    );
}

#[test]
fn test_accessor_and_empty_methods() {
    let vm = vm();
    load(
        &vm,
        r#"
[[class]]
name = "Box"

[[class.field]]
name = "v"
descriptor = "I"

[[class.method]]
name = "<init>"
descriptor = "()V"
code = """
    aload_0
    invokespecial java/lang/Object.<init>()V
    return
"""

[[class.method]]
name = "get"
descriptor = "()I"
code = """
    aload_0
    getfield Box.v I
    ireturn
"""

[[class.method]]
name = "nothing"
descriptor = "()V"
code = """
    return
"""

[[class.method]]
name = "run"
descriptor = "()I"
access = ["static"]
code = """
    new Box
    dup
    invokespecial Box.<init>()V
    astore_0
    aload_0
    bipush 17
    putfield Box.v I
    aload_0
    invokevirtual Box.nothing()V
    aload_0
    invokevirtual Box.get()I
    ireturn
"""
"#,
    );
    let get = vm.find_class("Box").unwrap().find_method("get", "()I").unwrap();
    assert_eq!(get.kind(), templar::interpreter::MethodKind::Accessor);
    let nothing = vm.find_class("Box").unwrap().find_method("nothing", "()V").unwrap();
    assert_eq!(nothing.kind(), templar::interpreter::MethodKind::Empty);
    assert_eq!(vm.call_static("Box", "run", "()I", &[]).unwrap(), JavaValue::Int(17));
}

const INVOKESTATIC: u8 = 0xb8;

/// One bytecode boundary seen from the debug hook.
#[derive(Debug, Clone)]
struct Step {
    method: String,
    bci: usize,
    opcode: u8,
    fp: usize,
    sp: usize,
    sender_fp: usize,
    sender_sp: usize,
    monitor_block_top: usize,
    monitors: usize,
    depth: usize,
    verified: Result<(), String>,
}

/// Record a `Step` at every bytecode of the methods named in `methods`.
fn trace(vm: &Vm, methods: &'static [&'static str]) -> Arc<Mutex<Vec<Step>>> {
    let steps = Arc::new(Mutex::new(Vec::new()));
    let sink = steps.clone();
    let hook: Arc<DebugHook> = Arc::new(move |_thread: &JavaThread, frame: &Frame| {
        let method = frame.method();
        if !methods.contains(&method.name()) {
            return;
        }
        sink.lock().push(Step {
            method: method.name().to_string(),
            bci: frame.bci().unwrap_or(usize::MAX),
            // SAFETY: bcp points into the code of the executing method.
            opcode: unsafe { *(frame.bcp() as *const u8) },
            fp: frame.fp(),
            sp: frame.sp(),
            sender_fp: frame.sender_fp(),
            sender_sp: frame.sender_sp(),
            monitor_block_top: frame.monitor_block_top(),
            monitors: frame.monitors().count(),
            depth: frame.expression_stack_depth(),
            verified: frame.verify(),
        });
    });
    vm.safepoint().set_debug_hook(vm, Some(hook));
    steps
}

fn assert_verified(steps: &[Step]) {
    for step in steps {
        if let Err(e) = &step.verified {
            panic!("{} bci {}: {}", step.method, step.bci, e);
        }
    }
}

#[test]
fn test_calls_restore_the_caller_stack() {
    let vm = vm();
    load(
        &vm,
        &class(
            "K",
            &[
                ("add", "(II)I", "static", "iload_0\niload_1\niadd\nireturn"),
                ("locked", "(I)I", "static synchronized", "iload_0\niconst_1\niadd\nireturn"),
                (
                    "drive",
                    "(I)I",
                    "static",
                    "
            iconst_0
            istore_1
    loop:   iload_1
            iload_0
            if_icmpge done
            iload_1
            iconst_2
            invokestatic K.add(II)I
            invokestatic K.locked(I)I
            istore_1
            goto loop
    done:   iload_1
            ireturn",
                ),
            ],
        ),
    );
    let enters = vm.sync().enter_count();
    let steps = trace(&vm, &["add", "locked", "drive"]);
    let result = vm.call_static("K", "drive", "(I)I", &[JavaValue::Int(200)]);
    vm.safepoint().set_debug_hook(&vm, None);
    assert_eq!(result.unwrap(), JavaValue::Int(201));
    let steps = steps.lock().clone();
    assert_verified(&steps);

    // 67 trips through the loop, each taking and releasing the class lock once
    assert_eq!(vm.sync().enter_count() - enters, 67);
    assert_eq!(vm.sync().enter_count(), vm.sync().exit_count());

    // the loop head sees the same empty stack on every trip
    let heads: Vec<&Step> = steps.iter().filter(|s| s.method == "drive" && s.bci == 2).collect();
    assert_eq!(heads.len(), 68);
    assert!(heads.iter().all(|s| s.sp == heads[0].sp && s.depth == 0));

    let mut calls = 0;
    for (i, call) in steps.iter().enumerate() {
        if call.method != "drive" || call.opcode != INVOKESTATIC {
            continue;
        }
        calls += 1;
        let callee = &steps[i + 1];
        assert_eq!(callee.bci, 0);
        assert_eq!(callee.sender_sp, call.sp);
        assert_eq!(callee.sender_fp, call.fp);
        assert_eq!(callee.depth, 0);
        let (params, locks) = match callee.method.as_str() {
            "add" => (2, 0),
            "locked" => (1, 1),
            other => panic!("unexpected callee {}", other),
        };
        assert_eq!(callee.monitors, locks);

        // back in the caller: arguments popped, one result pushed
        let back = steps[i + 1..].iter().find(|s| s.method == "drive").unwrap();
        assert_eq!(back.bci, call.bci + 3);
        assert_eq!(back.sp, callee.sender_sp + params * 8 - 8);
        assert_eq!(back.depth, call.depth - params + 1);
        assert_eq!(back.monitor_block_top, call.monitor_block_top);
        assert_eq!(back.monitors, 0);
    }
    assert_eq!(calls, 2 * 67);
}

#[test]
fn test_handler_starts_with_only_the_exception() {
    let vm = vm();
    load(
        &vm,
        &class(
            "H",
            &[
                ("explode", "()I", "static synchronized", "aconst_null\narraylength\nireturn"),
                (
                    "drive",
                    "()I",
                    "static",
                    "
            iconst_1
            iconst_2
            iconst_3
    start:  invokestatic H.explode()I
            iadd
            iadd
            ireturn
    end:
    handler:
            pop
            bipush 7
            ireturn
    .catch start end handler java/lang/NullPointerException",
                ),
            ],
        ),
    );
    let steps = trace(&vm, &["explode", "drive"]);
    for _ in 0..50 {
        assert_eq!(vm.call_static("H", "drive", "()I", &[]).unwrap(), JavaValue::Int(7));
    }
    vm.safepoint().set_debug_hook(&vm, None);
    let steps = steps.lock().clone();
    assert_verified(&steps);
    assert_eq!(vm.sync().enter_count(), vm.sync().exit_count());

    let calls: Vec<usize> = (0..steps.len())
        .filter(|&i| steps[i].method == "drive" && steps[i].opcode == INVOKESTATIC)
        .collect();
    assert_eq!(calls.len(), 50);
    for i in calls {
        let call = &steps[i];
        assert_eq!(call.depth, 3);
        // the three operands are gone; only the exception is left
        let handler = steps[i + 1..].iter().find(|s| s.method == "drive").unwrap();
        assert_eq!(handler.bci, 9);
        assert_eq!(handler.fp, call.fp);
        assert_eq!(handler.depth, 1);
        assert_eq!(handler.sp, handler.monitor_block_top - 8);
        assert_eq!(handler.monitor_block_top, call.monitor_block_top);
        assert_eq!(handler.monitors, 0);
    }
}

#[test]
fn test_math_intrinsic_matches_the_native_call() {
    let source = class(
        "Q",
        &[(
            "drive",
            "(I)D",
            "static",
            "
            dconst_0
            dstore_1
            iconst_0
            istore_3
    loop:   iload_3
            iload_0
            if_icmpge done
            dload_1
            iload_3
            i2d
            invokestatic java/lang/Math.sqrt(D)D
            dadd
            dstore_1
            iinc 3 1
            goto loop
    done:   dload_1
            dreturn",
        )],
    );
    let expected = |n: i32| (0..n).fold(0.0f64, |acc, i| acc + (i as f64).sqrt());

    let mut shapes = Vec::new();
    for use_intrinsics in [true, false] {
        let vm = vm_with(InterpreterConfig {
            use_intrinsics,
            ..Default::default()
        });
        load(&vm, &source);
        let long = vm.call_static("Q", "drive", "(I)D", &[JavaValue::Int(10_000)]).unwrap();
        assert_eq!(long, JavaValue::Double(expected(10_000)));

        let steps = trace(&vm, &["drive"]);
        let short = vm.call_static("Q", "drive", "(I)D", &[JavaValue::Int(40)]).unwrap();
        vm.safepoint().set_debug_hook(&vm, None);
        assert_eq!(short, JavaValue::Double(expected(40)));
        let steps = steps.lock().clone();
        assert_verified(&steps);

        let shape: Vec<(usize, usize, usize)> = steps.iter().map(|s| (s.bci, s.depth, s.fp - s.sp)).collect();
        let heads: Vec<_> = shape.iter().filter(|(bci, _, _)| *bci == 4).collect();
        assert_eq!(heads.len(), 41);
        assert!(heads.iter().all(|h| h == &heads[0]));
        shapes.push(shape);
    }
    assert_eq!(shapes[0], shapes[1]);
}

#[test]
fn test_cached_tos_entries_match_the_spilled_path() {
    let source = class(
        "C",
        &[(
            "mix",
            "()J",
            "static",
            "
            iconst_3
            iconst_4
            iadd
            dup
            imul
            i2l
            lconst_1
            ladd
            dup2
            lmul
            lstore_0
            ldc 2.5f
            f2i
            iconst_5
            swap
            isub
            i2l
            lload_0
            ladd
            lreturn",
        )],
    );
    // (3 + 4)^2 + 1 = 50, 50 * 50 = 2500, then 5 - 2 = 3
    let cached = vm();
    load(&cached, &source);
    assert_eq!(cached.call_static("C", "mix", "()J", &[]).unwrap(), JavaValue::Long(2503));

    // single stepping enters every bytecode with the value already spilled
    let spilled = vm();
    load(&spilled, &source);
    spilled.safepoint().set_single_step(&spilled, true);
    let result = spilled.call_static("C", "mix", "()J", &[]);
    spilled.safepoint().set_single_step(&spilled, false);
    assert_eq!(result.unwrap(), JavaValue::Long(2503));
}
