use serde::Serialize;
use std::time::Instant;
use templar::{InterpreterConfig, JavaValue, Program, Vm};

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    result: String,
    normal_table_secs: f64,
    safepoint_table_secs: f64,
    safepoint_polls: u64,
    rust_time_secs: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

// Rust reference implementations

fn rust_sum_loop() -> i64 {
    let mut sum: i64 = 0;
    for i in 1..=1_000_000 {
        sum += i;
    }
    sum
}

fn rust_nested_loop() -> i64 {
    let mut sum: i64 = 0;
    for i in 0..500 {
        for j in 0..500 {
            sum += i * j;
        }
    }
    sum
}

fn rust_fibonacci(n: i32) -> i32 {
    if n <= 1 { n } else { rust_fibonacci(n - 1) + rust_fibonacci(n - 2) }
}

fn time_rust<F, T>(f: F) -> f64
where
    F: FnOnce() -> T,
    T: std::fmt::Debug,
{
    let start = Instant::now();
    let value = f();
    let elapsed = start.elapsed().as_secs_f64();
    eprintln!("rust: {:?}", value);
    elapsed
}

/// Run `Class.run` of a program, returning the result, the time taken and
/// the number of safepoint polls.
fn run_templar(source: &str, class: &str, safepoint_table: bool) -> Result<(JavaValue, f64, u64), String> {
    let program = Program::from_toml_str(source).map_err(|e| e.to_string())?;
    let vm = Vm::new(InterpreterConfig::default()).map_err(|e| e.to_string())?;
    program.define(&vm, source).map_err(|e| e.to_string())?;
    let descriptor = vm
        .find_class(class)
        .and_then(|k| k.methods().find(|m| m.name() == "run").map(|m| m.descriptor().to_string()))
        .ok_or_else(|| format!("{} has no run method", class))?;
    if safepoint_table {
        vm.safepoint().set_single_step(&vm, true);
    }

    let start = Instant::now();
    let result = vm.call_static(class, "run", &descriptor, &[]).map_err(|e| e.to_string())?;
    let elapsed = start.elapsed().as_secs_f64();
    Ok((result, elapsed, vm.safepoint().poll_count()))
}

fn bench(name: &str, class: &str, source: &str, rust_time: f64) -> BenchmarkResult {
    let (normal, normal_secs) = match run_templar(source, class, false) {
        Ok((value, secs, _)) => (value.to_string(), secs),
        Err(e) => {
            eprintln!("templar benchmark {} failed: {}", name, e);
            ("error".to_string(), f64::NAN)
        }
    };
    let (safepoint_secs, polls) = match run_templar(source, class, true) {
        Ok((value, secs, polls)) => {
            if value.to_string() != normal {
                eprintln!("templar benchmark {}: safepoint table computed {}, normal table {}", name, value, normal);
            }
            (secs, polls)
        }
        Err(e) => {
            eprintln!("templar benchmark {} (safepoint table) failed: {}", name, e);
            (f64::NAN, 0)
        }
    };
    BenchmarkResult {
        name: name.to_string(),
        result: normal,
        normal_table_secs: normal_secs,
        safepoint_table_secs: safepoint_secs,
        safepoint_polls: polls,
        rust_time_secs: rust_time,
    }
}

fn main() {
    env_logger::init();
    let results = vec![
        bench(
            "sum_loop",
            "SumLoop",
            include_str!("../programs/sum_loop.toml"),
            time_rust(rust_sum_loop),
        ),
        bench(
            "nested_loop",
            "NestedLoop",
            include_str!("../programs/nested_loop.toml"),
            time_rust(rust_nested_loop),
        ),
        bench(
            "fibonacci",
            "Fibonacci",
            include_str!("../programs/fibonacci.toml"),
            time_rust(|| rust_fibonacci(25)),
        ),
    ];

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("cannot serialize results: {}", e),
    }
}
