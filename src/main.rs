use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use templar::interpreter::{CodeletListing, GenerationStats};
use templar::{Backend, InterpreterConfig, Program, Vm, VmError};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BackendArg {
    Portable,
    #[value(name = "x86-64")]
    X86_64,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Portable => Backend::Portable,
            BackendArg::X86_64 => Backend::X86_64,
        }
    }
}

#[derive(Parser)]
#[command(name = "templar")]
#[command(about = "Template interpreter generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the interpreter and list its codelets
    Print {
        /// Code generation backend (overrides the config file)
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Interpreter configuration (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,

        /// Include the instructions of every codelet
        #[arg(long)]
        disassemble: bool,
    },
    /// Run a static method of a TOML program
    Run {
        /// The program file
        program: PathBuf,

        /// Method to run, as Class.method; it must take no arguments
        #[arg(long)]
        entry: String,

        /// Interpreter configuration (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Dispatch every bytecode through the safepoint table
        #[arg(long)]
        safepoint_table: bool,
    },
}

#[derive(Serialize)]
struct PrintReport<'a> {
    stats: &'a GenerationStats,
    codelets: Vec<CodeletListing>,
}

fn load_config(path: Option<&Path>) -> Result<InterpreterConfig, VmError> {
    match path {
        Some(p) => Ok(InterpreterConfig::load(p)?),
        None => Ok(InterpreterConfig::default()),
    }
}

fn print(backend: Option<BackendArg>, config: Option<&Path>, json: bool, disassemble: bool) -> Result<(), String> {
    let mut config = load_config(config).map_err(|e| e.to_string())?;
    if let Some(b) = backend {
        config.backend = b.into();
    }
    let vm = Vm::new(config).map_err(|e| e.to_string())?;
    let interpreter = vm.interpreter();
    if json {
        let report = PrintReport {
            stats: interpreter.stats(),
            codelets: interpreter.listing(disassemble),
        };
        let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        let stdout = std::io::stdout();
        interpreter
            .print(&mut stdout.lock(), disassemble)
            .map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn run(program: &Path, entry: &str, config: Option<&Path>, safepoint_table: bool) -> Result<(), String> {
    let (class, method) = entry
        .rsplit_once('.')
        .ok_or_else(|| format!("entry '{}' is not Class.method", entry))?;
    let config = load_config(config).map_err(|e| e.to_string())?;
    let (program, source) = Program::load(program).map_err(|e| e.to_string())?;
    let vm = Vm::new(config).map_err(|e| e.to_string())?;
    program.define(&vm, &source).map_err(|e| e.to_string())?;

    let klass = vm
        .find_class(class)
        .ok_or_else(|| format!("class {} is not defined by the program", class))?;
    let descriptor = klass
        .methods()
        .find(|m| m.name() == method && m.is_static() && m.descriptor().starts_with("()"))
        .map(|m| m.descriptor().to_string())
        .ok_or_else(|| format!("no static no-argument method {}", entry))?;

    if safepoint_table {
        vm.safepoint().set_single_step(&vm, true);
    }
    let result = vm.call_static(class, method, &descriptor, &[]);
    print!("{}", vm.take_output());
    for message in vm.take_fatal() {
        eprintln!("fatal: {}", message);
    }
    match result {
        Ok(value) => {
            println!("{}", value);
            Ok(())
        }
        Err(VmError::UncaughtException { class, message }) => Err(match message {
            Some(m) => format!("Exception in thread \"main\" {}: {}", class.replace('/', "."), m),
            None => format!("Exception in thread \"main\" {}", class.replace('/', ".")),
        }),
        Err(e) => Err(format!("error: {}", e)),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Print {
            backend,
            config,
            json,
            disassemble,
        } => print(backend, config.as_deref(), json, disassemble),
        Commands::Run {
            program,
            entry,
            config,
            safepoint_table,
        } => run(&program, &entry, config.as_deref(), safepoint_table),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
