//! The template interpreter: generation of all interpreter code at VM
//! startup, and the tables generated code dispatches through.
//!
//! [`Interpreter::generate`] emits every codelet once into a
//! [`CodeletQueue`]. After that the queue is sealed and the only mutable
//! state is the active dispatch table pointer and the lazily grown
//! signature handler library.

pub mod bytecodes;
pub mod codelet;
pub mod counters;
pub mod dispatch;
mod entries;
pub mod frame;
pub mod generator;
mod interp_masm;
pub mod method_kind;
mod reentry;
pub(crate) mod runtime;
pub mod signature;
pub mod stubs;
pub mod template_table;
mod templates;
pub mod tos;

use serde::Serialize;

use crate::codegen::portable;
use crate::codegen::{CodeSpace, PortableAssembler};
#[cfg(feature = "x86_64")]
use crate::codegen::X86_64Assembler;
use crate::config::{Backend, InterpreterConfig};
#[cfg(not(feature = "x86_64"))]
use crate::error::VmError;
use crate::error::VmResult;
use crate::vm::method::Method;

pub use codelet::{Codelet, CodeletKind, CodeletQueue};
pub use dispatch::{ActiveTable, DispatchTable, DispatchTables, EntryPoint};
pub use generator::GenerationStats;
pub use method_kind::MethodKind;
pub use signature::SignatureHandlerLibrary;
pub use stubs::{EntryTables, StubId, StubTable};
pub use template_table::TemplateTable;
pub use tos::TosState;

use generator::Targets;
use interp_masm::GenContext;

/// Region reserved for signature handlers generated after startup.
const SIGNATURE_HANDLER_REGION: usize = 64 * 1024;

const X86_NOP: u8 = 0x90;

/// One codelet of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct CodeletListing {
    pub name: String,
    pub kind: CodeletKind,
    pub start: usize,
    pub size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<String>,
}

pub struct Interpreter {
    config: InterpreterConfig,
    queue: CodeletQueue,
    dispatch: Box<DispatchTables>,
    stubs: Box<StubTable>,
    entries: Box<EntryTables>,
    templates: TemplateTable,
    signature_handlers: SignatureHandlerLibrary,
    stats: GenerationStats,
}

impl Interpreter {
    /// Generate the interpreter for `config`. `poll_word` and
    /// `satb_marking` are the addresses of the global safepoint poll word
    /// and the collector's marking flag, both read by generated code.
    pub fn generate(config: &InterpreterConfig, poll_word: usize, satb_marking: usize) -> VmResult<Interpreter> {
        config.validate()?;
        let fill = match config.backend {
            Backend::Portable => portable::op::NOP,
            Backend::X86_64 => X86_NOP,
        };
        let mut queue = CodeletQueue::new(config.code_region_size(), fill)?;
        let mut dispatch = DispatchTables::new();
        let stubs = StubTable::new();
        let mut entries = EntryTables::new();
        let templates = TemplateTable::new();

        let ctx = GenContext {
            config: config.clone(),
            poll_word,
            satb_marking,
            active_cell: dispatch.active_cell(),
            normal_base: dispatch.normal().base(),
            wide_base: dispatch.wide_base(),
            stub_cells: StubId::ALL.iter().map(|id| stubs.cell(*id)).collect(),
            return_entries: [
                entries.return_entry_addr(stubs::INVOKE_LENGTHS[0]),
                entries.return_entry_addr(stubs::INVOKE_LENGTHS[1]),
            ],
            earlyret_entry: entries.earlyret_entry_addr(),
            result_handlers: entries.result_handlers_addr(),
            method_entries: entries.method_entry_addr(0),
            call_stub_return_cell: stubs.cell(StubId::CallStubReturn),
        };

        let mut targets = Targets {
            queue: &mut queue,
            dispatch: &mut dispatch,
            stubs: &stubs,
            entries: &mut entries,
            templates: &templates,
        };
        let stats = match config.backend {
            Backend::Portable => generator::generate::<PortableAssembler>(&mut targets, &ctx)?,
            #[cfg(feature = "x86_64")]
            Backend::X86_64 => generator::generate::<X86_64Assembler>(&mut targets, &ctx)?,
            #[cfg(not(feature = "x86_64"))]
            Backend::X86_64 => return Err(VmError::UnsupportedBackend(Backend::X86_64.name())),
        };

        // kinds without a dedicated entry share their fallback's
        for kind in MethodKind::ALL {
            if entries.method_entry(kind.index()) == 0 {
                let entry = fallback_entry(&entries, config, kind);
                entries.method_entries[kind.index()] = entry;
            }
        }

        queue.deallocate_unused_tail()?;
        queue.seal()?;
        let signature_handlers = SignatureHandlerLibrary::new(SIGNATURE_HANDLER_REGION, fill)?;

        Ok(Interpreter {
            config: config.clone(),
            queue,
            dispatch,
            stubs,
            entries,
            templates,
            signature_handlers,
            stats,
        })
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn backend(&self) -> Backend {
        self.config.backend
    }

    /// Whether generated code can run in this process.
    pub fn is_executable(&self) -> bool {
        self.config.backend == Backend::Portable
    }

    pub fn stats(&self) -> &GenerationStats {
        &self.stats
    }

    pub fn codelets(&self) -> &[Codelet] {
        self.queue.codelets()
    }

    pub fn codelet_containing(&self, pc: usize) -> Option<&Codelet> {
        self.queue.stub_containing(pc)
    }

    pub fn code_bytes(&self, codelet: &Codelet) -> &[u8] {
        self.queue.bytes_of(codelet)
    }

    pub fn dispatch(&self) -> &DispatchTables {
        &self.dispatch
    }

    pub fn entries(&self) -> &EntryTables {
        &self.entries
    }

    pub fn templates(&self) -> &TemplateTable {
        &self.templates
    }

    pub fn stub(&self, id: StubId) -> usize {
        self.stubs.get(id)
    }

    /// Entry installed into methods of `kind`.
    pub fn entry_for(&self, kind: MethodKind) -> usize {
        self.entries.method_entry(kind.index())
    }

    pub fn return_entry(&self, invoke_length: usize, state: TosState) -> usize {
        self.entries.return_entry(invoke_length).map_or(0, |ep| ep.entry(state))
    }

    /// Continuation after a deoptimized call returns: `step` is the length
    /// of the invoke, or 0 to re-execute the current bytecode.
    pub fn deopt_entry(&self, step: usize, state: TosState) -> usize {
        self.entries.deopt_entry(step).map_or(0, |ep| ep.entry(state))
    }

    pub fn signature_handlers(&self) -> &SignatureHandlerLibrary {
        &self.signature_handlers
    }

    /// Signature handler for a native method, generated on first use.
    pub fn signature_handler_for(&self, method: &Method) -> usize {
        let slow = self.stub(StubId::SlowSignatureHandler);
        match self.config.backend {
            Backend::Portable => self.signature_handlers.handler_for::<PortableAssembler>(method, slow),
            #[cfg(feature = "x86_64")]
            Backend::X86_64 => self.signature_handlers.handler_for::<X86_64Assembler>(method, slow),
            #[cfg(not(feature = "x86_64"))]
            Backend::X86_64 => slow,
        }
    }

    pub fn notice_safepoints(&self) {
        self.dispatch.notice_safepoints();
    }

    pub fn ignore_safepoints(&self) {
        self.dispatch.ignore_safepoints();
    }

    /// Listing of every codelet, optionally with its instructions.
    pub fn listing(&self, disassemble: bool) -> Vec<CodeletListing> {
        self.codelets()
            .iter()
            .map(|c| CodeletListing {
                name: c.name.clone(),
                kind: c.kind,
                start: c.start,
                size: c.size,
                instructions: if disassemble { self.disassemble(c) } else { Vec::new() },
            })
            .collect()
    }

    /// Instructions of one codelet. x86-64 code is shown as raw bytes.
    pub fn disassemble(&self, codelet: &Codelet) -> Vec<String> {
        let bytes = self.code_bytes(codelet);
        match self.config.backend {
            Backend::Portable => portable::disassemble(bytes, codelet.start),
            Backend::X86_64 => bytes
                .chunks(16)
                .enumerate()
                .map(|(i, chunk)| {
                    let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
                    format!("{:#x}: {}", codelet.start + i * 16, hex.join(" "))
                })
                .collect(),
        }
    }

    /// Human-readable listing in the style of a "print interpreter" dump.
    pub fn print(&self, out: &mut impl std::io::Write, disassemble: bool) -> std::io::Result<()> {
        writeln!(out, "----------------------------------------------------------------------")?;
        writeln!(out, "Interpreter ({})", self.stats.backend)?;
        writeln!(
            out,
            "code size = {}K bytes, {} codelets, {} templates ({} unimplemented)",
            self.queue.used() / 1024,
            self.stats.codelets,
            self.stats.templates,
            self.stats.unimplemented
        )?;
        writeln!(out, "----------------------------------------------------------------------")?;
        for c in self.codelets() {
            writeln!(out, "{:<48} [{:#x}, {:#x}]  {} bytes  ({})", c.name, c.start, c.end(), c.size, c.kind.name())?;
            if disassemble {
                for line in self.disassemble(c) {
                    writeln!(out, "    {}", line)?;
                }
            }
        }
        Ok(())
    }

    /// Name of the code at `pc`, for traps and diagnostics.
    pub fn describe(&self, pc: usize) -> String {
        if let Some(c) = self.codelet_containing(pc) {
            return format!("{} (+{:#x})", c.name, pc - c.start);
        }
        if let Some(name) = self.signature_handlers.name_of(pc) {
            return name;
        }
        format!("{:#x} (outside generated code)", pc)
    }
}

fn fallback_entry(entries: &EntryTables, config: &InterpreterConfig, kind: MethodKind) -> usize {
    let mut current = kind;
    // fallback chains are at most a few kinds long
    for _ in 0..MethodKind::ALL.len() {
        let entry = entries.method_entry(current.index());
        if entry != 0 {
            return entry;
        }
        match current.fallback(config) {
            Some(next) => current = next,
            None => break,
        }
    }
    0
}

impl CodeSpace for Interpreter {
    fn contains(&self, pc: usize) -> bool {
        self.queue.contains(pc) || self.signature_handlers.contains(pc)
    }

    fn describe(&self, pc: usize) -> String {
        Interpreter::describe(self, pc)
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("backend", &self.config.backend)
            .field("codelets", &self.queue.codelets().len())
            .field("code_bytes", &self.queue.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::bytecodes as bc;

    fn generate(config: &InterpreterConfig) -> Interpreter {
        // generated code keeps reading both words
        let poll: &'static u64 = Box::leak(Box::new(0));
        let marking: &'static u8 = Box::leak(Box::new(0));
        Interpreter::generate(config, poll as *const u64 as usize, marking as *const u8 as usize).unwrap()
    }

    #[test]
    fn test_every_defined_bytecode_has_a_handler_in_both_tables() {
        let interp = generate(&InterpreterConfig::default());
        for code in 0..=u8::MAX {
            if !bc::is_defined(code) {
                continue;
            }
            for state in TosState::ALL {
                assert_ne!(interp.dispatch().normal().get(state, code), 0, "{:#x} {:?}", code, state);
                assert_ne!(interp.dispatch().safepoint().get(state, code), 0, "{:#x} {:?}", code, state);
            }
        }
    }

    #[test]
    fn test_every_method_kind_has_an_entry() {
        let config = InterpreterConfig {
            use_intrinsics: false,
            use_fast_accessor_methods: false,
            use_fast_empty_methods: false,
            ..Default::default()
        };
        let interp = generate(&config);
        for kind in MethodKind::ALL {
            assert_ne!(interp.entry_for(kind), 0, "{}", kind.name());
        }
        assert_eq!(interp.entry_for(MethodKind::Empty), interp.entry_for(MethodKind::Zerolocals));
        assert_eq!(interp.entry_for(MethodKind::JavaLangMathSqrt), interp.entry_for(MethodKind::Native));
    }

    #[test]
    fn test_describe_names_codelets() {
        let interp = generate(&InterpreterConfig::default());
        let call_stub = interp.stub(StubId::CallStub);
        assert!(interp.describe(call_stub).starts_with("call stub"));
        assert!(interp.describe(0x10).contains("outside"));
        assert!(CodeSpace::contains(&interp, call_stub));
    }

    #[test]
    fn test_listing_disassembles_portable_code() {
        let interp = generate(&InterpreterConfig::default());
        let listing = interp.listing(true);
        assert_eq!(listing.len(), interp.codelets().len());
        assert!(listing.iter().all(|c| !c.instructions.is_empty()));
        let mut text = Vec::new();
        interp.print(&mut text, false).unwrap();
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("call stub"));
    }

    #[cfg(feature = "x86_64")]
    #[test]
    fn test_x86_64_generation_is_listed_but_not_executable() {
        let config = InterpreterConfig {
            backend: Backend::X86_64,
            ..Default::default()
        };
        let interp = generate(&config);
        assert!(!interp.is_executable());
        assert!(interp.stats().code_bytes > 0);
        let first = &interp.codelets()[0];
        assert!(interp.disassemble(first)[0].contains(':'));
    }
}
