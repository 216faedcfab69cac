//! Emits every codelet of the interpreter and fills the tables that
//! point into them.
//!
//! Generated code reaches other codelets only through cells (stub cells,
//! entry arrays, dispatch tables), so the order below only matters for
//! the layout of the listing.

use std::time::Instant;

use serde::Serialize;

use crate::codegen::masm::MacroAssembler;
use crate::config::GcBarrier;
use crate::error::{VmError, VmResult};
use crate::vm::oop::BasicType;

use super::bytecodes::{self as bc, NUMBER_OF_CODES};
use super::codelet::{CodeletKind, CodeletQueue};
use super::dispatch::{DispatchTables, EntryPoint};
use super::entries;
use super::interp_masm::{GenContext, InterpMasm};
use super::method_kind::MethodKind;
use super::reentry;
use super::stubs::{EntryTables, INVOKE_LENGTHS, NUMBER_OF_DEOPT_ENTRIES, StubId, StubTable};
use super::template_table::{Template, TemplateTable};
use super::templates;
use super::tos::TosState;

/// Summary of one generation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationStats {
    pub backend: String,
    pub codelets: usize,
    pub code_bytes: usize,
    pub templates: usize,
    pub unimplemented: usize,
    pub method_entries: usize,
    pub micros: u128,
}

/// Everything generation writes to.
pub(crate) struct Targets<'t> {
    pub queue: &'t mut CodeletQueue,
    pub dispatch: &'t mut DispatchTables,
    pub stubs: &'t StubTable,
    pub entries: &'t mut EntryTables,
    pub templates: &'t TemplateTable,
}

/// Emit one codelet. `f` runs against an assembler positioned at the
/// codelet's final address; its result is returned with the start.
fn emit<M, R>(
    queue: &mut CodeletQueue,
    ctx: &GenContext,
    kind: CodeletKind,
    name: &str,
    f: impl FnOnce(&mut InterpMasm<'_, M>) -> R,
) -> VmResult<(usize, R)>
where
    M: MacroAssembler,
{
    let start = queue.next_start();
    let mut m = InterpMasm::<M>::new(start, ctx);
    let out = f(&mut m);
    let code = m
        .finish()
        .map_err(|e| VmError::Generation(format!("{}: {}", name, e)))?;
    let addr = queue.commit(kind, name, &code)?;
    debug_assert_eq!(addr, start);
    log::trace!("{:<40} {:#x} ({} bytes)", name, addr, code.len());
    Ok((addr, out))
}

/// One entry per TOS state, emitted back to back into a single codelet.
fn emit_per_state<M: MacroAssembler>(
    queue: &mut CodeletQueue,
    ctx: &GenContext,
    kind: CodeletKind,
    name: &str,
    mut f: impl FnMut(&mut InterpMasm<'_, M>, TosState),
) -> VmResult<EntryPoint> {
    let (_, ep) = emit::<M, _>(queue, ctx, kind, name, |m| {
        let mut ep = EntryPoint::new();
        for state in TosState::ALL {
            ep.set_entry(state, m.pc());
            f(m, state);
        }
        ep
    })?;
    Ok(ep)
}

fn stub_kind(id: StubId) -> CodeletKind {
    match id {
        StubId::DeoptReexecuteReturn | StubId::DeoptUnpack => CodeletKind::DeoptStub,
        StubId::CallStub | StubId::CallStubReturn | StubId::SlowSignatureHandler => CodeletKind::EntryStub,
        StubId::IllegalBytecodeSequence | StubId::UnimplementedBytecode => CodeletKind::EntryStub,
        _ => CodeletKind::ExceptionHandler,
    }
}

fn generate_stubs<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext) -> VmResult<()> {
    for id in StubId::ALL {
        match id {
            StubId::CallStubReturn => {}
            StubId::CallStub => {
                let (start, return_pc) = emit::<M, _>(t.queue, ctx, stub_kind(id), id.name(), |m| entries::call_stub(m))?;
                t.stubs.set(StubId::CallStub, start);
                t.stubs.set(StubId::CallStubReturn, return_pc);
            }
            StubId::CallStubCatch => {
                let (start, _) = emit::<M, _>(t.queue, ctx, stub_kind(id), id.name(), |m| entries::call_stub_catch(m))?;
                t.stubs.set(id, start);
            }
            _ => {
                let (start, _) = emit::<M, _>(t.queue, ctx, stub_kind(id), id.name(), |m| reentry::stub(m, id))?;
                t.stubs.set(id, start);
            }
        }
    }
    Ok(())
}

fn generate_result_handlers<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext) -> VmResult<()> {
    for ty in BasicType::ALL {
        let name = format!("result handler {}", ty.name());
        let (start, _) = emit::<M, _>(t.queue, ctx, CodeletKind::EntryStub, &name, |m| entries::result_handler(m, ty))?;
        t.entries.result_handlers[ty as usize] = start;
    }
    Ok(())
}

fn generate_reentries<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext) -> VmResult<()> {
    for (i, length) in INVOKE_LENGTHS.into_iter().enumerate() {
        let name = format!("return entry (invoke length {})", length);
        t.entries.return_entry[i] =
            emit_per_state::<M>(t.queue, ctx, CodeletKind::EntryStub, &name, |m, s| reentry::return_entry(m, length, s))?;
    }
    for step in 0..NUMBER_OF_DEOPT_ENTRIES {
        let name = format!("deopt entry (step {})", step);
        t.entries.deopt_entry[step] =
            emit_per_state::<M>(t.queue, ctx, CodeletKind::DeoptStub, &name, |m, s| reentry::deopt_entry(m, step, s))?;
    }
    t.entries.earlyret_entry =
        emit_per_state::<M>(t.queue, ctx, CodeletKind::EntryStub, "earlyret entry", reentry::earlyret_entry)?;
    t.entries.safepoint_entry =
        emit_per_state::<M>(t.queue, ctx, CodeletKind::SafepointStub, "safepoint entry", reentry::safepoint_entry)?;
    Ok(())
}

/// Whether the configuration asks for a dedicated entry of `kind`.
pub(crate) fn wants_entry(kind: MethodKind, ctx: &GenContext) -> bool {
    let config = &ctx.config;
    match kind {
        MethodKind::Empty => config.use_fast_empty_methods,
        MethodKind::Accessor => config.use_fast_accessor_methods,
        MethodKind::JavaLangRefReferenceGet => config.use_intrinsics && config.gc_barrier == GcBarrier::Satb,
        k if k.is_math() => config.use_intrinsics,
        _ => true,
    }
}

fn generate_method_entries<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext) -> VmResult<usize> {
    let mut generated = 0;
    for kind in MethodKind::ALL {
        if !wants_entry(kind, ctx) {
            continue;
        }
        let name = format!("method entry {}", kind.name());
        let (start, _) = emit::<M, _>(t.queue, ctx, CodeletKind::EntryStub, &name, |m| entries::method_entry(m, kind))?;
        t.entries.method_entries[kind.index()] = start;
        generated += 1;
    }
    Ok(generated)
}

/// Emit a template with its per-state entries. A `vtos` template gets a
/// spill funnel for every other state; any other template gets a `vtos`
/// entry that loads its input, and rejects states it cannot take.
fn emit_template<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, t: &Template, step: usize) -> EntryPoint {
    let mut ep;
    if t.tos_in == TosState::Vtos {
        ep = EntryPoint::new();
        let body = m.create_label();
        for state in TosState::ALL {
            if state == TosState::Vtos {
                continue;
            }
            ep.set_entry(state, m.pc());
            m.push_tos(state);
            m.jump(body);
        }
        m.bind(body);
        ep.set_entry(TosState::Vtos, m.pc());
    } else {
        let illegal = m.pc();
        m.jump_stub(StubId::IllegalBytecodeSequence);
        ep = EntryPoint::uniform(illegal);
        ep.set_entry(TosState::Vtos, m.pc());
        m.pop_tos(t.tos_in);
        let body = m.pc();
        ep.set_entry(t.tos_in, body);
        if t.tos_in == TosState::Itos {
            for narrow in [TosState::Btos, TosState::Ztos, TosState::Ctos, TosState::Stos] {
                ep.set_entry(narrow, body);
            }
        }
    }
    templates::generate(m, t.body);
    if !t.does_dispatch() {
        m.dispatch_next(t.tos_out, step as i32);
    }
    ep
}

/// Entered from `wide` in `vtos`.
fn emit_wide_template<M: MacroAssembler>(m: &mut InterpMasm<'_, M>, t: &Template, step: usize) {
    m.pop_tos(t.tos_in);
    templates::generate(m, t.body);
    if !t.does_dispatch() {
        m.dispatch_next(t.tos_out, step as i32);
    }
}

fn generate_templates<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext, stats: &mut GenerationStats) -> VmResult<()> {
    let (illegal, _) = emit::<M, _>(t.queue, ctx, CodeletKind::BytecodeHandler, "illegal bytecode", |m| {
        m.jump_stub(StubId::IllegalBytecodeSequence)
    })?;
    let (unimplemented, _) = emit::<M, _>(t.queue, ctx, CodeletKind::BytecodeHandler, "unimplemented bytecode", |m| {
        m.jump_stub(StubId::UnimplementedBytecode)
    })?;

    for code in 0..NUMBER_OF_CODES {
        let code = code as u8;
        let ep = match t.templates.template(code) {
            None => EntryPoint::uniform(illegal),
            Some(template) if template.is_unimplemented() => {
                stats.unimplemented += 1;
                EntryPoint::uniform(unimplemented)
            }
            Some(template) => {
                let name = bc::name(code).unwrap_or("?");
                let step = bc::length(code).unwrap_or(0) as usize;
                let (_, ep) = emit::<M, _>(t.queue, ctx, CodeletKind::BytecodeHandler, name, |m| {
                    emit_template(m, template, step)
                })?;
                stats.templates += 1;
                ep
            }
        };
        t.dispatch.normal_mut().set_entry(code, &ep);
    }

    for code in 0..NUMBER_OF_CODES {
        let code = code as u8;
        let entry = match t.templates.wide_template(code) {
            None => illegal,
            Some(template) if template.is_unimplemented() => unimplemented,
            Some(template) => {
                let name = format!("wide {}", bc::name(code).unwrap_or("?"));
                let step = bc::wide_length(code).unwrap_or(0);
                let (start, _) = emit::<M, _>(t.queue, ctx, CodeletKind::BytecodeHandler, &name, |m| {
                    emit_wide_template(m, template, step)
                })?;
                start
            }
        };
        t.dispatch.set_wide_entry(code, entry);
    }

    // every defined bytecode polls first in the safepoint table
    let poll = t.entries.safepoint_entry;
    for code in 0..NUMBER_OF_CODES {
        let code = code as u8;
        let ep = if bc::is_defined(code) { poll } else { EntryPoint::uniform(illegal) };
        t.dispatch.safepoint_mut().set_entry(code, &ep);
    }
    Ok(())
}

/// Generate the whole interpreter with the assembler `M`.
pub(crate) fn generate<M: MacroAssembler>(t: &mut Targets<'_>, ctx: &GenContext) -> VmResult<GenerationStats> {
    let started = Instant::now();
    let mut stats = GenerationStats {
        backend: M::backend_name().to_string(),
        ..Default::default()
    };
    generate_stubs::<M>(t, ctx)?;
    generate_result_handlers::<M>(t, ctx)?;
    generate_reentries::<M>(t, ctx)?;
    stats.method_entries = generate_method_entries::<M>(t, ctx)?;
    generate_templates::<M>(t, ctx, &mut stats)?;

    let missing = t.stubs.missing();
    if !missing.is_empty() {
        return Err(VmError::Generation(format!("stubs not generated: {:?}", missing)));
    }
    stats.codelets = t.queue.codelets().len();
    stats.code_bytes = t.queue.used();
    stats.micros = started.elapsed().as_micros();
    log::info!(
        "generated {} codelets ({} bytes) for {} in {}us",
        stats.codelets,
        stats.code_bytes,
        stats.backend,
        stats.micros
    );
    Ok(stats)
}
