//! Building class definitions in memory.
//!
//! A [`ClassBuilder`] collects the constant pool, fields and methods of
//! one class; method bodies are written with a [`CodeBuilder`], which
//! picks short instruction forms, inserts `wide` prefixes and patches
//! branch offsets once labels are bound. The finished
//! [`ClassDefinition`] is linked with [`Vm::define_class`](super::Vm::define_class).

use std::collections::HashMap;

use crate::error::{VmError, VmResult};
use crate::interpreter::bytecodes::{self as bc, atype};

use super::constants::{Constant, MemberRef};
use super::method::{ExceptionEntry, MethodSpec, Signature, access};
use super::oop::BasicType;

pub const OBJECT: &str = "java/lang/Object";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u32,
}

/// A class ready to be linked.
#[derive(Debug, Clone)]
pub struct ClassDefinition {
    pub name: String,
    /// `None` only for `java/lang/Object`.
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
    pub access_flags: u32,
    pub fields: Vec<FieldDefinition>,
    pub methods: Vec<MethodSpec>,
    pub constants: Vec<Constant>,
}

/// Constant pool under construction. Entries are shared: adding the same
/// constant twice returns the first index.
#[derive(Debug)]
pub struct ConstantPoolBuilder {
    entries: Vec<Constant>,
    index: HashMap<String, u16>,
}

impl Default for ConstantPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantPoolBuilder {
    pub fn new() -> Self {
        Self {
            entries: vec![Constant::Invalid],
            index: HashMap::new(),
        }
    }

    fn add(&mut self, constant: Constant) -> u16 {
        let key = format!("{:?}", constant);
        if let Some(i) = self.index.get(&key) {
            return *i;
        }
        let i = self.entries.len() as u16;
        let two_slots = matches!(constant, Constant::Long(_) | Constant::Double(_));
        self.entries.push(constant);
        if two_slots {
            self.entries.push(Constant::Invalid);
        }
        self.index.insert(key, i);
        i
    }

    pub fn integer(&mut self, v: i32) -> u16 {
        self.add(Constant::Integer(v))
    }

    pub fn float(&mut self, v: f32) -> u16 {
        self.add(Constant::Float(v))
    }

    pub fn long(&mut self, v: i64) -> u16 {
        self.add(Constant::Long(v))
    }

    pub fn double(&mut self, v: f64) -> u16 {
        self.add(Constant::Double(v))
    }

    pub fn string(&mut self, s: &str) -> u16 {
        self.add(Constant::String(s.to_string()))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        self.add(Constant::Class(name.to_string()))
    }

    fn member(class: &str, name: &str, descriptor: &str) -> MemberRef {
        MemberRef {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    pub fn field(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add(Constant::Field(Self::member(class, name, descriptor)))
    }

    pub fn method(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add(Constant::Method(Self::member(class, name, descriptor)))
    }

    pub fn interface_method(&mut self, class: &str, name: &str, descriptor: &str) -> u16 {
        self.add(Constant::InterfaceMethod(Self::member(class, name, descriptor)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Where the offset is written.
    at: usize,
    /// Instruction the offset is relative to.
    from: usize,
    label: Label,
    wide: bool,
}

#[derive(Debug)]
struct Handler {
    start: Label,
    end: Label,
    handler: Label,
    catch_type: u16,
}

/// Bytecode of one method.
pub struct CodeBuilder<'a> {
    cp: &'a mut ConstantPoolBuilder,
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    handlers: Vec<Handler>,
    max_stack: u16,
    max_locals: u16,
}

/// Stack words assumed when a method does not state its own limit.
pub const DEFAULT_MAX_STACK: u16 = 16;

impl<'a> CodeBuilder<'a> {
    pub fn new(cp: &'a mut ConstantPoolBuilder) -> Self {
        Self {
            cp,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            handlers: Vec::new(),
            max_stack: DEFAULT_MAX_STACK,
            max_locals: 0,
        }
    }

    pub fn constants(&mut self) -> &mut ConstantPoolBuilder {
        self.cp
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn set_max_stack(&mut self, words: u16) -> &mut Self {
        self.max_stack = words;
        self
    }

    pub fn set_max_locals(&mut self, slots: u16) -> &mut Self {
        self.max_locals = self.max_locals.max(slots);
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) -> &mut Self {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.code.len());
        }
        self
    }

    fn u8(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    /// An instruction without operands.
    pub fn op(&mut self, code: u8) -> &mut Self {
        self.u8(code);
        self
    }

    pub fn op_u8(&mut self, code: u8, operand: u8) -> &mut Self {
        self.u8(code);
        self.u8(operand);
        self
    }

    pub fn op_u16(&mut self, code: u8, operand: u16) -> &mut Self {
        self.u8(code);
        self.u16(operand);
        self
    }

    /// Push an int constant with the shortest encoding.
    pub fn iconst(&mut self, v: i32) -> &mut Self {
        match v {
            -1..=5 => self.op((bc::ICONST_0 as i32 + v) as u8),
            -128..=127 => self.op_u8(bc::BIPUSH, v as i8 as u8),
            -32768..=32767 => self.op_u16(bc::SIPUSH, v as i16 as u16),
            _ => {
                let i = self.cp.integer(v);
                self.ldc_index(i)
            }
        }
    }

    fn ldc_index(&mut self, index: u16) -> &mut Self {
        if index <= u8::MAX as u16 {
            self.op_u8(bc::LDC, index as u8)
        } else {
            self.op_u16(bc::LDC_W, index)
        }
    }

    pub fn ldc_float(&mut self, v: f32) -> &mut Self {
        let i = self.cp.float(v);
        self.ldc_index(i)
    }

    pub fn ldc_long(&mut self, v: i64) -> &mut Self {
        let i = self.cp.long(v);
        self.op_u16(bc::LDC2_W, i)
    }

    pub fn ldc_double(&mut self, v: f64) -> &mut Self {
        let i = self.cp.double(v);
        self.op_u16(bc::LDC2_W, i)
    }

    pub fn ldc_string(&mut self, s: &str) -> &mut Self {
        let i = self.cp.string(s);
        self.ldc_index(i)
    }

    pub fn ldc_class(&mut self, name: &str) -> &mut Self {
        let i = self.cp.class(name);
        self.ldc_index(i)
    }

    fn touch_local(&mut self, index: u16, slots: u16) {
        self.max_locals = self.max_locals.max(index + slots);
    }

    /// A load or store of local `index`; `code` is the generic form
    /// (`iload`, `astore`, ...). Uses the `_0.._3` forms and `wide`.
    pub fn local_op(&mut self, code: u8, index: u16) -> &mut Self {
        let slots = if matches!(code, bc::LLOAD | bc::DLOAD | bc::LSTORE | bc::DSTORE) { 2 } else { 1 };
        self.touch_local(index, slots);
        let short_base = match code {
            bc::ILOAD..=bc::ALOAD => Some(bc::ILOAD_0 + (code - bc::ILOAD) * 4),
            bc::ISTORE..=bc::ASTORE => Some(bc::ISTORE_0 + (code - bc::ISTORE) * 4),
            _ => None,
        };
        match (short_base, index) {
            (Some(base), 0..=3) => self.op(base + index as u8),
            (_, 0..=255) => self.op_u8(code, index as u8),
            _ => {
                self.u8(bc::WIDE);
                self.op_u16(code, index)
            }
        }
    }

    pub fn iinc(&mut self, index: u16, delta: i16) -> &mut Self {
        self.touch_local(index, 1);
        if index <= 255 && (-128..=127).contains(&delta) {
            self.u8(bc::IINC);
            self.u8(index as u8);
            self.u8(delta as i8 as u8);
        } else {
            self.u8(bc::WIDE);
            self.u8(bc::IINC);
            self.u16(index);
            self.u16(delta as u16);
        }
        self
    }

    /// A conditional branch or `goto` to `label`.
    pub fn branch(&mut self, code: u8, label: Label) -> &mut Self {
        let from = self.code.len();
        let wide = code == bc::GOTO_W;
        self.u8(code);
        self.fixups.push(Fixup { at: self.code.len(), from, label, wide });
        if wide { self.i32(0) } else { self.u16(0) }
        self
    }

    fn pad_switch(&mut self) {
        while self.code.len() % 4 != 0 {
            self.u8(0);
        }
    }

    fn switch_target(&mut self, from: usize, label: Label) {
        self.fixups.push(Fixup { at: self.code.len(), from, label, wide: true });
        self.i32(0);
    }

    pub fn tableswitch(&mut self, low: i32, default: Label, targets: &[Label]) -> &mut Self {
        let from = self.code.len();
        self.u8(bc::TABLESWITCH);
        self.pad_switch();
        self.switch_target(from, default);
        self.i32(low);
        self.i32(low + targets.len() as i32 - 1);
        for t in targets {
            self.switch_target(from, *t);
        }
        self
    }

    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let from = self.code.len();
        self.u8(bc::LOOKUPSWITCH);
        self.pad_switch();
        self.switch_target(from, default);
        let mut sorted = pairs.to_vec();
        sorted.sort_by_key(|(k, _)| *k);
        self.i32(sorted.len() as i32);
        for (key, t) in sorted {
            self.i32(key);
            self.switch_target(from, t);
        }
        self
    }

    /// `getfield`, `putfield`, `getstatic` or `putstatic`.
    pub fn field_op(&mut self, code: u8, class: &str, name: &str, descriptor: &str) -> &mut Self {
        let i = self.cp.field(class, name, descriptor);
        self.op_u16(code, i)
    }

    /// `invokevirtual`, `invokespecial`, `invokestatic` or `invokeinterface`.
    pub fn invoke(&mut self, code: u8, class: &str, name: &str, descriptor: &str) -> &mut Self {
        if code == bc::INVOKEINTERFACE {
            let i = self.cp.interface_method(class, name, descriptor);
            let count = Signature::parse(descriptor).map_or(1, |s| s.param_slots() + 1);
            self.op_u16(code, i);
            self.u8(count as u8);
            self.u8(0);
            self
        } else {
            let i = self.cp.method(class, name, descriptor);
            self.op_u16(code, i)
        }
    }

    /// `new`, `anewarray`, `checkcast` or `instanceof`.
    pub fn class_op(&mut self, code: u8, class: &str) -> &mut Self {
        let i = self.cp.class(class);
        self.op_u16(code, i)
    }

    pub fn newarray(&mut self, elem: BasicType) -> &mut Self {
        let t = match elem {
            BasicType::Boolean => atype::T_BOOLEAN,
            BasicType::Char => atype::T_CHAR,
            BasicType::Float => atype::T_FLOAT,
            BasicType::Double => atype::T_DOUBLE,
            BasicType::Byte => atype::T_BYTE,
            BasicType::Short => atype::T_SHORT,
            BasicType::Long => atype::T_LONG,
            _ => atype::T_INT,
        };
        self.op_u8(bc::NEWARRAY, t)
    }

    pub fn multianewarray(&mut self, class: &str, dims: u8) -> &mut Self {
        let i = self.cp.class(class);
        self.op_u16(bc::MULTIANEWARRAY, i);
        self.u8(dims);
        self
    }

    /// Cover `[start, end)` with a handler; `catch` is the caught class,
    /// `None` for any.
    pub fn try_catch(&mut self, start: Label, end: Label, handler: Label, catch: Option<&str>) -> &mut Self {
        let catch_type = catch.map_or(0, |c| self.cp.class(c));
        self.handlers.push(Handler { start, end, handler, catch_type });
        self
    }

    fn resolve(&self, label: Label) -> VmResult<usize> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| VmError::Link(format!("label {} is never bound", label.0)))
    }

    /// Patch branches and produce the code, exception table and limits.
    pub fn finish(mut self) -> VmResult<(Vec<u8>, Vec<ExceptionEntry>, u16, u16)> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.resolve(fixup.label)?;
            let offset = target as i64 - fixup.from as i64;
            if fixup.wide {
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_be_bytes());
            } else {
                let short = i16::try_from(offset)
                    .map_err(|_| VmError::Link(format!("branch at {} out of range", fixup.from)))?;
                self.code[fixup.at..fixup.at + 2].copy_from_slice(&short.to_be_bytes());
            }
        }
        let mut table = Vec::with_capacity(self.handlers.len());
        for h in &self.handlers {
            table.push(ExceptionEntry {
                start_pc: self.resolve(h.start)? as u16,
                end_pc: self.resolve(h.end)? as u16,
                handler_pc: self.resolve(h.handler)? as u16,
                catch_type: h.catch_type,
            });
        }
        if self.code.len() > u16::MAX as usize {
            return Err(VmError::Link("method body larger than 64K".into()));
        }
        Ok((self.code, table, self.max_stack, self.max_locals))
    }
}

pub struct ClassBuilder {
    def: ClassDefinition,
    cp: ConstantPoolBuilder,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        let super_name = (name != OBJECT).then(|| OBJECT.to_string());
        Self {
            def: ClassDefinition {
                name: name.to_string(),
                super_name,
                interfaces: Vec::new(),
                access_flags: access::PUBLIC,
                fields: Vec::new(),
                methods: Vec::new(),
                constants: Vec::new(),
            },
            cp: ConstantPoolBuilder::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn super_class(&mut self, name: &str) -> &mut Self {
        self.def.super_name = Some(name.to_string());
        self
    }

    pub fn interface(&mut self, name: &str) -> &mut Self {
        self.def.interfaces.push(name.to_string());
        self
    }

    pub fn access(&mut self, flags: u32) -> &mut Self {
        self.def.access_flags = flags;
        self
    }

    pub fn constants(&mut self) -> &mut ConstantPoolBuilder {
        &mut self.cp
    }

    pub fn field(&mut self, name: &str, descriptor: &str, flags: u32) -> &mut Self {
        self.def.fields.push(FieldDefinition {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags: flags,
        });
        self
    }

    /// A method with a body written by `body`.
    pub fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        flags: u32,
        body: impl FnOnce(&mut CodeBuilder<'_>),
    ) -> VmResult<&mut Self> {
        let mut code = CodeBuilder::new(&mut self.cp);
        body(&mut code);
        let (code, exception_table, max_stack, max_locals) = code.finish()?;
        self.def.methods.push(MethodSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags: flags,
            max_locals,
            max_stack,
            code,
            exception_table,
        });
        Ok(self)
    }

    /// A method without bytecode (native or abstract).
    pub fn method_without_code(&mut self, name: &str, descriptor: &str, flags: u32) -> &mut Self {
        self.def.methods.push(MethodSpec {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags: flags,
            max_locals: 0,
            max_stack: 0,
            code: Vec::new(),
            exception_table: Vec::new(),
        });
        self
    }

    /// Add a method whose body was produced elsewhere (the text assembler).
    pub fn raw_method(&mut self, spec: MethodSpec) -> &mut Self {
        self.def.methods.push(spec);
        self
    }

    pub fn build(self) -> ClassDefinition {
        let mut def = self.def;
        def.constants = self.cp.entries;
        def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_shared_and_wide_ones_take_two_slots() {
        let mut cp = ConstantPoolBuilder::new();
        let a = cp.integer(70000);
        let l = cp.long(5);
        let s = cp.string("x");
        assert_eq!(cp.integer(70000), a);
        assert_eq!(a, 1);
        assert_eq!(l, 2);
        assert_eq!(s, 4);
        assert_eq!(cp.len(), 5);
    }

    #[test]
    fn test_short_forms_and_wide_prefix() {
        let mut cp = ConstantPoolBuilder::new();
        let mut code = CodeBuilder::new(&mut cp);
        code.iconst(3).iconst(100).iconst(1000);
        code.local_op(bc::ILOAD, 2).local_op(bc::ASTORE, 7).local_op(bc::ILOAD, 300);
        code.iinc(1, 200);
        let (bytes, _, _, max_locals) = code.finish().unwrap();
        assert_eq!(
            bytes,
            vec![
                bc::ICONST_3,
                bc::BIPUSH, 100,
                bc::SIPUSH, 0x03, 0xe8,
                bc::ILOAD_2,
                bc::ASTORE, 7,
                bc::WIDE, bc::ILOAD, 0x01, 0x2c,
                bc::WIDE, bc::IINC, 0, 1, 0, 200,
            ]
        );
        assert_eq!(max_locals, 301);
    }

    #[test]
    fn test_branches_are_patched_relative_to_the_instruction() {
        let mut cp = ConstantPoolBuilder::new();
        let mut code = CodeBuilder::new(&mut cp);
        let top = code.new_label();
        let done = code.new_label();
        code.bind(top);
        code.op(bc::ICONST_0).branch(bc::IFEQ, done).branch(bc::GOTO, top);
        code.bind(done).op(bc::RETURN);
        let (bytes, _, _, _) = code.finish().unwrap();
        // ifeq at 1 jumps to 7, goto at 4 jumps back to 0
        assert_eq!(&bytes[1..4], &[bc::IFEQ, 0, 6]);
        assert_eq!(&bytes[4..7], &[bc::GOTO, 0xff, 0xfc]);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut cp = ConstantPoolBuilder::new();
        let mut code = CodeBuilder::new(&mut cp);
        let nowhere = code.new_label();
        code.branch(bc::GOTO, nowhere);
        assert!(code.finish().is_err());
    }

    #[test]
    fn test_tableswitch_is_aligned() {
        let mut cp = ConstantPoolBuilder::new();
        let mut code = CodeBuilder::new(&mut cp);
        let a = code.new_label();
        let d = code.new_label();
        code.op(bc::ICONST_0).tableswitch(0, d, &[a]);
        code.bind(a).bind(d).op(bc::RETURN);
        let (bytes, _, _, _) = code.finish().unwrap();
        assert_eq!(bc::length_at(&bytes, 1), Some(bytes.len() - 2));
        // default offset from the switch at bci 1
        assert_eq!(&bytes[4..8], &((bytes.len() - 2) as i32).to_be_bytes());
    }

    #[test]
    fn test_class_builder_collects_members() {
        let mut b = ClassBuilder::new("Point");
        b.field("x", "I", 0);
        b.method("getX", "()I", access::PUBLIC, |c| {
            c.local_op(bc::ALOAD, 0).field_op(bc::GETFIELD, "Point", "x", "I").op(bc::IRETURN);
        })
        .unwrap();
        let def = b.build();
        assert_eq!(def.super_name.as_deref(), Some(OBJECT));
        assert_eq!(def.methods[0].code.len(), 5);
        assert!(matches!(def.constants[1], Constant::Field(_)));
        assert!(ClassBuilder::new(OBJECT).build().super_name.is_none());
    }
}
