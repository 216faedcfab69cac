//! Method metadata.
//!
//! `Method` is read directly by generated code, so the fields the
//! interpreter touches are plain words at fixed offsets (see
//! [`offsets`]). Everything else is ordinary Rust data used by the
//! runtime.

use std::mem::offset_of;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::interpreter::counters;
use crate::interpreter::method_kind::MethodKind;

use super::constants::{ConstantPool, CpCacheEntry};
use super::klass::Klass;
use super::oop::BasicType;

pub mod access {
    pub const PUBLIC: u32 = 0x0001;
    pub const PRIVATE: u32 = 0x0002;
    pub const PROTECTED: u32 = 0x0004;
    pub const STATIC: u32 = 0x0008;
    pub const FINAL: u32 = 0x0010;
    pub const SYNCHRONIZED: u32 = 0x0020;
    pub const VOLATILE: u32 = 0x0040;
    pub const NATIVE: u32 = 0x0100;
    pub const INTERFACE: u32 = 0x0200;
    pub const ABSTRACT: u32 = 0x0400;

    /// Flag for a keyword used by the program and assembler syntax.
    pub fn by_name(name: &str) -> Option<u32> {
        Some(match name {
            "public" => PUBLIC,
            "private" => PRIVATE,
            "protected" => PROTECTED,
            "static" => STATIC,
            "final" => FINAL,
            "synchronized" => SYNCHRONIZED,
            "volatile" => VOLATILE,
            "native" => NATIVE,
            "interface" => INTERFACE,
            "abstract" => ABSTRACT,
            _ => return None,
        })
    }
}

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<BasicType>,
    /// Class names of reference parameters, `None` for primitives.
    pub param_classes: Vec<Option<String>>,
    pub result: BasicType,
}

impl Signature {
    pub fn parse(descriptor: &str) -> Option<Signature> {
        let bytes = descriptor.as_bytes();
        if bytes.first() != Some(&b'(') {
            return None;
        }
        let mut i = 1;
        let mut params = Vec::new();
        let mut param_classes = Vec::new();
        while *bytes.get(i)? != b')' {
            let (ty, class, next) = parse_field_type(descriptor, i)?;
            params.push(ty);
            param_classes.push(class);
            i = next;
        }
        let (result, _, end) = if bytes.get(i + 1) == Some(&b'V') {
            (BasicType::Void, None, i + 2)
        } else {
            parse_field_type(descriptor, i + 1)?
        };
        if end != bytes.len() {
            return None;
        }
        Some(Signature {
            params,
            param_classes,
            result,
        })
    }

    /// Slots taken by the declared parameters (receiver excluded).
    pub fn param_slots(&self) -> usize {
        self.params.iter().map(|t| t.slots()).sum()
    }
}

/// Parse one field type starting at `at`; returns the type, the class
/// name of a reference type and the index after it.
pub fn parse_field_type(descriptor: &str, at: usize) -> Option<(BasicType, Option<String>, usize)> {
    let bytes = descriptor.as_bytes();
    let c = *bytes.get(at)?;
    match c {
        b'L' => {
            let end = at + descriptor[at..].find(';')?;
            Some((BasicType::Object, Some(descriptor[at + 1..end].to_string()), end + 1))
        }
        b'[' => {
            let mut j = at;
            while *bytes.get(j)? == b'[' {
                j += 1;
            }
            let (_, _, next) = parse_field_type(descriptor, j)?;
            Some((BasicType::Array, Some(descriptor[at..next].to_string()), next))
        }
        b'V' => None,
        _ => Some((BasicType::from_descriptor(c)?, None, at + 1)),
    }
}

/// One row of a method's exception table. `catch_type` is a constant pool
/// class index, 0 for "any".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct MethodCounters {
    pub(crate) invocation_counter: AtomicU32,
    pub(crate) backedge_counter: AtomicU32,
}

/// Profile block attached once a method is warm. Each bci owns two 8-byte
/// cells: branch taken and branch not taken.
#[repr(C)]
pub struct MethodData {
    pub(crate) invocation_counter: AtomicU32,
    pub(crate) backedge_counter: AtomicU32,
    pub(crate) cells_base: usize,
    cells: Box<[AtomicU64]>,
}

pub const MDO_CELL_BYTES: usize = 16;

impl MethodData {
    fn new(code_len: usize) -> Self {
        let cells: Box<[AtomicU64]> = (0..code_len.max(1) * 2).map(|_| AtomicU64::new(0)).collect();
        Self {
            invocation_counter: AtomicU32::new(0),
            backedge_counter: AtomicU32::new(0),
            cells_base: cells.as_ptr() as usize,
            cells,
        }
    }

    pub fn taken(&self, bci: usize) -> u64 {
        self.cells.get(bci * 2).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn not_taken(&self, bci: usize) -> u64 {
        self.cells.get(bci * 2 + 1).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn invocation_count(&self) -> u32 {
        counters::count(self.invocation_counter.load(Ordering::Relaxed))
    }

    pub fn backedge_count(&self) -> u32 {
        counters::count(self.backedge_counter.load(Ordering::Relaxed))
    }
}

#[repr(C)]
pub struct Method {
    pub(crate) from_interpreted_entry: AtomicUsize,
    pub(crate) code_base: usize,
    pub(crate) holder: *const Klass,
    pub(crate) constants: *const ConstantPool,
    pub(crate) cache: *const CpCacheEntry,
    pub(crate) counters: MethodCounters,
    pub(crate) method_data: AtomicPtr<MethodData>,
    pub(crate) native_function: AtomicUsize,
    pub(crate) signature_handler: AtomicUsize,
    pub(crate) compiled_entry: AtomicUsize,
    pub(crate) code_len: u32,
    pub(crate) access_flags: u32,
    pub(crate) max_locals: u16,
    pub(crate) size_of_parameters: u16,
    pub(crate) max_stack: u16,
    pub(crate) result_type: u8,
    pub(crate) kind: AtomicU8,
    pub(crate) vtable_index: i32,
    name: String,
    descriptor: String,
    signature: Signature,
    code: Box<[u8]>,
    exception_table: Vec<ExceptionEntry>,
}

/// Field offsets used by generated code.
pub mod offsets {
    use super::*;

    pub const FROM_INTERPRETED_ENTRY: i32 = offset_of!(Method, from_interpreted_entry) as i32;
    pub const CODE_BASE: i32 = offset_of!(Method, code_base) as i32;
    pub const HOLDER: i32 = offset_of!(Method, holder) as i32;
    pub const CONSTANTS: i32 = offset_of!(Method, constants) as i32;
    pub const CACHE: i32 = offset_of!(Method, cache) as i32;
    pub const INVOCATION_COUNTER: i32 = (offset_of!(Method, counters) + offset_of!(MethodCounters, invocation_counter)) as i32;
    pub const BACKEDGE_COUNTER: i32 = (offset_of!(Method, counters) + offset_of!(MethodCounters, backedge_counter)) as i32;
    pub const METHOD_DATA: i32 = offset_of!(Method, method_data) as i32;
    pub const NATIVE_FUNCTION: i32 = offset_of!(Method, native_function) as i32;
    pub const SIGNATURE_HANDLER: i32 = offset_of!(Method, signature_handler) as i32;
    pub const ACCESS_FLAGS: i32 = offset_of!(Method, access_flags) as i32;
    pub const MAX_LOCALS: i32 = offset_of!(Method, max_locals) as i32;
    pub const SIZE_OF_PARAMETERS: i32 = offset_of!(Method, size_of_parameters) as i32;
    pub const MAX_STACK: i32 = offset_of!(Method, max_stack) as i32;
    pub const RESULT_TYPE: i32 = offset_of!(Method, result_type) as i32;

    pub const MDO_INVOCATION_COUNTER: i32 = offset_of!(MethodData, invocation_counter) as i32;
    pub const MDO_BACKEDGE_COUNTER: i32 = offset_of!(MethodData, backedge_counter) as i32;
    pub const MDO_CELLS: i32 = offset_of!(MethodData, cells_base) as i32;
}

/// Everything needed to create a method; supplied by the class builder.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u32,
    pub max_locals: u16,
    pub max_stack: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionEntry>,
}

impl Method {
    /// Build a method whose holder links are filled in by the class definer.
    pub(crate) fn new(spec: MethodSpec) -> Option<Method> {
        let signature = Signature::parse(&spec.descriptor)?;
        let receiver = if spec.access_flags & access::STATIC == 0 { 1 } else { 0 };
        let size_of_parameters = (signature.param_slots() + receiver) as u16;
        let code: Box<[u8]> = spec.code.into_boxed_slice();
        Some(Method {
            from_interpreted_entry: AtomicUsize::new(0),
            code_base: code.as_ptr() as usize,
            holder: std::ptr::null(),
            constants: std::ptr::null(),
            cache: std::ptr::null(),
            counters: MethodCounters::default(),
            method_data: AtomicPtr::new(std::ptr::null_mut()),
            native_function: AtomicUsize::new(0),
            signature_handler: AtomicUsize::new(0),
            compiled_entry: AtomicUsize::new(0),
            code_len: code.len() as u32,
            access_flags: spec.access_flags,
            max_locals: spec.max_locals.max(size_of_parameters),
            size_of_parameters,
            max_stack: spec.max_stack,
            result_type: signature.result as u8,
            kind: AtomicU8::new(MethodKind::Zerolocals as u8),
            vtable_index: -1,
            name: spec.name,
            descriptor: spec.descriptor,
            signature,
            code,
            exception_table: spec.exception_table,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn holder(&self) -> &Klass {
        // SAFETY: set when the method is installed into its class, which outlives it.
        unsafe { &*self.holder }
    }

    pub fn constants(&self) -> &ConstantPool {
        // SAFETY: as for `holder`.
        unsafe { &*self.constants }
    }

    pub fn cache_entry(&self, index: usize) -> Option<&CpCacheEntry> {
        if index >= self.constants().len() {
            return None;
        }
        // SAFETY: the cache has one entry per constant pool slot.
        Some(unsafe { &*self.cache.add(index) })
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.holder().name(), self.name, self.descriptor)
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & access::NATIVE != 0
    }

    pub fn is_synchronized(&self) -> bool {
        self.access_flags & access::SYNCHRONIZED != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & access::ABSTRACT != 0
    }

    pub fn is_private(&self) -> bool {
        self.access_flags & access::PRIVATE != 0
    }

    pub fn is_final(&self) -> bool {
        self.access_flags & access::FINAL != 0
    }

    pub fn is_initializer(&self) -> bool {
        self.name == "<init>" || self.name == "<clinit>"
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_base(&self) -> usize {
        self.code_base
    }

    /// Bytecode index of a bytecode pointer into this method.
    pub fn bci_of(&self, bcp: usize) -> Option<usize> {
        let bci = bcp.checked_sub(self.code_base)?;
        (bci < self.code.len()).then_some(bci)
    }

    pub fn exception_table(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals as usize
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack as usize
    }

    pub fn size_of_parameters(&self) -> usize {
        self.size_of_parameters as usize
    }

    pub fn result_type(&self) -> BasicType {
        self.signature.result
    }

    pub fn kind(&self) -> MethodKind {
        MethodKind::from_u8(self.kind.load(Ordering::Relaxed)).unwrap_or(MethodKind::Zerolocals)
    }

    pub(crate) fn set_kind(&self, kind: MethodKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    pub fn entry(&self) -> usize {
        self.from_interpreted_entry.load(Ordering::Acquire)
    }

    pub(crate) fn set_entry(&self, entry: usize) {
        self.from_interpreted_entry.store(entry, Ordering::Release);
    }

    pub fn vtable_index(&self) -> Option<usize> {
        (self.vtable_index >= 0).then_some(self.vtable_index as usize)
    }

    pub fn invocation_count(&self) -> u32 {
        counters::count(self.counters.invocation_counter.load(Ordering::Relaxed))
    }

    pub fn backedge_count(&self) -> u32 {
        counters::count(self.counters.backedge_counter.load(Ordering::Relaxed))
    }

    /// Raw invocation counter word (count and carry).
    pub fn invocation_counter(&self) -> &AtomicU32 {
        &self.counters.invocation_counter
    }

    pub fn backedge_counter(&self) -> &AtomicU32 {
        &self.counters.backedge_counter
    }

    pub fn method_data(&self) -> Option<&MethodData> {
        let p = self.method_data.load(Ordering::Acquire);
        // SAFETY: published once and freed only when the method is dropped.
        unsafe { p.as_ref() }
    }

    /// Attach a profile block if none exists yet.
    pub fn ensure_method_data(&self) -> &MethodData {
        if let Some(md) = self.method_data() {
            return md;
        }
        let fresh = Box::into_raw(Box::new(MethodData::new(self.code.len())));
        match self.method_data.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => log::debug!("profiling {}", self.qualified_name()),
            Err(_) => {
                // SAFETY: `fresh` lost the race and was never shared.
                drop(unsafe { Box::from_raw(fresh) });
            }
        }
        // the slot is non-null on both paths
        self.method_data().unwrap_or_else(|| unreachable!())
    }

    pub fn native_function(&self) -> usize {
        self.native_function.load(Ordering::Acquire)
    }

    pub fn set_native_function(&self, f: usize) {
        self.native_function.store(f, Ordering::Release);
    }

    pub fn signature_handler(&self) -> usize {
        self.signature_handler.load(Ordering::Acquire)
    }

    pub fn set_signature_handler(&self, h: usize) {
        self.signature_handler.store(h, Ordering::Release);
    }

    pub fn compiled_entry(&self) -> Option<usize> {
        let e = self.compiled_entry.load(Ordering::Acquire);
        (e != 0).then_some(e)
    }

    pub fn set_compiled_entry(&self, entry: usize) {
        self.compiled_entry.store(entry, Ordering::Release);
    }

    /// Find the handler for an exception thrown at `bci`; `matches` decides
    /// whether a catch type (constant pool index) covers the exception.
    pub fn find_handler(&self, bci: usize, mut matches: impl FnMut(u16) -> bool) -> Option<usize> {
        self.exception_table
            .iter()
            .find(|e| {
                (e.start_pc as usize) <= bci
                    && bci < e.end_pc as usize
                    && (e.catch_type == 0 || matches(e.catch_type))
            })
            .map(|e| e.handler_pc as usize)
    }
}

impl Drop for Method {
    fn drop(&mut self) {
        let p = self.method_data.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !p.is_null() {
            // SAFETY: created by `ensure_method_data` via `Box::into_raw`.
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("access_flags", &format_args!("{:#x}", self.access_flags))
            .finish()
    }
}

// SAFETY: raw pointers reference class metadata that lives as long as the VM;
// all mutable state is atomic.
unsafe impl Send for Method {}
unsafe impl Sync for Method {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_parsing() {
        let sig = Signature::parse("(IJLjava/lang/String;[[DZ)F").unwrap();
        assert_eq!(
            sig.params,
            vec![
                BasicType::Int,
                BasicType::Long,
                BasicType::Object,
                BasicType::Array,
                BasicType::Boolean
            ]
        );
        assert_eq!(sig.param_classes[2].as_deref(), Some("java/lang/String"));
        assert_eq!(sig.param_classes[3].as_deref(), Some("[[D"));
        assert_eq!(sig.result, BasicType::Float);
        assert_eq!(sig.param_slots(), 6);
        assert!(Signature::parse("()V").is_some());
        assert!(Signature::parse("(V)V").is_none());
        assert!(Signature::parse("(I").is_none());
        assert!(Signature::parse("()VX").is_none());
    }

    #[test]
    fn test_parameter_size_counts_receiver() {
        let m = Method::new(MethodSpec {
            name: "f".into(),
            descriptor: "(JI)V".into(),
            access_flags: access::PUBLIC,
            max_locals: 0,
            max_stack: 2,
            code: vec![0xb1],
            exception_table: vec![],
        })
        .unwrap();
        assert_eq!(m.size_of_parameters(), 4);
        assert_eq!(m.max_locals(), 4);
        assert_eq!(m.bci_of(m.code_base()), Some(0));
        assert_eq!(m.bci_of(m.code_base() + 1), None);
    }

    #[test]
    fn test_handler_lookup_is_first_match() {
        let m = Method::new(MethodSpec {
            name: "g".into(),
            descriptor: "()V".into(),
            access_flags: access::STATIC,
            max_locals: 0,
            max_stack: 1,
            code: vec![0; 20],
            exception_table: vec![
                ExceptionEntry { start_pc: 0, end_pc: 10, handler_pc: 12, catch_type: 3 },
                ExceptionEntry { start_pc: 0, end_pc: 10, handler_pc: 15, catch_type: 0 },
            ],
        })
        .unwrap();
        assert_eq!(m.find_handler(4, |t| t == 3), Some(12));
        assert_eq!(m.find_handler(4, |_| false), Some(15));
        assert_eq!(m.find_handler(10, |_| true), None);
    }
}
