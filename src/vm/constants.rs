//! Constant pools and their resolved caches.
//!
//! The symbolic pool is immutable after class definition. Two side arrays
//! (`tags`, `values`) let the `ldc` handler read numeric and already
//! resolved string constants without calling into the runtime. Field and
//! method references are resolved into the [`CpCacheEntry`] array that
//! bytecode handlers index with the operand of the instruction.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::interpreter::tos::TosState;

pub mod tag {
    pub const INVALID: u8 = 0;
    pub const INTEGER: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const LONG: u8 = 5;
    pub const DOUBLE: u8 = 6;
    /// Resolved class; the value is the `Klass` address.
    pub const CLASS: u8 = 7;
    /// Resolved string; the value is the interned string oop.
    pub const STRING: u8 = 8;
    pub const FIELD_REF: u8 = 9;
    pub const METHOD_REF: u8 = 10;
    pub const INTERFACE_METHOD_REF: u8 = 11;
    pub const UNRESOLVED_CLASS: u8 = 100;
    pub const UNRESOLVED_STRING: u8 = 102;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl std::fmt::Display for MemberRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.descriptor.starts_with('(') {
            write!(f, "{}.{}{}", self.class, self.name, self.descriptor)
        } else {
            write!(f, "{}.{}:{}", self.class, self.name, self.descriptor)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Invalid,
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(String),
    Field(MemberRef),
    Method(MemberRef),
    InterfaceMethod(MemberRef),
}

impl Constant {
    fn initial_tag(&self) -> u8 {
        match self {
            Constant::Invalid => tag::INVALID,
            Constant::Integer(_) => tag::INTEGER,
            Constant::Float(_) => tag::FLOAT,
            Constant::Long(_) => tag::LONG,
            Constant::Double(_) => tag::DOUBLE,
            Constant::String(_) => tag::UNRESOLVED_STRING,
            Constant::Class(_) => tag::UNRESOLVED_CLASS,
            Constant::Field(_) => tag::FIELD_REF,
            Constant::Method(_) => tag::METHOD_REF,
            Constant::InterfaceMethod(_) => tag::INTERFACE_METHOD_REF,
        }
    }

    fn initial_value(&self) -> u64 {
        match self {
            Constant::Integer(v) => *v as i64 as u64,
            Constant::Float(v) => v.to_bits() as u64,
            Constant::Long(v) => *v as u64,
            Constant::Double(v) => v.to_bits(),
            _ => 0,
        }
    }
}

#[repr(C)]
pub struct ConstantPool {
    /// Address of `tags[0]`, read by generated code.
    pub(crate) tags_base: usize,
    /// Address of `values[0]`, read by generated code.
    pub(crate) values_base: usize,
    entries: Vec<Constant>,
    tags: Box<[AtomicU8]>,
    values: Box<[AtomicU64]>,
}

pub const TAGS_BASE_OFFSET: i32 = std::mem::offset_of!(ConstantPool, tags_base) as i32;
pub const VALUES_BASE_OFFSET: i32 = std::mem::offset_of!(ConstantPool, values_base) as i32;

impl ConstantPool {
    pub fn new(entries: Vec<Constant>) -> Self {
        let tags: Box<[AtomicU8]> = entries.iter().map(|c| AtomicU8::new(c.initial_tag())).collect();
        let values: Box<[AtomicU64]> = entries
            .iter()
            .map(|c| AtomicU64::new(c.initial_value()))
            .collect();
        Self {
            tags_base: tags.as_ptr() as usize,
            values_base: values.as_ptr() as usize,
            entries,
            tags,
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Constant> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[Constant] {
        &self.entries
    }

    pub fn tag_at(&self, index: usize) -> u8 {
        self.tags.get(index).map_or(tag::INVALID, |t| t.load(Ordering::Acquire))
    }

    pub fn value_at(&self, index: usize) -> u64 {
        self.values.get(index).map_or(0, |v| v.load(Ordering::Relaxed))
    }

    /// Publish a resolved value: the value is stored before the tag.
    pub fn set_resolved(&self, index: usize, new_tag: u8, value: u64) {
        if let (Some(v), Some(t)) = (self.values.get(index), self.tags.get(index)) {
            v.store(value, Ordering::Relaxed);
            t.store(new_tag, Ordering::Release);
        }
    }
}

pub mod cache_flags {
    pub const TOS_MASK: u32 = 0xf;
    pub const IS_FINAL: u32 = 1 << 4;
    pub const IS_VOLATILE: u32 = 1 << 5;
    /// `f2` holds the target `Method` instead of a vtable index.
    pub const IS_VFINAL: u32 = 1 << 6;
    pub const PARAM_SIZE_SHIFT: u32 = 8;
    pub const PARAM_SIZE_MASK: u32 = 0xff;
}

/// One resolved field or method reference.
///
/// `indices` holds the constant pool index in its low 16 bits and, once
/// resolved, the resolving bytecode in byte 2 (`get*`, `invokestatic`,
/// `invokespecial`, `invokeinterface`) or byte 3 (`put*`,
/// `invokevirtual`). Handlers test those bytes to decide whether to call
/// the resolver.
///
/// | bytecode            | f1                  | f2                        |
/// |---------------------|---------------------|---------------------------|
/// | get/putstatic       | holder mirror       | byte offset in the mirror |
/// | get/putfield        |                     | byte offset in the object |
/// | invokestatic/special| `Method`            |                           |
/// | invokevirtual       |                     | vtable index or `Method`  |
/// | invokeinterface     | last receiver klass | its target `Method`       |
#[repr(C)]
#[derive(Debug, Default)]
pub struct CpCacheEntry {
    pub(crate) indices: AtomicU32,
    pub(crate) flags: AtomicU32,
    pub(crate) f1: AtomicUsize,
    pub(crate) f2: AtomicUsize,
}

pub const CP_CACHE_ENTRY_SIZE: usize = std::mem::size_of::<CpCacheEntry>();
/// Byte offsets of the two resolution markers within an entry.
pub const BYTECODE_1_OFFSET: i32 = 2;
pub const BYTECODE_2_OFFSET: i32 = 3;

impl CpCacheEntry {
    pub fn new(cp_index: u16) -> Self {
        Self {
            indices: AtomicU32::new(cp_index as u32),
            ..Default::default()
        }
    }

    pub fn cp_index(&self) -> u16 {
        self.indices.load(Ordering::Relaxed) as u16
    }

    pub fn bytecode_1(&self) -> u8 {
        (self.indices.load(Ordering::Acquire) >> 16) as u8
    }

    pub fn bytecode_2(&self) -> u8 {
        (self.indices.load(Ordering::Acquire) >> 24) as u8
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn f1(&self) -> usize {
        self.f1.load(Ordering::Relaxed)
    }

    pub fn f2(&self) -> usize {
        self.f2.load(Ordering::Relaxed)
    }

    pub fn tos_state(&self) -> Option<TosState> {
        TosState::from_index(self.flags() & cache_flags::TOS_MASK)
    }

    pub fn parameter_size(&self) -> usize {
        ((self.flags() >> cache_flags::PARAM_SIZE_SHIFT) & cache_flags::PARAM_SIZE_MASK) as usize
    }

    pub fn is_resolved(&self, bytecode: u8) -> bool {
        self.bytecode_1() == bytecode || self.bytecode_2() == bytecode
    }

    /// Fill the entry, then publish `bytecode` in the marker byte generated
    /// code checks. Flags and f1/f2 are visible before the marker.
    pub fn set_resolved(&self, bytecode: u8, second: bool, flags: u32, f1: Option<usize>, f2: Option<usize>) {
        self.fill(flags, f1, f2);
        self.publish(bytecode, second);
    }

    /// Store the resolved fields without publishing a marker. Used while the
    /// holder class is still being initialized so the next execution
    /// resolves again.
    pub fn fill(&self, flags: u32, f1: Option<usize>, f2: Option<usize>) {
        self.flags.store(flags, Ordering::Relaxed);
        if let Some(f1) = f1 {
            self.f1.store(f1, Ordering::Relaxed);
        }
        if let Some(f2) = f2 {
            self.f2.store(f2, Ordering::Relaxed);
        }
    }

    pub fn publish(&self, bytecode: u8, second: bool) {
        let shift = if second { 24 } else { 16 };
        let mask = 0xffu32 << shift;
        let mut current = self.indices.load(Ordering::Relaxed);
        loop {
            let next = (current & !mask) | ((bytecode as u32) << shift);
            match self
                .indices
                .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(v) => current = v,
            }
        }
    }

    /// Update the monomorphic receiver cache of an `invokeinterface` entry.
    pub fn set_interface_target(&self, receiver_klass: usize, method: usize) {
        self.f2.store(method, Ordering::Relaxed);
        self.f1.store(receiver_klass, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_entry_layout() {
        assert_eq!(CP_CACHE_ENTRY_SIZE, 24);
        assert_eq!(offset_of!(CpCacheEntry, f1), 8);
        let entry = CpCacheEntry::new(7);
        entry.set_resolved(0xb6, true, (3 << 8) | 4, None, Some(2));
        // byte 3 of the little-endian indices word carries the marker
        let bytes = entry.indices.load(Ordering::Relaxed).to_le_bytes();
        assert_eq!(bytes[BYTECODE_2_OFFSET as usize], 0xb6);
        assert_eq!(bytes[BYTECODE_1_OFFSET as usize], 0);
        assert_eq!(entry.cp_index(), 7);
        assert_eq!(entry.parameter_size(), 3);
        assert_eq!(entry.tos_state(), Some(TosState::Itos));
        assert!(entry.is_resolved(0xb6));
        assert!(!entry.is_resolved(0xb7));
    }

    #[test]
    fn test_ldc_side_arrays() {
        let cp = ConstantPool::new(vec![
            Constant::Invalid,
            Constant::Integer(-5),
            Constant::String("hi".into()),
            Constant::Double(1.5),
        ]);
        assert_eq!(cp.tag_at(1), tag::INTEGER);
        assert_eq!(cp.value_at(1) as i64, -5);
        assert_eq!(cp.tag_at(2), tag::UNRESOLVED_STRING);
        assert_eq!(f64::from_bits(cp.value_at(3)), 1.5);
        cp.set_resolved(2, tag::STRING, 0x1000);
        assert_eq!(cp.tag_at(2), tag::STRING);
        assert_eq!(cp.tag_at(99), tag::INVALID);
    }
}
