//! Object references and the heap object layout.
//!
//! ```text
//! instance:  [mark][klass][field 0][field 1]...      8-byte field slots
//! array:     [mark][klass][length ][elements...]      packed elements
//! ```

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::interpreter::tos::TosState;

use super::klass::Klass;

pub const MARK_OFFSET: i32 = 0;
pub const KLASS_OFFSET: i32 = 8;
pub const HEADER_SIZE: usize = 16;
pub const ARRAY_LENGTH_OFFSET: i32 = 16;
pub const ARRAY_BASE_OFFSET: i32 = 24;

/// Byte offset of instance field slot `index`.
pub const fn field_offset(index: usize) -> i32 {
    (HEADER_SIZE + index * 8) as i32
}

/// Java basic types, numbered as in the class file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
}

/// Size of tables indexed by `BasicType as usize`.
pub const NUMBER_OF_BASIC_TYPES: usize = 15;

impl BasicType {
    pub const ALL: [BasicType; 11] = [
        BasicType::Boolean,
        BasicType::Char,
        BasicType::Float,
        BasicType::Double,
        BasicType::Byte,
        BasicType::Short,
        BasicType::Int,
        BasicType::Long,
        BasicType::Object,
        BasicType::Array,
        BasicType::Void,
    ];

    pub fn from_u8(v: u8) -> Option<BasicType> {
        Self::ALL.iter().copied().find(|t| *t as u8 == v)
    }

    /// Type of a descriptor character (`L` and `[` start reference types).
    pub fn from_descriptor(c: u8) -> Option<BasicType> {
        Some(match c {
            b'Z' => BasicType::Boolean,
            b'C' => BasicType::Char,
            b'F' => BasicType::Float,
            b'D' => BasicType::Double,
            b'B' => BasicType::Byte,
            b'S' => BasicType::Short,
            b'I' => BasicType::Int,
            b'J' => BasicType::Long,
            b'L' => BasicType::Object,
            b'[' => BasicType::Array,
            b'V' => BasicType::Void,
            _ => return None,
        })
    }

    pub fn descriptor_char(self) -> char {
        match self {
            BasicType::Boolean => 'Z',
            BasicType::Char => 'C',
            BasicType::Float => 'F',
            BasicType::Double => 'D',
            BasicType::Byte => 'B',
            BasicType::Short => 'S',
            BasicType::Int => 'I',
            BasicType::Long => 'J',
            BasicType::Object => 'L',
            BasicType::Array => '[',
            BasicType::Void => 'V',
        }
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    /// Local variable / expression stack slots.
    pub fn slots(self) -> usize {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    /// Bytes of an array element.
    pub fn element_size(self) -> usize {
        match self {
            BasicType::Boolean | BasicType::Byte => 1,
            BasicType::Char | BasicType::Short => 2,
            BasicType::Int | BasicType::Float => 4,
            _ => 8,
        }
    }

    pub fn tos_state(self) -> TosState {
        match self {
            BasicType::Boolean => TosState::Ztos,
            BasicType::Char => TosState::Ctos,
            BasicType::Float => TosState::Ftos,
            BasicType::Double => TosState::Dtos,
            BasicType::Byte => TosState::Btos,
            BasicType::Short => TosState::Stos,
            BasicType::Int => TosState::Itos,
            BasicType::Long => TosState::Ltos,
            BasicType::Object | BasicType::Array => TosState::Atos,
            BasicType::Void => TosState::Vtos,
        }
    }

    /// Element type of a `newarray` operand.
    pub fn from_atype(atype: u8) -> Option<BasicType> {
        match atype {
            4..=11 => BasicType::from_u8(atype),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicType::Boolean => "boolean",
            BasicType::Char => "char",
            BasicType::Float => "float",
            BasicType::Double => "double",
            BasicType::Byte => "byte",
            BasicType::Short => "short",
            BasicType::Int => "int",
            BasicType::Long => "long",
            BasicType::Object => "object",
            BasicType::Array => "array",
            BasicType::Void => "void",
        }
    }
}

/// A reference to a heap object, or null.
///
/// The heap never moves objects, so an `Oop` stays valid for the life of
/// the VM. Accessors assume the reference is non-null and well formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Oop(usize);

impl Oop {
    pub const NULL: Oop = Oop(0);

    pub fn from_raw(addr: usize) -> Oop {
        Oop(addr)
    }

    pub fn raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn word(self, offset: i32) -> &'static AtomicU64 {
        debug_assert!(!self.is_null());
        // SAFETY: heap objects are 8-byte aligned and never freed while the VM lives.
        unsafe { &*((self.0 as isize + offset as isize) as *const AtomicU64) }
    }

    pub fn mark(self) -> &'static AtomicU64 {
        self.word(MARK_OFFSET)
    }

    pub fn klass_ptr(self) -> *const Klass {
        self.word(KLASS_OFFSET).load(Ordering::Relaxed) as usize as *const Klass
    }

    pub fn klass<'a>(self) -> &'a Klass {
        // SAFETY: every allocated object has its klass installed before it escapes.
        unsafe { &*self.klass_ptr() }
    }

    pub fn get_u64(self, offset: i32) -> u64 {
        self.word(offset).load(Ordering::Relaxed)
    }

    pub fn put_u64(self, offset: i32, value: u64) {
        self.word(offset).store(value, Ordering::Relaxed)
    }

    pub fn get_oop(self, offset: i32) -> Oop {
        Oop(self.get_u64(offset) as usize)
    }

    pub fn put_oop(self, offset: i32, value: Oop) {
        self.put_u64(offset, value.0 as u64)
    }

    /// Instance field slot `index`, raw.
    pub fn field(self, index: usize) -> u64 {
        self.get_u64(field_offset(index))
    }

    pub fn set_field(self, index: usize, value: u64) {
        self.put_u64(field_offset(index), value)
    }

    pub fn array_length(self) -> usize {
        self.get_u64(ARRAY_LENGTH_OFFSET) as u32 as usize
    }

    /// Address of element `index` of an array with `size`-byte elements.
    pub fn element_addr(self, index: usize, size: usize) -> usize {
        self.0 + ARRAY_BASE_OFFSET as usize + index * size
    }

    /// Raw element read, zero-extended.
    pub fn array_get(self, index: usize, elem: BasicType) -> u64 {
        let addr = self.element_addr(index, elem.element_size());
        // SAFETY: callers bound-check `index` against `array_length`.
        unsafe {
            match elem.element_size() {
                1 => (*(addr as *const AtomicU8)).load(Ordering::Relaxed) as u64,
                2 => (*(addr as *const AtomicU16)).load(Ordering::Relaxed) as u64,
                4 => (*(addr as *const AtomicU32)).load(Ordering::Relaxed) as u64,
                _ => (*(addr as *const AtomicU64)).load(Ordering::Relaxed),
            }
        }
    }

    pub fn array_set(self, index: usize, elem: BasicType, value: u64) {
        let addr = self.element_addr(index, elem.element_size());
        // SAFETY: as for `array_get`.
        unsafe {
            match elem.element_size() {
                1 => (*(addr as *const AtomicU8)).store(value as u8, Ordering::Relaxed),
                2 => (*(addr as *const AtomicU16)).store(value as u16, Ordering::Relaxed),
                4 => (*(addr as *const AtomicU32)).store(value as u32, Ordering::Relaxed),
                _ => (*(addr as *const AtomicU64)).store(value, Ordering::Relaxed),
            }
        }
    }

    /// View a handle (the address of a slot holding an oop) as the oop it names.
    pub fn from_handle(handle: usize) -> Oop {
        if handle == 0 {
            return Oop::NULL;
        }
        // SAFETY: handles point at stack slots or handle block entries.
        Oop(unsafe { (*(handle as *const AtomicUsize)).load(Ordering::Relaxed) })
    }
}

impl std::fmt::Display for Oop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            f.write_str("null")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_type_properties() {
        assert_eq!(BasicType::from_descriptor(b'J'), Some(BasicType::Long));
        assert_eq!(BasicType::Long.slots(), 2);
        assert_eq!(BasicType::Char.element_size(), 2);
        assert_eq!(BasicType::from_atype(10), Some(BasicType::Int));
        assert_eq!(BasicType::from_atype(12), None);
        assert_eq!(BasicType::Boolean.tos_state(), TosState::Ztos);
        for t in BasicType::ALL {
            assert!((t as usize) < NUMBER_OF_BASIC_TYPES);
            assert_eq!(BasicType::from_u8(t as u8), Some(t));
        }
    }

    #[test]
    fn test_raw_field_access() {
        let mut words = vec![0u64; 6];
        let obj = Oop::from_raw(words.as_mut_ptr() as usize);
        obj.set_field(1, 42);
        assert_eq!(obj.field(1), 42);
        assert_eq!(words[3], 42);
        obj.put_u64(ARRAY_LENGTH_OFFSET, 3);
        obj.array_set(2, BasicType::Short, 0xffff);
        assert_eq!(obj.array_get(2, BasicType::Short), 0xffff);
        assert_eq!(obj.array_length(), 3);
    }
}
