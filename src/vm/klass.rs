//! Class metadata.

use std::mem::offset_of;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::interpreter::tos::TosState;

use super::constants::{ConstantPool, CpCacheEntry};
use super::method::{Method, access};
use super::oop::{BasicType, Oop, field_offset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassState {
    Linked = 0,
    BeingInitialized,
    Initialized,
    Erroneous,
}

impl ClassState {
    fn from_u8(v: u8) -> ClassState {
        match v {
            1 => ClassState::BeingInitialized,
            2 => ClassState::Initialized,
            3 => ClassState::Erroneous,
            _ => ClassState::Linked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlassKind {
    Instance,
    /// Array of a primitive element type.
    TypeArray(BasicType),
    /// Array of references; the element class is `element_klass`.
    ObjArray,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub descriptor: String,
    pub access_flags: u32,
    /// Slot in the instance, or in the mirror for static fields.
    pub slot: usize,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.access_flags & access::STATIC != 0
    }

    pub fn offset(&self) -> i32 {
        field_offset(self.slot)
    }

    pub fn tos_state(&self) -> TosState {
        TosState::from_descriptor(self.descriptor.as_bytes()[0]).unwrap_or(TosState::Atos)
    }
}

#[repr(C)]
pub struct Klass {
    pub(crate) vtable_base: usize,
    pub(crate) mirror: AtomicUsize,
    pub(crate) element_klass: *const Klass,
    pub(crate) has_finalizer: u8,
    pub(crate) init_state: AtomicU8,
    pub(crate) name: String,
    pub(crate) kind: KlassKind,
    pub(crate) super_klass: *const Klass,
    pub(crate) interfaces: Vec<*const Klass>,
    pub(crate) access_flags: u32,
    pub(crate) fields: Vec<FieldInfo>,
    pub(crate) instance_slots: usize,
    pub(crate) static_slots: usize,
    pub(crate) methods: Vec<Box<Method>>,
    pub(crate) vtable: Box<[usize]>,
    pub(crate) constants: Box<ConstantPool>,
    pub(crate) cache: Box<[CpCacheEntry]>,
    pub(crate) array_klass: AtomicPtr<Klass>,
    pub(crate) init_thread: AtomicUsize,
}

pub mod offsets {
    use super::*;

    pub const VTABLE_BASE: i32 = offset_of!(Klass, vtable_base) as i32;
    pub const MIRROR: i32 = offset_of!(Klass, mirror) as i32;
    pub const ELEMENT_KLASS: i32 = offset_of!(Klass, element_klass) as i32;
    pub const HAS_FINALIZER: i32 = offset_of!(Klass, has_finalizer) as i32;
    pub const INIT_STATE: i32 = offset_of!(Klass, init_state) as i32;
}

/// Mirror slot holding the `Klass` address; statics follow it.
pub const MIRROR_KLASS_SLOT: usize = 0;

impl Klass {
    pub(crate) fn empty(name: &str, kind: KlassKind) -> Klass {
        Klass {
            vtable_base: 0,
            mirror: AtomicUsize::new(0),
            element_klass: std::ptr::null(),
            has_finalizer: 0,
            init_state: AtomicU8::new(ClassState::Linked as u8),
            name: name.to_string(),
            kind,
            super_klass: std::ptr::null(),
            interfaces: Vec::new(),
            access_flags: access::PUBLIC,
            fields: Vec::new(),
            instance_slots: 0,
            static_slots: 0,
            methods: Vec::new(),
            vtable: Box::new([]),
            constants: Box::new(ConstantPool::new(Vec::new())),
            cache: Box::new([]),
            array_klass: AtomicPtr::new(std::ptr::null_mut()),
            init_thread: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(name: &str) -> Klass {
        Klass::empty(name, KlassKind::Instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> KlassKind {
        self.kind
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.kind, KlassKind::Instance)
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & access::INTERFACE != 0
    }

    pub fn is_abstract(&self) -> bool {
        self.access_flags & access::ABSTRACT != 0
    }

    pub fn super_klass(&self) -> Option<&Klass> {
        // SAFETY: classes are never unloaded.
        unsafe { self.super_klass.as_ref() }
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Klass> {
        // SAFETY: as for `super_klass`.
        self.interfaces.iter().map(|k| unsafe { &**k })
    }

    pub fn element_klass(&self) -> Option<&Klass> {
        // SAFETY: as for `super_klass`.
        unsafe { self.element_klass.as_ref() }
    }

    pub fn mirror(&self) -> Oop {
        Oop::from_raw(self.mirror.load(Ordering::Acquire))
    }

    pub(crate) fn set_mirror(&self, mirror: Oop) {
        self.mirror.store(mirror.raw(), Ordering::Release);
    }

    pub fn state(&self) -> ClassState {
        ClassState::from_u8(self.init_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ClassState) {
        self.init_state.store(state as u8, Ordering::Release);
    }

    pub fn has_finalizer(&self) -> bool {
        self.has_finalizer != 0
    }

    pub fn instance_slots(&self) -> usize {
        self.instance_slots
    }

    pub fn static_slots(&self) -> usize {
        self.static_slots
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter().map(|m| &**m)
    }

    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    pub fn vtable(&self) -> &[usize] {
        &self.vtable
    }

    /// Method declared by this class.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods()
            .find(|m| m.name() == name && m.descriptor() == descriptor)
    }

    /// Method declared here or inherited from a superclass.
    pub fn lookup_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        let mut k = Some(self);
        while let Some(klass) = k {
            if let Some(m) = klass.find_method(name, descriptor) {
                return Some(m);
            }
            k = klass.super_klass();
        }
        None
    }

    /// Concrete implementation of an interface method for a receiver class,
    /// falling back to the interface declaration (which may be abstract).
    pub fn lookup_interface_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        if let Some(m) = self.lookup_method(name, descriptor).filter(|m| !m.is_static()) {
            return Some(m);
        }
        let mut k = Some(self);
        while let Some(klass) = k {
            for iface in klass.interfaces() {
                if let Some(m) = iface.lookup_interface_method(name, descriptor) {
                    return Some(m);
                }
            }
            k = klass.super_klass();
        }
        None
    }

    /// Field declared here or in a superclass (or superinterface for statics).
    pub fn find_field(&self, name: &str, descriptor: &str) -> Option<(&Klass, &FieldInfo)> {
        let mut k = Some(self);
        while let Some(klass) = k {
            if let Some(f) = klass
                .fields
                .iter()
                .find(|f| f.name == name && f.descriptor == descriptor)
            {
                return Some((klass, f));
            }
            for iface in klass.interfaces() {
                if let Some(found) = iface.find_field(name, descriptor) {
                    return Some(found);
                }
            }
            k = klass.super_klass();
        }
        None
    }

    pub fn is_subclass_of(&self, other: &Klass) -> bool {
        let mut k = Some(self);
        while let Some(klass) = k {
            if std::ptr::eq(klass, other) {
                return true;
            }
            k = klass.super_klass();
        }
        false
    }

    pub fn implements(&self, iface: &Klass) -> bool {
        let mut k = Some(self);
        while let Some(klass) = k {
            for i in klass.interfaces() {
                if std::ptr::eq(i, iface) || i.implements(iface) {
                    return true;
                }
            }
            k = klass.super_klass();
        }
        false
    }

    /// Assignment compatibility, including array covariance.
    pub fn is_subtype_of(&self, other: &Klass) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (self.kind, other.kind) {
            (_, KlassKind::Instance) if other.is_interface() => self.implements(other),
            (KlassKind::Instance, KlassKind::Instance) => self.is_subclass_of(other),
            // arrays extend Object
            (_, KlassKind::Instance) => other.super_klass.is_null(),
            (KlassKind::ObjArray, KlassKind::ObjArray) => match (self.element_klass(), other.element_klass()) {
                (Some(a), Some(b)) => a.is_subtype_of(b),
                _ => false,
            },
            _ => false,
        }
    }

    pub fn static_field_oop(&self, name: &str) -> Option<(Oop, i32)> {
        let f = self.fields.iter().find(|f| f.name == name && f.is_static())?;
        Some((self.mirror(), f.offset()))
    }

    pub fn cache_entry(&self, index: usize) -> Option<&CpCacheEntry> {
        self.cache.get(index)
    }

    pub fn array_klass(&self) -> Option<&Klass> {
        // SAFETY: published once; array classes are never unloaded.
        unsafe { self.array_klass.load(Ordering::Acquire).as_ref() }
    }
}

impl std::fmt::Debug for Klass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Klass")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

// SAFETY: raw pointers name other immortal classes; mutable state is atomic.
unsafe impl Send for Klass {}
unsafe impl Sync for Klass {}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> (Box<Klass>, Box<Klass>, Box<Klass>) {
        let object = Box::new(Klass::new_for_test("java/lang/Object"));
        let mut iface = Box::new(Klass::new_for_test("Shape"));
        iface.access_flags |= access::INTERFACE;
        iface.super_klass = &*object;
        let mut sub = Box::new(Klass::new_for_test("Circle"));
        sub.super_klass = &*object;
        sub.interfaces.push(&*iface);
        (object, iface, sub)
    }

    #[test]
    fn test_subtyping() {
        let (object, iface, sub) = chain();
        assert!(sub.is_subtype_of(&object));
        assert!(sub.is_subtype_of(&iface));
        assert!(!object.is_subtype_of(&sub));

        let mut arr = Klass::empty("[LCircle;", KlassKind::ObjArray);
        arr.element_klass = &*sub;
        let mut arr_obj = Klass::empty("[Ljava/lang/Object;", KlassKind::ObjArray);
        arr_obj.element_klass = &*object;
        assert!(arr.is_subtype_of(&arr_obj));
        assert!(arr.is_subtype_of(&object));
        assert!(!arr_obj.is_subtype_of(&arr));
        let ints = Klass::empty("[I", KlassKind::TypeArray(BasicType::Int));
        assert!(!ints.is_subtype_of(&arr_obj));
    }

    #[test]
    fn test_state_transitions() {
        let k = Klass::new_for_test("T");
        assert_eq!(k.state(), ClassState::Linked);
        k.set_state(ClassState::Initialized);
        assert_eq!(k.state(), ClassState::Initialized);
    }
}
