use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::config::InterpreterConfig;
use crate::error::{VmError, VmResult};
use crate::interpreter::bytecodes as bc;
use crate::interpreter::frame::FrameWalker;
use crate::interpreter::method_kind::MethodKind;
use crate::interpreter::stubs::StubId;
use crate::interpreter::Interpreter;

use super::barrier::SatbBarrier;
use super::bootstrap::{self, STRING_VALUE_SLOT, THROWABLE_MESSAGE_SLOT, names};
use super::classfile::ClassDefinition;
use super::compile::CompileBroker;
use super::constants::{ConstantPool, CpCacheEntry};
use super::heap::Heap;
use super::javacalls::{JavaCalls, JavaValue};
use super::jvmti::JvmtiState;
use super::klass::{FieldInfo, Klass, KlassKind, MIRROR_KLASS_SLOT};
use super::linker;
use super::method::{Method, access};
use super::natives::NativeRegistry;
use super::oop::{BasicType, NUMBER_OF_BASIC_TYPES, Oop};
use super::safepoint::SafepointSynchronizer;
use super::sync::ObjectSynchronizer;
use super::thread::JavaThread;

/// Loaded classes. Boxed so their addresses stay fixed; never unloaded.
#[derive(Default)]
struct ClassTable {
    by_name: HashMap<String, usize>,
    storage: Vec<Box<Klass>>,
}

/// One VM instance: generated interpreter, heap, classes and threads.
pub struct Vm {
    config: InterpreterConfig,
    /// Boxed before generation: generated code embeds these addresses.
    safepoint: Box<SafepointSynchronizer>,
    satb: Box<SatbBarrier>,
    interpreter: Interpreter,
    heap: Heap,
    sync: ObjectSynchronizer,
    compiler: CompileBroker,
    natives: NativeRegistry,
    jvmti: JvmtiState,
    classes: Mutex<ClassTable>,
    type_arrays: [AtomicPtr<Klass>; NUMBER_OF_BASIC_TYPES],
    strings: Mutex<HashMap<String, usize>>,
    threads: Mutex<Vec<Arc<JavaThread>>>,
    main_thread: OnceLock<Arc<JavaThread>>,
    finalizable: Mutex<Vec<Oop>>,
    fatal: Mutex<Vec<String>>,
    output: Mutex<String>,
    out_of_memory: AtomicUsize,
}

impl Vm {
    /// Generate the interpreter, define the system classes and attach the
    /// main thread.
    pub fn new(config: InterpreterConfig) -> VmResult<Arc<Vm>> {
        config.validate()?;
        let safepoint = Box::new(SafepointSynchronizer::new());
        let satb = Box::new(SatbBarrier::new());
        let interpreter = Interpreter::generate(&config, safepoint.poll_word_addr(), satb.marking_active_addr())?;
        log::info!(
            "interpreter generated: backend {}, {} codelets",
            config.backend.name(),
            interpreter.codelets().len()
        );
        let vm = Arc::new(Vm {
            config,
            safepoint,
            satb,
            interpreter,
            heap: Heap::new(),
            sync: ObjectSynchronizer::new(),
            compiler: CompileBroker::new(),
            natives: NativeRegistry::new(),
            jvmti: JvmtiState::new(),
            classes: Mutex::new(ClassTable::default()),
            type_arrays: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            strings: Mutex::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
            main_thread: OnceLock::new(),
            finalizable: Mutex::new(Vec::new()),
            fatal: Mutex::new(Vec::new()),
            output: Mutex::new(String::new()),
            out_of_memory: AtomicUsize::new(0),
        });
        bootstrap::initialize(&vm)?;
        let main = vm.attach_thread("main")?;
        let _ = vm.main_thread.set(main);
        Ok(vm)
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn sync(&self) -> &ObjectSynchronizer {
        &self.sync
    }

    pub fn satb(&self) -> &SatbBarrier {
        &self.satb
    }

    pub fn safepoint(&self) -> &SafepointSynchronizer {
        &self.safepoint
    }

    pub fn compiler(&self) -> &CompileBroker {
        &self.compiler
    }

    pub fn natives(&self) -> &NativeRegistry {
        &self.natives
    }

    pub fn jvmti(&self) -> &JvmtiState {
        &self.jvmti
    }

    // ----- threads -----

    pub fn attach_thread(&self, name: &str) -> VmResult<Arc<JavaThread>> {
        let thread = JavaThread::new(self, name)?;
        self.threads.lock().push(thread.clone());
        Ok(thread)
    }

    pub fn main_thread(&self) -> Option<Arc<JavaThread>> {
        self.main_thread.get().cloned()
    }

    pub fn threads(&self) -> Vec<Arc<JavaThread>> {
        self.threads.lock().clone()
    }

    /// Interpreter frames of `thread`, youngest first. Only meaningful
    /// while the thread is stopped in the VM.
    pub fn frames(&self, thread: &JavaThread) -> FrameWalker {
        FrameWalker::new(thread.anchors(), self.interpreter.stub(StubId::CallStubReturn))
    }

    /// Addresses of every reference slot in the thread's interpreter frames.
    pub fn frame_roots(&self, thread: &JavaThread) -> Vec<usize> {
        let mut roots = Vec::new();
        for frame in self.frames(thread) {
            frame.oops_do(|slot| roots.push(slot));
        }
        roots
    }

    // ----- classes -----

    pub fn find_class(&self, name: &str) -> Option<&Klass> {
        let addr = *self.classes.lock().by_name.get(name)?;
        // SAFETY: class table entries are boxed and never removed.
        Some(unsafe { &*(addr as *const Klass) })
    }

    pub fn class_count(&self) -> usize {
        self.classes.lock().storage.len()
    }

    /// Find a class by name, creating array classes from their descriptor.
    pub fn resolve_class(&self, name: &str) -> VmResult<&Klass> {
        if let Some(component) = name.strip_prefix('[') {
            let bytes = component.as_bytes();
            return match bytes.first() {
                Some(b'L') if component.ends_with(';') => {
                    let elem = self.resolve_class(&component[1..component.len() - 1])?;
                    self.array_klass_of(elem)
                }
                Some(b'[') => {
                    let elem = self.resolve_class(component)?;
                    self.array_klass_of(elem)
                }
                Some(c) if bytes.len() == 1 => BasicType::from_descriptor(*c)
                    .filter(|t| !t.is_reference() && *t != BasicType::Void)
                    .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
                    .and_then(|t| self.type_array_klass(t)),
                _ => Err(VmError::ClassNotFound(name.to_string())),
            };
        }
        self.find_class(name)
            .ok_or_else(|| VmError::ClassNotFound(name.to_string()))
    }

    /// Insert a fully built class and return its permanent address.
    fn register(&self, klass: Box<Klass>) -> VmResult<&Klass> {
        let mut table = self.classes.lock();
        if table.by_name.contains_key(klass.name()) {
            return Err(VmError::Link(format!("duplicate class {}", klass.name())));
        }
        let addr = &*klass as *const Klass as usize;
        table.by_name.insert(klass.name().to_string(), addr);
        table.storage.push(klass);
        // SAFETY: just boxed into the table, which never drops classes.
        Ok(unsafe { &*(addr as *const Klass) })
    }

    fn allocate_mirror(&self, klass: &Klass) -> VmResult<()> {
        let Some(class_klass) = self.find_class(names::CLASS) else {
            // java/lang/Class itself is not defined yet; fixed up at bootstrap
            return Ok(());
        };
        let mirror = self
            .heap
            .allocate_instance(class_klass, 1 + klass.static_slots())
            .ok_or_else(|| out_of_memory("Java heap space"))?;
        mirror.set_field(MIRROR_KLASS_SLOT, klass as *const Klass as u64);
        klass.set_mirror(mirror);
        Ok(())
    }

    /// Give classes defined before `java/lang/Class` their mirrors.
    pub(crate) fn create_missing_mirrors(&self) -> VmResult<()> {
        let pending: Vec<usize> = self
            .classes
            .lock()
            .storage
            .iter()
            .filter(|k| k.mirror().is_null())
            .map(|k| &**k as *const Klass as usize)
            .collect();
        for addr in pending {
            // SAFETY: addresses of boxed classes taken from the table.
            self.allocate_mirror(unsafe { &*(addr as *const Klass) })?;
        }
        Ok(())
    }

    /// Array classes extend Object and share its vtable.
    fn new_array_klass(&self, name: &str, kind: KlassKind) -> VmResult<Box<Klass>> {
        let object = self.resolve_class(names::OBJECT)?;
        let mut klass = Box::new(Klass::empty(name, kind));
        klass.access_flags = access::PUBLIC | access::FINAL;
        klass.super_klass = object as *const Klass;
        klass.vtable = object.vtable().to_vec().into_boxed_slice();
        klass.vtable_base = klass.vtable.as_ptr() as usize;
        Ok(klass)
    }

    pub(crate) fn create_type_array_klass(&self, ty: BasicType) -> VmResult<&Klass> {
        let name = format!("[{}", ty.descriptor_char());
        let klass = self.new_array_klass(&name, KlassKind::TypeArray(ty))?;
        let klass = self.register(klass)?;
        self.allocate_mirror(klass)?;
        self.type_arrays[ty as usize].store(klass as *const Klass as *mut Klass, Ordering::Release);
        Ok(klass)
    }

    /// Class of primitive arrays of `ty`.
    pub fn type_array_klass(&self, ty: BasicType) -> VmResult<&Klass> {
        let p = self.type_arrays[ty as usize].load(Ordering::Acquire);
        // SAFETY: published once by `create_type_array_klass`; classes are immortal.
        unsafe { p.as_ref() }.ok_or_else(|| VmError::ClassNotFound(format!("[{}", ty.descriptor_char())))
    }

    /// Class of arrays whose elements are `elem`, created on first use.
    pub fn array_klass_of<'a>(&'a self, elem: &'a Klass) -> VmResult<&'a Klass> {
        if let Some(k) = elem.array_klass() {
            return Ok(k);
        }
        let name = if elem.is_array() {
            format!("[{}", elem.name())
        } else {
            format!("[L{};", elem.name())
        };
        // another thread may have created it meanwhile
        if let Some(k) = self.find_class(&name) {
            return Ok(k);
        }
        let mut klass = self.new_array_klass(&name, KlassKind::ObjArray)?;
        klass.element_klass = elem as *const Klass;
        let klass = match self.register(klass) {
            Ok(k) => k,
            Err(_) => return self.resolve_class(&name),
        };
        self.allocate_mirror(klass)?;
        elem.array_klass
            .store(klass as *const Klass as *mut Klass, Ordering::Release);
        log::trace!("array class {} created", name);
        Ok(klass)
    }

    /// Link a class definition: lay out fields, build methods, vtable,
    /// constant pool cache and mirror, and select each method's entry.
    pub fn define_class(&self, def: ClassDefinition) -> VmResult<&Klass> {
        if self.find_class(&def.name).is_some() {
            return Err(VmError::Link(format!("duplicate class {}", def.name)));
        }
        let super_klass = match &def.super_name {
            Some(name) => Some(self.resolve_class(name)?),
            None => None,
        };
        if let Some(s) = super_klass {
            if s.is_interface() || s.is_array() {
                return Err(VmError::Link(format!("{} cannot extend {}", def.name, s.name())));
            }
        }
        let mut klass = Box::new(Klass::empty(&def.name, KlassKind::Instance));
        klass.access_flags = def.access_flags;
        if let Some(s) = super_klass {
            klass.super_klass = s as *const Klass;
            klass.has_finalizer = s.has_finalizer;
        }
        for name in &def.interfaces {
            let iface = self.resolve_class(name)?;
            if !iface.is_interface() {
                return Err(VmError::Link(format!("{} is not an interface", name)));
            }
            klass.interfaces.push(iface as *const Klass);
        }

        // fields: instance slots follow the superclass's, statics follow
        // the klass word of the mirror
        let mut instance_slot = super_klass.map_or(0, |s| s.instance_slots());
        let mut static_slot = MIRROR_KLASS_SLOT + 1;
        for f in &def.fields {
            let is_static = f.access_flags & access::STATIC != 0;
            let slot = if is_static { &mut static_slot } else { &mut instance_slot };
            klass.fields.push(FieldInfo {
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                access_flags: f.access_flags,
                slot: *slot,
            });
            *slot += 1;
        }
        klass.instance_slots = instance_slot;
        klass.static_slots = static_slot - MIRROR_KLASS_SLOT - 1;

        let cache: Vec<CpCacheEntry> = (0..def.constants.len()).map(|i| CpCacheEntry::new(i as u16)).collect();
        klass.cache = cache.into_boxed_slice();
        klass.constants = Box::new(ConstantPool::new(def.constants));

        let is_object = def.super_name.is_none();
        for mut spec in def.methods {
            // Object.<init> registers finalizable instances on return
            if is_object && spec.name == "<init>" && spec.code == [bc::RETURN] {
                spec.code = vec![bc::RETURN_REGISTER_FINALIZER];
            }
            let name = format!("{}.{}{}", def.name, spec.name, spec.descriptor);
            let method = Method::new(spec).ok_or_else(|| VmError::Link(format!("bad descriptor in {}", name)))?;
            if !method.is_native() && !method.is_abstract() && method.code().is_empty() {
                return Err(VmError::Link(format!("{} has no code", name)));
            }
            if !is_object && method.name() == "finalize" && method.descriptor() == "()V" {
                klass.has_finalizer = 1;
            }
            klass.methods.push(Box::new(method));
        }

        // vtable: inherited entries, overridden in place, then new ones
        let mut vtable: Vec<usize> = super_klass.map_or_else(Vec::new, |s| s.vtable().to_vec());
        if !klass.is_interface() {
            for m in klass.methods.iter_mut() {
                if m.is_static() || m.is_private() || m.is_initializer() {
                    continue;
                }
                let addr = &**m as *const Method as usize;
                let overridden = vtable.iter().position(|e| {
                    // SAFETY: vtable entries are methods of loaded classes.
                    let other = unsafe { &*(*e as *const Method) };
                    other.name() == m.name() && other.descriptor() == m.descriptor()
                });
                let index = match overridden {
                    Some(i) => {
                        vtable[i] = addr;
                        i
                    }
                    None => {
                        vtable.push(addr);
                        vtable.len() - 1
                    }
                };
                m.vtable_index = index as i32;
            }
        }
        klass.vtable = vtable.into_boxed_slice();
        klass.vtable_base = klass.vtable.as_ptr() as usize;

        let holder: *const Klass = &*klass;
        let constants: *const ConstantPool = &*klass.constants;
        let cache = klass.cache.as_ptr();
        for m in klass.methods.iter_mut() {
            m.holder = holder;
            m.constants = constants;
            m.cache = cache;
        }
        for m in klass.methods() {
            let kind = MethodKind::for_method(m);
            m.set_kind(kind);
            m.set_entry(self.interpreter.entry_for(kind));
        }

        let klass = self.register(klass)?;
        self.allocate_mirror(klass)?;
        log::debug!(
            "class {} defined: {} methods, {} vtable entries, {} instance slots",
            klass.name(),
            klass.methods().count(),
            klass.vtable().len(),
            klass.instance_slots()
        );
        Ok(klass)
    }

    // ----- allocation -----

    pub fn allocate_instance(&self, klass: &Klass) -> VmResult<Oop> {
        self.heap
            .allocate_instance(klass, klass.instance_slots())
            .ok_or_else(|| out_of_memory("Java heap space"))
    }

    pub fn allocate_array(&self, klass: &Klass, length: usize) -> VmResult<Oop> {
        let elem = match klass.kind() {
            KlassKind::TypeArray(t) => t,
            KlassKind::ObjArray => BasicType::Object,
            KlassKind::Instance => {
                return Err(VmError::Link(format!("{} is not an array class", klass.name())));
            }
        };
        self.heap
            .allocate_array(klass, elem, length)
            .ok_or_else(|| out_of_memory("Requested array size exceeds VM limit"))
    }

    /// Nested arrays for `multianewarray`; `lengths` are outermost first.
    pub fn new_multi_array(&self, klass: &Klass, lengths: &[i32]) -> VmResult<Oop> {
        let Some((&first, rest)) = lengths.split_first() else {
            return Err(VmError::Link("multianewarray without dimensions".into()));
        };
        if first < 0 {
            return Err(VmError::Throw {
                class: names::NEGATIVE_ARRAY_SIZE_EXCEPTION,
                message: Some(first.to_string()),
            });
        }
        let array = self.allocate_array(klass, first as usize)?;
        if let (false, Some(elem)) = (rest.is_empty(), klass.element_klass()) {
            for i in 0..first as usize {
                let sub = self.new_multi_array(elem, rest)?;
                array.array_set(i, BasicType::Object, sub.raw() as u64);
            }
        }
        Ok(array)
    }

    // ----- strings -----

    pub fn new_string(&self, s: &str) -> VmResult<Oop> {
        let chars: Vec<u16> = s.encode_utf16().collect();
        let value = self.allocate_array(self.type_array_klass(BasicType::Char)?, chars.len())?;
        for (i, c) in chars.iter().enumerate() {
            value.array_set(i, BasicType::Char, *c as u64);
        }
        let string = self.allocate_instance(self.resolve_class(names::STRING)?)?;
        string.set_field(STRING_VALUE_SLOT, value.raw() as u64);
        Ok(string)
    }

    /// The canonical string object for a literal.
    pub fn intern(&self, s: &str) -> VmResult<Oop> {
        let mut strings = self.strings.lock();
        if let Some(addr) = strings.get(s) {
            return Ok(Oop::from_raw(*addr));
        }
        let obj = self.new_string(s)?;
        strings.insert(s.to_string(), obj.raw());
        Ok(obj)
    }

    pub fn string_value(&self, obj: Oop) -> Option<String> {
        if obj.is_null() || obj.klass().name() != names::STRING {
            return None;
        }
        let value = Oop::from_raw(obj.field(STRING_VALUE_SLOT) as usize);
        if value.is_null() {
            return None;
        }
        let chars: Vec<u16> = (0..value.array_length())
            .map(|i| value.array_get(i, BasicType::Char) as u16)
            .collect();
        Some(String::from_utf16_lossy(&chars))
    }

    // ----- exceptions -----

    pub(crate) fn preallocate_out_of_memory_error(&self) -> VmResult<()> {
        let oom = self.allocate_instance(self.resolve_class(names::OUT_OF_MEMORY_ERROR)?)?;
        let message = self.new_string("Java heap space")?;
        oom.set_field(THROWABLE_MESSAGE_SLOT, message.raw() as u64);
        self.out_of_memory.store(oom.raw(), Ordering::Release);
        Ok(())
    }

    /// Thrown when allocating the real exception fails.
    pub fn out_of_memory_error(&self) -> Oop {
        Oop::from_raw(self.out_of_memory.load(Ordering::Acquire))
    }

    /// A new throwable of `class` with its message field set. No
    /// constructor runs. Falls back to the preallocated
    /// `OutOfMemoryError` if the exception itself cannot be created.
    pub fn new_exception(&self, class: &str, message: Option<String>) -> Oop {
        let build = || -> VmResult<Oop> {
            let klass = self.resolve_class(class)?;
            let obj = self.allocate_instance(klass)?;
            if let Some(m) = &message {
                let s = self.new_string(m)?;
                obj.set_field(THROWABLE_MESSAGE_SLOT, s.raw() as u64);
            }
            Ok(obj)
        };
        match build() {
            Ok(obj) => obj,
            Err(e) => {
                log::warn!("cannot create {}: {}", class, e);
                self.out_of_memory_error()
            }
        }
    }

    /// Message field of a throwable.
    pub fn exception_message(&self, exception: Oop) -> Option<String> {
        if exception.is_null() {
            return None;
        }
        self.string_value(Oop::from_raw(exception.field(THROWABLE_MESSAGE_SLOT) as usize))
    }

    /// Make a new exception pending in `thread`.
    pub fn throw(&self, thread: &JavaThread, class: &str, message: Option<String>) {
        log::trace!("thread {}: throw {} {:?}", thread.id(), class, message);
        thread.set_pending_exception(self.new_exception(class, message));
    }

    /// The Java exception that reports `error` to Java code.
    pub fn exception_for(&self, error: VmError) -> Oop {
        match error {
            VmError::Throw { class, message } => self.new_exception(class, message),
            VmError::UncaughtException { class, message } => self.new_exception(&class, message),
            VmError::ClassNotFound(name) => self.new_exception(names::NO_CLASS_DEF_FOUND_ERROR, Some(name)),
            VmError::MethodNotFound { class, name, descriptor } => self.new_exception(
                names::NO_SUCH_METHOD_ERROR,
                Some(format!("{}.{}{}", class, name, descriptor)),
            ),
            VmError::Link(msg) => self.new_exception(names::LINKAGE_ERROR, Some(msg)),
            VmError::Memory(e) => self.new_exception(names::OUT_OF_MEMORY_ERROR, Some(e.to_string())),
            other => {
                let msg = other.to_string();
                self.record_fatal(&msg);
                self.new_exception(names::INTERNAL_ERROR, Some(msg))
            }
        }
    }

    pub fn throw_error(&self, thread: &JavaThread, error: VmError) {
        log::trace!("thread {}: {}", thread.id(), error);
        thread.set_pending_exception(self.exception_for(error));
    }

    /// Turn an uncaught exception into the error reported to embedders.
    pub fn uncaught(&self, exception: Oop) -> VmError {
        let class = if exception.is_null() {
            names::NULL_POINTER_EXCEPTION.to_string()
        } else {
            exception.klass().name().to_string()
        };
        VmError::UncaughtException {
            class,
            message: self.exception_message(exception),
        }
    }

    // ----- bookkeeping -----

    pub(crate) fn record_fatal(&self, message: &str) {
        log::error!("fatal: {}", message);
        self.fatal.lock().push(message.to_string());
    }

    /// Internal errors recorded since the last call.
    pub fn take_fatal(&self) -> Vec<String> {
        std::mem::take(&mut *self.fatal.lock())
    }

    pub(crate) fn register_finalizer(&self, obj: Oop) {
        if obj.is_null() {
            return;
        }
        log::trace!("finalizable {} registered", obj.klass().name());
        self.finalizable.lock().push(obj);
    }

    /// Objects registered for finalization, oldest first.
    pub fn finalizable_objects(&self) -> Vec<Oop> {
        self.finalizable.lock().clone()
    }

    pub(crate) fn write_output(&self, text: &str, newline: bool) {
        let mut out = self.output.lock();
        out.push_str(text);
        if newline {
            out.push('\n');
        }
    }

    /// Text printed through `System.print*` since the last call.
    pub fn take_output(&self) -> String {
        std::mem::take(&mut *self.output.lock())
    }

    // ----- calls -----

    /// Run a static method on the main thread, initializing its class first.
    pub fn call_static(&self, class: &str, name: &str, descriptor: &str, args: &[JavaValue]) -> VmResult<JavaValue> {
        let klass = self.resolve_class(class)?;
        let method = klass
            .find_method(name, descriptor)
            .filter(|m| m.is_static())
            .ok_or_else(|| VmError::MethodNotFound {
                class: class.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })?;
        let thread = self
            .main_thread()
            .ok_or_else(|| VmError::Program("no main thread".into()))?;
        linker::initialize_class(self, &thread, klass).map_err(|e| match e {
            VmError::Throw { class, message } => VmError::UncaughtException {
                class: class.to_string(),
                message,
            },
            other => other,
        })?;
        JavaCalls::call(&thread, method, args)
    }
}

fn out_of_memory(message: &str) -> VmError {
    VmError::Throw {
        class: names::OUT_OF_MEMORY_ERROR,
        message: Some(message.to_string()),
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("backend", &self.config.backend)
            .field("classes", &self.class_count())
            .field("threads", &self.threads.lock().len())
            .finish()
    }
}

// SAFETY: shared state is behind locks or atomics; classes and methods are
// immutable after definition apart from their atomic fields.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::classfile::ClassBuilder;

    fn vm() -> Arc<Vm> {
        Vm::new(InterpreterConfig::default()).unwrap()
    }

    #[test]
    fn test_bootstrap_defines_system_classes() {
        let vm = vm();
        for name in [names::OBJECT, names::STRING, names::THROWABLE, names::NULL_POINTER_EXCEPTION, names::MATH] {
            let k = vm.find_class(name).unwrap();
            assert!(!k.mirror().is_null(), "{} has no mirror", name);
        }
        let object = vm.find_class(names::OBJECT).unwrap();
        assert!(object.mirror().klass().name() == names::CLASS);
        assert!(!vm.out_of_memory_error().is_null());
        assert!(vm.main_thread().is_some());
    }

    #[test]
    fn test_strings_round_trip_and_intern() {
        let vm = vm();
        let s = vm.new_string("héllo").unwrap();
        assert_eq!(vm.string_value(s).as_deref(), Some("héllo"));
        assert_eq!(vm.intern("x").unwrap(), vm.intern("x").unwrap());
        assert_ne!(vm.new_string("x").unwrap(), vm.intern("x").unwrap());
    }

    #[test]
    fn test_array_classes_by_descriptor() {
        let vm = vm();
        let ints = vm.resolve_class("[I").unwrap();
        assert_eq!(ints.kind(), KlassKind::TypeArray(BasicType::Int));
        let strings = vm.resolve_class("[[Ljava/lang/String;").unwrap();
        assert_eq!(strings.name(), "[[Ljava/lang/String;");
        assert_eq!(strings.element_klass().unwrap().name(), "[Ljava/lang/String;");
        assert!(std::ptr::eq(vm.resolve_class("[[Ljava/lang/String;").unwrap(), strings));
        assert!(vm.resolve_class("[Q").is_err());
    }

    #[test]
    fn test_vtable_overrides_in_place() {
        let vm = vm();
        let mut base = ClassBuilder::new("Base");
        base.method("f", "()I", access::PUBLIC, |c| {
            c.iconst(1).op(bc::IRETURN);
        })
        .unwrap();
        base.method("g", "()I", access::PUBLIC, |c| {
            c.iconst(2).op(bc::IRETURN);
        })
        .unwrap();
        let base = vm.define_class(base.build()).unwrap();
        let mut derived = ClassBuilder::new("Derived");
        derived.super_class("Base");
        derived
            .method("g", "()I", access::PUBLIC, |c| {
                c.iconst(3).op(bc::IRETURN);
            })
            .unwrap();
        let derived = vm.define_class(derived.build()).unwrap();
        assert_eq!(derived.vtable().len(), base.vtable().len());
        let g = derived.find_method("g", "()I").unwrap();
        let base_g = base.find_method("g", "()I").unwrap();
        assert_eq!(g.vtable_index(), base_g.vtable_index());
        assert!(g.entry() != 0);
    }

    #[test]
    fn test_object_init_registers_finalizers() {
        let vm = vm();
        let object = vm.find_class(names::OBJECT).unwrap();
        let init = object.find_method("<init>", "()V").unwrap();
        assert_eq!(init.code(), [bc::RETURN_REGISTER_FINALIZER]);
        assert!(!object.has_finalizer());
    }

    #[test]
    fn test_exception_for_maps_vm_errors() {
        let vm = vm();
        let e = vm.exception_for(VmError::ClassNotFound("Nope".into()));
        assert_eq!(e.klass().name(), names::NO_CLASS_DEF_FOUND_ERROR);
        assert_eq!(vm.exception_message(e).as_deref(), Some("Nope"));
        let e = vm.exception_for(VmError::Program("boom".into()));
        assert_eq!(e.klass().name(), names::INTERNAL_ERROR);
        assert_eq!(vm.take_fatal().len(), 1);
    }
}
