//! Runtime ownership and teardown.
//!
//! [`Runtime`] owns the engine heap and tracks every context created on
//! it. Dropping the runtime abandons surviving contexts first (which
//! force-invalidates their values), then releases the heap, so teardown
//! is safe in any order relative to outstanding [`crate::Context`] and
//! [`crate::Value`] handles.

use std::alloc::{self, Layout};
use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::class::{ClassSpec, NativeClass};
use crate::context::{Context, ContextInner};
use crate::engine::{AllocHooks, ClassId, Engine, RawRuntime, RawValue};
use crate::tracker::{Handle, Tracker};

/// Custom allocator hooks for the engine heap.
///
/// The defaults delegate to the global allocator; implementors typically
/// override to account or cap script memory.
pub trait MemoryHooks: 'static {
    fn alloc(&self, size: usize) -> *mut u8 {
        match Layout::from_size_align(size.max(1), ALLOC_ALIGN) {
            Ok(layout) => unsafe { alloc::alloc(layout) },
            Err(_) => ptr::null_mut(),
        }
    }

    fn free(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size.max(1), ALLOC_ALIGN) {
            unsafe { alloc::dealloc(ptr, layout) }
        }
    }

    fn realloc(&self, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr, old_size);
            return ptr::null_mut();
        }
        match Layout::from_size_align(old_size.max(1), ALLOC_ALIGN) {
            Ok(layout) => unsafe { alloc::realloc(ptr, layout, new_size) },
            Err(_) => ptr::null_mut(),
        }
    }
}

const ALLOC_ALIGN: usize = 16;

struct HooksBox(Box<dyn MemoryHooks>);

fn hook_alloc(opaque: *mut c_void, size: usize) -> *mut u8 {
    unsafe { &*(opaque as *const HooksBox) }.0.alloc(size)
}

fn hook_free(opaque: *mut c_void, ptr: *mut u8, size: usize) {
    unsafe { &*(opaque as *const HooksBox) }.0.free(ptr, size)
}

fn hook_realloc(opaque: *mut c_void, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    unsafe { &*(opaque as *const HooksBox) }
        .0
        .realloc(ptr, old_size, new_size)
}

/// Identity-table entry for one shared native instance: how many live
/// script wrappers exist and a non-owning reference to the wrapper object.
struct InstRef {
    refs: u32,
    weak_val: RawValue,
}

pub(crate) struct RuntimeInner {
    engine: Rc<dyn Engine>,
    raw: RawRuntime,
    contexts: RefCell<Tracker<Weak<ContextInner>>>,
    insts: RefCell<FxHashMap<usize, InstRef>>,
    class_ids: RefCell<FxHashMap<TypeId, ClassId>>,
    class_specs: RefCell<FxHashMap<TypeId, Rc<dyn Any>>>,
    hooks: Cell<*mut HooksBox>,
}

impl RuntimeInner {
    pub(crate) fn raw(&self) -> RawRuntime {
        self.raw
    }

    pub(crate) fn untrack_context(&self, slot: Handle) {
        self.contexts.borrow_mut().remove(slot);
    }

    /// Engine class id for `T`, allocated on first use. Ids are scoped to
    /// this runtime, never process-global.
    pub(crate) fn class_id_for<T: NativeClass>(&self) -> ClassId {
        *self
            .class_ids
            .borrow_mut()
            .entry(TypeId::of::<T>())
            .or_insert_with(|| self.engine.new_class_id(self.raw))
    }

    pub(crate) fn lookup_class_id(&self, type_id: TypeId) -> Option<ClassId> {
        self.class_ids.borrow().get(&type_id).copied()
    }

    /// The cached spec of `T`, built once per runtime.
    pub(crate) fn spec_for<T: NativeClass>(&self) -> Rc<ClassSpec<T>> {
        let mut specs = self.class_specs.borrow_mut();
        let entry = specs
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Rc::new(T::spec()) as Rc<dyn Any>);
        match entry.clone().downcast::<ClassSpec<T>>() {
            Ok(spec) => spec,
            // Unreachable: the entry is keyed by T's TypeId.
            Err(_) => Rc::new(T::spec()),
        }
    }

    pub(crate) fn try_spec<T: NativeClass>(&self) -> Option<Rc<ClassSpec<T>>> {
        let specs = self.class_specs.borrow();
        specs
            .get(&TypeId::of::<T>())
            .and_then(|e| e.clone().downcast::<ClassSpec<T>>().ok())
    }

    pub(crate) fn ref_instance(&self, addr: usize, weak_val: RawValue) {
        let mut insts = self.insts.borrow_mut();
        insts
            .entry(addr)
            .and_modify(|e| e.refs += 1)
            .or_insert(InstRef { refs: 1, weak_val });
    }

    pub(crate) fn unref_instance(&self, addr: usize) {
        let mut insts = self.insts.borrow_mut();
        if let Some(entry) = insts.get_mut(&addr) {
            entry.refs -= 1;
            if entry.refs == 0 {
                insts.remove(&addr);
            }
        }
    }

    /// Non-owning reference to the live wrapper of a shared instance, if
    /// one exists. Callers duplicate before handing it out.
    pub(crate) fn instance_value(&self, addr: usize) -> Option<RawValue> {
        self.insts.borrow().get(&addr).map(|e| e.weak_val)
    }
}

/// Recovers the binding-side runtime state from the engine's runtime
/// opaque pointer, inside finalizer and mark callbacks. Returns `None`
/// during full runtime teardown.
pub(crate) fn runtime_from_opaque(
    engine: &dyn Engine,
    rt: RawRuntime,
) -> Option<Rc<RuntimeInner>> {
    let ptr = engine.runtime_get_opaque(rt) as *const RuntimeInner;
    if ptr.is_null() {
        return None;
    }
    unsafe {
        Rc::increment_strong_count(ptr);
        Some(Rc::from_raw(ptr))
    }
}

/// Move-only owner of one engine heap.
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new(engine: Rc<dyn Engine>) -> Runtime {
        let raw = engine.runtime_new();
        Self::wrap(engine, raw, ptr::null_mut())
    }

    /// Creates a runtime whose engine heap allocates through `hooks`.
    pub fn with_memory_hooks(engine: Rc<dyn Engine>, hooks: Box<dyn MemoryHooks>) -> Runtime {
        let boxed = Box::into_raw(Box::new(HooksBox(hooks)));
        let raw = engine.runtime_new_with_hooks(AllocHooks {
            opaque: boxed as *mut c_void,
            alloc: hook_alloc,
            free: hook_free,
            realloc: hook_realloc,
        });
        Self::wrap(engine, raw, boxed)
    }

    fn wrap(engine: Rc<dyn Engine>, raw: RawRuntime, hooks: *mut HooksBox) -> Runtime {
        let inner = Rc::new(RuntimeInner {
            engine: engine.clone(),
            raw,
            contexts: RefCell::new(Tracker::new()),
            insts: RefCell::new(FxHashMap::default()),
            class_ids: RefCell::new(FxHashMap::default()),
            class_specs: RefCell::new(FxHashMap::default()),
            hooks: Cell::new(hooks),
        });
        engine.runtime_set_opaque(raw, Rc::as_ptr(&inner) as *mut c_void);
        Runtime { inner }
    }

    /// Creates a fresh evaluation context on this runtime.
    pub fn new_context(&self) -> Context {
        let engine = self.inner.engine.clone();
        let raw = engine.context_new(self.inner.raw);
        let inner = Rc::new(ContextInner::new(engine.clone(), raw, Rc::downgrade(&self.inner)));
        engine.context_set_opaque(raw, Rc::as_ptr(&inner) as *mut c_void);
        let slot = self.inner.contexts.borrow_mut().insert(Rc::downgrade(&inner));
        inner.set_rt_slot(slot);
        Context::from_inner(inner)
    }

    /// Runs a full engine garbage collection cycle.
    pub fn run_gc(&self) {
        self.inner.engine.run_gc(self.inner.raw);
    }

    /// The raw engine handle; escape hatch for collaborator code.
    pub fn raw_runtime(&self) -> RawRuntime {
        self.inner.raw
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        trace!(runtime = self.inner.raw.0, "tearing down runtime");
        // Collect first: abandoning a context removes it from the tracker,
        // which must not happen under the same borrow.
        let survivors: Vec<Weak<ContextInner>> = {
            let mut contexts = self.inner.contexts.borrow_mut();
            let mut out = Vec::new();
            contexts.drain(|w| out.push(w));
            out
        };
        for weak in survivors {
            if let Some(ctx) = weak.upgrade() {
                ctx.abandon();
            }
        }
        // Clearing the opaque first lets finalizers running inside
        // runtime_free detect teardown and skip the identity table.
        self.inner
            .engine
            .runtime_set_opaque(self.inner.raw, ptr::null_mut());
        self.inner.engine.runtime_free(self.inner.raw);
        let hooks = self.inner.hooks.get();
        if !hooks.is_null() {
            drop(unsafe { Box::from_raw(hooks) });
        }
    }
}
