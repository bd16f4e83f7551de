//! Evaluation contexts.
//!
//! [`Context`] is the move-only owner of one engine evaluation environment.
//! It tracks every [`Value`] created through it and force-invalidates them
//! all on teardown, so host-held handles can never dangle into a freed
//! environment. [`ContextRef`] is the cheap non-owning handle used inside
//! callbacks and carried by values; it exposes the full operation surface.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ops::Deref;
use std::ptr;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::class::{self, ClassKind, NativeClass};
use crate::closure::{self, NativeCallback};
use crate::convert::{IntoArgs, IntoValue};
use crate::engine::{ClassId, Engine, EvalKind, RawContext, RawValue, ValueTag};
use crate::error::{Error, Forwarded, Result};
use crate::runtime::RuntimeInner;
use crate::tracker::{Handle, Tracker};
use crate::value::Value;

/// How source text is evaluated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum EvalMode {
    Global,
    Module,
    /// Pick global or module evaluation from the shape of the source.
    #[default]
    Autodetect,
}

/// Constructor and prototype recorded for a class registered on a context.
pub(crate) struct ClassInfo {
    pub(crate) ctor: RawValue,
    pub(crate) proto: RawValue,
}

/// Shared state of one evaluation environment. Owned by [`Context`],
/// referenced by every value created through it.
pub(crate) struct ContextInner {
    engine: Rc<dyn Engine>,
    raw: Cell<Option<RawContext>>,
    rt: Weak<RuntimeInner>,
    rt_slot: Cell<Option<Handle>>,
    values: RefCell<Tracker<RawValue>>,
    classes: RefCell<FxHashMap<ClassId, ClassInfo>>,
    call_level: Cell<u32>,
    forwarded: RefCell<Option<Forwarded>>,
}

impl ContextInner {
    pub(crate) fn new(engine: Rc<dyn Engine>, raw: RawContext, rt: Weak<RuntimeInner>) -> Self {
        ContextInner {
            engine,
            raw: Cell::new(Some(raw)),
            rt,
            rt_slot: Cell::new(None),
            values: RefCell::new(Tracker::new()),
            classes: RefCell::new(FxHashMap::default()),
            call_level: Cell::new(0),
            forwarded: RefCell::new(None),
        }
    }

    pub(crate) fn engine(&self) -> &dyn Engine {
        &*self.engine
    }

    pub(crate) fn engine_rc(&self) -> Rc<dyn Engine> {
        self.engine.clone()
    }

    pub(crate) fn raw_opt(&self) -> Option<RawContext> {
        self.raw.get()
    }

    pub(crate) fn expect_raw(&self) -> Result<RawContext> {
        self.raw.get().ok_or(Error::InvalidContext)
    }

    pub(crate) fn alive(&self) -> bool {
        self.raw.get().is_some()
    }

    pub(crate) fn runtime(&self) -> Option<Rc<RuntimeInner>> {
        self.rt.upgrade()
    }

    pub(crate) fn set_rt_slot(&self, slot: Handle) {
        self.rt_slot.set(Some(slot));
    }

    pub(crate) fn track_value(&self, raw: RawValue) -> Handle {
        self.values.borrow_mut().insert(raw)
    }

    pub(crate) fn value_raw(&self, slot: Handle) -> Option<RawValue> {
        self.values.borrow().get(slot).copied()
    }

    pub(crate) fn untrack_value(&self, slot: Handle) -> Option<RawValue> {
        self.values.borrow_mut().remove(slot)
    }

    pub(crate) fn call_level(&self) -> u32 {
        self.call_level.get()
    }

    pub(crate) fn store_forwarded(&self, f: Forwarded) {
        // A second forwarded failure while one is already in flight cannot
        // happen through the boundary protocol; keep the first.
        let mut slot = self.forwarded.borrow_mut();
        if slot.is_none() {
            *slot = Some(f);
        }
    }

    pub(crate) fn take_forwarded(&self) -> Option<Forwarded> {
        self.forwarded.borrow_mut().take()
    }

    pub(crate) fn class_info_raw(&self, id: ClassId) -> Option<(RawValue, RawValue)> {
        self.classes
            .borrow()
            .get(&id)
            .map(|info| (info.ctor, info.proto))
    }

    /// Records the per-context constructor and prototype for a class,
    /// returning the displaced previous record if the class was registered
    /// on this context before.
    pub(crate) fn put_class_info(&self, id: ClassId, info: ClassInfo) -> Option<ClassInfo> {
        self.classes.borrow_mut().insert(id, info)
    }

    /// Force-invalidates every tracked value, cleans up the class table and
    /// releases the engine environment. Idempotent.
    pub(crate) fn abandon(&self) {
        let Some(raw) = self.raw.take() else { return };
        trace!(context = raw.0, "abandoning context");
        self.forwarded.borrow_mut().take();
        let mut values = self.values.borrow_mut();
        values.drain(|v| self.engine.value_free(raw, v));
        drop(values);
        for (_, info) in self.classes.borrow_mut().drain() {
            self.engine.value_free(raw, info.ctor);
            self.engine.value_free(raw, info.proto);
        }
        self.engine.context_set_opaque(raw, ptr::null_mut());
        self.engine.context_free(raw);
        if let (Some(rt), Some(slot)) = (self.rt.upgrade(), self.rt_slot.take()) {
            rt.untrack_context(slot);
        }
    }
}

/// Recovers the binding-side context state from the engine's context opaque
/// pointer, inside a callback invoked by the engine. Returns `None` once the
/// context has been abandoned.
pub(crate) fn context_from_opaque(
    engine: &dyn Engine,
    ctx: RawContext,
) -> Option<Rc<ContextInner>> {
    let ptr = engine.context_get_opaque(ctx) as *const ContextInner;
    if ptr.is_null() {
        return None;
    }
    // The opaque slot holds Rc::as_ptr of a live Rc: the owning Context (or
    // a value's Rc) keeps the allocation alive, and abandon() clears the
    // slot before the last Rc can go away.
    unsafe {
        Rc::increment_strong_count(ptr);
        Some(Rc::from_raw(ptr))
    }
}

/// Scoped call-level counter: incremented for the duration of every
/// native-to-script boundary call, consulted by [`convert_thrown`] to route
/// nested value throws.
pub(crate) struct CallLevel<'a> {
    cell: &'a Cell<u32>,
}

impl<'a> CallLevel<'a> {
    pub(crate) fn enter(inner: &'a ContextInner) -> Self {
        inner.call_level.set(inner.call_level.get() + 1);
        CallLevel {
            cell: &inner.call_level,
        }
    }
}

impl Drop for CallLevel<'_> {
    fn drop(&mut self) {
        self.cell.set(self.cell.get() - 1);
    }
}

/// Drains a parked forwarded token, discarding the uncatchable error that
/// unwound the script stack. Panics resume immediately.
fn drain_forwarded(inner: &Rc<ContextInner>) -> Option<Error> {
    let token = inner.take_forwarded()?;
    if let Some(raw) = inner.raw_opt() {
        let pending = inner.engine().take_exception(raw);
        inner.engine().value_free(raw, pending);
    }
    match token {
        Forwarded::Panic(payload) => std::panic::resume_unwind(payload),
        Forwarded::Error(e) => Some(e),
    }
}

/// Turns the completion of an engine operation into a host-visible result.
///
/// With `check_forwarded` set (every boundary that can dispatch script or
/// native callbacks: eval, function calls, constructor calls, property
/// access through accessors), a pending forwarded token takes precedence
/// over the engine-level completion: the uncatchable error that unwound
/// the script stack is discarded and the original native failure resumes.
pub(crate) fn complete_call(
    inner: &Rc<ContextInner>,
    ret: RawValue,
    check_forwarded: bool,
) -> Result<Value> {
    if check_forwarded {
        if let Some(e) = drain_forwarded(inner) {
            return Err(e);
        }
    }
    if ret.is_exception() {
        let raw = inner.expect_raw()?;
        let thrown = Value::adopt(inner, inner.engine().take_exception(raw));
        return Err(convert_thrown(inner, thrown));
    }
    Ok(Value::adopt(inner, ret))
}

/// Reports a boundary operation that failed with the exception left
/// pending. A parked forwarded token takes precedence over the thrown
/// value, exactly as in [`complete_call`].
pub(crate) fn pending_failure(inner: &Rc<ContextInner>) -> Error {
    if let Some(e) = drain_forwarded(inner) {
        return e;
    }
    match inner.expect_raw() {
        Ok(raw) => {
            let thrown = Value::adopt(inner, inner.engine().take_exception(raw));
            convert_thrown(inner, thrown)
        }
        Err(e) => e,
    }
}

/// Maps a thrown script value to the host error taxonomy: engine error
/// objects keep their message and stack; plain values become a catchable
/// rethrow when still nested inside an outer boundary call, and a
/// host-visible exception otherwise.
pub(crate) fn convert_thrown(inner: &Rc<ContextInner>, thrown: Value) -> Error {
    if matches!(thrown.kind(), Ok(ValueTag::Error)) {
        let message = thrown.try_as_string().unwrap_or_default();
        let stack = thrown
            .get_property("stack")
            .ok()
            .filter(|s| !matches!(s.kind(), Ok(ValueTag::Undefined)))
            .and_then(|s| s.try_as_string());
        return Error::ScriptError {
            message,
            stack,
            value: thrown,
        };
    }
    if inner.call_level() > 1 {
        trace!(level = inner.call_level(), "routing nested value throw");
        Error::Throw(thrown)
    } else {
        Error::Exception(thrown)
    }
}

/// Cheap, cloneable handle to an evaluation environment.
///
/// Carried by every [`Value`] and available inside native callbacks via
/// [`crate::Args::context`]. All operations fail with
/// [`Error::InvalidContext`] once the owning [`Context`] (or its
/// [`crate::Runtime`]) has been torn down.
#[derive(Clone)]
pub struct ContextRef {
    pub(crate) inner: Rc<ContextInner>,
}

impl ContextRef {
    /// Whether the underlying environment is still live.
    pub fn valid(&self) -> bool {
        self.inner.alive()
    }

    /// The raw engine handle; escape hatch for collaborator code.
    pub fn raw_context(&self) -> Result<RawContext> {
        self.inner.expect_raw()
    }

    /// Evaluates source text, auto-detecting global vs module shape.
    pub fn eval(&self, src: &str) -> Result<Value> {
        self.eval_named(src, "(eval)", EvalMode::Autodetect)
    }

    /// Evaluates source text in an explicit mode.
    pub fn eval_mode(&self, src: &str, mode: EvalMode) -> Result<Value> {
        self.eval_named(src, "(eval)", mode)
    }

    /// Evaluates source text with an explicit source name for diagnostics.
    pub fn eval_named(&self, src: &str, name: &str, mode: EvalMode) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let engine = self.inner.engine();
        let kind = match mode {
            EvalMode::Global => EvalKind::Global,
            EvalMode::Module => EvalKind::Module,
            EvalMode::Autodetect => {
                if engine.detect_module(src) {
                    EvalKind::Module
                } else {
                    EvalKind::Global
                }
            }
        };
        let ret = engine.eval(raw, src, name, kind);
        complete_call(&self.inner, ret, true)
    }

    /// Returns the global object, duplicated fresh on each call.
    pub fn global_object(&self) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let global = self.inner.engine().get_global(raw);
        Ok(Value::adopt(&self.inner, global))
    }

    /// Looks up a global property and calls it with `this` = undefined.
    pub fn call_global<A: IntoArgs>(&self, name: &str, args: A) -> Result<Value> {
        let func = self.global_object()?.get_property(name)?;
        let this = self.undefined()?;
        func.call(&this, args)
    }

    pub fn undefined(&self) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        Ok(Value::adopt(&self.inner, self.inner.engine().new_undefined(raw)))
    }

    pub fn null(&self) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        Ok(Value::adopt(&self.inner, self.inner.engine().new_null(raw)))
    }

    /// Creates a value from a native literal (or passes a value through).
    pub fn value_of(&self, v: impl IntoValue) -> Result<Value> {
        v.into_value(self)
    }

    /// Throws `v` at the engine level and returns the exception-sentinel
    /// value, suitable as the return value of a native callback that wants
    /// script to observe a pending throw.
    pub fn exception(&self, v: impl IntoValue) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let engine = self.inner.engine();
        let mut val = v.into_value(self)?;
        let thrown = val.steal().unwrap_or_else(|_| engine.new_undefined(raw));
        let sentinel = engine.throw(raw, thrown);
        Ok(Value::adopt(&self.inner, sentinel))
    }

    /// Throws a type error at the engine level; see [`Self::exception`].
    pub fn type_error(&self, msg: &str) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let sentinel = self.inner.engine().throw_type_error(raw, msg);
        Ok(Value::adopt(&self.inner, sentinel))
    }

    /// Throws a reference error at the engine level; see [`Self::exception`].
    pub fn reference_error(&self, msg: &str) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let sentinel = self.inner.engine().throw_reference_error(raw, msg);
        Ok(Value::adopt(&self.inner, sentinel))
    }

    /// Wraps a native callable into an engine-invocable function value.
    ///
    /// Two callable shapes are accepted: all-positional parameters, each
    /// converted from the corresponding argument ([`crate::FromValue`],
    /// undefined-padded when script supplies fewer), or a leading
    /// [`crate::Args`] reference followed by converted positionals.
    pub fn new_function<M, F: NativeCallback<M>>(&self, f: F) -> Result<Value> {
        closure::wrap_raw(
            self,
            F::ARITY,
            Box::new(move |args| f.invoke(args)),
        )
    }

    /// Registers the native class `T` on this context.
    ///
    /// The engine-level class id is registered once per runtime; the
    /// prototype, constructor and global binding are created fresh for this
    /// context on every call.
    pub fn register_class<T: NativeClass>(&self) -> Result<()> {
        class::register::<T>(self)
    }

    /// Invokes the registered constructor of `T` as if via `new`.
    pub fn make_object<T: NativeClass>(&self, args: &[Value]) -> Result<Value> {
        let raw = self.inner.expect_raw()?;
        let rt = self.inner.runtime().ok_or(Error::InvalidContext)?;
        let id = rt
            .lookup_class_id(TypeId::of::<T>())
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let (ctor, _) = self
            .inner
            .class_info_raw(id)
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let mut raw_args = Vec::with_capacity(args.len());
        for a in args {
            raw_args.push(a.raw_ref()?);
        }
        let ret = self.inner.engine().call_constructor(raw, ctor, &raw_args);
        complete_call(&self.inner, ret, true)
    }

    /// Wraps a shared native instance into script, preserving identity: a
    /// second wrap of the same instance yields the same script object.
    pub fn wrap_instance<T: NativeClass>(&self, inst: &Rc<T>) -> Result<Value> {
        if T::KIND != ClassKind::Shared {
            return Err(Error::Registration(format!(
                "class '{}' is not shared",
                T::spec().name()
            )));
        }
        let raw = self.inner.expect_raw()?;
        let engine = self.inner.engine();
        let rt = self.inner.runtime().ok_or(Error::InvalidContext)?;
        let addr = Rc::as_ptr(inst) as usize;
        if let Some(existing) = rt.instance_value(addr) {
            return Ok(Value::adopt(&self.inner, engine.value_dup(raw, existing)));
        }
        let id = rt
            .lookup_class_id(TypeId::of::<T>())
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let (_, proto) = self
            .inner
            .class_info_raw(id)
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let obj = engine.new_object_class(raw, proto, id);
        if obj.is_exception() {
            return complete_call(&self.inner, obj, false);
        }
        // The identity table holds a non-owning reference; the finalizer
        // removes the entry when the last wrapper is collected.
        rt.ref_instance(addr, obj);
        let payload = Box::into_raw(Box::new(inst.clone())) as *mut c_void;
        engine.set_opaque(raw, obj, payload);
        Ok(Value::adopt(&self.inner, obj))
    }

    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        ContextRef { inner }
    }
}

/// Move-only owner of one evaluation environment.
///
/// Dropping a `Context` force-invalidates every value created through it
/// and cleans up all per-context class registrations before releasing the
/// engine environment.
pub struct Context {
    handle: ContextRef,
}

impl Context {
    pub(crate) fn from_inner(inner: Rc<ContextInner>) -> Self {
        Context {
            handle: ContextRef { inner },
        }
    }

    /// A non-owning handle to this context.
    pub fn handle(&self) -> ContextRef {
        self.handle.clone()
    }
}

impl Deref for Context {
    type Target = ContextRef;

    fn deref(&self) -> &ContextRef {
        &self.handle
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.handle.inner.abandon();
    }
}
