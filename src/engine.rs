//! The raw engine surface the binding layer is written against.
//!
//! The embedded script engine (parser, interpreter, garbage collector) is an
//! external collaborator. Everything the binding needs from it is expressed
//! as the [`Engine`] trait over opaque handle newtypes, mirroring a C engine
//! ABI: host callbacks are plain `fn` pointers plus an opaque pointer, and
//! the binding recovers its own state through the runtime/context opaque
//! slots. No method on this trait is assumed to do more than its contract
//! states.

use std::ffi::c_void;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Handle to one engine heap (runtime) instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawRuntime(pub u64);

/// Handle to one evaluation environment bound to a runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawContext(pub u64);

/// Reference-counted handle to one engine-resident value.
///
/// The all-ones pattern is reserved as the exception sentinel: an operation
/// that threw returns [`RawValue::EXCEPTION`] and leaves the thrown value
/// pending on the context.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawValue(pub u64);

impl RawValue {
    pub const EXCEPTION: RawValue = RawValue(u64::MAX);

    #[inline]
    pub fn is_exception(self) -> bool {
        self == Self::EXCEPTION
    }
}

/// Engine-allocated identifier for a registered native class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClassId(pub u32);

/// Coarse classification of a value, as reported by [`Engine::value_tag`].
///
/// Functions are objects; whether an object is callable is a separate
/// query ([`Engine::is_function`]).
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ValueTag {
    Undefined = 0,
    Null = 1,
    Bool = 2,
    Int = 3,
    Float = 4,
    String = 5,
    Object = 6,
    Error = 7,
}

bitflags! {
    /// Property-definition flags for [`Engine::define_property`].
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PropFlags: u32 {
        const WRITABLE = 1 << 0;
        const ENUMERABLE = 1 << 1;
        const CONFIGURABLE = 1 << 2;
    }
}

impl PropFlags {
    /// Flags used for methods installed on a class prototype.
    pub fn method() -> Self {
        PropFlags::WRITABLE | PropFlags::CONFIGURABLE
    }
}

/// How a source buffer is evaluated at the engine level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EvalKind {
    Global,
    Module,
}

/// Native function callback: invoked by the engine when script calls a
/// host-created function value. `args` is borrowed for the duration of the
/// call; the return value is owned by the engine (or the exception
/// sentinel with a pending exception set).
pub type NativeFn = fn(
    engine: &dyn Engine,
    ctx: RawContext,
    this: RawValue,
    args: &[RawValue],
    opaque: *mut c_void,
) -> RawValue;

/// Constructor callback: like [`NativeFn`] but receives `new.target` so the
/// prototype can be taken from it (subclassing support).
pub type ConstructorFn = fn(
    engine: &dyn Engine,
    ctx: RawContext,
    new_target: RawValue,
    args: &[RawValue],
    opaque: *mut c_void,
) -> RawValue;

/// Finalizer for the opaque state of a host function value, run when the
/// function value is collected.
pub type OpaqueFinalizerFn = fn(opaque: *mut c_void);

/// Finalizer for a class instance payload, run when an object of a
/// registered class is collected. The runtime opaque pointer may already be
/// cleared during runtime teardown.
pub type FinalizerFn = fn(engine: &dyn Engine, rt: RawRuntime, payload: *mut c_void);

/// GC-mark callback for a registered class: must report every engine value
/// reachable from the payload through `mark`.
pub type MarkFn =
    fn(engine: &dyn Engine, rt: RawRuntime, payload: *mut c_void, mark: &mut dyn FnMut(RawValue));

/// Allocation hook table handed to [`Engine::runtime_new_with_hooks`].
///
/// All engine heap traffic for that runtime is routed through these
/// functions. `opaque` belongs to the binding and outlives the runtime.
#[derive(Clone, Copy)]
pub struct AllocHooks {
    pub opaque: *mut c_void,
    pub alloc: fn(opaque: *mut c_void, size: usize) -> *mut u8,
    pub free: fn(opaque: *mut c_void, ptr: *mut u8, size: usize),
    pub realloc: fn(opaque: *mut c_void, ptr: *mut u8, old_size: usize, new_size: usize) -> *mut u8,
}

/// Minimum surface required from the embedded engine.
///
/// Ownership conventions follow the usual C engine style:
/// - methods named `new_*` return an owned reference;
/// - `value_dup` increments, `value_free` decrements the reference count;
/// - parameters documented as *consumed* take over one reference; all other
///   value parameters are borrowed for the duration of the call;
/// - fallible operations return [`RawValue::EXCEPTION`] (or `false`/`None`)
///   and leave the thrown value pending on the context.
pub trait Engine {
    // Runtime lifecycle.
    fn runtime_new(&self) -> RawRuntime;
    fn runtime_new_with_hooks(&self, hooks: AllocHooks) -> RawRuntime;
    fn runtime_free(&self, rt: RawRuntime);
    fn runtime_set_opaque(&self, rt: RawRuntime, opaque: *mut c_void);
    fn runtime_get_opaque(&self, rt: RawRuntime) -> *mut c_void;
    fn run_gc(&self, rt: RawRuntime);

    // Context lifecycle.
    fn context_new(&self, rt: RawRuntime) -> RawContext;
    fn context_free(&self, ctx: RawContext);
    fn context_set_opaque(&self, ctx: RawContext, opaque: *mut c_void);
    fn context_get_opaque(&self, ctx: RawContext) -> *mut c_void;
    fn context_runtime(&self, ctx: RawContext) -> RawRuntime;

    // Value reference counting and classification.
    fn value_dup(&self, ctx: RawContext, v: RawValue) -> RawValue;
    fn value_free(&self, ctx: RawContext, v: RawValue);
    fn value_tag(&self, ctx: RawContext, v: RawValue) -> i32;
    fn is_function(&self, ctx: RawContext, v: RawValue) -> bool;
    fn strict_equals(&self, ctx: RawContext, a: RawValue, b: RawValue) -> bool;

    // Value construction from native literals.
    fn new_undefined(&self, ctx: RawContext) -> RawValue;
    fn new_null(&self, ctx: RawContext) -> RawValue;
    fn new_bool(&self, ctx: RawContext, v: bool) -> RawValue;
    fn new_int32(&self, ctx: RawContext, v: i32) -> RawValue;
    fn new_uint32(&self, ctx: RawContext, v: u32) -> RawValue;
    fn new_int64(&self, ctx: RawContext, v: i64) -> RawValue;
    fn new_uint64(&self, ctx: RawContext, v: u64) -> RawValue;
    fn new_float64(&self, ctx: RawContext, v: f64) -> RawValue;
    fn new_string(&self, ctx: RawContext, s: &str) -> RawValue;

    // Lossy conversions. `None` means the engine threw while converting and
    // left the exception pending.
    fn to_bool(&self, ctx: RawContext, v: RawValue) -> Option<bool>;
    fn to_int32(&self, ctx: RawContext, v: RawValue) -> Option<i32>;
    fn to_uint32(&self, ctx: RawContext, v: RawValue) -> Option<u32>;
    fn to_int64(&self, ctx: RawContext, v: RawValue) -> Option<i64>;
    fn to_float64(&self, ctx: RawContext, v: RawValue) -> Option<f64>;
    fn to_string(&self, ctx: RawContext, v: RawValue) -> Option<String>;

    // Globals and properties.
    fn get_global(&self, ctx: RawContext) -> RawValue;
    fn get_property(&self, ctx: RawContext, obj: RawValue, name: &str) -> RawValue;
    /// Consumes `v`. Returns false with a pending exception on failure.
    fn set_property(&self, ctx: RawContext, obj: RawValue, name: &str, v: RawValue) -> bool;
    /// Consumes `v`.
    fn define_property(
        &self,
        ctx: RawContext,
        obj: RawValue,
        name: &str,
        v: RawValue,
        flags: PropFlags,
    ) -> bool;
    /// Consumes `getter` and `setter`.
    fn define_accessor(
        &self,
        ctx: RawContext,
        obj: RawValue,
        name: &str,
        getter: Option<RawValue>,
        setter: Option<RawValue>,
    ) -> bool;

    // Evaluation and calls.
    fn detect_module(&self, src: &str) -> bool;
    fn eval(&self, ctx: RawContext, src: &str, name: &str, kind: EvalKind) -> RawValue;
    fn call(&self, ctx: RawContext, func: RawValue, this: RawValue, args: &[RawValue]) -> RawValue;
    fn call_constructor(&self, ctx: RawContext, ctor: RawValue, args: &[RawValue]) -> RawValue;

    // Exceptions.
    /// Consumes `v`; returns the exception sentinel.
    fn throw(&self, ctx: RawContext, v: RawValue) -> RawValue;
    fn throw_type_error(&self, ctx: RawContext, msg: &str) -> RawValue;
    fn throw_reference_error(&self, ctx: RawContext, msg: &str) -> RawValue;
    /// Throws an error that script-level catch constructs cannot intercept.
    fn throw_uncatchable(&self, ctx: RawContext) -> RawValue;
    /// Takes ownership of the pending exception, clearing it.
    fn take_exception(&self, ctx: RawContext) -> RawValue;

    // Host functions and native classes.
    fn new_function(
        &self,
        ctx: RawContext,
        func: NativeFn,
        arity: u32,
        opaque: *mut c_void,
        finalizer: Option<OpaqueFinalizerFn>,
    ) -> RawValue;
    fn new_constructor(
        &self,
        ctx: RawContext,
        func: ConstructorFn,
        name: &str,
        arity: u32,
        opaque: *mut c_void,
    ) -> RawValue;
    /// Associates `proto` with `ctor` (installs the `prototype` property).
    /// Borrows both.
    fn set_constructor(&self, ctx: RawContext, ctor: RawValue, proto: RawValue);

    /// Allocates a fresh class id scoped to `rt`.
    fn new_class_id(&self, rt: RawRuntime) -> ClassId;
    fn is_class_registered(&self, rt: RawRuntime, id: ClassId) -> bool;
    fn register_class(
        &self,
        rt: RawRuntime,
        id: ClassId,
        name: &str,
        finalizer: FinalizerFn,
        mark: Option<MarkFn>,
    ) -> bool;
    fn new_object(&self, ctx: RawContext) -> RawValue;
    /// Creates an object of class `id` whose prototype is `proto` (borrowed).
    fn new_object_class(&self, ctx: RawContext, proto: RawValue, id: ClassId) -> RawValue;
    fn set_opaque(&self, ctx: RawContext, obj: RawValue, payload: *mut c_void);
    /// Returns null if `obj` is not an instance of class `id`.
    fn get_opaque(&self, ctx: RawContext, obj: RawValue, id: ClassId) -> *mut c_void;
}
