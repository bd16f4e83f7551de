//! Native class registration.
//!
//! A native type becomes scriptable by implementing [`NativeClass`]:
//! a declarative [`ClassSpec`] describing constructor arity, methods and
//! accessors, plus a constructor function. Engine-level registration
//! happens once per runtime; the prototype, constructor function and
//! global binding are created per context, so several contexts on one
//! runtime can expose the same class independently.

use std::any::TypeId;
use std::ffi::c_void;
use std::rc::Rc;

use tracing::debug;

use crate::args::Args;
use crate::closure::{self, boundary};
use crate::context::{
    complete_call, context_from_opaque, ClassInfo, ContextRef,
};
use crate::engine::{Engine, MarkFn, RawContext, RawRuntime, RawValue};
use crate::error::{Error, Result};
use crate::runtime::runtime_from_opaque;
use crate::value::Value;

/// Ownership discipline of instances of a native class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassKind {
    /// Script owns the instance; the finalizer drops it.
    Owned,
    /// Instances are `Rc`-shared with native code; wrapping the same
    /// instance twice yields the identical script object.
    Shared,
}

/// GC mark sink handed to a class's mark hook. The hook reports every
/// script value the native instance keeps alive.
pub struct Marker<'a> {
    sink: &'a mut dyn FnMut(RawValue),
}

impl Marker<'_> {
    pub fn mark(&mut self, v: &Value) {
        if let Ok(raw) = v.raw_ref() {
            (self.sink)(raw);
        }
    }
}

type MethodFn<T> = fn(&T, &Args) -> Result<Value>;
type GetterFn<T> = fn(&T, &Value) -> Result<Value>;
type SetterFn<T> = fn(&T, &Value, &Value) -> Result<()>;

enum Member<T> {
    Method {
        name: &'static str,
        arity: u32,
        f: MethodFn<T>,
    },
    Accessor {
        name: &'static str,
        get: Option<GetterFn<T>>,
        set: Option<SetterFn<T>>,
    },
}

/// Declarative description of a native class: name, constructor arity and
/// the members installed on every per-context prototype.
pub struct ClassSpec<T> {
    name: &'static str,
    ctor_arity: u32,
    members: Vec<Member<T>>,
    mark: Option<fn(&T, &mut Marker<'_>)>,
}

impl<T> ClassSpec<T> {
    pub fn new(name: &'static str, ctor_arity: u32) -> Self {
        ClassSpec {
            name,
            ctor_arity,
            members: Vec::new(),
            mark: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn ctor_arity(&self) -> u32 {
        self.ctor_arity
    }

    pub(crate) fn mark_hook(&self) -> Option<fn(&T, &mut Marker<'_>)> {
        self.mark
    }

    /// Adds a method with an explicit declared arity.
    pub fn method(mut self, name: &'static str, arity: u32, f: MethodFn<T>) -> Self {
        self.members.push(Member::Method { name, arity, f });
        self
    }

    /// Adds a read-write accessor property.
    pub fn getset(mut self, name: &'static str, get: GetterFn<T>, set: SetterFn<T>) -> Self {
        self.members.push(Member::Accessor {
            name,
            get: Some(get),
            set: Some(set),
        });
        self
    }

    /// Adds a read-only accessor; assignment throws a type error.
    pub fn get_only(mut self, name: &'static str, get: GetterFn<T>) -> Self {
        self.members.push(Member::Accessor {
            name,
            get: Some(get),
            set: None,
        });
        self
    }

    /// Adds a write-only accessor; reads throw a type error.
    pub fn set_only(mut self, name: &'static str, set: SetterFn<T>) -> Self {
        self.members.push(Member::Accessor {
            name,
            get: None,
            set: Some(set),
        });
        self
    }

    /// Installs a GC mark hook reporting values held by instances.
    pub fn gc_mark(mut self, mark: fn(&T, &mut Marker<'_>)) -> Self {
        self.mark = Some(mark);
        self
    }
}

/// A native type exposable to script as a class.
pub trait NativeClass: Sized + 'static {
    const KIND: ClassKind = ClassKind::Owned;

    fn spec() -> ClassSpec<Self>;

    fn constructor(args: &Args) -> Result<Self>;
}

pub(crate) fn register<T: NativeClass>(ctx: &ContextRef) -> Result<()> {
    let inner = &ctx.inner;
    let raw = inner.expect_raw()?;
    let engine = inner.engine();
    let rt = inner.runtime().ok_or(Error::InvalidContext)?;
    let spec = rt.spec_for::<T>();
    let id = rt.class_id_for::<T>();
    if !engine.is_class_registered(rt.raw(), id) {
        let mark = spec.mark_hook().map(|_| mark_thunk::<T> as MarkFn);
        if !engine.register_class(rt.raw(), id, spec.name(), finalizer_thunk::<T>, mark) {
            return Err(Error::Registration(format!(
                "failed to register class '{}'",
                spec.name()
            )));
        }
        debug!(class = spec.name(), id = id.0, "registered engine class");
    }

    let proto_raw = engine.new_object(raw);
    if proto_raw.is_exception() {
        return complete_call(inner, proto_raw, false).map(|_| ());
    }
    let proto = Value::adopt(inner, proto_raw);
    install_members::<T>(ctx, &proto, &spec)?;

    let ctor_raw = engine.new_constructor(
        raw,
        ctor_thunk::<T>,
        spec.name(),
        spec.ctor_arity(),
        std::ptr::null_mut(),
    );
    if ctor_raw.is_exception() {
        return complete_call(inner, ctor_raw, false).map(|_| ());
    }
    let ctor = Value::adopt(inner, ctor_raw);
    engine.set_constructor(raw, ctor.raw_ref()?, proto.raw_ref()?);

    ctx.global_object()?.set_property(spec.name(), ctor.clone())?;

    let mut ctor = ctor;
    let mut proto = proto;
    let info = ClassInfo {
        ctor: ctor.steal()?,
        proto: proto.steal()?,
    };
    if let Some(old) = inner.put_class_info(id, info) {
        engine.value_free(raw, old.ctor);
        engine.value_free(raw, old.proto);
    }
    Ok(())
}

fn install_members<T: NativeClass>(
    ctx: &ContextRef,
    proto: &Value,
    spec: &Rc<ClassSpec<T>>,
) -> Result<()> {
    let inner = &ctx.inner;
    let raw = inner.expect_raw()?;
    let engine = inner.engine();
    for member in &spec.members {
        match member {
            Member::Method { name, arity, f } => {
                let f = *f;
                let func = closure::wrap_raw(
                    ctx,
                    *arity,
                    Box::new(move |args: &Args| {
                        args.this().with_native::<T, _>(|inst| f(inst, args))?
                    }),
                )?;
                proto.define_method_property(name, func)?;
            }
            Member::Accessor { name, get, set } => {
                let prop = *name;
                let getter = match get {
                    Some(g) => {
                        let g = *g;
                        closure::wrap_raw(
                            ctx,
                            0,
                            Box::new(move |args: &Args| {
                                let this = args.this();
                                this.with_native::<T, _>(|inst| g(inst, this))?
                            }),
                        )?
                    }
                    None => closure::wrap_raw(
                        ctx,
                        0,
                        Box::new(move |args: &Args| {
                            args.context()
                                .type_error(&format!("property '{prop}' is write-only"))
                        }),
                    )?,
                };
                let setter = match set {
                    Some(s) => {
                        let s = *s;
                        closure::wrap_raw(
                            ctx,
                            1,
                            Box::new(move |args: &Args| {
                                let this = args.this();
                                this.with_native::<T, _>(|inst| s(inst, this, &args[0]))??;
                                Ok(Value::default())
                            }),
                        )?
                    }
                    None => closure::wrap_raw(
                        ctx,
                        1,
                        Box::new(move |args: &Args| {
                            args.context()
                                .type_error(&format!("property '{prop}' is read-only"))
                        }),
                    )?,
                };
                let mut getter = getter;
                let mut setter = setter;
                if !engine.define_accessor(
                    raw,
                    proto.raw_ref()?,
                    name,
                    Some(getter.steal()?),
                    Some(setter.steal()?),
                ) {
                    return Err(Error::Registration(format!(
                        "failed to define accessor '{name}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

pub(crate) fn ctor_thunk<T: NativeClass>(
    engine: &dyn Engine,
    raw: RawContext,
    new_target: RawValue,
    argv: &[RawValue],
    _opaque: *mut c_void,
) -> RawValue {
    let Some(inner) = context_from_opaque(engine, raw) else {
        return engine.throw_uncatchable(raw);
    };
    boundary(engine, raw, &inner, || {
        let rt = inner.runtime().ok_or(Error::InvalidContext)?;
        let id = rt
            .lookup_class_id(TypeId::of::<T>())
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let spec = rt.spec_for::<T>();
        let target = Value::adopt(&inner, engine.value_dup(raw, new_target));
        let proto = target.get_property("prototype")?;
        let obj_raw = engine.new_object_class(raw, proto.raw_ref()?, id);
        if obj_raw.is_exception() {
            return complete_call(&inner, obj_raw, false);
        }
        let obj = Value::adopt(&inner, obj_raw);
        let args = Args::for_call(&inner, obj.raw_ref()?, argv, spec.ctor_arity());
        let instance = T::constructor(&args)?;
        let payload = match T::KIND {
            ClassKind::Owned => Box::into_raw(Box::new(instance)) as *mut c_void,
            ClassKind::Shared => {
                let shared = Rc::new(instance);
                rt.ref_instance(Rc::as_ptr(&shared) as usize, obj.raw_ref()?);
                Box::into_raw(Box::new(shared)) as *mut c_void
            }
        };
        engine.set_opaque(raw, obj.raw_ref()?, payload);
        Ok(obj)
    })
}

pub(crate) fn finalizer_thunk<T: NativeClass>(
    engine: &dyn Engine,
    rt: RawRuntime,
    payload: *mut c_void,
) {
    if payload.is_null() {
        return;
    }
    match T::KIND {
        ClassKind::Owned => drop(unsafe { Box::from_raw(payload as *mut T) }),
        ClassKind::Shared => {
            let shared = unsafe { Box::from_raw(payload as *mut Rc<T>) };
            let addr = Rc::as_ptr(&shared) as usize;
            drop(shared);
            // During full runtime teardown the opaque slot is already
            // cleared and the identity table dies with the runtime.
            if let Some(rt) = runtime_from_opaque(engine, rt) {
                rt.unref_instance(addr);
            }
        }
    }
}

pub(crate) fn mark_thunk<T: NativeClass>(
    engine: &dyn Engine,
    rt: RawRuntime,
    payload: *mut c_void,
    mark: &mut dyn FnMut(RawValue),
) {
    if payload.is_null() {
        return;
    }
    let Some(rt) = runtime_from_opaque(engine, rt) else {
        return;
    };
    let Some(spec) = rt.try_spec::<T>() else { return };
    let Some(hook) = spec.mark_hook() else { return };
    let mut marker = Marker { sink: mark };
    match T::KIND {
        ClassKind::Owned => hook(unsafe { &*(payload as *const T) }, &mut marker),
        ClassKind::Shared => hook(unsafe { &*(payload as *const Rc<T>) }, &mut marker),
    }
}
