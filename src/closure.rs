//! Native closures callable from script, and the outbound half of the
//! exception bridge.
//!
//! Every native-to-engine entry point (function thunk, constructor thunk)
//! funnels its completion through [`boundary`]: a returned value crosses
//! as-is, a deliberate value throw re-enters the engine as a catchable
//! throw, and any other native failure (including a panic) is parked as a
//! forwarded token while an uncatchable error unwinds the script stack.
//! The matching outermost engine call picks the token back up in
//! [`crate::context`] completion handling.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::trace;

use crate::args::Args;
use crate::context::{context_from_opaque, ContextInner, ContextRef};
use crate::convert::{FromValue, IntoCallResult};
use crate::engine::{Engine, RawContext, RawValue};
use crate::error::{Error, Forwarded, Result};
use crate::value::Value;

/// Maps the completion of a native callback onto the engine's call
/// protocol. Never unwinds into the engine.
pub(crate) fn boundary(
    engine: &dyn Engine,
    raw: RawContext,
    inner: &Rc<ContextInner>,
    f: impl FnOnce() -> Result<Value>,
) -> RawValue {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(mut v)) => v.steal().unwrap_or_else(|_| engine.new_undefined(raw)),
        Ok(Err(Error::Throw(mut v))) => {
            let thrown = v.steal().unwrap_or_else(|_| engine.new_undefined(raw));
            engine.throw(raw, thrown)
        }
        Ok(Err(e)) => {
            trace!("forwarding native error across the engine");
            inner.store_forwarded(Forwarded::Error(e));
            engine.throw_uncatchable(raw)
        }
        Err(payload) => {
            trace!("forwarding panic across the engine");
            inner.store_forwarded(Forwarded::Panic(payload));
            engine.throw_uncatchable(raw)
        }
    }
}

struct BoxedCallback {
    arity: u32,
    f: Box<dyn Fn(&Args) -> Result<Value>>,
}

fn native_thunk(
    engine: &dyn Engine,
    raw: RawContext,
    this: RawValue,
    argv: &[RawValue],
    opaque: *mut c_void,
) -> RawValue {
    let Some(inner) = context_from_opaque(engine, raw) else {
        return engine.throw_uncatchable(raw);
    };
    let cb = unsafe { &*(opaque as *const BoxedCallback) };
    boundary(engine, raw, &inner, || {
        let args = Args::for_call(&inner, this, argv, cb.arity);
        (cb.f)(&args)
    })
}

fn boxed_finalizer(opaque: *mut c_void) {
    if !opaque.is_null() {
        drop(unsafe { Box::from_raw(opaque as *mut BoxedCallback) });
    }
}

/// Creates an engine function value around a boxed callback.
pub(crate) fn wrap_raw(
    ctx: &ContextRef,
    arity: u32,
    f: Box<dyn Fn(&Args) -> Result<Value>>,
) -> Result<Value> {
    let raw = ctx.raw_context()?;
    let engine = ctx.inner.engine();
    let boxed = Box::into_raw(Box::new(BoxedCallback { arity, f }));
    let v = engine.new_function(
        raw,
        native_thunk,
        arity,
        boxed as *mut c_void,
        Some(boxed_finalizer),
    );
    if v.is_exception() {
        // Creation failed before the engine took ownership of the box.
        drop(unsafe { Box::from_raw(boxed) });
        return crate::context::complete_call(&ctx.inner, v, false);
    }
    Ok(Value::adopt(&ctx.inner, v))
}

/// A native callable wrappable as a script function.
///
/// Implemented for `Fn` closures over up to seven [`FromValue`] parameters
/// returning any [`IntoCallResult`], and for the same shapes with a
/// leading `&Args` parameter when the callback needs the receiver, the
/// context, or arguments beyond its declared arity.
pub trait NativeCallback<M>: 'static {
    const ARITY: u32;

    fn invoke(&self, args: &Args) -> Result<Value>;
}

/// Marker distinguishing the `&Args`-leading callable shape.
pub struct WithArgs;

macro_rules! impl_native_callback {
    ($n:expr $(, $p:ident : $idx:tt)*) => {
        impl<F, R $(, $p)*> NativeCallback<fn($($p,)*) -> R> for F
        where
            F: Fn($($p),*) -> R + 'static,
            R: IntoCallResult,
            $($p: FromValue + 'static,)*
        {
            const ARITY: u32 = $n;

            #[allow(unused_variables)]
            fn invoke(&self, args: &Args) -> Result<Value> {
                (self)($($p::from_value(&args[$idx])),*).into_call_result(&args.context())
            }
        }

        impl<F, R $(, $p)*> NativeCallback<(WithArgs, fn($($p,)*) -> R)> for F
        where
            F: Fn(&Args $(, $p)*) -> R + 'static,
            R: IntoCallResult,
            $($p: FromValue + 'static,)*
        {
            const ARITY: u32 = $n;

            fn invoke(&self, args: &Args) -> Result<Value> {
                (self)(args $(, $p::from_value(&args[$idx]))*).into_call_result(&args.context())
            }
        }
    };
}

impl_native_callback!(0);
impl_native_callback!(1, P0: 0);
impl_native_callback!(2, P0: 0, P1: 1);
impl_native_callback!(3, P0: 0, P1: 1, P2: 2);
impl_native_callback!(4, P0: 0, P1: 1, P2: 2, P3: 3);
impl_native_callback!(5, P0: 0, P1: 1, P2: 2, P3: 3, P4: 4);
impl_native_callback!(6, P0: 0, P1: 1, P2: 2, P3: 3, P4: 4, P5: 5);
impl_native_callback!(7, P0: 0, P1: 1, P2: 2, P3: 3, P4: 4, P5: 5, P6: 6);
