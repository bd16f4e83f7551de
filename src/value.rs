//! Script value handles.
//!
//! A [`Value`] owns one engine reference and is tracked by the context it
//! was created through. Teardown of the context frees the reference and
//! flips the handle to the invalid state; every operation on an invalid
//! handle reports [`Error::InvalidContext`] instead of touching freed
//! engine state.

use std::fmt;
use std::rc::Rc;

use crate::class::{ClassKind, NativeClass};
use crate::closure::NativeCallback;
use crate::context::{
    complete_call, pending_failure, CallLevel, ContextInner, ContextRef,
};
use crate::convert::{ArgList, IntoArgs, IntoValue};
use crate::engine::{PropFlags, RawValue, ValueTag};
use crate::error::{Error, Result};
use crate::tracker::Handle;

struct ValueInner {
    ctx: Rc<ContextInner>,
    slot: Handle,
}

/// Owning handle to one engine value reference.
///
/// Cloning duplicates the engine reference; dropping releases it. The
/// default value is the invalid handle.
#[derive(Default)]
pub struct Value {
    inner: Option<ValueInner>,
}

impl Value {
    /// Takes ownership of `raw` and tracks it on `ctx`. If the context has
    /// already been torn down the reference cannot be released and the
    /// result is the invalid handle.
    pub(crate) fn adopt(ctx: &Rc<ContextInner>, raw: RawValue) -> Value {
        if !ctx.alive() {
            return Value::default();
        }
        let slot = ctx.track_value(raw);
        Value {
            inner: Some(ValueInner {
                ctx: ctx.clone(),
                slot,
            }),
        }
    }

    /// Whether this handle still refers to a live reference in a live
    /// context.
    pub fn valid(&self) -> bool {
        match &self.inner {
            Some(i) => i.ctx.alive() && i.ctx.value_raw(i.slot).is_some(),
            None => false,
        }
    }

    /// The context this value belongs to.
    pub fn context(&self) -> Result<ContextRef> {
        let inner = self.inner()?;
        Ok(ContextRef::from_inner(inner.clone()))
    }

    /// Extracts the raw engine reference, transferring ownership to the
    /// caller and leaving this handle invalid. The caller becomes
    /// responsible for releasing the reference.
    pub fn steal(&mut self) -> Result<RawValue> {
        if !self.valid() {
            return Err(Error::InvalidContext);
        }
        let ValueInner { ctx, slot } = self.inner.take().ok_or(Error::InvalidContext)?;
        ctx.untrack_value(slot).ok_or(Error::InvalidContext)
    }

    /// Releases the engine reference (when the context is still live) and
    /// leaves this handle invalid. Also the drop behavior.
    pub fn abandon(&mut self) {
        if let Some(ValueInner { ctx, slot }) = self.inner.take() {
            if let Some(raw_ctx) = ctx.raw_opt() {
                if let Some(raw) = ctx.untrack_value(slot) {
                    ctx.engine().value_free(raw_ctx, raw);
                }
            }
        }
    }

    fn inner(&self) -> Result<&Rc<ContextInner>> {
        match &self.inner {
            Some(i) if i.ctx.alive() => Ok(&i.ctx),
            _ => Err(Error::InvalidContext),
        }
    }

    /// Borrows the raw engine reference without transferring ownership.
    pub(crate) fn raw_ref(&self) -> Result<RawValue> {
        let inner = self.inner.as_ref().ok_or(Error::InvalidContext)?;
        if !inner.ctx.alive() {
            return Err(Error::InvalidContext);
        }
        inner.ctx.value_raw(inner.slot).ok_or(Error::InvalidContext)
    }

    /// The engine-level type of this value.
    pub fn kind(&self) -> Result<ValueTag> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let tag = ctx.engine().value_tag(raw, self.raw_ref()?);
        ValueTag::try_from(tag).map_err(|_| Error::Convert {
            expected: "recognized value tag",
        })
    }

    pub fn is_undefined(&self) -> Result<bool> {
        Ok(self.kind()? == ValueTag::Undefined)
    }

    pub fn is_null(&self) -> Result<bool> {
        Ok(self.kind()? == ValueTag::Null)
    }

    pub fn is_bool(&self) -> Result<bool> {
        Ok(self.kind()? == ValueTag::Bool)
    }

    pub fn is_number(&self) -> Result<bool> {
        Ok(matches!(self.kind()?, ValueTag::Int | ValueTag::Float))
    }

    pub fn is_string(&self) -> Result<bool> {
        Ok(self.kind()? == ValueTag::String)
    }

    /// Objects, including error objects.
    pub fn is_object(&self) -> Result<bool> {
        Ok(matches!(self.kind()?, ValueTag::Object | ValueTag::Error))
    }

    /// Engine error objects.
    pub fn is_exception(&self) -> Result<bool> {
        Ok(self.kind()? == ValueTag::Error)
    }

    pub fn is_function(&self) -> Result<bool> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        Ok(ctx.engine().is_function(raw, self.raw_ref()?))
    }

    /// Engine-level strict (identity) equality.
    pub fn strict_eq(&self, other: &Value) -> Result<bool> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        Ok(ctx
            .engine()
            .strict_equals(raw, self.raw_ref()?, other.raw_ref()?))
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.try_as_bool().ok_or(Error::Convert { expected: "bool" })
    }

    pub fn as_i32(&self) -> Result<i32> {
        self.try_as_i32().ok_or(Error::Convert { expected: "int32" })
    }

    pub fn as_u32(&self) -> Result<u32> {
        self.try_as_u32()
            .ok_or(Error::Convert { expected: "uint32" })
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.try_as_i64().ok_or(Error::Convert { expected: "int64" })
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.try_as_f64()
            .ok_or(Error::Convert { expected: "float64" })
    }

    pub fn as_string(&self) -> Result<String> {
        self.try_as_string()
            .ok_or(Error::Convert { expected: "string" })
    }

    pub fn try_as_bool(&self) -> Option<bool> {
        self.convert(|e, c, v| e.to_bool(c, v))
    }

    pub fn try_as_i32(&self) -> Option<i32> {
        self.convert(|e, c, v| e.to_int32(c, v))
    }

    pub fn try_as_u32(&self) -> Option<u32> {
        self.convert(|e, c, v| e.to_uint32(c, v))
    }

    pub fn try_as_i64(&self) -> Option<i64> {
        self.convert(|e, c, v| e.to_int64(c, v))
    }

    pub fn try_as_f64(&self) -> Option<f64> {
        self.convert(|e, c, v| e.to_float64(c, v))
    }

    pub fn try_as_string(&self) -> Option<String> {
        self.convert(|e, c, v| e.to_string(c, v))
    }

    fn convert<T>(
        &self,
        f: impl FnOnce(&dyn crate::engine::Engine, crate::engine::RawContext, RawValue) -> Option<T>,
    ) -> Option<T> {
        let ctx = self.inner().ok()?;
        let raw = ctx.raw_opt()?;
        let v = self.raw_ref().ok()?;
        match f(ctx.engine(), raw, v) {
            Some(t) => Some(t),
            None => {
                // A failed conversion leaves a throw pending at the engine
                // level; discard it so it cannot surface from an unrelated
                // later operation.
                let pending = ctx.engine().take_exception(raw);
                ctx.engine().value_free(raw, pending);
                None
            }
        }
    }

    /// Reads a property. A getter may dispatch back into native code, so
    /// this is a full boundary call: throws are reported through the error
    /// taxonomy and forwarded native failures resume here.
    pub fn get_property(&self, name: &str) -> Result<Value> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let ret = ctx.engine().get_property(raw, self.raw_ref()?, name);
        complete_call(ctx, ret, true)
    }

    /// Writes a property, converting native literals as needed.
    pub fn set_property(&self, name: &str, v: impl IntoValue) -> Result<()> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let engine = ctx.engine();
        let ctxref = ContextRef::from_inner(ctx.clone());
        let mut val = v.into_value(&ctxref)?;
        let raw_v = val.steal().unwrap_or_else(|_| engine.new_undefined(raw));
        if !engine.set_property(raw, self.raw_ref()?, name, raw_v) {
            return Err(pending_failure(ctx));
        }
        Ok(())
    }

    /// Installs a native callable as a property of this object.
    pub fn set_property_fn<M, F: NativeCallback<M>>(&self, name: &str, f: F) -> Result<()> {
        let func = self.context()?.new_function(f)?;
        self.set_property(name, func)
    }

    /// Defines a non-enumerable, configurable+writable property, the flag
    /// shape used for methods.
    pub fn define_method_property(&self, name: &str, mut v: Value) -> Result<()> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let engine = ctx.engine();
        let raw_v = v.steal()?;
        if !engine.define_property(raw, self.raw_ref()?, name, raw_v, PropFlags::method()) {
            return Err(pending_failure(ctx));
        }
        Ok(())
    }

    /// Calls this value as a function.
    pub fn call<A: IntoArgs>(&self, this: &Value, args: A) -> Result<Value> {
        let ctx = self.inner()?;
        let ctxref = ContextRef::from_inner(ctx.clone());
        let mut list = ArgList::new(ctxref);
        args.append(&mut list)?;
        self.call_raw(Some(this), &list)
    }

    /// Calls this value as a function with `this` = undefined.
    pub fn invoke<A: IntoArgs>(&self, args: A) -> Result<Value> {
        let ctx = self.inner()?;
        let ctxref = ContextRef::from_inner(ctx.clone());
        let mut list = ArgList::new(ctxref);
        args.append(&mut list)?;
        self.call_raw(None, &list)
    }

    /// Calls this value with arguments supplied by an iterator.
    pub fn call_iter<I>(&self, this: &Value, args: I) -> Result<Value>
    where
        I: IntoIterator,
        I::Item: IntoValue,
    {
        let ctx = self.inner()?;
        let ctxref = ContextRef::from_inner(ctx.clone());
        let mut list = ArgList::new(ctxref.clone());
        for a in args {
            let v = a.into_value(&ctxref)?;
            list.push_value(v);
        }
        self.call_raw(Some(this), &list)
    }

    /// Looks up `name` on this object and calls it with this object as
    /// `this`.
    pub fn call_member<A: IntoArgs>(&self, name: &str, args: A) -> Result<Value> {
        let func = self.get_property(name)?;
        func.call(self, args)
    }

    fn call_raw(&self, this: Option<&Value>, list: &ArgList) -> Result<Value> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let engine = ctx.engine();
        let func = self.raw_ref()?;
        let (this_raw, this_tmp) = match this {
            Some(t) => (t.raw_ref()?, None),
            None => {
                let u = engine.new_undefined(raw);
                (u, Some(u))
            }
        };
        // The guard must stay live through completion handling: a value
        // thrown out of a nested call is routed as a catchable rethrow only
        // while an outer boundary call is still on the stack. The temporary
        // receiver is released before completion, which may unwind when a
        // forwarded panic resumes.
        let level = CallLevel::enter(ctx);
        let ret = engine.call(raw, func, this_raw, list.raw_values());
        if let Some(u) = this_tmp {
            engine.value_free(raw, u);
        }
        let res = complete_call(ctx, ret, true);
        drop(level);
        res
    }

    /// Borrows the native instance stored on this script object.
    pub fn with_native<T: NativeClass, R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let rt = ctx.runtime().ok_or(Error::InvalidContext)?;
        let id = rt
            .lookup_class_id(std::any::TypeId::of::<T>())
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let payload = ctx.engine().get_opaque(raw, self.raw_ref()?, id);
        if payload.is_null() {
            return Err(Error::Convert {
                expected: "native instance",
            });
        }
        let out = match T::KIND {
            ClassKind::Owned => unsafe { f(&*(payload as *const T)) },
            ClassKind::Shared => unsafe { f((*(payload as *const Rc<T>)).as_ref()) },
        };
        Ok(out)
    }

    /// Clones out the shared handle of a shared-class instance.
    pub fn shared_instance<T: NativeClass>(&self) -> Result<Rc<T>> {
        if T::KIND != ClassKind::Shared {
            return Err(Error::Convert {
                expected: "shared instance",
            });
        }
        let ctx = self.inner()?;
        let raw = ctx.expect_raw()?;
        let rt = ctx.runtime().ok_or(Error::InvalidContext)?;
        let id = rt
            .lookup_class_id(std::any::TypeId::of::<T>())
            .ok_or_else(|| Error::Registration("class not registered".into()))?;
        let payload = ctx.engine().get_opaque(raw, self.raw_ref()?, id);
        if payload.is_null() {
            return Err(Error::Convert {
                expected: "shared instance",
            });
        }
        Ok(unsafe { (*(payload as *const Rc<T>)).clone() })
    }

    /// Best-effort string rendering for error display.
    pub(crate) fn display_lossy(&self) -> String {
        self.try_as_string()
            .unwrap_or_else(|| "<invalid value>".into())
    }
}

impl Clone for Value {
    fn clone(&self) -> Value {
        if let Some(i) = &self.inner {
            if let (Some(raw_ctx), Some(raw)) = (i.ctx.raw_opt(), i.ctx.value_raw(i.slot)) {
                let dup = i.ctx.engine().value_dup(raw_ctx, raw);
                return Value::adopt(&i.ctx, dup);
            }
        }
        Value::default()
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Ok(tag) => write!(f, "Value({tag:?})"),
            Err(_) => write!(f, "Value(<invalid>)"),
        }
    }
}
