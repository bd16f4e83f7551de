//! Conversions between native types and script values.
//!
//! Inbound argument conversion ([`FromValue`]) is deliberately lossy and
//! infallible, mirroring script coercion at the boundary: a missing or
//! mistyped argument converts to the type's neutral value instead of
//! failing the whole call. Outbound conversion ([`IntoValue`]) is fallible
//! because it has to allocate in the engine.

use crate::context::ContextRef;
use crate::engine::RawValue;
use crate::error::Result;
use crate::value::Value;

/// Conversion of a native literal (or value) into a script value.
pub trait IntoValue {
    fn into_value(self, ctx: &ContextRef) -> Result<Value>;
}

impl IntoValue for Value {
    fn into_value(self, _ctx: &ContextRef) -> Result<Value> {
        Ok(self)
    }
}

impl IntoValue for &Value {
    fn into_value(self, _ctx: &ContextRef) -> Result<Value> {
        Ok(self.clone())
    }
}

macro_rules! into_value_via {
    ($($ty:ty => $ctor:ident),* $(,)?) => {
        $(impl IntoValue for $ty {
            fn into_value(self, ctx: &ContextRef) -> Result<Value> {
                let raw = ctx.raw_context()?;
                let v = ctx.inner.engine().$ctor(raw, self);
                crate::context::complete_call(&ctx.inner, v, false)
            }
        })*
    };
}

into_value_via! {
    bool => new_bool,
    i32 => new_int32,
    u32 => new_uint32,
    i64 => new_int64,
    u64 => new_uint64,
    f64 => new_float64,
}

impl IntoValue for &str {
    fn into_value(self, ctx: &ContextRef) -> Result<Value> {
        let raw = ctx.raw_context()?;
        let v = ctx.inner.engine().new_string(raw, self);
        crate::context::complete_call(&ctx.inner, v, false)
    }
}

impl IntoValue for String {
    fn into_value(self, ctx: &ContextRef) -> Result<Value> {
        self.as_str().into_value(ctx)
    }
}

/// Lossy conversion of a script value into a native parameter type.
///
/// Strings convert only from actual script strings; everything else maps
/// to the empty string. Numbers and booleans coerce the way the engine
/// does, falling back to zero / `false` when coercion fails.
pub trait FromValue {
    fn from_value(v: &Value) -> Self;
}

impl FromValue for Value {
    fn from_value(v: &Value) -> Self {
        v.clone()
    }
}

impl FromValue for String {
    fn from_value(v: &Value) -> Self {
        if v.is_string().unwrap_or(false) {
            v.try_as_string().unwrap_or_default()
        } else {
            String::new()
        }
    }
}

impl FromValue for bool {
    fn from_value(v: &Value) -> Self {
        v.try_as_bool().unwrap_or(false)
    }
}

impl FromValue for i32 {
    fn from_value(v: &Value) -> Self {
        v.try_as_i32().unwrap_or(0)
    }
}

impl FromValue for u32 {
    fn from_value(v: &Value) -> Self {
        v.try_as_u32().unwrap_or(0)
    }
}

impl FromValue for i64 {
    fn from_value(v: &Value) -> Self {
        v.try_as_i64().unwrap_or(0)
    }
}

impl FromValue for f64 {
    fn from_value(v: &Value) -> Self {
        v.try_as_f64().unwrap_or(0.0)
    }
}

/// Conversion of a native callback's return into a call completion.
///
/// `()` completes with undefined; an `Err` propagates into the exception
/// bridge; a returned invalid [`Value`] also completes with undefined.
pub trait IntoCallResult {
    fn into_call_result(self, ctx: &ContextRef) -> Result<Value>;
}

impl IntoCallResult for () {
    fn into_call_result(self, _ctx: &ContextRef) -> Result<Value> {
        Ok(Value::default())
    }
}

macro_rules! call_result_via_value {
    ($($ty:ty),* $(,)?) => {
        $(impl IntoCallResult for $ty {
            fn into_call_result(self, ctx: &ContextRef) -> Result<Value> {
                self.into_value(ctx)
            }
        })*
    };
}

call_result_via_value!(Value, bool, i32, u32, i64, u64, f64, &str, String);

impl<T: IntoCallResult> IntoCallResult for Result<T> {
    fn into_call_result(self, ctx: &ContextRef) -> Result<Value> {
        self?.into_call_result(ctx)
    }
}

/// Owned argument buffer for one engine call. Holds the converted value
/// handles alive for the duration of the call and exposes the borrowed raw
/// references the engine expects.
pub struct ArgList {
    ctx: ContextRef,
    vals: Vec<Value>,
    raws: Vec<RawValue>,
}

impl ArgList {
    pub(crate) fn new(ctx: ContextRef) -> Self {
        ArgList {
            ctx,
            vals: Vec::new(),
            raws: Vec::new(),
        }
    }

    pub(crate) fn ctx(&self) -> &ContextRef {
        &self.ctx
    }

    pub(crate) fn push_value(&mut self, v: Value) -> Result<()> {
        let v = if v.valid() { v } else { self.ctx.undefined()? };
        let raw = v.raw_ref()?;
        self.raws.push(raw);
        self.vals.push(v);
        Ok(())
    }

    pub(crate) fn raw_values(&self) -> &[RawValue] {
        &self.raws
    }
}

/// Argument tuples for call sites. Implemented for tuples of up to eight
/// [`IntoValue`] elements (single arguments use the one-element tuple
/// form, `(x,)`).
pub trait IntoArgs {
    fn append(self, list: &mut ArgList) -> Result<()>;
}

impl IntoArgs for () {
    fn append(self, _list: &mut ArgList) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_into_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: IntoValue),+> IntoArgs for ($($name,)+) {
            fn append(self, list: &mut ArgList) -> Result<()> {
                $(
                    let v = self.$idx.into_value(list.ctx())?;
                    list.push_value(v)?;
                )+
                Ok(())
            }
        }
    };
}

impl_into_args!(A: 0);
impl_into_args!(A: 0, B: 1);
impl_into_args!(A: 0, B: 1, C: 2);
impl_into_args!(A: 0, B: 1, C: 2, D: 3);
impl_into_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_into_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_into_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_into_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

impl IntoArgs for &[Value] {
    fn append(self, list: &mut ArgList) -> Result<()> {
        for v in self {
            list.push_value(v.clone())?;
        }
        Ok(())
    }
}
