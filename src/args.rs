//! Argument view passed to native callbacks.

use std::ops::Index;
use std::rc::Rc;

use crate::context::{ContextInner, ContextRef};
use crate::engine::RawValue;
use crate::value::Value;

/// The arguments of one inbound call.
///
/// Holds owned duplicates of `this` and every positional argument, padded
/// with undefined up to the declared arity so positional access never goes
/// out of bounds. Extra arguments beyond the arity are kept and reachable
/// through [`Args::len`] and indexing.
pub struct Args {
    ctx: ContextRef,
    this: Value,
    values: Vec<Value>,
}

impl Args {
    pub(crate) fn for_call(
        inner: &Rc<ContextInner>,
        this: RawValue,
        argv: &[RawValue],
        arity: u32,
    ) -> Args {
        let ctx = ContextRef::from_inner(inner.clone());
        let Some(raw) = inner.raw_opt() else {
            return Args {
                ctx,
                this: Value::default(),
                values: Vec::new(),
            };
        };
        let engine = inner.engine();
        let count = argv.len().max(arity as usize);
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let v = if i < argv.len() {
                engine.value_dup(raw, argv[i])
            } else {
                engine.new_undefined(raw)
            };
            values.push(Value::adopt(inner, v));
        }
        Args {
            ctx,
            this: Value::adopt(inner, engine.value_dup(raw, this)),
            values,
        }
    }

    /// The context the call arrived on.
    pub fn context(&self) -> ContextRef {
        self.ctx.clone()
    }

    /// The receiver of the call.
    pub fn this(&self) -> &Value {
        &self.this
    }

    /// Number of accessible arguments (at least the declared arity).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }
}

impl Index<usize> for Args {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl<'a> IntoIterator for &'a Args {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
