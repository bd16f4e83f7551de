//! Safe, lifetime-managing embedding layer over an embeddable script
//! engine.
//!
//! The engine itself (parsing, execution, garbage collection) sits behind
//! the [`Engine`] trait; this crate supplies everything an embedder needs
//! on top of it:
//!
//! - [`Runtime`] and [`Context`] own the engine heap and its evaluation
//!   environments, and force-invalidate every outstanding [`Value`] on
//!   teardown rather than letting handles dangle;
//! - [`Value`] is a tracked, reference-counted handle with conversions,
//!   property access and call operations;
//! - native functions and classes are wrapped with automatic argument
//!   marshaling ([`Args`], [`FromValue`], [`IntoValue`]);
//! - failures cross the boundary in both directions without ever unwinding
//!   through the engine: script throws surface as [`Error`], native errors
//!   and panics are forwarded past script `catch` and re-raised at the
//!   outermost boundary.
//!
//! ```no_run
//! use std::rc::Rc;
//! use quill::prelude::*;
//!
//! fn demo(engine: Rc<dyn Engine>) -> Result<()> {
//!     let runtime = Runtime::new(engine);
//!     let ctx = runtime.new_context();
//!     ctx.eval("function greet(name) { return 'hi ' + name; }")?;
//!     let reply = ctx.call_global("greet", ("world",))?;
//!     println!("{}", reply.as_string()?);
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod class;
pub mod closure;
pub mod context;
pub mod convert;
pub mod engine;
pub mod error;
pub mod runtime;
mod tracker;
pub mod value;

pub use args::Args;
pub use class::{ClassKind, ClassSpec, Marker, NativeClass};
pub use closure::{NativeCallback, WithArgs};
pub use context::{Context, ContextRef, EvalMode};
pub use convert::{FromValue, IntoArgs, IntoCallResult, IntoValue};
pub use engine::{
    AllocHooks, ClassId, Engine, EvalKind, PropFlags, RawContext, RawRuntime, RawValue, ValueTag,
};
pub use error::{Error, Result};
pub use runtime::{MemoryHooks, Runtime};
pub use value::Value;

pub mod prelude {
    //! Convenience re-exports for embedders.
    pub use crate::args::Args;
    pub use crate::class::{ClassKind, ClassSpec, Marker, NativeClass};
    pub use crate::context::{Context, ContextRef, EvalMode};
    pub use crate::convert::{FromValue, IntoArgs, IntoValue};
    pub use crate::engine::{Engine, ValueTag};
    pub use crate::error::{Error, Result};
    pub use crate::runtime::{MemoryHooks, Runtime};
    pub use crate::value::Value;
}
