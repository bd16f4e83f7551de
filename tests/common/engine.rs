//! In-memory engine double used by the integration tests.
//!
//! Implements the full [`Engine`] contract over a reference-counted cell
//! heap: real ownership transfer, real pending-exception state, real
//! finalizer and accessor dispatch, and uncatchable errors that script
//! `catch` cannot intercept. Script support is a deliberately tiny
//! pattern-matched subset, just enough for the scenarios the tests drive:
//!
//! - `function NAME(params) {}` (empty body)
//! - `function NAME() { throw 'MSG'; }`
//! - `function NAME() { return LIT; }` and `function NAME() { return OTHER(); }`
//! - `function NAME() { try { return OTHER(); } catch (e) { return LIT; } }`
//!   (also the `return 'prefix' + e;` handler form)
//! - a bare string or numeric literal
//! - a leading `export ` marks the source as a module
//!
//! Anything else evaluates to a thrown `SyntaxError` object.

use std::cell::RefCell;
use std::ffi::c_void;
use std::ptr;

use rustc_hash::FxHashMap;

use quill::engine::{
    AllocHooks, ClassId, ConstructorFn, Engine, EvalKind, FinalizerFn, MarkFn, NativeFn,
    OpaqueFinalizerFn, PropFlags, RawContext, RawRuntime, RawValue, ValueTag,
};

#[derive(Clone)]
enum Callable {
    Host {
        func: NativeFn,
        opaque: *mut c_void,
        finalizer: Option<OpaqueFinalizerFn>,
    },
    Ctor {
        func: ConstructorFn,
        opaque: *mut c_void,
    },
    Script(ScriptFn),
}

#[derive(Clone)]
struct ScriptFn {
    body: Body,
}

#[derive(Clone)]
enum Body {
    Empty,
    ThrowString(String),
    ReturnLiteral(Literal),
    CallForward(String),
    TryCatch {
        call: String,
        handler: Handler,
    },
}

#[derive(Clone)]
enum Handler {
    Literal(Literal),
    Concat(String),
}

#[derive(Clone, PartialEq)]
enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone)]
struct Obj {
    props: Vec<(String, u64)>,
    accessors: Vec<(String, Option<u64>, Option<u64>)>,
    proto: Option<u64>,
    class: Option<ClassId>,
    payload: *mut c_void,
    call: Option<Callable>,
}

impl Default for Obj {
    fn default() -> Self {
        Obj {
            props: Vec::new(),
            accessors: Vec::new(),
            proto: None,
            class: None,
            payload: ptr::null_mut(),
            call: None,
        }
    }
}

impl Obj {
    fn prop(&self, name: &str) -> Option<u64> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    fn accessor(&self, name: &str) -> Option<(Option<u64>, Option<u64>)> {
        self.accessors
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, g, s)| (*g, *s))
    }
}

#[derive(Clone)]
enum Data {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(Obj),
    Error {
        name: String,
        message: String,
        stack: String,
    },
    /// Error that script-level catch must not intercept.
    Uncatchable,
}

struct Cell {
    rt: u64,
    refs: u32,
    data: Data,
}

struct ClassDef {
    #[allow(dead_code)]
    name: String,
    finalizer: FinalizerFn,
    mark: Option<MarkFn>,
}

struct RtState {
    opaque: *mut c_void,
    classes: FxHashMap<u32, ClassDef>,
    next_class_id: u32,
}

impl RtState {
    fn new() -> Self {
        RtState {
            opaque: ptr::null_mut(),
            classes: FxHashMap::default(),
            next_class_id: 1,
        }
    }
}

struct CtxState {
    rt: u64,
    opaque: *mut c_void,
    global: u64,
    pending: Option<u64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    runtimes: FxHashMap<u64, RtState>,
    contexts: FxHashMap<u64, CtxState>,
    cells: FxHashMap<u64, Cell>,
    gc_marked: Vec<u64>,
}

/// The engine double. Hold it in an `Rc` and hand clones to [`quill::Runtime`].
#[derive(Default)]
pub struct TestEngine {
    state: RefCell<State>,
}

impl TestEngine {
    /// Number of live value cells across all runtimes; the leak meter the
    /// lifetime tests read.
    pub fn live_values(&self) -> usize {
        self.state.borrow().cells.len()
    }

    /// Raw ids reported to mark callbacks during the last [`Engine::run_gc`].
    pub fn gc_marked(&self) -> Vec<u64> {
        self.state.borrow().gc_marked.clone()
    }

    fn alloc(&self, rt: u64, data: Data) -> RawValue {
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = st.next_id;
        st.cells.insert(id, Cell { rt, refs: 1, data });
        RawValue(id)
    }

    fn ctx_rt(&self, ctx: RawContext) -> u64 {
        self.state
            .borrow()
            .contexts
            .get(&ctx.0)
            .map(|c| c.rt)
            .unwrap_or(0)
    }

    fn new_cell(&self, ctx: RawContext, data: Data) -> RawValue {
        let rt = self.ctx_rt(ctx);
        self.alloc(rt, data)
    }

    fn data_of(&self, v: RawValue) -> Option<Data> {
        self.state.borrow().cells.get(&v.0).map(|c| c.data.clone())
    }

    /// Decrements and, at zero, destroys a cell: runs finalizers outside
    /// the state borrow and releases every owned child reference.
    fn dec(&self, id: u64) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            if id == u64::MAX {
                continue;
            }
            let dead = {
                let mut st = self.state.borrow_mut();
                let Some(cell) = st.cells.get_mut(&id) else { continue };
                cell.refs -= 1;
                if cell.refs == 0 {
                    st.cells.remove(&id)
                } else {
                    None
                }
            };
            let Some(cell) = dead else { continue };
            if let Data::Object(obj) = cell.data {
                match &obj.call {
                    Some(Callable::Host {
                        opaque,
                        finalizer: Some(f),
                        ..
                    }) => f(*opaque),
                    _ => {}
                }
                if let Some(class_id) = obj.class {
                    let fin = self
                        .state
                        .borrow()
                        .runtimes
                        .get(&cell.rt)
                        .and_then(|r| r.classes.get(&class_id.0))
                        .map(|c| c.finalizer);
                    if let Some(fin) = fin {
                        fin(self, RawRuntime(cell.rt), obj.payload);
                    }
                }
                for (_, v) in obj.props {
                    work.push(v);
                }
                for (_, g, s) in obj.accessors {
                    if let Some(g) = g {
                        work.push(g);
                    }
                    if let Some(s) = s {
                        work.push(s);
                    }
                }
                if let Some(p) = obj.proto {
                    work.push(p);
                }
            }
        }
    }

    fn inc(&self, id: u64) {
        if id == u64::MAX {
            return;
        }
        if let Some(cell) = self.state.borrow_mut().cells.get_mut(&id) {
            cell.refs += 1;
        }
    }

    fn set_pending(&self, ctx: RawContext, v: u64) {
        let old = {
            let mut st = self.state.borrow_mut();
            match st.contexts.get_mut(&ctx.0) {
                Some(c) => c.pending.replace(v),
                None => Some(v),
            }
        };
        if let Some(old) = old {
            self.dec(old);
        }
    }

    fn throw_error_obj(&self, ctx: RawContext, name: &str, message: &str) -> RawValue {
        let err = self.new_cell(
            ctx,
            Data::Error {
                name: name.into(),
                message: message.into(),
                stack: format!("    at {name} (<native>)"),
            },
        );
        self.set_pending(ctx, err.0);
        RawValue::EXCEPTION
    }

    fn literal_cell(&self, ctx: RawContext, lit: &Literal) -> RawValue {
        match lit {
            Literal::Int(i) => self.new_cell(ctx, Data::Int(*i)),
            Literal::Float(f) => self.new_cell(ctx, Data::Float(*f)),
            Literal::Str(s) => self.new_cell(ctx, Data::Str(s.clone())),
        }
    }

    fn stringify(&self, v: RawValue) -> String {
        match self.data_of(v) {
            Some(Data::Undefined) | None => "undefined".into(),
            Some(Data::Null) => "null".into(),
            Some(Data::Bool(b)) => b.to_string(),
            Some(Data::Int(i)) => i.to_string(),
            Some(Data::Float(f)) => f.to_string(),
            Some(Data::Str(s)) => s,
            Some(Data::Object(o)) => {
                if o.call.is_some() {
                    "function".into()
                } else {
                    "[object Object]".into()
                }
            }
            Some(Data::Error { name, message, .. }) => format!("{name}: {message}"),
            Some(Data::Uncatchable) => "uncatchable error".into(),
        }
    }

    fn global_of(&self, ctx: RawContext) -> Option<u64> {
        self.state.borrow().contexts.get(&ctx.0).map(|c| c.global)
    }

    fn lookup_global(&self, ctx: RawContext, name: &str) -> Option<u64> {
        let global = self.global_of(ctx)?;
        match self.data_of(RawValue(global)) {
            Some(Data::Object(obj)) => obj.prop(name),
            _ => None,
        }
    }

    fn pending_is_uncatchable(&self, ctx: RawContext) -> bool {
        let st = self.state.borrow();
        let Some(c) = st.contexts.get(&ctx.0) else {
            return false;
        };
        match c.pending.and_then(|p| st.cells.get(&p)) {
            Some(cell) => matches!(cell.data, Data::Uncatchable),
            None => false,
        }
    }

    fn run_script(&self, ctx: RawContext, body: &Body) -> RawValue {
        match body {
            Body::Empty => self.new_cell(ctx, Data::Undefined),
            Body::ThrowString(msg) => {
                let v = self.new_cell(ctx, Data::Str(msg.clone()));
                self.set_pending(ctx, v.0);
                RawValue::EXCEPTION
            }
            Body::ReturnLiteral(lit) => self.literal_cell(ctx, lit),
            Body::CallForward(name) => self.call_global_by_name(ctx, name),
            Body::TryCatch { call, handler } => {
                let ret = self.call_global_by_name(ctx, call);
                if !ret.is_exception() {
                    return ret;
                }
                if self.pending_is_uncatchable(ctx) {
                    return RawValue::EXCEPTION;
                }
                let thrown = self.take_exception(ctx);
                let result = match handler {
                    Handler::Literal(lit) => self.literal_cell(ctx, lit),
                    Handler::Concat(prefix) => {
                        let text = format!("{prefix}{}", self.stringify(thrown));
                        self.new_cell(ctx, Data::Str(text))
                    }
                };
                self.dec(thrown.0);
                result
            }
        }
    }

    fn call_global_by_name(&self, ctx: RawContext, name: &str) -> RawValue {
        let Some(func) = self.lookup_global(ctx, name) else {
            return self.throw_error_obj(ctx, "TypeError", "not a function");
        };
        let this = self.new_undefined(ctx);
        let ret = self.call(ctx, RawValue(func), this, &[]);
        self.dec(this.0);
        ret
    }
}

fn parse_literal(src: &str) -> Option<Literal> {
    let src = src.trim();
    if src.len() >= 2 && src.starts_with('\'') && src.ends_with('\'') {
        return Some(Literal::Str(src[1..src.len() - 1].to_string()));
    }
    if let Ok(i) = src.parse::<i64>() {
        return Some(Literal::Int(i));
    }
    if let Ok(f) = src.parse::<f64>() {
        return Some(Literal::Float(f));
    }
    None
}

fn parse_call(src: &str) -> Option<String> {
    let src = src.trim().strip_suffix("()")?;
    if !src.is_empty() && src.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Some(src.to_string())
    } else {
        None
    }
}

enum Parsed {
    Function { name: String, body: Body },
    Literal(Literal),
}

fn parse_body(body: &str) -> Result<Body, String> {
    let b = body.trim();
    if b.is_empty() {
        return Ok(Body::Empty);
    }
    if let Some(rest) = b.strip_prefix("throw ") {
        let rest = rest.trim().trim_end_matches(';').trim();
        if let Some(Literal::Str(msg)) = parse_literal(rest) {
            return Ok(Body::ThrowString(msg));
        }
        return Err("unsupported throw form".into());
    }
    if let Some(rest) = b.strip_prefix("return ") {
        let rest = rest.trim().trim_end_matches(';').trim();
        if let Some(name) = parse_call(rest) {
            return Ok(Body::CallForward(name));
        }
        if let Some(lit) = parse_literal(rest) {
            return Ok(Body::ReturnLiteral(lit));
        }
        return Err("unsupported return form".into());
    }
    if let Some(rest) = b.strip_prefix("try") {
        let rest = rest.trim();
        let inner_end = rest.find("} catch").ok_or("missing catch")?;
        let inner = rest[..inner_end]
            .trim()
            .strip_prefix('{')
            .ok_or("missing try block")?
            .trim();
        let call = match inner.strip_prefix("return ") {
            Some(c) => parse_call(c.trim_end_matches(';')).ok_or("unsupported try body")?,
            None => parse_call(inner.trim_end_matches(';')).ok_or("unsupported try body")?,
        };
        let after = &rest[inner_end..];
        let hstart = after.find('{').ok_or("missing catch block")?;
        let hend = after.rfind('}').ok_or("missing catch close")?;
        let handler_src = after[hstart + 1..hend].trim();
        let expr = handler_src
            .strip_prefix("return ")
            .ok_or("unsupported catch body")?
            .trim()
            .trim_end_matches(';')
            .trim();
        let handler = if let Some(prefix_src) = expr.strip_suffix("+ e") {
            match parse_literal(prefix_src.trim()) {
                Some(Literal::Str(p)) => Handler::Concat(p),
                _ => return Err("unsupported catch expression".into()),
            }
        } else {
            match parse_literal(expr) {
                Some(lit) => Handler::Literal(lit),
                None => return Err("unsupported catch expression".into()),
            }
        };
        return Ok(Body::TryCatch { call, handler });
    }
    Err("unsupported statement".into())
}

fn parse_source(src: &str) -> Result<Parsed, String> {
    let src = src.trim();
    let src = src.strip_prefix("export ").unwrap_or(src).trim();
    if let Some(rest) = src.strip_prefix("function ") {
        let open = rest.find('(').ok_or("missing parameter list")?;
        let name = rest[..open].trim().to_string();
        if name.is_empty() {
            return Err("missing function name".into());
        }
        let close = rest.find(')').ok_or("missing parameter list")?;
        let after = rest[close + 1..].trim();
        let body = after
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or("missing function body")?;
        return Ok(Parsed::Function {
            name,
            body: parse_body(body)?,
        });
    }
    match parse_literal(src) {
        Some(lit) => Ok(Parsed::Literal(lit)),
        None => Err("unexpected token".into()),
    }
}

impl Engine for TestEngine {
    fn runtime_new(&self) -> RawRuntime {
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = st.next_id;
        st.runtimes.insert(id, RtState::new());
        RawRuntime(id)
    }

    fn runtime_new_with_hooks(&self, _hooks: AllocHooks) -> RawRuntime {
        // The cell heap lives on the Rust side; hooks are accepted but all
        // traffic stays in the global allocator.
        self.runtime_new()
    }

    fn runtime_free(&self, rt: RawRuntime) {
        // Finalize every surviving object of this runtime. Repeats until
        // stable because finalizers may release further references.
        loop {
            let victim = {
                let st = self.state.borrow();
                st.cells
                    .iter()
                    .find(|(_, c)| c.rt == rt.0)
                    .map(|(id, _)| *id)
            };
            let Some(id) = victim else { break };
            let refs = {
                let st = self.state.borrow();
                st.cells.get(&id).map(|c| c.refs).unwrap_or(0)
            };
            // Force the cell dead regardless of outstanding references.
            if refs > 1 {
                if let Some(c) = self.state.borrow_mut().cells.get_mut(&id) {
                    c.refs = 1;
                }
            }
            self.dec(id);
        }
        self.state.borrow_mut().runtimes.remove(&rt.0);
    }

    fn runtime_set_opaque(&self, rt: RawRuntime, opaque: *mut c_void) {
        if let Some(r) = self.state.borrow_mut().runtimes.get_mut(&rt.0) {
            r.opaque = opaque;
        }
    }

    fn runtime_get_opaque(&self, rt: RawRuntime) -> *mut c_void {
        self.state
            .borrow()
            .runtimes
            .get(&rt.0)
            .map(|r| r.opaque)
            .unwrap_or(ptr::null_mut())
    }

    fn run_gc(&self, rt: RawRuntime) {
        self.state.borrow_mut().gc_marked.clear();
        let marked: Vec<(*mut c_void, MarkFn)> = {
            let st = self.state.borrow();
            let Some(rts) = st.runtimes.get(&rt.0) else {
                return;
            };
            st.cells
                .iter()
                .filter(|(_, c)| c.rt == rt.0)
                .filter_map(|(_, c)| match &c.data {
                    Data::Object(o) => {
                        let class = o.class?;
                        let def = rts.classes.get(&class.0)?;
                        def.mark.map(|m| (o.payload, m))
                    }
                    _ => None,
                })
                .collect()
        };
        for (payload, mark) in marked {
            let mut sink = |v: RawValue| {
                self.state.borrow_mut().gc_marked.push(v.0);
            };
            mark(self, rt, payload, &mut sink);
        }
    }

    fn context_new(&self, rt: RawRuntime) -> RawContext {
        let global = self.alloc(rt.0, Data::Object(Obj::default()));
        let mut st = self.state.borrow_mut();
        st.next_id += 1;
        let id = st.next_id;
        st.contexts.insert(
            id,
            CtxState {
                rt: rt.0,
                opaque: ptr::null_mut(),
                global: global.0,
                pending: None,
            },
        );
        RawContext(id)
    }

    fn context_free(&self, ctx: RawContext) {
        let removed = self.state.borrow_mut().contexts.remove(&ctx.0);
        if let Some(c) = removed {
            if let Some(p) = c.pending {
                self.dec(p);
            }
            self.dec(c.global);
        }
    }

    fn context_set_opaque(&self, ctx: RawContext, opaque: *mut c_void) {
        if let Some(c) = self.state.borrow_mut().contexts.get_mut(&ctx.0) {
            c.opaque = opaque;
        }
    }

    fn context_get_opaque(&self, ctx: RawContext) -> *mut c_void {
        self.state
            .borrow()
            .contexts
            .get(&ctx.0)
            .map(|c| c.opaque)
            .unwrap_or(ptr::null_mut())
    }

    fn context_runtime(&self, ctx: RawContext) -> RawRuntime {
        RawRuntime(self.ctx_rt(ctx))
    }

    fn value_dup(&self, _ctx: RawContext, v: RawValue) -> RawValue {
        self.inc(v.0);
        v
    }

    fn value_free(&self, _ctx: RawContext, v: RawValue) {
        self.dec(v.0);
    }

    fn value_tag(&self, _ctx: RawContext, v: RawValue) -> i32 {
        let tag = match self.data_of(v) {
            Some(Data::Undefined) | None => ValueTag::Undefined,
            Some(Data::Null) => ValueTag::Null,
            Some(Data::Bool(_)) => ValueTag::Bool,
            Some(Data::Int(_)) => ValueTag::Int,
            Some(Data::Float(_)) => ValueTag::Float,
            Some(Data::Str(_)) => ValueTag::String,
            Some(Data::Object(_)) => ValueTag::Object,
            Some(Data::Error { .. }) | Some(Data::Uncatchable) => ValueTag::Error,
        };
        tag.into()
    }

    fn is_function(&self, _ctx: RawContext, v: RawValue) -> bool {
        matches!(self.data_of(v), Some(Data::Object(o)) if o.call.is_some())
    }

    fn strict_equals(&self, _ctx: RawContext, a: RawValue, b: RawValue) -> bool {
        if a == b {
            return true;
        }
        match (self.data_of(a), self.data_of(b)) {
            (Some(Data::Undefined), Some(Data::Undefined)) => true,
            (Some(Data::Null), Some(Data::Null)) => true,
            (Some(Data::Bool(x)), Some(Data::Bool(y))) => x == y,
            (Some(Data::Int(x)), Some(Data::Int(y))) => x == y,
            (Some(Data::Float(x)), Some(Data::Float(y))) => x == y,
            (Some(Data::Int(x)), Some(Data::Float(y))) => x as f64 == y,
            (Some(Data::Float(x)), Some(Data::Int(y))) => x == y as f64,
            (Some(Data::Str(x)), Some(Data::Str(y))) => x == y,
            _ => false,
        }
    }

    fn new_undefined(&self, ctx: RawContext) -> RawValue {
        self.new_cell(ctx, Data::Undefined)
    }

    fn new_null(&self, ctx: RawContext) -> RawValue {
        self.new_cell(ctx, Data::Null)
    }

    fn new_bool(&self, ctx: RawContext, v: bool) -> RawValue {
        self.new_cell(ctx, Data::Bool(v))
    }

    fn new_int32(&self, ctx: RawContext, v: i32) -> RawValue {
        self.new_cell(ctx, Data::Int(v as i64))
    }

    fn new_uint32(&self, ctx: RawContext, v: u32) -> RawValue {
        self.new_cell(ctx, Data::Int(v as i64))
    }

    fn new_int64(&self, ctx: RawContext, v: i64) -> RawValue {
        self.new_cell(ctx, Data::Int(v))
    }

    fn new_uint64(&self, ctx: RawContext, v: u64) -> RawValue {
        if v <= i64::MAX as u64 {
            self.new_cell(ctx, Data::Int(v as i64))
        } else {
            self.new_cell(ctx, Data::Float(v as f64))
        }
    }

    fn new_float64(&self, ctx: RawContext, v: f64) -> RawValue {
        self.new_cell(ctx, Data::Float(v))
    }

    fn new_string(&self, ctx: RawContext, s: &str) -> RawValue {
        self.new_cell(ctx, Data::Str(s.to_string()))
    }

    fn to_bool(&self, _ctx: RawContext, v: RawValue) -> Option<bool> {
        Some(match self.data_of(v)? {
            Data::Undefined | Data::Null => false,
            Data::Bool(b) => b,
            Data::Int(i) => i != 0,
            Data::Float(f) => f != 0.0 && !f.is_nan(),
            Data::Str(s) => !s.is_empty(),
            Data::Object(_) | Data::Error { .. } | Data::Uncatchable => true,
        })
    }

    fn to_int32(&self, ctx: RawContext, v: RawValue) -> Option<i32> {
        self.to_float64(ctx, v).map(|f| {
            if f.is_nan() || f.is_infinite() {
                0
            } else {
                f as i64 as i32
            }
        })
    }

    fn to_uint32(&self, ctx: RawContext, v: RawValue) -> Option<u32> {
        self.to_int32(ctx, v).map(|i| i as u32)
    }

    fn to_int64(&self, ctx: RawContext, v: RawValue) -> Option<i64> {
        self.to_float64(ctx, v).map(|f| {
            if f.is_nan() || f.is_infinite() {
                0
            } else {
                f as i64
            }
        })
    }

    fn to_float64(&self, _ctx: RawContext, v: RawValue) -> Option<f64> {
        Some(match self.data_of(v)? {
            Data::Undefined => f64::NAN,
            Data::Null => 0.0,
            Data::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Data::Int(i) => i as f64,
            Data::Float(f) => f,
            Data::Str(s) => {
                let t = s.trim();
                if t.is_empty() {
                    0.0
                } else {
                    t.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Data::Object(_) | Data::Error { .. } | Data::Uncatchable => f64::NAN,
        })
    }

    fn to_string(&self, _ctx: RawContext, v: RawValue) -> Option<String> {
        self.data_of(v)?;
        Some(self.stringify(v))
    }

    fn get_global(&self, ctx: RawContext) -> RawValue {
        match self.global_of(ctx) {
            Some(g) => {
                self.inc(g);
                RawValue(g)
            }
            None => self.new_undefined(ctx),
        }
    }

    fn get_property(&self, ctx: RawContext, obj: RawValue, name: &str) -> RawValue {
        match self.data_of(obj) {
            Some(Data::Error {
                name: ename,
                message,
                stack,
            }) => match name {
                "name" => self.new_string(ctx, &ename),
                "message" => self.new_string(ctx, &message),
                "stack" => self.new_string(ctx, &stack),
                _ => self.new_undefined(ctx),
            },
            Some(Data::Object(_)) => {
                // Walk the prototype chain; accessors win over data props.
                let mut current = obj.0;
                loop {
                    let Some(Data::Object(o)) = self.data_of(RawValue(current)) else {
                        return self.new_undefined(ctx);
                    };
                    if let Some((getter, _)) = o.accessor(name) {
                        let Some(g) = getter else {
                            return self.new_undefined(ctx);
                        };
                        let ret = self.call(ctx, RawValue(g), obj, &[]);
                        return ret;
                    }
                    if let Some(v) = o.prop(name) {
                        self.inc(v);
                        return RawValue(v);
                    }
                    match o.proto {
                        Some(p) => current = p,
                        None => return self.new_undefined(ctx),
                    }
                }
            }
            _ => self.new_undefined(ctx),
        }
    }

    fn set_property(&self, ctx: RawContext, obj: RawValue, name: &str, v: RawValue) -> bool {
        // Accessor lookup along the prototype chain first.
        let mut current = obj.0;
        loop {
            let Some(Data::Object(o)) = self.data_of(RawValue(current)) else {
                break;
            };
            if let Some((_, setter)) = o.accessor(name) {
                let Some(s) = setter else {
                    self.dec(v.0);
                    let _ = self.throw_error_obj(ctx, "TypeError", "no setter");
                    return false;
                };
                let ret = self.call(ctx, RawValue(s), obj, &[v]);
                self.dec(v.0);
                if ret.is_exception() {
                    return false;
                }
                self.dec(ret.0);
                return true;
            }
            match o.proto {
                Some(p) => current = p,
                None => break,
            }
        }
        let old = {
            let mut st = self.state.borrow_mut();
            match st.cells.get_mut(&obj.0) {
                Some(Cell {
                    data: Data::Object(o),
                    ..
                }) => {
                    if let Some(slot) = o.props.iter_mut().find(|(n, _)| n == name) {
                        Some(std::mem::replace(&mut slot.1, v.0))
                    } else {
                        o.props.push((name.to_string(), v.0));
                        None
                    }
                }
                _ => {
                    drop(st);
                    self.dec(v.0);
                    let _ = self.throw_error_obj(ctx, "TypeError", "not an object");
                    return false;
                }
            }
        };
        if let Some(old) = old {
            self.dec(old);
        }
        true
    }

    fn define_property(
        &self,
        ctx: RawContext,
        obj: RawValue,
        name: &str,
        v: RawValue,
        _flags: PropFlags,
    ) -> bool {
        // Flags are accepted but not enforced by the double; definition
        // bypasses accessors.
        let old = {
            let mut st = self.state.borrow_mut();
            match st.cells.get_mut(&obj.0) {
                Some(Cell {
                    data: Data::Object(o),
                    ..
                }) => {
                    if let Some(slot) = o.props.iter_mut().find(|(n, _)| n == name) {
                        Some(std::mem::replace(&mut slot.1, v.0))
                    } else {
                        o.props.push((name.to_string(), v.0));
                        None
                    }
                }
                _ => {
                    drop(st);
                    self.dec(v.0);
                    let _ = self.throw_error_obj(ctx, "TypeError", "not an object");
                    return false;
                }
            }
        };
        if let Some(old) = old {
            self.dec(old);
        }
        true
    }

    fn define_accessor(
        &self,
        ctx: RawContext,
        obj: RawValue,
        name: &str,
        getter: Option<RawValue>,
        setter: Option<RawValue>,
    ) -> bool {
        let mut st = self.state.borrow_mut();
        match st.cells.get_mut(&obj.0) {
            Some(Cell {
                data: Data::Object(o),
                ..
            }) => {
                o.accessors
                    .push((name.to_string(), getter.map(|g| g.0), setter.map(|s| s.0)));
                true
            }
            _ => {
                drop(st);
                if let Some(g) = getter {
                    self.dec(g.0);
                }
                if let Some(s) = setter {
                    self.dec(s.0);
                }
                let _ = self.throw_error_obj(ctx, "TypeError", "not an object");
                false
            }
        }
    }

    fn detect_module(&self, src: &str) -> bool {
        let src = src.trim_start();
        src.starts_with("import ") || src.starts_with("export ")
    }

    fn eval(&self, ctx: RawContext, src: &str, _name: &str, _kind: EvalKind) -> RawValue {
        match parse_source(src) {
            Ok(Parsed::Function { name, body }) => {
                let func = self.new_cell(
                    ctx,
                    Data::Object(Obj {
                        call: Some(Callable::Script(ScriptFn { body })),
                        ..Obj::default()
                    }),
                );
                let Some(global) = self.global_of(ctx) else {
                    self.dec(func.0);
                    return self.throw_error_obj(ctx, "ReferenceError", "no global object");
                };
                if !self.set_property(ctx, RawValue(global), &name, func) {
                    return RawValue::EXCEPTION;
                }
                self.new_undefined(ctx)
            }
            Ok(Parsed::Literal(lit)) => self.literal_cell(ctx, &lit),
            Err(msg) => self.throw_error_obj(ctx, "SyntaxError", &msg),
        }
    }

    fn call(&self, ctx: RawContext, func: RawValue, this: RawValue, args: &[RawValue]) -> RawValue {
        let callable = match self.data_of(func) {
            Some(Data::Object(o)) => o.call,
            _ => None,
        };
        match callable {
            Some(Callable::Host {
                func: f, opaque, ..
            }) => f(self, ctx, this, args, opaque),
            Some(Callable::Script(script)) => self.run_script(ctx, &script.body),
            Some(Callable::Ctor { .. }) | None => {
                self.throw_error_obj(ctx, "TypeError", "not a function")
            }
        }
    }

    fn call_constructor(&self, ctx: RawContext, ctor: RawValue, args: &[RawValue]) -> RawValue {
        let callable = match self.data_of(ctor) {
            Some(Data::Object(o)) => o.call,
            _ => None,
        };
        match callable {
            Some(Callable::Ctor { func, opaque }) => func(self, ctx, ctor, args, opaque),
            _ => self.throw_error_obj(ctx, "TypeError", "not a constructor"),
        }
    }

    fn throw(&self, ctx: RawContext, v: RawValue) -> RawValue {
        self.set_pending(ctx, v.0);
        RawValue::EXCEPTION
    }

    fn throw_type_error(&self, ctx: RawContext, msg: &str) -> RawValue {
        self.throw_error_obj(ctx, "TypeError", msg)
    }

    fn throw_reference_error(&self, ctx: RawContext, msg: &str) -> RawValue {
        self.throw_error_obj(ctx, "ReferenceError", msg)
    }

    fn throw_uncatchable(&self, ctx: RawContext) -> RawValue {
        let v = self.new_cell(ctx, Data::Uncatchable);
        self.set_pending(ctx, v.0);
        RawValue::EXCEPTION
    }

    fn take_exception(&self, ctx: RawContext) -> RawValue {
        let pending = self
            .state
            .borrow_mut()
            .contexts
            .get_mut(&ctx.0)
            .and_then(|c| c.pending.take());
        match pending {
            Some(p) => RawValue(p),
            None => self.new_undefined(ctx),
        }
    }

    fn new_function(
        &self,
        ctx: RawContext,
        func: NativeFn,
        _arity: u32,
        opaque: *mut c_void,
        finalizer: Option<OpaqueFinalizerFn>,
    ) -> RawValue {
        self.new_cell(
            ctx,
            Data::Object(Obj {
                call: Some(Callable::Host {
                    func,
                    opaque,
                    finalizer,
                }),
                ..Obj::default()
            }),
        )
    }

    fn new_constructor(
        &self,
        ctx: RawContext,
        func: ConstructorFn,
        name: &str,
        _arity: u32,
        opaque: *mut c_void,
    ) -> RawValue {
        let ctor = self.new_cell(
            ctx,
            Data::Object(Obj {
                call: Some(Callable::Ctor { func, opaque }),
                ..Obj::default()
            }),
        );
        let name_cell = self.new_string(ctx, name);
        let _ = self.define_property(ctx, ctor, "name", name_cell, PropFlags::empty());
        ctor
    }

    fn set_constructor(&self, ctx: RawContext, ctor: RawValue, proto: RawValue) {
        let proto = self.value_dup(ctx, proto);
        let _ = self.define_property(ctx, ctor, "prototype", proto, PropFlags::empty());
    }

    fn new_class_id(&self, rt: RawRuntime) -> ClassId {
        let mut st = self.state.borrow_mut();
        let r = st.runtimes.get_mut(&rt.0).expect("unknown runtime");
        let id = r.next_class_id;
        r.next_class_id += 1;
        ClassId(id)
    }

    fn is_class_registered(&self, rt: RawRuntime, id: ClassId) -> bool {
        self.state
            .borrow()
            .runtimes
            .get(&rt.0)
            .map(|r| r.classes.contains_key(&id.0))
            .unwrap_or(false)
    }

    fn register_class(
        &self,
        rt: RawRuntime,
        id: ClassId,
        name: &str,
        finalizer: FinalizerFn,
        mark: Option<MarkFn>,
    ) -> bool {
        let mut st = self.state.borrow_mut();
        let Some(r) = st.runtimes.get_mut(&rt.0) else {
            return false;
        };
        if r.classes.contains_key(&id.0) {
            return false;
        }
        r.classes.insert(
            id.0,
            ClassDef {
                name: name.to_string(),
                finalizer,
                mark,
            },
        );
        true
    }

    fn new_object(&self, ctx: RawContext) -> RawValue {
        self.new_cell(ctx, Data::Object(Obj::default()))
    }

    fn new_object_class(&self, ctx: RawContext, proto: RawValue, id: ClassId) -> RawValue {
        let proto = self.value_dup(ctx, proto);
        self.new_cell(
            ctx,
            Data::Object(Obj {
                proto: Some(proto.0),
                class: Some(id),
                ..Obj::default()
            }),
        )
    }

    fn set_opaque(&self, _ctx: RawContext, obj: RawValue, payload: *mut c_void) {
        if let Some(Cell {
            data: Data::Object(o),
            ..
        }) = self.state.borrow_mut().cells.get_mut(&obj.0)
        {
            o.payload = payload;
        }
    }

    fn get_opaque(&self, _ctx: RawContext, obj: RawValue, id: ClassId) -> *mut c_void {
        match self.data_of(obj) {
            Some(Data::Object(o)) if o.class == Some(id) => o.payload,
            _ => ptr::null_mut(),
        }
    }
}
