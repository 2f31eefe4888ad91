//! Reference interpreter for the IR.
//!
//! Runs the final procedures of a [`Binary`] against a model of the runtime
//! with an instrumented heap. Every object counts its references; dropping
//! a freed object or reading a dangling one is an error, and
//! [`Simulator::live_count`] exposes what is still allocated. Shared values
//! follow the same first-use/last-use discipline as the stack machine, so
//! a statement boundary with pending values is reported too.
//!
//! Runtime primitives behave the way the firmware does: loads through
//! `*Ref` variants return a new reference, stores take ownership of the
//! stored value, `ldfld`/`stfld` consume the object reference, and
//! `action::run*` hands the callee its own reference to each argument.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::binary::Binary;
use crate::ir::{self, CellId, CellKind, Expr, JmpMode, RtCall, SharedId, Stmt};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("double free of {0:#x}")]
    DoubleFree(i32),
    #[error("{0:#x} is not a live object")]
    NotAnObject(i32),
    #[error("unknown native {0}")]
    UnknownNative(String),
    #[error("missing label {0}")]
    MissingLabel(String),
    #[error("missing procedure {0}")]
    MissingProcedure(String),
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
    #[error("stack discipline violated: {0}")]
    Stack(String),
    #[error("bad operands: {0}")]
    BadOperands(String),
}

pub type SimResult<T> = Result<T, SimError>;

/// A user-supplied native.
pub type NativeFn = Box<dyn FnMut(&[i32]) -> i32>;

// ══════════════════════════════════════════════════════════════════════════════
// Heap
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Str(String),
    Record { fields: Vec<i32>, ref_fields: usize },
    Box { value: i32, is_ref: bool },
    Action { proc: usize, env: Vec<i32>, n_refs: usize },
    Collection { items: Vec<i32>, is_ref: bool },
    /// Read-only data without structure visible to the program (images).
    Data(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub refs: u32,
    /// Lives in flash; reference counting ignores it.
    pub is_static: bool,
    pub body: Body,
}

const HEAP_BASE: i32 = 0x1000_0000;

#[derive(Debug, Default)]
pub struct Heap {
    objects: HashMap<i32, Object>,
    freed: HashSet<i32>,
    next: i32,
}

impl Heap {
    fn alloc(&mut self, body: Body, is_static: bool) -> i32 {
        let addr = HEAP_BASE + self.next;
        self.next += 8;
        self.objects.insert(
            addr,
            Object {
                refs: 1,
                is_static,
                body,
            },
        );
        addr
    }

    pub fn get(&self, addr: i32) -> SimResult<&Object> {
        self.objects.get(&addr).ok_or(self.dangling(addr))
    }

    fn get_mut(&mut self, addr: i32) -> SimResult<&mut Object> {
        let err = self.dangling(addr);
        self.objects.get_mut(&addr).ok_or(err)
    }

    fn dangling(&self, addr: i32) -> SimError {
        if self.freed.contains(&addr) {
            SimError::DoubleFree(addr)
        } else {
            SimError::NotAnObject(addr)
        }
    }

    pub fn incr(&mut self, addr: i32) -> SimResult<()> {
        if addr == 0 {
            return Ok(());
        }
        let obj = self.get_mut(addr)?;
        if !obj.is_static {
            obj.refs += 1;
        }
        Ok(())
    }

    pub fn decr(&mut self, addr: i32) -> SimResult<()> {
        if addr == 0 {
            return Ok(());
        }
        let obj = self.get_mut(addr)?;
        if obj.is_static {
            return Ok(());
        }
        obj.refs -= 1;
        if obj.refs > 0 {
            return Ok(());
        }
        let Some(obj) = self.objects.remove(&addr) else {
            return Ok(());
        };
        self.freed.insert(addr);
        trace!(addr, "free");
        let children: Vec<i32> = match obj.body {
            Body::Record { fields, ref_fields } => fields.into_iter().take(ref_fields).collect(),
            Body::Box { value, is_ref: true } => vec![value],
            Body::Action { env, n_refs, .. } => env.into_iter().take(n_refs).collect(),
            Body::Collection { items, is_ref: true } => items,
            _ => Vec::new(),
        };
        for child in children {
            self.decr(child)?;
        }
        Ok(())
    }

    /// Number of live heap objects, statics excluded.
    pub fn live_count(&self) -> usize {
        self.objects.values().filter(|o| !o.is_static).count()
    }

    pub fn string(&self, addr: i32) -> SimResult<&str> {
        match &self.get(addr)?.body {
            Body::Str(s) => Ok(s),
            other => Err(SimError::BadOperands(format!("{other:?} is not a string"))),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Interpreter
// ══════════════════════════════════════════════════════════════════════════════

struct Frame {
    proc: usize,
    args: Vec<i32>,
    locals: Vec<i32>,
    env: Option<i32>,
    /// Evaluated shared values with the uses still to come.
    shared: HashMap<SharedId, (i32, u32)>,
    /// Models r0 across statements.
    acc: i32,
}

pub struct Simulator<'a> {
    bin: &'a Binary,
    pub heap: Heap,
    globals: Vec<i32>,
    natives: HashMap<String, NativeFn>,
    frames: Vec<Frame>,
    statics: HashMap<String, i32>,
    lit_procs: HashMap<String, usize>,
    labels: Vec<HashMap<&'a str, usize>>,
    uses: Vec<HashMap<SharedId, u32>>,
    steps: u64,
    step_limit: u64,
}

impl<'a> Simulator<'a> {
    pub fn new(bin: &'a Binary) -> Self {
        let labels = bin
            .procs
            .iter()
            .map(|p| {
                p.body
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| match s {
                        Stmt::Label(l) => Some((l.as_str(), i)),
                        _ => None,
                    })
                    .collect::<HashMap<_, _>>()
            })
            .collect();
        Self {
            bin,
            heap: Heap::default(),
            globals: vec![0; bin.num_globals()],
            natives: HashMap::new(),
            frames: Vec::new(),
            statics: HashMap::new(),
            lit_procs: bin
                .procs
                .iter()
                .enumerate()
                .map(|(i, p)| (p.lit_label(), i))
                .collect(),
            labels,
            uses: bin.procs.iter().map(|p| ir::count_shared_uses(&p.body)).collect(),
            steps: 0,
            step_limit: 1_000_000,
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Provide an implementation for a native the model does not know.
    pub fn define(&mut self, name: &str, f: impl FnMut(&[i32]) -> i32 + 'static) {
        self.natives.insert(name.to_string(), Box::new(f));
    }

    pub fn live_count(&self) -> usize {
        self.heap.live_count()
    }

    pub fn globals(&self) -> &[i32] {
        &self.globals
    }

    /// Run the top-level code; returns its result.
    pub fn run(&mut self) -> SimResult<i32> {
        self.call(0, Vec::new(), None)
    }

    /// Run procedure `idx` with owned arguments.
    pub fn call(&mut self, idx: usize, args: Vec<i32>, env: Option<i32>) -> SimResult<i32> {
        let bin = self.bin;
        let proc = bin
            .procs
            .get(idx)
            .ok_or_else(|| SimError::MissingProcedure(format!("#{idx}")))?;
        if args.len() != proc.args.len() {
            return Err(SimError::BadOperands(format!(
                "{} takes {} arguments, got {}",
                proc.name,
                proc.args.len(),
                args.len()
            )));
        }
        trace!(proc = %proc.name, ?args, "enter");
        self.frames.push(Frame {
            proc: idx,
            args,
            locals: vec![0; proc.locals.len()],
            env,
            shared: HashMap::new(),
            acc: 0,
        });
        let result = self.exec(idx);
        let frame = self.frames.pop();
        let result = result?;
        if let Some(f) = frame {
            if !f.shared.is_empty() {
                return Err(SimError::Stack(format!(
                    "{} returned with pending shared values",
                    proc.name
                )));
            }
        }
        Ok(result)
    }

    fn frame(&mut self) -> SimResult<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| SimError::Stack("no active frame".into()))
    }

    fn exec(&mut self, idx: usize) -> SimResult<i32> {
        let bin = self.bin;
        let body = &bin.proc(idx).body;
        let mut pc = 0;
        while pc < body.len() {
            self.steps += 1;
            if self.steps > self.step_limit {
                return Err(SimError::StepLimit(self.step_limit));
            }
            match &body[pc] {
                Stmt::Expr(e) => {
                    let v = self.eval(e)?;
                    self.frame()?.acc = v;
                }
                Stmt::Jmp { label, mode, value } => {
                    if let Some(v) = value {
                        let v = self.eval(v)?;
                        self.frame()?.acc = v;
                    }
                    let acc = self.frame()?.acc;
                    let taken = match mode {
                        JmpMode::Always => true,
                        JmpMode::IfZero => acc == 0,
                        JmpMode::IfNotZero => acc != 0,
                    };
                    if taken {
                        pc = *self.labels[idx]
                            .get(label.as_str())
                            .ok_or_else(|| SimError::MissingLabel(label.clone()))?;
                        continue;
                    }
                }
                Stmt::Label(_) => {}
                Stmt::StackEmpty => {
                    let frame = self.frame()?;
                    if !frame.shared.is_empty() {
                        let mut ids: Vec<u32> = frame.shared.keys().map(|s| s.0).collect();
                        ids.sort_unstable();
                        return Err(SimError::Stack(format!(
                            "values pending at a statement boundary: {ids:?}"
                        )));
                    }
                }
            }
            pc += 1;
        }
        Ok(self.frame()?.acc)
    }

    fn eval(&mut self, e: &Expr) -> SimResult<i32> {
        match e {
            Expr::NumberLiteral(n) => Ok(*n),
            Expr::PointerLiteral { label, info } => self.static_object(label, info),
            Expr::CellRef(id) => self.load_cell(*id),
            Expr::FieldAccess { base, index, is_ref } => {
                let obj = self.eval(base)?;
                self.ldfld(obj, *index, *is_ref)
            }
            Expr::Store { target, value } => {
                match target.as_ref() {
                    Expr::CellRef(id) => {
                        let v = self.eval(value)?;
                        self.store_cell(*id, v)?;
                    }
                    Expr::FieldAccess { base, index, is_ref } => {
                        let obj = self.eval(base)?;
                        let v = self.eval(value)?;
                        self.stfld(obj, *index, v, *is_ref)?;
                    }
                    other => return Err(SimError::BadOperands(format!("store into {other}"))),
                }
                Ok(0)
            }
            Expr::RuntimeCall(call) => {
                let mut args = Vec::with_capacity(call.args.len());
                for a in &call.args {
                    args.push(self.eval(a)?);
                }
                self.native(call, args)
            }
            Expr::ProcCall { callee, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a)?);
                }
                let idx = self
                    .bin
                    .proc_for(*callee)
                    .map(|p| p.seq_no)
                    .ok_or_else(|| SimError::MissingProcedure(callee.to_string()))?;
                self.call(idx, values, None)
            }
            Expr::Shared(s) => {
                let frame = self.frame()?;
                if let Some((value, remaining)) = frame.shared.get_mut(&s.id) {
                    let v = *value;
                    *remaining -= 1;
                    if *remaining == 0 {
                        frame.shared.remove(&s.id);
                    }
                    return Ok(v);
                }
                let proc = frame.proc;
                let v = self.eval(&s.inner)?;
                let total = self.uses[proc].get(&s.id).copied().unwrap_or(1);
                if total > 1 {
                    self.frame()?.shared.insert(s.id, (v, total - 1));
                }
                Ok(v)
            }
            Expr::Sequence(items) => {
                let mut last = 0;
                for item in items {
                    last = self.eval(item)?;
                }
                Ok(last)
            }
            Expr::Incr(inner) => {
                let v = self.eval(inner)?;
                self.heap.incr(v)?;
                Ok(v)
            }
            Expr::Decr(inner) => {
                let v = self.eval(inner)?;
                self.heap.decr(v)?;
                Ok(0)
            }
            Expr::JmpValue => Ok(self.frame()?.acc),
        }
    }

    fn static_object(&mut self, label: &str, info: &str) -> SimResult<i32> {
        if let Some(&addr) = self.statics.get(label) {
            return Ok(addr);
        }
        let body = if let Some(&proc) = self.lit_procs.get(label) {
            Body::Action {
                proc,
                env: Vec::new(),
                n_refs: 0,
            }
        } else if label.starts_with("_str") {
            Body::Str(serde_json::from_str(info).unwrap_or_else(|_| info.to_string()))
        } else {
            Body::Data(info.to_string())
        };
        let addr = self.heap.alloc(body, true);
        self.statics.insert(label.to_string(), addr);
        Ok(addr)
    }

    // ── Cells ────────────────────────────────────────────────────────────

    /// Raw slot read; globals go through `ldglb` like the emitted code.
    fn load_cell(&mut self, id: CellId) -> SimResult<i32> {
        let cell = self.bin.cell(id);
        let (kind, index, is_ref) = (cell.kind, cell.index, cell.is_ref);
        let frame = self.frame()?;
        match kind {
            CellKind::Local => Ok(frame.locals[index]),
            CellKind::Argument => Ok(frame.args[index]),
            CellKind::Captured => {
                let env = frame
                    .env
                    .ok_or_else(|| SimError::BadOperands("captured read without environment".into()))?;
                self.env_slot(env, index)
            }
            CellKind::Global => {
                let v = self.globals[index];
                if is_ref {
                    self.heap.incr(v)?;
                }
                Ok(v)
            }
        }
    }

    fn store_cell(&mut self, id: CellId, v: i32) -> SimResult<()> {
        let cell = self.bin.cell(id);
        let (kind, index, is_ref) = (cell.kind, cell.index, cell.is_ref);
        let frame = self.frame()?;
        match kind {
            CellKind::Local => frame.locals[index] = v,
            CellKind::Argument => frame.args[index] = v,
            CellKind::Captured => {
                return Err(SimError::BadOperands(format!(
                    "store into captured slot {index}"
                )))
            }
            CellKind::Global => {
                let old = std::mem::replace(&mut self.globals[index], v);
                if is_ref {
                    self.heap.decr(old)?;
                }
            }
        }
        Ok(())
    }

    fn env_slot(&self, action: i32, index: usize) -> SimResult<i32> {
        match &self.heap.get(action)?.body {
            Body::Action { env, .. } => env
                .get(index)
                .copied()
                .ok_or_else(|| SimError::BadOperands(format!("capture slot {index} out of range"))),
            other => Err(SimError::BadOperands(format!("{other:?} is not an action"))),
        }
    }

    // ── Objects ──────────────────────────────────────────────────────────

    fn ldfld(&mut self, obj: i32, index: usize, is_ref: bool) -> SimResult<i32> {
        let v = match &self.heap.get(obj)?.body {
            Body::Record { fields, .. } => fields.get(index).copied(),
            _ => None,
        }
        .ok_or_else(|| SimError::BadOperands(format!("field {index} of {obj:#x}")))?;
        if is_ref {
            self.heap.incr(v)?;
        }
        self.heap.decr(obj)?;
        Ok(v)
    }

    fn stfld(&mut self, obj: i32, index: usize, v: i32, is_ref: bool) -> SimResult<()> {
        let old = match &mut self.heap.get_mut(obj)?.body {
            Body::Record { fields, .. } if index < fields.len() => {
                std::mem::replace(&mut fields[index], v)
            }
            _ => return Err(SimError::BadOperands(format!("field {index} of {obj:#x}"))),
        };
        if is_ref {
            self.heap.decr(old)?;
        }
        self.heap.decr(obj)
    }

    fn box_value(&self, bx: i32) -> SimResult<i32> {
        match &self.heap.get(bx)?.body {
            Body::Box { value, .. } => Ok(*value),
            other => Err(SimError::BadOperands(format!("{other:?} is not a box"))),
        }
    }

    fn new_string(&mut self, s: String) -> i32 {
        self.heap.alloc(Body::Str(s), false)
    }

    // ── Natives ──────────────────────────────────────────────────────────

    fn native(&mut self, call: &RtCall, args: Vec<i32>) -> SimResult<i32> {
        let name = call.name.as_str();
        if let Some(f) = self.natives.get_mut(name) {
            return Ok(f(&args));
        }
        let arg = |i: usize| -> SimResult<i32> {
            args.get(i)
                .copied()
                .ok_or_else(|| SimError::BadOperands(format!("{name} needs argument {i}")))
        };
        let (base, is_ref) = match name.strip_suffix("Ref") {
            Some(b) if b.starts_with("bitvm::") => (b, true),
            _ => (name, false),
        };

        match base {
            "bitvm::incr" => {
                self.heap.incr(arg(0)?)?;
                arg(0)
            }
            "bitvm::decr" => {
                self.heap.decr(arg(0)?)?;
                Ok(0)
            }
            "bitvm::mkloc" => Ok(self.heap.alloc(Body::Box { value: 0, is_ref }, false)),
            "bitvm::ldloc" => {
                let v = self.box_value(arg(0)?)?;
                if is_ref {
                    self.heap.incr(v)?;
                }
                Ok(v)
            }
            "bitvm::stloc" => {
                let (bx, v) = (arg(0)?, arg(1)?);
                let old = match &mut self.heap.get_mut(bx)?.body {
                    Body::Box { value, .. } => std::mem::replace(value, v),
                    other => return Err(SimError::BadOperands(format!("{other:?} is not a box"))),
                };
                if is_ref {
                    self.heap.decr(old)?;
                }
                Ok(0)
            }
            "bitvm::ldglb" => {
                let v = self
                    .globals
                    .get(arg(0)? as usize)
                    .copied()
                    .ok_or_else(|| SimError::BadOperands("global index".into()))?;
                if is_ref {
                    self.heap.incr(v)?;
                }
                Ok(v)
            }
            "bitvm::stglb" => {
                let (v, idx) = (arg(0)?, arg(1)? as usize);
                let slot = self
                    .globals
                    .get_mut(idx)
                    .ok_or_else(|| SimError::BadOperands("global index".into()))?;
                let old = std::mem::replace(slot, v);
                if is_ref {
                    self.heap.decr(old)?;
                }
                Ok(0)
            }
            "bitvm::ldfld" => self.ldfld(arg(0)?, arg(1)? as usize, is_ref),
            "bitvm::stfld" => {
                self.stfld(arg(0)?, arg(1)? as usize, arg(2)?, is_ref)?;
                Ok(0)
            }
            "bitvm::stclo" => {
                let (action, idx, v) = (arg(0)?, arg(1)? as usize, arg(2)?);
                match &mut self.heap.get_mut(action)?.body {
                    Body::Action { env, .. } if idx < env.len() => env[idx] = v,
                    _ => return Err(SimError::BadOperands(format!("closure slot {idx}"))),
                }
                Ok(0)
            }
            "action::mk" => {
                let (n_refs, n, lit) = (arg(0)? as usize, arg(1)? as usize, arg(2)?);
                let proc = match &self.heap.get(lit)?.body {
                    Body::Action { proc, .. } => *proc,
                    other => return Err(SimError::BadOperands(format!("{other:?} is not code"))),
                };
                Ok(self.heap.alloc(
                    Body::Action {
                        proc,
                        env: vec![0; n],
                        n_refs,
                    },
                    false,
                ))
            }
            "record::mk" => {
                let (ref_fields, all) = (arg(0)? as usize, arg(1)? as usize);
                Ok(self.heap.alloc(
                    Body::Record {
                        fields: vec![0; all],
                        ref_fields,
                    },
                    false,
                ))
            }
            "collection::mk" => {
                let is_ref = arg(0)? != 0;
                Ok(self.heap.alloc(
                    Body::Collection {
                        items: Vec::new(),
                        is_ref,
                    },
                    false,
                ))
            }
            "collection::add" => {
                let (coll, v) = (arg(0)?, arg(1)?);
                let is_ref = match &mut self.heap.get_mut(coll)?.body {
                    Body::Collection { items, is_ref } => {
                        items.push(v);
                        *is_ref
                    }
                    other => return Err(SimError::BadOperands(format!("{other:?} is not a collection"))),
                };
                if is_ref {
                    self.heap.incr(v)?;
                }
                Ok(0)
            }
            "collection::at" => {
                let (coll, i) = (arg(0)?, arg(1)?);
                let (v, is_ref) = match &self.heap.get(coll)?.body {
                    Body::Collection { items, is_ref } => {
                        (usize::try_from(i).ok().and_then(|i| items.get(i)).copied().unwrap_or(0), *is_ref)
                    }
                    other => return Err(SimError::BadOperands(format!("{other:?} is not a collection"))),
                };
                if is_ref {
                    self.heap.incr(v)?;
                }
                Ok(v)
            }
            "string::concat_op" => {
                let s = format!("{}{}", self.heap.string(arg(0)?)?, self.heap.string(arg(1)?)?);
                Ok(self.new_string(s))
            }
            "string::at" => {
                let (text, i) = (arg(0)?, arg(1)?);
                let ch = usize::try_from(i)
                    .ok()
                    .and_then(|i| self.heap.string(text).ok()?.chars().nth(i));
                Ok(match ch {
                    Some(c) => self.new_string(c.to_string()),
                    None => 0,
                })
            }
            "string::equals" | "string::neq" | "string::lt" | "string::le" | "string::gt"
            | "string::ge" => {
                let ord = self
                    .heap
                    .string(arg(0)?)?
                    .cmp(self.heap.string(arg(1)?)?);
                let r = match base {
                    "string::equals" => ord.is_eq(),
                    "string::neq" => ord.is_ne(),
                    "string::lt" => ord.is_lt(),
                    "string::le" => ord.is_le(),
                    "string::gt" => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                Ok(i32::from(r))
            }
            "number::to_string" => {
                let s = arg(0)?.to_string();
                Ok(self.new_string(s))
            }
            "boolean::to_string" => {
                let s = if arg(0)? != 0 { "true" } else { "false" };
                Ok(self.new_string(s.to_string()))
            }
            "boolean::not_" => Ok(i32::from(arg(0)? == 0)),
            _ if base.starts_with("action::run") => self.run_action(call, &args),
            _ if base.starts_with("number::") => number_op(base, arg(0)?, arg(1)?),
            _ => Err(SimError::UnknownNative(name.to_string())),
        }
    }

    fn run_action(&mut self, call: &RtCall, args: &[i32]) -> SimResult<i32> {
        let (&action, rest) = args
            .split_first()
            .ok_or_else(|| SimError::BadOperands(format!("{} without an action", call.name)))?;
        let proc = match &self.heap.get(action)?.body {
            Body::Action { proc, .. } => *proc,
            other => return Err(SimError::BadOperands(format!("{other:?} is not an action"))),
        };
        for (i, &a) in rest.iter().enumerate() {
            if call.mask & (1 << (i + 1)) != 0 {
                self.heap.incr(a)?;
            }
        }
        self.call(proc, rest.to_vec(), Some(action))
    }
}

fn number_op(name: &str, a: i32, b: i32) -> SimResult<i32> {
    Ok(match name {
        "number::add" => a.wrapping_add(b),
        "number::subtract" => a.wrapping_sub(b),
        "number::multiply" => a.wrapping_mul(b),
        "number::divide" => a.checked_div(b).unwrap_or(0),
        "number::mod" => a.checked_rem(b).unwrap_or(0),
        "number::lt" => i32::from(a < b),
        "number::le" => i32::from(a <= b),
        "number::gt" => i32::from(a > b),
        "number::ge" => i32::from(a >= b),
        "number::eq" => i32::from(a == b),
        "number::neq" => i32::from(a != b),
        "number::bitand" => a & b,
        "number::bitor" => a | b,
        "number::bitxor" => a ^ b,
        "number::lshift" => a.wrapping_shl(b as u32),
        "number::rshift" => a.wrapping_shr(b as u32),
        other => return Err(SimError::UnknownNative(other.to_string())),
    })
}
