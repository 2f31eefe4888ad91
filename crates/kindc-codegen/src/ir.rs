//! Intermediate representation.
//!
//! A procedure body is a flat list of [`Stmt`]s; structured control flow
//! has already been lowered to labels and jumps. Expressions are trees,
//! except that a [`Expr::Shared`] node may be referenced from several
//! places: it is evaluated once (at its first use in emission order) and
//! consumed by each later use through the evaluation stack.
//!
//! Reference counting is explicit. Every expression of reference type
//! yields an owned (+1) reference; [`Expr::Incr`] and [`Expr::Decr`] mark
//! the places where ownership is duplicated or dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use kindc_types::ast::DeclId;
use kindc_types::Span;

use crate::error::{CodegenError, CodegenResult};

// ══════════════════════════════════════════════════════════════════════════════
// Cells
// ══════════════════════════════════════════════════════════════════════════════

/// Index into the cell arena of a [`Binary`](crate::binary::Binary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub u32);

impl CellId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Global,
    Local,
    Argument,
    Captured,
}

/// A storage location bound to one declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: CellId,
    pub decl: DeclId,
    pub name: String,
    pub kind: CellKind,
    /// Position within its storage class.
    pub index: usize,
    pub is_ref: bool,
    /// Captured and written: the slot holds a pointer to a heap box.
    pub boxed: bool,
}

impl Cell {
    pub fn is_global(&self) -> bool {
        self.kind == CellKind::Global
    }

    /// Whether loads and stores of this cell must adjust reference counts
    /// in generated code (globals and boxes do it inside the runtime).
    pub fn refcounted_here(&self) -> bool {
        self.is_ref && !self.is_global() && !self.boxed
    }

    pub fn ref_suffix(&self) -> &'static str {
        if self.is_ref {
            "Ref"
        } else {
            ""
        }
    }

    /// Read the current value as an owned reference.
    pub fn load(&self) -> Expr {
        let cell = Expr::CellRef(self.id);
        if self.boxed {
            Expr::rtcall(format!("bitvm::ldloc{}", self.ref_suffix()), vec![cell])
        } else if self.refcounted_here() {
            Expr::Incr(Box::new(cell))
        } else {
            cell
        }
    }

    /// Overwrite the slot itself, bypassing boxes and reference counts.
    pub fn store_direct(&self, value: Expr) -> Expr {
        Expr::Store {
            target: Box::new(Expr::CellRef(self.id)),
            value: Box::new(value),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SharedId(pub u32);

/// A value computed once and consumed by every reference to this node.
#[derive(Debug, PartialEq)]
pub struct SharedExpr {
    pub id: SharedId,
    pub inner: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtCall {
    pub name: String,
    pub args: Vec<Expr>,
    /// Bit `i` set: argument `i` is a reference the caller drops after the call.
    pub mask: u8,
    pub is_async: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(i32),
    /// Address of a label; `info` is a human-readable rendering of the data.
    PointerLiteral { label: String, info: String },
    CellRef(CellId),
    FieldAccess {
        base: Box<Expr>,
        index: usize,
        is_ref: bool,
    },
    Store { target: Box<Expr>, value: Box<Expr> },
    RuntimeCall(RtCall),
    ProcCall { callee: DeclId, args: Vec<Expr> },
    Shared(Rc<SharedExpr>),
    /// Evaluate in order; the value is that of the last element.
    Sequence(Vec<Expr>),
    Incr(Box<Expr>),
    Decr(Box<Expr>),
    /// The value carried by the jump that reached the current label.
    JmpValue,
}

impl Expr {
    pub fn rtcall(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::RuntimeCall(RtCall {
            name: name.into(),
            args,
            mask: 0,
            is_async: false,
        })
    }

    pub fn num(n: i32) -> Expr {
        Expr::NumberLiteral(n)
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::NumberLiteral(_) | Expr::PointerLiteral { .. })
    }

    /// Whether evaluating this expression may write a cell (or anything a
    /// cell read could observe).
    pub fn can_update_cells(&self) -> bool {
        match self {
            Expr::NumberLiteral(_) | Expr::PointerLiteral { .. } | Expr::CellRef(_) | Expr::JmpValue => {
                false
            }
            Expr::Sequence(_) | Expr::Store { .. } | Expr::RuntimeCall(_) | Expr::ProcCall { .. } => {
                true
            }
            Expr::Incr(e) | Expr::Decr(e) => e.can_update_cells(),
            Expr::FieldAccess { base, .. } => base.can_update_cells(),
            Expr::Shared(s) => s.inner.can_update_cells(),
        }
    }

    pub fn as_shared(&self) -> Option<&Rc<SharedExpr>> {
        match self {
            Expr::Shared(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
            for (i, a) in args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{a}")?;
            }
            Ok(())
        }
        match self {
            Expr::NumberLiteral(n) => write!(f, "{n}"),
            Expr::PointerLiteral { label, .. } => write!(f, "&{label}"),
            Expr::CellRef(c) => write!(f, "cell{}", c.0),
            Expr::FieldAccess { base, index, .. } => write!(f, "{base}.{index}"),
            Expr::Store { target, value } => write!(f, "{{ {target} := {value} }}"),
            Expr::RuntimeCall(call) => {
                write!(f, "{}(", call.name)?;
                list(f, &call.args)?;
                write!(f, ")")
            }
            Expr::ProcCall { callee, args } => {
                write!(f, "proc{callee}(")?;
                list(f, args)?;
                write!(f, ")")
            }
            Expr::Shared(s) => write!(f, "SH{}[{}]", s.id.0, s.inner),
            Expr::Sequence(items) => {
                write!(f, "(")?;
                for (i, e) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                write!(f, ")")
            }
            Expr::Incr(e) => write!(f, "INCR({e})"),
            Expr::Decr(e) => write!(f, "DECR({e})"),
            Expr::JmpValue => write!(f, "JMPVALUE"),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpMode {
    Always,
    IfZero,
    IfNotZero,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    /// Jump to `label`; a value, if any, is carried in r0.
    Jmp {
        label: String,
        mode: JmpMode,
        value: Option<Expr>,
    },
    Label(String),
    /// The evaluation stack must be empty here.
    StackEmpty,
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Expr(e) => write!(f, "    {e}"),
            Stmt::Jmp { label, mode, value } => {
                write!(f, "    JMP {mode:?} {label}")?;
                if let Some(v) = value {
                    write!(f, " {v}")?;
                }
                Ok(())
            }
            Stmt::Label(l) => write!(f, "{l}:"),
            Stmt::StackEmpty => write!(f, "    ;; stack empty"),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Procedures
// ══════════════════════════════════════════════════════════════════════════════

/// What a procedure was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    Root,
    Function,
    Lambda,
    Method,
    Constructor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub seq_no: usize,
    /// Source function; `None` for the root.
    pub decl: Option<DeclId>,
    pub kind: ProcKind,
    pub name: String,
    pub label: String,
    pub has_return: bool,
    pub args: Vec<CellId>,
    pub locals: Vec<CellId>,
    pub captured: Vec<CellId>,
    pub body: Vec<Stmt>,
    pub span: Span,
    /// Assembly text, filled in by the backend.
    pub text: String,
    label_seq: u32,
}

impl Procedure {
    pub fn new(
        seq_no: usize,
        decl: Option<DeclId>,
        kind: ProcKind,
        name: &str,
        has_return: bool,
        span: Span,
    ) -> Self {
        let label = match decl {
            Some(id) => proc_label(name, id),
            None => "_main___".to_string(),
        };
        Self {
            seq_no,
            decl,
            kind,
            name: name.to_string(),
            label,
            has_return,
            args: Vec::new(),
            locals: Vec::new(),
            captured: Vec::new(),
            body: Vec::new(),
            span,
            text: String::new(),
            label_seq: 0,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == ProcKind::Root
    }

    /// Entry point used when the procedure is called through an action.
    pub fn lit_label(&self) -> String {
        format!("{}_Lit", self.label)
    }

    pub fn ret_label(&self) -> String {
        format!(".ret_{}", self.seq_no)
    }

    /// A fresh local label.
    pub fn mk_label(&mut self, root: &str) -> String {
        self.label_seq += 1;
        format!(".{root}_{}_{}", self.seq_no, self.label_seq)
    }

    pub fn emit(&mut self, stmt: Stmt) {
        self.body.push(stmt);
    }

    pub fn emit_expr(&mut self, expr: Expr) {
        self.body.push(Stmt::Expr(expr));
    }

    pub fn emit_label(&mut self, label: String) {
        self.body.push(Stmt::Label(label));
    }

    pub fn emit_jmp(&mut self, label: String, mode: JmpMode, value: Option<Expr>) {
        self.body.push(Stmt::Jmp { label, mode, value });
    }

    pub fn stack_empty(&mut self) {
        self.body.push(Stmt::StackEmpty);
    }

    /// Textual dump of the IR, one statement per line.
    pub fn dump(&self) -> String {
        let mut out = format!("PROC {} {}\n", self.seq_no, self.name);
        for stmt in &self.body {
            out.push_str(&stmt.to_string());
            out.push('\n');
        }
        out
    }
}

/// Entry label of the procedure compiled from function `id`.
pub fn proc_label(name: &str, id: DeclId) -> String {
    format!("_{}_{}", sanitize(name), id.0)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ══════════════════════════════════════════════════════════════════════════════
// Resolution
// ══════════════════════════════════════════════════════════════════════════════

/// Count how many times each shared node is referenced in `body`.
///
/// The inner expression of a shared node is visited only once, at its first
/// reference, matching how it is evaluated.
pub fn count_shared_uses(body: &[Stmt]) -> HashMap<SharedId, u32> {
    fn visit(e: &Expr, uses: &mut HashMap<SharedId, u32>) {
        match e {
            Expr::Shared(s) => {
                let n = uses.entry(s.id).or_insert(0);
                *n += 1;
                if *n == 1 {
                    visit(&s.inner, uses);
                }
            }
            Expr::FieldAccess { base, .. } => visit(base, uses),
            Expr::Store { target, value } => {
                visit(target, uses);
                visit(value, uses);
            }
            Expr::RuntimeCall(call) => call.args.iter().for_each(|a| visit(a, uses)),
            Expr::ProcCall { args, .. } | Expr::Sequence(args) => {
                args.iter().for_each(|a| visit(a, uses))
            }
            Expr::Incr(inner) | Expr::Decr(inner) => visit(inner, uses),
            Expr::NumberLiteral(_) | Expr::PointerLiteral { .. } | Expr::CellRef(_) | Expr::JmpValue => {}
        }
    }

    let mut uses = HashMap::new();
    for stmt in body {
        match stmt {
            Stmt::Expr(e) => visit(e, &mut uses),
            Stmt::Jmp { value: Some(v), .. } => visit(v, &mut uses),
            _ => {}
        }
    }
    uses
}

/// Check that every jump target is defined exactly once.
pub fn check_labels(body: &[Stmt]) -> CodegenResult<()> {
    let mut defined = HashSet::new();
    for stmt in body {
        if let Stmt::Label(l) = stmt {
            if !defined.insert(l.as_str()) {
                return Err(CodegenError::InternalInvariant(format!(
                    "label {l} defined twice"
                )));
            }
        }
    }
    for stmt in body {
        if let Stmt::Jmp { label, .. } = stmt {
            if !defined.contains(label.as_str()) {
                return Err(CodegenError::InternalInvariant(format!(
                    "missing label {label}"
                )));
            }
        }
    }
    Ok(())
}
