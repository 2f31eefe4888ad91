//! Whole-program lowering driver.
//!
//! Lowering runs as a two-phase state machine over one [`CompileContext`]:
//!
//! 1. **Discovery** passes lower the whole reachable program, growing the
//!    usage and capture tables, until their fingerprint is stable.
//! 2. One **final** pass lowers again with complete knowledge. Discovering
//!    anything new at this point is a compiler defect.
//!
//! Each pass starts from an empty [`Binary`]. Faults are collected per
//! statement; any fault left after the last discovery pass stops the
//! pipeline before the final pass.

use std::collections::HashMap;
use std::rc::Rc;

use kindc_types::ast::{DeclId, DeclKind, Program, Stmt as AstStmt, StmtKind};
use kindc_types::{CompileError, Span};
use tracing::debug;

use crate::backend;
use crate::binary::Binary;
use crate::error::{CodegenError, CodegenResult};
use crate::func;
use crate::ir::{CellId, CellKind, Expr, ProcKind, Procedure, RtCall, SharedExpr, SharedId, Stmt};
use crate::runtime::{NativeTable, STLOC};
use crate::stmt;
use crate::types::{is_ref_decl, is_ref_type};
use crate::usage::UsageTables;

// ══════════════════════════════════════════════════════════════════════════════
// Public API
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Reported as the file of every fault.
    pub file_name: String,
    pub max_discovery_passes: usize,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            file_name: "main.ts".to_string(),
            max_discovery_passes: 10,
        }
    }
}

/// Lower `program` and generate assembly text for every procedure.
pub fn compile_program(
    program: &Program,
    natives: &NativeTable,
    options: &CodegenOptions,
) -> Result<Binary, Vec<CompileError>> {
    let mut ctx = CompileContext::new(program, natives, &options.file_name);

    let mut previous = None;
    let mut passes = 0;
    loop {
        passes += 1;
        ctx.run_pass(Pass::Discovery);
        let fingerprint = ctx.usage.fingerprint();
        debug!(pass = passes, ?fingerprint, faults = ctx.faults.len(), "discovery pass");
        if previous == Some(fingerprint) {
            break;
        }
        if passes >= options.max_discovery_passes {
            let err = CodegenError::LimitExceeded(format!(
                "usage analysis did not settle after {passes} passes"
            ));
            ctx.fault(err, program.span, None);
            return Err(ctx.faults);
        }
        previous = Some(fingerprint);
    }
    if !ctx.faults.is_empty() {
        return Err(ctx.faults);
    }

    ctx.run_pass(Pass::Final);
    debug!(procs = ctx.bin.procs.len(), faults = ctx.faults.len(), "final pass");
    if !ctx.faults.is_empty() {
        return Err(ctx.faults);
    }

    let mut bin = ctx.bin;
    let mut faults = Vec::new();
    for idx in 0..bin.procs.len() {
        match backend::emit_procedure(&bin, idx, natives) {
            Ok(text) => bin.procs[idx].text = text,
            Err(err) => {
                let p = bin.proc(idx);
                faults.push(err.at(&options.file_name, p.span).with_node(p.name.clone()));
            }
        }
    }
    if faults.is_empty() {
        Ok(bin)
    } else {
        Err(faults)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Context
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Discovery,
    Final,
}

/// Field layout of a class: reference fields first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub fields: Vec<DeclId>,
    pub ref_fields: usize,
}

impl ClassInfo {
    pub fn index_of(&self, field: DeclId) -> Option<usize> {
        self.fields.iter().position(|&f| f == field)
    }
}

/// Jump targets of an enclosing loop or labelled statement.
#[derive(Debug, Clone)]
pub struct LoopLabels {
    pub name: Option<String>,
    pub brk: String,
    /// `None` for labelled statements that are not loops.
    pub cont: Option<String>,
}

pub struct CompileContext<'a> {
    pub program: &'a Program,
    pub natives: &'a NativeTable,
    pub usage: UsageTables,
    classes: HashMap<DeclId, ClassInfo>,
    pub bin: Binary,
    /// Procedure currently receiving statements.
    pub proc: usize,
    pub pass: Pass,
    pub faults: Vec<CompileError>,
    pub loops: Vec<LoopLabels>,
    /// Source label waiting for the loop it names.
    pub pending_label: Option<String>,
    next_shared: u32,
    file_name: String,
}

impl<'a> CompileContext<'a> {
    pub fn new(program: &'a Program, natives: &'a NativeTable, file_name: &str) -> Self {
        Self {
            program,
            natives,
            usage: UsageTables::new(),
            classes: HashMap::new(),
            bin: Binary::new(),
            proc: 0,
            pass: Pass::Discovery,
            faults: Vec::new(),
            loops: Vec::new(),
            pending_label: None,
            next_shared: 0,
            file_name: file_name.to_string(),
        }
    }

    /// Lower the root procedure and everything it reaches.
    pub fn run_pass(&mut self, pass: Pass) {
        self.pass = pass;
        self.bin = Binary::new();
        self.usage.begin_pass();
        self.faults.clear();
        self.loops.clear();
        self.pending_label = None;
        self.next_shared = 0;

        let program = self.program;
        let root = Procedure::new(
            0,
            None,
            ProcKind::Root,
            "<main>",
            returns_value(&program.body),
            program.span,
        );
        self.proc = self.bin.add_proc(root);
        stmt::emit_stmts(self, &program.body);
        if let Err(err) = func::finish_procedure(self) {
            self.fault(err, program.span, None);
        }
        func::drain_frontier(self);
    }

    // ── Faults ───────────────────────────────────────────────────────────

    pub fn fault(&mut self, err: CodegenError, span: Span, node: Option<&str>) {
        let mut reported = err.at(&self.file_name, span);
        if let Some(node) = node {
            reported = reported.with_node(node);
        }
        self.faults.push(reported);
    }

    /// A fact that must already be known in the final pass.
    fn check_settled(&self, changed: bool, what: impl FnOnce() -> String) -> CodegenResult<()> {
        if changed && self.pass == Pass::Final {
            Err(CodegenError::InternalInvariant(what()))
        } else {
            Ok(())
        }
    }

    // ── Procedure access ─────────────────────────────────────────────────

    pub fn cur(&mut self) -> &mut Procedure {
        self.bin.proc_mut(self.proc)
    }

    /// Function owning the code being lowered; `None` for the root.
    pub fn current_fn(&self) -> Option<DeclId> {
        self.bin.proc(self.proc).decl
    }

    pub fn emit(&mut self, stmt: Stmt) {
        self.cur().emit(stmt);
    }

    pub fn emit_expr(&mut self, expr: Expr) {
        self.cur().emit_expr(expr);
    }

    pub fn mk_label(&mut self, root: &str) -> String {
        self.cur().mk_label(root)
    }

    // ── Usage ────────────────────────────────────────────────────────────

    /// Mark an on-demand declaration reachable.
    pub fn use_decl(&mut self, id: DeclId) -> CodegenResult<()> {
        let discovered = self.usage.mark_used(self.program, id);
        self.check_settled(discovered, || {
            format!("{} discovered in the final pass", self.program.decl(id).name)
        })
    }

    /// Record a read or write of a variable-like declaration or a closure
    /// location from the current procedure.
    pub fn note_use(&mut self, id: DeclId, written: bool) -> CodegenResult<()> {
        let current = self.current_fn();
        let changed = self.usage.record_use(self.program, id, current, written);
        self.check_settled(changed, || {
            format!("new capture of {} in the final pass", self.program.decl(id).name)
        })
    }

    // ── Cells ────────────────────────────────────────────────────────────

    /// Cell holding `decl` as seen from the current procedure.
    pub fn lookup_cell(&mut self, decl: DeclId) -> CodegenResult<CellId> {
        let program = self.program;
        let d = program.decl(decl);
        if d.is_global_var() {
            let is_ref = is_ref_decl(d)?;
            return Ok(self.bin.add_global(decl, &d.name, is_ref));
        }
        if let Some(cell) = self.bin.find_cell(self.proc, decl) {
            return Ok(cell);
        }
        if self.pass == Pass::Final && d.parent != self.current_fn() {
            return Err(CodegenError::InternalInvariant(format!(
                "{} is not captured by {}",
                d.name,
                self.bin.proc(self.proc).name
            )));
        }
        self.mk_local(decl)
    }

    /// Local cell for `decl` in the current procedure.
    pub fn mk_local(&mut self, decl: DeclId) -> CodegenResult<CellId> {
        let program = self.program;
        let d = program.decl(decl);
        let is_ref = is_ref_decl(d)?;
        let boxed = d.is_variable_like() && self.usage.var_info(decl).boxed();
        self.bin
            .add_cell(self.proc, decl, &d.name, CellKind::Local, is_ref, boxed)
    }

    /// Store an owned value into a cell, releasing the previous value.
    pub fn store_by_ref(&mut self, cell: CellId, src: Expr) -> Expr {
        let c = self.bin.cell(cell).clone();
        if c.is_global() {
            c.store_direct(src)
        } else if c.boxed {
            Expr::rtcall(
                format!("{STLOC}{}", c.ref_suffix()),
                vec![Expr::CellRef(cell), src],
            )
        } else if c.is_ref {
            let v = self.shared(src);
            Expr::Sequence(vec![
                v.clone(),
                Expr::Decr(Box::new(Expr::CellRef(cell))),
                c.store_direct(v),
            ])
        } else {
            c.store_direct(src)
        }
    }

    // ── Expression helpers ───────────────────────────────────────────────

    /// Wrap `e` so that it is evaluated once and may be referenced again.
    pub fn shared(&mut self, e: Expr) -> Expr {
        match e {
            Expr::NumberLiteral(_) | Expr::PointerLiteral { .. } | Expr::Shared(_) => e,
            inner => {
                let id = SharedId(self.next_shared);
                self.next_shared += 1;
                Expr::Shared(Rc::new(SharedExpr { id, inner }))
            }
        }
    }

    /// Runtime call whose masked arguments are released after the call.
    pub fn rtcall_mask(&mut self, name: &str, mask: u8, is_async: bool, args: Vec<Expr>) -> Expr {
        if mask == 0 {
            return Expr::RuntimeCall(RtCall {
                name: name.to_string(),
                args,
                mask,
                is_async,
            });
        }
        let args: Vec<Expr> = args
            .into_iter()
            .enumerate()
            .map(|(i, a)| if mask & (1 << i) != 0 { self.shared(a) } else { a })
            .collect();
        let releases: Vec<Expr> = args
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, a)| Expr::Decr(Box::new(a.clone())))
            .collect();
        let call = self.shared(Expr::RuntimeCall(RtCall {
            name: name.to_string(),
            args,
            mask,
            is_async,
        }));
        let mut seq = Vec::with_capacity(releases.len() + 2);
        seq.push(call.clone());
        seq.extend(releases);
        seq.push(call);
        Expr::Sequence(seq)
    }

    /// Drop an owned value of type `ty`.
    pub fn release(&self, value: Expr, ty: &kindc_types::ast::Type) -> CodegenResult<Expr> {
        Ok(if is_ref_type(ty)? {
            Expr::Decr(Box::new(value))
        } else {
            value
        })
    }

    // ── Classes ──────────────────────────────────────────────────────────

    pub fn class_info(&mut self, class: DeclId) -> CodegenResult<ClassInfo> {
        if let Some(info) = self.classes.get(&class) {
            return Ok(info.clone());
        }
        let program = self.program;
        let decl = program.decl(class);
        let c = program.class(class).ok_or_else(|| {
            CodegenError::InternalInvariant(format!("{} is not a class", decl.name))
        })?;
        if !c.type_params.is_empty() {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "generic class {}",
                decl.name
            )));
        }
        if let Some(base) = &c.extends {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "class {} extends {base}: inheritance not supported",
                decl.name
            )));
        }
        if let Some(&f) = c.initialized_fields.first() {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "field initializer on {}.{}",
                decl.name,
                program.decl(f).name
            )));
        }
        let mut refs = Vec::new();
        let mut prims = Vec::new();
        for &f in &c.fields {
            if is_ref_decl(program.decl(f))? {
                refs.push(f);
            } else {
                prims.push(f);
            }
        }
        let info = ClassInfo {
            ref_fields: refs.len(),
            fields: refs.into_iter().chain(prims).collect(),
        };
        self.classes.insert(class, info.clone());
        Ok(info)
    }

    /// Class owning field `field` and the field's slot.
    pub fn field_slot(&mut self, field: DeclId) -> CodegenResult<(usize, bool)> {
        let program = self.program;
        let d = program.decl(field);
        let class = match d.kind {
            DeclKind::Field { class } => class,
            _ => {
                return Err(CodegenError::UnsupportedSyntax(format!(
                    "{} is not a field",
                    d.name
                )))
            }
        };
        let info = self.class_info(class)?;
        let index = info.index_of(field).ok_or_else(|| {
            CodegenError::InternalInvariant(format!("field {} missing from its class", d.name))
        })?;
        Ok((index, is_ref_decl(d)?))
    }

    /// Release every reference-holding local and argument of the current
    /// procedure.
    pub fn emit_clears(&mut self) {
        let p = self.bin.proc(self.proc);
        let cells: Vec<CellId> = p.locals.iter().chain(&p.args).copied().collect();
        for cell in cells {
            let c = self.bin.cell(cell);
            if c.is_ref || c.boxed {
                self.emit_expr(Expr::Decr(Box::new(Expr::CellRef(cell))));
            }
        }
    }
}

/// Whether top-level code returns a value.
fn returns_value(stmts: &[AstStmt]) -> bool {
    stmts.iter().any(|s| match &s.kind {
        StmtKind::Return(Some(_)) => true,
        StmtKind::Block(body) => returns_value(body),
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            returns_value(std::slice::from_ref(then_branch))
                || else_branch
                    .as_deref()
                    .is_some_and(|e| returns_value(std::slice::from_ref(e)))
        }
        StmtKind::While { body, .. }
        | StmtKind::DoWhile { body, .. }
        | StmtKind::For { body, .. }
        | StmtKind::Labeled { body, .. } => returns_value(std::slice::from_ref(body)),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindc_types::ast::{Expr as AstExpr, Type};
    use kindc_types::ProgramBuilder;

    #[test]
    fn shared_leaves_literals_alone() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = CompileContext::new(&program, &natives, "main.ts");
        assert_eq!(ctx.shared(Expr::num(3)), Expr::num(3));
        let s = ctx.shared(Expr::JmpValue);
        assert!(s.as_shared().is_some());
        assert_eq!(ctx.shared(s.clone()), s);
    }

    #[test]
    fn masked_calls_release_their_arguments() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = CompileContext::new(&program, &natives, "main.ts");
        let call = ctx.rtcall_mask(
            "string::concat_op",
            0b11,
            false,
            vec![Expr::rtcall("f", vec![]), Expr::rtcall("g", vec![])],
        );
        let Expr::Sequence(items) = call else {
            panic!("expected a sequence");
        };
        assert_eq!(items.len(), 4);
        assert_eq!(items[0], items[3]);
        assert!(matches!(items[1], Expr::Decr(_)));
        assert!(matches!(items[2], Expr::Decr(_)));
    }

    #[test]
    fn class_layout_puts_references_first() {
        let mut b = ProgramBuilder::new();
        let c = b.class("Sprite");
        let x = b.field(c, "x", Type::Number);
        let name = b.field(c, "name", Type::String);
        let y = b.field(c, "y", Type::Number);
        let program = b.finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = CompileContext::new(&program, &natives, "main.ts");

        let info = ctx.class_info(c).unwrap();
        assert_eq!(info.fields, vec![name, x, y]);
        assert_eq!(info.ref_fields, 1);
        assert_eq!(ctx.field_slot(y).unwrap(), (2, false));
        assert_eq!(ctx.field_slot(name).unwrap(), (0, true));
    }

    #[test]
    fn generic_classes_are_rejected() {
        let mut b = ProgramBuilder::new();
        let c = b.class("Box");
        if let DeclKind::Class(cls) = &mut b.decl_mut(c).kind {
            cls.type_params.push("T".into());
        }
        let program = b.finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = CompileContext::new(&program, &natives, "main.ts");
        assert!(matches!(
            ctx.class_info(c),
            Err(CodegenError::UnsupportedSyntax(_))
        ));
    }

    #[test]
    fn root_return_detection() {
        let nested = AstStmt::if_else(
            AstExpr::boolean(true),
            AstStmt::block(vec![AstStmt::ret(Some(AstExpr::number(1)))]),
            None,
        );
        assert!(returns_value(&[nested]));
        assert!(!returns_value(&[AstStmt::ret(None)]));
    }
}
