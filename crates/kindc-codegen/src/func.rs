//! Function bodies, closures and procedure frames.
//!
//! Where a function is compiled depends on what it is:
//!
//! | function                               | compiled                      |
//! |----------------------------------------|-------------------------------|
//! | nested declaration or expression       | at its declaration site       |
//! | top-level declaration with captures    | at its declaration site       |
//! | top-level declaration without captures | from the frontier, when used  |
//! | method, constructor                    | from the frontier, when used  |
//!
//! A function value without captures is a pointer to the static action
//! header in front of its `_Lit` entry. With captures it is a heap action
//! holding one slot per captured declaration, reference slots first.

use kindc_types::ast::{DeclId, FunctionDecl, FunctionKind};

use crate::compiler::CompileContext;
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{proc_label, CellKind, Expr, JmpMode, ProcKind, Procedure, Stmt};
use crate::runtime::{ACTION_MK, MKLOC, STCLO, STLOC};
use crate::stmt;
use crate::types::{is_ref_decl, MAX_CAPTURES, MAX_LAMBDA_ARGS};

// ══════════════════════════════════════════════════════════════════════════════
// Sites
// ══════════════════════════════════════════════════════════════════════════════

/// A function declaration statement.
pub fn emit_function_decl(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<()> {
    let program = ctx.program;
    let decl = program.decl(id);
    let f = function(ctx, id)?;
    if f.body.is_none() || f.is_member() {
        return Ok(());
    }
    let has_captures = !ctx.usage.captures(id).is_empty();
    if decl.parent.is_none() && !has_captures {
        // Compiled from the frontier once something calls it.
        return Ok(());
    }
    if !ctx.usage.is_used(program, id) || !ctx.usage.claim(id) {
        return Ok(());
    }

    if has_captures {
        let action = closure_value(ctx, id)?;
        let location = ctx.mk_local(id)?;
        let store = ctx.store_by_ref(location, action);
        ctx.emit_expr(store);
        ctx.cur().stack_empty();
    }
    compile_body(ctx, id);
    Ok(())
}

/// An arrow function or function expression; yields the function value.
pub fn emit_function_expr(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<Expr> {
    let value = closure_value(ctx, id)?;
    ctx.usage.claim(id);
    compile_body(ctx, id);
    Ok(value)
}

/// Compile every function queued in this pass.
pub fn drain_frontier(ctx: &mut CompileContext) {
    while let Some(id) = ctx.usage.next_queued() {
        compile_body(ctx, id);
    }
}

fn function<'p>(ctx: &CompileContext<'p>, id: DeclId) -> CodegenResult<&'p FunctionDecl> {
    let program = ctx.program;
    program.function(id).ok_or_else(|| {
        CodegenError::InternalInvariant(format!("{} is not a function", program.decl(id).name))
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// Closures
// ══════════════════════════════════════════════════════════════════════════════

/// Captured declarations of `id` in slot order and the number of
/// reference slots.
pub fn capture_order(ctx: &CompileContext, id: DeclId) -> CodegenResult<(Vec<DeclId>, usize)> {
    let mut refs = Vec::new();
    let mut prims = Vec::new();
    for &cap in ctx.usage.captures(id) {
        if is_ref_decl(ctx.program.decl(cap))? || ctx.usage.var_info(cap).boxed() {
            refs.push(cap);
        } else {
            prims.push(cap);
        }
    }
    let n_refs = refs.len();
    refs.extend(prims);
    Ok((refs, n_refs))
}

/// Build the value of function `id` in the current procedure.
fn closure_value(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<Expr> {
    let program = ctx.program;
    let decl = program.decl(id);
    let f = function(ctx, id)?;
    let lit = format!("{}_Lit", proc_label(&decl.name, id));
    let pointer = Expr::PointerLiteral {
        label: lit,
        info: decl.name.clone(),
    };

    let arity = f.params.len() + usize::from(f.this_param.is_some());
    if arity > MAX_LAMBDA_ARGS {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "{} takes {arity} parameters; function values take at most {MAX_LAMBDA_ARGS}",
            decl.name
        )));
    }

    let (caps, n_refs) = capture_order(ctx, id)?;
    if caps.is_empty() {
        return Ok(pointer);
    }
    if f.is_member() {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "method {} cannot capture local variables",
            decl.name
        )));
    }
    if caps.len() > MAX_CAPTURES {
        return Err(CodegenError::LimitExceeded(format!(
            "{} captures {} variables (at most {MAX_CAPTURES})",
            decl.name,
            caps.len()
        )));
    }

    let action = ctx.shared(Expr::rtcall(
        ACTION_MK,
        vec![Expr::num(n_refs as i32), Expr::num(caps.len() as i32), pointer],
    ));
    for (slot, cap) in caps.into_iter().enumerate() {
        ctx.note_use(cap, false)?;
        let cell = ctx.lookup_cell(cap)?;
        let c = ctx.bin.cell(cell);
        let value = if c.is_ref || c.boxed {
            Expr::Incr(Box::new(Expr::CellRef(cell)))
        } else {
            Expr::CellRef(cell)
        };
        ctx.emit_expr(Expr::rtcall(
            STCLO,
            vec![action.clone(), Expr::num(slot as i32), value],
        ));
    }
    Ok(action)
}

// ══════════════════════════════════════════════════════════════════════════════
// Procedures
// ══════════════════════════════════════════════════════════════════════════════

fn proc_kind(kind: FunctionKind) -> ProcKind {
    match kind {
        FunctionKind::Declaration => ProcKind::Function,
        FunctionKind::Expression => ProcKind::Lambda,
        FunctionKind::Method => ProcKind::Method,
        FunctionKind::Constructor => ProcKind::Constructor,
    }
}

/// Lower the body of `id` into a new procedure. Faults are recorded, not
/// returned.
fn compile_body(ctx: &mut CompileContext, id: DeclId) {
    let program = ctx.program;
    let decl = program.decl(id);
    let Some(f) = program.function(id) else {
        return;
    };
    let Some(body) = &f.body else {
        return;
    };

    let seq = ctx.bin.procs.len();
    let proc = Procedure::new(
        seq,
        Some(id),
        proc_kind(f.kind),
        &decl.name,
        !f.ret.is_void(),
        decl.span,
    );
    let saved_proc = ctx.proc;
    let saved_loops = std::mem::take(&mut ctx.loops);
    let saved_label = ctx.pending_label.take();
    ctx.proc = ctx.bin.add_proc(proc);

    match setup_frame(ctx, id, f) {
        Ok(()) => {
            stmt::emit_stmts(ctx, body);
            if let Err(err) = finish_procedure(ctx) {
                ctx.fault(err, decl.span, Some(f.kind.name()));
            }
        }
        Err(err) => ctx.fault(err, decl.span, Some(f.kind.name())),
    }

    ctx.proc = saved_proc;
    ctx.loops = saved_loops;
    ctx.pending_label = saved_label;
    drain_frontier(ctx);
}

/// Create the captured and argument cells; move written captured
/// arguments into boxes.
fn setup_frame(ctx: &mut CompileContext, id: DeclId, f: &FunctionDecl) -> CodegenResult<()> {
    let program = ctx.program;
    let (caps, _) = capture_order(ctx, id)?;
    for cap in caps {
        let d = program.decl(cap);
        let is_ref = is_ref_decl(d)?;
        let boxed = d.is_variable_like() && ctx.usage.var_info(cap).boxed();
        ctx.bin
            .add_cell(ctx.proc, cap, &d.name, CellKind::Captured, is_ref, boxed)?;
    }

    let mut boxed_args = Vec::new();
    for &param in f.this_param.iter().chain(&f.params) {
        let d = program.decl(param);
        let is_ref = is_ref_decl(d)?;
        let boxed = ctx.usage.var_info(param).boxed();
        let cell = ctx
            .bin
            .add_cell(ctx.proc, param, &d.name, CellKind::Argument, is_ref, boxed)?;
        if boxed {
            boxed_args.push(cell);
        }
    }

    for cell in boxed_args {
        let c = ctx.bin.cell(cell).clone();
        let suffix = c.ref_suffix();
        let bx = ctx.shared(Expr::rtcall(format!("{MKLOC}{suffix}"), vec![]));
        ctx.emit_expr(Expr::rtcall(
            format!("{STLOC}{suffix}"),
            vec![bx.clone(), Expr::CellRef(cell)],
        ));
        ctx.emit_expr(c.store_direct(bx));
        ctx.cur().stack_empty();
    }
    Ok(())
}

/// Emit the single return point of the current procedure.
///
/// A returned value travels to `ret` in r0, is parked on the stack while
/// locals and arguments are released, and leaves through `final`.
pub fn finish_procedure(ctx: &mut CompileContext) -> CodegenResult<()> {
    let p = ctx.cur();
    let ret = p.ret_label();
    let is_root = p.is_root();
    let has_return = p.has_return;

    if has_return {
        p.emit_jmp(ret.clone(), JmpMode::Always, Some(Expr::num(0)));
    }
    p.emit_label(ret);
    if is_root {
        p.stack_empty();
        return Ok(());
    }

    if has_return {
        let value = ctx.shared(Expr::JmpValue);
        ctx.emit_expr(value.clone());
        ctx.emit_clears();
        let fin = ctx.mk_label("final");
        ctx.emit(Stmt::Jmp {
            label: fin.clone(),
            mode: JmpMode::Always,
            value: Some(value),
        });
        ctx.emit(Stmt::Label(fin));
    } else {
        ctx.emit_clears();
    }
    ctx.cur().stack_empty();
    Ok(())
}
