//! Statement lowering.
//!
//! Each statement is an error boundary: a fault is recorded against the
//! statement's span and lowering continues with the next one. Control flow
//! becomes labels and jumps in the current procedure.

use kindc_types::ast::{Stmt as AstStmt, StmtKind};

use crate::compiler::{CompileContext, LoopLabels};
use crate::error::{CodegenError, CodegenResult};
use crate::expr;
use crate::func;
use crate::ir::{Expr, JmpMode, Stmt};
use crate::runtime::MKLOC;
use crate::types::{check_type, is_ref_type};

pub fn emit_stmts(ctx: &mut CompileContext, stmts: &[AstStmt]) {
    for stmt in stmts {
        emit_stmt(ctx, stmt);
    }
}

pub fn emit_stmt(ctx: &mut CompileContext, stmt: &AstStmt) {
    if let Err(err) = lower_stmt(ctx, stmt) {
        ctx.fault(err, stmt.span, Some(stmt.kind.name()));
    }
}

fn lower_stmt(ctx: &mut CompileContext, stmt: &AstStmt) -> CodegenResult<()> {
    match &stmt.kind {
        StmtKind::Var { decl, init } => lower_var(ctx, *decl, init.as_ref()),
        StmtKind::Expr(e) => lower_expr_stmt(ctx, e),
        StmtKind::Block(body) => {
            emit_stmts(ctx, body);
            Ok(())
        }
        StmtKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            let c = condition(ctx, cond)?;
            let else_lbl = ctx.mk_label("else");
            let end_lbl = ctx.mk_label("afterif");
            ctx.emit(Stmt::Jmp {
                label: else_lbl.clone(),
                mode: JmpMode::IfZero,
                value: Some(c),
            });
            ctx.cur().stack_empty();
            emit_stmt(ctx, then_branch);
            ctx.emit(Stmt::Jmp {
                label: end_lbl.clone(),
                mode: JmpMode::Always,
                value: None,
            });
            ctx.emit(Stmt::Label(else_lbl));
            if let Some(e) = else_branch {
                emit_stmt(ctx, e);
            }
            ctx.emit(Stmt::Label(end_lbl));
            Ok(())
        }
        StmtKind::While { cond, body } => {
            let name = ctx.pending_label.take();
            let top = ctx.mk_label("cont");
            let brk = ctx.mk_label("brk");
            ctx.emit(Stmt::Label(top.clone()));
            let c = condition(ctx, cond)?;
            ctx.emit(Stmt::Jmp {
                label: brk.clone(),
                mode: JmpMode::IfZero,
                value: Some(c),
            });
            ctx.cur().stack_empty();
            loop_body(ctx, name, &brk, &top, body);
            ctx.emit(Stmt::Jmp {
                label: top,
                mode: JmpMode::Always,
                value: None,
            });
            ctx.emit(Stmt::Label(brk));
            Ok(())
        }
        StmtKind::DoWhile { body, cond } => {
            let name = ctx.pending_label.take();
            let top = ctx.mk_label("top");
            let cont = ctx.mk_label("cont");
            let brk = ctx.mk_label("brk");
            ctx.emit(Stmt::Label(top.clone()));
            loop_body(ctx, name, &brk, &cont, body);
            ctx.emit(Stmt::Label(cont));
            let c = condition(ctx, cond)?;
            ctx.emit(Stmt::Jmp {
                label: top,
                mode: JmpMode::IfNotZero,
                value: Some(c),
            });
            ctx.cur().stack_empty();
            ctx.emit(Stmt::Label(brk));
            Ok(())
        }
        StmtKind::For {
            init,
            cond,
            update,
            body,
        } => {
            let name = ctx.pending_label.take();
            if let Some(init) = init {
                emit_stmt(ctx, init);
            }
            let top = ctx.mk_label("top");
            let cont = ctx.mk_label("cont");
            let brk = ctx.mk_label("brk");
            ctx.emit(Stmt::Label(top.clone()));
            if let Some(cond) = cond {
                let c = condition(ctx, cond)?;
                ctx.emit(Stmt::Jmp {
                    label: brk.clone(),
                    mode: JmpMode::IfZero,
                    value: Some(c),
                });
                ctx.cur().stack_empty();
            }
            loop_body(ctx, name, &brk, &cont, body);
            ctx.emit(Stmt::Label(cont));
            if let Some(update) = update {
                lower_expr_stmt(ctx, update)?;
            }
            ctx.emit(Stmt::Jmp {
                label: top,
                mode: JmpMode::Always,
                value: None,
            });
            ctx.emit(Stmt::Label(brk));
            Ok(())
        }
        StmtKind::Break(label) => {
            let target = jump_target(ctx, label.as_deref(), false)?;
            ctx.emit(Stmt::Jmp {
                label: target,
                mode: JmpMode::Always,
                value: None,
            });
            Ok(())
        }
        StmtKind::Continue(label) => {
            let target = jump_target(ctx, label.as_deref(), true)?;
            ctx.emit(Stmt::Jmp {
                label: target,
                mode: JmpMode::Always,
                value: None,
            });
            Ok(())
        }
        StmtKind::Labeled { label, body } => {
            if is_loop(body) {
                ctx.pending_label = Some(label.clone());
                emit_stmt(ctx, body);
                ctx.pending_label = None;
            } else {
                let brk = ctx.mk_label("brk");
                ctx.loops.push(LoopLabels {
                    name: Some(label.clone()),
                    brk: brk.clone(),
                    cont: None,
                });
                emit_stmt(ctx, body);
                ctx.loops.pop();
                ctx.emit(Stmt::Label(brk));
            }
            Ok(())
        }
        StmtKind::Return(value) => lower_return(ctx, value.as_ref()),
        StmtKind::Function(id) => func::emit_function_decl(ctx, *id),
        StmtKind::Class(id) => ctx.class_info(*id).map(|_| ()),
        StmtKind::TypeOnly | StmtKind::Empty => Ok(()),
        StmtKind::Unsupported(kind) => Err(CodegenError::UnsupportedSyntax(kind.clone())),
    }
}

fn is_loop(stmt: &AstStmt) -> bool {
    matches!(
        stmt.kind,
        StmtKind::While { .. } | StmtKind::DoWhile { .. } | StmtKind::For { .. }
    )
}

fn loop_body(ctx: &mut CompileContext, name: Option<String>, brk: &str, cont: &str, body: &AstStmt) {
    ctx.loops.push(LoopLabels {
        name,
        brk: brk.to_string(),
        cont: Some(cont.to_string()),
    });
    emit_stmt(ctx, body);
    ctx.loops.pop();
}

fn jump_target(ctx: &CompileContext, label: Option<&str>, is_continue: bool) -> CodegenResult<String> {
    let keyword = if is_continue { "continue" } else { "break" };
    let target = ctx.loops.iter().rev().find(|l| match label {
        Some(name) => l.name.as_deref() == Some(name),
        None => l.cont.is_some(),
    });
    let Some(target) = target else {
        return Err(CodegenError::UnsupportedSyntax(match label {
            Some(name) => format!("{keyword} to unknown label {name}"),
            None => format!("{keyword} outside of a loop"),
        }));
    };
    if is_continue {
        target.cont.clone().ok_or_else(|| {
            CodegenError::UnsupportedSyntax(format!(
                "continue to {}, which is not a loop",
                label.unwrap_or_default()
            ))
        })
    } else {
        Ok(target.brk.clone())
    }
}

/// A branch condition; only value types can be tested.
fn condition(ctx: &mut CompileContext, cond: &kindc_types::ast::Expr) -> CodegenResult<Expr> {
    if is_ref_type(&cond.ty)? {
        return Err(CodegenError::UnsupportedType(format!(
            "condition of type {}",
            cond.ty
        )));
    }
    expr::lower_expr(ctx, cond)
}

fn lower_var(
    ctx: &mut CompileContext,
    decl: kindc_types::ast::DeclId,
    init: Option<&kindc_types::ast::Expr>,
) -> CodegenResult<()> {
    let program = ctx.program;
    let d = program.decl(decl);
    if d.is_global_var() && init.is_none() && !ctx.usage.is_used(program, decl) {
        return Ok(());
    }
    if d.ty.is_void() {
        return Err(CodegenError::UnsupportedType(format!(
            "variable {} of type void",
            d.name
        )));
    }
    check_type(&d.ty)?;

    let cell = ctx.lookup_cell(decl)?;
    let c = ctx.bin.cell(cell).clone();
    if c.boxed {
        // Every execution of the declaration gets a fresh box.
        ctx.emit_expr(Expr::Decr(Box::new(Expr::CellRef(cell))));
        ctx.emit_expr(c.store_direct(Expr::rtcall(
            format!("{MKLOC}{}", c.ref_suffix()),
            vec![],
        )));
        ctx.cur().stack_empty();
    }
    if let Some(init) = init {
        let value = expr::lower_expr(ctx, init)?;
        let store = ctx.store_by_ref(cell, value);
        ctx.emit_expr(store);
        ctx.cur().stack_empty();
    }
    Ok(())
}

fn lower_expr_stmt(ctx: &mut CompileContext, e: &kindc_types::ast::Expr) -> CodegenResult<()> {
    use kindc_types::ast::ExprKind;

    let e = e.unwrapped();
    let lowered = match &e.kind {
        ExprKind::Assign { target, value } => expr::lower_assign(ctx, target, value, false)?,
        ExprKind::Unary { op, operand } if op.is_update() => {
            expr::lower_update(ctx, *op, operand, false)?
        }
        _ => {
            let value = expr::lower_expr(ctx, e)?;
            ctx.release(value, &e.ty)?
        }
    };
    ctx.emit_expr(lowered);
    ctx.cur().stack_empty();
    Ok(())
}

fn lower_return(ctx: &mut CompileContext, value: Option<&kindc_types::ast::Expr>) -> CodegenResult<()> {
    let ret = ctx.cur().ret_label();
    let has_return = ctx.cur().has_return;
    let carried = match value {
        Some(e) if has_return => Some(expr::lower_expr(ctx, e)?),
        Some(e) => {
            // `return f();` in a void function
            let v = expr::lower_expr(ctx, e)?;
            let v = ctx.release(v, &e.ty)?;
            ctx.emit_expr(v);
            None
        }
        None if has_return => Some(Expr::num(0)),
        None => None,
    };
    ctx.emit(Stmt::Jmp {
        label: ret,
        mode: JmpMode::Always,
        value: carried,
    });
    ctx.cur().stack_empty();
    Ok(())
}
