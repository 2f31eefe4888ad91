//! Calls and object construction.
//!
//! A callee is classified into exactly one of:
//!
//! - a native primitive (`//% shim=`), called with a reference mask;
//! - a user function without captures, called directly;
//! - a closure value, run through `action::run{n}`;
//! - a method or constructor, called directly with the receiver as
//!   argument 0 (a `helper` attribute redirects to a library function).

use kindc_types::ast::{Decl, DeclId, DeclKind, Expr as AstExpr, ExprKind, FunctionDecl};

use crate::compiler::CompileContext;
use crate::error::{CodegenError, CodegenResult};
use crate::expr::{lower_args_in_order, lower_expr};
use crate::ir::Expr;
use crate::runtime::{ACTION_RUN, RECORD_MK, SHIM_ID, SHIM_NOOP};
use crate::types::is_ref_type;
use crate::usage::is_on_demand;

/// Namespace searched for `helper=` redirections.
const HELPERS_NAMESPACE: &str = "helpers";

pub fn lower_call(
    ctx: &mut CompileContext,
    call: &AstExpr,
    callee: &AstExpr,
    args: &[AstExpr],
) -> CodegenResult<Expr> {
    let program = ctx.program;
    let callee = callee.unwrapped();
    let (id, receiver) = match &callee.kind {
        ExprKind::Ident(id) => (*id, None),
        ExprKind::Property { object, decl } => (*decl, Some(&**object)),
        _ => return closure_call(ctx, call, callee, args),
    };
    let d = program.decl(id);
    let f = match &d.kind {
        DeclKind::Function(f) => f,
        DeclKind::Field { .. } => return closure_call(ctx, call, callee, args),
        _ if d.is_variable_like() => return closure_call(ctx, call, callee, args),
        _ => {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "call of {} {}",
                d.kind_name(),
                d.name
            )))
        }
    };
    // Namespace-qualified calls of plain functions carry no receiver.
    let receiver = if f.is_member() { receiver } else { None };

    if d.attrs.shim.is_some() {
        return native_call(ctx, d, f, receiver, args);
    }
    if let Some(helper) = &d.attrs.helper {
        let target = program
            .find_in_namespace(HELPERS_NAMESPACE, helper)
            .ok_or_else(|| CodegenError::UnresolvedNative(format!("helper {helper} not found")))?;
        let td = program.decl(target);
        let tf = program.function(target).ok_or_else(|| {
            CodegenError::UnresolvedNative(format!("helper {helper} is not a function"))
        })?;
        // The receiver becomes the helper's first parameter.
        let mut explicit: Vec<&AstExpr> = receiver.into_iter().collect();
        explicit.extend(args);
        if td.attrs.shim.is_some() {
            return native_call_with(ctx, td, &tf.params, explicit, 0);
        }
        return direct_call(ctx, target, tf, explicit, 0);
    }
    if f.is_member() {
        let Some(recv) = receiver else {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "method {} called without a receiver",
                d.name
            )));
        };
        let mut explicit = vec![recv];
        explicit.extend(args);
        return direct_call(ctx, id, f, explicit, 1);
    }
    if f.body.is_none() {
        return Err(CodegenError::UnresolvedNative(format!(
            "{} has neither a body nor a shim",
            d.name
        )));
    }
    if !ctx.usage.captures(id).is_empty() {
        return closure_call(ctx, call, callee, args);
    }
    direct_call(ctx, id, f, args.iter().collect(), 0)
}

fn direct_call(
    ctx: &mut CompileContext,
    id: DeclId,
    f: &FunctionDecl,
    explicit: Vec<&AstExpr>,
    implicit: usize,
) -> CodegenResult<Expr> {
    let program = ctx.program;
    let d = program.decl(id);
    if !ctx.usage.captures(id).is_empty() {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "{} captures local variables and cannot be called here",
            d.name
        )));
    }
    ctx.use_decl(id)?;
    if is_on_demand(program, id) {
        ctx.usage.request_compile(id);
    }
    let (args, _) = lower_call_args(ctx, d, &f.params, explicit, implicit)?;
    Ok(Expr::ProcCall { callee: id, args })
}

fn native_call(
    ctx: &mut CompileContext,
    d: &Decl,
    f: &FunctionDecl,
    receiver: Option<&AstExpr>,
    args: &[AstExpr],
) -> CodegenResult<Expr> {
    let implicit = usize::from(receiver.is_some());
    let mut explicit: Vec<&AstExpr> = receiver.into_iter().collect();
    explicit.extend(args);
    native_call_with(ctx, d, &f.params, explicit, implicit)
}

/// Call a shim. `explicit` includes the receiver, if any, as its first
/// `implicit` entries.
fn native_call_with(
    ctx: &mut CompileContext,
    d: &Decl,
    params: &[DeclId],
    explicit: Vec<&AstExpr>,
    implicit: usize,
) -> CodegenResult<Expr> {
    let shim = d.attrs.shim.as_deref().unwrap_or_default();
    match shim {
        SHIM_NOOP => return Ok(Expr::Sequence(Vec::new())),
        SHIM_ID => {
            let [only] = explicit.as_slice() else {
                return Err(CodegenError::UnsupportedSyntax(format!(
                    "{} is an identity and takes exactly one argument",
                    d.name
                )));
            };
            return lower_expr(ctx, only);
        }
        _ => {}
    }
    let has_ret = match &d.ty {
        kindc_types::ast::Type::Function { ret, .. } => !ret.is_void(),
        _ => false,
    };
    ctx.natives
        .check_call(shim, has_ret, implicit + params.len())?;
    let (args, mask) = lower_call_args(ctx, d, params, explicit, implicit)?;
    Ok(ctx.rtcall_mask(shim, mask, d.attrs.is_async, args))
}

/// Run a function value through its action object.
fn closure_call(
    ctx: &mut CompileContext,
    call: &AstExpr,
    callee: &AstExpr,
    args: &[AstExpr],
) -> CodegenResult<Expr> {
    if args.len() > 1 {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "function values are called with at most one argument, got {}",
            args.len()
        )));
    }
    if !call.ty.is_void() {
        return Err(CodegenError::UnsupportedSyntax(
            "function values cannot return a value".into(),
        ));
    }
    let mut operands = vec![callee];
    operands.extend(args);
    let mut mask = 0b01;
    if let Some(arg) = args.first() {
        if is_ref_type(&arg.ty)? {
            mask |= 0b10;
        }
    }
    let lowered = lower_args_in_order(ctx, &operands)?;
    let name = format!("{ACTION_RUN}{}", args.len());
    Ok(ctx.rtcall_mask(&name, mask, true, lowered))
}

/// Lower call arguments, padding missing trailing parameters with their
/// literal defaults. Returns the arguments and the mask of reference
/// positions the caller must release.
///
/// The first `implicit` entries of `explicit` are receivers, not matched
/// against `params`.
fn lower_call_args(
    ctx: &mut CompileContext,
    callee: &Decl,
    params: &[DeclId],
    explicit: Vec<&AstExpr>,
    implicit: usize,
) -> CodegenResult<(Vec<Expr>, u8)> {
    let program = ctx.program;
    let given = explicit.len().saturating_sub(implicit);
    if given > params.len() {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "{} takes {} arguments, got {given}",
            callee.name,
            params.len()
        )));
    }

    // Image literals are encoded at compile time and never released.
    let image_at = callee.attrs.image_literal.then_some(implicit);
    let mut image = None;
    let mut lowered_from = Vec::with_capacity(explicit.len());
    for (pos, e) in explicit.iter().enumerate() {
        if Some(pos) == image_at {
            let ExprKind::Str(text) = &e.unwrapped().kind else {
                return Err(CodegenError::UnsupportedSyntax(format!(
                    "{} expects an image literal string",
                    callee.name
                )));
            };
            let label = ctx.bin.literals.image(text)?;
            image = Some(Expr::PointerLiteral {
                label,
                info: "image".into(),
            });
        } else {
            lowered_from.push(*e);
        }
    }

    let mut mask = 0u8;
    for (pos, e) in explicit.iter().enumerate() {
        if Some(pos) != image_at && pos < 8 && is_ref_type(&e.ty)? {
            mask |= 1 << pos;
        }
    }

    let mut args = lower_args_in_order(ctx, &lowered_from)?;
    if let (Some(pos), Some(img)) = (image_at, image) {
        args.insert(pos, img);
    }

    for &param in &params[given..] {
        let p = program.decl(param);
        let default = match &p.kind {
            DeclKind::Parameter { default, .. } => default.as_ref(),
            _ => None,
        };
        let value = match default.map(|e| &e.unwrapped().kind) {
            None | Some(ExprKind::Null) => Expr::num(0),
            Some(ExprKind::Number(n)) => Expr::num(*n),
            Some(ExprKind::Bool(b)) => Expr::num(i32::from(*b)),
            Some(_) => {
                return Err(CodegenError::InvalidDefaultArgument(format!(
                    "default value of {} in {} must be a number, boolean or null literal",
                    p.name, callee.name
                )))
            }
        };
        args.push(value);
    }
    Ok((args, mask))
}

/// `new C(args)`: allocate the record, then run the constructor on it.
pub fn lower_new(ctx: &mut CompileContext, class: DeclId, args: &[AstExpr]) -> CodegenResult<Expr> {
    let program = ctx.program;
    let info = ctx.class_info(class)?;
    let c = program
        .class(class)
        .ok_or_else(|| CodegenError::InternalInvariant(format!("{class} is not a class")))?;

    let record = Expr::rtcall(
        RECORD_MK,
        vec![
            Expr::num(info.ref_fields as i32),
            Expr::num(info.fields.len() as i32),
        ],
    );
    let Some(ctor) = c.constructor else {
        if !args.is_empty() {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "{} has no constructor but is created with arguments",
                program.decl(class).name
            )));
        }
        return Ok(record);
    };

    let f = program
        .function(ctor)
        .ok_or_else(|| CodegenError::InternalInvariant("constructor is not a function".into()))?;
    ctx.use_decl(ctor)?;
    ctx.usage.request_compile(ctor);
    let (mut lowered, _) = lower_call_args(ctx, program.decl(ctor), &f.params, args.iter().collect(), 0)?;

    let obj = ctx.shared(record);
    lowered.insert(0, Expr::Incr(Box::new(obj.clone())));
    ctx.emit_expr(Expr::ProcCall {
        callee: ctor,
        args: lowered,
    });
    Ok(obj)
}
