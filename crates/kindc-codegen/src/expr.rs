//! Expression lowering.
//!
//! Every lowering function returns an IR expression yielding an owned value.
//! Side effects that have to happen before the value is consumed (stores of
//! assignments, closure construction, short-circuit jumps) are emitted as
//! statements into the current procedure.

use kindc_types::ast::{BinOp, DeclId, DeclKind, Expr as AstExpr, ExprKind, UnaryOp};

use crate::call;
use crate::compiler::CompileContext;
use crate::error::{CodegenError, CodegenResult};
use crate::func;
use crate::ir::{proc_label, Expr, JmpMode, Stmt};
use crate::runtime::{
    binop_primitive, NativeKind, BOOLEAN_NOT, BOOLEAN_TO_STRING, COLLECTION_ADD, COLLECTION_AT,
    COLLECTION_MK, NUMBER_ADD, NUMBER_SUBTRACT, NUMBER_TO_STRING, STRING_AT, STRING_CONCAT,
};
use crate::types::{collection_flag, is_ref_type, TypeClass, MAX_LAMBDA_ARGS};
use crate::usage::is_on_demand;

pub fn lower_expr(ctx: &mut CompileContext, e: &AstExpr) -> CodegenResult<Expr> {
    match &e.kind {
        // ── Literals ──
        ExprKind::Number(n) => Ok(Expr::num(*n)),
        ExprKind::Bool(b) => Ok(Expr::num(i32::from(*b))),
        ExprKind::Null => Ok(Expr::num(0)),
        ExprKind::Str(s) => {
            let label = ctx.bin.literals.string(s);
            let info = serde_json::to_string(s)
                .map_err(|err| CodegenError::InternalInvariant(err.to_string()))?;
            Ok(Expr::PointerLiteral { label, info })
        }
        ExprKind::Array(items) => lower_array(ctx, e, items),

        // ── References ──
        ExprKind::Ident(id) | ExprKind::This(id) => lower_ident(ctx, *id),
        ExprKind::Property { object, decl } => lower_property(ctx, object, *decl),
        ExprKind::Index { object, index } => {
            let name = if object.ty.is_string() {
                STRING_AT
            } else if object.ty.array_element().is_some() {
                COLLECTION_AT
            } else {
                return Err(CodegenError::UnsupportedType(format!(
                    "indexing a value of type {}",
                    object.ty
                )));
            };
            let args = lower_args_in_order(ctx, &[object, index])?;
            Ok(ctx.rtcall_mask(name, 1, false, args))
        }

        // ── Calls ──
        ExprKind::Call { callee, args } => call::lower_call(ctx, e, callee, args),
        ExprKind::New { class, args } => call::lower_new(ctx, *class, args),

        // ── Operators ──
        ExprKind::Binary { op, left, right } => lower_binary(ctx, *op, left, right),
        ExprKind::Unary { op, operand } => lower_unary(ctx, *op, operand),
        ExprKind::Assign { target, value } => lower_assign(ctx, target, value, true),

        ExprKind::Function(id) => func::emit_function_expr(ctx, *id),
        ExprKind::Paren(inner) | ExprKind::Cast(inner) => lower_expr(ctx, inner),
        ExprKind::Unsupported(kind) => Err(CodegenError::UnsupportedSyntax(kind.clone())),
    }
}

/// Lower operands left to right.
///
/// When lowering a later operand emits statements, the earlier operands are
/// evaluated into shared temporaries in front of those statements, so they
/// observe the state before them.
pub fn lower_args_in_order(ctx: &mut CompileContext, exprs: &[&AstExpr]) -> CodegenResult<Vec<Expr>> {
    let mut out: Vec<Expr> = Vec::with_capacity(exprs.len());
    for e in exprs {
        let before = ctx.cur().body.len();
        let value = lower_expr(ctx, e)?;
        if ctx.cur().body.len() > before && out.iter().any(|v| !v.is_literal()) {
            let emitted = ctx.cur().body.split_off(before);
            for prev in out.iter_mut().filter(|v| !v.is_literal()) {
                let shared = ctx.shared(std::mem::replace(prev, Expr::num(0)));
                ctx.emit_expr(shared.clone());
                *prev = shared;
            }
            ctx.cur().body.extend(emitted);
        }
        out.push(value);
    }
    Ok(out)
}

// ══════════════════════════════════════════════════════════════════════════════
// References
// ══════════════════════════════════════════════════════════════════════════════

fn lower_ident(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<Expr> {
    let program = ctx.program;
    let d = program.decl(id);
    match &d.kind {
        DeclKind::EnumMember { .. } => lower_enum(ctx, id),
        DeclKind::Function(_) => function_value(ctx, id),
        _ if d.is_variable_like() => {
            if d.is_global_var() {
                ctx.use_decl(id)?;
            }
            ctx.note_use(id, false)?;
            let cell = ctx.lookup_cell(id)?;
            Ok(ctx.bin.cell(cell).load())
        }
        _ => Err(CodegenError::UnsupportedSyntax(format!(
            "reference to {} {}",
            d.kind_name(),
            d.name
        ))),
    }
}

/// A named function used as a value.
fn function_value(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<Expr> {
    let program = ctx.program;
    let d = program.decl(id);
    let Some(f) = program.function(id) else {
        return Err(CodegenError::InternalInvariant(format!("{} is not a function", d.name)));
    };
    if f.body.is_none() {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "native function {} used as a value",
            d.name
        )));
    }
    if f.is_member() {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "method {} used as a value",
            d.name
        )));
    }

    if !ctx.usage.captures(id).is_empty() {
        if ctx.current_fn() == Some(id) {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "closure {} refers to itself",
                d.name
            )));
        }
        ctx.note_use(id, false)?;
        let cell = ctx.lookup_cell(id)?;
        return Ok(ctx.bin.cell(cell).load());
    }

    let arity = f.params.len();
    if arity > MAX_LAMBDA_ARGS {
        return Err(CodegenError::UnsupportedSyntax(format!(
            "{} takes {arity} parameters; function values take at most {MAX_LAMBDA_ARGS}",
            d.name
        )));
    }
    ctx.use_decl(id)?;
    if is_on_demand(program, id) {
        ctx.usage.request_compile(id);
    }
    Ok(Expr::PointerLiteral {
        label: format!("{}_Lit", proc_label(&d.name, id)),
        info: d.name.clone(),
    })
}

/// Value of an enum member: its literal, or the runtime enum it names.
pub fn lower_enum(ctx: &mut CompileContext, id: DeclId) -> CodegenResult<Expr> {
    let d = ctx.program.decl(id);
    if let DeclKind::EnumMember { value: Some(v) } = d.kind {
        return Ok(Expr::num(v));
    }
    let name = d.attrs.enum_val.as_deref().ok_or_else(|| {
        CodegenError::UnresolvedNative(format!("enum member {} has no value", d.name))
    })?;
    let desc = ctx.natives.lookup(name)?;
    match desc.kind {
        NativeKind::EnumValue => Ok(Expr::num(desc.value as i32)),
        NativeKind::Function if desc.arity == 0 => Ok(Expr::rtcall(name, vec![])),
        _ => Err(CodegenError::UnresolvedNative(format!(
            "{name} is not an enum value"
        ))),
    }
}

fn lower_property(ctx: &mut CompileContext, object: &AstExpr, decl: DeclId) -> CodegenResult<Expr> {
    let program = ctx.program;
    let d = program.decl(decl);
    match &d.kind {
        DeclKind::EnumMember { .. } => lower_enum(ctx, decl),
        DeclKind::Property => {
            let shim = d.attrs.shim.as_deref().ok_or_else(|| {
                CodegenError::UnresolvedNative(format!("property {} has no implementation", d.name))
            })?;
            ctx.natives.check_call(shim, true, 1)?;
            let mask = u8::from(is_ref_type(&object.ty)?);
            let obj = lower_expr(ctx, object)?;
            Ok(ctx.rtcall_mask(shim, mask, d.attrs.is_async, vec![obj]))
        }
        DeclKind::Field { .. } => {
            let (index, is_ref) = ctx.field_slot(decl)?;
            let base = lower_expr(ctx, object)?;
            Ok(Expr::FieldAccess {
                base: Box::new(base),
                index,
                is_ref,
            })
        }
        _ => Err(CodegenError::UnsupportedSyntax(format!(
            "property access to {} {}",
            d.kind_name(),
            d.name
        ))),
    }
}

fn lower_array(ctx: &mut CompileContext, e: &AstExpr, items: &[AstExpr]) -> CodegenResult<Expr> {
    let elt = e
        .ty
        .array_element()
        .ok_or_else(|| CodegenError::UnsupportedType(format!("array literal of type {}", e.ty)))?;
    let flag = collection_flag(elt)?;
    let mask = if is_ref_type(elt)? { 0b10 } else { 0 };

    let coll = ctx.shared(Expr::rtcall(COLLECTION_MK, vec![Expr::num(flag)]));
    ctx.emit_expr(coll.clone());
    for item in items {
        let value = lower_expr(ctx, item)?;
        let add = ctx.rtcall_mask(COLLECTION_ADD, mask, false, vec![coll.clone(), value]);
        ctx.emit_expr(add);
    }
    Ok(coll)
}

// ══════════════════════════════════════════════════════════════════════════════
// Operators
// ══════════════════════════════════════════════════════════════════════════════

fn ref_mask(operands: &[&AstExpr]) -> CodegenResult<u8> {
    let mut mask = 0;
    for (i, e) in operands.iter().enumerate() {
        if is_ref_type(&e.ty)? {
            mask |= 1 << i;
        }
    }
    Ok(mask)
}

fn lower_binary(ctx: &mut CompileContext, op: BinOp, left: &AstExpr, right: &AstExpr) -> CodegenResult<Expr> {
    match op {
        BinOp::And | BinOp::Or => return lower_lazy(ctx, op, left, right),
        BinOp::Add if left.ty.is_string() || right.ty.is_string() => {
            return lower_concat(ctx, left, right)
        }
        _ => {}
    }
    let name = binop_primitive(op, TypeClass::of(&left.ty)?, TypeClass::of(&right.ty)?).ok_or_else(
        || {
            CodegenError::UnsupportedType(format!(
                "operator {} on {} and {}",
                op.as_str(),
                left.ty,
                right.ty
            ))
        },
    )?;
    let mask = ref_mask(&[left, right])?;
    let args = lower_args_in_order(ctx, &[left, right])?;
    Ok(ctx.rtcall_mask(name, mask, false, args))
}

fn lower_concat(ctx: &mut CompileContext, left: &AstExpr, right: &AstExpr) -> CodegenResult<Expr> {
    let mut args = lower_args_in_order(ctx, &[left, right])?;
    for (arg, side) in args.iter_mut().zip([left, right]) {
        if side.ty.is_string() {
            continue;
        }
        let convert = match TypeClass::of(&side.ty)? {
            TypeClass::Number => NUMBER_TO_STRING,
            TypeClass::Boolean => BOOLEAN_TO_STRING,
            _ => {
                return Err(CodegenError::UnsupportedType(format!(
                    "cannot add {} to a string",
                    side.ty
                )))
            }
        };
        let value = std::mem::replace(arg, Expr::num(0));
        *arg = Expr::rtcall(convert, vec![value]);
    }
    Ok(ctx.rtcall_mask(STRING_CONCAT, 0b11, false, args))
}

/// `&&` and `||`: the left value short-circuits straight to the join label.
fn lower_lazy(ctx: &mut CompileContext, op: BinOp, left: &AstExpr, right: &AstExpr) -> CodegenResult<Expr> {
    for side in [left, right] {
        if is_ref_type(&side.ty)? {
            return Err(CodegenError::UnsupportedType(format!(
                "operator {} on {}",
                op.as_str(),
                side.ty
            )));
        }
    }
    let join = ctx.mk_label("lazy");
    let l = lower_expr(ctx, left)?;
    let mode = if op == BinOp::And {
        JmpMode::IfZero
    } else {
        JmpMode::IfNotZero
    };
    ctx.emit(Stmt::Jmp {
        label: join.clone(),
        mode,
        value: Some(l),
    });
    let r = lower_expr(ctx, right)?;
    ctx.emit(Stmt::Jmp {
        label: join.clone(),
        mode: JmpMode::Always,
        value: Some(r),
    });
    ctx.emit(Stmt::Label(join));
    let value = ctx.shared(Expr::JmpValue);
    ctx.emit_expr(value.clone());
    Ok(value)
}

fn lower_unary(ctx: &mut CompileContext, op: UnaryOp, operand: &AstExpr) -> CodegenResult<Expr> {
    match op {
        UnaryOp::Not => {
            let v = lower_expr(ctx, operand)?;
            Ok(Expr::rtcall(BOOLEAN_NOT, vec![v]))
        }
        UnaryOp::Neg => {
            if let ExprKind::Number(n) = operand.unwrapped().kind {
                return Ok(Expr::num(n.wrapping_neg()));
            }
            let v = lower_expr(ctx, operand)?;
            Ok(Expr::rtcall(NUMBER_SUBTRACT, vec![Expr::num(0), v]))
        }
        UnaryOp::Plus => lower_expr(ctx, operand),
        UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
            lower_update(ctx, op, operand, true)
        }
    }
}

/// `++`/`--` on a variable. Without `want_value` the result is the store
/// itself, to be emitted as a statement.
pub fn lower_update(
    ctx: &mut CompileContext,
    op: UnaryOp,
    operand: &AstExpr,
    want_value: bool,
) -> CodegenResult<Expr> {
    let target = operand.unwrapped();
    let id = match target.kind {
        ExprKind::Ident(id) if ctx.program.decl(id).is_variable_like() => id,
        _ => {
            return Err(CodegenError::UnsupportedSyntax(format!(
                "{} of {}",
                if matches!(op, UnaryOp::PreInc | UnaryOp::PostInc) {
                    "increment"
                } else {
                    "decrement"
                },
                target.kind.name()
            )))
        }
    };
    if ctx.program.decl(id).is_global_var() {
        ctx.use_decl(id)?;
    }
    ctx.note_use(id, true)?;
    let cell = ctx.lookup_cell(id)?;
    let load = ctx.bin.cell(cell).load();
    let name = match op {
        UnaryOp::PreInc | UnaryOp::PostInc => NUMBER_ADD,
        _ => NUMBER_SUBTRACT,
    };

    if !want_value {
        let next = Expr::rtcall(name, vec![load, Expr::num(1)]);
        return Ok(ctx.store_by_ref(cell, next));
    }
    let prev = ctx.shared(load);
    let next = ctx.shared(Expr::rtcall(name, vec![prev.clone(), Expr::num(1)]));
    let store = ctx.store_by_ref(cell, next.clone());
    ctx.emit_expr(store);
    Ok(match op {
        UnaryOp::PostInc | UnaryOp::PostDec => prev,
        _ => next,
    })
}

/// Assignment. Without `want_value` the result is the store itself, to be
/// emitted as a statement; otherwise the store is emitted and the assigned
/// value returned.
pub fn lower_assign(
    ctx: &mut CompileContext,
    target: &AstExpr,
    value: &AstExpr,
    want_value: bool,
) -> CodegenResult<Expr> {
    let program = ctx.program;
    let target = target.unwrapped();
    let value_is_ref = is_ref_type(&value.ty)?;
    match &target.kind {
        ExprKind::Ident(id) if program.decl(*id).is_variable_like() => {
            let v = lower_expr(ctx, value)?;
            if program.decl(*id).is_global_var() {
                ctx.use_decl(*id)?;
            }
            ctx.note_use(*id, true)?;
            let cell = ctx.lookup_cell(*id)?;
            if !want_value {
                return Ok(ctx.store_by_ref(cell, v));
            }
            let v = ctx.shared(v);
            let stored = if value_is_ref {
                Expr::Incr(Box::new(v.clone()))
            } else {
                v.clone()
            };
            let store = ctx.store_by_ref(cell, stored);
            ctx.emit_expr(store);
            Ok(v)
        }
        ExprKind::Property { object, decl } => {
            let (index, is_ref) = ctx.field_slot(*decl)?;
            let mut args = lower_args_in_order(ctx, &[object, value])?;
            let (Some(v), Some(base)) = (args.pop(), args.pop()) else {
                return Err(CodegenError::InternalInvariant("lost assignment operands".into()));
            };
            let field = Box::new(Expr::FieldAccess {
                base: Box::new(base),
                index,
                is_ref,
            });
            if !want_value {
                return Ok(Expr::Store {
                    target: field,
                    value: Box::new(v),
                });
            }
            let v = ctx.shared(v);
            let stored = if value_is_ref {
                Expr::Incr(Box::new(v.clone()))
            } else {
                v.clone()
            };
            ctx.emit_expr(Expr::Store {
                target: field,
                value: Box::new(stored),
            });
            Ok(v)
        }
        other => Err(CodegenError::UnsupportedSyntax(format!(
            "assignment to {}",
            other.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ProcKind, Procedure};
    use crate::runtime::{NativeDescriptor, NativeTable};
    use kindc_types::ast::{Program, Type};
    use kindc_types::ProgramBuilder;

    fn context<'a>(program: &'a Program, natives: &'a NativeTable) -> CompileContext<'a> {
        let mut ctx = CompileContext::new(program, natives, "main.ts");
        let root = Procedure::new(0, None, ProcKind::Root, "<main>", false, program.span);
        ctx.proc = ctx.bin.add_proc(root);
        ctx
    }

    fn call_name(e: &Expr) -> Option<&str> {
        match e {
            Expr::RuntimeCall(c) => Some(&c.name),
            Expr::Shared(s) => call_name(&s.inner),
            Expr::Sequence(items) => items.first().and_then(call_name),
            _ => None,
        }
    }

    #[test]
    fn identical_strings_share_a_literal() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let a = lower_expr(&mut ctx, &AstExpr::string("hi")).unwrap();
        let b = lower_expr(&mut ctx, &AstExpr::string("hi")).unwrap();
        let c = lower_expr(&mut ctx, &AstExpr::string("there")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.bin.literals.len(), 2);
        assert!(matches!(a, Expr::PointerLiteral { ref info, .. } if info == "\"hi\""));
    }

    #[test]
    fn string_plus_number_converts_the_number() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let e = AstExpr::binary(BinOp::Add, AstExpr::string("n = "), AstExpr::number(4));
        let lowered = lower_expr(&mut ctx, &e).unwrap();
        assert_eq!(call_name(&lowered), Some(STRING_CONCAT));
        let text = lowered.to_string();
        assert!(text.contains("number::to_string(4)"), "{text}");
        // Both operands are released after the call.
        assert_eq!(text.matches("DECR").count(), 2);
    }

    #[test]
    fn mismatched_operands_are_type_faults() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let e = AstExpr::binary(BinOp::Sub, AstExpr::string("a"), AstExpr::number(1));
        assert!(matches!(
            lower_expr(&mut ctx, &e),
            Err(CodegenError::UnsupportedType(_))
        ));
    }

    #[test]
    fn short_circuit_joins_at_a_label() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let e = AstExpr::binary(BinOp::And, AstExpr::boolean(true), AstExpr::boolean(false));
        let v = lower_expr(&mut ctx, &e).unwrap();
        assert!(v.as_shared().is_some());
        let body = &ctx.bin.proc(0).body;
        assert!(matches!(
            &body[0],
            Stmt::Jmp { mode: JmpMode::IfZero, value: Some(Expr::NumberLiteral(1)), .. }
        ));
        assert!(matches!(&body[2], Stmt::Label(l) if l.starts_with(".lazy_")));
    }

    #[test]
    fn enum_members_resolve_through_natives() {
        let mut b = ProgramBuilder::new();
        let literal = b.enum_member("Dir", "Up", Some(2));
        let native = b.enum_member("Button", "A", None);
        b.attrs_mut(native).enum_val = Some("Button::A".into());
        let missing = b.enum_member("Button", "B", None);
        b.attrs_mut(missing).enum_val = Some("Button::B".into());
        let program = b.finish(vec![]);

        let mut natives = NativeTable::new();
        natives.insert_enum("Button::A", 1);
        natives.insert(NativeDescriptor {
            name: "Button::B".into(),
            kind: NativeKind::Procedure,
            arity: 0,
            value: 0x3_0001,
        });
        let mut ctx = context(&program, &natives);

        assert_eq!(lower_enum(&mut ctx, literal), Ok(Expr::num(2)));
        assert_eq!(lower_enum(&mut ctx, native), Ok(Expr::num(1)));
        assert!(matches!(
            lower_enum(&mut ctx, missing),
            Err(CodegenError::UnresolvedNative(_))
        ));
    }

    #[test]
    fn postfix_increment_yields_the_old_value() {
        let mut b = ProgramBuilder::new();
        let i = b.var("i", Type::Number);
        let e = AstExpr::unary(UnaryOp::PostInc, b.ident(i));
        let program = b.finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let v = lower_expr(&mut ctx, &e).unwrap();
        let stored = ctx.bin.proc(0).body[0].to_string();
        assert!(stored.contains("number::add"), "{stored}");
        // The yielded value is the load that feeds the addition.
        let prev = v.as_shared().expect("shared");
        assert!(matches!(prev.inner, Expr::CellRef(_)));
    }

    #[test]
    fn later_statements_force_earlier_operands_first() {
        let mut b = ProgramBuilder::new();
        let x = b.var("x", Type::Number);
        // x + (x = 5): the left operand must be read before the store.
        let e = AstExpr::binary(
            BinOp::Add,
            b.ident(x),
            AstExpr::paren(AstExpr::assign(b.ident(x), AstExpr::number(5))),
        );
        let program = b.finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let v = lower_expr(&mut ctx, &e).unwrap();
        let body = &ctx.bin.proc(0).body;
        assert_eq!(body.len(), 2);
        let Stmt::Expr(first) = &body[0] else {
            panic!("expected the saved operand first");
        };
        assert!(matches!(first.as_shared().map(|s| &s.inner), Some(Expr::CellRef(_))));
        assert!(matches!(&body[1], Stmt::Expr(Expr::Store { .. })));
        assert_eq!(call_name(&v), Some("number::add"));
    }

    #[test]
    fn arrays_of_strings_use_the_string_flag() {
        let program = ProgramBuilder::new().finish(vec![]);
        let natives = NativeTable::new();
        let mut ctx = context(&program, &natives);

        let e = AstExpr::array(Type::String, vec![AstExpr::string("a"), AstExpr::string("b")]);
        let coll = lower_expr(&mut ctx, &e).unwrap();
        assert_eq!(coll.to_string().matches("collection::mk(3)").count(), 1);
        let adds = ctx
            .bin
            .proc(0)
            .body
            .iter()
            .filter(|s| s.to_string().contains(COLLECTION_ADD))
            .count();
        assert_eq!(adds, 2);
    }
}
