//! End-to-end tests: build a program, compile it, run the result on the
//! reference simulator.
//!
//! Tests validate:
//! - A captured, reassigned local is boxed and shared with its closure
//! - A read-only capture is copied, not boxed
//! - Direct calls pass arguments and return values without stack residue
//! - Reference counts balance after non-root procedures return
//! - Loops, short-circuit operators and field access compute the right values

use std::cell::RefCell;
use std::rc::Rc;

use kindc_codegen::ir::CellKind;
use kindc_codegen::{
    compile_program, Binary, CodegenOptions, NativeDescriptor, NativeKind, NativeTable, Simulator,
};
use kindc_types::ast::{BinOp, Expr, Program, Stmt, Type};
use kindc_types::ProgramBuilder;

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

const RUNTIME: &[&str] = &[
    "bitvm::incr",
    "bitvm::decr",
    "bitvm::mkloc",
    "bitvm::mklocRef",
    "bitvm::ldloc",
    "bitvm::ldlocRef",
    "bitvm::stloc",
    "bitvm::stlocRef",
    "bitvm::ldglb",
    "bitvm::ldglbRef",
    "bitvm::stglb",
    "bitvm::stglbRef",
    "bitvm::ldfld",
    "bitvm::ldfldRef",
    "bitvm::stfld",
    "bitvm::stfldRef",
    "bitvm::stclo",
    "action::mk",
    "action::run0",
    "action::run1",
    "record::mk",
    "collection::mk",
    "collection::add",
    "collection::at",
    "string::concat_op",
    "number::to_string",
    "number::add",
    "number::subtract",
    "number::multiply",
    "number::lt",
    "number::gt",
];

fn natives() -> NativeTable {
    let mut t = NativeTable::new();
    for (i, name) in RUNTIME.iter().enumerate() {
        t.insert(NativeDescriptor {
            name: name.to_string(),
            kind: NativeKind::Function,
            arity: 2,
            value: 0x3_0001 + 4 * i as u32,
        });
    }
    for (name, arity) in [("basic::showNumber", 1), ("basic::showString", 1)] {
        t.insert(NativeDescriptor {
            name: name.to_string(),
            kind: NativeKind::Procedure,
            arity,
            value: 0x3_8001,
        });
    }
    t
}

fn compile(program: &Program) -> Binary {
    compile_program(program, &natives(), &CodegenOptions::default()).unwrap_or_else(|errs| {
        panic!(
            "compile failed:\n{}",
            errs.iter()
                .map(|e| format!("  [{}] {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("\n")
        )
    })
}

fn cell_named<'a>(bin: &'a Binary, name: &str, kind: CellKind) -> &'a kindc_codegen::ir::Cell {
    bin.cells()
        .iter()
        .find(|c| c.name == name && c.kind == kind)
        .unwrap_or_else(|| panic!("no {kind:?} cell {name}"))
}

fn num(n: i32) -> Expr {
    Expr::number(n)
}

// ══════════════════════════════════════════════════════════════════════════════
// Closures
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn bump_shares_a_boxed_counter() {
    // let n = 0; function bump() { n = n + 1; } bump(); bump(); return n;
    let mut b = ProgramBuilder::new();
    let n = b.var("n", Type::Number);
    let bump = b.begin_function("bump", &[], Type::Void);
    let incr = Expr::assign(b.ident(n), Expr::binary(BinOp::Add, b.ident(n), num(1)));
    b.end_function(vec![Stmt::expr(incr)]);
    let body = vec![
        Stmt::var(n, Some(num(0))),
        Stmt::func(bump),
        Stmt::expr(b.call_decl(bump, vec![])),
        Stmt::expr(b.call_decl(bump, vec![])),
        Stmt::ret(Some(b.ident(n))),
    ];
    let program = b.finish(body);

    let bin = compile(&program);
    assert!(cell_named(&bin, "n", CellKind::Local).boxed);
    assert!(cell_named(&bin, "n", CellKind::Captured).boxed);

    let mut sim = Simulator::new(&bin);
    assert_eq!(sim.run(), Ok(2));
    // The root keeps the box and the closure alive.
    assert_eq!(sim.live_count(), 2);
}

#[test]
fn read_only_captures_are_copied() {
    // let k = 3; function show() { showNumber(k); } show();
    let mut b = ProgramBuilder::new();
    let show_number = b.native("showNumber", &[("v", Type::Number)], Type::Void, "basic::showNumber");
    let k = b.var("k", Type::Number);
    let show = b.begin_function("show", &[], Type::Void);
    let call = b.call_decl(show_number, vec![b.ident(k)]);
    b.end_function(vec![Stmt::expr(call)]);
    let body = vec![
        Stmt::var(k, Some(num(3))),
        Stmt::func(show),
        Stmt::expr(b.call_decl(show, vec![])),
    ];
    let program = b.finish(body);

    let bin = compile(&program);
    assert!(!cell_named(&bin, "k", CellKind::Local).boxed);
    assert!(!cell_named(&bin, "k", CellKind::Captured).boxed);

    let shown = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&shown);
    let mut sim = Simulator::new(&bin);
    sim.define("basic::showNumber", move |args| {
        sink.borrow_mut().push(args[0]);
        0
    });
    sim.run().unwrap();
    assert_eq!(*shown.borrow(), vec![3]);
}

// ══════════════════════════════════════════════════════════════════════════════
// Calls
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn identity_is_a_direct_call() {
    // function id(x) { return x; } return id(5);
    let mut b = ProgramBuilder::new();
    let id = b.begin_function("id", &[("x", Type::Number)], Type::Number);
    let x = b.param(id, 0);
    let ret = Stmt::ret(Some(b.ident(x)));
    b.end_function(vec![ret]);
    let body = vec![Stmt::ret(Some(b.call_decl(id, vec![num(5)])))];
    let program = b.finish(body);

    let bin = compile(&program);
    assert_eq!(bin.procs.len(), 2);
    let callee = &bin.procs[1];
    assert!(bin.procs[0].text.contains(&format!("bl {}", callee.label)));
    // One argument pushed, one slot dropped after the call.
    assert!(bin.procs[0].text.contains("add sp, #4*1 ; pop args"));

    let mut sim = Simulator::new(&bin);
    assert_eq!(sim.run(), Ok(5));
    assert_eq!(sim.live_count(), 0);
}

#[test]
fn strings_built_in_a_function_are_released() {
    // function f() { let s = "n=" + 5; showString(s); } f();
    let mut b = ProgramBuilder::new();
    let show = b.native("showString", &[("text", Type::String)], Type::Void, "basic::showString");
    let f = b.begin_function("f", &[], Type::Void);
    let s = b.var("s", Type::String);
    let init = Expr::binary(BinOp::Add, Expr::string("n="), num(5));
    let call = b.call_decl(show, vec![b.ident(s)]);
    b.end_function(vec![Stmt::var(s, Some(init)), Stmt::expr(call)]);
    let body = vec![Stmt::expr(b.call_decl(f, vec![]))];
    let program = b.finish(body);

    let bin = compile(&program);
    let seen = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&seen);
    let mut sim = Simulator::new(&bin);
    sim.define("basic::showString", move |args| {
        *sink.borrow_mut() = args[0];
        0
    });
    sim.run().unwrap();
    assert_ne!(*seen.borrow(), 0);
    assert_eq!(sim.live_count(), 0);
}

#[test]
fn records_are_released_with_their_fields() {
    // class Point { x: number; label: string }
    // function mk() { let p = new Point(); p.x = 4; p.label = "a" + "b"; return p.x; }
    // return mk();
    let mut b = ProgramBuilder::new();
    let point = b.class("Point");
    let x = b.field(point, "x", Type::Number);
    let label = b.field(point, "label", Type::String);
    let mk = b.begin_function("mk", &[], Type::Number);
    let p = b.var("p", Type::Class(point));
    let set_x = Expr::assign(b.property(b.ident(p), x), num(4));
    let set_label = Expr::assign(
        b.property(b.ident(p), label),
        Expr::binary(BinOp::Add, Expr::string("a"), Expr::string("b")),
    );
    let ret = Stmt::ret(Some(b.property(b.ident(p), x)));
    let init = Stmt::var(p, Some(b.new_object(point, vec![])));
    b.end_function(vec![
        init,
        Stmt::expr(set_x),
        Stmt::expr(set_label),
        ret,
    ]);
    let body = vec![Stmt::class(point), Stmt::ret(Some(b.call_decl(mk, vec![])))];
    let program = b.finish(body);

    let bin = compile(&program);
    let mut sim = Simulator::new(&bin);
    assert_eq!(sim.run(), Ok(4));
    assert_eq!(sim.live_count(), 0);
}

// ══════════════════════════════════════════════════════════════════════════════
// Control flow
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn while_loop_sums() {
    // let i = 0; let sum = 0; while (i < 4) { sum = sum + i; i = i + 1; } return sum;
    let mut b = ProgramBuilder::new();
    let i = b.var("i", Type::Number);
    let sum = b.var("sum", Type::Number);
    let step = Stmt::block(vec![
        Stmt::expr(Expr::assign(
            b.ident(sum),
            Expr::binary(BinOp::Add, b.ident(sum), b.ident(i)),
        )),
        Stmt::expr(Expr::assign(
            b.ident(i),
            Expr::binary(BinOp::Add, b.ident(i), num(1)),
        )),
    ]);
    let body = vec![
        Stmt::var(i, Some(num(0))),
        Stmt::var(sum, Some(num(0))),
        Stmt::while_loop(Expr::binary(BinOp::Lt, b.ident(i), num(4)), step),
        Stmt::ret(Some(b.ident(sum))),
    ];
    let program = b.finish(body);

    let bin = compile(&program);
    assert_eq!(Simulator::new(&bin).run(), Ok(6));
}

#[test]
fn short_circuit_values() {
    let and = Expr::binary(
        BinOp::And,
        Expr::binary(BinOp::Lt, num(1), num(2)),
        Expr::binary(BinOp::Gt, num(5), num(4)),
    );
    let program = ProgramBuilder::new().finish(vec![Stmt::ret(Some(and))]);
    let bin = compile(&program);
    assert_eq!(Simulator::new(&bin).run(), Ok(1));

    let or = Expr::binary(
        BinOp::Or,
        Expr::binary(BinOp::Gt, num(1), num(2)),
        Expr::binary(BinOp::Lt, num(5), num(4)),
    );
    let program = ProgramBuilder::new().finish(vec![Stmt::ret(Some(or))]);
    let bin = compile(&program);
    assert_eq!(Simulator::new(&bin).run(), Ok(0));
}
