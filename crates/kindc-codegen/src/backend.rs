//! IR → Thumb assembly text.
//!
//! One procedure at a time. Values are computed into r0; runtime calls take
//! up to four arguments in r0..r3. Shared values live on the machine stack
//! between their first and last use, mirrored by a [`VirtualStack`].
//!
//! Frame layout, from the top of the stack at entry to the body:
//!
//! ```text
//!   locals    [sp, locals@i]       zeroed by the prologue
//!   lr
//!   args      [sp, args@(n-i-1)]   pushed by the caller, receiver first
//! ```
//!
//! Captured values are read through the environment register: `[r5, #4*i]`.
//! Offsets named `locals@`/`args@` are resolved by the assembler from the
//! `@stackmark` annotations, which it keeps in sync with every push and pop.
//!
//! `bitvm::incr` returns its argument, so `Incr(x)` is a value.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::binary::Binary;
use crate::error::{CodegenError, CodegenResult};
use crate::ir::{self, CellId, CellKind, Expr, JmpMode, Procedure, RtCall, SharedExpr, SharedId, Stmt};
use crate::runtime::{NativeTable, DECR, INCR, LDFLD, LDGLB, STFLD, STGLB};
use crate::stack::{Access, VirtualStack};
use crate::types::{ENV_REG, MAX_CAPTURES, MAX_LAMBDA_ARGS, MAX_NATIVE_ARGS};

/// Ids for argument temporaries, disjoint from lowering's shared ids.
const SYNTHETIC_BASE: u32 = 1 << 31;

const REGS: [&str; 4] = ["r0", "r1", "r2", "r3"];

/// Generate the assembly text of procedure `idx`.
pub fn emit_procedure(bin: &Binary, idx: usize, natives: &NativeTable) -> CodegenResult<String> {
    let proc = bin.proc(idx);
    ir::check_labels(&proc.body)?;

    let mut em = Emitter {
        bin,
        proc,
        natives,
        uses: ir::count_shared_uses(&proc.body),
        evaluated: HashSet::new(),
        stack: VirtualStack::new(),
        out: String::new(),
        next_synthetic: SYNTHETIC_BASE,
        label_seq: 0,
    };
    em.prologue();
    for stmt in &proc.body {
        em.emit_stmt(stmt)?;
    }
    em.collapse();
    if !em.stack.is_empty() {
        return Err(CodegenError::InternalInvariant(format!(
            "stack not empty at the end of {}: {}",
            proc.name,
            em.stack.describe()
        )));
    }
    em.epilogue();
    if !proc.is_root() && proc.args.len() <= MAX_LAMBDA_ARGS {
        em.lambda_wrapper();
    }
    Ok(em.out)
}

struct Emitter<'a> {
    bin: &'a Binary,
    proc: &'a Procedure,
    natives: &'a NativeTable,
    uses: HashMap<SharedId, u32>,
    evaluated: HashSet<SharedId>,
    stack: VirtualStack,
    out: String,
    next_synthetic: u32,
    label_seq: u32,
}

/// How one runtime-call argument reaches its register.
enum ArgPlan {
    /// Loaded straight into the register.
    Direct,
    /// Evaluated up front and parked on the stack.
    Parked(SharedId),
}

impl Emitter<'_> {
    fn write(&mut self, line: &str) {
        let _ = writeln!(self.out, "    {line}");
    }

    fn raw(&mut self, line: &str) {
        let _ = writeln!(self.out, "{line}");
    }

    // ── Frame ────────────────────────────────────────────────────────────

    fn prologue(&mut self) {
        let p = self.proc;
        self.raw(";");
        self.raw(&format!("; Function {}", p.name));
        self.raw(";");
        self.raw(".section code");
        self.raw(&format!("{}:", p.label));
        self.raw("@stackmark func");
        self.raw("@stackmark args");
        self.write("push {lr}");
        if !p.locals.is_empty() {
            self.write("movs r0, #0");
            for &cell in &p.locals {
                let name = &self.bin.cell(cell).name;
                self.write(&format!("push {{r0}} ; loc {name}"));
            }
        }
        self.raw("@stackmark locals");
    }

    fn epilogue(&mut self) {
        let n = self.proc.locals.len();
        self.raw("@stackempty locals");
        if n > 0 {
            self.write(&format!("add sp, #4*{n} ; pop locals {n}"));
        }
        self.write("pop {pc}");
        self.raw("@stackempty func");
        self.raw("@stackempty args");
    }

    /// Entry used when the procedure runs as an action: r1 holds the action
    /// (the environment), r2/r3 the arguments.
    fn lambda_wrapper(&mut self) {
        let p = self.proc;
        let n = p.args.len();
        self.raw(".balign 4");
        self.raw(&format!("{}:", p.lit_label()));
        self.write(".short 0xffff, 0x0000   ; action literal");
        self.raw("@stackmark litfunc");
        self.write(&format!("push {{{ENV_REG}, lr}}"));
        self.write(&format!("mov {ENV_REG}, r1"));
        for reg in ["r2", "r3"].iter().take(n) {
            self.write(&format!("push {{{reg}}}"));
        }
        self.raw("@stackmark args");
        self.write(&format!("bl {}", p.label));
        self.raw("@stackempty args");
        if n > 0 {
            self.write(&format!("add sp, #4*{n} ; pop args"));
        }
        self.write(&format!("pop {{{ENV_REG}, pc}}"));
        self.raw("@stackempty litfunc");
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn emit_stmt(&mut self, stmt: &Stmt) -> CodegenResult<()> {
        match stmt {
            Stmt::Expr(e) => {
                self.emit_expr(e)?;
                self.collapse();
            }
            Stmt::Jmp { label, mode, value } => {
                if let Some(v) = value {
                    self.emit_expr(v)?;
                }
                self.collapse();
                self.emit_jmp(label, *mode);
            }
            Stmt::Label(l) => self.raw(&format!("{l}:")),
            Stmt::StackEmpty => {
                self.collapse();
                if !self.stack.is_empty() {
                    return Err(CodegenError::InternalInvariant(format!(
                        "stack not empty at a statement boundary of {}: {}",
                        self.proc.name,
                        self.stack.describe()
                    )));
                }
                self.raw("@stackempty locals");
            }
        }
        Ok(())
    }

    fn emit_jmp(&mut self, label: &str, mode: JmpMode) {
        let skip = match mode {
            JmpMode::Always => {
                self.write(&format!("bb {label}"));
                return;
            }
            JmpMode::IfZero => "bne",
            JmpMode::IfNotZero => "beq",
        };
        // Conditional branches are short; jump around a long one.
        self.label_seq += 1;
        let skip_lbl = format!("{label}_skip{}", self.label_seq);
        self.write("cmp r0, #0");
        self.write(&format!("{skip} {skip_lbl}"));
        self.write(&format!("bb {label}"));
        self.raw(&format!("{skip_lbl}:"));
    }

    fn collapse(&mut self) {
        let n = self.stack.collapse();
        if n > 0 {
            self.write(&format!("add sp, #4*{n} ; collapse"));
        }
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn emit_expr(&mut self, e: &Expr) -> CodegenResult<()> {
        match e {
            Expr::NumberLiteral(n) => self.emit_int(*n, "r0"),
            Expr::PointerLiteral { label, info } => self.emit_ptr(label, info, "r0"),
            Expr::CellRef(cell) => self.emit_cell_load(*cell)?,
            Expr::FieldAccess { base, index, is_ref } => {
                self.emit_expr(base)?;
                self.emit_int(*index as i32, "r1");
                self.call(&format!("{LDFLD}{}", ref_suffix(*is_ref)), 2)?;
            }
            Expr::Store { target, value } => self.emit_store(target, value)?,
            Expr::RuntimeCall(call) => self.emit_rtcall(call)?,
            Expr::ProcCall { callee, args } => {
                for a in args {
                    self.emit_expr(a)?;
                    self.write("push {r0}");
                    self.stack.push_arg();
                }
                let target = self.bin.proc_for(*callee).ok_or_else(|| {
                    CodegenError::InternalInvariant(format!("no procedure for {callee}"))
                })?;
                self.write(&format!("bl {}", target.label));
                let n = self.stack.pop_args(args.len())?;
                if n > 0 {
                    self.write(&format!("add sp, #4*{n} ; pop args"));
                }
            }
            Expr::Shared(s) => self.emit_shared(s)?,
            Expr::Sequence(items) => {
                for item in items {
                    self.emit_expr(item)?;
                }
            }
            Expr::Incr(inner) => {
                self.emit_expr(inner)?;
                self.call(INCR, 1)?;
            }
            Expr::Decr(inner) => {
                self.emit_expr(inner)?;
                self.call(DECR, 1)?;
            }
            Expr::JmpValue => {}
        }
        Ok(())
    }

    fn emit_shared(&mut self, s: &SharedExpr) -> CodegenResult<()> {
        if self.evaluated.contains(&s.id) {
            let access = self.stack.take(s.id)?;
            self.read_stacked(access, "r0");
            return Ok(());
        }
        self.emit_expr(&s.inner)?;
        self.evaluated.insert(s.id);
        let total = self.uses.get(&s.id).copied().unwrap_or(1);
        if total > 1 {
            self.write("push {r0}");
            self.stack.push(s.id, total - 1);
        }
        Ok(())
    }

    fn read_stacked(&mut self, access: Access, reg: &str) {
        match access {
            Access::Pop => self.write(&format!("pop {{{reg}}}")),
            Access::Load(off) => self.write(&format!("ldr {reg}, [sp, #4*{off}]")),
        }
    }

    fn emit_store(&mut self, target: &Expr, value: &Expr) -> CodegenResult<()> {
        match target {
            Expr::CellRef(id) => {
                let cell = self.bin.cell(*id);
                self.emit_expr(value)?;
                if cell.kind == CellKind::Global {
                    self.emit_int(cell.index as i32, "r1");
                    self.call(&format!("{STGLB}{}", cell.ref_suffix()), 2)?;
                } else {
                    let addr = self.cell_addr(*id)?;
                    self.write(&format!("str r0, {addr} ; {}", cell.name));
                }
            }
            Expr::FieldAccess { base, index, is_ref } => {
                self.emit_expr(base)?;
                self.write("push {r0}");
                self.stack.push_temp();
                self.emit_expr(value)?;
                self.write("movs r2, r0");
                self.stack.pop_temp()?;
                self.write("pop {r0}");
                self.emit_int(*index as i32, "r1");
                self.call(&format!("{STFLD}{}", ref_suffix(*is_ref)), 3)?;
            }
            other => {
                return Err(CodegenError::InternalInvariant(format!(
                    "cannot store into {other}"
                )))
            }
        }
        Ok(())
    }

    /// Load the arguments into r0..r3 without letting a later argument's
    /// side effects leak into an earlier one, then call.
    fn emit_rtcall(&mut self, call: &RtCall) -> CodegenResult<()> {
        let n = call.args.len();
        if n > MAX_NATIVE_ARGS {
            return Err(CodegenError::InternalInvariant(format!(
                "{} called with {n} register arguments",
                call.name
            )));
        }

        // Scan right to left: an argument must be evaluated up front unless
        // it is stateless, or a local cell that nothing after it can write.
        let mut complex = vec![false; n];
        let mut did_update = false;
        for i in (0..n).rev() {
            let a = &call.args[i];
            if self.is_stateless(a) {
                continue;
            }
            if let Expr::CellRef(cell) = a {
                if !self.bin.cell(*cell).is_global() && !did_update {
                    continue;
                }
            }
            if a.can_update_cells() {
                did_update = true;
            }
            complex[i] = true;
        }

        let mut plans = Vec::with_capacity(n);
        for (i, a) in call.args.iter().enumerate() {
            if !complex[i] {
                plans.push(ArgPlan::Direct);
                continue;
            }
            match a {
                Expr::Shared(s) if self.evaluated.contains(&s.id) => plans.push(ArgPlan::Direct),
                Expr::Shared(s) => {
                    self.emit_expr(&s.inner)?;
                    self.evaluated.insert(s.id);
                    let total = self.uses.get(&s.id).copied().unwrap_or(1);
                    self.write("push {r0}");
                    self.stack.push(s.id, total);
                    plans.push(ArgPlan::Parked(s.id));
                }
                other => {
                    self.emit_expr(other)?;
                    let id = SharedId(self.next_synthetic);
                    self.next_synthetic += 1;
                    self.write("push {r0}");
                    self.stack.push(id, 1);
                    plans.push(ArgPlan::Parked(id));
                }
            }
        }

        for i in (0..n).rev() {
            let reg = REGS[i];
            match (&plans[i], &call.args[i]) {
                (ArgPlan::Parked(id), _) => {
                    let access = self.stack.take(*id)?;
                    self.read_stacked(access, reg);
                }
                (ArgPlan::Direct, Expr::Shared(s)) => {
                    let access = self.stack.take(s.id)?;
                    self.read_stacked(access, reg);
                }
                (ArgPlan::Direct, Expr::NumberLiteral(v)) => self.emit_int(*v, reg),
                (ArgPlan::Direct, Expr::PointerLiteral { label, info }) => {
                    self.emit_ptr(label, info, reg)
                }
                (ArgPlan::Direct, Expr::CellRef(cell)) => {
                    let addr = self.cell_addr(*cell)?;
                    self.write(&format!("ldr {reg}, {addr}"));
                }
                (ArgPlan::Direct, other) => {
                    return Err(CodegenError::InternalInvariant(format!(
                        "argument {other} cannot be loaded directly"
                    )))
                }
            }
        }
        self.collapse();

        self.call(&call.name, n)?;
        if call.is_async {
            self.label_seq += 1;
            let lbl = format!(".async_{}_{}", self.proc.seq_no, self.label_seq);
            self.raw(&format!("{lbl}:"));
        }
        Ok(())
    }

    fn is_stateless(&self, e: &Expr) -> bool {
        match e {
            Expr::Shared(s) => self.evaluated.contains(&s.id),
            other => other.is_literal(),
        }
    }

    fn call(&mut self, name: &str, argc: usize) -> CodegenResult<()> {
        self.natives.lookup(name)?;
        self.write(&format!("bl {name} ; *{argc}"));
        Ok(())
    }

    // ── Values ───────────────────────────────────────────────────────────

    /// Materialize a 32-bit constant one byte at a time.
    fn emit_int(&mut self, v: i32, reg: &str) {
        let neg = v < 0;
        let mag = i64::from(v).unsigned_abs() as u32;
        let bytes = mag.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
        self.write(&format!("movs {reg}, #{}", bytes[start]));
        for &b in &bytes[start + 1..] {
            self.write(&format!("lsls {reg}, {reg}, #8"));
            if b != 0 {
                self.write(&format!("adds {reg}, #{b}"));
            }
        }
        if neg {
            self.write(&format!("negs {reg}, {reg}"));
        }
    }

    fn emit_ptr(&mut self, label: &str, info: &str, reg: &str) {
        self.write(&format!("movs {reg}, {label}@hi ; {info}"));
        self.write(&format!("lsls {reg}, {reg}, #8"));
        self.write(&format!("adds {reg}, {label}@lo"));
    }

    fn cell_addr(&self, id: CellId) -> CodegenResult<String> {
        let cell = self.bin.cell(id);
        match cell.kind {
            CellKind::Local => Ok(format!("[sp, locals@{}]", cell.index)),
            CellKind::Argument => {
                let n = self.proc.args.len();
                Ok(format!("[sp, args@{}]", n - cell.index - 1))
            }
            CellKind::Captured => {
                if cell.index >= MAX_CAPTURES {
                    return Err(CodegenError::LimitExceeded(format!(
                        "{} captures more than {MAX_CAPTURES} variables",
                        self.proc.name
                    )));
                }
                Ok(format!("[{ENV_REG}, #4*{}]", cell.index))
            }
            CellKind::Global => Err(CodegenError::InternalInvariant(format!(
                "global {} has no frame address",
                cell.name
            ))),
        }
    }

    fn emit_cell_load(&mut self, id: CellId) -> CodegenResult<()> {
        let cell = self.bin.cell(id);
        if cell.kind == CellKind::Global {
            self.emit_int(cell.index as i32, "r0");
            self.call(&format!("{LDGLB}{}", cell.ref_suffix()), 1)
        } else {
            let addr = self.cell_addr(id)?;
            self.write(&format!("ldr r0, {addr} ; {}", cell.name));
            Ok(())
        }
    }
}

fn ref_suffix(is_ref: bool) -> &'static str {
    if is_ref {
        "Ref"
    } else {
        ""
    }
}
