//! Usage and capture analysis.
//!
//! Top-level functions, methods, constructors and uninitialized globals are
//! compiled on demand: only when something reachable from the root names
//! them. Everything else is always used.
//!
//! While a procedure is being lowered, every identifier it touches is fed to
//! [`UsageTables::record_use`]. A declaration owned by a different function
//! is a capture of the current one (and of every function in between). A
//! captured variable that is also written anywhere is boxed: it lives in a
//! heap cell shared by the owner and all closures.
//!
//! The tables only grow. The compiler runs discovery passes until
//! [`UsageTables::fingerprint`] is stable, so the final pass sees the
//! complete picture from its first statement.

use std::collections::{HashMap, HashSet, VecDeque};

use kindc_types::ast::{DeclId, DeclKind, FunctionKind, Program};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariableInfo {
    pub captured: bool,
    pub written: bool,
}

impl VariableInfo {
    pub fn boxed(&self) -> bool {
        self.captured && self.written
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Captured declarations in discovery order.
    pub captured: Vec<DeclId>,
}

/// Summary of the tables used to detect the discovery fixpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub used: usize,
    pub captures: usize,
    pub captured_vars: usize,
    pub written_vars: usize,
}

#[derive(Debug, Default)]
pub struct UsageTables {
    used: HashSet<DeclId>,
    frontier: VecDeque<DeclId>,
    /// On-demand functions queued (or compiled) in the current pass.
    queued: HashSet<DeclId>,
    vars: HashMap<DeclId, VariableInfo>,
    funcs: HashMap<DeclId, FunctionInfo>,
}

/// Whether `id` is compiled only when reachable.
pub fn is_on_demand(program: &Program, id: DeclId) -> bool {
    let decl = program.decl(id);
    match &decl.kind {
        DeclKind::Function(f) => match f.kind {
            FunctionKind::Declaration => decl.parent.is_none(),
            FunctionKind::Method | FunctionKind::Constructor => true,
            FunctionKind::Expression => false,
        },
        DeclKind::Variable { global: true } => true,
        _ => false,
    }
}

impl UsageTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the per-pass work queue. Usage and capture facts persist.
    pub fn begin_pass(&mut self) {
        self.frontier.clear();
        self.queued.clear();
    }

    pub fn is_used(&self, program: &Program, id: DeclId) -> bool {
        !is_on_demand(program, id) || self.used.contains(&id)
    }

    /// Mark `id` reachable. Returns `true` if this discovered it.
    pub fn mark_used(&mut self, program: &Program, id: DeclId) -> bool {
        is_on_demand(program, id) && self.used.insert(id)
    }

    /// Queue an on-demand function for compilation in this pass, once.
    pub fn request_compile(&mut self, id: DeclId) -> bool {
        if self.queued.insert(id) {
            self.frontier.push_back(id);
            true
        } else {
            false
        }
    }

    /// Record that `id` is being compiled at its declaration site, so the
    /// frontier must not compile it again.
    pub fn claim(&mut self, id: DeclId) -> bool {
        self.queued.insert(id)
    }

    pub fn next_queued(&mut self) -> Option<DeclId> {
        self.frontier.pop_front()
    }

    /// Record a read or write of `decl` from code belonging to `current`
    /// (`None` for the root). Returns `true` if any fact changed.
    pub fn record_use(
        &mut self,
        program: &Program,
        decl: DeclId,
        current: Option<DeclId>,
        written: bool,
    ) -> bool {
        let d = program.decl(decl);
        if d.is_global_var() {
            return false;
        }
        let mut changed = false;
        if written {
            let info = self.vars.entry(decl).or_default();
            changed |= !info.written;
            info.written = true;
        }
        if d.parent == current {
            return changed;
        }

        if d.is_variable_like() {
            let info = self.vars.entry(decl).or_default();
            changed |= !info.captured;
            info.captured = true;
        }
        // Every function between the use and the owner needs the value in
        // its environment.
        let mut func = current;
        while let Some(f) = func {
            if f == decl || Some(f) == d.parent {
                break;
            }
            let caps = &mut self.funcs.entry(f).or_default().captured;
            if !caps.contains(&decl) {
                caps.push(decl);
                changed = true;
            }
            func = program.decl(f).parent;
        }
        changed
    }

    pub fn var_info(&self, id: DeclId) -> VariableInfo {
        self.vars.get(&id).copied().unwrap_or_default()
    }

    pub fn captures(&self, func: DeclId) -> &[DeclId] {
        self.funcs
            .get(&func)
            .map(|f| f.captured.as_slice())
            .unwrap_or(&[])
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            used: self.used.len(),
            captures: self.funcs.values().map(|f| f.captured.len()).sum(),
            captured_vars: self.vars.values().filter(|v| v.captured).count(),
            written_vars: self.vars.values().filter(|v| v.written).count(),
        }
    }
}
