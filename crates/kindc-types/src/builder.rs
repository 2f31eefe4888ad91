//! Programmatic construction of typed declaration trees.
//!
//! The parser and checker that normally produce a [`Program`] live outside
//! this workspace. `ProgramBuilder` lets drivers and tests assemble the same
//! tree directly: declarations are registered in scope order (the function
//! currently open becomes each new declaration's parent), and expression
//! helpers fill in static types from the declaration table.

use crate::ast::*;
use crate::{Attrs, Span};

/// Incrementally builds a [`Program`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    decls: Vec<Decl>,
    /// Functions whose bodies are currently open, innermost last.
    scopes: Vec<DeclId>,
    namespace: Option<String>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_function(&self) -> Option<DeclId> {
        self.scopes.last().copied()
    }

    fn push_decl(&mut self, name: &str, kind: DeclKind, ty: Type, parent: Option<DeclId>) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.decls.push(Decl {
            id,
            name: name.to_string(),
            kind,
            ty,
            attrs: Attrs::default(),
            parent,
            namespace: self.namespace.clone(),
            span: Span::synthetic(),
        });
        id
    }

    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.index()]
    }

    pub fn decl_mut(&mut self, id: DeclId) -> &mut Decl {
        &mut self.decls[id.index()]
    }

    pub fn attrs_mut(&mut self, id: DeclId) -> &mut Attrs {
        &mut self.decl_mut(id).attrs
    }

    /// Declarations registered after this call belong to `namespace`.
    pub fn set_namespace(&mut self, namespace: Option<&str>) {
        self.namespace = namespace.map(str::to_string);
    }

    // ── Variables ────────────────────────────────────────────────────────

    /// A `let` in the innermost open function (or the root).
    pub fn var(&mut self, name: &str, ty: Type) -> DeclId {
        let parent = self.current_function();
        self.push_decl(name, DeclKind::Variable { global: false }, ty, parent)
    }

    /// A module-level variable with static storage.
    pub fn global(&mut self, name: &str, ty: Type) -> DeclId {
        self.push_decl(name, DeclKind::Variable { global: true }, ty, None)
    }

    // ── Functions ────────────────────────────────────────────────────────

    fn open_function(
        &mut self,
        name: &str,
        kind: FunctionKind,
        class: Option<DeclId>,
        params: &[(&str, Type)],
        ret: Type,
    ) -> DeclId {
        let ty = Type::Function {
            params: params.iter().map(|(_, t)| t.clone()).collect(),
            ret: Box::new(ret.clone()),
        };
        let parent = if class.is_some() {
            None
        } else {
            self.current_function()
        };
        let func = self.push_decl(
            name,
            DeclKind::Function(FunctionDecl {
                kind,
                params: Vec::new(),
                this_param: None,
                class,
                body: None,
                ret,
            }),
            ty,
            parent,
        );

        let this_param = class.map(|c| self.push_decl("this", DeclKind::This, Type::Class(c), Some(func)));
        let param_ids: Vec<DeclId> = params
            .iter()
            .enumerate()
            .map(|(index, (pname, pty))| {
                self.push_decl(
                    pname,
                    DeclKind::Parameter {
                        index,
                        default: None,
                    },
                    pty.clone(),
                    Some(func),
                )
            })
            .collect();

        if let DeclKind::Function(f) = &mut self.decl_mut(func).kind {
            f.params = param_ids;
            f.this_param = this_param;
        }
        self.scopes.push(func);
        func
    }

    /// Open a function declaration. Declarations made until the matching
    /// [`end_function`](Self::end_function) are nested in it.
    pub fn begin_function(&mut self, name: &str, params: &[(&str, Type)], ret: Type) -> DeclId {
        self.open_function(name, FunctionKind::Declaration, None, params, ret)
    }

    /// Open an arrow function / function expression.
    pub fn begin_lambda(&mut self, params: &[(&str, Type)], ret: Type) -> DeclId {
        self.open_function("<lambda>", FunctionKind::Expression, None, params, ret)
    }

    pub fn begin_method(
        &mut self,
        class: DeclId,
        name: &str,
        params: &[(&str, Type)],
        ret: Type,
    ) -> DeclId {
        let id = self.open_function(name, FunctionKind::Method, Some(class), params, ret);
        if let DeclKind::Class(c) = &mut self.decl_mut(class).kind {
            c.methods.push(id);
        }
        id
    }

    pub fn begin_constructor(&mut self, class: DeclId, params: &[(&str, Type)]) -> DeclId {
        let id = self.open_function(
            "constructor",
            FunctionKind::Constructor,
            Some(class),
            params,
            Type::Void,
        );
        if let DeclKind::Class(c) = &mut self.decl_mut(class).kind {
            c.constructor = Some(id);
        }
        id
    }

    /// Close the innermost open function with its body.
    pub fn end_function(&mut self, body: Vec<Stmt>) -> DeclId {
        let id = self
            .scopes
            .pop()
            .expect("end_function without a matching begin");
        if let DeclKind::Function(f) = &mut self.decl_mut(id).kind {
            f.body = Some(body);
        }
        id
    }

    /// An ambient function bound to a native primitive.
    pub fn native(&mut self, name: &str, params: &[(&str, Type)], ret: Type, shim: &str) -> DeclId {
        let id = self.open_function(name, FunctionKind::Declaration, None, params, ret);
        self.scopes.pop();
        self.decl_mut(id).parent = None;
        self.decl_mut(id).attrs.shim = Some(shim.to_string());
        id
    }

    /// An ambient method bound to a native primitive.
    pub fn native_method(
        &mut self,
        class: DeclId,
        name: &str,
        params: &[(&str, Type)],
        ret: Type,
        shim: &str,
    ) -> DeclId {
        let id = self.begin_method(class, name, params, ret);
        self.scopes.pop();
        self.decl_mut(id).attrs.shim = Some(shim.to_string());
        id
    }

    /// The `index`-th declared parameter of `func`.
    pub fn param(&self, func: DeclId, index: usize) -> DeclId {
        match &self.decl(func).kind {
            DeclKind::Function(f) => f.params[index],
            other => panic!("{func} is not a function: {other:?}"),
        }
    }

    pub fn this_param(&self, func: DeclId) -> DeclId {
        match &self.decl(func).kind {
            DeclKind::Function(FunctionDecl {
                this_param: Some(this),
                ..
            }) => *this,
            other => panic!("{func} has no receiver: {other:?}"),
        }
    }

    pub fn set_default(&mut self, param: DeclId, value: Expr) {
        if let DeclKind::Parameter { default, .. } = &mut self.decl_mut(param).kind {
            *default = Some(value);
        }
    }

    // ── Classes and enums ────────────────────────────────────────────────

    pub fn class(&mut self, name: &str) -> DeclId {
        let id = DeclId(self.decls.len() as u32);
        self.push_decl(name, DeclKind::Class(ClassDecl::default()), Type::Class(id), None)
    }

    pub fn field(&mut self, class: DeclId, name: &str, ty: Type) -> DeclId {
        let id = self.push_decl(name, DeclKind::Field { class }, ty, None);
        if let DeclKind::Class(c) = &mut self.decl_mut(class).kind {
            c.fields.push(id);
        }
        id
    }

    pub fn enum_member(&mut self, enum_name: &str, name: &str, value: Option<i32>) -> DeclId {
        self.push_decl(
            name,
            DeclKind::EnumMember { value },
            Type::Enum(enum_name.to_string()),
            None,
        )
    }

    /// A property whose getter is a native primitive, e.g. `s.length`.
    pub fn native_property(&mut self, name: &str, ty: Type, shim: &str) -> DeclId {
        let id = self.push_decl(name, DeclKind::Property, ty, None);
        self.decl_mut(id).attrs.shim = Some(shim.to_string());
        id
    }

    // ── Expressions ──────────────────────────────────────────────────────

    /// Reference to a declaration, typed from the declaration table.
    pub fn ident(&self, id: DeclId) -> Expr {
        Expr::new(ExprKind::Ident(id), self.decl(id).ty.clone())
    }

    pub fn this(&self, method: DeclId) -> Expr {
        let this = self.this_param(method);
        Expr::new(ExprKind::This(this), self.decl(this).ty.clone())
    }

    /// Call through an arbitrary callee expression.
    pub fn call(&self, callee: Expr, args: Vec<Expr>) -> Expr {
        let ty = callee.ty.function_ret().cloned().unwrap_or(Type::Void);
        Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            ty,
        )
    }

    pub fn call_decl(&self, func: DeclId, args: Vec<Expr>) -> Expr {
        self.call(self.ident(func), args)
    }

    pub fn property(&self, object: Expr, decl: DeclId) -> Expr {
        Expr::new(
            ExprKind::Property {
                object: Box::new(object),
                decl,
            },
            self.decl(decl).ty.clone(),
        )
    }

    pub fn method_call(&self, object: Expr, method: DeclId, args: Vec<Expr>) -> Expr {
        self.call(self.property(object, method), args)
    }

    pub fn new_object(&self, class: DeclId, args: Vec<Expr>) -> Expr {
        Expr::new(ExprKind::New { class, args }, Type::Class(class))
    }

    pub fn lambda(&self, func: DeclId) -> Expr {
        Expr::new(ExprKind::Function(func), self.decl(func).ty.clone())
    }

    /// Finish the tree with the root procedure's statements.
    pub fn finish(self, body: Vec<Stmt>) -> Program {
        assert!(
            self.scopes.is_empty(),
            "unclosed function scopes: {:?}",
            self.scopes
        );
        Program {
            decls: self.decls,
            body,
            span: Span::synthetic(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_declarations_get_parents() {
        let mut b = ProgramBuilder::new();
        let n = b.var("n", Type::Number);
        let f = b.begin_function("f", &[("x", Type::Number)], Type::Void);
        let local = b.var("y", Type::Number);
        b.end_function(vec![]);
        let program = b.finish(vec![]);

        assert_eq!(program.decl(n).parent, None);
        assert_eq!(program.decl(f).parent, None);
        assert_eq!(program.decl(local).parent, Some(f));
        let params = &program.function(f).unwrap().params;
        assert_eq!(program.decl(params[0]).parent, Some(f));
    }

    #[test]
    fn methods_get_receivers() {
        let mut b = ProgramBuilder::new();
        let c = b.class("Point");
        b.field(c, "x", Type::Number);
        let m = b.begin_method(c, "norm", &[], Type::Number);
        let this = b.this(m);
        let body = vec![Stmt::ret(Some(Expr::number(0)))];
        b.end_function(body);
        let program = b.finish(vec![]);

        assert_eq!(this.ty, Type::Class(c));
        let class = program.class(c).unwrap();
        assert_eq!(class.methods, vec![m]);
        assert_eq!(class.fields.len(), 1);
    }

    #[test]
    fn call_types_come_from_callee() {
        let mut b = ProgramBuilder::new();
        let show = b.native("show", &[("n", Type::Number)], Type::Void, "basic::show");
        let f = b.begin_function("f", &[], Type::String);
        b.end_function(vec![]);
        assert_eq!(b.call_decl(show, vec![Expr::number(1)]).ty, Type::Void);
        assert_eq!(b.call_decl(f, vec![]).ty, Type::String);
        assert_eq!(b.decl(show).attrs.shim.as_deref(), Some("basic::show"));
    }

    #[test]
    fn namespaces_are_searchable() {
        let mut b = ProgramBuilder::new();
        b.set_namespace(Some("helpers"));
        let h = b.begin_function("arrayPush", &[], Type::Void);
        b.end_function(vec![]);
        b.set_namespace(None);
        let program = b.finish(vec![]);
        assert_eq!(program.find_in_namespace("helpers", "arrayPush"), Some(h));
        assert_eq!(program.find_in_namespace("other", "arrayPush"), None);
    }
}
