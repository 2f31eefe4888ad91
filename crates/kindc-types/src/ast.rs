//! Typed declaration tree consumed by the code generator.
//!
//! The tree is produced by an external parser and type checker. Every
//! identifier and property access already resolves to exactly one
//! [`Decl`], addressed by its [`DeclId`], and every expression carries its
//! static [`Type`].
//!
//! Function bodies live inside their declaration; statements and
//! expressions refer to functions and classes by id. Large recursive types
//! are boxed to keep enum sizes reasonable.

use std::fmt;

use crate::{Attrs, Span};

// ══════════════════════════════════════════════════════════════════════════════
// Program
// ══════════════════════════════════════════════════════════════════════════════

/// Stable identity of a declaration: its index in [`Program::decls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclId(pub u32);

impl DeclId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeclId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A whole compilation unit: the declaration table plus the top-level
/// statements that make up the synthetic root procedure.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub decls: Vec<Decl>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

impl Program {
    /// Look up a declaration. Ids always come from this program's tree.
    pub fn decl(&self, id: DeclId) -> &Decl {
        &self.decls[id.index()]
    }

    pub fn get(&self, id: DeclId) -> Option<&Decl> {
        self.decls.get(id.index())
    }

    pub fn function(&self, id: DeclId) -> Option<&FunctionDecl> {
        match &self.get(id)?.kind {
            DeclKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn class(&self, id: DeclId) -> Option<&ClassDecl> {
        match &self.get(id)?.kind {
            DeclKind::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Find a declaration by namespace-qualified name.
    pub fn find_in_namespace(&self, namespace: &str, name: &str) -> Option<DeclId> {
        self.decls
            .iter()
            .find(|d| d.name == name && d.namespace.as_deref() == Some(namespace))
            .map(|d| d.id)
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Declarations
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub id: DeclId,
    pub name: String,
    pub kind: DeclKind,
    pub ty: Type,
    pub attrs: Attrs,
    /// Enclosing function; `None` at the top level.
    pub parent: Option<DeclId>,
    pub namespace: Option<String>,
    pub span: Span,
}

impl Decl {
    pub fn is_global_var(&self) -> bool {
        matches!(self.kind, DeclKind::Variable { global: true })
    }

    /// Variables, parameters and `this`: anything that gets a storage cell.
    pub fn is_variable_like(&self) -> bool {
        matches!(
            self.kind,
            DeclKind::Variable { .. } | DeclKind::Parameter { .. } | DeclKind::This
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            DeclKind::Variable { .. } => "VariableDeclaration",
            DeclKind::Parameter { .. } => "Parameter",
            DeclKind::This => "ThisParameter",
            DeclKind::Function(f) => f.kind.name(),
            DeclKind::Class(_) => "ClassDeclaration",
            DeclKind::Field { .. } => "PropertyDeclaration",
            DeclKind::EnumMember { .. } => "EnumMember",
            DeclKind::Property => "PropertySignature",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclKind {
    /// `let`/`var`; `global` marks module-level static storage.
    Variable { global: bool },
    Parameter { index: usize, default: Option<Expr> },
    /// The implicit receiver of a method or constructor.
    This,
    Function(FunctionDecl),
    Class(ClassDecl),
    Field { class: DeclId },
    EnumMember { value: Option<i32> },
    /// A property implemented by a native getter (`//% shim=...`).
    Property,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Declaration,
    /// Arrow function or function expression.
    Expression,
    Method,
    Constructor,
}

impl FunctionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Declaration => "FunctionDeclaration",
            Self::Expression => "FunctionExpression",
            Self::Method => "MethodDeclaration",
            Self::Constructor => "Constructor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub kind: FunctionKind,
    pub params: Vec<DeclId>,
    pub this_param: Option<DeclId>,
    pub class: Option<DeclId>,
    /// `None` for ambient (native-bound) declarations.
    pub body: Option<Vec<Stmt>>,
    pub ret: Type,
}

impl FunctionDecl {
    pub fn is_member(&self) -> bool {
        matches!(self.kind, FunctionKind::Method | FunctionKind::Constructor)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassDecl {
    pub fields: Vec<DeclId>,
    pub methods: Vec<DeclId>,
    pub constructor: Option<DeclId>,
    pub type_params: Vec<String>,
    pub extends: Option<String>,
    /// Fields declared with an initializer (`x = 1;` in the class body).
    pub initialized_fields: Vec<DeclId>,
}

// ══════════════════════════════════════════════════════════════════════════════
// Types
// ══════════════════════════════════════════════════════════════════════════════

/// Static type as computed by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Number,
    Boolean,
    Enum(String),
    Void,
    Null,
    String,
    Array(Box<Type>),
    Class(DeclId),
    Function { params: Vec<Type>, ret: Box<Type> },
    /// An instantiated generic other than arrays, e.g. `Map<K, V>`.
    Generic { name: String, args: Vec<Type> },
    Any,
}

impl Type {
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Type::String)
    }

    /// Return type of a function type.
    pub fn function_ret(&self) -> Option<&Type> {
        match self {
            Type::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }

    pub fn array_element(&self) -> Option<&Type> {
        match self {
            Type::Array(elt) => Some(elt),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Number => write!(f, "number"),
            Type::Boolean => write!(f, "boolean"),
            Type::Enum(name) => write!(f, "{name}"),
            Type::Void => write!(f, "void"),
            Type::Null => write!(f, "null"),
            Type::String => write!(f, "string"),
            Type::Array(elt) => write!(f, "{elt}[]"),
            Type::Class(id) => write!(f, "class {id}"),
            Type::Function { params, ret } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") => {ret}")
            }
            Type::Generic { name, args } => {
                write!(f, "{name}<")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ">")
            }
            Type::Any => write!(f, "any"),
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Statements
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Var { decl: DeclId, init: Option<Expr> },
    Expr(Expr),
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While { cond: Expr, body: Box<Stmt> },
    DoWhile { body: Box<Stmt>, cond: Expr },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Break(Option<String>),
    Continue(Option<String>),
    Labeled { label: String, body: Box<Stmt> },
    Return(Option<Expr>),
    Function(DeclId),
    Class(DeclId),
    /// Interfaces, type aliases, enum declarations: no code.
    TypeOnly,
    Empty,
    /// A syntax kind the checker accepts but the code generator does not,
    /// e.g. `SwitchStatement` or `ForOfStatement`.
    Unsupported(String),
}

impl StmtKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Var { .. } => "VariableStatement",
            Self::Expr(_) => "ExpressionStatement",
            Self::Block(_) => "Block",
            Self::If { .. } => "IfStatement",
            Self::While { .. } => "WhileStatement",
            Self::DoWhile { .. } => "DoStatement",
            Self::For { .. } => "ForStatement",
            Self::Break(_) => "BreakStatement",
            Self::Continue(_) => "ContinueStatement",
            Self::Labeled { .. } => "LabeledStatement",
            Self::Return(_) => "ReturnStatement",
            Self::Function(_) => "FunctionDeclaration",
            Self::Class(_) => "ClassDeclaration",
            Self::TypeOnly => "TypeDeclaration",
            Self::Empty => "EmptyStatement",
            Self::Unsupported(kind) => kind,
        }
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            span: Span::synthetic(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn expr(e: Expr) -> Self {
        Self::new(StmtKind::Expr(e))
    }

    pub fn var(decl: DeclId, init: Option<Expr>) -> Self {
        Self::new(StmtKind::Var { decl, init })
    }

    pub fn ret(value: Option<Expr>) -> Self {
        Self::new(StmtKind::Return(value))
    }

    pub fn func(decl: DeclId) -> Self {
        Self::new(StmtKind::Function(decl))
    }

    pub fn class(decl: DeclId) -> Self {
        Self::new(StmtKind::Class(decl))
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::new(StmtKind::Block(stmts))
    }

    pub fn if_else(cond: Expr, then_branch: Stmt, else_branch: Option<Stmt>) -> Self {
        Self::new(StmtKind::If {
            cond,
            then_branch: Box::new(then_branch),
            else_branch: else_branch.map(Box::new),
        })
    }

    pub fn while_loop(cond: Expr, body: Stmt) -> Self {
        Self::new(StmtKind::While {
            cond,
            body: Box::new(body),
        })
    }

    pub fn unsupported(kind: impl Into<String>) -> Self {
        Self::new(StmtKind::Unsupported(kind.into()))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// Expressions
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    // ── Literals ──
    Number(i32),
    Bool(bool),
    Null,
    Str(String),
    Array(Vec<Expr>),

    // ── References ──
    Ident(DeclId),
    This(DeclId),
    Property { object: Box<Expr>, decl: DeclId },
    Index { object: Box<Expr>, index: Box<Expr> },

    // ── Calls ──
    Call { callee: Box<Expr>, args: Vec<Expr> },
    New { class: DeclId, args: Vec<Expr> },

    // ── Operators ──
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Assign { target: Box<Expr>, value: Box<Expr> },

    Function(DeclId),
    Paren(Box<Expr>),
    /// Type assertion: `<T>e` or `e as T`.
    Cast(Box<Expr>),
    Unsupported(String),
}

impl ExprKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Number(_) => "NumericLiteral",
            Self::Bool(_) => "BooleanLiteral",
            Self::Null => "NullKeyword",
            Self::Str(_) => "StringLiteral",
            Self::Array(_) => "ArrayLiteralExpression",
            Self::Ident(_) => "Identifier",
            Self::This(_) => "ThisKeyword",
            Self::Property { .. } => "PropertyAccessExpression",
            Self::Index { .. } => "ElementAccessExpression",
            Self::Call { .. } => "CallExpression",
            Self::New { .. } => "NewExpression",
            Self::Binary { .. } => "BinaryExpression",
            Self::Unary { .. } => "UnaryExpression",
            Self::Assign { .. } => "AssignmentExpression",
            Self::Function(_) => "FunctionExpression",
            Self::Paren(_) => "ParenthesizedExpression",
            Self::Cast(_) => "TypeAssertion",
            Self::Unsupported(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl UnaryOp {
    pub fn is_update(self) -> bool {
        matches!(
            self,
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
        )
    }
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type) -> Self {
        Self {
            kind,
            ty,
            span: Span::synthetic(),
        }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn number(n: i32) -> Self {
        Self::new(ExprKind::Number(n), Type::Number)
    }

    pub fn boolean(b: bool) -> Self {
        Self::new(ExprKind::Bool(b), Type::Boolean)
    }

    pub fn null() -> Self {
        Self::new(ExprKind::Null, Type::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(ExprKind::Str(s.into()), Type::String)
    }

    /// Binary expression; the result type follows the checker's rules for
    /// the supported operator table.
    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        let ty = match op {
            _ if op.is_comparison() => Type::Boolean,
            BinOp::And | BinOp::Or => right.ty.clone(),
            BinOp::Add if left.ty.is_string() || right.ty.is_string() => Type::String,
            _ => Type::Number,
        };
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            ty,
        )
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let ty = match op {
            UnaryOp::Not => Type::Boolean,
            _ => Type::Number,
        };
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        let ty = value.ty.clone();
        Self::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            ty,
        )
    }

    pub fn index(object: Expr, index: Expr) -> Self {
        let ty = match &object.ty {
            Type::Array(elt) => (**elt).clone(),
            _ => Type::String,
        };
        Self::new(
            ExprKind::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            ty,
        )
    }

    pub fn array(element: Type, items: Vec<Expr>) -> Self {
        Self::new(ExprKind::Array(items), Type::Array(Box::new(element)))
    }

    pub fn paren(inner: Expr) -> Self {
        let ty = inner.ty.clone();
        Self::new(ExprKind::Paren(Box::new(inner)), ty)
    }

    pub fn unsupported(kind: impl Into<String>, ty: Type) -> Self {
        Self::new(ExprKind::Unsupported(kind.into()), ty)
    }

    /// Strip parentheses and type assertions.
    pub fn unwrapped(&self) -> &Expr {
        match &self.kind {
            ExprKind::Paren(inner) | ExprKind::Cast(inner) => inner.unwrapped(),
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_result_types() {
        let concat = Expr::binary(BinOp::Add, Expr::string("a"), Expr::number(1));
        assert_eq!(concat.ty, Type::String);
        let cmp = Expr::binary(BinOp::Lt, Expr::number(1), Expr::number(2));
        assert_eq!(cmp.ty, Type::Boolean);
        let sum = Expr::binary(BinOp::Add, Expr::number(1), Expr::number(2));
        assert_eq!(sum.ty, Type::Number);
    }

    #[test]
    fn unwrapped_strips_parens_and_casts() {
        let inner = Expr::number(7);
        let wrapped = Expr::new(
            ExprKind::Cast(Box::new(Expr::paren(inner.clone()))),
            Type::Number,
        );
        assert_eq!(wrapped.unwrapped(), &inner);
    }

    #[test]
    fn type_display() {
        let f = Type::Function {
            params: vec![Type::Number, Type::String],
            ret: Box::new(Type::Void),
        };
        assert_eq!(f.to_string(), "(number, string) => void");
        let g = Type::Generic {
            name: "Map".into(),
            args: vec![Type::String, Type::Array(Box::new(Type::Number))],
        };
        assert_eq!(g.to_string(), "Map<string, number[]>");
    }

    #[test]
    fn unsupported_kinds_keep_their_name() {
        assert_eq!(
            StmtKind::Unsupported("SwitchStatement".into()).name(),
            "SwitchStatement"
        );
        assert_eq!(
            ExprKind::Unsupported("SpreadElement".into()).name(),
            "SpreadElement"
        );
    }
}
