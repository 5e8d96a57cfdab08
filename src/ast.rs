// File: src/ast.rs
//
// AST node definitions for Smalt.
// The parser produces these nodes; the compiler consumes them without
// rearrangement (message precedence is settled during parsing).

/// A parsed top-level program: an ordered list of statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Temporary declaration: `| x y |`
    VariableDeclaration(Vec<String>),

    /// `^ expr`
    Return(Expr),

    /// An expression evaluated for its effect; the result is discarded.
    Expression(Expr),

    /// `class Name extends Super [ ... ]`
    ClassDefinition(ClassDef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Identifier(String),

    IntegerLiteral(i64),
    FloatLiteral(f64),
    StringLiteral(String),
    BooleanLiteral(bool),
    NilLiteral,

    /// `name := expr` (an assignment is an expression; it yields the value)
    Assignment { name: String, value: Box<Expr> },

    /// A message send. The selector is already canonical: a bare identifier
    /// for unary, an operator for binary, `key1:key2:` for keyword sends.
    MessageSend { receiver: Box<Expr>, selector: String, args: Vec<Expr> },

    /// The `super` pseudo-receiver. Only legal in receiver position; the
    /// compiler rejects it anywhere else.
    SuperMarker,

    /// `#( e1 e2 ... )`
    ArrayLiteral(Vec<Expr>),

    /// `#{ k1 -> v1. k2 -> v2 }`
    DictionaryLiteral(Vec<(Expr, Expr)>),

    /// `[ :a :b | stmts ]`
    BlockLiteral { params: Vec<String>, body: Vec<Stmt> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    pub name: String,
    /// `Object` for root-level classes.
    pub superclass_name: String,
    pub instance_fields: Vec<String>,
    pub class_variables: Vec<String>,
    pub instance_methods: Vec<MethodDef>,
    pub class_methods: Vec<MethodDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Canonical selector assembled from the pattern (`at:put:` form).
    pub selector: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}
