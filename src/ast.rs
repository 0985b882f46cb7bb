//! Abstract Syntax Tree definitions for the kernel language

use serde::{Deserialize, Serialize};

/// A complete translation unit consisting of function definitions
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationUnit {
    pub functions: Vec<Function>,
}

impl TranslationUnit {
    /// Find a function by name
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// A function definition
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub return_type: TypeSpec,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

/// A function parameter
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: TypeSpec,
}

/// Scalar base types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarType {
    Void,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
}

impl ScalarType {
    /// Storage width in bytes
    pub fn width_bytes(self) -> u32 {
        match self {
            ScalarType::Void => 0,
            ScalarType::Char => 1,
            ScalarType::Short => 2,
            ScalarType::Int | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::Double => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ScalarType::Char | ScalarType::Short | ScalarType::Int | ScalarType::Long
        )
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScalarType::Void => "void",
            ScalarType::Char => "char",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        };
        f.write_str(name)
    }
}

/// A declared type: `const int* A`, `int A[][10]`, `long n`
#[derive(Debug, Clone, PartialEq)]
pub struct TypeSpec {
    pub scalar: ScalarType,
    pub unsigned: bool,
    /// Number of `*` declarators
    pub pointer_depth: usize,
    /// Array declarators in source order; `None` for `[]`
    pub extents: Vec<Option<i64>>,
}

impl TypeSpec {
    pub fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            unsigned: false,
            pointer_depth: 0,
            extents: Vec::new(),
        }
    }

    /// True for pointer or array types
    pub fn is_array_like(&self) -> bool {
        self.pointer_depth > 0 || !self.extents.is_empty()
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// Counted loop: `for (int i = 0; i < N; i++) { ... }`
    For(ForLoop),

    /// Assignment: `target op= value`
    Assign {
        target: Expr,
        op: AssignOp,
        value: Expr,
    },

    /// Local declaration: `int a_idx = i * n + k;`
    Decl {
        ty: TypeSpec,
        name: String,
        init: Option<Expr>,
    },

    /// Nested block: `{ ... }`
    Block(Vec<Stmt>),
}

/// A `for` loop header and body
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub var: String,
    pub start: Expr,
    pub cond: LoopCond,
    pub limit: Expr,
    pub step: Expr,
    pub body: Vec<Stmt>,
}

/// Comparison in a loop condition (`var < limit` or `var <= limit`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCond {
    Less,
    LessEqual,
}

/// Assignment operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl AssignOp {
    /// Arithmetic operator applied by a compound assignment
    pub fn binary(self) -> Option<BinOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
            AssignOp::Rem => Some(BinOp::Rem),
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::BitAnd => "&",
            BinOp::BitOr => "|",
            BinOp::BitXor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    /// The four operators the PIM datapath implements
    pub fn is_supported_arithmetic(self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div)
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
        }
    }
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Integer literal
    Integer(i64),

    /// Floating literal
    Float(f64),

    /// Variable reference
    Variable(String),

    /// Subscript: `base[index]`
    Index(Box<Expr>, Box<Expr>),

    /// Binary operation
    Binary(BinOp, Box<Expr>, Box<Expr>),

    /// Unary operation
    Unary(UnaryOp, Box<Expr>),

    /// Function call: `f(a, b)`
    Call { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn index(base: Expr, index: Expr) -> Self {
        Expr::Index(Box::new(base), Box::new(index))
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Integer(n) => write!(f, "{}", n),
            Expr::Float(n) => write!(f, "{}", n),
            Expr::Variable(name) => write!(f, "{}", name),
            Expr::Index(base, index) => write!(f, "{}[{}]", base, index),
            Expr::Binary(op, l, r) => write!(f, "({} {} {})", l, op, r),
            Expr::Unary(op, e) => write!(f, "{}{}", op.symbol(), e),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
