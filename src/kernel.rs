//! Loop-nest IR for one kernel function
//!
//! This is what the analyzer hands to the memory mapper: the array operands in
//! declaration order, scalar parameters with their compile-time values, and a
//! sequence of perfect loop nests whose bodies are assignment statements over
//! array accesses.
//!
//! Value expressions, statements and nests are generic over the access type so
//! the mapper can rewrite every `Access` into a resolved address expression
//! without duplicating the tree shapes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::{BinOp, UnaryOp};

/// An array operand of the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayOperand {
    pub name: String,
    pub element_width_bytes: u32,
    /// 1 for pointers and `T a[N]`, 2 for `T a[M][N]`
    pub dimensionality: usize,
    /// Declared extents in source order; empty for pointers, `None` for `[]`
    pub declared_extents: Vec<Option<u64>>,
}

impl ArrayOperand {
    /// Elements per row of a 2-D operand
    pub fn row_length(&self) -> Option<u64> {
        if self.dimensionality == 2 {
            self.declared_extents.get(1).copied().flatten()
        } else {
            None
        }
    }

    /// Total element count when every extent is known
    pub fn element_count(&self) -> Option<u64> {
        if self.declared_extents.is_empty() {
            return None;
        }
        self.declared_extents
            .iter()
            .try_fold(1u64, |acc, e| e.and_then(|e| acc.checked_mul(e)))
    }
}

impl fmt::Display for ArrayOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}-byte elements", self.name, self.element_width_bytes)?;
        if self.declared_extents.is_empty() {
            return write!(f, ", pointer");
        }
        write!(f, ", extents ")?;
        for extent in &self.declared_extents {
            match extent {
                Some(n) => write!(f, "[{}]", n)?,
                None => write!(f, "[]")?,
            }
        }
        Ok(())
    }
}

/// A scalar parameter; `value` is set when the caller binds it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarParam {
    pub name: String,
    pub value: Option<i64>,
}

/// Value of a bound scalar, if any
pub fn scalar_value(scalars: &[ScalarParam], name: &str) -> Option<i64> {
    scalars.iter().find(|s| s.name == name).and_then(|s| s.value)
}

/// One level of a rectangular loop nest: `for (iv = 0; iv < bound; iv += stride)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopLevel {
    pub induction_var: String,
    /// Exclusive upper bound
    pub bound: u64,
    pub stride: u64,
}

impl LoopLevel {
    pub fn new(induction_var: impl Into<String>, bound: u64, stride: u64) -> Self {
        Self {
            induction_var: induction_var.into(),
            bound,
            stride,
        }
    }

    /// Number of iterations executed by this level
    pub fn trip_count(&self) -> u64 {
        if self.stride == 0 {
            return 0;
        }
        self.bound.div_ceil(self.stride)
    }

    /// Value of the induction variable in the last iteration
    pub fn last_value(&self) -> u64 {
        self.trip_count().saturating_sub(1) * self.stride
    }
}

/// An array access, in whichever indexing style the source used
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// `A[i][k]` on a 2-D operand
    MultiDim { operand: String, indices: Vec<IndexExpr> },
    /// `A[i * K + k]` on a pointer or 1-D operand
    Linear { operand: String, index: IndexExpr },
}

impl Access {
    pub fn operand(&self) -> &str {
        match self {
            Access::MultiDim { operand, .. } | Access::Linear { operand, .. } => operand,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::MultiDim { operand, indices } => {
                write!(f, "{}", operand)?;
                for index in indices {
                    write!(f, "[{}]", index)?;
                }
                Ok(())
            }
            Access::Linear { operand, index } => write!(f, "{}[{}]", operand, index),
        }
    }
}

/// Subscript expression, before affine normalization
#[derive(Debug, Clone, PartialEq)]
pub enum IndexExpr {
    Const(i64),
    Induction(String),
    Param(String),
    /// Data-dependent index such as `A[idx[i]]`
    Read(Box<Access>),
    Binary(BinOp, Box<IndexExpr>, Box<IndexExpr>),
    Neg(Box<IndexExpr>),
    /// Anything else, kept as source text for diagnostics
    Opaque(String),
}

impl IndexExpr {
    pub fn binary(op: BinOp, left: IndexExpr, right: IndexExpr) -> Self {
        IndexExpr::Binary(op, Box::new(left), Box::new(right))
    }

    /// Induction variables this expression mentions
    pub fn induction_vars(&self, out: &mut Vec<String>) {
        match self {
            IndexExpr::Induction(v) => {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            IndexExpr::Binary(_, l, r) => {
                l.induction_vars(out);
                r.induction_vars(out);
            }
            IndexExpr::Neg(e) => e.induction_vars(out),
            IndexExpr::Read(access) => match access.as_ref() {
                Access::MultiDim { indices, .. } => {
                    indices.iter().for_each(|i| i.induction_vars(out))
                }
                Access::Linear { index, .. } => index.induction_vars(out),
            },
            IndexExpr::Const(_) | IndexExpr::Param(_) | IndexExpr::Opaque(_) => {}
        }
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Const(n) => write!(f, "{}", n),
            IndexExpr::Induction(v) | IndexExpr::Param(v) => write!(f, "{}", v),
            IndexExpr::Read(access) => write!(f, "{}", access),
            IndexExpr::Binary(op, l, r) => {
                write_operand(f, l, matches!(**l, IndexExpr::Binary(..)))?;
                write!(f, " {} ", op)?;
                write_operand(f, r, matches!(**r, IndexExpr::Binary(..)))
            }
            IndexExpr::Neg(e) => write!(f, "-{}", e),
            IndexExpr::Opaque(text) => write!(f, "{}", text),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, e: &impl fmt::Display, nested: bool) -> fmt::Result {
    if nested {
        write!(f, "({})", e)
    } else {
        write!(f, "{}", e)
    }
}

/// Right-hand side of a statement
#[derive(Debug, Clone, PartialEq)]
pub enum ValueExpr<A = Access> {
    Const(i64),
    Induction(String),
    Param(String),
    Read(A),
    Binary(BinOp, Box<ValueExpr<A>>, Box<ValueExpr<A>>),
    Unary(UnaryOp, Box<ValueExpr<A>>),
}

impl<A> ValueExpr<A> {
    pub fn binary(op: BinOp, left: ValueExpr<A>, right: ValueExpr<A>) -> Self {
        ValueExpr::Binary(op, Box::new(left), Box::new(right))
    }

    /// Accesses read by this expression, left to right
    pub fn reads(&self) -> Vec<&A> {
        let mut out = Vec::new();
        self.collect_reads(&mut out);
        out
    }

    fn collect_reads<'a>(&'a self, out: &mut Vec<&'a A>) {
        match self {
            ValueExpr::Read(a) => out.push(a),
            ValueExpr::Binary(_, l, r) => {
                l.collect_reads(out);
                r.collect_reads(out);
            }
            ValueExpr::Unary(_, e) => e.collect_reads(out),
            ValueExpr::Const(_) | ValueExpr::Induction(_) | ValueExpr::Param(_) => {}
        }
    }

    /// Rewrite every access, keeping the tree shape
    pub fn try_map<B, E>(
        &self,
        f: &mut impl FnMut(&A) -> Result<B, E>,
    ) -> Result<ValueExpr<B>, E> {
        Ok(match self {
            ValueExpr::Const(n) => ValueExpr::Const(*n),
            ValueExpr::Induction(v) => ValueExpr::Induction(v.clone()),
            ValueExpr::Param(p) => ValueExpr::Param(p.clone()),
            ValueExpr::Read(a) => ValueExpr::Read(f(a)?),
            ValueExpr::Binary(op, l, r) => {
                ValueExpr::binary(*op, l.try_map(f)?, r.try_map(f)?)
            }
            ValueExpr::Unary(op, e) => ValueExpr::Unary(*op, Box::new(e.try_map(f)?)),
        })
    }
}

impl<A: fmt::Display> fmt::Display for ValueExpr<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueExpr::Const(n) => write!(f, "{}", n),
            ValueExpr::Induction(v) | ValueExpr::Param(v) => write!(f, "{}", v),
            ValueExpr::Read(a) => write!(f, "{}", a),
            ValueExpr::Binary(op, l, r) => {
                write_operand(f, l, matches!(**l, ValueExpr::Binary(..)))?;
                write!(f, " {} ", op)?;
                write_operand(f, r, matches!(**r, ValueExpr::Binary(..)))
            }
            ValueExpr::Unary(op, e) => {
                write!(f, "{}", op.symbol())?;
                write_operand(f, e, matches!(**e, ValueExpr::Binary(..)))
            }
        }
    }
}

/// How a statement combines its value with the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `X = e`
    Assign,
    /// `X op= e`, also recognized from `X = X op e`
    Accumulate(BinOp),
}

/// One assignment in a nest body
#[derive(Debug, Clone, PartialEq)]
pub struct Statement<A = Access> {
    pub target: A,
    pub kind: StoreKind,
    pub value: ValueExpr<A>,
}

impl<A> Statement<A> {
    /// Every access in the statement: target first, then reads in order
    pub fn accesses(&self) -> Vec<&A> {
        let mut out = vec![&self.target];
        out.extend(self.value.reads());
        out
    }
}

impl<A: fmt::Display> fmt::Display for Statement<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StoreKind::Assign => write!(f, "{} = {}", self.target, self.value),
            StoreKind::Accumulate(op) => write!(f, "{} {}= {}", self.target, op, self.value),
        }
    }
}

/// A perfect loop nest: all statements sit in the innermost body
#[derive(Debug, Clone, PartialEq)]
pub struct LoopNest<A = Access> {
    /// Outermost first
    pub levels: Vec<LoopLevel>,
    pub body: Vec<Statement<A>>,
}

impl<A> LoopNest<A> {
    /// Index of the level driven by `var`
    pub fn level_of(&self, var: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.induction_var == var)
    }

    /// Number of points in the iteration domain
    pub fn iteration_count(&self) -> u64 {
        self.levels.iter().map(LoopLevel::trip_count).product()
    }
}

impl<A: fmt::Display> fmt::Display for LoopNest<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut indent = 4;
        for level in &self.levels {
            writeln!(
                f,
                "{:indent$}for {} in 0..{} step {}",
                "",
                level.induction_var,
                level.bound,
                level.stride,
                indent = indent
            )?;
            indent += 2;
        }
        for stmt in &self.body {
            writeln!(f, "{:indent$}{}", "", stmt, indent = indent)?;
        }
        Ok(())
    }
}

/// A kernel function lowered to loop nests
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub name: String,
    /// Declaration order
    pub operands: Vec<ArrayOperand>,
    pub scalars: Vec<ScalarParam>,
    /// Source order
    pub nests: Vec<LoopNest>,
}

impl Kernel {
    pub fn operand(&self, name: &str) -> Option<&ArrayOperand> {
        self.operands.iter().find(|o| o.name == name)
    }

    pub fn scalar_value(&self, name: &str) -> Option<i64> {
        scalar_value(&self.scalars, name)
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {}", self.name)?;
        for operand in &self.operands {
            writeln!(f, "  array {}", operand)?;
        }
        for scalar in &self.scalars {
            match scalar.value {
                Some(v) => writeln!(f, "  scalar {} = {}", scalar.name, v)?,
                None => writeln!(f, "  scalar {} (unbound)", scalar.name)?,
            }
        }
        for (i, nest) in self.nests.iter().enumerate() {
            writeln!(f, "  nest {}:", i)?;
            write!(f, "{}", nest)?;
        }
        Ok(())
    }
}
