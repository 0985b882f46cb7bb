//! Kernel analyzer
//!
//! Lowers one function of the translation unit into the loop-nest IR:
//! classifies parameters into array operands and scalars, checks loop headers
//! are rectangular with compile-time bounds, substitutes index aliases, and
//! distributes imperfect nests into a sequence of perfect ones.

use std::collections::{BTreeMap, HashMap};

use crate::affine;
use crate::ast::{AssignOp, BinOp, Expr, ForLoop, Function, LoopCond, Param, Stmt, TranslationUnit, UnaryOp};
use crate::context::CompilationContext;
use crate::error::{CompileError, CompileResult};
use crate::kernel::{
    Access, ArrayOperand, IndexExpr, Kernel, LoopLevel, LoopNest, ScalarParam, Statement,
    StoreKind, ValueExpr,
};

/// Analyzer for lowering a kernel function to loop nests
pub struct Analyzer {
    /// Compile-time values for scalar parameters
    bindings: BTreeMap<String, i64>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    /// Give a scalar parameter a compile-time value
    pub fn bind_scalar(&mut self, name: &str, value: i64) {
        self.bindings.insert(name.to_string(), value);
    }

    /// Lower the named function (or the first one) into a kernel
    pub fn analyze(
        &self,
        unit: &TranslationUnit,
        kernel: Option<&str>,
        ctx: &mut CompilationContext,
    ) -> CompileResult<Kernel> {
        let function = match kernel {
            Some(name) => unit.function(name).ok_or_else(|| {
                CompileError::invalid_kernel(format!("no function named `{}`", name))
            })?,
            None => unit
                .functions
                .first()
                .ok_or_else(|| CompileError::invalid_kernel("translation unit has no functions"))?,
        };
        if unit.functions.len() > 1 {
            log::info!(
                "compiling `{}`; {} other function(s) ignored",
                function.name,
                unit.functions.len() - 1
            );
        }

        let mut lowering = Lowering::new(ctx.config.max_loop_depth);
        lowering.declare_params(function, &self.bindings)?;

        for name in self.bindings.keys() {
            if !lowering.scalars.iter().any(|s| &s.name == name) {
                ctx.warn(format!(
                    "binding for `{}` ignored: `{}` has no scalar parameter of that name",
                    name, function.name
                ));
            }
        }

        let mut nests = Vec::new();
        let mut levels = Vec::new();
        lowering.lower_block(&function.body, &mut levels, &mut nests, ctx)?;

        let kernel = Kernel {
            name: function.name.clone(),
            operands: lowering.operands,
            scalars: lowering.scalars,
            nests,
        };
        log::debug!("kernel IR:\n{}", kernel);
        Ok(kernel)
    }
}

/// A local scalar: its initializer is substituted at every use
#[derive(Debug, Clone)]
enum Local {
    Alias(Expr),
    Uninitialized,
}

/// Lowering state for one function
struct Lowering {
    operands: Vec<ArrayOperand>,
    scalars: Vec<ScalarParam>,
    locals: HashMap<String, Local>,
    /// Induction variables of the enclosing loops, outermost first
    ivs: Vec<String>,
    max_depth: usize,
}

impl Lowering {
    fn new(max_depth: usize) -> Self {
        Self {
            operands: Vec::new(),
            scalars: Vec::new(),
            locals: HashMap::new(),
            ivs: Vec::new(),
            max_depth,
        }
    }

    fn is_declared(&self, name: &str) -> bool {
        self.operands.iter().any(|o| o.name == name)
            || self.scalars.iter().any(|s| s.name == name)
            || self.locals.contains_key(name)
            || self.ivs.iter().any(|v| v == name)
    }

    fn operand(&self, name: &str) -> Option<&ArrayOperand> {
        self.operands.iter().find(|o| o.name == name)
    }

    fn scalar(&self, name: &str) -> Option<&ScalarParam> {
        self.scalars.iter().find(|s| s.name == name)
    }

    fn declare_params(
        &mut self,
        function: &Function,
        bindings: &BTreeMap<String, i64>,
    ) -> CompileResult<()> {
        for param in &function.params {
            if self.is_declared(&param.name) {
                return Err(CompileError::invalid_kernel(format!(
                    "parameter `{}` is declared twice",
                    param.name
                )));
            }
            if param.ty.is_array_like() {
                let operand = array_operand(param)?;
                self.operands.push(operand);
            } else {
                if !param.ty.scalar.is_integer() {
                    return Err(CompileError::invalid_kernel(format!(
                        "scalar parameter `{}` must have an integer type, found `{}`",
                        param.name, param.ty.scalar
                    )));
                }
                self.scalars.push(ScalarParam {
                    name: param.name.clone(),
                    value: bindings.get(&param.name).copied(),
                });
            }
        }
        Ok(())
    }

    /// Lower a statement list at the given nesting
    ///
    /// Consecutive assignments share one nest; every loop contributes its own
    /// nests. When that splits the body of an enclosing loop, the split must
    /// be legal to distribute.
    fn lower_block(
        &mut self,
        stmts: &[Stmt],
        levels: &mut Vec<LoopLevel>,
        out: &mut Vec<LoopNest>,
        ctx: &mut CompilationContext,
    ) -> CompileResult<()> {
        let saved_locals = self.locals.clone();
        let start = out.len();
        let mut pieces = 0;
        let mut pending = Vec::new();

        for stmt in stmts {
            match stmt {
                Stmt::Decl { ty, name, init } => {
                    if ty.is_array_like() {
                        return Err(CompileError::invalid_kernel(format!(
                            "local array `{}` is not supported; pass it as a parameter",
                            name
                        )));
                    }
                    if !ty.scalar.is_integer() {
                        return Err(CompileError::invalid_kernel(format!(
                            "local `{}` must have an integer type, found `{}`",
                            name, ty.scalar
                        )));
                    }
                    if self.is_declared(name) {
                        return Err(CompileError::invalid_kernel(format!(
                            "`{}` is already declared",
                            name
                        )));
                    }
                    let local = match init {
                        Some(expr) => Local::Alias(expr.clone()),
                        None => Local::Uninitialized,
                    };
                    self.locals.insert(name.clone(), local);
                }
                Stmt::Assign { target, op, value } => {
                    pending.push(self.lower_assign(target, *op, value)?);
                }
                Stmt::Block(inner) => {
                    pieces += flush(&mut pending, levels, out);
                    let before = out.len();
                    self.lower_block(inner, levels, out, ctx)?;
                    pieces += usize::from(out.len() > before);
                }
                Stmt::For(l) => {
                    pieces += flush(&mut pending, levels, out);
                    let before = out.len();
                    self.lower_loop(l, levels, out, ctx)?;
                    pieces += usize::from(out.len() > before);
                }
            }
        }
        pieces += flush(&mut pending, levels, out);
        self.locals = saved_locals;

        if pieces > 1 && !levels.is_empty() {
            self.check_distribution(&out[start..], levels)?;
        }
        Ok(())
    }

    fn lower_loop(
        &mut self,
        l: &ForLoop,
        levels: &mut Vec<LoopLevel>,
        out: &mut Vec<LoopNest>,
        ctx: &mut CompilationContext,
    ) -> CompileResult<()> {
        if self.is_declared(&l.var) {
            return Err(CompileError::invalid_kernel(format!(
                "loop variable `{}` shadows an existing name",
                l.var
            )));
        }

        let start = self.fold_header(&l.var, &l.start)?;
        if start != 0 {
            return Err(CompileError::invalid_kernel(format!(
                "loop `{}` must start at 0, starts at {}",
                l.var, start
            )));
        }

        let step = self.fold_header(&l.var, &l.step)?;
        if step <= 0 {
            return Err(CompileError::invalid_kernel(format!(
                "loop `{}` must count upwards by a positive step, found {}",
                l.var, step
            )));
        }

        let mut limit = self.fold_header(&l.var, &l.limit)?;
        if l.cond == LoopCond::LessEqual {
            limit = limit.checked_add(1).ok_or_else(|| {
                CompileError::invalid_kernel(format!("bound of loop `{}` overflows", l.var))
            })?;
        }
        if limit <= 0 {
            ctx.warn(format!(
                "loop `{}` never executes (bound {}); dropped",
                l.var, limit
            ));
            return Ok(());
        }

        if levels.len() >= self.max_depth {
            return Err(CompileError::invalid_kernel(format!(
                "loop nest deeper than {} levels",
                self.max_depth
            )));
        }

        // Positive i64 values always fit u64
        levels.push(LoopLevel::new(l.var.clone(), limit as u64, step as u64));
        self.ivs.push(l.var.clone());
        let result = self.lower_block(&l.body, levels, out, ctx);
        self.ivs.pop();
        levels.pop();
        result
    }

    /// Fold a loop-header expression to a compile-time constant
    fn fold_header(&self, var: &str, expr: &Expr) -> CompileResult<i64> {
        let overflow = || CompileError::invalid_kernel(format!("header of loop `{}` overflows", var));
        match expr {
            Expr::Integer(n) => Ok(*n),
            Expr::Variable(name) => {
                if let Some(scalar) = self.scalar(name) {
                    return scalar.value.ok_or_else(|| {
                        CompileError::invalid_kernel(format!(
                            "bound of loop `{}` depends on scalar parameter `{}`, which has no \
                             compile-time value; runtime-variable bounds are not supported, \
                             bind `{}` to a value",
                            var, name, name
                        ))
                    });
                }
                if self.ivs.iter().any(|v| v == name) {
                    return Err(CompileError::invalid_kernel(format!(
                        "bound of loop `{}` depends on induction variable `{}`; \
                         only rectangular nests are supported",
                        var, name
                    )));
                }
                match self.locals.get(name) {
                    Some(Local::Alias(init)) => self.fold_header(var, init),
                    Some(Local::Uninitialized) => Err(CompileError::invalid_kernel(format!(
                        "local `{}` is used before it has a value",
                        name
                    ))),
                    None => Err(CompileError::unbound(name.clone())),
                }
            }
            Expr::Binary(op, l, r) => {
                let l = self.fold_header(var, l)?;
                let r = self.fold_header(var, r)?;
                match op {
                    BinOp::Add => l.checked_add(r).ok_or_else(overflow),
                    BinOp::Sub => l.checked_sub(r).ok_or_else(overflow),
                    BinOp::Mul => l.checked_mul(r).ok_or_else(overflow),
                    BinOp::Div if r != 0 => l.checked_div(r).ok_or_else(overflow),
                    BinOp::Rem if r != 0 => l.checked_rem(r).ok_or_else(overflow),
                    _ => Err(CompileError::invalid_kernel(format!(
                        "cannot evaluate `{}` in the header of loop `{}`",
                        expr, var
                    ))),
                }
            }
            Expr::Unary(UnaryOp::Neg, e) => self.fold_header(var, e)?.checked_neg().ok_or_else(overflow),
            _ => Err(CompileError::invalid_kernel(format!(
                "header of loop `{}` must be a compile-time integer, found `{}`",
                var, expr
            ))),
        }
    }

    fn lower_assign(&self, target: &Expr, op: AssignOp, value: &Expr) -> CompileResult<Statement> {
        let target = match target {
            Expr::Index(..) => self.lower_access(target)?,
            Expr::Variable(name) => {
                let message = if self.locals.contains_key(name) {
                    format!("local `{}` cannot be reassigned; scalar accumulators are not supported", name)
                } else if self.scalar(name).is_some() {
                    format!("cannot assign to scalar parameter `{}`", name)
                } else if self.ivs.iter().any(|v| v == name) {
                    format!("loop variable `{}` is modified in the loop body", name)
                } else if self.operand(name).is_some() {
                    format!("array `{}` assigned without a subscript", name)
                } else {
                    return Err(CompileError::unbound(name.clone()));
                };
                return Err(CompileError::invalid_kernel(message));
            }
            other => {
                return Err(CompileError::invalid_kernel(format!(
                    "`{}` is not assignable",
                    other
                )))
            }
        };

        if let Some(binary) = op.binary() {
            return Ok(Statement {
                target,
                kind: StoreKind::Accumulate(binary),
                value: self.lower_value(value)?,
            });
        }

        // Recognize `X = X op e`, and `X = e op X` for commutative operators
        if let Expr::Binary(binary, l, r) = value {
            if binary.is_supported_arithmetic() {
                if self.is_same_access(l, &target) {
                    return Ok(Statement {
                        target,
                        kind: StoreKind::Accumulate(*binary),
                        value: self.lower_value(r)?,
                    });
                }
                if matches!(binary, BinOp::Add | BinOp::Mul) && self.is_same_access(r, &target) {
                    return Ok(Statement {
                        target,
                        kind: StoreKind::Accumulate(*binary),
                        value: self.lower_value(l)?,
                    });
                }
            }
        }

        Ok(Statement {
            target,
            kind: StoreKind::Assign,
            value: self.lower_value(value)?,
        })
    }

    fn is_same_access(&self, expr: &Expr, target: &Access) -> bool {
        matches!(expr, Expr::Index(..))
            && self.lower_access(expr).map_or(false, |a| &a == target)
    }

    /// Lower a subscript chain `A[e1][e2]`
    fn lower_access(&self, expr: &Expr) -> CompileResult<Access> {
        let mut subscripts = Vec::new();
        let mut base = expr;
        while let Expr::Index(inner, index) = base {
            subscripts.push(index.as_ref());
            base = inner.as_ref();
        }
        subscripts.reverse();

        let name = match base {
            Expr::Variable(name) => name,
            other => {
                return Err(CompileError::invalid_kernel(format!(
                    "`{}` cannot be subscripted",
                    other
                )))
            }
        };
        let Some(operand) = self.operand(name) else {
            if self.is_declared(name) {
                return Err(CompileError::invalid_kernel(format!(
                    "`{}` is not an array",
                    name
                )));
            }
            return Err(CompileError::unbound(name.clone()));
        };

        let mut indices = subscripts
            .into_iter()
            .map(|s| self.lower_index(s))
            .collect::<CompileResult<Vec<_>>>()?;

        match (operand.dimensionality, indices.len()) {
            (2, 2) => Ok(Access::MultiDim {
                operand: name.clone(),
                indices,
            }),
            (1, 1) => Ok(Access::Linear {
                operand: name.clone(),
                index: indices.remove(0),
            }),
            (2, 1) => Err(CompileError::invalid_kernel(format!(
                "2-D operand `{}` indexed with a single subscript",
                name
            ))),
            (dims, n) => Err(CompileError::invalid_kernel(format!(
                "`{}` has {} dimension(s) but is indexed with {} subscript(s)",
                name, dims, n
            ))),
        }
    }

    fn lower_index(&self, expr: &Expr) -> CompileResult<IndexExpr> {
        match expr {
            Expr::Integer(n) => Ok(IndexExpr::Const(*n)),
            Expr::Variable(name) => {
                if self.ivs.iter().any(|v| v == name) {
                    return Ok(IndexExpr::Induction(name.clone()));
                }
                if self.scalar(name).is_some() {
                    return Ok(IndexExpr::Param(name.clone()));
                }
                match self.locals.get(name) {
                    Some(Local::Alias(init)) => self.lower_index(init),
                    Some(Local::Uninitialized) => Err(CompileError::invalid_kernel(format!(
                        "local `{}` is used before it has a value",
                        name
                    ))),
                    None if self.operand(name).is_some() => Err(CompileError::invalid_kernel(
                        format!("array `{}` used without a subscript", name),
                    )),
                    None => Err(CompileError::unbound(name.clone())),
                }
            }
            Expr::Index(..) => Ok(IndexExpr::Read(Box::new(self.lower_access(expr)?))),
            Expr::Binary(op, l, r) => Ok(IndexExpr::binary(
                *op,
                self.lower_index(l)?,
                self.lower_index(r)?,
            )),
            Expr::Unary(UnaryOp::Neg, e) => Ok(IndexExpr::Neg(Box::new(self.lower_index(e)?))),
            other => Ok(IndexExpr::Opaque(other.to_string())),
        }
    }

    fn lower_value(&self, expr: &Expr) -> CompileResult<ValueExpr> {
        match expr {
            Expr::Integer(n) => Ok(ValueExpr::Const(*n)),
            Expr::Float(n) => Err(CompileError::unsupported_expr(format!(
                "floating-point literal `{}`; the PIM datapath is integer-only",
                n
            ))),
            Expr::Variable(name) => {
                if self.ivs.iter().any(|v| v == name) {
                    return Ok(ValueExpr::Induction(name.clone()));
                }
                if self.scalar(name).is_some() {
                    return Ok(ValueExpr::Param(name.clone()));
                }
                match self.locals.get(name) {
                    Some(Local::Alias(init)) => self.lower_value(init),
                    Some(Local::Uninitialized) => Err(CompileError::invalid_kernel(format!(
                        "local `{}` is used before it has a value",
                        name
                    ))),
                    None if self.operand(name).is_some() => Err(CompileError::invalid_kernel(
                        format!("array `{}` used without a subscript", name),
                    )),
                    None => Err(CompileError::unbound(name.clone())),
                }
            }
            Expr::Index(..) => Ok(ValueExpr::Read(self.lower_access(expr)?)),
            Expr::Binary(op, l, r) => Ok(ValueExpr::binary(
                *op,
                self.lower_value(l)?,
                self.lower_value(r)?,
            )),
            Expr::Unary(op, e) => Ok(ValueExpr::Unary(*op, Box::new(self.lower_value(e)?))),
            Expr::Call { name, .. } => Err(CompileError::unsupported_expr(format!(
                "call to `{}`; kernels cannot call functions",
                name
            ))),
        }
    }

    /// Check that running `nests` one after another matches running them
    /// interleaved under the shared `levels`
    ///
    /// Every operand written in the group and touched by more than one of its
    /// nests must be accessed through one index that is injective over the
    /// shared levels, so each shared iteration owns its element.
    fn check_distribution(&self, nests: &[LoopNest], levels: &[LoopLevel]) -> CompileResult<()> {
        let mut touched: BTreeMap<&str, Vec<(usize, &Access)>> = BTreeMap::new();
        let mut written: Vec<&str> = Vec::new();
        for (n, nest) in nests.iter().enumerate() {
            for stmt in &nest.body {
                written.push(stmt.target.operand());
                for access in all_accesses(stmt) {
                    touched.entry(access.operand()).or_default().push((n, access));
                }
            }
        }

        let shared = levels
            .iter()
            .map(|l| l.induction_var.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        for name in written {
            let Some(accesses) = touched.get(name) else {
                continue;
            };
            let first_nest = accesses[0].0;
            if accesses.iter().all(|(n, _)| *n == first_nest) {
                continue;
            }

            let (_, first) = accesses[0];
            let form = affine::flatten(first, &self.operands, &self.scalars)?;
            for (_, access) in &accesses[1..] {
                if affine::flatten(access, &self.operands, &self.scalars)? != form {
                    return Err(CompileError::invalid_kernel(format!(
                        "cannot split the body of loops ({}): `{}` is accessed as both `{}` and `{}`",
                        shared, name, first, access
                    )));
                }
            }

            if !injective_over(&form, levels) {
                return Err(CompileError::invalid_kernel(format!(
                    "cannot split the body of loops ({}): `{}` does not select one element per \
                     iteration of the shared loops",
                    shared, first
                )));
            }
        }
        Ok(())
    }
}

/// Move pending statements into a nest at the current depth
fn flush(pending: &mut Vec<Statement>, levels: &[LoopLevel], out: &mut Vec<LoopNest>) -> usize {
    if pending.is_empty() {
        return 0;
    }
    out.push(LoopNest {
        levels: levels.to_vec(),
        body: std::mem::take(pending),
    });
    1
}

/// Accesses of a statement, including those nested in subscripts
fn all_accesses(stmt: &Statement) -> Vec<&Access> {
    fn nested<'a>(access: &'a Access, out: &mut Vec<&'a Access>) {
        out.push(access);
        let indices: Vec<&IndexExpr> = match access {
            Access::MultiDim { indices, .. } => indices.iter().collect(),
            Access::Linear { index, .. } => vec![index],
        };
        for index in indices {
            reads_in(index, out);
        }
    }
    fn reads_in<'a>(index: &'a IndexExpr, out: &mut Vec<&'a Access>) {
        match index {
            IndexExpr::Read(access) => nested(access, out),
            IndexExpr::Binary(_, l, r) => {
                reads_in(l, out);
                reads_in(r, out);
            }
            IndexExpr::Neg(e) => reads_in(e, out),
            _ => {}
        }
    }

    let mut out = Vec::new();
    for access in stmt.accesses() {
        nested(access, &mut out);
    }
    out
}

/// True when distinct points of `levels` map to distinct values of `form`
///
/// Uses only the shared levels and orders them by coefficient magnitude; each
/// coefficient must exceed the span the smaller ones can cover.
fn injective_over(form: &affine::AffineForm, levels: &[LoopLevel]) -> bool {
    if form
        .terms
        .keys()
        .any(|v| !levels.iter().any(|l| &l.induction_var == v))
    {
        return false;
    }

    let mut steps = Vec::new();
    for level in levels.iter().filter(|l| l.trip_count() > 1) {
        let per_iteration = form
            .coefficient(&level.induction_var)
            .unsigned_abs()
            .saturating_mul(level.stride);
        if per_iteration == 0 {
            return false;
        }
        steps.push((per_iteration, level.trip_count()));
    }
    steps.sort_unstable();

    let mut span: u64 = 0;
    for (step, trips) in steps {
        if step <= span {
            return false;
        }
        span = span.saturating_add(step.saturating_mul(trips - 1));
    }
    true
}

/// Build the operand description of an array parameter
fn array_operand(param: &Param) -> CompileResult<ArrayOperand> {
    let ty = &param.ty;
    let name = &param.name;

    if !ty.scalar.is_integer() {
        return Err(CompileError::invalid_kernel(format!(
            "operand `{}` has element type `{}`; the PIM datapath is integer-only",
            name, ty.scalar
        )));
    }
    if ty.unsigned {
        return Err(CompileError::invalid_kernel(format!(
            "operand `{}` is unsigned; only signed elements are supported",
            name
        )));
    }
    if ty.pointer_depth > 1 || (ty.pointer_depth == 1 && !ty.extents.is_empty()) {
        return Err(CompileError::invalid_kernel(format!(
            "operand `{}` has an indirect type; use `T*` or `T name[M][N]`",
            name
        )));
    }
    if ty.extents.len() > 2 {
        return Err(CompileError::invalid_kernel(format!(
            "operand `{}` has {} dimensions; at most 2 are supported",
            name,
            ty.extents.len()
        )));
    }

    let mut declared_extents = Vec::with_capacity(ty.extents.len());
    for extent in &ty.extents {
        match extent {
            Some(n) if *n <= 0 => {
                return Err(CompileError::invalid_kernel(format!(
                    "operand `{}` has a non-positive extent {}",
                    name, n
                )))
            }
            Some(n) => declared_extents.push(Some(*n as u64)),
            None => declared_extents.push(None),
        }
    }

    let dimensionality = ty.extents.len().max(1);
    if dimensionality == 2 && declared_extents[1].is_none() {
        return Err(CompileError::invalid_kernel(format!(
            "row length of 2-D operand `{}` must be declared",
            name
        )));
    }

    Ok(ArrayOperand {
        name: name.clone(),
        element_width_bytes: ty.scalar.width_bytes(),
        dimensionality,
        declared_extents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::PimConfig;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn analyze_with(source: &str, bindings: &[(&str, i64)]) -> CompileResult<Kernel> {
        let unit = Parser::new(source).parse_translation_unit()?;
        let mut analyzer = Analyzer::new();
        for (name, value) in bindings {
            analyzer.bind_scalar(name, *value);
        }
        let mut ctx = CompilationContext::new(PimConfig::default());
        analyzer.analyze(&unit, None, &mut ctx)
    }

    fn analyze(source: &str) -> Kernel {
        analyze_with(source, &[]).unwrap()
    }

    const MATMUL_2D: &str = "
        void mm(int A[2][2], int B[2][2], int C[2][2]) {
            for (int i = 0; i < 2; i++)
                for (int j = 0; j < 2; j++) {
                    C[i][j] = 0;
                    for (int k = 0; k < 2; k++)
                        C[i][j] += A[i][k] * B[k][j];
                }
        }";

    #[test]
    fn test_operands_in_declaration_order() {
        let kernel = analyze(
            "void f(int A[3][4], short* B, long C[], char D[8], int n) { }",
        );
        let names: Vec<_> = kernel.operands.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D"]);
        assert_eq!(kernel.operands[0].dimensionality, 2);
        assert_eq!(kernel.operands[1].element_width_bytes, 2);
        assert!(kernel.operands[1].declared_extents.is_empty());
        assert_eq!(kernel.operands[2].element_width_bytes, 8);
        assert_eq!(kernel.operands[3].declared_extents, vec![Some(8)]);
        assert_eq!(kernel.scalars, vec![ScalarParam { name: "n".to_string(), value: None }]);
    }

    #[test]
    fn test_imperfect_matmul_is_distributed() {
        let kernel = analyze(MATMUL_2D);
        assert_eq!(kernel.nests.len(), 2);

        let init = &kernel.nests[0];
        assert_eq!(init.levels.len(), 2);
        assert_eq!(init.body[0].kind, StoreKind::Assign);
        assert_eq!(init.body[0].value, ValueExpr::Const(0));

        let acc = &kernel.nests[1];
        let vars: Vec<_> = acc.levels.iter().map(|l| l.induction_var.as_str()).collect();
        assert_eq!(vars, vec!["i", "j", "k"]);
        assert_eq!(acc.body[0].kind, StoreKind::Accumulate(BinOp::Add));
    }

    #[test]
    fn test_explicit_accumulation_form() {
        let kernel = analyze(
            "void f(int* A, int* C) {
                for (int i = 0; i < 4; i++) C[0] = A[i] + C[0];
            }",
        );
        let stmt = &kernel.nests[0].body[0];
        assert_eq!(stmt.kind, StoreKind::Accumulate(BinOp::Add));
        assert!(matches!(stmt.value, ValueExpr::Read(Access::Linear { .. })));
    }

    #[test]
    fn test_bound_scalars_and_aliases() {
        let kernel = analyze_with(
            "void mm(int* A, int* B, int* C, int rows, int cols, int common) {
                for (int i = 0; i < rows; i++)
                    for (int j = 0; j < cols; j++) {
                        int c_idx = i * cols + j;
                        C[c_idx] = 0;
                        for (int k = 0; k < common; k++)
                            C[c_idx] += A[i * common + k] * B[k * cols + j];
                    }
            }",
            &[("rows", 3), ("cols", 4), ("common", 2)],
        )
        .unwrap();

        let bounds: Vec<_> = kernel.nests[1].levels.iter().map(|l| l.bound).collect();
        assert_eq!(bounds, vec![3, 4, 2]);
        assert_eq!(kernel.nests[1].body[0].target.to_string(), "C[(i * cols) + j]");
    }

    #[test]
    fn test_unbound_loop_bound_names_parameter() {
        let err = analyze_with(
            "void f(int* A, int n) { for (int i = 0; i < n; i++) A[i] = 0; }",
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::InvalidKernel { .. }));
        assert!(err.to_string().contains("scalar parameter `n`"));
    }

    #[test]
    fn test_inclusive_bound_and_step() {
        let kernel = analyze("void f(int* A) { for (int i = 0; i <= 9; i += 3) A[i] = 1; }");
        let level = &kernel.nests[0].levels[0];
        assert_eq!((level.bound, level.stride, level.trip_count()), (10, 3, 4));
    }

    #[test]
    fn test_zero_trip_loop_is_dropped() {
        let unit = Parser::new("void f(int* A) { for (int i = 0; i < 0; i++) A[i] = 1; }")
            .parse_translation_unit()
            .unwrap();
        let mut ctx = CompilationContext::new(PimConfig::default());
        let kernel = Analyzer::new().analyze(&unit, None, &mut ctx).unwrap();
        assert!(kernel.nests.is_empty());
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[test]
    fn test_rejections() {
        let cases = [
            ("void f(float* A) { }", "integer-only"),
            ("void f(unsigned int* A) { }", "unsigned"),
            ("void f(int A[2][2][2]) { }", "at most 2"),
            ("void f(int* A) { for (int i = 1; i < 4; i++) A[i] = 0; }", "must start at 0"),
            (
                "void f(int A[4][4]) { for (int i = 0; i < 4; i++) for (int j = 0; j < i; j++) A[i][j] = 0; }",
                "induction variable `i`",
            ),
            ("void f(int* A) { for (int i = 0; i < 4; i++) for (int i = 0; i < 4; i++) A[i] = 0; }", "shadows"),
            ("void f(int A[4][4]) { for (int i = 0; i < 4; i++) A[i] = 0; }", "single subscript"),
            ("void f(int* A) { int s = 0; for (int i = 0; i < 4; i++) s = s + A[i]; }", "cannot be reassigned"),
        ];
        for (source, needle) in cases {
            let err = analyze_with(source, &[]).unwrap_err();
            assert!(
                err.to_string().contains(needle),
                "`{}` should fail with `{}`, got `{}`",
                source,
                needle,
                err
            );
        }
    }

    #[test]
    fn test_unknown_identifier_is_unbound() {
        let err = analyze_with("void f(int* A) { for (int i = 0; i < 4; i++) Z[i] = A[i]; }", &[])
            .unwrap_err();
        assert_eq!(err, CompileError::unbound("Z"));
    }

    #[test]
    fn test_illegal_distribution_is_rejected() {
        // B[i + 1] is read before the first nest would have overwritten it
        let err = analyze_with(
            "void f(int* A, int* B, int* C) {
                for (int i = 0; i < 4; i++) {
                    B[i] = A[i];
                    for (int k = 0; k < 2; k++) C[i] += B[i + 1];
                }
            }",
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot split"));
    }

    #[test]
    fn test_unsupported_operator_is_kept_for_the_generator() {
        let kernel = analyze("void f(int* A, int* B) { for (int i = 0; i < 4; i++) A[i] = B[i] % 3; }");
        assert!(matches!(
            kernel.nests[0].body[0].value,
            ValueExpr::Binary(BinOp::Rem, _, _)
        ));
    }

    #[test]
    fn test_injectivity() {
        let levels = vec![LoopLevel::new("i", 3, 1), LoopLevel::new("j", 4, 1)];
        let row_major = affine::AffineForm {
            constant: 0,
            terms: [("i".to_string(), 4), ("j".to_string(), 1)].into_iter().collect(),
        };
        assert!(injective_over(&row_major, &levels));

        let diagonal = affine::AffineForm {
            constant: 0,
            terms: [("i".to_string(), 1), ("j".to_string(), 1)].into_iter().collect(),
        };
        assert!(!injective_over(&diagonal, &levels));
    }
}
