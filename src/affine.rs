//! Affine normalization of index expressions
//!
//! Reduces an `IndexExpr` to `constant + Σ coeff * iv`, folding everything
//! made only of literals and bound scalars along the way. Anything that does
//! not reduce (a product of two induction variables, a data-dependent read,
//! an unbound scalar) is an `UnresolvedIndex` error naming the operand.

use std::collections::BTreeMap;
use std::fmt;

use crate::ast::BinOp;
use crate::error::{CompileError, CompileResult};
use crate::kernel::{scalar_value, Access, ArrayOperand, IndexExpr, ScalarParam};

/// `constant + Σ terms[iv] * iv`, with no zero coefficients stored
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffineForm {
    pub constant: i64,
    pub terms: BTreeMap<String, i64>,
}

impl AffineForm {
    pub fn constant(value: i64) -> Self {
        Self {
            constant: value,
            terms: BTreeMap::new(),
        }
    }

    pub fn var(name: impl Into<String>) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(name.into(), 1);
        Self { constant: 0, terms }
    }

    pub fn is_constant(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn coefficient(&self, var: &str) -> i64 {
        self.terms.get(var).copied().unwrap_or(0)
    }

    fn add(mut self, other: AffineForm) -> Option<Self> {
        self.constant = self.constant.checked_add(other.constant)?;
        for (var, coeff) in other.terms {
            let entry = self.terms.entry(var).or_insert(0);
            *entry = entry.checked_add(coeff)?;
        }
        self.terms.retain(|_, c| *c != 0);
        Some(self)
    }

    fn scale(mut self, factor: i64) -> Option<Self> {
        self.constant = self.constant.checked_mul(factor)?;
        for coeff in self.terms.values_mut() {
            *coeff = coeff.checked_mul(factor)?;
        }
        self.terms.retain(|_, c| *c != 0);
        Some(self)
    }
}

impl fmt::Display for AffineForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.constant)?;
        for (var, coeff) in &self.terms {
            write!(f, " + {}*{}", coeff, var)?;
        }
        Ok(())
    }
}

fn overflow(operand: &str) -> CompileError {
    CompileError::unresolved(operand, "index arithmetic overflows")
}

/// Normalize one subscript of an access to `operand`
pub fn normalize(
    operand: &str,
    expr: &IndexExpr,
    scalars: &[ScalarParam],
) -> CompileResult<AffineForm> {
    match expr {
        IndexExpr::Const(n) => Ok(AffineForm::constant(*n)),
        IndexExpr::Induction(v) => Ok(AffineForm::var(v.clone())),
        IndexExpr::Param(p) => scalar_value(scalars, p)
            .map(AffineForm::constant)
            .ok_or_else(|| {
                CompileError::unresolved(
                    operand,
                    format!("scalar `{}` has no compile-time value", p),
                )
            }),
        IndexExpr::Read(access) => Err(CompileError::unresolved(
            operand,
            format!("index depends on a value read from `{}`", access),
        )),
        IndexExpr::Neg(e) => normalize(operand, e, scalars)?
            .scale(-1)
            .ok_or_else(|| overflow(operand)),
        IndexExpr::Binary(op, l, r) => {
            let left = normalize(operand, l, scalars)?;
            let right = normalize(operand, r, scalars)?;
            combine(operand, *op, left, right, expr)
        }
        IndexExpr::Opaque(text) => Err(CompileError::unresolved(
            operand,
            format!("`{}` is not an affine index expression", text),
        )),
    }
}

fn combine(
    operand: &str,
    op: BinOp,
    left: AffineForm,
    right: AffineForm,
    expr: &IndexExpr,
) -> CompileResult<AffineForm> {
    let folded = match op {
        BinOp::Add => left.add(right),
        BinOp::Sub => right.scale(-1).and_then(|r| left.add(r)),
        BinOp::Mul => match (left.is_constant(), right.is_constant()) {
            (_, true) => left.scale(right.constant),
            (true, false) => right.scale(left.constant),
            (false, false) => {
                return Err(CompileError::unresolved(
                    operand,
                    format!("product `{}` is not affine", expr),
                ))
            }
        },
        BinOp::Div | BinOp::Rem => {
            if !(left.is_constant() && right.is_constant()) {
                return Err(CompileError::unresolved(
                    operand,
                    format!("`{}` divides a non-constant index", expr),
                ));
            }
            if right.constant == 0 {
                return Err(CompileError::unresolved(
                    operand,
                    format!("division by zero in `{}`", expr),
                ));
            }
            // i64 division truncates toward zero, as C does
            let value = if op == BinOp::Div {
                left.constant.checked_div(right.constant)
            } else {
                left.constant.checked_rem(right.constant)
            };
            value.map(AffineForm::constant)
        }
        other => {
            return Err(CompileError::unresolved(
                operand,
                format!("operator `{}` is not affine", other),
            ))
        }
    };
    folded.ok_or_else(|| overflow(operand))
}

/// Find the declared operand an access refers to
pub fn operand_of<'a>(
    access: &Access,
    operands: &'a [ArrayOperand],
) -> CompileResult<&'a ArrayOperand> {
    operands
        .iter()
        .find(|o| o.name == access.operand())
        .ok_or_else(|| CompileError::unbound(access.operand()))
}

/// Element offset of an access from the start of its operand
///
/// `A[i][k]` becomes `i * row_length + k`; a linear access is its index.
pub fn flatten(
    access: &Access,
    operands: &[ArrayOperand],
    scalars: &[ScalarParam],
) -> CompileResult<AffineForm> {
    let operand = operand_of(access, operands)?;
    let name = operand.name.as_str();

    match access {
        Access::Linear { index, .. } => normalize(name, index, scalars),
        Access::MultiDim { indices, .. } => {
            let [row, col] = indices.as_slice() else {
                return Err(CompileError::unresolved(
                    name,
                    format!("expected 2 subscripts, found {}", indices.len()),
                ));
            };
            let row_length = operand.row_length().ok_or_else(|| {
                CompileError::unresolved(name, "row length of a 2-D operand is not declared")
            })?;
            let row_length = i64::try_from(row_length).map_err(|_| overflow(name))?;
            let row = normalize(name, row, scalars)?;
            let col = normalize(name, col, scalars)?;
            row.scale(row_length)
                .and_then(|r| r.add(col))
                .ok_or_else(|| overflow(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn iv(name: &str) -> IndexExpr {
        IndexExpr::Induction(name.to_string())
    }

    fn bin(op: BinOp, l: IndexExpr, r: IndexExpr) -> IndexExpr {
        IndexExpr::binary(op, l, r)
    }

    fn scalars() -> Vec<ScalarParam> {
        vec![
            ScalarParam { name: "cols".to_string(), value: Some(4) },
            ScalarParam { name: "n".to_string(), value: None },
        ]
    }

    fn form(constant: i64, terms: &[(&str, i64)]) -> AffineForm {
        AffineForm {
            constant,
            terms: terms.iter().map(|(v, c)| (v.to_string(), *c)).collect(),
        }
    }

    #[test]
    fn test_linear_index_with_bound_scalar() {
        // i * cols + j
        let expr = bin(
            BinOp::Add,
            bin(BinOp::Mul, iv("i"), IndexExpr::Param("cols".to_string())),
            iv("j"),
        );
        assert_eq!(
            normalize("C", &expr, &scalars()).unwrap(),
            form(0, &[("i", 4), ("j", 1)])
        );
    }

    #[test]
    fn test_constant_subexpressions_fold() {
        // (8 / 3) * i - (i + 1) + -7 / 2
        let expr = bin(
            BinOp::Add,
            bin(
                BinOp::Sub,
                bin(BinOp::Mul, bin(BinOp::Div, IndexExpr::Const(8), IndexExpr::Const(3)), iv("i")),
                bin(BinOp::Add, iv("i"), IndexExpr::Const(1)),
            ),
            bin(BinOp::Div, IndexExpr::Const(-7), IndexExpr::Const(2)),
        );
        assert_eq!(normalize("A", &expr, &[]).unwrap(), form(-4, &[("i", 1)]));
    }

    #[test]
    fn test_cancelled_terms_are_dropped() {
        let expr = bin(BinOp::Sub, iv("i"), iv("i"));
        assert!(normalize("A", &expr, &[]).unwrap().is_constant());
    }

    #[test]
    fn test_product_of_induction_vars_is_unresolved() {
        let expr = bin(BinOp::Mul, iv("i"), iv("j"));
        let err = normalize("A", &expr, &[]).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedIndex { ref operand, .. } if operand == "A"));
    }

    #[test]
    fn test_data_dependent_index_is_unresolved() {
        let read = IndexExpr::Read(Box::new(Access::Linear {
            operand: "idx".to_string(),
            index: iv("i"),
        }));
        let err = normalize("A", &read, &[]).unwrap_err();
        assert_eq!(err.kind(), "UnresolvedIndexError");
        assert!(err.to_string().contains("idx[i]"));
    }

    #[test]
    fn test_unbound_scalar_is_unresolved() {
        let expr = bin(BinOp::Mul, iv("i"), IndexExpr::Param("n".to_string()));
        let err = normalize("A", &expr, &scalars()).unwrap_err();
        assert!(err.to_string().contains("`n` has no compile-time value"));
    }

    #[test]
    fn test_flatten_multidim_matches_linear() {
        let operands = vec![ArrayOperand {
            name: "A".to_string(),
            element_width_bytes: 4,
            dimensionality: 2,
            declared_extents: vec![Some(3), Some(2)],
        }];
        let multi = Access::MultiDim {
            operand: "A".to_string(),
            indices: vec![iv("i"), iv("k")],
        };
        let linear = Access::Linear {
            operand: "A".to_string(),
            index: bin(BinOp::Add, bin(BinOp::Mul, iv("i"), IndexExpr::Const(2)), iv("k")),
        };

        assert_eq!(
            flatten(&multi, &operands, &[]).unwrap(),
            flatten(&linear, &operands, &[]).unwrap()
        );
    }

    #[test]
    fn test_flatten_unknown_operand() {
        let access = Access::Linear {
            operand: "Z".to_string(),
            index: iv("i"),
        };
        assert_eq!(
            flatten(&access, &[], &[]).unwrap_err(),
            CompileError::unbound("Z")
        );
    }
}
