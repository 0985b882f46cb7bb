//! Instruction generator for the PIM target
//!
//! Converts a mapped kernel into an instruction stream. Each loop nest becomes
//! one group: a `CONFIG` per level, outermost first, followed by the body
//! emitted exactly once. The target repeats the body over the configured
//! domain, so the stream grows with the number of operators, not with the
//! iteration count. A single `NOP` ends the program.
//!
//! A `CONFIG` counter holds at most 255 steps. Longer loops are factored into
//! two counters when the trip count and stride allow it, and otherwise cut
//! into runs of extra groups whose patterns start part way through the loop.

use crate::ast::{BinOp, UnaryOp};
use crate::error::{CompileError, CompileResult};
use crate::hardware::{AccessPattern, PimConfig, PimProgram};
use crate::isa::{Instruction, Opcode, Operand, MAX_STRIDE_SCALE};
use crate::kernel::{scalar_value, LoopLevel, LoopNest, ScalarParam, Statement, StoreKind, ValueExpr};
use crate::mapper::{AddressExpression, MappedKernel};

/// Most steps one `CONFIG` counter can run
const MAX_TRIPS: u64 = u8::MAX as u64;

/// Radix of wide constants built from 8-bit immediates
const IMMEDIATE_RADIX: u64 = 64;

/// One hardware counter; each step advances source level `source` by `steps` iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HardwareLevel {
    source: usize,
    trips: u64,
    steps: u64,
}

/// The part of a nest's iteration domain covered by one group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Segment {
    levels: Vec<HardwareLevel>,
    /// First iteration of each source level
    origin: Vec<u64>,
}

/// Code generator for PIM hardware
pub struct CodeGenerator {
    config: PimConfig,
    /// Next free scratch register; registers are used as a stack
    next_register: u8,
}

impl CodeGenerator {
    pub fn new(config: PimConfig) -> Self {
        Self {
            config,
            next_register: 0,
        }
    }

    /// Generate the program for a mapped kernel
    pub fn generate(&mut self, kernel: &MappedKernel) -> CompileResult<PimProgram> {
        self.next_register = 0;
        let mut program = PimProgram::new(
            self.config.clone(),
            kernel.name.clone(),
            kernel.memory_map.clone(),
        );

        if kernel.memory_map.regions.len() > 256 {
            return Err(CompileError::encoding(format!(
                "{} regions exceed the 256 a region operand can name",
                kernel.memory_map.regions.len()
            )));
        }

        for nest in &kernel.nests {
            self.generate_nest(nest, kernel, &mut program)?;
        }
        program.push(Instruction::nop());

        program.generate_summary();
        log::info!(
            "generated {} instructions in {} nest group(s) for `{}`",
            program.instructions.len(),
            program.nest_groups(),
            kernel.name
        );
        Ok(program)
    }

    /// Emit the groups of one nest
    ///
    /// `CONFIG` reports the magnitude of the output stride only. A reversed
    /// access such as `B[3 - i]` configures `#4` like `B[i]` does; the
    /// direction lives in the signed coefficients of its access pattern.
    fn generate_nest(
        &mut self,
        nest: &LoopNest<AddressExpression>,
        kernel: &MappedKernel,
        program: &mut PimProgram,
    ) -> CompileResult<()> {
        if nest.levels.len() > self.config.max_loop_depth {
            return Err(CompileError::encoding(format!(
                "loop nest of depth {} exceeds the configured maximum of {}",
                nest.levels.len(),
                self.config.max_loop_depth
            )));
        }

        // Strides reported by CONFIG follow the output of the first statement
        let output = nest.body.first().map(|stmt| &stmt.target);
        let units: Vec<u64> = nest
            .levels
            .iter()
            .enumerate()
            .map(|(l, level)| {
                output.map_or(0, |target| {
                    target.coefficients[l].unsigned_abs().saturating_mul(level.stride)
                })
            })
            .collect();

        for (l, level) in nest.levels.iter().enumerate() {
            let trips = level.trip_count();
            let pieces = split_trips(trips, units[l]).len();
            if pieces == 1 {
                continue;
            }
            let outer_repeats = nest.levels[..l].iter().any(|outer| outer.trip_count() > 1);
            if outer_repeats && !slices_commute(nest, l) {
                return Err(CompileError::encoding(format!(
                    "loop `{}` runs {} times and must be split, but its iterations \
                     depend on the order of the enclosing loops",
                    level.induction_var, trips
                )));
            }
            log::debug!(
                "loop `{}` runs {} times; covering it with {} groups",
                level.induction_var,
                trips,
                pieces
            );
        }

        for segment in segments(&nest.levels, &units) {
            if segment.levels.len() > self.config.max_loop_depth {
                return Err(CompileError::encoding(format!(
                    "splitting long loops needs {} CONFIG levels; the configured maximum is {}",
                    segment.levels.len(),
                    self.config.max_loop_depth
                )));
            }
            if segment.levels.is_empty() {
                program.push(Instruction::config(0, 1, 0, 0));
            }

            for (h, hw) in segment.levels.iter().enumerate() {
                let level = &nest.levels[hw.source];
                let trips = u8::try_from(hw.trips).map_err(|_| {
                    CompileError::encoding(format!(
                        "loop `{}` runs {} times; CONFIG holds at most 255",
                        level.induction_var, hw.trips
                    ))
                })?;
                let depth = u8::try_from(h)
                    .map_err(|_| CompileError::encoding("more than 256 CONFIG levels in one group"))?;

                let stride = units[hw.source].saturating_mul(hw.steps);
                let (scale, field) = scale_stride(stride).ok_or_else(|| {
                    CompileError::encoding(format!(
                        "stride of {} bytes for loop `{}` does not fit CONFIG",
                        stride, level.induction_var
                    ))
                })?;

                program.push(Instruction::config(depth, trips, field, scale));
            }

            for stmt in &nest.body {
                self.next_register = 0;
                self.lower_statement(stmt, nest, &segment, kernel, program)?;
            }
        }
        Ok(())
    }

    fn lower_statement(
        &mut self,
        stmt: &Statement<AddressExpression>,
        nest: &LoopNest<AddressExpression>,
        segment: &Segment,
        kernel: &MappedKernel,
        program: &mut PimProgram,
    ) -> CompileResult<()> {
        let (region, pattern) = self.locate(&stmt.target, nest, segment, kernel, program)?;

        match stmt.kind {
            StoreKind::Assign => {
                let value = self.lower_value(&stmt.value, nest, segment, kernel, program)?;
                program.push(Instruction::store(region, pattern, value));
            }
            StoreKind::Accumulate(op) => {
                let opcode =
                    Opcode::for_operator(op).ok_or_else(|| CompileError::unsupported_op(op.symbol()))?;

                // Stage the old value in the accumulator
                let staged = self.allocate()?;
                program.push(Instruction::load(staged.clone(), region.clone(), pattern));
                program.push(Instruction::mov(Operand::Acc, staged));
                self.next_register = 0;

                let value = self.lower_value(&stmt.value, nest, segment, kernel, program)?;
                program.push(Instruction::arith(opcode, Operand::Acc, Operand::Acc, value));
                program.push(Instruction::store(region, pattern, Operand::Acc));
            }
        }
        Ok(())
    }

    /// Evaluate a value into a register, left operand first
    fn lower_value(
        &mut self,
        expr: &ValueExpr<AddressExpression>,
        nest: &LoopNest<AddressExpression>,
        segment: &Segment,
        kernel: &MappedKernel,
        program: &mut PimProgram,
    ) -> CompileResult<Operand> {
        if let Some(value) = fold(expr, &kernel.scalars)? {
            return self.immediate(value, program);
        }

        match expr {
            ValueExpr::Read(address) => {
                let (region, pattern) = self.locate(address, nest, segment, kernel, program)?;
                let dest = self.allocate()?;
                program.push(Instruction::load(dest.clone(), region, pattern));
                Ok(dest)
            }
            ValueExpr::Binary(op, l, r) => {
                let opcode =
                    Opcode::for_operator(*op).ok_or_else(|| CompileError::unsupported_op(op.symbol()))?;
                let left = self.lower_value(l, nest, segment, kernel, program)?;
                let right = self.lower_value(r, nest, segment, kernel, program)?;
                program.push(Instruction::arith(opcode, left.clone(), left.clone(), right));
                self.release();
                Ok(left)
            }
            ValueExpr::Unary(UnaryOp::Neg, e) => {
                let value = self.lower_value(e, nest, segment, kernel, program)?;
                self.negate(&value, program)?;
                Ok(value)
            }
            ValueExpr::Unary(op, _) => Err(CompileError::unsupported_op(op.symbol())),
            ValueExpr::Induction(var) => Err(CompileError::unsupported_expr(format!(
                "induction variable `{}` used as a value; PIM instructions cannot read loop counters",
                var
            ))),
            // Constants and bound scalars were folded above
            ValueExpr::Const(_) | ValueExpr::Param(_) => Err(CompileError::unsupported_expr(
                format!("cannot evaluate `{}`", expr),
            )),
        }
    }

    /// Load a constant into a fresh register
    ///
    /// Values outside `i8` are built from base-64 digits, most significant
    /// first: `r = r * 64 + digit`. Negative values are built positive and
    /// subtracted from zero.
    fn immediate(&mut self, value: i64, program: &mut PimProgram) -> CompileResult<Operand> {
        let dest = self.allocate()?;
        if let Ok(imm) = i8::try_from(value) {
            program.push(Instruction::load_immediate(dest.clone(), imm));
            return Ok(dest);
        }

        let mut digits = Vec::new();
        let mut rest = value.unsigned_abs();
        while rest > 0 {
            digits.push((rest % IMMEDIATE_RADIX) as i8);
            rest /= IMMEDIATE_RADIX;
        }

        let mut digits = digits.into_iter().rev();
        let leading = digits.next().unwrap_or(0);
        program.push(Instruction::load_immediate(dest.clone(), leading));
        for digit in digits {
            let temp = self.allocate()?;
            program.push(Instruction::load_immediate(temp.clone(), IMMEDIATE_RADIX as i8));
            program.push(Instruction::arith(Opcode::Mul, dest.clone(), dest.clone(), temp.clone()));
            if digit != 0 {
                program.push(Instruction::load_immediate(temp.clone(), digit));
                program.push(Instruction::arith(Opcode::Add, dest.clone(), dest.clone(), temp));
            }
            self.release();
        }

        if value < 0 {
            self.negate(&dest, program)?;
        }
        log::debug!("built constant {} from 8-bit immediates", value);
        Ok(dest)
    }

    /// `value = 0 - value`
    fn negate(&mut self, value: &Operand, program: &mut PimProgram) -> CompileResult<()> {
        let zero = self.allocate()?;
        program.push(Instruction::load_immediate(zero.clone(), 0));
        program.push(Instruction::arith(Opcode::Sub, value.clone(), zero, value.clone()));
        self.release();
        Ok(())
    }

    fn allocate(&mut self) -> CompileResult<Operand> {
        if self.next_register >= self.config.scratch_registers {
            return Err(CompileError::RegisterPressure {
                message: format!(
                    "expression needs more than {} scratch registers",
                    self.config.scratch_registers
                ),
            });
        }
        let reg = Operand::Reg(self.next_register);
        self.next_register += 1;
        Ok(reg)
    }

    fn release(&mut self) {
        self.next_register = self.next_register.saturating_sub(1);
    }

    /// Region operand and pattern index for an access within one segment
    fn locate(
        &self,
        address: &AddressExpression,
        nest: &LoopNest<AddressExpression>,
        segment: &Segment,
        kernel: &MappedKernel,
        program: &mut PimProgram,
    ) -> CompileResult<(Operand, u8)> {
        let region = kernel
            .memory_map
            .regions
            .get(address.region)
            .filter(|r| r.name() == address.operand)
            .ok_or_else(|| CompileError::unbound(address.operand.clone()))?;

        let overflow = || {
            CompileError::encoding(format!(
                "per-iteration stride of `{}` overflows",
                address.operand
            ))
        };
        // Bytes per source iteration of each level
        let step = |source: usize, iterations: u64| -> CompileResult<i64> {
            let level: &LoopLevel = &nest.levels[source];
            i64::try_from(level.stride)
                .ok()
                .zip(i64::try_from(iterations).ok())
                .and_then(|(s, n)| address.coefficients[source].checked_mul(s)?.checked_mul(n))
                .ok_or_else(overflow)
        };

        let coefficients = segment
            .levels
            .iter()
            .map(|hw| step(hw.source, hw.steps))
            .collect::<CompileResult<Vec<_>>>()?;
        let offset = segment
            .origin
            .iter()
            .enumerate()
            .try_fold(address.offset, |offset, (source, first)| {
                offset.checked_add(step(source, *first)?).ok_or_else(overflow)
            })?;

        let pattern = program.intern_pattern(AccessPattern {
            region: address.region,
            offset,
            coefficients,
        });
        let pattern = u8::try_from(pattern).map_err(|_| {
            CompileError::encoding("more than 256 distinct access patterns")
        })?;

        // Region count was checked in `generate`
        let operand = Operand::Region {
            index: address.region as u8,
            name: region.name().to_string(),
        };
        Ok((operand, pattern))
    }
}

/// Inner counter size of a single-group factorization of `trips`, if any
fn exact_factor(trips: u64) -> Option<u64> {
    (trips.div_ceil(MAX_TRIPS).max(2)..=MAX_TRIPS).find(|inner| trips % inner == 0)
}

/// Cover `trips` iterations with counters of at most 255 steps
///
/// `unit` is the byte stride `CONFIG` reports per iteration. A factorization
/// into two counters keeps a single piece when the outer counter's stride
/// still fits; otherwise the loop is cut into runs of at most 255 iterations.
/// Each piece is its first iteration plus `(trips, steps)` counters,
/// outermost first, and pieces come back in iteration order.
fn split_trips(trips: u64, unit: u64) -> Vec<(u64, Vec<(u64, u64)>)> {
    if trips <= MAX_TRIPS {
        return vec![(0, vec![(trips, 1)])];
    }
    let factored = exact_factor(trips).filter(|inner| scale_stride(unit.saturating_mul(*inner)).is_some());
    if let Some(inner) = factored {
        return vec![(0, vec![(trips / inner, inner), (inner, 1)])];
    }

    (0..trips.div_ceil(MAX_TRIPS))
        .map(|run| {
            let first = run * MAX_TRIPS;
            (first, vec![((trips - first).min(MAX_TRIPS), 1)])
        })
        .collect()
}

/// Every combination of the pieces of each level, in iteration order
fn segments(levels: &[LoopLevel], units: &[u64]) -> Vec<Segment> {
    let mut out = vec![Segment::default()];
    for (source, (level, unit)) in levels.iter().zip(units).enumerate() {
        let pieces = split_trips(level.trip_count(), *unit);
        out = out
            .into_iter()
            .flat_map(|segment| {
                pieces.iter().map(move |(first, counters)| {
                    let mut next = segment.clone();
                    next.origin.push(*first);
                    next.levels.extend(counters.iter().map(|&(trips, steps)| HardwareLevel {
                        source,
                        trips,
                        steps,
                    }));
                    next
                })
            })
            .collect();
    }
    out
}

/// True when level `split` can run in slices, each slice covering every
/// iteration of the enclosing loops before the next slice starts
///
/// Each written region must be touched through one address expression.
/// Either every touch is an accumulation with the same commutative operator,
/// or the address is injective over the levels that move it and every
/// repeating outer level moves it.
fn slices_commute(nest: &LoopNest<AddressExpression>, split: usize) -> bool {
    let written: Vec<usize> = nest.body.iter().map(|stmt| stmt.target.region).collect();

    written.into_iter().all(|region| {
        let touches: Vec<(&AddressExpression, Option<StoreKind>)> = nest
            .body
            .iter()
            .flat_map(|stmt| {
                std::iter::once((&stmt.target, Some(stmt.kind)))
                    .chain(stmt.value.reads().into_iter().map(|read| (read, None)))
            })
            .filter(|(address, _)| address.region == region)
            .collect();

        let (first, kind) = touches[0];
        if touches.iter().any(|(address, _)| {
            address.offset != first.offset || address.coefficients != first.coefficients
        }) {
            return false;
        }

        let commutative = matches!(
            kind,
            Some(StoreKind::Accumulate(BinOp::Add | BinOp::Sub | BinOp::Mul))
        );
        if commutative && touches.iter().all(|(_, k)| *k == kind) {
            return true;
        }

        let pinned_outer = nest.levels[..split]
            .iter()
            .enumerate()
            .any(|(l, level)| level.trip_count() > 1 && first.coefficients[l] == 0);
        !pinned_outer && injective(first, &nest.levels)
    })
}

/// Distinct points of the levels that move `address` give distinct addresses
fn injective(address: &AddressExpression, levels: &[LoopLevel]) -> bool {
    let mut steps: Vec<(u64, u64)> = address
        .coefficients
        .iter()
        .zip(levels)
        .filter(|(c, level)| **c != 0 && level.trip_count() > 1)
        .map(|(c, level)| (c.unsigned_abs().saturating_mul(level.stride), level.trip_count()))
        .collect();
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

/// Value of a constant subtree, with C integer semantics
fn fold<A>(expr: &ValueExpr<A>, scalars: &[ScalarParam]) -> CompileResult<Option<i64>> {
    match expr {
        ValueExpr::Const(n) => Ok(Some(*n)),
        ValueExpr::Param(name) => scalar_value(scalars, name)
            .map(Some)
            .ok_or_else(|| CompileError::unbound(name.clone())),
        ValueExpr::Binary(op, l, r) => {
            let (Some(a), Some(b)) = (fold(l, scalars)?, fold(r, scalars)?) else {
                return Ok(None);
            };
            let opcode =
                Opcode::for_operator(*op).ok_or_else(|| CompileError::unsupported_op(op.symbol()))?;
            let overflow = || CompileError::encoding(format!("constant `{} {} {}` overflows", a, op, b));
            let value = match opcode {
                Opcode::Add => a.checked_add(b).ok_or_else(overflow)?,
                Opcode::Sub => a.checked_sub(b).ok_or_else(overflow)?,
                Opcode::Mul => a.checked_mul(b).ok_or_else(overflow)?,
                _ => {
                    if b == 0 {
                        return Err(CompileError::unsupported_expr(format!(
                            "division by zero in `{} / {}`",
                            a, b
                        )));
                    }
                    // Truncates toward zero
                    a.checked_div(b).ok_or_else(overflow)?
                }
            };
            Ok(Some(value))
        }
        ValueExpr::Unary(UnaryOp::Neg, e) => match fold(e, scalars)? {
            Some(v) => v
                .checked_neg()
                .map(Some)
                .ok_or_else(|| CompileError::encoding(format!("constant `-{}` overflows", v))),
            None => Ok(None),
        },
        ValueExpr::Unary(op, _) => Err(CompileError::unsupported_op(op.symbol())),
        ValueExpr::Induction(_) | ValueExpr::Read(_) => Ok(None),
    }
}

/// Split a byte stride into (scale, field) with `field << scale == stride`
fn scale_stride(stride: u64) -> Option<(u8, u8)> {
    (0..=MAX_STRIDE_SCALE).find_map(|scale| {
        let unit = 1u64 << scale;
        if stride % unit == 0 {
            u8::try_from(stride >> scale).ok().map(|field| (scale, field))
        } else {
            None
        }
    })
}
