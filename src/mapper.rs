//! Memory mapper
//!
//! Places every array operand in PIM address space and resolves every access
//! in the loop nests to an `AddressExpression`: a base address plus a byte
//! offset plus one byte coefficient per nest level. Two-dimensional and
//! linear indexing resolve to the same representation, so a 2-D `A[i][k]` and
//! a pointer `A[i*K + k]` over the same layout produce identical expressions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::affine::{self, AffineForm};
use crate::context::CompilationContext;
use crate::error::{CompileError, CompileResult};
use crate::hardware::PimConfig;
use crate::kernel::{Access, ArrayOperand, Kernel, LoopNest, ScalarParam, Statement};

/// Where one operand lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub operand: ArrayOperand,
    pub base_address: u64,
    pub size_bytes: u64,
    /// Bytes per unit step of each dimension, outermost first
    pub strides: Vec<u64>,
    /// Placed at an externally supplied address
    pub pinned: bool,
}

impl MemoryRegion {
    pub fn name(&self) -> &str {
        &self.operand.name
    }

    /// One past the last byte, `None` when the region runs off the top of `u64`
    pub fn end(&self) -> Option<u64> {
        self.base_address.checked_add(self.size_bytes)
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        let end = |r: &MemoryRegion| r.end().unwrap_or(u64::MAX);
        self.base_address < end(other) && other.base_address < end(self)
    }

    pub fn contains(&self, address: u64, width: u64) -> bool {
        match (address.checked_add(width), self.end()) {
            (Some(last), Some(end)) => address >= self.base_address && last <= end,
            _ => false,
        }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let strides: Vec<String> = self.strides.iter().map(u64::to_string).collect();
        write!(
            f,
            "memory mapping: {} -> base 0x{:04x}, {} bytes, strides [{}]",
            self.name(),
            self.base_address,
            self.size_bytes,
            strides.join(", ")
        )?;
        if self.pinned {
            write!(f, " (pinned)")?;
        }
        Ok(())
    }
}

/// All regions of one kernel, in operand declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMap {
    pub regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    pub fn region(&self, name: &str) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.name() == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.regions.iter().position(|r| r.name() == name)
    }

    /// Highest end address over all regions, `None` if any region overflows
    pub fn end(&self) -> Option<u64> {
        self.regions
            .iter()
            .try_fold(0, |high: u64, r| r.end().map(|end| high.max(end)))
    }

    pub fn total_bytes(&self) -> u64 {
        self.regions.iter().map(|r| r.size_bytes).sum()
    }

    /// One report line per region
    pub fn report(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.to_string()).collect()
    }
}

/// A resolved access: `base + offset + Σ coefficients[level] * iv_level`, in bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressExpression {
    pub operand: String,
    /// Index of the region in the memory map
    pub region: usize,
    pub base: u64,
    pub offset: i64,
    /// Bytes per unit of each nest level's induction variable
    pub coefficients: Vec<i64>,
    pub element_width_bytes: u32,
}

impl AddressExpression {
    /// Byte address for the given induction variable values
    pub fn address_at(&self, ivs: &[u64]) -> i64 {
        let base = self.base as i64 + self.offset;
        self.coefficients
            .iter()
            .zip(ivs)
            .fold(base, |acc, (c, v)| acc + c * (*v as i64))
    }
}

impl fmt::Display for AddressExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@0x{:04x}", self.operand, self.base)?;
        if self.offset != 0 {
            write!(f, "{:+}", self.offset)?;
        }
        for (level, c) in self.coefficients.iter().enumerate() {
            if *c != 0 {
                write!(f, "{:+}*L{}", c, level)?;
            }
        }
        Ok(())
    }
}

/// A kernel whose accesses are resolved against its memory map
#[derive(Debug, Clone, PartialEq)]
pub struct MappedKernel {
    pub name: String,
    pub memory_map: MemoryMap,
    pub scalars: Vec<ScalarParam>,
    pub nests: Vec<LoopNest<AddressExpression>>,
}

/// An access reduced to element units, before placement
#[derive(Debug, Clone)]
struct Resolved {
    operand: usize,
    constant: i64,
    coefficients: Vec<i64>,
    max_element: i64,
}

/// What the accesses tell us about one operand
#[derive(Debug, Clone, Default)]
struct Usage {
    max_element: Option<i64>,
    coefficients: BTreeSet<u64>,
}

/// Memory mapper for one compilation
pub struct MemoryMapper {
    config: PimConfig,
}

impl MemoryMapper {
    pub fn new(config: PimConfig) -> Self {
        Self { config }
    }

    /// Place the operands of `kernel` and resolve its accesses
    pub fn map(&self, kernel: &Kernel, ctx: &mut CompilationContext) -> CompileResult<MappedKernel> {
        let mut usage = vec![Usage::default(); kernel.operands.len()];
        let mut resolved_nests = Vec::with_capacity(kernel.nests.len());

        for nest in &kernel.nests {
            let mut visit = |access: &Access| -> CompileResult<Resolved> {
                let r = resolve(access, nest, kernel)?;
                let u = &mut usage[r.operand];
                u.max_element = Some(u.max_element.map_or(r.max_element, |m| m.max(r.max_element)));
                u.coefficients
                    .extend(r.coefficients.iter().filter(|c| **c != 0).map(|c| c.unsigned_abs()));
                Ok(r)
            };
            let body = nest
                .body
                .iter()
                .map(|stmt| {
                    Ok(Statement {
                        target: visit(&stmt.target)?,
                        kind: stmt.kind,
                        value: stmt.value.try_map(&mut visit)?,
                    })
                })
                .collect::<CompileResult<Vec<_>>>()?;
            resolved_nests.push(LoopNest {
                levels: nest.levels.clone(),
                body,
            });
        }

        let memory_map = self.allocate(&kernel.operands, &usage)?;
        for line in memory_map.report() {
            ctx.report(line);
        }
        log::info!(
            "memory mapping: {} region(s), {} bytes of {} available",
            memory_map.regions.len(),
            memory_map.total_bytes(),
            self.config.address_space_bytes
        );

        let nests = resolved_nests
            .into_iter()
            .map(|nest| {
                let body = nest
                    .body
                    .iter()
                    .map(|stmt| {
                        Ok(Statement {
                            target: place(&stmt.target, &memory_map)?,
                            kind: stmt.kind,
                            value: stmt.value.try_map(&mut |r| place(r, &memory_map))?,
                        })
                    })
                    .collect::<CompileResult<Vec<_>>>()?;
                Ok(LoopNest {
                    levels: nest.levels,
                    body,
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;

        Ok(MappedKernel {
            name: kernel.name.clone(),
            memory_map,
            scalars: kernel.scalars.clone(),
            nests,
        })
    }

    /// Size, stride and place every operand, in declaration order
    fn allocate(&self, operands: &[ArrayOperand], usage: &[Usage]) -> CompileResult<MemoryMap> {
        let config = &self.config;

        for name in config.pinned_regions.keys() {
            if !operands.iter().any(|o| &o.name == name) {
                return Err(CompileError::invalid_layout(format!(
                    "pinned region names unknown operand `{}`",
                    name
                )));
            }
        }

        let capacity = |required: u64| CompileError::CapacityExceeded {
            required,
            available: config.address_space_bytes,
        };

        let mut regions = Vec::with_capacity(operands.len());
        for (operand, usage) in operands.iter().zip(usage) {
            let width = u64::from(operand.element_width_bytes);
            let elements = match operand.element_count() {
                Some(n) => n,
                None => match usage.max_element {
                    Some(max) => max as u64 + 1,
                    None => {
                        log::debug!("operand `{}` is never accessed; reserving one element", operand.name);
                        1
                    }
                },
            };
            let size_bytes = elements.checked_mul(width).ok_or_else(|| capacity(u64::MAX))?;

            let strides = match operand.row_length() {
                Some(row) => vec![row * width, width],
                None => {
                    let mut coefficients = usage.coefficients.clone();
                    coefficients.insert(1);
                    coefficients.iter().rev().map(|c| c * width).collect()
                }
            };

            let pinned = config.pinned_regions.get(&operand.name).copied();
            let alignment = config.region_alignment.max(width);
            if let Some(base) = pinned {
                if base % alignment != 0 {
                    return Err(CompileError::invalid_layout(format!(
                        "pinned base 0x{:04x} of `{}` is not aligned to {} bytes",
                        base, operand.name, alignment
                    )));
                }
                if base >= config.address_space_bytes {
                    return Err(capacity(base.saturating_add(size_bytes)));
                }
                base.checked_add(size_bytes).ok_or_else(|| capacity(u64::MAX))?;
            }

            regions.push(MemoryRegion {
                operand: operand.clone(),
                base_address: pinned.unwrap_or(0),
                size_bytes,
                strides,
                pinned: pinned.is_some(),
            });
        }

        // Bump allocation around the pinned regions; pinned ends were checked above
        let pinned: Vec<(u64, u64)> = regions
            .iter()
            .filter(|r| r.pinned)
            .map(|r| (r.base_address, r.end().unwrap_or(u64::MAX)))
            .collect();
        let mut cursor = config.base_address;
        for region in regions.iter_mut().filter(|r| !r.pinned) {
            let alignment = config.region_alignment.max(u64::from(region.operand.element_width_bytes));
            let mut base = align_up(cursor, alignment).ok_or_else(|| capacity(u64::MAX))?;
            let mut end = base
                .checked_add(region.size_bytes)
                .ok_or_else(|| capacity(u64::MAX))?;
            while let Some(&(_, pinned_end)) = pinned
                .iter()
                .find(|(start, stop)| base < *stop && *start < end)
            {
                base = align_up(pinned_end, alignment).ok_or_else(|| capacity(u64::MAX))?;
                end = base
                    .checked_add(region.size_bytes)
                    .ok_or_else(|| capacity(u64::MAX))?;
            }
            region.base_address = base;
            cursor = end;
        }

        for (i, a) in regions.iter().enumerate() {
            if let Some(b) = regions[i + 1..].iter().find(|b| a.overlaps(b)) {
                return Err(CompileError::Overlap {
                    first: a.name().to_string(),
                    second: b.name().to_string(),
                });
            }
        }

        let map = MemoryMap { regions };
        let end = map.end().ok_or_else(|| capacity(u64::MAX))?;
        if end > config.address_space_bytes {
            return Err(capacity(end));
        }
        Ok(map)
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.div_ceil(alignment).checked_mul(alignment)
}

/// Smallest and largest value of `form` over the iteration domain of `nest`
fn range_of(operand: &str, form: &AffineForm, nest: &LoopNest) -> CompileResult<(i64, i64)> {
    let overflow = || CompileError::unresolved(operand, "index range overflows");
    let mut low = form.constant;
    let mut high = form.constant;
    for (var, coeff) in &form.terms {
        let level = nest.level_of(var).ok_or_else(|| {
            CompileError::unresolved(
                operand,
                format!("induction variable `{}` is not bound by the enclosing loops", var),
            )
        })?;
        let last = i64::try_from(nest.levels[level].last_value()).map_err(|_| overflow())?;
        let extreme = coeff.checked_mul(last).ok_or_else(overflow)?;
        if extreme < 0 {
            low = low.checked_add(extreme).ok_or_else(overflow)?;
        } else {
            high = high.checked_add(extreme).ok_or_else(overflow)?;
        }
    }
    Ok((low, high))
}

/// Reduce one access to element units and check it stays inside its operand
fn resolve(access: &Access, nest: &LoopNest, kernel: &Kernel) -> CompileResult<Resolved> {
    let form = affine::flatten(access, &kernel.operands, &kernel.scalars)?;
    let operand_index = kernel
        .operands
        .iter()
        .position(|o| o.name == access.operand())
        .ok_or_else(|| CompileError::unbound(access.operand()))?;
    let operand = &kernel.operands[operand_index];
    let name = operand.name.as_str();

    let (low, high) = range_of(name, &form, nest)?;
    if low < 0 {
        return Err(CompileError::out_of_bounds(
            name,
            format!("`{}` reaches element {}", access, low),
        ));
    }

    if let Access::MultiDim { indices, .. } = access {
        for (dim, index) in indices.iter().enumerate() {
            let (low, high) = range_of(name, &affine::normalize(name, index, &kernel.scalars)?, nest)?;
            let extent = operand.declared_extents.get(dim).copied().flatten();
            if low < 0 || extent.map_or(false, |e| high as u64 >= e) {
                return Err(CompileError::out_of_bounds(
                    name,
                    format!(
                        "subscript {} of `{}` ranges over {}..={} outside the declared extent",
                        dim, access, low, high
                    ),
                ));
            }
        }
    }

    if let Some(count) = operand.element_count() {
        if high as u64 >= count {
            return Err(CompileError::out_of_bounds(
                name,
                format!("`{}` reaches element {} of {}", access, high, count),
            ));
        }
    }

    let mut coefficients = vec![0; nest.levels.len()];
    for (var, coeff) in &form.terms {
        if let Some(level) = nest.level_of(var) {
            coefficients[level] = *coeff;
        }
    }

    Ok(Resolved {
        operand: operand_index,
        constant: form.constant,
        coefficients,
        max_element: high,
    })
}

/// Scale a resolved access to bytes against its placed region
fn place(r: &Resolved, map: &MemoryMap) -> CompileResult<AddressExpression> {
    let region = map
        .regions
        .get(r.operand)
        .ok_or_else(|| CompileError::unbound(format!("operand #{}", r.operand)))?;
    let width = i64::from(region.operand.element_width_bytes);
    let overflow = || CompileError::unresolved(region.name(), "byte offset overflows");

    Ok(AddressExpression {
        operand: region.name().to_string(),
        region: r.operand,
        base: region.base_address,
        offset: r.constant.checked_mul(width).ok_or_else(overflow)?,
        coefficients: r
            .coefficients
            .iter()
            .map(|c| c.checked_mul(width).ok_or_else(overflow))
            .collect::<CompileResult<Vec<_>>>()?,
        element_width_bytes: region.operand.element_width_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn map_with(source: &str, bindings: &[(&str, i64)], config: PimConfig) -> CompileResult<(MappedKernel, CompilationContext)> {
        let unit = Parser::new(source).parse_translation_unit()?;
        let mut analyzer = Analyzer::new();
        for (name, value) in bindings {
            analyzer.bind_scalar(name, *value);
        }
        let mut ctx = CompilationContext::new(config.clone());
        let kernel = analyzer.analyze(&unit, None, &mut ctx)?;
        let mapped = MemoryMapper::new(config).map(&kernel, &mut ctx)?;
        Ok((mapped, ctx))
    }

    fn map(source: &str) -> MappedKernel {
        map_with(source, &[], PimConfig::default()).unwrap().0
    }

    const DECLARED: &str = "
        void mm(int A[3][2], int B[2][4], int C[3][4]) {
            for (int i = 0; i < 3; i++)
                for (int j = 0; j < 4; j++) {
                    C[i][j] = 0;
                    for (int k = 0; k < 2; k++)
                        C[i][j] += A[i][k] * B[k][j];
                }
        }";

    const LINEAR: &str = "
        void mm(int* A, int* B, int* C, int rows, int cols, int common) {
            for (int i = 0; i < rows; i++)
                for (int j = 0; j < cols; j++) {
                    C[i * cols + j] = 0;
                    for (int k = 0; k < common; k++)
                        C[i * cols + j] += A[i * common + k] * B[k * cols + j];
                }
        }";

    #[test]
    fn test_declared_layout() {
        let mapped = map(DECLARED);
        let regions = &mapped.memory_map.regions;

        assert_eq!(
            regions.iter().map(|r| (r.base_address, r.size_bytes)).collect::<Vec<_>>(),
            vec![(0, 24), (24, 32), (56, 48)]
        );
        assert_eq!(regions[0].strides, vec![8, 4]);
        assert_eq!(regions[1].strides, vec![16, 4]);
        assert_eq!(regions[2].strides, vec![16, 4]);
    }

    #[test]
    fn test_linear_layout_matches_declared() {
        let (linear, ctx) =
            map_with(LINEAR, &[("rows", 3), ("cols", 4), ("common", 2)], PimConfig::default()).unwrap();
        let declared = map(DECLARED);

        for (l, d) in linear.memory_map.regions.iter().zip(&declared.memory_map.regions) {
            assert_eq!((l.base_address, l.size_bytes, &l.strides), (d.base_address, d.size_bytes, &d.strides));
        }
        assert_eq!(linear.nests, declared.nests);
        assert_eq!(
            ctx.mapping_report()[0],
            "memory mapping: A -> base 0x0000, 24 bytes, strides [8, 4]"
        );
    }

    #[test]
    fn test_address_expression_coefficients() {
        let mapped = map(DECLARED);
        let stmt = &mapped.nests[1].body[0];
        // B[k][j] inside (i, j, k)
        let b = stmt.value.reads()[1];
        assert_eq!(b.base, 24);
        assert_eq!(b.coefficients, vec![0, 4, 16]);
        assert_eq!(b.address_at(&[2, 3, 1]), 24 + 12 + 16);
        assert_eq!(stmt.target.coefficients, vec![16, 4, 0]);
    }

    #[test]
    fn test_alignment_and_base_address() {
        let config = PimConfig {
            base_address: 0x100,
            region_alignment: 64,
            ..PimConfig::default()
        };
        let (mapped, _) = map_with(
            "void f(char* A, long B[2]) { for (int i = 0; i < 3; i++) A[i] = 1; B[0] = 2; }",
            &[],
            config,
        )
        .unwrap();
        let regions = &mapped.memory_map.regions;
        assert_eq!((regions[0].base_address, regions[0].size_bytes), (0x100, 3));
        assert_eq!((regions[1].base_address, regions[1].size_bytes), (0x140, 16));
    }

    #[test]
    fn test_regions_never_overlap() {
        let mapped = map(DECLARED);
        let regions = &mapped.memory_map.regions;
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                assert!(!a.overlaps(b));
            }
        }
    }

    #[test]
    fn test_bump_allocator_skips_pinned_region() {
        let mut config = PimConfig::default();
        config.pinned_regions.insert("C".to_string(), 0);
        let (mapped, ctx) = map_with(DECLARED, &[], config).unwrap();
        let regions = &mapped.memory_map.regions;
        assert_eq!(regions[2].base_address, 0);
        assert_eq!(regions[0].base_address, 48);
        assert_eq!(regions[1].base_address, 72);
        assert!(ctx.mapping_report()[2].ends_with("(pinned)"));
    }

    #[test]
    fn test_pinned_overlap_is_reported() {
        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), 0);
        config.pinned_regions.insert("B".to_string(), 16);
        let err = map_with(DECLARED, &[], config).unwrap_err();
        assert_eq!(
            err,
            CompileError::Overlap {
                first: "A".to_string(),
                second: "B".to_string()
            }
        );
    }

    #[test]
    fn test_misaligned_pin_is_invalid() {
        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), 2);
        let err = map_with(DECLARED, &[], config).unwrap_err();
        assert!(matches!(err, CompileError::InvalidLayout { .. }));
    }

    #[test]
    fn test_pinned_base_outside_address_space() {
        let source = "void f(int* A) { for (int i = 0; i < 4; i++) A[i] = 1; }";

        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), u64::MAX - 3);
        let err = map_with(source, &[], config).unwrap_err();
        assert_eq!(
            err,
            CompileError::CapacityExceeded {
                required: u64::MAX,
                available: 65536
            }
        );

        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), 65536);
        let err = map_with(source, &[], config).unwrap_err();
        assert_eq!(err, CompileError::CapacityExceeded { required: 65552, available: 65536 });

        // Straddling the top of the address space
        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), 65528);
        let err = map_with(source, &[], config).unwrap_err();
        assert_eq!(err, CompileError::CapacityExceeded { required: 65544, available: 65536 });

        let mut config = PimConfig::default();
        config.pinned_regions.insert("A".to_string(), 65520);
        let (mapped, _) = map_with(source, &[], config).unwrap();
        assert_eq!(mapped.memory_map.end(), Some(65536));
    }

    #[test]
    fn test_region_end_is_checked() {
        let mut mapped = map(DECLARED);
        let region = &mut mapped.memory_map.regions[0];
        assert_eq!(region.end(), Some(24));
        assert!(region.contains(20, 4));
        assert!(!region.contains(u64::MAX, 4));

        region.base_address = u64::MAX - 3;
        assert_eq!(region.end(), None);
        assert!(!region.contains(u64::MAX - 3, 4));
        assert_eq!(mapped.memory_map.end(), None);
    }

    #[test]
    fn test_capacity_exceeded() {
        let config = PimConfig {
            address_space_bytes: 64,
            ..PimConfig::default()
        };
        let err = map_with(DECLARED, &[], config).unwrap_err();
        assert_eq!(err, CompileError::CapacityExceeded { required: 104, available: 64 });
    }

    #[test]
    fn test_data_dependent_index() {
        let err = map_with(
            "void f(int* A, int* idx, int* C) { for (int i = 0; i < 4; i++) C[i] = A[idx[i]]; }",
            &[],
            PimConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "UnresolvedIndexError");
    }

    #[test]
    fn test_out_of_bounds_access() {
        let err = map_with(
            "void f(int A[2][2]) { for (int i = 0; i < 2; i++) for (int j = 0; j < 3; j++) A[i][j] = 0; }",
            &[],
            PimConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::AccessOutOfBounds { .. }));

        let err = map_with(
            "void f(int* A) { for (int i = 0; i < 2; i++) A[i - 1] = 0; }",
            &[],
            PimConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::AccessOutOfBounds { .. }));
    }

    #[test]
    fn test_mapper_is_stateless_between_kernels() {
        let mapper = MemoryMapper::new(PimConfig::default());
        let unit = Parser::new(DECLARED).parse_translation_unit().unwrap();
        let mut ctx = CompilationContext::new(PimConfig::default());
        let kernel = Analyzer::new().analyze(&unit, None, &mut ctx).unwrap();

        let first = mapper.map(&kernel, &mut CompilationContext::default()).unwrap();
        let second = mapper.map(&kernel, &mut CompilationContext::default()).unwrap();
        assert_eq!(first, second);
    }
}
