//! Per-invocation compilation state
//!
//! A fresh context is built for every compilation and threaded through the
//! analyzer, mapper and generator. Nothing here outlives one kernel.

use crate::hardware::PimConfig;

#[derive(Debug, Clone, Default)]
pub struct CompilationContext {
    pub config: PimConfig,
    mapping_report: Vec<String>,
    warnings: Vec<String>,
}

impl CompilationContext {
    pub fn new(config: PimConfig) -> Self {
        Self {
            config,
            mapping_report: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Record one line of the memory mapping report
    pub fn report(&mut self, line: String) {
        log::info!("{}", line);
        self.mapping_report.push(line);
    }

    pub fn warn(&mut self, message: String) {
        log::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn mapping_report(&self) -> &[String] {
        &self.mapping_report
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_empty() {
        let mut ctx = CompilationContext::new(PimConfig::default());
        ctx.report("memory mapping: A -> base 0x0000".to_string());
        ctx.warn("loop `i` never executes".to_string());
        assert_eq!(ctx.mapping_report().len(), 1);
        assert_eq!(ctx.warnings().len(), 1);

        let fresh = CompilationContext::new(ctx.config.clone());
        assert!(fresh.mapping_report().is_empty());
        assert!(fresh.warnings().is_empty());
    }
}
