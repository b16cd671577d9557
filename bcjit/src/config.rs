//! Compiler configuration.
//!
//! A [Config] is created through a [ConfigBuilder] and is then immutable: it is threaded through
//! the graph builder and the LIR generator of every compilation.

use crate::compile::CompilationError;
use std::env;

/// The environment variable read by [ConfigBuilder::from_env].
pub const OPTS_ENV: &str = "BCJIT_OPTS";

#[derive(Clone, Debug)]
pub struct Config {
    /// Switches with at most this many keys are lowered to a sequence of compares.
    pub sequential_switch_limit: usize,
    /// Switches with at least this many keys per contiguous range are lowered to range tests.
    pub range_tests_switch_density: usize,
    /// Compute local variable liveness. If disabled, every local is considered live everywhere,
    /// which creates more phis but is occasionally useful for debugging.
    pub liveness_analysis: bool,
    /// Check for null pointers, out of bounds indices and division by zero with explicit
    /// branches to exception-throwing code rather than relying on implicit traps.
    pub explicit_exceptions: bool,
    /// Never give calls an exception edge.
    pub omit_exception_edges: bool,
    /// How deep to inline. 0 disables inlining.
    pub max_inline_depth: usize,
    pub max_inline_bytecode_size: usize,
    pub simplify: bool,
    /// Turn internal errors into panics.
    pub fatal_internal_errors: bool,
    /// Abort compilation of graphs larger than this.
    pub max_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Builds a [Config], starting from the defaults.
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config {
                sequential_switch_limit: 4,
                range_tests_switch_density: 5,
                liveness_analysis: true,
                explicit_exceptions: false,
                omit_exception_edges: false,
                max_inline_depth: 0,
                max_inline_bytecode_size: 35,
                simplify: true,
                fatal_internal_errors: false,
                max_nodes: 1_000_000,
            },
        }
    }

    /// Create a builder from the defaults overlaid with the comma separated `key=value` pairs in
    /// the `BCJIT_OPTS` environment variable.
    pub fn from_env() -> Result<Self, CompilationError> {
        let b = Self::new();
        match env::var(OPTS_ENV) {
            Ok(s) => b.parse_opts(&s),
            Err(_) => Ok(b),
        }
    }

    /// Overlay the comma separated `key=value` pairs in `s`.
    pub fn parse_opts(mut self, s: &str) -> Result<Self, CompilationError> {
        for opt in s.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let (k, v) = opt.split_once('=').ok_or_else(|| {
                CompilationError::internal(format!("{OPTS_ENV}: expected key=value, got '{opt}'"))
            })?;
            let (k, v) = (k.trim(), v.trim());
            let bad = || CompilationError::internal(format!("{OPTS_ENV}: bad value for {k}: '{v}'"));
            let num = || v.parse::<usize>().map_err(|_| bad());
            let flag = || v.parse::<bool>().map_err(|_| bad());
            let c = &mut self.config;
            match k {
                "sequential_switch_limit" => c.sequential_switch_limit = num()?,
                "range_tests_switch_density" => c.range_tests_switch_density = num()?,
                "liveness_analysis" => c.liveness_analysis = flag()?,
                "explicit_exceptions" => c.explicit_exceptions = flag()?,
                "omit_exception_edges" => c.omit_exception_edges = flag()?,
                "max_inline_depth" => c.max_inline_depth = num()?,
                "max_inline_bytecode_size" => c.max_inline_bytecode_size = num()?,
                "simplify" => c.simplify = flag()?,
                "fatal_internal_errors" => c.fatal_internal_errors = flag()?,
                "max_nodes" => c.max_nodes = num()?,
                _ => {
                    return Err(CompilationError::internal(format!(
                        "{OPTS_ENV}: unknown option '{k}'"
                    )))
                }
            }
        }
        Ok(self)
    }

    pub fn build(self) -> Config {
        self.config
    }

    pub fn sequential_switch_limit(mut self, x: usize) -> Self {
        self.config.sequential_switch_limit = x;
        self
    }

    pub fn range_tests_switch_density(mut self, x: usize) -> Self {
        self.config.range_tests_switch_density = x;
        self
    }

    pub fn liveness_analysis(mut self, x: bool) -> Self {
        self.config.liveness_analysis = x;
        self
    }

    pub fn explicit_exceptions(mut self, x: bool) -> Self {
        self.config.explicit_exceptions = x;
        self
    }

    pub fn omit_exception_edges(mut self, x: bool) -> Self {
        self.config.omit_exception_edges = x;
        self
    }

    pub fn max_inline_depth(mut self, x: usize) -> Self {
        self.config.max_inline_depth = x;
        self
    }

    pub fn max_inline_bytecode_size(mut self, x: usize) -> Self {
        self.config.max_inline_bytecode_size = x;
        self
    }

    pub fn simplify(mut self, x: bool) -> Self {
        self.config.simplify = x;
        self
    }

    pub fn fatal_internal_errors(mut self, x: bool) -> Self {
        self.config.fatal_internal_errors = x;
        self
    }

    pub fn max_nodes(mut self, x: usize) -> Self {
        self.config.max_nodes = x;
        self
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.sequential_switch_limit, 4);
        assert_eq!(c.range_tests_switch_density, 5);
        assert!(c.liveness_analysis);
        assert!(!c.explicit_exceptions);
        assert_eq!(c.max_inline_depth, 0);
        assert_eq!(c.max_inline_bytecode_size, 35);
        assert_eq!(c.max_nodes, 1_000_000);
    }

    #[test]
    fn opts() {
        let c = ConfigBuilder::new()
            .parse_opts("max_inline_depth=2, simplify=false,,explicit_exceptions=true")
            .unwrap()
            .build();
        assert_eq!(c.max_inline_depth, 2);
        assert!(!c.simplify);
        assert!(c.explicit_exceptions);
        assert!(ConfigBuilder::new().parse_opts("simplify").is_err());
        assert!(ConfigBuilder::new().parse_opts("simplify=maybe").is_err());
        assert!(ConfigBuilder::new().parse_opts("colour=blue").is_err());
    }
}
