//! A method JIT compiler backend for stack-machine bytecode.
//!
//! A method's bytecode is parsed into a graph of nodes ([graph]) by [builder::build_graph],
//! cleaned up and optionally simplified, scheduled into basic blocks and lowered to LIR for a
//! target architecture ([lir], [amd64]). Every point at which compiled code may deoptimise
//! carries a [debug_info::DebugInfo] describing the interpreter frames to rebuild. [compile]
//! strings the phases together.

#![allow(clippy::type_complexity)]
#![allow(clippy::comparison_chain)]

pub mod amd64;
pub mod builder;
pub mod bytecode;
pub mod compile;
pub mod config;
pub mod debug_info;
pub mod graph;
pub mod lir;
pub mod log;
pub mod meta;

pub use compile::{CompilationError, CompileRequest, CompileResult, Compiler};
pub use config::{Config, ConfigBuilder};
