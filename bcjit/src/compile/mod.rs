//! The compilation pipeline: bytecode to graph, graph clean-ups, scheduling and LIR generation.

use crate::{
    builder::build_graph,
    bytecode::disassemble,
    config::Config,
    graph::{
        cfg::Schedule,
        simplify::{post_parse_cleanup, simplify},
        Graph, NodeIdx,
    },
    lir::{arch::ArchT, gen::generate, Lir},
    log::{
        log_ir, should_log_ir,
        stats::{Stats, TimingState},
        IRPhase, Log, Verbosity,
    },
    meta::{ConstantReflection, MetaAccess, ResolvedMethod},
};
use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// A failure to compile a method.
#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("Bailout: {0}")]
    /// The method cannot be compiled because of something in its bytecode (e.g. unbalanced
    /// monitors or stacks that do not match at a merge). The caller should run the method in
    /// the interpreter.
    Bailout(String),
    #[error("Internal error: {msg}{context}")]
    /// Something went wrong when compiling that is probably the result of a bug in the compiler.
    Internal { msg: String, context: ErrorContext },
    #[error("Resource exhausted: {0}")]
    /// A compiler limit (e.g. the number of graph nodes) was exceeded.
    ResourceExhausted(String),
}

impl CompilationError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompilationError::Internal {
            msg: msg.into(),
            context: ErrorContext::default(),
        }
    }

    /// Record the method being compiled in an internal error's context, if not already known.
    pub fn with_method(self, method: &str) -> Self {
        match self {
            CompilationError::Internal { msg, mut context } => {
                if context.method.is_none() {
                    context.method = Some(method.to_owned());
                }
                CompilationError::Internal { msg, context }
            }
            x => x,
        }
    }

    pub fn is_bailout(&self) -> bool {
        matches!(self, CompilationError::Bailout(_))
    }
}

/// Where an internal error occurred.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorContext {
    pub method: Option<String>,
    pub bci: Option<u32>,
    pub node: Option<NodeIdx>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(m) = &self.method {
            write!(f, " in {m}")?;
        }
        if let Some(bci) = self.bci {
            write!(f, " at bci {bci}")?;
        }
        if let Some(n) = self.node {
            write!(f, " (node %{})", usize::from(n))?;
        }
        Ok(())
    }
}

/// The LIR produced for architecture `A`.
pub type ArchLir<A> = Lir<<A as ArchT>::Reg, <A as ArchT>::Opcode>;

/// A method to compile. With an `entry_bci` the method is compiled for on-stack replacement,
/// entering at that bci.
#[derive(Clone, Debug)]
pub struct CompileRequest {
    pub method: Arc<ResolvedMethod>,
    pub entry_bci: Option<u32>,
}

impl CompileRequest {
    pub fn new(method: Arc<ResolvedMethod>) -> Self {
        Self {
            method,
            entry_bci: None,
        }
    }

    pub fn osr(method: Arc<ResolvedMethod>, entry_bci: u32) -> Self {
        Self {
            method,
            entry_bci: Some(entry_bci),
        }
    }
}

#[derive(Debug)]
pub struct CompileResult<A: ArchT> {
    pub graph: Graph,
    pub schedule: Schedule,
    pub lir: ArchLir<A>,
}

/// Compiles methods for architecture `A`. A compiler can be shared between threads compiling
/// different methods.
pub struct Compiler<A: ArchT> {
    arch: A,
    config: Config,
    meta: Arc<dyn MetaAccess>,
    reflection: Arc<dyn ConstantReflection>,
    log: Log,
    stats: Stats,
}

impl<A: ArchT> Compiler<A> {
    /// Create a compiler that logs and records statistics as the `BCJIT_LOG*` environment
    /// variables specify.
    pub fn new(
        arch: A,
        config: Config,
        meta: Arc<dyn MetaAccess>,
        reflection: Arc<dyn ConstantReflection>,
    ) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            arch,
            config,
            meta,
            reflection,
            log: Log::new()?,
            stats: Stats::new(),
        })
    }

    pub fn with_log(mut self, log: Log) -> Self {
        self.log = log;
        self
    }

    pub fn with_stats(mut self, stats: Stats) -> Self {
        self.stats = stats;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Compile `req`. Bailouts and resource exhaustion mean the method should be left to the
    /// interpreter.
    ///
    /// # Panics
    ///
    /// On an internal error if [Config::fatal_internal_errors] is set.
    pub fn compile(&self, req: &CompileRequest) -> Result<CompileResult<A>, CompilationError> {
        let name = req.method.qualified_name();
        self.log
            .log(Verbosity::CompilationEvent, &format!("compiling {name}"));
        let r = self.run(req);
        self.stats.timing_state(TimingState::None);
        match r {
            Ok(r) => {
                self.stats.method_compiled_ok();
                self.log.log(
                    Verbosity::CompilationEvent,
                    &format!(
                        "compiled {name}: {} nodes, {} blocks, {} instructions",
                        r.graph.node_count(),
                        r.schedule.blocks.len(),
                        r.lir.inst_count()
                    ),
                );
                Ok(r)
            }
            Err(e) => {
                let e = e.with_method(&name);
                match &e {
                    CompilationError::Bailout(_) | CompilationError::ResourceExhausted(_) => {
                        self.stats.method_bailed_out();
                        self.log.log(Verbosity::Warning, &format!("{name}: {e}"));
                    }
                    CompilationError::Internal { .. } => {
                        self.stats.internal_error();
                        self.log.log(Verbosity::Error, &e.to_string());
                        if self.config.fatal_internal_errors {
                            panic!("{e}");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn run(&self, req: &CompileRequest) -> Result<CompileResult<A>, CompilationError> {
        if should_log_ir(IRPhase::Bytecode) {
            log_ir(&format!(
                "--- Begin bytecode ---\n; {}\n{}--- End bytecode ---\n",
                req.method.qualified_name(),
                disassemble(&req.method.code)?
            ));
        }

        self.stats.timing_state(TimingState::BuildingGraph);
        let mut g = build_graph(
            &req.method,
            req.entry_bci,
            &self.config,
            &*self.meta,
            &*self.reflection,
        )?;
        post_parse_cleanup(&mut g);
        #[cfg(debug_assertions)]
        g.assert_well_formed();
        self.stats.nodes_created(g.node_capacity());
        self.stats.frame_states_created(g.frame_state_count());
        if should_log_ir(IRPhase::PreSimplify) {
            log_ir(&format!(
                "--- Begin graph-pre-simplify ---\n{g}--- End graph-pre-simplify ---\n"
            ));
        }

        if self.config.simplify {
            self.stats.timing_state(TimingState::Simplifying);
            simplify(&mut g);
            #[cfg(debug_assertions)]
            g.assert_well_formed();
            if should_log_ir(IRPhase::PostSimplify) {
                log_ir(&format!(
                    "--- Begin graph-post-simplify ---\n{g}--- End graph-post-simplify ---\n"
                ));
            }
        }

        self.stats.timing_state(TimingState::Scheduling);
        let schedule = Schedule::new(&g)?;
        if should_log_ir(IRPhase::Schedule) {
            log_ir(&format!(
                "--- Begin schedule ---\n{}--- End schedule ---\n",
                schedule.to_string(&g)
            ));
        }

        self.stats.timing_state(TimingState::GeneratingLir);
        let lir = generate(&self.arch, &self.config, &g, &schedule)?;
        self.stats.lir_instructions(lir.inst_count());
        if should_log_ir(IRPhase::Lir) {
            log_ir(&format!("--- Begin lir ---\n{lir}--- End lir ---\n"));
        }

        Ok(CompileResult {
            graph: g,
            schedule,
            lir,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        amd64::Amd64,
        bytecode::blockmap::test::method,
        config::ConfigBuilder,
        lir::Inst,
        meta::{HeapSnapshot, Registry},
    };

    fn compiler(config: Config) -> Compiler<Amd64> {
        Compiler {
            arch: Amd64::new(),
            config,
            meta: Arc::new(Registry::new()),
            reflection: Arc::new(HeapSnapshot::default()),
            log: Log::with_level(Verbosity::Disabled),
            stats: Stats::disabled(),
        }
    }

    #[test]
    fn compiles_a_loop() {
        let c = compiler(Config::default()).with_stats(Stats::with_output("-".to_owned()));
        let m = Arc::new(method(
            "(I)I",
            "
              iconst_0
              istore_1
            L0:
              iload_0
              ifle L1
              iload_1
              iload_0
              iadd
              istore_1
              iinc 0 -1
              goto L0
            L1:
              iload_1
              ireturn
            ",
        ));
        let r = c.compile(&CompileRequest::new(m)).unwrap();
        assert!(r.schedule.blocks.iter().any(|b| b.is_loop_header));
        assert_eq!(r.lir.blocks.len(), r.schedule.blocks.len());
        assert!(r
            .lir
            .iter_insts()
            .any(|i| matches!(i, Inst::Return { value: Some(_) })));
        let json = c.stats().to_json().unwrap();
        assert!(json.contains(r#""methods_compiled_ok": 1"#), "{json}");
        assert!(json.contains(&format!(r#""lir_instructions": {}"#, r.lir.inst_count())));
        c.stats().output();
    }

    #[test]
    fn synchronized_loop_reaches_lir() {
        let mut m = method(
            "(I)I",
            "
              iconst_0
              istore_1
            L0:
              iload_0
              ifle L1
              iinc 1 3
              iinc 0 -1
              goto L0
            L1:
              iload_1
              ireturn
            ",
        );
        m.is_synchronized = true;
        let r = compiler(Config::default())
            .compile(&CompileRequest::new(Arc::new(m)))
            .unwrap();
        let enters = r
            .lir
            .iter_insts()
            .filter(|i| matches!(i, Inst::MonitorEnter { .. }))
            .count();
        let exits = r
            .lir
            .iter_insts()
            .filter(|i| matches!(i, Inst::MonitorExit { .. }))
            .count();
        assert_eq!((enters, exits), (1, 1));
    }

    #[test]
    fn constant_folding_is_optional() {
        let src = "iconst_2\niconst_3\nimul\nireturn";
        let folded = compiler(Config::default())
            .compile(&CompileRequest::new(Arc::new(method("()I", src))))
            .unwrap();
        let unfolded = compiler(ConfigBuilder::new().simplify(false).build())
            .compile(&CompileRequest::new(Arc::new(method("()I", src))))
            .unwrap();
        let binaries = |l: &ArchLir<Amd64>| {
            l.iter_insts()
                .filter(|i| matches!(i, Inst::Binary { .. }))
                .count()
        };
        assert_eq!(binaries(&folded.lir), 0);
        assert_eq!(binaries(&unfolded.lir), 1);
    }

    #[test]
    fn bailouts_are_counted() {
        let c = compiler(Config::default()).with_stats(Stats::with_output("-".to_owned()));
        let m = Arc::new(method(
            "(Ljava/lang/Object;)V",
            "aload_0\nmonitorenter\nreturn",
        ));
        match c.compile(&CompileRequest::new(m)) {
            Err(e @ CompilationError::Bailout(_)) => {
                assert!(e.to_string().contains("unbalanced monitors"), "{e}")
            }
            x => panic!("{x:?}"),
        }
        let json = c.stats().to_json().unwrap();
        assert!(json.contains(r#""methods_bailed_out": 1"#), "{json}");
        assert!(json.contains(r#""methods_compiled_ok": 0"#), "{json}");
        c.stats().output();
    }

    #[test]
    fn internal_errors_name_the_method() {
        let e = CompilationError::internal("oops").with_method("T.m()V");
        assert_eq!(e.to_string(), "Internal error: oops in T.m()V");
        let e = CompilationError::Internal {
            msg: "oops".into(),
            context: ErrorContext {
                method: Some("T.m()V".into()),
                bci: Some(3),
                node: Some(NodeIdx::new(7)),
            },
        }
        .with_method("U.n()V");
        assert_eq!(e.to_string(), "Internal error: oops in T.m()V at bci 3 (node %7)");
        assert!(!e.is_bailout());
    }
}
