//! The implementation of the `BCJIT_LOG*` environment variables.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub mod stats;

/// How verbose should normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings, including bailouts.
    Warning,
    /// Log the start and end of each compilation.
    CompilationEvent,
}

pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    /// Create a logger as specified by `BCJIT_LOG`, defaulting to logging errors to stderr.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("BCJIT_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Parse a `[<path|->:]<level>` string.
    pub fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any previous run's log.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("BCJIT_LOG must be of the format `[<path|->:]<level>`".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid BCJIT_LOG level '{s}': {e}"))?;
        let level = Verbosity::from_repr(level).ok_or_else(|| {
            format!(
                "BCJIT_LOG level {level} exceeds maximum {}",
                Verbosity::COUNT - 1
            )
        })?;
        Ok(Self { path, level })
    }

    pub fn with_level(level: Verbosity) -> Self {
        Self { level, path: None }
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "bcjit-error",
                Verbosity::Warning => "bcjit-warning",
                Verbosity::CompilationEvent => "bcjit-compilation-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IRPhase {
    /// The method's bytecode, disassembled.
    Bytecode,
    /// The graph as built, after dead code has been removed.
    PreSimplify,
    /// The graph after canonicalisation.
    PostSimplify,
    /// The graph's blocks and the nodes scheduled in each.
    Schedule,
    Lir,
}

impl IRPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "bytecode" => Ok(Self::Bytecode),
            "graph-pre-simplify" => Ok(Self::PreSimplify),
            "graph-post-simplify" => Ok(Self::PostSimplify),
            "schedule" => Ok(Self::Schedule),
            "lir" => Ok(Self::Lir),
            _ => Err(format!("Invalid BCJIT_LOG_IR value: {s}").into()),
        }
    }
}

mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> =
        LazyLock::new(|| match env::var("BCJIT_LOG_IR") {
            Ok(x) => match parse(&x) {
                Ok(x) => Some(x),
                Err(e) => {
                    eprintln!("bcjit-error: {e}");
                    None
                }
            },
            Err(_) => None,
        });

    /// Parse a `[<path>:]<phase_1>[,...,<phase_n>]` string.
    pub(super) fn parse(s: &str) -> Result<(String, HashSet<IRPhase>), Box<dyn Error>> {
        let (path, phases) = match s.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => {
                return Err(
                    "BCJIT_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"
                        .into(),
                )
            }
        };
        let mut log_phases = HashSet::new();
        for x in phases.split(',') {
            log_phases.insert(IRPhase::from_str(x)?);
        }
        if path != "-" {
            // Truncate any previous run's log.
            File::create(path).ok();
        }
        Ok((path.to_string(), log_phases))
    }

    pub fn should_log_ir(phase: IRPhase) -> bool {
        LOG_IR
            .as_ref()
            .is_some_and(|(_, phases)| phases.contains(&phase))
    }

    pub fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn log_levels() {
        let l = Log::parse("-:2").unwrap();
        assert_eq!(l.level(), Verbosity::Warning);
        assert!(l.path.is_none());
        assert_eq!(Log::parse("3").unwrap().level(), Verbosity::CompilationEvent);
        assert_eq!(
            Log::parse("4").err().unwrap().to_string(),
            "BCJIT_LOG level 4 exceeds maximum 3"
        );
        assert!(Log::parse("x").is_err());
        assert!(Log::parse("a:b:1").is_err());
        assert!(Verbosity::Warning > Verbosity::Error);
    }

    #[test]
    fn ir_phases() {
        let (path, phases) = internals::parse("graph-pre-simplify,lir").unwrap();
        assert_eq!(path, "-");
        assert_eq!(phases.len(), 2);
        assert!(phases.contains(&IRPhase::Lir));
        assert!(!phases.contains(&IRPhase::Schedule));
        assert_eq!(
            internals::parse("-:jit-asm").err().unwrap().to_string(),
            "Invalid BCJIT_LOG_IR value: jit-asm"
        );
    }
}
