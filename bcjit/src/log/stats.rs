//! Statistics about compilations. Durations are wall-clock time, so they are a rough guide only.

use parking_lot::Mutex;
use std::{
    cell::Cell,
    env, fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if `BCJIT_LOG_STATS` is set. Output is written when [Stats::output] is
/// called or the stats are dropped.
pub struct Stats {
    // Most runs record nothing: the `Option` makes "are stats enabled?" a null check.
    inner: Option<Mutex<StatsInner>>,
}

#[derive(Debug)]
struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    methods_compiled_ok: u64,
    methods_bailed_out: u64,
    internal_errors: u64,
    /// Summed over every compilation, including failed ones.
    nodes_created: u64,
    lir_instructions: u64,
    frame_states_created: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
    written: bool,
}

impl Stats {
    pub fn new() -> Self {
        match env::var("BCJIT_LOG_STATS") {
            Ok(p) => Self::with_output(p),
            Err(_) => Self::disabled(),
        }
    }

    /// Record statistics, writing them to `path` (`-` for stderr).
    pub fn with_output(path: String) -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new(path))),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    pub fn method_compiled_ok(&self) {
        self.update_with(|inner| inner.methods_compiled_ok += 1);
    }

    pub fn method_bailed_out(&self) {
        self.update_with(|inner| inner.methods_bailed_out += 1);
    }

    pub fn internal_error(&self) {
        self.update_with(|inner| inner.internal_errors += 1);
    }

    pub fn nodes_created(&self, n: usize) {
        self.update_with(|inner| inner.nodes_created += n as u64);
    }

    pub fn lir_instructions(&self, n: usize) {
        self.update_with(|inner| inner.lir_instructions += n as u64);
    }

    pub fn frame_states_created(&self, n: usize) {
        self.update_with(|inner| inner.frame_states_created += n as u64);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = COMPILER_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> Option<String> {
        self.inner.as_ref().map(|x| x.lock().to_json())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Stats {
    fn drop(&mut self) {
        self.update_with(|inner| {
            if !inner.written {
                inner.output()
            }
        });
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            methods_compiled_ok: 0,
            methods_bailed_out: 0,
            internal_errors: 0,
            nodes_created: 0,
            lir_instructions: 0,
            frame_states_created: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
            written: false,
        }
    }

    fn output(&mut self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
        self.written = true;
    }

    /// Turn these statistics into JSON, sorted by field name so that the output can be matched
    /// textually.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "methods_compiled_ok".to_owned(),
                self.methods_compiled_ok.to_string(),
            ),
            (
                "methods_bailed_out".to_owned(),
                self.methods_bailed_out.to_string(),
            ),
            (
                "internal_errors".to_owned(),
                self.internal_errors.to_string(),
            ),
            ("nodes_created".to_owned(), self.nodes_created.to_string()),
            (
                "lir_instructions".to_owned(),
                self.lir_instructions.to_string(),
            ),
            (
                "frame_states_created".to_owned(),
                self.frame_states_created.to_string(),
            ),
        ];
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The phases a compiling thread goes through.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
// Variants must range over `0..TimingState::COUNT`. Each variant's `to_string` is its key in the
// JSON output; an empty string omits it.
pub enum TimingState {
    /// Not compiling. Not displayed to the user.
    #[strum(to_string = "")]
    None,
    #[strum(to_string = "duration_building_graph")]
    BuildingGraph,
    #[strum(to_string = "duration_simplifying")]
    Simplifying,
    #[strum(to_string = "duration_scheduling")]
    Scheduling,
    #[strum(to_string = "duration_generating_lir")]
    GeneratingLir,
}

thread_local! {
    static COMPILER_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod test {
    use super::*;
    use fm::FMBuilder;

    #[test]
    fn disabled_records_nothing() {
        let s = Stats::disabled();
        s.method_compiled_ok();
        s.timing_state(TimingState::Scheduling);
        assert!(!s.is_enabled());
        assert_eq!(s.to_json(), None);
    }

    #[test]
    fn json_is_sorted() {
        let s = Stats::with_output("-".to_owned());
        s.method_compiled_ok();
        s.method_compiled_ok();
        s.method_bailed_out();
        s.nodes_created(10);
        s.nodes_created(5);
        s.lir_instructions(7);
        s.timing_state(TimingState::BuildingGraph);
        s.timing_state(TimingState::None);
        let json = s.to_json().unwrap();
        let fm = FMBuilder::new(
            r#"{
    "duration_building_graph": ...
    "duration_generating_lir": 0.000,
    "duration_scheduling": 0.000,
    "duration_simplifying": 0.000,
    "frame_states_created": 0,
    "internal_errors": 0,
    "lir_instructions": 7,
    "methods_bailed_out": 1,
    "methods_compiled_ok": 2,
    "nodes_created": 15
}"#,
        )
        .unwrap()
        .build()
        .unwrap();
        if let Err(e) = fm.matches(&json) {
            panic!("{e}");
        }
        // Keep the test's stderr clean.
        if let Some(m) = &s.inner {
            m.lock().written = true;
        }
    }
}
