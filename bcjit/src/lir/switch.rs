//! Choosing how to lower an integer switch.

use crate::{
    config::Config,
    graph::{cfg::BlockId, nodes::SwitchKind},
};
use std::fmt::{self, Display, Formatter};

/// Jump tables longer than this are not built.
pub const MAX_TABLE_LEN: usize = 1 << 16;

/// A maximal run of consecutive keys with the same target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwitchRange {
    pub low: i32,
    pub high: i32,
    pub dest: BlockId,
}

/// One test in a [super::Inst::SwitchRanges] sequence, tried in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RangeTest {
    /// Jump to `dest` if the value equals `key`.
    Eq { key: i32, dest: BlockId },
    /// Jump to `dest` if `low <= value <= high`.
    Range { low: i32, high: i32, dest: BlockId },
}

impl Display for RangeTest {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            RangeTest::Eq { key, dest } => write!(f, "eq {key} -> bb{}", dest.index()),
            RangeTest::Range { low, high, dest } => {
                write!(f, "ge {low} le {high} -> bb{}", dest.index())
            }
        }
    }
}

/// How a switch is lowered.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SwitchStrategy {
    /// Compare against every key in turn.
    Sequential,
    RangeTests(Vec<RangeTest>),
    /// Index a jump table with `value - low`.
    Table { low: i32, targets: Vec<BlockId> },
}

/// Group `keys` (which must be sorted and distinct) into maximal runs of consecutive keys with
/// the same target. Runs that go to `default` are dropped.
pub fn build_ranges(keys: &[i32], dests: &[BlockId], default: BlockId) -> Vec<SwitchRange> {
    let mut ranges: Vec<SwitchRange> = Vec::new();
    for (&k, &d) in keys.iter().zip(dests) {
        match ranges.last_mut() {
            Some(r) if r.dest == d && i64::from(r.high) + 1 == i64::from(k) => r.high = k,
            _ => ranges.push(SwitchRange {
                low: k,
                high: k,
                dest: d,
            }),
        }
    }
    ranges.retain(|r| r.dest != default);
    ranges
}

/// Decide how to lower a switch over the sorted, distinct `keys`. A `tableswitch` with more than
/// `sequential_switch_limit` keys gets range tests when its ranges are dense enough, and a jump
/// table otherwise. A `lookupswitch` with at least that many keys always gets range tests.
pub fn choose(
    config: &Config,
    kind: SwitchKind,
    keys: &[i32],
    dests: &[BlockId],
    default: BlockId,
) -> SwitchStrategy {
    let sequential = match kind {
        SwitchKind::Table => keys.len() <= config.sequential_switch_limit,
        SwitchKind::Lookup => keys.len() < config.sequential_switch_limit,
    };
    if keys.is_empty() || sequential {
        return SwitchStrategy::Sequential;
    }
    let ranges = build_ranges(keys, dests, default);
    if ranges.is_empty() {
        return SwitchStrategy::Sequential;
    }
    if kind == SwitchKind::Lookup
        || keys.len() / ranges.len() >= config.range_tests_switch_density
    {
        let mut tests = Vec::with_capacity(ranges.len());
        for r in ranges {
            if r.low == r.high {
                tests.push(RangeTest::Eq {
                    key: r.low,
                    dest: r.dest,
                });
            } else if i64::from(r.low) + 1 == i64::from(r.high) {
                tests.push(RangeTest::Eq {
                    key: r.low,
                    dest: r.dest,
                });
                tests.push(RangeTest::Eq {
                    key: r.high,
                    dest: r.dest,
                });
            } else {
                tests.push(RangeTest::Range {
                    low: r.low,
                    high: r.high,
                    dest: r.dest,
                });
            }
        }
        return SwitchStrategy::RangeTests(tests);
    }
    let (Some(&low), Some(&high)) = (keys.first(), keys.last()) else {
        return SwitchStrategy::Sequential;
    };
    let len = usize::try_from(i64::from(high) - i64::from(low) + 1).unwrap_or(usize::MAX);
    if len > MAX_TABLE_LEN {
        return SwitchStrategy::Sequential;
    }
    let mut targets = vec![default; len];
    for (&k, &d) in keys.iter().zip(dests) {
        targets[usize::try_from(i64::from(k) - i64::from(low)).unwrap_or(0)] = d;
    }
    SwitchStrategy::Table { low, targets }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ConfigBuilder;

    fn b(i: usize) -> BlockId {
        BlockId::new(i)
    }

    #[test]
    fn ranges_are_maximal() {
        let keys = [0, 1, 2, 5, 6, 7];
        let dests = [b(1), b(1), b(1), b(2), b(2), b(2)];
        assert_eq!(
            build_ranges(&keys, &dests, b(9)),
            vec![
                SwitchRange {
                    low: 0,
                    high: 2,
                    dest: b(1)
                },
                SwitchRange {
                    low: 5,
                    high: 7,
                    dest: b(2)
                }
            ]
        );
        // A gap splits a run even if the target is the same.
        let dests = [b(1); 6];
        assert_eq!(build_ranges(&keys, &dests, b(9)).len(), 2);
        // Runs to the default are dropped.
        assert!(build_ranges(&keys, &dests, b(1)).is_empty());
    }

    #[test]
    fn strategies() {
        let c = ConfigBuilder::new()
            .sequential_switch_limit(4)
            .range_tests_switch_density(3)
            .build();
        let keys = [0, 1, 2, 5, 6, 7];
        let dests = [b(1), b(1), b(1), b(2), b(2), b(2)];
        assert_eq!(
            choose(&c, SwitchKind::Table, &keys[..4], &dests[..4], b(9)),
            SwitchStrategy::Sequential
        );
        assert_eq!(
            choose(&c, SwitchKind::Table, &[], &[], b(9)),
            SwitchStrategy::Sequential
        );
        let s = choose(&c, SwitchKind::Table, &keys, &dests, b(9));
        assert_eq!(
            s,
            SwitchStrategy::RangeTests(vec![
                RangeTest::Range {
                    low: 0,
                    high: 2,
                    dest: b(1)
                },
                RangeTest::Range {
                    low: 5,
                    high: 7,
                    dest: b(2)
                }
            ])
        );
        if let SwitchStrategy::RangeTests(ts) = s {
            assert_eq!(ts[0].to_string(), "ge 0 le 2 -> bb1");
        }

        // Every key has its own target: too sparse for range tests.
        let dests = [b(1), b(2), b(3), b(4), b(5), b(6)];
        match choose(&c, SwitchKind::Table, &keys, &dests, b(9)) {
            SwitchStrategy::Table { low, targets } => {
                assert_eq!(low, 0);
                assert_eq!(
                    targets,
                    vec![b(1), b(2), b(3), b(9), b(9), b(4), b(5), b(6)]
                );
            }
            x => panic!("{x:?}"),
        }
    }

    #[test]
    fn lookup_switches_never_use_tables() {
        let c = ConfigBuilder::new()
            .sequential_switch_limit(4)
            .range_tests_switch_density(5)
            .build();
        let keys = [0, 1000, 2000, 3000, 4000, 5000];
        let dests = [b(1), b(2), b(3), b(4), b(5), b(6)];
        assert!(matches!(
            choose(&c, SwitchKind::Table, &keys, &dests, b(9)),
            SwitchStrategy::Table { .. }
        ));
        let tests = keys
            .iter()
            .zip(dests)
            .map(|(&key, dest)| RangeTest::Eq { key, dest })
            .collect();
        assert_eq!(
            choose(&c, SwitchKind::Lookup, &keys, &dests, b(9)),
            SwitchStrategy::RangeTests(tests)
        );

        // At the limit a tableswitch is still sequential but a lookupswitch is not.
        assert_eq!(
            choose(&c, SwitchKind::Table, &keys[..4], &dests[..4], b(9)),
            SwitchStrategy::Sequential
        );
        assert!(matches!(
            choose(&c, SwitchKind::Lookup, &keys[..4], &dests[..4], b(9)),
            SwitchStrategy::RangeTests(_)
        ));
    }

    #[test]
    fn narrow_ranges_become_equality_tests() {
        let c = ConfigBuilder::new()
            .sequential_switch_limit(1)
            .range_tests_switch_density(2)
            .build();
        let keys = [3, 4, 10, 11];
        let dests = [b(1), b(1), b(2), b(2)];
        assert_eq!(
            choose(&c, SwitchKind::Table, &keys, &dests, b(0)),
            SwitchStrategy::RangeTests(vec![
                RangeTest::Eq { key: 3, dest: b(1) },
                RangeTest::Eq { key: 4, dest: b(1) },
                RangeTest::Eq { key: 10, dest: b(2) },
                RangeTest::Eq { key: 11, dest: b(2) },
            ])
        );
    }
}
