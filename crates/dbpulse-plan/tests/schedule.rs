//! Round-trip property: a plan serialized to TOML and reloaded must
//! produce the same tick-by-tick collection schedule.

use dbpulse_plan::sorted::{level_at_tick, sorted_levels, SortedLevel};
use dbpulse_plan::Plan;

const PLAN: &str = r#"
[levels.fast]
freq = "1s"

[levels.fast.collect."status.global"]
metrics = ["threads_running"]

[levels.mid]
freq = "2s"

[levels.mid.collect."var.global"]
metrics = ["max_connections"]

[levels.slow]
freq = "5s"

[levels.slow.collect."size.data"]
options = { total = "yes" }
"#;

/// The schedule over ticks `0..=last`: which level collects at each tick.
fn schedule(levels: &[SortedLevel], last: i64) -> Vec<Option<String>> {
    (0..=last)
        .map(|s| level_at_tick(levels, s).map(|l| l.name.clone()))
        .collect()
}

#[test]
fn reloaded_plan_keeps_the_collection_schedule() {
    let mut original = Plan::from_toml("p", PLAN).unwrap();
    original.validate().unwrap();

    let text = original.to_toml();
    let mut reloaded = Plan::from_toml("p", &text).unwrap();
    reloaded.validate().unwrap();

    let original_levels = sorted_levels(&mut original);
    let reloaded_levels = sorted_levels(&mut reloaded);
    assert_eq!(original_levels, reloaded_levels);

    // lcm(1, 2, 5) = 10: one full cycle.
    let got = schedule(&reloaded_levels, 10);

    // Independently computed: the slowest divisible level wins each tick.
    let expected: Vec<Option<String>> = [
        "slow", "fast", "mid", "fast", "mid", "slow", "mid", "fast", "mid", "fast", "slow",
    ]
    .iter()
    .map(|s| Some(s.to_string()))
    .collect();
    assert_eq!(got, expected);

    // And the schedule repeats with the cycle.
    assert_eq!(schedule(&reloaded_levels, 10), schedule(&original_levels, 10));
    for s in 0..=10 {
        assert_eq!(
            level_at_tick(&reloaded_levels, s).map(|l| l.name.clone()),
            level_at_tick(&reloaded_levels, s + 10).map(|l| l.name.clone()),
        );
    }
}

#[test]
fn one_level_plan_collects_on_multiples_only() {
    let mut plan = Plan::from_toml(
        "p",
        "[levels.only]\nfreq = \"5s\"\n[levels.only.collect.\"status.global\"]\n",
    )
    .unwrap();
    let levels = sorted_levels(&mut plan);

    for s in 0..=20 {
        let due = level_at_tick(&levels, s);
        if s % 5 == 0 {
            assert_eq!(due.unwrap().name, "only");
        } else {
            assert!(due.is_none(), "level due at s={s}");
        }
    }
}
