//! Sorted levels and metric inheritance.
//!
//! Plan levels are a map, so they carry no order. The collector's tick
//! loop needs an ascending-by-frequency list it can walk with a modulo
//! check, and it needs each level to be *complete*: a plan that says
//! "collect X every 5s and Y every 10s" means "every 10s, collect X and
//! Y". Both views are materialized once per plan swap, never per tick.

use crate::Plan;

/// One entry in the sorted view: level name and frequency in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedLevel {
    pub name: String,
    pub freq: i64,
}

/// Build the sorted level list for `plan` and apply metric inheritance to
/// the plan value itself.
///
/// Sorting is ascending by frequency; ties break by level name, so the
/// result is stable for a given plan. Inheritance merges every domain
/// configured at a faster level into every slower level: a domain new to
/// the slower level is copied whole (options included); a domain already
/// present there keeps its own options and gains only the metric names it
/// does not already list. That last rule makes the transformation
/// idempotent: applying it to an already-inherited plan changes nothing.
///
/// Levels whose frequency does not validate are skipped; `Plan::validate`
/// rejects them before any plan gets this far.
pub fn sorted_levels(plan: &mut Plan) -> Vec<SortedLevel> {
    let mut levels: Vec<SortedLevel> = plan
        .levels
        .values()
        .filter_map(|l| {
            l.freq_secs().ok().map(|freq| SortedLevel {
                name: l.name.clone(),
                freq,
            })
        })
        .collect();
    levels.sort_by(|a, b| a.freq.cmp(&b.freq).then_with(|| a.name.cmp(&b.name)));

    // Inheritance: level i's domains apply to every level j > i.
    for i in 0..levels.len() {
        let root = match plan.levels.get(&levels[i].name) {
            Some(l) => l.collect.clone(),
            None => continue,
        };
        for j in i + 1..levels.len() {
            let leaf = match plan.levels.get_mut(&levels[j].name) {
                Some(l) => l,
                None => continue,
            };
            for (domain, spec) in &root {
                match leaf.collect.get_mut(domain) {
                    None => {
                        leaf.collect.insert(domain.clone(), spec.clone());
                    }
                    Some(existing) => {
                        for metric in &spec.metrics {
                            if !existing.metrics.contains(metric) {
                                existing.metrics.push(metric.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    levels
}

/// Which level (if any) is due at whole-second tick `s`: the
/// greatest-index sorted level whose frequency divides `s`.
pub fn level_at_tick(levels: &[SortedLevel], s: i64) -> Option<&SortedLevel> {
    let mut due = None;
    for level in levels {
        if s % level.freq == 0 {
            due = Some(level);
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(text: &str) -> Plan {
        Plan::from_toml("test", text).unwrap()
    }

    const FAST_SLOW: &str = r#"
[levels.slow]
freq = "10s"

[levels.slow.collect."size.data"]
options = { total = "yes" }

[levels.fast]
freq = "1s"

[levels.fast.collect."status.global"]
metrics = ["threads_running"]
"#;

    #[test]
    fn sorts_ascending_by_freq() {
        let mut p = plan(FAST_SLOW);
        let levels = sorted_levels(&mut p);
        assert_eq!(
            levels,
            vec![
                SortedLevel { name: "fast".into(), freq: 1 },
                SortedLevel { name: "slow".into(), freq: 10 },
            ]
        );
    }

    #[test]
    fn ties_break_by_name() {
        let mut p = plan(
            "[levels.b]\nfreq = \"5s\"\n[levels.a]\nfreq = \"5s\"\n[levels.c]\nfreq = \"1s\"\n",
        );
        let levels = sorted_levels(&mut p);
        let names: Vec<&str> = levels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn faster_domains_flow_into_slower_levels() {
        let mut p = plan(FAST_SLOW);
        sorted_levels(&mut p);

        let slow = &p.levels["slow"];
        // slow keeps its own domain and gains the fast one, options intact.
        assert!(slow.collect.contains_key("size.data"));
        let inherited = &slow.collect["status.global"];
        assert_eq!(inherited.metrics, vec!["threads_running"]);
        // fast is untouched.
        assert!(!p.levels["fast"].collect.contains_key("size.data"));
    }

    #[test]
    fn shared_domain_merges_metrics_and_keeps_leaf_options() {
        let mut p = plan(
            r#"
[levels.fast]
freq = "1s"

[levels.fast.collect."status.global"]
options = { all = "no" }
metrics = ["queries"]

[levels.slow]
freq = "5s"

[levels.slow.collect."status.global"]
options = { all = "yes" }
metrics = ["threads_running", "queries"]
"#,
        );
        sorted_levels(&mut p);
        let slow = &p.levels["slow"].collect["status.global"];
        // Existing options win; metric lists merge without duplicates.
        assert_eq!(slow.options["all"], "yes");
        assert_eq!(slow.metrics, vec!["threads_running", "queries"]);
    }

    #[test]
    fn inheritance_is_idempotent() {
        let mut once = plan(FAST_SLOW);
        sorted_levels(&mut once);
        let mut twice = once.clone();
        let l1 = sorted_levels(&mut twice);
        let mut again = once.clone();
        let l2 = sorted_levels(&mut again);
        assert_eq!(once, twice);
        assert_eq!(l1, l2);
    }

    #[test]
    fn level_at_tick_picks_slowest_divisible() {
        let levels = vec![
            SortedLevel { name: "fast".into(), freq: 1 },
            SortedLevel { name: "mid".into(), freq: 5 },
            SortedLevel { name: "slow".into(), freq: 10 },
        ];
        assert_eq!(level_at_tick(&levels, 0).unwrap().name, "slow");
        assert_eq!(level_at_tick(&levels, 1).unwrap().name, "fast");
        assert_eq!(level_at_tick(&levels, 5).unwrap().name, "mid");
        assert_eq!(level_at_tick(&levels, 10).unwrap().name, "slow");
        assert_eq!(level_at_tick(&levels, 7).unwrap().name, "fast");

        let sparse = vec![SortedLevel { name: "only".into(), freq: 5 }];
        assert!(level_at_tick(&sparse, 3).is_none());
        assert_eq!(level_at_tick(&sparse, 5).unwrap().name, "only");
    }
}
