//! Tiered time-bucket retention selection (§4.4).
//!
//! Pure and deterministic: given the same set of timestamped items and the
//! same policy, the kept set never depends on input order or on being run
//! more than once.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use clippy_utilities::NumericCast;

use crate::config::Retention;

/// One candidate for retention: an opaque id (e.g. a snapshot or archive
/// name) paired with its UTC creation timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionItem {
    /// Stable identifier, used both as the output and as the tie-break key
    pub id: String,
    /// UTC creation timestamp
    pub timestamp: DateTime<Utc>,
}

impl RetentionItem {
    /// Construct a new item
    #[must_use]
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            timestamp,
        }
    }
}

/// Select the subset of `items` to keep under `policy`.
///
/// With all four counts zero, nothing is kept. An item kept by any tier is
/// kept overall; ties within a bucket (equal timestamps) are broken by a
/// deterministic newer-first ordering that falls back to `id` so that the
/// result does not depend on input order.
#[must_use]
pub fn select_keep(items: &[RetentionItem], policy: &Retention) -> HashSet<String> {
    let mut sorted: Vec<&RetentionItem> = items.iter().collect();
    // newest first; equal timestamps broken by id, descending, for a total order
    sorted.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });

    let mut keep = HashSet::new();

    if policy.hourly > 0 {
        let count = policy.hourly.numeric_cast::<usize>();
        keep_tier(&sorted, count, &mut keep, |ts| (ts.year(), ts.ordinal(), ts.hour()));
    }
    if policy.daily > 0 {
        let count = policy.daily.numeric_cast::<usize>();
        keep_tier(&sorted, count, &mut keep, |ts| (ts.year(), ts.ordinal(), 0));
    }
    if policy.weekly > 0 {
        let count = policy.weekly.numeric_cast::<usize>();
        keep_tier(&sorted, count, &mut keep, |ts| {
            let week = ts.iso_week();
            (week.year(), week.week(), 1)
        });
    }
    if policy.monthly > 0 {
        let count = policy.monthly.numeric_cast::<usize>();
        keep_tier(&sorted, count, &mut keep, |ts| (ts.year(), ts.month(), 2));
    }

    keep
}

/// Walk `sorted` (already newest-first) and keep the first item seen in each
/// distinct bucket, until `count` distinct buckets have been captured.
fn keep_tier<K: Eq + std::hash::Hash>(
    sorted: &[&RetentionItem],
    count: usize,
    keep: &mut HashSet<String>,
    bucket_key: impl Fn(DateTime<Utc>) -> K,
) {
    let mut seen_buckets: HashSet<K> = HashSet::new();
    for item in sorted {
        if seen_buckets.len() >= count {
            break;
        }
        if seen_buckets.insert(bucket_key(item.timestamp)) {
            let _ = keep.insert(item.id.clone());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn base() -> DateTime<Utc> {
        "2024-01-15T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn all_zero_keeps_nothing() {
        let items = vec![RetentionItem::new("a", base())];
        let kept = select_keep(&items, &Retention::default());
        assert!(kept.is_empty());
    }

    #[test]
    fn quarter_hourly_48h_scenario() {
        // Scenario 5: every 15 min for 48h, hourly=6, daily=2, weekly=0, monthly=0
        let start = base();
        let items: Vec<RetentionItem> = (0..(48 * 4))
            .map(|i| RetentionItem::new(format!("i{i}"), start + Duration::minutes(15 * i)))
            .collect();
        let policy = Retention {
            hourly: 6,
            daily: 2,
            weekly: 0,
            monthly: 0,
        };
        let kept = select_keep(&items, &policy);
        // 6 distinct hourly buckets + 2 distinct daily buckets, the sets may overlap
        assert!(kept.len() <= 8);
        assert!(kept.len() >= 6);
    }

    #[test]
    fn determinism_across_permutations() {
        let start = base();
        let items: Vec<RetentionItem> = (0..20)
            .map(|i| RetentionItem::new(format!("i{i}"), start + Duration::hours(i)))
            .collect();
        let policy = Retention {
            hourly: 5,
            daily: 1,
            weekly: 0,
            monthly: 0,
        };
        let kept_forward = select_keep(&items, &policy);

        let mut reversed = items.clone();
        reversed.reverse();
        let kept_reversed = select_keep(&reversed, &policy);

        let mut shuffled = items.clone();
        shuffled.swap(0, 10);
        shuffled.swap(3, 17);
        let kept_shuffled = select_keep(&shuffled, &policy);

        assert_eq!(kept_forward, kept_reversed);
        assert_eq!(kept_forward, kept_shuffled);
    }

    #[test]
    fn idempotent_when_reapplied_to_kept_subset() {
        let start = base();
        let items: Vec<RetentionItem> = (0..100)
            .map(|i| RetentionItem::new(format!("i{i}"), start + Duration::hours(i)))
            .collect();
        let policy = Retention {
            hourly: 10,
            daily: 4,
            weekly: 2,
            monthly: 1,
        };
        let kept_once = select_keep(&items, &policy);
        let subset: Vec<RetentionItem> = items
            .iter()
            .filter(|i| kept_once.contains(&i.id))
            .cloned()
            .collect();
        let kept_twice = select_keep(&subset, &policy);
        assert_eq!(kept_once, kept_twice);
    }

    #[test]
    fn ties_broken_deterministically() {
        let ts = base();
        let items = vec![
            RetentionItem::new("b", ts),
            RetentionItem::new("a", ts),
            RetentionItem::new("c", ts),
        ];
        let policy = Retention {
            hourly: 1,
            ..Retention::default()
        };
        let kept = select_keep(&items, &policy);
        assert_eq!(kept.len(), 1);
        // "c" wins the id-descending tie break
        assert!(kept.contains("c"));
    }
}
