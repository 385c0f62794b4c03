//! Occasion rules from community A/B comparison votes.

use std::collections::BTreeMap;

use crate::storage::{ComparisonPost, DiscoveredRule};

/// Posts scanned per pass.
pub const COMPARISON_WINDOW: i64 = 500;
/// Posts with fewer votes are ignored.
const MIN_VOTES: i64 = 5;
/// Winner share at which a post counts as decisive.
const DECISIVE_SHARE: f64 = 0.65;
/// Posts required per occasion.
const MIN_POSTS: usize = 5;
/// Decisive share of posts required per occasion.
const MIN_DECISIVE_RATE: f64 = 0.6;

/// Category of rules this pass produces.
pub const OCCASION_CATEGORY: &str = "occasion";

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    total: usize,
    decisive: usize,
}

/// Prefix shared by every rule about `occasion`.
pub fn rule_prefix(occasion: &str) -> String {
    format!("For \"{}\"", occasion)
}

/// Build occasion rules from comparison posts.
///
/// Skips occasions for which `has_rule` already reports a rule.
pub fn comparison_rules(
    posts: &[ComparisonPost],
    has_rule: impl Fn(&str) -> bool,
) -> Vec<DiscoveredRule> {
    let mut by_occasion: BTreeMap<&str, Tally> = BTreeMap::new();

    for post in posts {
        if post.total_votes() < MIN_VOTES {
            continue;
        }
        let decisive = post.winner_share().is_some_and(|s| s >= DECISIVE_SHARE);
        for occasion in &post.categories {
            let tally = by_occasion.entry(occasion.as_str()).or_default();
            tally.total += 1;
            if decisive {
                tally.decisive += 1;
            }
        }
    }

    by_occasion
        .into_iter()
        .filter(|(_, t)| t.total >= MIN_POSTS)
        .filter_map(|(occasion, t)| {
            let rate = t.decisive as f64 / t.total as f64;
            if rate < MIN_DECISIVE_RATE || has_rule(occasion) {
                return None;
            }
            Some(DiscoveredRule::new(
                OCCASION_CATEGORY,
                format!(
                    "{}, community comparisons show decisive preferences ({:.0}% decisive rate, n={}). \
                     Users have strong opinions here: give specific, opinionated advice rather than hedging.",
                    rule_prefix(occasion),
                    rate * 100.0,
                    t.total
                ),
                (t.total as f64 / 30.0).min(1.0),
                t.total as i64,
                format!("{}/{} decisive comparisons", t.decisive, t.total),
            ))
        })
        .collect()
}
