//! Rule discovery over outcome records with extracted profiles.

use std::collections::BTreeMap;

use super::mean;
use crate::storage::{DiscoveredRule, OutcomeRecord};

/// Records scanned per mining pass.
pub const MINING_WINDOW: i64 = 1000;
/// Records required before anything is mined.
pub const MIN_RECORDS: usize = 20;
/// Rules below this confidence are reported but not persisted.
pub const MIN_PERSIST_CONFIDENCE: f64 = 0.3;

/// Thresholds for one mined dimension.
struct Dimension {
    category: &'static str,
    floor: usize,
    outperform: f64,
    underperform: Option<f64>,
    normalizer: f64,
}

const COLOR_PAIR: Dimension = Dimension {
    category: "color",
    floor: 5,
    outperform: 0.8,
    underperform: Some(1.0),
    normalizer: 20.0,
};

const ARCHETYPE_FORMALITY: Dimension = Dimension {
    category: "archetype",
    floor: 5,
    outperform: 1.0,
    underperform: None,
    normalizer: 15.0,
};

const SILHOUETTE: Dimension = Dimension {
    category: "proportion",
    floor: 10,
    outperform: 0.5,
    underperform: Some(0.5),
    normalizer: 30.0,
};

impl Dimension {
    fn confidence(&self, count: usize) -> f64 {
        (count as f64 / self.normalizer).min(1.0)
    }
}

fn evidence(count: usize, avg: f64) -> String {
    format!("{} outfits, avg score {:.1}", count, avg)
}

/// Group scores by key. `BTreeMap` keeps rule order stable across runs.
type Buckets = BTreeMap<String, Vec<f64>>;

fn color_buckets(records: &[&OutcomeRecord]) -> Buckets {
    let mut buckets = Buckets::new();
    for record in records {
        let Some(profile) = &record.profile else {
            continue;
        };
        // Community consensus outranks the generated score when trusted
        let Some(score) = record.trusted_community().or(record.score) else {
            continue;
        };

        let mut colors = profile.dominant_colors.clone();
        colors.sort();
        colors.dedup();
        for i in 0..colors.len() {
            for j in (i + 1)..colors.len() {
                buckets
                    .entry(format!("{}+{}", colors[i], colors[j]))
                    .or_default()
                    .push(score);
            }
        }
    }
    buckets
}

fn archetype_buckets(records: &[&OutcomeRecord]) -> Buckets {
    let mut buckets = Buckets::new();
    for record in records {
        let (Some(profile), Some(score)) = (&record.profile, record.score) else {
            continue;
        };
        let Some(formality) = profile.formality_level.filter(|f| *f > 0) else {
            continue;
        };
        for archetype in &profile.style_archetypes {
            buckets
                .entry(format!("{}@formality{}", archetype, formality))
                .or_default()
                .push(score);
        }
    }
    buckets
}

fn silhouette_buckets(records: &[&OutcomeRecord]) -> Buckets {
    let mut buckets = Buckets::new();
    for record in records {
        let (Some(profile), Some(score)) = (&record.profile, record.score) else {
            continue;
        };
        if let Some(silhouette) = &profile.silhouette_type {
            buckets.entry(silhouette.clone()).or_default().push(score);
        }
    }
    buckets
}

/// Mine candidate rules from `records`.
///
/// Returns every rule that cleared its dimension's thresholds, including
/// those too weak to persist. Records without a profile are ignored.
pub fn mine_rules(records: &[OutcomeRecord]) -> Vec<DiscoveredRule> {
    let profiled: Vec<&OutcomeRecord> = records.iter().filter(|r| r.profile.is_some()).collect();
    if profiled.len() < MIN_RECORDS {
        return Vec::new();
    }

    let scores: Vec<f64> = profiled.iter().filter_map(|r| r.score).collect();
    let Some(global) = mean(&scores) else {
        return Vec::new();
    };

    let mut rules = Vec::new();

    for (pair, scores) in color_buckets(&profiled) {
        let dim = &COLOR_PAIR;
        if scores.len() < dim.floor {
            continue;
        }
        let Some(avg) = mean(&scores) else { continue };
        let pair = pair.replace('+', " + ");

        if avg > global + dim.outperform {
            rules.push(DiscoveredRule::new(
                dim.category,
                format!(
                    "The color combination {} consistently scores above average ({:.1} vs {:.1} overall avg)",
                    pair, avg, global
                ),
                dim.confidence(scores.len()),
                scores.len() as i64,
                evidence(scores.len(), avg),
            ));
        }
        if dim.underperform.is_some_and(|margin| avg < global - margin) {
            rules.push(DiscoveredRule::new(
                dim.category,
                format!(
                    "The color combination {} tends to underperform ({:.1} vs {:.1} overall avg); suggest alternatives when detected",
                    pair, avg, global
                ),
                dim.confidence(scores.len()),
                scores.len() as i64,
                evidence(scores.len(), avg),
            ));
        }
    }

    for (key, scores) in archetype_buckets(&profiled) {
        let dim = &ARCHETYPE_FORMALITY;
        if scores.len() < dim.floor {
            continue;
        }
        let Some(avg) = mean(&scores) else { continue };
        let Some((archetype, formality)) = key.split_once("@formality") else {
            continue;
        };

        if avg > global + dim.outperform {
            rules.push(DiscoveredRule::new(
                dim.category,
                format!(
                    "{} style at formality level {} is a strong combination (avg {:.1}); reinforce when detected",
                    archetype, formality, avg
                ),
                dim.confidence(scores.len()),
                scores.len() as i64,
                evidence(scores.len(), avg),
            ));
        }
    }

    for (silhouette, scores) in silhouette_buckets(&profiled) {
        let dim = &SILHOUETTE;
        if scores.len() < dim.floor {
            continue;
        }
        let Some(avg) = mean(&scores) else { continue };

        let direction = if avg > global + dim.outperform {
            "outperforms"
        } else if dim.underperform.is_some_and(|margin| avg < global - margin) {
            "underperforms"
        } else {
            continue;
        };

        rules.push(DiscoveredRule::new(
            dim.category,
            format!(
                "{} silhouette {} the average by {:.1} points ({:.1}); adjust advice accordingly",
                silhouette,
                direction,
                (avg - global).abs(),
                avg
            ),
            dim.confidence(scores.len()),
            scores.len() as i64,
            evidence(scores.len(), avg),
        ));
    }

    rules
}
