use std::collections::HashMap;

use serde::Serialize;

use crate::{ensure_same_len, ClassStats, ClassificationReport, Result};

/// Per-class report row extended with its dominant misclassification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnrichedClassEntry {
    pub class_id: u32,
    #[serde(flatten)]
    pub stats: ClassStats,
    /// Most frequent wrong prediction for samples of this class, if any.
    pub most_confused_class_id: Option<u32>,
    pub confusion_count: usize,
    /// `confusion_count / support`, or `0.0` when the class has no support.
    pub confusion_rate: f64,
}

/// Attach error analysis to every per-class row of `report`.
///
/// Aggregate rows are dropped. Predicted classes are counted in the order
/// they are first seen for each true class; when several wrong classes share
/// the highest count, the one first seen latest is reported.
pub fn enrich(
    report: &ClassificationReport,
    y_true: &[u32],
    y_pred: &[u32],
) -> Result<Vec<EnrichedClassEntry>> {
    ensure_same_len(y_true, y_pred)?;

    let mut counts: HashMap<u32, Vec<(u32, usize)>> = HashMap::new();
    for (&label, &pred) in y_true.iter().zip(y_pred) {
        let seen = counts.entry(label).or_default();
        match seen.iter_mut().find(|(class, _)| *class == pred) {
            Some((_, count)) => *count += 1,
            None => seen.push((pred, 1)),
        }
    }

    let entries = report
        .per_class()
        .map(|(class_id, stats)| {
            let (most_confused_class_id, confusion_count) = counts
                .get(&class_id)
                .and_then(|seen| most_frequent_error(class_id, seen))
                .map_or((None, 0), |(class, count)| (Some(class), count));

            let confusion_rate = if stats.support > 0 {
                confusion_count as f64 / stats.support as f64
            } else {
                0.0
            };

            EnrichedClassEntry {
                class_id,
                stats: *stats,
                most_confused_class_id,
                confusion_count,
                confusion_rate,
            }
        })
        .collect();

    Ok(entries)
}

fn most_frequent_error(class_id: u32, seen: &[(u32, usize)]) -> Option<(u32, usize)> {
    let mut best: Option<(u32, usize)> = None;
    for &(class, count) in seen.iter().filter(|(class, _)| *class != class_id) {
        match best {
            Some((_, best_count)) if count < best_count => {}
            _ => best = Some((class, count)),
        }
    }
    best
}
