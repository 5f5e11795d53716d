use std::collections::BTreeSet;

use serde::Serialize;

use crate::{ensure_same_len, Result};

/// Precision, recall, f1 and support for one class or one average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassStats {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

impl ClassStats {
    fn from_counts(true_positives: usize, predicted: usize, support: usize) -> Self {
        let precision = ratio(true_positives, predicted);
        let recall = ratio(true_positives, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        Self {
            precision,
            recall,
            f1,
            support,
        }
    }
}

/// A single row of a [`ClassificationReport`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportRow {
    PerClass { class_id: u32, stats: ClassStats },
    Accuracy {
        value: f64,
    },
    MacroAvg(ClassStats),
    WeightedAvg(ClassStats),
}

/// Per-class metrics followed by accuracy, macro average and weighted average.
///
/// The class set is the sorted union of classes found in labels and
/// predictions, so a class that is only ever predicted shows up with
/// `support == 0` and zero recall. Undefined ratios are reported as `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    rows: Vec<ReportRow>,
}

impl ClassificationReport {
    pub fn from_predictions(y_true: &[u32], y_pred: &[u32]) -> Result<Self> {
        ensure_same_len(y_true, y_pred)?;

        let classes: BTreeSet<u32> = y_true.iter().chain(y_pred.iter()).copied().collect();
        let mut rows = Vec::with_capacity(classes.len() + 3);
        let mut per_class = Vec::with_capacity(classes.len());

        for &class_id in &classes {
            let mut true_positives = 0;
            let mut predicted = 0;
            let mut support = 0;
            for (&label, &pred) in y_true.iter().zip(y_pred) {
                if pred == class_id {
                    predicted += 1;
                }
                if label == class_id {
                    support += 1;
                    if pred == class_id {
                        true_positives += 1;
                    }
                }
            }
            let stats = ClassStats::from_counts(true_positives, predicted, support);
            per_class.push(stats);
            rows.push(ReportRow::PerClass { class_id, stats });
        }

        let total = y_true.len();
        let correct = y_true
            .iter()
            .zip(y_pred)
            .filter(|(label, pred)| label == pred)
            .count();

        rows.push(ReportRow::Accuracy {
            value: ratio(correct, total),
        });
        rows.push(ReportRow::MacroAvg(macro_average(&per_class, total)));
        rows.push(ReportRow::WeightedAvg(weighted_average(&per_class, total)));

        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[ReportRow] {
        &self.rows
    }

    pub fn per_class(&self) -> impl Iterator<Item = (u32, &ClassStats)> + '_ {
        self.rows.iter().filter_map(|row| match row {
            ReportRow::PerClass { class_id, stats } => Some((*class_id, stats)),
            _ => None,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.per_class().count()
    }

    pub fn accuracy(&self) -> f64 {
        self.rows
            .iter()
            .find_map(|row| match row {
                ReportRow::Accuracy { value } => Some(*value),
                _ => None,
            })
            .unwrap_or(0.0)
    }

    pub fn macro_avg(&self) -> ClassStats {
        self.rows
            .iter()
            .find_map(|row| match row {
                ReportRow::MacroAvg(stats) => Some(*stats),
                _ => None,
            })
            .unwrap_or(ClassStats::from_counts(0, 0, 0))
    }

    pub fn weighted_avg(&self) -> ClassStats {
        self.rows
            .iter()
            .find_map(|row| match row {
                ReportRow::WeightedAvg(stats) => Some(*stats),
                _ => None,
            })
            .unwrap_or(ClassStats::from_counts(0, 0, 0))
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn macro_average(per_class: &[ClassStats], total: usize) -> ClassStats {
    if per_class.is_empty() {
        return ClassStats::from_counts(0, 0, total);
    }
    let n = per_class.len() as f64;
    ClassStats {
        precision: per_class.iter().map(|s| s.precision).sum::<f64>() / n,
        recall: per_class.iter().map(|s| s.recall).sum::<f64>() / n,
        f1: per_class.iter().map(|s| s.f1).sum::<f64>() / n,
        support: total,
    }
}

fn weighted_average(per_class: &[ClassStats], total: usize) -> ClassStats {
    if total == 0 {
        return ClassStats::from_counts(0, 0, 0);
    }
    let weighted = |pick: fn(&ClassStats) -> f64| {
        per_class
            .iter()
            .map(|s| pick(s) * s.support as f64)
            .sum::<f64>()
            / total as f64
    };
    ClassStats {
        precision: weighted(|s| s.precision),
        recall: weighted(|s| s.recall),
        f1: weighted(|s| s.f1),
        support: total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn matches_sklearn_reference_values() {
        // sklearn: classification_report([0, 0, 1, 1, 2, 2, 0, 1, 2],
        //                                 [0, 1, 1, 2, 2, 0, 0, 1, 2], output_dict=True)
        let y_true = [0, 0, 1, 1, 2, 2, 0, 1, 2];
        let y_pred = [0, 1, 1, 2, 2, 0, 0, 1, 2];
        let report = ClassificationReport::from_predictions(&y_true, &y_pred).unwrap();

        assert_eq!(report.num_classes(), 3);
        assert!(close(report.accuracy(), 6.0 / 9.0));
        let macro_avg = report.macro_avg();
        assert!(close(macro_avg.precision, 2.0 / 3.0));
        assert!(close(macro_avg.recall, 2.0 / 3.0));
        assert!(close(macro_avg.f1, 2.0 / 3.0));
        assert_eq!(macro_avg.support, 9);
        assert_eq!(report.weighted_avg().support, 9);
    }

    #[test]
    fn predicted_only_class_has_zero_support() {
        let report = ClassificationReport::from_predictions(&[0, 0], &[0, 3]).unwrap();
        let classes: Vec<_> = report.per_class().map(|(id, s)| (id, s.support)).collect();
        assert_eq!(classes, vec![(0, 2), (3, 0)]);

        let (_, missing) = report.per_class().last().unwrap();
        assert_eq!(missing.recall, 0.0);
        assert_eq!(missing.precision, 0.0);
        assert!(close(report.macro_avg().recall, 0.25));
    }

    #[test]
    fn rows_end_with_aggregates_in_order() {
        let report = ClassificationReport::from_predictions(&[1, 2], &[1, 1]).unwrap();
        let tail: Vec<_> = report.rows()[2..]
            .iter()
            .map(|row| match row {
                ReportRow::Accuracy { .. } => "accuracy",
                ReportRow::MacroAvg(_) => "macro",
                ReportRow::WeightedAvg(_) => "weighted",
                ReportRow::PerClass { .. } => "class",
            })
            .collect();
        assert_eq!(tail, vec!["accuracy", "macro", "weighted"]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let err = ClassificationReport::from_predictions(&[0, 1], &[0]).unwrap_err();
        assert_eq!(
            err,
            crate::ReportError::LengthMismatch {
                labels: 2,
                predictions: 1
            }
        );
    }
}
