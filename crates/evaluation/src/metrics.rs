/// Competition score over the three heads' macro recalls.
///
/// The grapheme head counts twice. Evaluated as
/// `(grapheme * 2 + vowel + consonant) / 4` in that order.
pub fn composite_score(grapheme_recall: f64, vowel_recall: f64, consonant_recall: f64) -> f64 {
    (grapheme_recall * 2.0 + vowel_recall + consonant_recall) / 4.0
}

/// Arithmetic mean of per-batch scalars.
///
/// Every batch has the same weight regardless of its size, so a short final
/// batch shifts the mean slightly.
pub fn batch_mean(values: &[f32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
}
