//! Replaying recorded model outputs through the evaluator.

use std::{fs, path::Path};

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    evaluator::{CacheSummary, EvalResult, MixupBatchLabels, MultiHeadEvaluator},
    EvalError, Result,
};

/// One batch of recorded logits and mixup labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub grapheme_logits: Vec<Vec<f32>>,
    pub vowel_logits: Vec<Vec<f32>>,
    pub consonant_logits: Vec<Vec<f32>>,
    pub grapheme_labels: Vec<u32>,
    pub shuffled_grapheme_labels: Vec<u32>,
    pub vowel_labels: Vec<u32>,
    pub shuffled_vowel_labels: Vec<u32>,
    pub consonant_labels: Vec<u32>,
    pub shuffled_consonant_labels: Vec<u32>,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
}

/// Tensors for one [`BatchRecord`], ready for [`MultiHeadEvaluator::forward`].
#[derive(Debug, Clone)]
pub struct BatchTensors {
    pub grapheme_logits: Tensor,
    pub vowel_logits: Tensor,
    pub consonant_logits: Tensor,
    pub labels: MixupBatchLabels,
}

impl BatchRecord {
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let labels = |values: &[u32]| Tensor::new(values, device);
        Ok(BatchTensors {
            grapheme_logits: logits_tensor("grapheme", &self.grapheme_logits, device)?,
            vowel_logits: logits_tensor("vowel", &self.vowel_logits, device)?,
            consonant_logits: logits_tensor("consonant", &self.consonant_logits, device)?,
            labels: MixupBatchLabels {
                grapheme: labels(&self.grapheme_labels)?,
                shuffled_grapheme: labels(&self.shuffled_grapheme_labels)?,
                vowel: labels(&self.vowel_labels)?,
                shuffled_vowel: labels(&self.shuffled_vowel_labels)?,
                consonant: labels(&self.consonant_labels)?,
                shuffled_consonant: labels(&self.shuffled_consonant_labels)?,
                lambda: self.lambda,
            },
        })
    }
}

pub fn load_batches(path: impl AsRef<Path>) -> Result<Vec<BatchRecord>> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents).map_err(|err| {
        EvalError::validation(format!(
            "failed to parse batch file {}: {err}",
            path.display()
        ))
    })
}

/// Clears the evaluator, runs every batch through `forward` and aggregates.
///
/// `on_batch` sees each batch result as it is produced.
pub fn replay(
    evaluator: &mut MultiHeadEvaluator,
    batches: &[BatchRecord],
    device: &Device,
    mut on_batch: impl FnMut(usize, &EvalResult),
) -> Result<CacheSummary> {
    evaluator.clear_cache();
    for (step, batch) in batches.iter().enumerate() {
        let tensors = batch.to_tensors(device)?;
        let output = evaluator.forward(
            &tensors.grapheme_logits,
            &tensors.vowel_logits,
            &tensors.consonant_logits,
            &tensors.labels,
        )?;
        on_batch(step, &output.result);
    }
    evaluator.evaluate_on_cache()
}

fn logits_tensor(head: &str, rows: &[Vec<f32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|row| row.len() != width) {
        return Err(EvalError::validation(format!(
            "{} logits rows have differing lengths",
            head
        )));
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

fn default_lambda() -> f64 {
    1.0
}
