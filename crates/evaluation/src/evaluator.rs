use candle_core::{Device, Tensor, D};
use report::{enrich, ClassificationReport, EnrichedClassEntry};
use serde::Serialize;

use crate::{
    cache::{CacheEntry, EvalCache},
    config::{ExperimentConfig, HeadClassCounts, LossConfig},
    head::{Head, HeadEvaluator, HeadOutput},
    loss::MixupLabels,
    metrics::{batch_mean, composite_score},
    EvalError, Result,
};

/// Labels for one mixup batch across all three heads.
///
/// A single `lambda` applies to every head because mixing happens on the
/// input image.
#[derive(Debug, Clone)]
pub struct MixupBatchLabels {
    pub grapheme: Tensor,
    pub shuffled_grapheme: Tensor,
    pub vowel: Tensor,
    pub shuffled_vowel: Tensor,
    pub consonant: Tensor,
    pub shuffled_consonant: Tensor,
    pub lambda: f64,
}

impl MixupBatchLabels {
    pub fn for_head(&self, head: Head) -> MixupLabels {
        let (primary, shuffled) = match head {
            Head::Grapheme => (&self.grapheme, &self.shuffled_grapheme),
            Head::Vowel => (&self.vowel, &self.shuffled_vowel),
            Head::Consonant => (&self.consonant, &self.shuffled_consonant),
        };
        MixupLabels::new(primary.clone(), shuffled.clone(), self.lambda)
    }
}

impl From<(Tensor, Tensor, Tensor, Tensor, Tensor, Tensor, f64)> for MixupBatchLabels {
    fn from(value: (Tensor, Tensor, Tensor, Tensor, Tensor, Tensor, f64)) -> Self {
        let (grapheme, shuffled_grapheme, vowel, shuffled_vowel, consonant, shuffled_consonant, lambda) =
            value;
        Self {
            grapheme,
            shuffled_grapheme,
            vowel,
            shuffled_vowel,
            consonant,
            shuffled_consonant,
            lambda,
        }
    }
}

/// Per-batch scalars returned by [`MultiHeadEvaluator::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalResult {
    pub grapheme_loss: f32,
    pub grapheme_acc: f32,
    pub vowel_loss: f32,
    pub vowel_acc: f32,
    pub consonant_loss: f32,
    pub consonant_acc: f32,
    /// Sum of the three head losses.
    pub loss: f32,
    /// Mean of the three head accuracies.
    pub acc: f32,
}

impl EvalResult {
    pub fn named_fields(&self) -> [(&'static str, f32); 8] {
        [
            ("grapheme_loss", self.grapheme_loss),
            ("grapheme_acc", self.grapheme_acc),
            ("vowel_loss", self.vowel_loss),
            ("vowel_acc", self.vowel_acc),
            ("consonant_loss", self.consonant_loss),
            ("consonant_acc", self.consonant_acc),
            ("loss", self.loss),
            ("acc", self.acc),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct EvalOutput {
    /// Aggregate loss, still attached to the graph of the input logits.
    pub loss: Tensor,
    pub result: EvalResult,
}

/// Predicted and true class of one sample for each head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PredictionRecord {
    pub grapheme_pred: u32,
    pub vowel_pred: u32,
    pub consonant_pred: u32,
    pub grapheme_label: u32,
    pub vowel_label: u32,
    pub consonant_label: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeadRecalls {
    pub grapheme: f64,
    pub vowel: f64,
    pub consonant: f64,
}

/// Result of [`MultiHeadEvaluator::evaluate_on_cache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub grapheme_report: Vec<EnrichedClassEntry>,
    pub vowel_report: Vec<EnrichedClassEntry>,
    pub consonant_report: Vec<EnrichedClassEntry>,
    pub macro_recall: HeadRecalls,
    pub composite_score: f64,
    pub records: Vec<PredictionRecord>,
    /// Unweighted mean of the per-batch accuracies reported by `forward`.
    pub acc: f64,
    /// Unweighted mean of the per-batch losses reported by `forward`.
    pub loss: f64,
    pub batches: usize,
    pub samples: usize,
}

impl CacheSummary {
    pub fn report(&self, head: Head) -> &[EnrichedClassEntry] {
        match head {
            Head::Grapheme => &self.grapheme_report,
            Head::Vowel => &self.vowel_report,
            Head::Consonant => &self.consonant_report,
        }
    }
}

/// Evaluates grapheme, vowel and consonant heads together and caches every
/// batch for end-of-pass analysis.
///
/// The cache is only reset by [`MultiHeadEvaluator::clear_cache`]; callers
/// reusing an evaluator across passes must clear it in between. `forward` and
/// `clear_cache` take `&mut self`, so a shared evaluator needs external
/// synchronization.
#[derive(Debug)]
pub struct MultiHeadEvaluator {
    grapheme: HeadEvaluator,
    vowel: HeadEvaluator,
    consonant: HeadEvaluator,
    cache: EvalCache,
}

impl MultiHeadEvaluator {
    pub fn new(loss: &LossConfig, classes: Option<HeadClassCounts>) -> Result<Self> {
        Ok(Self {
            grapheme: HeadEvaluator::new(Head::Grapheme, loss, classes.map(|c| c.grapheme))?,
            vowel: HeadEvaluator::new(Head::Vowel, loss, classes.map(|c| c.vowel))?,
            consonant: HeadEvaluator::new(Head::Consonant, loss, classes.map(|c| c.consonant))?,
            cache: EvalCache::new(),
        })
    }

    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        Self::new(&config.model.solver.loss, Some(config.class_counts()))
    }

    pub fn forward(
        &mut self,
        grapheme_logits: &Tensor,
        vowel_logits: &Tensor,
        consonant_logits: &Tensor,
        labels: &MixupBatchLabels,
    ) -> Result<EvalOutput> {
        let (grapheme_logits, grapheme_labels) = self
            .grapheme
            .prepare(grapheme_logits, &labels.for_head(Head::Grapheme))?;
        let (vowel_logits, vowel_labels) = self
            .vowel
            .prepare(vowel_logits, &labels.for_head(Head::Vowel))?;
        let (consonant_logits, consonant_labels) = self
            .consonant
            .prepare(consonant_logits, &labels.for_head(Head::Consonant))?;

        let batch = grapheme_logits.dim(0)?;
        let vowel_batch = vowel_logits.dim(0)?;
        let consonant_batch = consonant_logits.dim(0)?;
        if vowel_batch != batch || consonant_batch != batch {
            return Err(EvalError::validation(format!(
                "heads disagree on batch size: grapheme={}, vowel={}, consonant={}",
                batch, vowel_batch, consonant_batch
            )));
        }

        let grapheme = self.grapheme.score(&grapheme_logits, &grapheme_labels)?;
        let vowel = self.vowel.score(&vowel_logits, &vowel_labels)?;
        let consonant = self.consonant.score(&consonant_logits, &consonant_labels)?;

        let loss = ((&grapheme.loss + &vowel.loss)? + &consonant.loss)?;
        let result = combine(&grapheme, &vowel, &consonant);

        let label_matrix = Tensor::stack(
            &[
                &grapheme_labels.primary,
                &vowel_labels.primary,
                &consonant_labels.primary,
            ],
            1,
        )?;
        self.cache.append(CacheEntry {
            grapheme_logits: detach_to_cpu(&grapheme_logits)?,
            vowel_logits: detach_to_cpu(&vowel_logits)?,
            consonant_logits: detach_to_cpu(&consonant_logits)?,
            labels: detach_to_cpu(&label_matrix)?,
            loss: result.loss,
            accuracy: result.acc,
        });
        log::debug!(
            "cached batch {} ({} samples): loss={:.4} acc={:.4}",
            self.cache.len(),
            batch,
            result.loss,
            result.acc
        );

        Ok(EvalOutput { loss, result })
    }

    pub fn clear_cache(&mut self) {
        log::debug!("clearing {} cached batches", self.cache.len());
        self.cache.clear();
    }

    pub fn cached_batches(&self) -> usize {
        self.cache.len()
    }

    pub fn cached_samples(&self) -> usize {
        self.cache.samples()
    }

    /// Aggregates everything cached since the last [`MultiHeadEvaluator::clear_cache`].
    ///
    /// Fails with [`EvalError::Precondition`] when nothing has been cached.
    pub fn evaluate_on_cache(&self) -> Result<CacheSummary> {
        let snapshot = self.cache.snapshot()?;

        let label_rows = snapshot.labels.to_vec2::<u32>()?;
        let truth: [Vec<u32>; 3] = [0, 1, 2].map(|col| label_rows.iter().map(|r| r[col]).collect());
        let preds = [
            argmax_rows(&snapshot.grapheme_logits)?,
            argmax_rows(&snapshot.vowel_logits)?,
            argmax_rows(&snapshot.consonant_logits)?,
        ];

        let report_for =
            |col: usize| ClassificationReport::from_predictions(&truth[col], &preds[col]);
        let reports = [report_for(0)?, report_for(1)?, report_for(2)?];

        let macro_recall = HeadRecalls {
            grapheme: reports[Head::Grapheme.column()].macro_avg().recall,
            vowel: reports[Head::Vowel.column()].macro_avg().recall,
            consonant: reports[Head::Consonant.column()].macro_avg().recall,
        };
        let score = composite_score(
            macro_recall.grapheme,
            macro_recall.vowel,
            macro_recall.consonant,
        );

        let records = (0..label_rows.len())
            .map(|idx| PredictionRecord {
                grapheme_pred: preds[0][idx],
                vowel_pred: preds[1][idx],
                consonant_pred: preds[2][idx],
                grapheme_label: truth[0][idx],
                vowel_label: truth[1][idx],
                consonant_label: truth[2][idx],
            })
            .collect();

        let enrich_head = |head: Head| -> Result<Vec<EnrichedClassEntry>> {
            let col = head.column();
            Ok(enrich(&reports[col], &truth[col], &preds[col])?)
        };

        Ok(CacheSummary {
            grapheme_report: enrich_head(Head::Grapheme)?,
            vowel_report: enrich_head(Head::Vowel)?,
            consonant_report: enrich_head(Head::Consonant)?,
            macro_recall,
            composite_score: score,
            records,
            acc: batch_mean(&snapshot.accuracies),
            loss: batch_mean(&snapshot.losses),
            batches: snapshot.losses.len(),
            samples: label_rows.len(),
        })
    }
}

fn combine(grapheme: &HeadOutput, vowel: &HeadOutput, consonant: &HeadOutput) -> EvalResult {
    EvalResult {
        grapheme_loss: grapheme.loss_value,
        grapheme_acc: grapheme.accuracy,
        vowel_loss: vowel.loss_value,
        vowel_acc: vowel.accuracy,
        consonant_loss: consonant.loss_value,
        consonant_acc: consonant.accuracy,
        loss: grapheme.loss_value + vowel.loss_value + consonant.loss_value,
        acc: (grapheme.accuracy + vowel.accuracy + consonant.accuracy) / 3.0,
    }
}

fn detach_to_cpu(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.detach().to_device(&Device::Cpu)?)
}

fn argmax_rows(logits: &Tensor) -> Result<Vec<u32>> {
    Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?)
}
