use std::fmt;

use candle_core::{DType, Tensor, D};
use serde::Serialize;

use crate::{
    config::LossConfig,
    loss::{normalize_labels, MixUpCrossEntropy, MixupLabels},
    EvalError, Result,
};

/// The three classification outputs of the grapheme model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Head {
    Grapheme,
    Vowel,
    Consonant,
}

impl Head {
    pub const ALL: [Head; 3] = [Head::Grapheme, Head::Vowel, Head::Consonant];

    pub fn name(self) -> &'static str {
        match self {
            Head::Grapheme => "grapheme",
            Head::Vowel => "vowel",
            Head::Consonant => "consonant",
        }
    }

    /// Column of this head in the cached `[batch, 3]` label matrix.
    pub fn column(self) -> usize {
        match self {
            Head::Grapheme => 0,
            Head::Vowel => 1,
            Head::Consonant => 2,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// Scalar loss attached to the graph of the input logits.
    pub loss: Tensor,
    pub loss_value: f32,
    pub accuracy: f32,
}

/// Mixup loss plus top-1 accuracy for a single head.
///
/// Accuracy is measured against the primary labels only; the shuffled labels
/// and lambda never affect it.
#[derive(Debug, Clone)]
pub struct HeadEvaluator {
    head: Head,
    num_classes: Option<usize>,
    loss_fn: MixUpCrossEntropy,
}

impl HeadEvaluator {
    pub fn new(head: Head, loss: &LossConfig, num_classes: Option<usize>) -> Result<Self> {
        Ok(Self {
            head,
            num_classes,
            loss_fn: MixUpCrossEntropy::from_config(loss)?,
        })
    }

    pub fn evaluate(&self, logits: &Tensor, labels: &MixupLabels) -> Result<HeadOutput> {
        let (logits, labels) = self.prepare(logits, labels)?;
        self.score(&logits, &labels)
    }

    /// Loss and accuracy for inputs already checked by [`HeadEvaluator::prepare`].
    pub(crate) fn score(&self, logits: &Tensor, labels: &MixupLabels) -> Result<HeadOutput> {
        let batch = logits.dim(0)?;

        let loss = self.loss_fn.compute(logits, labels)?;
        let loss_value = loss.to_scalar::<f32>()?;

        let predictions = logits.argmax(D::Minus1)?;
        let correct = predictions
            .eq(&labels.primary)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;

        Ok(HeadOutput {
            loss,
            loss_value,
            accuracy: correct / batch as f32,
        })
    }

    /// Validates shapes and label ranges, returning f32 logits and u32 labels.
    pub(crate) fn prepare(
        &self,
        logits: &Tensor,
        labels: &MixupLabels,
    ) -> Result<(Tensor, MixupLabels)> {
        let (batch, classes) = logits.dims2().map_err(|_| {
            EvalError::validation(format!(
                "{} logits must have shape [batch, num_classes] (got {:?})",
                self.head,
                logits.dims()
            ))
        })?;
        if batch == 0 || classes == 0 {
            return Err(EvalError::validation(format!(
                "{} logits must be non-empty (got {:?})",
                self.head,
                logits.dims()
            )));
        }
        if let Some(expected) = self.num_classes {
            if classes != expected {
                return Err(EvalError::validation(format!(
                    "{} logits have {} classes, expected {}",
                    self.head, classes, expected
                )));
            }
        }

        let primary = self.check_labels("primary", &labels.primary, logits, classes)?;
        let shuffled = self.check_labels("shuffled", &labels.shuffled, logits, classes)?;

        let logits = logits.to_dtype(DType::F32)?;
        Ok((logits, MixupLabels::new(primary, shuffled, labels.lambda)))
    }

    fn check_labels(
        &self,
        kind: &str,
        labels: &Tensor,
        logits: &Tensor,
        classes: usize,
    ) -> Result<Tensor> {
        let batch = logits.dim(0)?;
        if labels.dims() != [batch] {
            return Err(EvalError::validation(format!(
                "{} {} labels have shape {:?}, expected [{}]",
                self.head,
                kind,
                labels.dims(),
                batch
            )));
        }
        let labels = normalize_labels(labels)?.to_device(logits.device())?;
        let max_label = labels.max(0)?.to_scalar::<u32>()?;
        if max_label as usize >= classes {
            return Err(EvalError::validation(format!(
                "{} {} label {} out of range for {} classes",
                self.head, kind, max_label, classes
            )));
        }
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn evaluator(num_classes: Option<usize>) -> HeadEvaluator {
        HeadEvaluator::new(Head::Vowel, &LossConfig::default(), num_classes).unwrap()
    }

    fn logits() -> Tensor {
        Tensor::new(
            &[[3.0f32, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 3.0], [3.0, 0.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn labels(primary: &[u32], shuffled: &[u32], lambda: f64) -> MixupLabels {
        MixupLabels::new(
            Tensor::new(primary, &Device::Cpu).unwrap(),
            Tensor::new(shuffled, &Device::Cpu).unwrap(),
            lambda,
        )
    }

    #[test]
    fn accuracy_uses_primary_labels_only() {
        let eval = evaluator(Some(3));
        let primary = [0, 1, 2, 1];

        let a = eval
            .evaluate(&logits(), &labels(&primary, &primary, 1.0))
            .unwrap();
        let b = eval
            .evaluate(&logits(), &labels(&primary, &[2, 2, 0, 0], 0.2))
            .unwrap();

        assert_eq!(a.accuracy, 0.75);
        assert_eq!(b.accuracy, 0.75);
        assert!(a.loss_value >= 0.0);
        assert!(b.loss_value > a.loss_value);
    }

    #[test]
    fn rejects_wrong_class_count() {
        let err = evaluator(Some(11))
            .evaluate(&logits(), &labels(&[0, 0, 0, 0], &[0, 0, 0, 0], 1.0))
            .unwrap_err();
        assert!(matches!(err, EvalError::Validation(msg) if msg.contains("vowel")));
    }

    #[test]
    fn rejects_label_length_mismatch() {
        let err = evaluator(None)
            .evaluate(&logits(), &labels(&[0, 0, 0], &[0, 0, 0], 1.0))
            .unwrap_err();
        assert!(matches!(err, EvalError::Validation(_)));
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let err = evaluator(None)
            .evaluate(&logits(), &labels(&[0, 0, 0, 0], &[0, 0, 0, 7], 1.0))
            .unwrap_err();
        assert!(matches!(err, EvalError::Validation(msg) if msg.contains("out of range")));
    }

    #[test]
    fn rejects_rank_one_logits() {
        let flat = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap();
        let err = evaluator(None)
            .evaluate(&flat, &labels(&[0], &[0], 1.0))
            .unwrap_err();
        assert!(matches!(err, EvalError::Validation(_)));
    }
}
