use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{config::LossConfig, EvalError, Result};

/// A label pair blended by mixup/cutmix with coefficient `lambda`.
///
/// `lambda` weighs `primary`; `1 - lambda` weighs `shuffled`.
#[derive(Debug, Clone)]
pub struct MixupLabels {
    pub primary: Tensor,
    pub shuffled: Tensor,
    pub lambda: f64,
}

impl MixupLabels {
    pub fn new(primary: Tensor, shuffled: Tensor, lambda: f64) -> Self {
        Self {
            primary,
            shuffled,
            lambda,
        }
    }
}

/// Mixed-label cross entropy with optional online hard example mining.
#[derive(Debug, Clone)]
pub struct MixUpCrossEntropy {
    ohem_rate: f32,
}

impl MixUpCrossEntropy {
    pub fn new(ohem_rate: f32) -> Result<Self> {
        if !(ohem_rate > 0.0 && ohem_rate <= 1.0) {
            return Err(EvalError::validation(format!(
                "ohem rate must be in (0, 1] (got {})",
                ohem_rate
            )));
        }
        Ok(Self { ohem_rate })
    }

    pub fn from_config(config: &LossConfig) -> Result<Self> {
        Self::new(config.ohem_rate)
    }

    /// Returns the scalar loss, still attached to the graph of `logits`.
    ///
    /// Labels must already be `u32` and match the batch dimension.
    pub fn compute(&self, logits: &Tensor, labels: &MixupLabels) -> Result<Tensor> {
        let lambda = labels.lambda;
        if !lambda.is_finite() || !(0.0..=1.0).contains(&lambda) {
            return Err(EvalError::validation(format!(
                "mixup lambda must be in [0, 1] (got {})",
                lambda
            )));
        }

        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let primary = self.reduce(&per_sample_nll(&log_probs, &labels.primary)?)?;
        let shuffled = self.reduce(&per_sample_nll(&log_probs, &labels.shuffled)?)?;

        let loss = (primary.affine(lambda, 0.0)? + shuffled.affine(1.0 - lambda, 0.0)?)?;
        Ok(loss)
    }

    /// Mean over the hardest `max(1, floor(batch * ohem_rate))` samples.
    fn reduce(&self, per_sample: &Tensor) -> Result<Tensor> {
        let batch = per_sample.dim(0)?;
        let keep = ohem_keep_count(batch, self.ohem_rate);
        if keep >= batch {
            return Ok(per_sample.mean_all()?);
        }

        let order = per_sample.arg_sort_last_dim(false)?;
        let hardest = order.narrow(0, 0, keep)?;
        let kept = per_sample.index_select(&hardest, 0)?;
        Ok(kept.mean_all()?)
    }
}

pub(crate) fn ohem_keep_count(batch: usize, ohem_rate: f32) -> usize {
    ((batch as f64 * ohem_rate as f64).floor() as usize).clamp(1, batch.max(1))
}

fn per_sample_nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    Ok(nll)
}

/// Converts integer labels to `u32`, the index type used by gather and argmax.
pub(crate) fn normalize_labels(labels: &Tensor) -> Result<Tensor> {
    match labels.dtype() {
        DType::U32 => Ok(labels.clone()),
        DType::I64 | DType::U8 => Ok(labels.to_dtype(DType::U32)?),
        dtype => Err(EvalError::validation(format!(
            "unsupported label dtype {:?}",
            dtype
        ))),
    }
}
