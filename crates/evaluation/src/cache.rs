use candle_core::Tensor;

use crate::{EvalError, Result};

/// One evaluated batch: detached CPU logits per head, the `[batch, 3]` label
/// matrix and the batch scalars reported by `forward`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub grapheme_logits: Tensor,
    pub vowel_logits: Tensor,
    pub consonant_logits: Tensor,
    pub labels: Tensor,
    pub loss: f32,
    pub accuracy: f32,
}

impl CacheEntry {
    pub fn batch_size(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }
}

/// The whole cache concatenated along the batch axis, in append order.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub grapheme_logits: Tensor,
    pub vowel_logits: Tensor,
    pub consonant_logits: Tensor,
    pub labels: Tensor,
    pub losses: Vec<f32>,
    pub accuracies: Vec<f32>,
}

/// Accumulates evaluated batches across a pass. Only [`EvalCache::clear`]
/// ever removes entries.
#[derive(Debug, Default)]
pub struct EvalCache {
    entries: Vec<CacheEntry>,
}

impl EvalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: CacheEntry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn samples(&self) -> usize {
        self.entries.iter().map(CacheEntry::batch_size).sum()
    }

    pub fn snapshot(&self) -> Result<CacheSnapshot> {
        if self.entries.is_empty() {
            return Err(EvalError::precondition(
                "evaluation cache is empty; run forward on at least one batch first",
            ));
        }

        Ok(CacheSnapshot {
            grapheme_logits: concat(&self.entries, |e| &e.grapheme_logits)?,
            vowel_logits: concat(&self.entries, |e| &e.vowel_logits)?,
            consonant_logits: concat(&self.entries, |e| &e.consonant_logits)?,
            labels: concat(&self.entries, |e| &e.labels)?,
            losses: self.entries.iter().map(|e| e.loss).collect(),
            accuracies: self.entries.iter().map(|e| e.accuracy).collect(),
        })
    }
}

fn concat(entries: &[CacheEntry], pick: impl Fn(&CacheEntry) -> &Tensor) -> Result<Tensor> {
    let parts: Vec<&Tensor> = entries.iter().map(pick).collect();
    Ok(Tensor::cat(&parts, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn entry(rows: usize, loss: f32) -> CacheEntry {
        let logits = Tensor::zeros((rows, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((rows, 3), candle_core::DType::U32, &Device::Cpu).unwrap();
        CacheEntry {
            grapheme_logits: logits.clone(),
            vowel_logits: logits.clone(),
            consonant_logits: logits,
            labels,
            loss,
            accuracy: 1.0,
        }
    }

    #[test]
    fn snapshot_of_empty_cache_is_a_precondition_error() {
        let cache = EvalCache::new();
        assert!(matches!(cache.snapshot(), Err(EvalError::Precondition(_))));
    }

    #[test]
    fn snapshot_concatenates_in_append_order() {
        let mut cache = EvalCache::new();
        cache.append(entry(2, 0.5));
        cache.append(entry(3, 1.5));

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.grapheme_logits.dims(), &[5, 2]);
        assert_eq!(snapshot.labels.dims(), &[5, 3]);
        assert_eq!(snapshot.losses, vec![0.5, 1.5]);
        assert_eq!(cache.samples(), 5);

        cache.clear();
        assert!(cache.is_empty());
    }
}
