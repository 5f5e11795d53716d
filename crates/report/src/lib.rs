//! Classification reports for multi-class predictions.
//!
//! [`ClassificationReport`] mirrors the layout of scikit-learn's
//! `classification_report`: one row per class observed in either the labels or
//! the predictions, followed by accuracy, macro and weighted averages.
//! [`enrich`] extends the per-class rows with the most frequent wrong
//! prediction for each true class.

pub mod classification;
pub mod confusion;

use thiserror::Error;

pub use classification::{ClassStats, ClassificationReport, ReportRow};
pub use confusion::{enrich, EnrichedClassEntry};

pub type Result<T> = std::result::Result<T, ReportError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("labels ({labels}) and predictions ({predictions}) differ in length")]
    LengthMismatch { labels: usize, predictions: usize },
}

pub(crate) fn ensure_same_len(y_true: &[u32], y_pred: &[u32]) -> Result<()> {
    if y_true.len() != y_pred.len() {
        return Err(ReportError::LengthMismatch {
            labels: y_true.len(),
            predictions: y_pred.len(),
        });
    }
    Ok(())
}
