pub mod cache;
pub mod config;
pub mod errors;
pub mod evaluator;
pub mod head;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod replay;

pub use cache::{CacheEntry, CacheSnapshot, EvalCache};
pub use config::{ExperimentConfig, HeadClassCounts, LossConfig};
pub use errors::{EvalError, Result};
pub use evaluator::{
    CacheSummary, EvalOutput, EvalResult, HeadRecalls, MixupBatchLabels, MultiHeadEvaluator,
    PredictionRecord,
};
pub use head::{Head, HeadEvaluator, HeadOutput};
pub use logging::{EvaluationLogger, LoggingSettings};
pub use loss::{MixUpCrossEntropy, MixupLabels};
pub use metrics::composite_score;
pub use report::{ClassStats, ClassificationReport, EnrichedClassEntry, ReportRow};
