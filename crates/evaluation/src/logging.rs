use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use prost::Message;

use crate::{
    config::LoggingConfig,
    evaluator::{CacheSummary, EvalResult},
    head::Head,
    EvalError, Result,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Reports batch results and pass summaries to stdout and, optionally, a
/// TensorBoard event file. TensorBoard writes are best effort.
pub struct EvaluationLogger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl EvaluationLogger {
    pub fn new(settings: LoggingSettings) -> Result<Self> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn tensorboard_path(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_batch(&mut self, step: usize, result: &EvalResult) {
        if self.settings.enable_stdout {
            println!(
                "eval batch={} loss={:.4} acc={:.2}% grapheme={:.4}/{:.2}% vowel={:.4}/{:.2}% consonant={:.4}/{:.2}%",
                step,
                result.loss,
                result.acc * 100.0,
                result.grapheme_loss,
                result.grapheme_acc * 100.0,
                result.vowel_loss,
                result.vowel_acc * 100.0,
                result.consonant_loss,
                result.consonant_acc * 100.0,
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            for (name, value) in result.named_fields() {
                let _ = writer.write_scalar(&format!("eval/{name}"), step_i64, value as f64);
            }
        }
    }

    pub fn log_summary(&mut self, step: usize, summary: &CacheSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval summary step={} score={:.4} loss={:.4} acc={:.2}% batches={} samples={}",
                step,
                summary.composite_score,
                summary.loss,
                summary.acc * 100.0,
                summary.batches,
                summary.samples
            );
            for head in Head::ALL {
                if let Some(worst) = summary
                    .report(head)
                    .iter()
                    .filter(|entry| entry.stats.support > 0)
                    .min_by(|a, b| a.stats.recall.total_cmp(&b.stats.recall))
                {
                    println!(
                        "  {} worst class={} recall={:.4} confused_with={} rate={:.4}",
                        head,
                        worst.class_id,
                        worst.stats.recall,
                        worst
                            .most_confused_class_id
                            .map_or_else(|| "-".to_string(), |id| id.to_string()),
                        worst.confusion_rate
                    );
                }
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            let _ = writer.write_scalar("eval/composite_score", step_i64, summary.composite_score);
            let _ = writer.write_scalar("eval/mean_loss", step_i64, summary.loss);
            let _ = writer.write_scalar("eval/mean_acc", step_i64, summary.acc);
            let _ = writer.write_scalar(
                "eval/grapheme_macro_recall",
                step_i64,
                summary.macro_recall.grapheme,
            );
            let _ = writer.write_scalar(
                "eval/vowel_macro_recall",
                step_i64,
                summary.macro_recall.vowel,
            );
            let _ = writer.write_scalar(
                "eval/consonant_macro_recall",
                step_i64,
                summary.macro_recall.consonant,
            );
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            EvalError::logging(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.evaluate",
            since_epoch().as_secs()
        ));
        let file = File::create(&path).map_err(|err| {
            EvalError::logging(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    /// Appends one scalar as a TFRecord: length, masked length crc, payload, masked payload crc.
    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        let event = Event {
            wall_time: since_epoch().as_secs_f64(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        let mut payload = BytesMut::with_capacity(64 + tag.len());
        event.encode(&mut payload).map_err(|err| {
            EvalError::logging(format!("failed to encode scalar {tag}: {err}"))
        })?;

        let len = (payload.len() as u64).to_le_bytes();
        let mut record = Vec::with_capacity(payload.len() + 16);
        record.extend_from_slice(&len);
        record.extend_from_slice(&masked_crc32(&len).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&masked_crc32(&payload).to_le_bytes());
        self.writer.write_all(&record).map_err(|err| {
            EvalError::logging(format!("failed to write scalar {tag}: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|err| {
            EvalError::logging(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let crc = crc32fast::hash(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
