use std::{fs, path::PathBuf, str::FromStr};

use candle_core::Device;
use clap::Parser;
use evaluation::{
    replay::{load_batches, replay},
    EvalError, EvaluationLogger, ExperimentConfig, LoggingSettings, MultiHeadEvaluator,
};
use serde_json::{Number, Value};
use tracing_subscriber::EnvFilter;

const SUMMARY_FILENAME: &str = "eval_summary.json";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    if let Err(err) = run() {
        eprintln!("evaluation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay recorded batches through the multi-head evaluator", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to experiment config file")]
    config: PathBuf,

    #[arg(short, long, value_name = "PATH", help = "JSON file with recorded batches")]
    batches: PathBuf,

    #[arg(short, long, value_name = "PATH", help = "Where to write the summary JSON")]
    output: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), EvalError> {
    let args = Args::parse();

    let mut config = ExperimentConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let batches = load_batches(&args.batches)?;
    log::info!(
        "replaying {} batches from {}",
        batches.len(),
        args.batches.display()
    );

    let mut evaluator = MultiHeadEvaluator::from_config(&config)?;
    let mut logger = EvaluationLogger::new(LoggingSettings::from_config(&config.logging))?;

    let summary = replay(&mut evaluator, &batches, &Device::Cpu, |step, result| {
        logger.log_batch(step, result)
    })?;
    logger.log_summary(batches.len(), &summary);
    logger.flush();

    let output = args
        .output
        .or_else(|| config.output_path.as_ref().map(|dir| dir.join(SUMMARY_FILENAME)));
    if let Some(path) = output {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|err| EvalError::logging(format!("failed to serialize summary: {err}")))?;
        fs::write(&path, json)?;
        log::info!("wrote evaluation summary to {}", path.display());
    }

    Ok(())
}

fn apply_overrides(
    config: ExperimentConfig,
    overrides: &[OverrideArg],
) -> Result<ExperimentConfig, EvalError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        EvalError::ConfigFormat(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        EvalError::ConfigFormat(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), EvalError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(EvalError::ConfigFormat(format!(
            "invalid override path '{}'",
            path
        )));
    }

    let mut current = target;
    for (idx, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return Err(EvalError::ConfigFormat(format!(
                "override path segment '{}' points to non-object value",
                segment
            )));
        };
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_nested_loss_rate() {
        let config = apply_overrides(
            ExperimentConfig::default(),
            &["model.solver.loss.ohem_rate=0.7".parse().unwrap()],
        )
        .unwrap();
        assert!((config.model.solver.loss.ohem_rate - 0.7).abs() < 1e-6);
    }

    #[test]
    fn rejects_paths_through_scalars() {
        let err = apply_overrides(
            ExperimentConfig::default(),
            &["dataset.name.inner=1".parse().unwrap()],
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::ConfigFormat(_)));
    }
}
