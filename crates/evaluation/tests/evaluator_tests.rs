use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use evaluation::{
    EvalError, EvalResult, HeadClassCounts, LossConfig, MixupBatchLabels, MultiHeadEvaluator,
};

const CLASSES: usize = 3;

fn evaluator() -> MultiHeadEvaluator {
    MultiHeadEvaluator::new(
        &LossConfig::default(),
        Some(HeadClassCounts {
            grapheme: CLASSES,
            vowel: CLASSES,
            consonant: CLASSES,
        }),
    )
    .unwrap()
}

/// Logits peaking at `(label + shift) % CLASSES` for every sample.
fn peaked_logits(labels: &[u32], shift: u32) -> Result<Tensor> {
    let mut data = vec![0f32; labels.len() * CLASSES];
    for (row, &label) in labels.iter().enumerate() {
        let target = ((label + shift) % CLASSES as u32) as usize;
        data[row * CLASSES + target] = 5.0;
    }
    Ok(Tensor::from_vec(data, (labels.len(), CLASSES), &Device::Cpu)?)
}

fn labels(primary: &[u32], shuffled: &[u32], lambda: f64) -> Result<MixupBatchLabels> {
    let t = |v: &[u32]| Tensor::new(v, &Device::Cpu);
    Ok(MixupBatchLabels::from((
        t(primary)?,
        t(shuffled)?,
        t(primary)?,
        t(shuffled)?,
        t(primary)?,
        t(shuffled)?,
        lambda,
    )))
}

fn run_batch(
    evaluator: &mut MultiHeadEvaluator,
    primary: &[u32],
    shift: u32,
) -> Result<EvalResult> {
    let logits = peaked_logits(primary, shift)?;
    let output = evaluator.forward(&logits, &logits, &logits, &labels(primary, primary, 1.0)?)?;
    Ok(output.result)
}

#[test]
fn forward_reports_all_fields_in_range() -> Result<()> {
    let mut evaluator = evaluator();
    let primary = [0, 1, 2, 1];
    let logits = peaked_logits(&[0, 1, 0, 1], 0)?;

    let output = evaluator.forward(&logits, &logits, &logits, &labels(&primary, &[2, 2, 1, 0], 0.4)?)?;
    let fields = output.result.named_fields();

    assert_eq!(fields.len(), 8);
    for (name, value) in fields {
        assert!(value >= 0.0, "{name} is negative");
        if name.ends_with("acc") {
            assert!(value <= 1.0, "{name} above 1");
        }
    }
    assert_eq!(output.result.grapheme_acc, 0.75);
    assert_eq!(output.result.acc, 0.75);
    let summed = output.result.grapheme_loss + output.result.vowel_loss + output.result.consonant_loss;
    assert_eq!(output.result.loss, summed);
    assert!((output.loss.to_scalar::<f32>()? - summed).abs() < 1e-5);
    Ok(())
}

#[test]
fn accuracy_ignores_mixup_partner() -> Result<()> {
    let mut evaluator = evaluator();
    let primary = [0, 1, 2, 2];
    let logits = peaked_logits(&[0, 1, 1, 2], 0)?;

    let plain = evaluator.forward(&logits, &logits, &logits, &labels(&primary, &primary, 0.3)?)?;
    let full = evaluator.forward(&logits, &logits, &logits, &labels(&primary, &[1, 0, 0, 1], 1.0)?)?;
    let mixed = evaluator.forward(&logits, &logits, &logits, &labels(&primary, &[1, 0, 0, 1], 0.3)?)?;

    assert_eq!(plain.result.acc, 0.75);
    assert_eq!(full.result.acc, plain.result.acc);
    assert_eq!(mixed.result.acc, plain.result.acc);
    assert!((full.result.loss - plain.result.loss).abs() < 1e-5);
    Ok(())
}

#[test]
fn end_to_end_half_correct_pass() -> Result<()> {
    let mut evaluator = evaluator();
    let primary = [0, 1, 2, 0];

    let first = run_batch(&mut evaluator, &primary, 0)?;
    let second = run_batch(&mut evaluator, &primary, 1)?;
    assert_eq!(first.acc, 1.0);
    assert_eq!(second.acc, 0.0);
    assert_eq!(evaluator.cached_batches(), 2);
    assert_eq!(evaluator.cached_samples(), 8);

    let summary = evaluator.evaluate_on_cache()?;
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.samples, 8);
    assert_eq!(summary.records.len(), 8);
    assert_eq!(summary.acc, (first.acc as f64 + second.acc as f64) / 2.0);
    assert_eq!(summary.loss, (first.loss as f64 + second.loss as f64) / 2.0);
    assert!((summary.composite_score - 0.5).abs() < 1e-12);

    for report in [
        &summary.grapheme_report,
        &summary.vowel_report,
        &summary.consonant_report,
    ] {
        let ids: Vec<u32> = report.iter().map(|e| e.class_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        for entry in report {
            assert!((entry.stats.recall - 0.5).abs() < 1e-12);
            assert_eq!(
                entry.most_confused_class_id,
                Some((entry.class_id + 1) % CLASSES as u32)
            );
            assert!((entry.confusion_rate - 0.5).abs() < 1e-12);
        }
    }

    let class_zero = &summary.grapheme_report[0];
    assert_eq!(class_zero.stats.support, 4);
    assert_eq!(class_zero.confusion_count, 2);

    let last = summary.records[7];
    assert_eq!(last.grapheme_label, 0);
    assert_eq!(last.grapheme_pred, 1);
    Ok(())
}

#[test]
fn aggregation_is_idempotent() -> Result<()> {
    let mut evaluator = evaluator();
    run_batch(&mut evaluator, &[0, 1, 2, 0], 0)?;
    run_batch(&mut evaluator, &[2, 2, 1, 0], 2)?;

    let first = evaluator.evaluate_on_cache()?;
    let second = evaluator.evaluate_on_cache()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn empty_cache_is_a_precondition_error() -> Result<()> {
    let mut evaluator = evaluator();
    assert!(matches!(
        evaluator.evaluate_on_cache(),
        Err(EvalError::Precondition(_))
    ));

    run_batch(&mut evaluator, &[0, 1, 2, 0], 0)?;
    evaluator.clear_cache();
    assert!(matches!(
        evaluator.evaluate_on_cache(),
        Err(EvalError::Precondition(_))
    ));
    Ok(())
}

#[test]
fn cache_accumulates_until_cleared() -> Result<()> {
    let mut evaluator = evaluator();
    run_batch(&mut evaluator, &[0, 1, 2, 0], 0)?;
    run_batch(&mut evaluator, &[0, 1, 2, 0], 1)?;
    assert_eq!(evaluator.evaluate_on_cache()?.samples, 8);

    evaluator.clear_cache();
    run_batch(&mut evaluator, &[0, 1], 0)?;
    let summary = evaluator.evaluate_on_cache()?;
    assert_eq!(summary.samples, 2);
    assert_eq!(summary.acc, 1.0);
    Ok(())
}

#[test]
fn rejected_batch_leaves_cache_untouched() -> Result<()> {
    let mut evaluator = evaluator();
    let four = peaked_logits(&[0, 1, 2, 0], 0)?;
    let three = peaked_logits(&[0, 1, 2], 0)?;

    let err = evaluator
        .forward(&four, &three, &four, &labels(&[0, 1, 2, 0], &[0, 1, 2, 0], 1.0)?)
        .unwrap_err();
    assert!(matches!(err, EvalError::Validation(_)));

    let wide = Tensor::zeros((4, 5), candle_core::DType::F32, &Device::Cpu)?;
    let err = evaluator
        .forward(&wide, &four, &four, &labels(&[0, 1, 2, 0], &[0, 1, 2, 0], 1.0)?)
        .unwrap_err();
    assert!(matches!(err, EvalError::Validation(msg) if msg.contains("grapheme")));

    assert_eq!(evaluator.cached_batches(), 0);
    Ok(())
}

#[test]
fn accepts_i64_labels() -> Result<()> {
    let mut evaluator = evaluator();
    let logits = peaked_logits(&[0, 1, 2, 0], 0)?;
    let t = |v: &[i64]| Tensor::new(v, &Device::Cpu);
    let labels = MixupBatchLabels::from((
        t(&[0, 1, 2, 0])?,
        t(&[1, 1, 1, 1])?,
        t(&[0, 1, 2, 0])?,
        t(&[1, 1, 1, 1])?,
        t(&[0, 1, 2, 0])?,
        t(&[1, 1, 1, 1])?,
        0.5,
    ));

    let output = evaluator.forward(&logits, &logits, &logits, &labels)?;
    assert_eq!(output.result.acc, 1.0);
    Ok(())
}

#[test]
fn aggregate_loss_backpropagates_to_logits() -> Result<()> {
    let mut evaluator = evaluator();
    let grapheme = Var::from_tensor(&peaked_logits(&[0, 1, 2, 0], 1)?)?;
    let other = peaked_logits(&[0, 1, 2, 0], 0)?;

    let output = evaluator.forward(
        grapheme.as_tensor(),
        &other,
        &other,
        &labels(&[0, 1, 2, 0], &[2, 2, 2, 2], 0.6)?,
    )?;
    let grads = output.loss.backward()?;
    let grad = grads
        .get(grapheme.as_tensor())
        .expect("gradient for grapheme logits");
    assert_eq!(grad.dims(), &[4, 3]);
    Ok(())
}
