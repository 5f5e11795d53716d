use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{EvalError, Result};

/// Experiment configuration for the grapheme classifier.
///
/// Only `model.solver.loss` and the per-head class counts are consumed by the
/// evaluators; the remaining sections belong to the data, model and training
/// collaborators and are carried through as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub resume_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(EvalError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        let ohem_rate = self.model.solver.loss.ohem_rate;
        if !(ohem_rate > 0.0 && ohem_rate <= 1.0) {
            errors.push(format!(
                "model.solver.loss.ohem_rate must be in (0, 1] (got {})",
                ohem_rate
            ));
        }

        let dataset = &self.dataset;
        for (label, size) in [
            ("dataset.grapheme_size", dataset.grapheme_size),
            ("dataset.vowel_size", dataset.vowel_size),
            ("dataset.consonant_size", dataset.consonant_size),
        ] {
            if size == 0 {
                errors.push(format!("{} must be greater than 0", label));
            }
        }

        let expected_dims = [
            dataset.grapheme_size,
            dataset.vowel_size,
            dataset.consonant_size,
        ];
        if self.model.head.output_dims != expected_dims {
            errors.push(format!(
                "model.head.output_dims {:?} must match dataset class sizes {:?}",
                self.model.head.output_dims, expected_dims
            ));
        }

        if dataset.batch_size == 0 {
            errors.push("dataset.batch_size must be greater than 0".to_string());
        }

        if dataset.resize_shape.contains(&0) {
            errors.push("dataset.resize_shape dimensions must be greater than 0".to_string());
        }

        let augmentation = &dataset.augmentation;
        for (label, prob) in [
            ("blurring_prob", augmentation.blurring_prob),
            ("gauss_noise_prob", augmentation.gauss_noise_prob),
            ("brightness_contrast_prob", augmentation.brightness_contrast_prob),
            ("grid_distortion_prob", augmentation.grid_distortion_prob),
            ("rotation_prob", augmentation.rotation_prob),
        ] {
            if !(0.0..=1.0).contains(&prob) {
                errors.push(format!(
                    "dataset.augmentation.{} must be in [0, 1] (got {})",
                    label, prob
                ));
            }
        }

        if dataset.normalize_mean.len() != dataset.normalize_std.len() {
            errors.push(
                "dataset.normalize_mean and dataset.normalize_std must have equal length"
                    .to_string(),
            );
        }
        if dataset.normalize_std.iter().any(|std| *std <= 0.0) {
            errors.push("dataset.normalize_std entries must be greater than 0".to_string());
        }

        if self.model.solver.base_lr <= 0.0 {
            errors.push("model.solver.base_lr must be greater than 0".to_string());
        }

        if self.model.solver.total_epochs == 0 {
            errors.push("model.solver.total_epochs must be greater than 0".to_string());
        }

        if self.logging.tensorboard_flush_every_n == 0 {
            errors.push("logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(EvalError::InvalidConfig(errors));
        }

        Ok(())
    }

    pub fn class_counts(&self) -> HeadClassCounts {
        HeadClassCounts {
            grapheme: self.dataset.grapheme_size,
            vowel: self.dataset.vowel_size,
            consonant: self.dataset.consonant_size,
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.dataset.apply_base_path(base);
        self.model.apply_base_path(base);
        for path in [
            self.output_path.as_mut(),
            self.resume_path.as_mut(),
            self.logging.tensorboard.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

/// Number of classes produced by each head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadClassCounts {
    pub grapheme: usize,
    pub vowel: usize,
    pub consonant: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default = "default_dataset_name")]
    pub name: String,
    #[serde(default = "default_image_size")]
    pub default_size: [usize; 2],
    #[serde(default = "default_resize_shape")]
    pub resize_shape: [usize; 2],
    #[serde(default = "default_true")]
    pub concentrate_crop: bool,
    #[serde(default = "default_grapheme_size")]
    pub grapheme_size: usize,
    #[serde(default = "default_vowel_size")]
    pub vowel_size: usize,
    #[serde(default = "default_consonant_size")]
    pub consonant_size: usize,
    #[serde(default)]
    pub train_data_path: Option<PathBuf>,
    #[serde(default)]
    pub val_data_path: Option<PathBuf>,
    #[serde(default)]
    pub augmentation: AugmentationConfig,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cpu_num")]
    pub cpu_num: usize,
    #[serde(default = "default_true")]
    pub to_rgb: bool,
    #[serde(default = "default_normalize_mean")]
    pub normalize_mean: Vec<f32>,
    #[serde(default = "default_normalize_std")]
    pub normalize_std: Vec<f32>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: default_dataset_name(),
            default_size: default_image_size(),
            resize_shape: default_resize_shape(),
            concentrate_crop: true,
            grapheme_size: default_grapheme_size(),
            vowel_size: default_vowel_size(),
            consonant_size: default_consonant_size(),
            train_data_path: None,
            val_data_path: None,
            augmentation: AugmentationConfig::default(),
            batch_size: default_batch_size(),
            cpu_num: default_cpu_num(),
            to_rgb: true,
            normalize_mean: default_normalize_mean(),
            normalize_std: default_normalize_std(),
        }
    }
}

impl DatasetConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.train_data_path.as_mut(), self.val_data_path.as_mut()]
            .into_iter()
            .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default = "default_quarter_prob")]
    pub blurring_prob: f32,
    #[serde(default = "default_quarter_prob")]
    pub gauss_noise_prob: f32,
    #[serde(default = "default_always_prob")]
    pub brightness_contrast_prob: f32,
    #[serde(default = "default_always_prob")]
    pub grid_distortion_prob: f32,
    #[serde(default = "default_always_prob")]
    pub rotation_prob: f32,
    #[serde(default = "default_rotation_degree")]
    pub rotation_degree: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            blurring_prob: default_quarter_prob(),
            gauss_noise_prob: default_quarter_prob(),
            brightness_contrast_prob: default_always_prob(),
            grid_distortion_prob: default_always_prob(),
            rotation_prob: default_always_prob(),
            rotation_degree: default_rotation_degree(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_meta_architecture")]
    pub meta_architecture: String,
    #[serde(default = "default_normalization_fn")]
    pub normalization_fn: String,
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub head: HeadConfig,
    #[serde(default)]
    pub solver: SolverConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            meta_architecture: default_meta_architecture(),
            normalization_fn: default_normalization_fn(),
            backbone: BackboneConfig::default(),
            head: HeadConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl ModelConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.backbone.pretrained_path.as_mut(),
            self.solver.labels_weights_path.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    #[serde(default = "default_backbone_name")]
    pub name: String,
    #[serde(default)]
    pub pretrained_path: Option<PathBuf>,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            name: default_backbone_name(),
            pretrained_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadConfig {
    #[serde(default = "default_head_name")]
    pub name: String,
    #[serde(default = "default_activation")]
    pub activation: String,
    #[serde(default = "default_output_dims")]
    pub output_dims: [usize; 3],
    #[serde(default = "default_head_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,
    #[serde(default = "default_true")]
    pub bn: bool,
    /// Negative disables dropout.
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            name: default_head_name(),
            activation: default_activation(),
            output_dims: default_output_dims(),
            input_dim: default_head_input_dim(),
            hidden_dims: default_hidden_dims(),
            bn: true,
            dropout: default_dropout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_optimizer")]
    pub optimizer: String,
    #[serde(default = "default_base_lr")]
    pub base_lr: f32,
    #[serde(default = "default_loss_fn")]
    pub loss_fn: String,
    #[serde(default = "default_total_epochs")]
    pub total_epochs: usize,
    #[serde(default)]
    pub labels_weights_path: Option<PathBuf>,
    #[serde(default)]
    pub loss: LossConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            optimizer: default_optimizer(),
            base_lr: default_base_lr(),
            loss_fn: default_loss_fn(),
            total_epochs: default_total_epochs(),
            labels_weights_path: None,
            loss: LossConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Fraction of the hardest samples kept per batch; `1.0` keeps all.
    #[serde(default = "default_ohem_rate")]
    pub ohem_rate: f32,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            ohem_rate: default_ohem_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush_every_n")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_dataset_name() -> String {
    "bengali_kaggle".to_string()
}

fn default_image_size() -> [usize; 2] {
    [137, 236]
}

fn default_resize_shape() -> [usize; 2] {
    [128, 128]
}

fn default_grapheme_size() -> usize {
    168
}

fn default_vowel_size() -> usize {
    11
}

fn default_consonant_size() -> usize {
    7
}

fn default_batch_size() -> usize {
    32
}

fn default_cpu_num() -> usize {
    4
}

fn default_normalize_mean() -> Vec<f32> {
    vec![0.485, 0.456, 0.406]
}

fn default_normalize_std() -> Vec<f32> {
    vec![0.229, 0.224, 0.225]
}

fn default_quarter_prob() -> f32 {
    0.25
}

fn default_always_prob() -> f32 {
    1.0
}

fn default_rotation_degree() -> f32 {
    20.0
}

fn default_meta_architecture() -> String {
    "baseline".to_string()
}

fn default_normalization_fn() -> String {
    "BN".to_string()
}

fn default_backbone_name() -> String {
    "mobilenet_v2".to_string()
}

fn default_head_name() -> String {
    "simple_head".to_string()
}

fn default_activation() -> String {
    "leaky_relu".to_string()
}

fn default_output_dims() -> [usize; 3] {
    [
        default_grapheme_size(),
        default_vowel_size(),
        default_consonant_size(),
    ]
}

fn default_head_input_dim() -> usize {
    1280
}

fn default_hidden_dims() -> Vec<usize> {
    vec![512, 256]
}

fn default_dropout() -> f32 {
    -1.0
}

fn default_optimizer() -> String {
    "adam".to_string()
}

fn default_base_lr() -> f32 {
    1e-3
}

fn default_loss_fn() -> String {
    "xentropy".to_string()
}

fn default_total_epochs() -> usize {
    20
}

fn default_ohem_rate() -> f32 {
    1.0
}

fn default_tensorboard_flush_every_n() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.class_counts(),
            HeadClassCounts {
                grapheme: 168,
                vowel: 11,
                consonant: 7
            }
        );
        assert_eq!(config.model.solver.loss.ohem_rate, 1.0);
    }

    #[test]
    fn collects_every_problem() {
        let mut config = ExperimentConfig::default();
        config.model.solver.loss.ohem_rate = 0.0;
        config.dataset.vowel_size = 0;
        config.dataset.augmentation.rotation_prob = 1.5;

        match config.validate() {
            Err(EvalError::InvalidConfig(errors)) => {
                assert!(errors.iter().any(|e| e.contains("ohem_rate")));
                assert!(errors.iter().any(|e| e.contains("dataset.vowel_size")));
                assert!(errors.iter().any(|e| e.contains("output_dims")));
                assert!(errors.iter().any(|e| e.contains("rotation_prob")));
            }
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }
}
