use std::path::{Path, PathBuf};

use mini_spool_storage::{BatchSize, PerformancePreset, PresetOverride, TrackingConsent, UploadFrequency};
use mini_spool_upload::PayloadFormat;
use serde::Deserialize;

/// Top-level `run` configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpoolConfig {
    /// Storage root; one subdirectory per feature.
    pub root: PathBuf,
    /// Where the directory intake drops delivered payloads.
    pub outbox_dir: PathBuf,
    #[serde(default)]
    pub batch_size: BatchSize,
    #[serde(default)]
    pub upload_frequency: UploadFrequency,
    #[serde(default)]
    pub overrides: PresetOverride,
    /// Consent at startup. `pending` collects without uploading.
    #[serde(default)]
    pub tracking_consent: TrackingConsent,
    pub features: Vec<FeatureConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    pub name: String,
    #[serde(default)]
    pub format: FormatName,
    /// Applied on top of the top-level overrides.
    #[serde(default)]
    pub overrides: Option<PresetOverride>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatName {
    #[default]
    JsonArray,
    NewlineDelimited,
}

impl FormatName {
    pub fn payload_format(self) -> PayloadFormat {
        match self {
            FormatName::JsonArray => PayloadFormat::json_array(),
            FormatName::NewlineDelimited => PayloadFormat::newline_delimited(),
        }
    }
}

impl SpoolConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SpoolConfig = toml::from_str(&content)?;
        if config.features.is_empty() {
            anyhow::bail!("{} declares no features", path.display());
        }
        Ok(config)
    }

    /// Core preset: presets chosen by name, then the top-level overrides.
    pub fn preset(&self) -> PerformancePreset {
        PerformancePreset::new(self.batch_size, self.upload_frequency).updated(&self.overrides)
    }

    /// Preset for one feature, if it overrides anything.
    pub fn feature_preset(&self, feature: &FeatureConfig) -> Option<PerformancePreset> {
        feature
            .overrides
            .as_ref()
            .map(|overrides| self.preset().updated(overrides))
    }
}
