use std::time::Duration;

use mini_spool_common::SpoolError;
use mini_spool_segment::{ReadableConditions, WritableConditions};
use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// How much data goes into one segment, expressed as the mean time a
/// segment stays open for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl BatchSize {
    fn mean_file_age(self) -> Duration {
        match self {
            BatchSize::Small => Duration::from_secs(3),
            BatchSize::Medium => Duration::from_secs(10),
            BatchSize::Large => Duration::from_secs(35),
        }
    }
}

/// How eagerly the worker polls for batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFrequency {
    Frequent,
    #[default]
    Average,
    Rare,
}

impl UploadFrequency {
    fn min_upload_delay(self) -> Duration {
        match self {
            UploadFrequency::Frequent => Duration::from_millis(500),
            UploadFrequency::Average => Duration::from_secs(2),
            UploadFrequency::Rare => Duration::from_secs(5),
        }
    }
}

/// Storage and upload policy for one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformancePreset {
    // Storage
    pub max_file_size: u64,
    pub max_directory_size: u64,
    pub max_file_age_for_write: Duration,
    pub min_file_age_for_read: Duration,
    pub max_file_age_for_read: Duration,
    pub max_objects_in_file: u64,
    pub max_object_size: u64,

    // Writer
    /// Pending events held in memory before the oldest is dropped.
    pub write_queue_capacity: usize,

    // Upload
    pub initial_upload_delay: Duration,
    pub min_upload_delay: Duration,
    pub max_upload_delay: Duration,
    /// Fraction by which the delay shrinks on success, in `(0, 1)`.
    pub upload_delay_change_rate: f64,
    /// Batches uploaded back-to-back in one cycle while uploads succeed.
    pub max_batches_per_upload: usize,
    /// Longest a single upload may take before it is treated as a network
    /// error and retried.
    pub upload_timeout: Duration,
}

impl PerformancePreset {
    pub fn new(batch_size: BatchSize, upload_frequency: UploadFrequency) -> Self {
        let mean_file_age = batch_size.mean_file_age();
        let min_upload_delay = upload_frequency.min_upload_delay();

        Self {
            max_file_size: 4 * MIB,
            max_directory_size: 512 * MIB,
            max_file_age_for_write: mean_file_age.mul_f64(0.95),
            min_file_age_for_read: mean_file_age.mul_f64(1.05),
            max_file_age_for_read: Duration::from_secs(18 * 60 * 60),
            max_objects_in_file: 500,
            max_object_size: 512 * KIB,
            write_queue_capacity: 1_024,
            initial_upload_delay: min_upload_delay * 5,
            min_upload_delay,
            max_upload_delay: min_upload_delay * 10,
            upload_delay_change_rate: 0.1,
            max_batches_per_upload: 1,
            upload_timeout: Duration::from_secs(30),
        }
    }

    pub fn writable_conditions(&self) -> WritableConditions {
        WritableConditions {
            max_file_size: self.max_file_size,
            max_directory_size: self.max_directory_size,
            max_file_age_for_write: self.max_file_age_for_write,
            max_objects_in_file: self.max_objects_in_file,
        }
    }

    pub fn readable_conditions(&self) -> ReadableConditions {
        ReadableConditions {
            min_file_age_for_read: self.min_file_age_for_read,
            max_file_age_for_read: self.max_file_age_for_read,
        }
    }

    /// Copy of `self` with every field present in `overrides` replaced.
    pub fn updated(&self, overrides: &PresetOverride) -> Self {
        let secs = Duration::from_secs_f64;
        let mut preset = self.clone();
        if let Some(v) = overrides.max_file_size {
            preset.max_file_size = v;
        }
        if let Some(v) = overrides.max_directory_size {
            preset.max_directory_size = v;
        }
        if let Some(v) = overrides.max_file_age_for_write_secs {
            preset.max_file_age_for_write = secs(v);
        }
        if let Some(v) = overrides.min_file_age_for_read_secs {
            preset.min_file_age_for_read = secs(v);
        }
        if let Some(v) = overrides.max_file_age_for_read_secs {
            preset.max_file_age_for_read = secs(v);
        }
        if let Some(v) = overrides.max_objects_in_file {
            preset.max_objects_in_file = v;
        }
        if let Some(v) = overrides.max_object_size {
            preset.max_object_size = v;
        }
        if let Some(v) = overrides.write_queue_capacity {
            preset.write_queue_capacity = v;
        }
        if let Some(v) = overrides.initial_upload_delay_secs {
            preset.initial_upload_delay = secs(v);
        }
        if let Some(v) = overrides.min_upload_delay_secs {
            preset.min_upload_delay = secs(v);
        }
        if let Some(v) = overrides.max_upload_delay_secs {
            preset.max_upload_delay = secs(v);
        }
        if let Some(v) = overrides.upload_delay_change_rate {
            preset.upload_delay_change_rate = v;
        }
        if let Some(v) = overrides.max_batches_per_upload {
            preset.max_batches_per_upload = v;
        }
        if let Some(v) = overrides.upload_timeout_secs {
            preset.upload_timeout = secs(v);
        }
        preset
    }

    /// Reject settings under which the pipeline cannot keep its guarantees.
    ///
    /// The record cap must fit a segment and a segment must fit the
    /// directory, so the three size limits are checked in that order.
    pub fn validate(&self) -> Result<(), SpoolError> {
        let invalid = |msg: String| Err(SpoolError::InvalidConfig(msg));

        if self.max_object_size == 0 {
            return invalid("max_object_size must be positive".into());
        }
        if self.max_object_size > self.max_file_size {
            return invalid(format!(
                "max_object_size ({}) exceeds max_file_size ({})",
                self.max_object_size, self.max_file_size
            ));
        }
        if self.max_file_size > self.max_directory_size {
            return invalid(format!(
                "max_file_size ({}) exceeds max_directory_size ({})",
                self.max_file_size, self.max_directory_size
            ));
        }
        if self.max_objects_in_file == 0 {
            return invalid("max_objects_in_file must be positive".into());
        }
        if self.min_file_age_for_read <= self.max_file_age_for_write {
            return invalid(format!(
                "min_file_age_for_read ({:?}) must exceed max_file_age_for_write ({:?})",
                self.min_file_age_for_read, self.max_file_age_for_write
            ));
        }
        if self.max_file_age_for_read < self.min_file_age_for_read {
            return invalid(format!(
                "max_file_age_for_read ({:?}) is below min_file_age_for_read ({:?})",
                self.max_file_age_for_read, self.min_file_age_for_read
            ));
        }
        if self.write_queue_capacity == 0 {
            return invalid("write_queue_capacity must be positive".into());
        }
        if self.min_upload_delay > self.initial_upload_delay
            || self.initial_upload_delay > self.max_upload_delay
        {
            return invalid(format!(
                "upload delays must satisfy min ({:?}) <= initial ({:?}) <= max ({:?})",
                self.min_upload_delay, self.initial_upload_delay, self.max_upload_delay
            ));
        }
        if !(self.upload_delay_change_rate > 0.0 && self.upload_delay_change_rate < 1.0) {
            return invalid(format!(
                "upload_delay_change_rate ({}) must be within (0, 1)",
                self.upload_delay_change_rate
            ));
        }
        if self.max_batches_per_upload == 0 {
            return invalid("max_batches_per_upload must be positive".into());
        }
        if self.upload_timeout.is_zero() {
            return invalid("upload_timeout must be positive".into());
        }
        Ok(())
    }
}

impl Default for PerformancePreset {
    fn default() -> Self {
        Self::new(BatchSize::default(), UploadFrequency::default())
    }
}

/// Optional per-field replacements for a [`PerformancePreset`], as read
/// from configuration. Durations are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresetOverride {
    pub max_file_size: Option<u64>,
    pub max_directory_size: Option<u64>,
    pub max_file_age_for_write_secs: Option<f64>,
    pub min_file_age_for_read_secs: Option<f64>,
    pub max_file_age_for_read_secs: Option<f64>,
    pub max_objects_in_file: Option<u64>,
    pub max_object_size: Option<u64>,
    pub write_queue_capacity: Option<usize>,
    pub initial_upload_delay_secs: Option<f64>,
    pub min_upload_delay_secs: Option<f64>,
    pub max_upload_delay_secs: Option<f64>,
    pub upload_delay_change_rate: Option<f64>,
    pub max_batches_per_upload: Option<usize>,
    pub upload_timeout_secs: Option<f64>,
}
