pub mod context;
pub mod delay;
pub mod payload;
pub mod worker;

pub use context::{FeatureHandle, FeatureSpec, SpoolCore};
pub use delay::UploadDelay;
pub use payload::PayloadFormat;
pub use worker::{CycleOutcome, CycleReport, DataUploadWorker, UploadLoop};
