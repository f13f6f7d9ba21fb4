use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod clock;
pub mod metrics;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use metrics::{MetricsSummary, PipelineMetrics};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record of {size} bytes exceeds the maximum of {max} bytes")]
    RecordTooLarge { size: u64, max: u64 },

    #[error("segment {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("writer is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Why a delivery attempt did not end in a clean 2xx.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("intake rejected the API key (401)")]
    Unauthorized,

    #[error("intake answered with status code {status}")]
    HttpError { status: u16 },

    #[error("network error: {0}")]
    Network(String),
}

// ---------------------------------------------------------------------------
// Deletion reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionReason {
    /// Intake accepted the batch.
    Delivered { status: u16 },
    /// Intake refused the batch and a retry cannot succeed.
    Rejected { status: Option<u16> },
    /// Older than the maximum age for read; purged without upload.
    Obsolete,
    /// Removed to bring the directory back under its size budget.
    Purged,
    /// Content could not be decoded or the upload could not be initiated.
    Invalid,
    /// Removed by an explicit flush.
    Flushed,
    /// Collected while consent was pending and never authorized.
    Unauthorized,
}

impl DeletionReason {
    /// Short label used as a metrics key.
    pub fn label(&self) -> &'static str {
        match self {
            DeletionReason::Delivered { .. } => "delivered",
            DeletionReason::Rejected { .. } => "rejected",
            DeletionReason::Obsolete => "obsolete",
            DeletionReason::Purged => "purged",
            DeletionReason::Invalid => "invalid",
            DeletionReason::Flushed => "flushed",
            DeletionReason::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionReason::Delivered { status } => write!(f, "delivered ({status})"),
            DeletionReason::Rejected { status: Some(status) } => write!(f, "rejected ({status})"),
            DeletionReason::Rejected { status: None } => write!(f, "rejected"),
            other => f.write_str(other.label()),
        }
    }
}

// ---------------------------------------------------------------------------
// Upload status
// ---------------------------------------------------------------------------

/// Terminal classification of an [`UploadStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Accepted; delete the batch.
    Delivered,
    /// Keep the batch, try again on a later cycle.
    Retry,
    /// Refused for good; delete the batch anyway.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub needs_retry: bool,
    pub response_code: Option<u16>,
    pub error: Option<UploadError>,
    pub request_id: Option<String>,
    /// 1-based attempt number for the batch this status belongs to.
    pub attempt: u32,
}

impl UploadStatus {
    /// Classify an HTTP response.
    ///
    /// 408, 429 and all 5xx are retried. 2xx is delivered. Every other status
    /// is terminal, including unexpected 1xx/3xx codes.
    pub fn from_response(status: u16, request_id: Option<String>) -> Self {
        let needs_retry = matches!(status, 408 | 429 | 500..=599);
        let error = match status {
            200..=299 => None,
            401 => Some(UploadError::Unauthorized),
            _ => Some(UploadError::HttpError { status }),
        };
        Self {
            needs_retry,
            response_code: Some(status),
            error,
            request_id,
            attempt: 1,
        }
    }

    /// The request never produced a response (offline, DNS, timeout).
    pub fn from_network_error(message: impl Into<String>) -> Self {
        Self {
            needs_retry: true,
            response_code: None,
            error: Some(UploadError::Network(message.into())),
            request_id: None,
            attempt: 1,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn outcome(&self) -> UploadOutcome {
        if self.needs_retry {
            UploadOutcome::Retry
        } else if matches!(self.response_code, Some(200..=299)) {
            UploadOutcome::Delivered
        } else {
            UploadOutcome::Rejected
        }
    }

    /// One-line description, e.g. `[response code: 202 (accepted), request ID: abc]`.
    pub fn user_debug_description(&self) -> String {
        match (self.response_code, &self.error) {
            (Some(code), _) => format!(
                "[response code: {code} ({}), request ID: {}]",
                status_reason(code),
                self.request_id.as_deref().unwrap_or("(???)")
            ),
            (None, Some(UploadError::Network(message))) => format!("[error: {message}]"),
            (None, Some(error)) => format!("[error: {error}]"),
            (None, None) => "[no response]".to_string(),
        }
    }
}

fn status_reason(code: u16) -> &'static str {
    match code {
        200 => "ok",
        202 => "accepted",
        400 => "badRequest",
        401 => "unauthorized",
        403 => "forbidden",
        408 => "requestTimeout",
        413 => "payloadTooLarge",
        429 => "tooManyRequests",
        500 => "internalServerError",
        502 => "badGateway",
        503 => "serviceUnavailable",
        504 => "gatewayTimeout",
        _ => "unexpected",
    }
}

// ---------------------------------------------------------------------------
// DataUploader trait (pipeline ↔ transport boundary)
// ---------------------------------------------------------------------------

/// Per-attempt metadata handed to the transport.
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub feature: String,
    /// Unique per attempt; sent as the request id header by HTTP transports.
    pub request_id: String,
    pub attempt: u32,
    /// Number of records joined into the payload.
    pub events: usize,
    pub batch_age: Duration,
}

#[async_trait]
pub trait DataUploader: Send + Sync {
    /// Deliver one batch payload to the intake.
    ///
    /// `Err` means the request could not even be built; the batch is then
    /// dropped, since building it again will fail the same way.
    async fn upload(&self, payload: &[u8], context: &UploadContext) -> Result<UploadStatus, SpoolError>;
}

// ---------------------------------------------------------------------------
// Upload conditions (connectivity, power)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Blocker {
    Battery { level: f32, charging: bool },
    LowPowerMode,
    NetworkReachability { description: String },
}

impl fmt::Display for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blocker::Battery { level, charging } => write!(
                f,
                "battery at {:.0}% ({})",
                level * 100.0,
                if *charging { "charging" } else { "unplugged" }
            ),
            Blocker::LowPowerMode => f.write_str("low power mode enabled"),
            Blocker::NetworkReachability { description } => {
                write!(f, "network reachability: {description}")
            }
        }
    }
}

pub trait UploadConditions: Send + Sync {
    /// Reasons preventing an upload right now. Empty means go.
    fn blockers(&self) -> Vec<Blocker>;

    fn can_upload_now(&self) -> bool {
        self.blockers().is_empty()
    }
}

/// Never blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysUpload;

impl UploadConditions for AlwaysUpload {
    fn blockers(&self) -> Vec<Blocker> {
        Vec::new()
    }
}

/// Conditions toggled by the host, e.g. from a reachability callback.
#[derive(Debug)]
pub struct SwitchableConditions {
    online: AtomicBool,
}

impl SwitchableConditions {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for SwitchableConditions {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UploadConditions for SwitchableConditions {
    fn blockers(&self) -> Vec<Blocker> {
        if self.online.load(Ordering::SeqCst) {
            Vec::new()
        } else {
            vec![Blocker::NetworkReachability {
                description: "offline".to_string(),
            }]
        }
    }
}
